use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use sokana_contracts::env::{self, RuntimeEnv, StartupError};

#[derive(Clone)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub db_url: String,
    pub broker_url: String,
    pub broker_secret: String,
    pub broker_timeout_ms: u64,
    pub phi_store_mode: PhiStoreMode,
    pub auth_shared_secret: Option<String>,
    pub runtime_env: RuntimeEnv,
}

/// Which store is authoritative for PHI in this deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhiStoreMode {
    /// PHI lives behind the broker.
    Primary,
    /// Legacy rollout mode; PHI routes through this service are disabled.
    Shadow,
}

impl PhiStoreMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PhiStoreMode::Primary => "primary",
            PhiStoreMode::Shadow => "shadow",
        }
    }
}

impl ApiConfig {
    pub fn load() -> Result<Self, StartupError> {
        Self::from_kv(&env::load_kv()?)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let bind_addr = env::parse_socket_addr(
            kv,
            "SOKANA_API_BIND_ADDR",
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8081),
        )?;

        let auth_shared_secret = env::optional_nonempty(kv, "SOKANA_AUTH_SHARED_SECRET");
        if !bind_addr.ip().is_loopback() && auth_shared_secret.is_none() {
            return Err(StartupError::new(
                "ERR_NONLOCAL_BIND_REQUIRES_AUTH",
                "non-local bind requires SOKANA_AUTH_SHARED_SECRET; refuse startup",
            ));
        }

        let db_url = env::require_nonempty(kv, "SOKANA_DB_URL")?;
        let broker_url = env::require_nonempty(kv, "PHI_BROKER_URL")?
            .trim_end_matches('/')
            .to_string();
        if !broker_url.starts_with("http://") && !broker_url.starts_with("https://") {
            return Err(StartupError::invalid(
                "PHI_BROKER_URL must be an http(s) URL",
            ));
        }
        let broker_secret = env::require_nonempty(kv, "PHI_BROKER_SECRET")?;

        let broker_timeout_ms = env::parse_number::<u64>(kv, "PHI_BROKER_TIMEOUT_MS", 5_000)?;
        if broker_timeout_ms == 0 {
            return Err(StartupError::invalid(
                "PHI_BROKER_TIMEOUT_MS must be greater than zero",
            ));
        }

        let phi_store_mode = match env::optional_nonempty(kv, "SOKANA_PHI_STORE_MODE")
            .map(|v| v.to_ascii_lowercase())
            .as_deref()
        {
            None | Some("shadow") => PhiStoreMode::Shadow,
            Some("primary") => PhiStoreMode::Primary,
            Some(_) => {
                return Err(StartupError::invalid(
                    "SOKANA_PHI_STORE_MODE must be primary or shadow",
                ));
            }
        };

        Ok(Self {
            bind_addr,
            db_url,
            broker_url,
            broker_secret,
            broker_timeout_ms,
            phi_store_mode,
            auth_shared_secret,
            runtime_env: env::parse_runtime_env(kv)?,
        })
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_timeout_ms)
    }
}

impl std::fmt::Debug for ApiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiConfig")
            .field("bind_addr", &self.bind_addr)
            .field("db_url", &"<redacted>")
            .field("broker_url", &self.broker_url)
            .field("broker_secret", &"<redacted>")
            .field("broker_timeout_ms", &self.broker_timeout_ms)
            .field("phi_store_mode", &self.phi_store_mode)
            .field(
                "auth_shared_secret",
                &self.auth_shared_secret.as_ref().map(|_| "<redacted>"),
            )
            .field("runtime_env", &self.runtime_env)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_ok_env() -> HashMap<String, String> {
        [
            ("SOKANA_DB_URL", "postgres://app:pw@localhost/sokana"),
            ("PHI_BROKER_URL", "http://127.0.0.1:8080/"),
            ("PHI_BROKER_SECRET", "shared-broker-secret"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_apply() {
        let cfg = ApiConfig::from_kv(&minimal_ok_env()).expect("config should load");
        assert_eq!(cfg.bind_addr, "127.0.0.1:8081".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.broker_url, "http://127.0.0.1:8080");
        assert_eq!(cfg.broker_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.phi_store_mode, PhiStoreMode::Shadow);
        assert!(cfg.auth_shared_secret.is_none());
    }

    #[test]
    fn store_mode_is_parsed_case_insensitively() {
        let mut env = minimal_ok_env();
        env.insert("SOKANA_PHI_STORE_MODE".to_string(), "PRIMARY".to_string());
        let cfg = ApiConfig::from_kv(&env).expect("config should load");
        assert_eq!(cfg.phi_store_mode, PhiStoreMode::Primary);

        env.insert("SOKANA_PHI_STORE_MODE".to_string(), "dual".to_string());
        assert_eq!(ApiConfig::from_kv(&env).unwrap_err().code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn missing_broker_secret_fails() {
        let mut env = minimal_ok_env();
        env.remove("PHI_BROKER_SECRET");
        assert_eq!(ApiConfig::from_kv(&env).unwrap_err().code, "ERR_MISSING_CONFIG");
    }

    #[test]
    fn non_local_bind_requires_shared_secret() {
        let mut env = minimal_ok_env();
        env.insert("SOKANA_API_BIND_ADDR".to_string(), "0.0.0.0:8081".to_string());
        let err = ApiConfig::from_kv(&env).unwrap_err();
        assert_eq!(err.code, "ERR_NONLOCAL_BIND_REQUIRES_AUTH");

        env.insert(
            "SOKANA_AUTH_SHARED_SECRET".to_string(),
            "edge-secret".to_string(),
        );
        let cfg = ApiConfig::from_kv(&env).expect("config should load");
        assert_eq!(cfg.auth_shared_secret.as_deref(), Some("edge-secret"));
    }

    #[test]
    fn broker_url_must_be_http() {
        let mut env = minimal_ok_env();
        env.insert("PHI_BROKER_URL".to_string(), "broker:8080".to_string());
        assert_eq!(ApiConfig::from_kv(&env).unwrap_err().code, "ERR_INVALID_CONFIG");
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", ApiConfig::from_kv(&minimal_ok_env()).unwrap());
        assert!(!rendered.contains("shared-broker-secret"));
        assert!(!rendered.contains("app:pw"));
    }
}
