use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use sokana_contracts::env::{self, RuntimeEnv, StartupError};
use sokana_phi_store::PhiDbConfig;

#[derive(Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub broker_secret: String,
    pub db: PhiDbConfig,
    pub query_timeout_ms: u64,
    pub run_migrations: bool,
    pub runtime_env: RuntimeEnv,
}

impl BrokerConfig {
    pub fn load() -> Result<Self, StartupError> {
        Self::from_kv(&env::load_kv()?)
    }

    pub fn from_kv(kv: &HashMap<String, String>) -> Result<Self, StartupError> {
        let broker_secret = env::require_nonempty(kv, "PHI_BROKER_SECRET")?;

        let host = match env::optional_nonempty(kv, "PHI_BROKER_HOST") {
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Some(raw) => raw
                .parse::<IpAddr>()
                .map_err(|_| StartupError::invalid("PHI_BROKER_HOST must be an IP address"))?,
        };
        let port = env::parse_number::<u16>(kv, "PORT", 8080)?;

        let db = PhiDbConfig {
            host: env::require_nonempty(kv, "PHI_DB_HOST")?,
            port: env::parse_number::<u16>(kv, "PHI_DB_PORT", 5432)?,
            database: env::require_nonempty(kv, "PHI_DB_NAME")?,
            user: env::require_nonempty(kv, "PHI_DB_USER")?,
            password: env::require_nonempty(kv, "PHI_DB_PASSWORD")?,
            ssl: env::parse_flag(kv, "PHI_DB_SSL", true)?,
        };

        let query_timeout_ms = env::parse_number::<u64>(kv, "PHI_DB_QUERY_TIMEOUT_MS", 5_000)?;
        if query_timeout_ms == 0 {
            return Err(StartupError::invalid(
                "PHI_DB_QUERY_TIMEOUT_MS must be greater than zero",
            ));
        }

        Ok(Self {
            bind_addr: SocketAddr::new(host, port),
            broker_secret,
            db,
            query_timeout_ms,
            run_migrations: env::parse_flag(kv, "PHI_DB_RUN_MIGRATIONS", false)?,
            runtime_env: env::parse_runtime_env(kv)?,
        })
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("bind_addr", &self.bind_addr)
            .field("broker_secret", &"<redacted>")
            .field("db", &self.db)
            .field("query_timeout_ms", &self.query_timeout_ms)
            .field("run_migrations", &self.run_migrations)
            .field("runtime_env", &self.runtime_env)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_kv() -> HashMap<String, String> {
        [
            ("PHI_BROKER_SECRET", "s3cret-value"),
            ("PHI_DB_HOST", "phi-db.internal"),
            ("PHI_DB_NAME", "sokana_phi"),
            ("PHI_DB_USER", "phi_broker"),
            ("PHI_DB_PASSWORD", "db-password-value"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    #[test]
    fn defaults_apply() {
        let cfg = BrokerConfig::from_kv(&base_kv()).expect("config should parse");
        assert_eq!(cfg.bind_addr, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(cfg.db.port, 5432);
        assert!(cfg.db.ssl);
        assert_eq!(cfg.query_timeout(), Duration::from_secs(5));
        assert!(!cfg.run_migrations);
        assert_eq!(cfg.runtime_env, RuntimeEnv::Production);
    }

    #[test]
    fn missing_secret_refuses_startup() {
        let mut kv = base_kv();
        kv.remove("PHI_BROKER_SECRET");
        let err = BrokerConfig::from_kv(&kv).unwrap_err();
        assert_eq!(err.code, "ERR_MISSING_CONFIG");
        assert!(err.message.contains("PHI_BROKER_SECRET"));
    }

    #[test]
    fn overrides_are_parsed() {
        let mut kv = base_kv();
        kv.insert("PORT".to_string(), "9443".to_string());
        kv.insert("PHI_BROKER_HOST".to_string(), "127.0.0.1".to_string());
        kv.insert("PHI_DB_SSL".to_string(), "false".to_string());
        kv.insert("PHI_DB_QUERY_TIMEOUT_MS".to_string(), "750".to_string());
        kv.insert("PHI_DB_RUN_MIGRATIONS".to_string(), "true".to_string());
        kv.insert("SOKANA_ENV".to_string(), "development".to_string());

        let cfg = BrokerConfig::from_kv(&kv).expect("config should parse");
        assert_eq!(cfg.bind_addr, "127.0.0.1:9443".parse::<SocketAddr>().unwrap());
        assert!(!cfg.db.ssl);
        assert_eq!(cfg.query_timeout_ms, 750);
        assert!(cfg.run_migrations);
        assert!(cfg.runtime_env.is_development());
    }

    #[test]
    fn zero_query_timeout_is_rejected() {
        let mut kv = base_kv();
        kv.insert("PHI_DB_QUERY_TIMEOUT_MS".to_string(), "0".to_string());
        assert_eq!(
            BrokerConfig::from_kv(&kv).unwrap_err().code,
            "ERR_INVALID_CONFIG"
        );
    }

    #[test]
    fn debug_output_hides_secrets() {
        let rendered = format!("{:?}", BrokerConfig::from_kv(&base_kv()).unwrap());
        assert!(!rendered.contains("s3cret-value"));
        assert!(!rendered.contains("db-password-value"));
    }
}
