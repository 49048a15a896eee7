//! Key/value configuration shared by the service binaries.
//!
//! Values come from the process environment, optionally layered over a
//! `KEY=VALUE` file named by `SOKANA_CONFIG_PATH`. Parsing is split from
//! loading so configs can be built from a plain map in tests.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;

pub const CONFIG_PATH_KEY: &str = "SOKANA_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct StartupError {
    pub code: &'static str,
    pub message: String,
}

impl StartupError {
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new("ERR_INVALID_CONFIG", message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeEnv {
    Development,
    Production,
}

impl RuntimeEnv {
    pub fn is_development(self) -> bool {
        self == RuntimeEnv::Development
    }
}

pub fn load_kv() -> Result<HashMap<String, String>, StartupError> {
    let mut merged = HashMap::new();

    if let Ok(config_path) = std::env::var(CONFIG_PATH_KEY) {
        let config_path = config_path.trim();
        if !config_path.is_empty() {
            merged.extend(parse_env_file(config_path)?);
        }
    }

    merged.extend(std::env::vars());
    Ok(merged)
}

pub fn parse_env_file(path: &str) -> Result<HashMap<String, String>, StartupError> {
    let contents = std::fs::read_to_string(path).map_err(|_| {
        StartupError::new(
            "ERR_CONFIG_FILE_READ",
            format!("failed to read config file at {}", path),
        )
    })?;
    parse_env_lines(&contents)
}

fn parse_env_lines(contents: &str) -> Result<HashMap<String, String>, StartupError> {
    let mut kv = HashMap::new();

    for (idx, raw_line) in contents.lines().enumerate() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let line = line.strip_prefix("export ").unwrap_or(line);
        let (key, value) = line.split_once('=').ok_or_else(|| {
            StartupError::new(
                "ERR_CONFIG_FILE_PARSE",
                format!("invalid config line {} (expected KEY=VALUE)", idx + 1),
            )
        })?;

        let key = key.trim();
        if key.is_empty() {
            return Err(StartupError::new(
                "ERR_CONFIG_FILE_PARSE",
                format!("invalid config line {} (empty key)", idx + 1),
            ));
        }

        kv.insert(key.to_string(), unquote(value.trim()).to_string());
    }

    Ok(kv)
}

fn unquote(s: &str) -> &str {
    for quote in ['"', '\''] {
        if s.len() >= 2 && s.starts_with(quote) && s.ends_with(quote) {
            return &s[1..s.len() - 1];
        }
    }
    s
}

pub fn optional_nonempty(kv: &HashMap<String, String>, key: &str) -> Option<String> {
    kv.get(key)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
}

pub fn require_nonempty(
    kv: &HashMap<String, String>,
    key: &'static str,
) -> Result<String, StartupError> {
    optional_nonempty(kv, key).ok_or_else(|| {
        StartupError::new(
            "ERR_MISSING_CONFIG",
            format!("missing required config key {}", key),
        )
    })
}

pub fn parse_number<T: FromStr>(
    kv: &HashMap<String, String>,
    key: &'static str,
    default: T,
) -> Result<T, StartupError> {
    match optional_nonempty(kv, key) {
        None => Ok(default),
        Some(v) => v
            .parse::<T>()
            .map_err(|_| StartupError::invalid(format!("{} must be an integer", key))),
    }
}

pub fn parse_flag(
    kv: &HashMap<String, String>,
    key: &'static str,
    default: bool,
) -> Result<bool, StartupError> {
    let Some(value) = optional_nonempty(kv, key) else {
        return Ok(default);
    };

    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StartupError::invalid(format!("{} must be a boolean", key))),
    }
}

pub fn parse_socket_addr(
    kv: &HashMap<String, String>,
    key: &'static str,
    default: SocketAddr,
) -> Result<SocketAddr, StartupError> {
    match optional_nonempty(kv, key) {
        None => Ok(default),
        Some(v) => v.parse::<SocketAddr>().map_err(|_| {
            StartupError::invalid(format!("{} must be a valid host:port socket address", key))
        }),
    }
}

pub fn parse_runtime_env(kv: &HashMap<String, String>) -> Result<RuntimeEnv, StartupError> {
    let value = optional_nonempty(kv, "SOKANA_ENV").unwrap_or_else(|| "production".to_string());
    match value.to_ascii_lowercase().as_str() {
        "development" | "dev" => Ok(RuntimeEnv::Development),
        "production" | "prod" | "staging" => Ok(RuntimeEnv::Production),
        _ => Err(StartupError::invalid(
            "SOKANA_ENV must be development, staging or production",
        )),
    }
}
