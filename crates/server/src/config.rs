use std::collections::HashMap;
use std::env;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::fs;
use std::path::Path;

#[derive(Debug)]
pub enum ConfigError {
    Io,
    Parse,
    Missing,
    Invalid,
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "configuration io failure"),
            Self::Parse => write!(f, "configuration parse failure"),
            Self::Missing => write!(f, "configuration key missing"),
            Self::Invalid => write!(f, "configuration value invalid"),
        }
    }
}

impl Error for ConfigError {}

#[derive(Clone)]
pub struct ServerConfig {
    pub bind: String,
    pub metrics_bind: Option<String>,
    pub postgres_dsn: String,
    pub connection_keepalive: u64,
    pub storage_timeout_seconds: u64,
    pub friendship_cache_ttl_seconds: u64,
}

/// Loads relay configuration from filesystem and environment overrides.
pub fn load_configuration(path: &Path) -> Result<ServerConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|_| ConfigError::Io)?;
    let mut section = String::new();
    let mut map = HashMap::new();
    for line in contents.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        if trimmed.starts_with('[') && trimmed.ends_with(']') {
            section = trimmed
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();
            continue;
        }
        let parts: Vec<&str> = trimmed.splitn(2, '=').collect();
        if parts.len() != 2 {
            return Err(ConfigError::Parse);
        }
        let key = if section.is_empty() {
            parts[0].trim().to_string()
        } else {
            format!("{}.{}", section, parts[0].trim())
        };
        let mut value = parts[1].trim().to_string();
        if let Some(idx) = value.find('#') {
            value.truncate(idx);
            value = value.trim().to_string();
        }
        if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
            value = value[1..value.len() - 1].to_string();
        }
        map.insert(key, value);
    }

    let bind = required(override_env("DUOCHAT_BIND", map.remove("server.bind"))?)?;
    let metrics_bind = override_env("DUOCHAT_METRICS_BIND", map.remove("server.metrics_bind"))?;
    let postgres_dsn = required(override_env(
        "DUOCHAT_PG_DSN",
        map.remove("storage.postgres_dsn"),
    )?)?;
    let keepalive = override_env("DUOCHAT_KEEPALIVE", map.remove("server.keepalive"))?
        .unwrap_or_else(|| "10".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    let storage_timeout = override_env("DUOCHAT_STORAGE_TIMEOUT", map.remove("storage.timeout"))?
        .unwrap_or_else(|| "5".to_string())
        .parse::<u64>()
        .map_err(|_| ConfigError::Invalid)?;
    let friendship_cache_ttl = override_env(
        "DUOCHAT_FRIEND_CACHE_TTL",
        map.remove("limits.friendship_cache_ttl"),
    )?
    .unwrap_or_else(|| "30".to_string())
    .parse::<u64>()
    .map_err(|_| ConfigError::Invalid)?;
    if keepalive == 0 || storage_timeout == 0 {
        return Err(ConfigError::Invalid);
    }

    Ok(ServerConfig {
        bind,
        metrics_bind,
        postgres_dsn,
        connection_keepalive: keepalive,
        storage_timeout_seconds: storage_timeout,
        friendship_cache_ttl_seconds: friendship_cache_ttl,
    })
}

fn override_env(key: &str, current: Option<String>) -> Result<Option<String>, ConfigError> {
    match env::var(key) {
        Ok(value) => Ok(Some(value)),
        Err(env::VarError::NotPresent) => Ok(current),
        Err(_) => Err(ConfigError::Invalid),
    }
}

fn required(value: Option<String>) -> Result<String, ConfigError> {
    value.ok_or(ConfigError::Missing)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::PathBuf;

    #[test]
    fn parse_configuration_minimal() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("duochat_test_config.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"127.0.0.1:3005\"\n[storage]\npostgres_dsn=\"postgres://localhost/duochat\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.bind, "127.0.0.1:3005");
        assert_eq!(config.connection_keepalive, 10);
        assert_eq!(config.storage_timeout_seconds, 5);
        assert_eq!(config.friendship_cache_ttl_seconds, 30);
        assert!(config.metrics_bind.is_none());
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_with_overridden_limits() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("duochat_test_config_limits.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"0.0.0.0:3005\"\nmetrics_bind=\"127.0.0.1:9100\"\nkeepalive=\"25\" # seconds\n[storage]\npostgres_dsn=\"postgres://localhost/duochat\"\ntimeout=\"2\"\n[limits]\nfriendship_cache_ttl=\"120\"\n",
        )
        .unwrap();
        let config = load_configuration(&path).unwrap();
        assert_eq!(config.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
        assert_eq!(config.connection_keepalive, 25);
        assert_eq!(config.storage_timeout_seconds, 2);
        assert_eq!(config.friendship_cache_ttl_seconds, 120);
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn parse_configuration_rejects_zero_keepalive() {
        let mut path = PathBuf::from(env::temp_dir());
        path.push("duochat_test_config_zero.toml");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(
            b"[server]\nbind=\"0.0.0.0:3005\"\nkeepalive=\"0\"\n[storage]\npostgres_dsn=\"postgres://localhost/duochat\"\n",
        )
        .unwrap();
        assert!(matches!(
            load_configuration(&path),
            Err(ConfigError::Invalid)
        ));
        fs::remove_file(path).unwrap();
    }
}
