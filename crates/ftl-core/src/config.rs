//! Daemon configuration.
//!
//! Loaded from an optional TOML file, then overlaid with the `FTL_*`
//! environment variables. Durations are written as strings such as `"10s"`,
//! `"250ms"` or `"1m"`.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

const POSTGRES_DSN_PREFIX: &str = "FTL_POSTGRES_DSN_";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value {value:?} for {field}: {reason}")]
    Invalid {
        field: String,
        value: String,
        reason: String,
    },
}

/// Where the state store lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// URL the API listens on.
    pub bind: String,
    /// URL advertised to runners. Defaults to `bind`.
    pub advertise: Option<String>,
    /// URL the HTTP ingress listens on.
    pub ingress_bind: String,
    pub dsn: String,
    pub max_open_db_connections: u32,
    pub max_idle_db_connections: u32,
    pub otlp_endpoint: Option<String>,
    pub log_level: String,
    #[serde(with = "duration_str")]
    pub runner_timeout: Duration,
    #[serde(with = "duration_str")]
    pub controller_timeout: Duration,
    #[serde(with = "duration_str")]
    pub deployment_reservation_timeout: Duration,
    pub artefact_chunk_size: usize,
    #[serde(with = "duration_str")]
    pub context_update_period: Duration,
    #[serde(with = "duration_str")]
    pub client_cache_ttl: Duration,
    /// Longest a single verb call may take.
    #[serde(with = "duration_str")]
    pub call_timeout: Duration,
    #[serde(with = "duration_str")]
    pub event_consumption_delay: Duration,
    pub dev_mode: bool,
    /// Module database DSNs keyed by `MODULE_DB` (uppercase).
    pub databases: BTreeMap<String, String>,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            bind: "http://127.0.0.1:8892".to_string(),
            advertise: None,
            ingress_bind: "http://127.0.0.1:8891".to_string(),
            dsn: "memory://".to_string(),
            max_open_db_connections: 20,
            max_idle_db_connections: 20,
            otlp_endpoint: None,
            log_level: "info".to_string(),
            runner_timeout: Duration::from_secs(10),
            controller_timeout: Duration::from_secs(10),
            deployment_reservation_timeout: Duration::from_secs(60),
            artefact_chunk_size: 1_048_576,
            context_update_period: Duration::from_secs(1),
            client_cache_ttl: Duration::from_secs(60),
            call_timeout: Duration::from_secs(60),
            event_consumption_delay: Duration::from_millis(100),
            dev_mode: false,
            databases: BTreeMap::new(),
        }
    }
}

impl ControllerConfig {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }

    /// Load the optional file and overlay the given environment.
    pub fn load(
        path: Option<&Path>,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay recognised environment variables.
    pub fn apply_env(
        &mut self,
        env: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        for (name, value) in env {
            match name.as_str() {
                "FTL_BIND" => self.bind = value,
                "FTL_ADVERTISE" => self.advertise = Some(value),
                "FTL_INGRESS_BIND" => self.ingress_bind = value,
                "FTL_DSN" => self.dsn = value,
                "FTL_MAX_OPEN_DB_CONNECTIONS" => {
                    self.max_open_db_connections = parse_count(&name, &value)?
                }
                "FTL_MAX_IDLE_DB_CONNECTIONS" => {
                    self.max_idle_db_connections = parse_count(&name, &value)?
                }
                "OTEL_EXPORTER_OTLP_ENDPOINT" => self.otlp_endpoint = Some(value),
                "FTL_O11Y_LOG_LEVEL" => self.log_level = value,
                _ => {
                    if let Some(db) = name.strip_prefix(POSTGRES_DSN_PREFIX) {
                        self.databases.insert(db.to_string(), value);
                    }
                }
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        parse_url("bind", &self.bind)?;
        parse_url("ingress_bind", &self.ingress_bind)?;
        if let Some(advertise) = &self.advertise {
            parse_url("advertise", advertise)?;
        }
        if self.artefact_chunk_size == 0 {
            return Err(ConfigError::Invalid {
                field: "artefact_chunk_size".into(),
                value: "0".into(),
                reason: "must be positive".into(),
            });
        }
        Ok(())
    }

    /// The URL runners should use to reach this controller.
    pub fn advertise_url(&self) -> &str {
        self.advertise.as_deref().unwrap_or(&self.bind)
    }

    /// Resolve `bind` to a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve("bind", &self.bind)
    }

    /// Resolve `ingress_bind` to a socket address.
    pub fn ingress_addr(&self) -> Result<SocketAddr, ConfigError> {
        resolve("ingress_bind", &self.ingress_bind)
    }

    pub fn store_location(&self) -> StoreLocation {
        match self.dsn.as_str() {
            "" | "memory://" => StoreLocation::Memory,
            dsn => StoreLocation::File(PathBuf::from(dsn.strip_prefix("redb://").unwrap_or(dsn))),
        }
    }

    /// DSN for a module database declared as `database postgres <db>`.
    pub fn database_dsn(&self, module: &str, db: &str) -> Option<&str> {
        let key = format!("{}_{}", module.to_uppercase(), db.to_uppercase());
        self.databases.get(&key).map(String::as_str)
    }
}

fn resolve(field: &str, value: &str) -> Result<SocketAddr, ConfigError> {
    let url = parse_url(field, value)?;
    let invalid = |reason: &str| ConfigError::Invalid {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    };
    let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
    let port = url
        .port_or_known_default()
        .ok_or_else(|| invalid("missing port"))?;
    (host, port)
        .to_socket_addrs()
        .map_err(|e| invalid(&e.to_string()))?
        .next()
        .ok_or_else(|| invalid("host did not resolve"))
}

fn parse_url(field: &str, value: &str) -> Result<Url, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::Invalid {
        field: field.to_string(),
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_count(field: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse().map_err(|_| ConfigError::Invalid {
        field: field.to_string(),
        value: value.to_string(),
        reason: "expected a non-negative integer".into(),
    })
}

/// Parse a duration string like "5s", "500ms", "1m", "2h".
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else if let Some(hours) = s.strip_suffix('h') {
        hours.parse::<u64>().ok().map(|h| Duration::from_secs(h * 3600))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// Render a duration in the form accepted by [`parse_duration`].
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        format!("{ms}ms")
    } else if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else {
        format!("{}s", ms / 1000)
    }
}

/// Serde adapter for durations written as strings.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let text = String::deserialize(deserializer)?;
        super::parse_duration(&text)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid duration {text:?}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::load(None, Vec::new()).unwrap();
        assert_eq!(config.runner_timeout, Duration::from_secs(10));
        assert_eq!(config.artefact_chunk_size, 1_048_576);
        assert_eq!(config.store_location(), StoreLocation::Memory);
        assert_eq!(config.advertise_url(), "http://127.0.0.1:8892");
        assert_eq!(config.bind_addr().unwrap().port(), 8892);
        assert_eq!(config.ingress_addr().unwrap().port(), 8891);
    }

    #[test]
    fn environment_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ftl.toml");
        std::fs::write(
            &path,
            r#"
bind = "http://0.0.0.0:9000"
runner_timeout = "30s"
dsn = "redb:///var/lib/ftl/state.redb"
"#,
        )
        .unwrap();

        let config = ControllerConfig::load(
            Some(&path),
            env(&[
                ("FTL_BIND", "http://127.0.0.1:9100"),
                ("FTL_MAX_OPEN_DB_CONNECTIONS", "5"),
                ("FTL_POSTGRES_DSN_ECHO_TESTDB", "postgres://localhost/echo"),
                ("HOME", "/root"),
            ]),
        )
        .unwrap();

        assert_eq!(config.bind, "http://127.0.0.1:9100");
        assert_eq!(config.runner_timeout, Duration::from_secs(30));
        assert_eq!(config.max_open_db_connections, 5);
        assert_eq!(
            config.store_location(),
            StoreLocation::File(PathBuf::from("/var/lib/ftl/state.redb"))
        );
        assert_eq!(
            config.database_dsn("echo", "testdb"),
            Some("postgres://localhost/echo")
        );
    }

    #[test]
    fn bad_counts_are_rejected() {
        let err = ControllerConfig::load(None, env(&[("FTL_MAX_IDLE_DB_CONNECTIONS", "many")]))
            .unwrap_err();
        assert!(err.to_string().contains("FTL_MAX_IDLE_DB_CONNECTIONS"));
    }

    #[test]
    fn bad_bind_is_rejected() {
        assert!(ControllerConfig::load(None, env(&[("FTL_BIND", "not a url")])).is_err());
    }

    #[test]
    fn duration_strings() {
        assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("7"), Some(Duration::from_secs(7)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(format_duration(Duration::from_millis(100)), "100ms");
        assert_eq!(format_duration(Duration::from_secs(60)), "1m");
    }
}
