use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::engine::EngineConfig;
use crate::limits::MAX_IDEMPOTENCY_TTL_SECS;

/// Runtime settings read from `ARTISCHED_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub idempotency_ttl_secs: u64,
    pub require_open_hours: bool,
    pub metrics_port: Option<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            compact_threshold: 1000,
            idempotency_ttl_secs: 24 * 60 * 60,
            require_open_hours: true,
            metrics_port: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub var: &'static str,
    pub value: String,
    pub reason: String,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}={:?}: {}", self.var, self.value, self.reason)
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; missing variables take defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let max_connections: usize = parse_var(&lookup, "ARTISCHED_MAX_CONNECTIONS")?
            .unwrap_or(defaults.max_connections);
        if max_connections == 0 {
            return Err(ConfigError {
                var: "ARTISCHED_MAX_CONNECTIONS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        let idempotency_ttl_secs: u64 = parse_var(&lookup, "ARTISCHED_IDEMPOTENCY_TTL_SECS")?
            .unwrap_or(defaults.idempotency_ttl_secs);
        if idempotency_ttl_secs == 0 {
            return Err(ConfigError {
                var: "ARTISCHED_IDEMPOTENCY_TTL_SECS",
                value: "0".into(),
                reason: "must be at least 1".into(),
            });
        }
        if idempotency_ttl_secs > MAX_IDEMPOTENCY_TTL_SECS {
            return Err(ConfigError {
                var: "ARTISCHED_IDEMPOTENCY_TTL_SECS",
                value: idempotency_ttl_secs.to_string(),
                reason: format!("must be at most {MAX_IDEMPOTENCY_TTL_SECS}"),
            });
        }

        Ok(Self {
            bind: lookup("ARTISCHED_BIND").unwrap_or(defaults.bind),
            port: parse_var(&lookup, "ARTISCHED_PORT")?.unwrap_or(defaults.port),
            data_dir: lookup("ARTISCHED_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_connections,
            compact_threshold: parse_var(&lookup, "ARTISCHED_COMPACT_THRESHOLD")?
                .unwrap_or(defaults.compact_threshold),
            idempotency_ttl_secs,
            require_open_hours: parse_bool(&lookup, "ARTISCHED_REQUIRE_OPEN_HOURS")?
                .unwrap_or(defaults.require_open_hours),
            metrics_port: parse_var(&lookup, "ARTISCHED_METRICS_PORT")?,
        })
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("artisched.wal")
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            require_open_hours: self.require_open_hours,
            idempotency_ttl_ms: (self.idempotency_ttl_secs as i64).saturating_mul(1000),
        }
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    match value.trim().parse::<T>() {
        Ok(parsed) => Ok(Some(parsed)),
        Err(e) => Err(ConfigError {
            var,
            reason: e.to_string(),
            value,
        }),
    }
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<bool>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError {
            var,
            value,
            reason: "expected true or false".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr(), "0.0.0.0:8080");
        assert_eq!(config.wal_path(), PathBuf::from("./data/artisched.wal"));
        assert!(config.require_open_hours);
        assert_eq!(config.metrics_port, None);
        assert_eq!(config.engine_config().idempotency_ttl_ms, 86_400_000);
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("ARTISCHED_PORT", "9000"),
            ("ARTISCHED_DATA_DIR", "/var/lib/artisched"),
            ("ARTISCHED_COMPACT_THRESHOLD", "50"),
            ("ARTISCHED_IDEMPOTENCY_TTL_SECS", "60"),
            ("ARTISCHED_REQUIRE_OPEN_HOURS", "off"),
            ("ARTISCHED_METRICS_PORT", "9100"),
        ]))
        .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.compact_threshold, 50);
        assert!(!config.require_open_hours);
        assert_eq!(config.metrics_port, Some(9100));
        assert_eq!(config.engine_config().idempotency_ttl_ms, 60_000);
        assert_eq!(config.wal_path(), PathBuf::from("/var/lib/artisched/artisched.wal"));
    }

    #[test]
    fn invalid_values_are_errors() {
        let err = Config::from_lookup(lookup(&[("ARTISCHED_PORT", "eighty")])).unwrap_err();
        assert_eq!(err.var, "ARTISCHED_PORT");

        let err = Config::from_lookup(lookup(&[("ARTISCHED_REQUIRE_OPEN_HOURS", "maybe")])).unwrap_err();
        assert_eq!(err.var, "ARTISCHED_REQUIRE_OPEN_HOURS");

        let err = Config::from_lookup(lookup(&[("ARTISCHED_MAX_CONNECTIONS", "0")])).unwrap_err();
        assert!(err.to_string().contains("at least 1"));

        let err = Config::from_lookup(lookup(&[(
            "ARTISCHED_IDEMPOTENCY_TTL_SECS",
            "18446744073709551615",
        )]))
        .unwrap_err();
        assert_eq!(err.var, "ARTISCHED_IDEMPOTENCY_TTL_SECS");
        assert!(err.to_string().contains("at most"));

        let longest = MAX_IDEMPOTENCY_TTL_SECS.to_string();
        let config =
            Config::from_lookup(lookup(&[("ARTISCHED_IDEMPOTENCY_TTL_SECS", longest.as_str())])).unwrap();
        assert_eq!(
            config.engine_config().idempotency_ttl_ms,
            MAX_IDEMPOTENCY_TTL_SECS as i64 * 1000
        );
    }
}
