use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Runtime settings, read from `SLOTGUARD_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    /// When set, clients must `hello` with this token before any other request.
    pub token: Option<String>,
    pub max_connections: usize,
    /// WAL appends after which the sweeper compacts the local ledger.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub section_timeout: Duration,
    pub sweep_interval: Duration,
    pub database_url: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 5480,
            bind: "0.0.0.0".into(),
            data_dir: PathBuf::from("./data"),
            token: None,
            max_connections: 256,
            compact_threshold: 1000,
            metrics_port: None,
            section_timeout: Duration::from_millis(5000),
            sweep_interval: Duration::from_secs(30),
            database_url: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unparseable values fall back to the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = Self::default();
        let get = |name: &str| lookup(&format!("SLOTGUARD_{name}")).filter(|v| !v.is_empty());
        Self {
            port: parse_or(get("PORT"), d.port),
            bind: get("BIND").unwrap_or(d.bind),
            data_dir: get("DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir),
            token: get("TOKEN"),
            max_connections: parse_or(get("MAX_CONNECTIONS"), d.max_connections).max(1),
            compact_threshold: parse_or(get("COMPACT_THRESHOLD"), d.compact_threshold),
            metrics_port: get("METRICS_PORT").and_then(|s| s.parse().ok()),
            section_timeout: get("SECTION_TIMEOUT_MS")
                .and_then(|s| s.parse().ok())
                .map_or(d.section_timeout, Duration::from_millis),
            sweep_interval: get("SWEEP_INTERVAL_SECS")
                .and_then(|s| s.parse::<u64>().ok())
                .filter(|&s| s > 0)
                .map_or(d.sweep_interval, Duration::from_secs),
            database_url: get("DATABASE_URL"),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.data_dir.join("ledger.wal")
    }
}

fn parse_or<T: FromStr>(value: Option<String>, default: T) -> T {
    value.and_then(|s| s.parse().ok()).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let c = config(&[]);
        assert_eq!(c.listen_addr(), "0.0.0.0:5480");
        assert_eq!(c.ledger_path(), PathBuf::from("./data/ledger.wal"));
        assert_eq!(c.token, None);
        assert_eq!(c.max_connections, 256);
        assert_eq!(c.section_timeout, Duration::from_secs(5));
        assert_eq!(c.sweep_interval, Duration::from_secs(30));
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("SLOTGUARD_PORT", "6000"),
            ("SLOTGUARD_BIND", "127.0.0.1"),
            ("SLOTGUARD_TOKEN", "s3cret"),
            ("SLOTGUARD_SECTION_TIMEOUT_MS", "250"),
            ("SLOTGUARD_METRICS_PORT", "9100"),
            ("SLOTGUARD_DATA_DIR", "/var/lib/slotguard"),
        ]);
        assert_eq!(c.listen_addr(), "127.0.0.1:6000");
        assert_eq!(c.token.as_deref(), Some("s3cret"));
        assert_eq!(c.section_timeout, Duration::from_millis(250));
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.ledger_path(), PathBuf::from("/var/lib/slotguard/ledger.wal"));
    }

    #[test]
    fn garbage_falls_back() {
        let c = config(&[
            ("SLOTGUARD_PORT", "http"),
            ("SLOTGUARD_MAX_CONNECTIONS", "0"),
            ("SLOTGUARD_SWEEP_INTERVAL_SECS", "0"),
            ("SLOTGUARD_TOKEN", ""),
        ]);
        assert_eq!(c.port, 5480);
        assert_eq!(c.max_connections, 1);
        assert_eq!(c.sweep_interval, Duration::from_secs(30));
        assert_eq!(c.token, None);
    }
}
