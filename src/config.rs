use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Expiry applied when a read view is written back to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheTtl {
    pub listing: Duration,
    pub detail: Duration,
    pub history: Duration,
    pub analytics: Duration,
}

impl Default for CacheTtl {
    fn default() -> Self {
        Self {
            listing: Duration::from_secs(300),
            detail: Duration::from_secs(300),
            history: Duration::from_secs(120),
            analytics: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub cache_sweep_interval: Duration,
    pub ttl: CacheTtl,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            compact_threshold: 1000,
            metrics_port: None,
            cache_sweep_interval: Duration::from_secs(30),
            ttl: CacheTtl::default(),
        }
    }
}

impl Config {
    /// Read `SEATD_*` variables. Missing or unparseable values keep their default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|s| parse::<u64>(&s));
        let secs = |key: &str, default: Duration| parsed(key).map_or(default, Duration::from_secs);

        Self {
            data_dir: lookup("SEATD_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            compact_threshold: parsed("SEATD_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            metrics_port: lookup("SEATD_METRICS_PORT").and_then(|s| parse(&s)),
            cache_sweep_interval: secs("SEATD_CACHE_SWEEP_SECS", defaults.cache_sweep_interval),
            ttl: CacheTtl {
                listing: secs("SEATD_TTL_LISTING_SECS", defaults.ttl.listing),
                detail: secs("SEATD_TTL_DETAIL_SECS", defaults.ttl.detail),
                history: secs("SEATD_TTL_HISTORY_SECS", defaults.ttl.history),
                analytics: secs("SEATD_TTL_ANALYTICS_SECS", defaults.ttl.analytics),
            },
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("seatd.wal")
    }
}

fn parse<T: FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
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
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[]));
        assert_eq!(cfg, Config::default());
        assert_eq!(cfg.wal_path(), PathBuf::from("./data/seatd.wal"));
    }

    #[test]
    fn overrides_are_read() {
        let cfg = Config::from_lookup(lookup(&[
            ("SEATD_DATA_DIR", "/var/lib/seatd"),
            ("SEATD_COMPACT_THRESHOLD", "50"),
            ("SEATD_METRICS_PORT", "9100"),
            ("SEATD_TTL_HISTORY_SECS", "5"),
        ]));
        assert_eq!(cfg.data_dir, PathBuf::from("/var/lib/seatd"));
        assert_eq!(cfg.compact_threshold, 50);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.ttl.history, Duration::from_secs(5));
        assert_eq!(cfg.ttl.listing, Duration::from_secs(300));
    }

    #[test]
    fn garbage_falls_back() {
        let cfg = Config::from_lookup(lookup(&[
            ("SEATD_COMPACT_THRESHOLD", "lots"),
            ("SEATD_METRICS_PORT", "99999"),
        ]));
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
    }
}
