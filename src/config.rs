use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Process configuration, read from `LAPSE_*` environment variables.
/// Missing or unparseable values fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub run_interval: Duration,
    /// Appends since the last compaction before the log is rewritten.
    pub compact_threshold: u64,
    pub compact_interval: Duration,
    pub release_attempts: u32,
    pub release_backoff: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            run_interval: Duration::from_secs(300),
            compact_threshold: 1000,
            compact_interval: Duration::from_secs(60),
            release_attempts: 3,
            release_backoff: Duration::from_millis(200),
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let parsed = |key: &str| lookup(key).and_then(|s| parse::<u64>(&s));
        let d = Config::default();
        Config {
            data_dir: lookup("LAPSE_DATA_DIR")
                .filter(|s| !s.is_empty())
                .map_or(d.data_dir, PathBuf::from),
            metrics_port: lookup("LAPSE_METRICS_PORT").and_then(|s| parse(&s)),
            run_interval: parsed("LAPSE_RUN_INTERVAL_SECS")
                .filter(|&s| s > 0)
                .map_or(d.run_interval, Duration::from_secs),
            compact_threshold: parsed("LAPSE_COMPACT_THRESHOLD").unwrap_or(d.compact_threshold),
            compact_interval: parsed("LAPSE_COMPACT_INTERVAL_SECS")
                .filter(|&s| s > 0)
                .map_or(d.compact_interval, Duration::from_secs),
            release_attempts: lookup("LAPSE_RELEASE_ATTEMPTS")
                .and_then(|s| parse(&s))
                .unwrap_or(d.release_attempts),
            release_backoff: parsed("LAPSE_RELEASE_BACKOFF_MS")
                .map_or(d.release_backoff, Duration::from_millis),
        }
    }
}

fn parse<T: FromStr>(s: &str) -> Option<T> {
    s.trim().parse().ok()
}
