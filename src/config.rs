use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

/// Service configuration. Every field has a production default so the
/// binary runs with no config file at all; a `config.toml` (or the file
/// named by `--config`) overrides individual fields.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// DR list endpoint returning `{rows: [...]}`.
    pub dr_list_url: String,
    /// Technical-ratings scanner base URL.
    pub tv_base: String,
    pub db_file: String,
    pub listen_addr: String,
    pub log_filter: String,

    /// Fan-out budget for the live updater's per-ticker fetches.
    pub max_concurrency: usize,
    pub request_timeout_secs: u64,
    pub update_interval_secs: u64,
    pub batch_sleep_secs: u64,
    /// Accuracy lookback window.
    pub window_days: i64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            dr_list_url: "http://172.17.1.85:8333/dr".to_string(),
            tv_base: "https://scanner.tradingview.com/symbol".to_string(),
            db_file: "ratings.sqlite".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
            log_filter: "info".to_string(),
            max_concurrency: 4,
            request_timeout_secs: 15,
            update_interval_secs: 180,
            batch_sleep_secs: 1,
            window_days: 90,
        }
    }
}

impl Config {
    /// Load from `path`, or fall back to defaults when the file does not
    /// exist. A present-but-broken file is an error, not a silent default.
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content =
            std::fs::read_to_string(path).with_context(|| format!("Couldn't read {path:?}"))?;
        let config =
            toml::from_str(&content).with_context(|| format!("Couldn't parse config {path:?}"))?;
        Ok(config)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn defaults_match_production_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.max_concurrency, 4);
        assert_eq!(cfg.request_timeout_secs, 15);
        assert_eq!(cfg.update_interval_secs, 180);
        assert_eq!(cfg.batch_sleep_secs, 1);
        assert_eq!(cfg.window_days, 90);
        assert_eq!(cfg.db_file, "ratings.sqlite");
    }

    #[test]
    fn partial_toml_overrides_only_named_fields() {
        let cfg: Config =
            toml::from_str("db_file = \"test.sqlite\"\nmax_concurrency = 2\n").unwrap();
        assert_eq!(cfg.db_file, "test.sqlite");
        assert_eq!(cfg.max_concurrency, 2);
        assert_eq!(cfg.update_interval_secs, 180);
    }
}
