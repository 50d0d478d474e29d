//! CLI configuration: an optional JSON file plus environment overrides.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use fundingsync_core::SyncConfig;
use fundingsync_http::HttpSourceConfig;

use crate::logging::{LogConfig, LogFormat};

pub const ENV_API_URL: &str = "FUNDINGSYNC_API_URL";
pub const ENV_DB: &str = "FUNDINGSYNC_DB";

const DEFAULT_DB: &str = "./fundingsync.db";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// SQLite file holding the cache.
    pub db_path: Option<String>,
    /// Byte budget for the SQLite cache; unbounded when absent.
    pub db_capacity_bytes: Option<usize>,
    pub log: LogConfig,
    pub sync: SyncConfig,
    pub http: HttpSourceConfig,
}

impl CliConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
    }

    /// Apply environment variables, then explicit flags.
    pub fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
        db_flag: Option<String>,
        url_flag: Option<String>,
        json_logs: bool,
    ) {
        if let Some(db) = env(ENV_DB) {
            self.db_path = Some(db);
        }
        if let Some(url) = env(ENV_API_URL) {
            self.http.base_url = url;
        }
        if let Some(db) = db_flag {
            self.db_path = Some(db);
        }
        if let Some(url) = url_flag {
            self.http.base_url = url;
        }
        if json_logs {
            self.log.format = LogFormat::Json;
        }
    }

    pub fn db_path(&self) -> &str {
        self.db_path.as_deref().unwrap_or(DEFAULT_DB)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_beat_environment() {
        let mut config = CliConfig::default();
        let env = |key: &str| match key {
            ENV_DB => Some("/tmp/env.db".to_string()),
            ENV_API_URL => Some("http://env".to_string()),
            _ => None,
        };
        config.apply_overrides(env, Some("/tmp/flag.db".into()), None, true);
        assert_eq!(config.db_path(), "/tmp/flag.db");
        assert_eq!(config.http.base_url, "http://env");
        assert_eq!(config.log.format, LogFormat::Json);
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: CliConfig =
            serde_json::from_str(r#"{"sync": {"month_batch_size": 6}, "log": {"level": "debug"}}"#)
                .unwrap();
        assert_eq!(config.sync.month_batch_size, 6);
        assert_eq!(config.sync.probe_months, 12);
        assert_eq!(config.log.level, "debug");
        assert_eq!(config.db_path(), DEFAULT_DB);
    }
}
