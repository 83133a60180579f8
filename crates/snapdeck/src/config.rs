use anyhow::Context;
use protocol::config::PipeConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use system_utils::path::expand_tilde;

const DEFAULT_PROFILE_DIR: &str = "data";
const DEFAULT_CACHE_TIMEOUT_SECS: u64 = 60;
const DEFAULT_HISTORY_LIMIT: usize = 1000;
const DEFAULT_MAX_FIND_LINES: usize = 1000;
const DEFAULT_KILL_GRACE_MS: u64 = 2000;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct SnapdeckConfig {
    pub(crate) profile_dir: PathBuf,
    pub(crate) cache: CacheConfig,
    pub(crate) history: HistoryConfig,
    pub(crate) limits: LimitsConfig,
    pub(crate) pipes: PipeConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct CacheConfig {
    pub(crate) timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct HistoryConfig {
    pub(crate) limit: usize,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct LimitsConfig {
    pub(crate) max_find_lines: usize,
    pub(crate) kill_grace_ms: u64,
}

impl Default for SnapdeckConfig {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::from(DEFAULT_PROFILE_DIR),
            cache: CacheConfig::default(),
            history: HistoryConfig::default(),
            limits: LimitsConfig::default(),
            pipes: PipeConfig::default(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            timeout_secs: DEFAULT_CACHE_TIMEOUT_SECS,
        }
    }
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_find_lines: DEFAULT_MAX_FIND_LINES,
            kill_grace_ms: DEFAULT_KILL_GRACE_MS,
        }
    }
}

impl SnapdeckConfig {
    pub(crate) fn cache_timeout(&self) -> Duration {
        Duration::from_secs(self.cache.timeout_secs)
    }

    pub(crate) fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.limits.kill_grace_ms)
    }
}

/// Reads the TOML config; a missing file yields the defaults.
pub(crate) fn load_config(path: &Path) -> anyhow::Result<SnapdeckConfig> {
    let mut config = match std::fs::read_to_string(path) {
        Ok(raw) => toml::from_str::<SnapdeckConfig>(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(config = %path.display(), "config file missing, using defaults");
            SnapdeckConfig::default()
        }
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read config {}", path.display()))
        }
    };
    config.profile_dir = expand_tilde(&config.profile_dir);
    Ok(config)
}
