use crate::error::XferResult;
use crate::ssh::HostKeyPolicy;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

const CONFIG_FILE: &str = "config.toml";

/// Settings for sessions, listings and transfers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub transfer: TransferSettings,
    #[serde(default)]
    pub ssh: SshSettings,
    #[serde(default)]
    pub cache: CacheSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    /// Transfers allowed in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    /// Queue rescan delay when nothing is pending
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Files larger than this are hash-verified after transfer
    #[serde(default = "default_verify_threshold")]
    pub verify_threshold: u64,
    #[serde(default = "default_true")]
    pub verify_integrity: bool,
}

fn default_max_concurrent() -> usize {
    3
}

fn default_poll_interval_ms() -> u64 {
    200
}

fn default_chunk_size() -> usize {
    80 * 1024
}

fn default_verify_threshold() -> u64 {
    1024 * 1024
}

fn default_true() -> bool {
    true
}

impl TransferSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            poll_interval_ms: default_poll_interval_ms(),
            chunk_size: default_chunk_size(),
            verify_threshold: default_verify_threshold(),
            verify_integrity: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshSettings {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_interval: u32,
    #[serde(default)]
    pub host_key_policy: HostKeyPolicy,
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_keepalive() -> u32 {
    30
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval: default_keepalive(),
            host_key_policy: HostKeyPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Remote directory listings kept in memory
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

fn default_cache_capacity() -> usize {
    5
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

impl Settings {
    pub fn load(config_dir: &Path) -> XferResult<Self> {
        let config_path = config_dir.join(CONFIG_FILE);
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let settings: Settings = toml::from_str(&content)?;
            Ok(settings)
        } else {
            let settings = Settings::default();
            settings.save(config_dir)?;
            Ok(settings)
        }
    }

    pub fn save(&self, config_dir: &Path) -> XferResult<()> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join(CONFIG_FILE);
        let content = toml::to_string_pretty(self)?;
        std::fs::write(config_path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let settings: Settings = toml::from_str(
            r#"
            [transfer]
            max_concurrent = 5
            "#,
        )
        .unwrap();

        assert_eq!(settings.transfer.max_concurrent, 5);
        assert_eq!(settings.transfer.chunk_size, 80 * 1024);
        assert_eq!(settings.transfer.poll_interval(), Duration::from_millis(200));
        assert_eq!(settings.cache.capacity, 5);
        assert!(matches!(settings.ssh.host_key_policy, HostKeyPolicy::AcceptAny));
    }

    #[test]
    fn load_writes_defaults_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(dir.path()).unwrap();
        assert_eq!(settings.transfer.verify_threshold, 1024 * 1024);
        assert!(dir.path().join(CONFIG_FILE).exists());

        let reloaded = Settings::load(dir.path()).unwrap();
        assert_eq!(reloaded.ssh.keepalive_interval, 30);
    }
}
