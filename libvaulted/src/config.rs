// Copyright 2024 Vaulted Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{
    collections::HashMap,
    fs,
    path::Path,
    sync::{Arc, RwLock},
};

use anyhow::Context;
use serde_derive::Deserialize;
use tracing::{info, instrument, warn};

use crate::{
    config_watcher::ConfigWatcher,
    consts::{DEFAULT_CHUNK_SHARD_LEVELS, DEFAULT_DRAIN_RATIO, DEFAULT_MAX_BACKUPS},
};

#[instrument(skip_all)]
pub fn read_config(config_path: &str) -> anyhow::Result<Config> {
    let config_str = fs::read_to_string(config_path).context("reading config yaml")?;
    let config: Config = serde_yaml::from_str(&config_str).context("parsing config file")?;
    config.validate()?;
    Ok(config)
}

#[derive(Deserialize, Default, Debug, Clone)]
pub struct Config {
    /// Keyed by storage name.
    #[serde(default)]
    pub storage: HashMap<String, StorageConfig>,

    #[serde(default)]
    pub chunk_buffer: ChunkBufferConfig,

    #[serde(default)]
    pub gap_detection: GapDetectionConfig,

    #[serde(default)]
    pub flow_rotation: FlowRotationConfig,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, storage) in self.storage.iter() {
            if storage.base_dir.trim().is_empty() {
                anyhow::bail!("storage {name:?} has an empty base_dir");
            }
            if let Some(levels) = storage.chunk_shard_levels {
                if levels != 1 && levels != 2 {
                    anyhow::bail!("storage {name:?} chunk_shard_levels must be 1 or 2, got {levels}");
                }
            }
        }
        if !(0.0..=1.0).contains(&self.chunk_buffer.drain_ratio.unwrap_or(DEFAULT_DRAIN_RATIO)) {
            anyhow::bail!("chunk_buffer.drain_ratio must be in [0.0, 1.0]");
        }
        Ok(())
    }

    pub fn storage(&self, name: &str) -> Option<&StorageConfig> {
        self.storage.get(name)
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct StorageConfig {
    pub base_dir: String,

    pub max_backups: Option<usize>,

    pub assembler_mode: Option<AssemblerMode>,

    pub assembler_pending_mem_limit: Option<usize>,

    pub compression_mode: Option<CompressionMode>,

    pub chunk_shard_levels: Option<u8>,

    pub chunk_fsync: Option<bool>,
}

impl StorageConfig {
    pub fn max_backups(&self) -> usize {
        self.max_backups.unwrap_or(DEFAULT_MAX_BACKUPS)
    }

    pub fn assembler_mode(&self) -> AssemblerMode {
        self.assembler_mode.unwrap_or_default()
    }

    pub fn chunk_shard_levels(&self) -> u8 {
        self.chunk_shard_levels.unwrap_or(DEFAULT_CHUNK_SHARD_LEVELS)
    }

    pub fn chunk_fsync(&self) -> bool {
        self.chunk_fsync.unwrap_or(false)
    }

    pub fn extension(&self) -> &'static str {
        match self.compression_mode.unwrap_or_default() {
            CompressionMode::Gzip => "tar.gz",
            CompressionMode::Zstd => "tar.zst",
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AssemblerMode {
    #[default]
    Eager,
    Lazy,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    #[default]
    Gzip,
    Zstd,
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct ChunkBufferConfig {
    /// Total memory budget; `0` or absent disables the shared buffer.
    pub size: Option<usize>,
    pub drain_ratio: Option<f64>,
    pub channel_slots: Option<usize>,
}

impl ChunkBufferConfig {
    pub fn enabled(&self) -> bool {
        self.size.unwrap_or(0) > 0
    }

    pub fn drain_ratio(&self) -> f64 {
        self.drain_ratio.unwrap_or(DEFAULT_DRAIN_RATIO)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct GapDetectionConfig {
    pub enabled: Option<bool>,
    pub timeout_ms: Option<u64>,
    pub in_flight_timeout_ms: Option<u64>,
    pub check_interval_ms: Option<u64>,
    pub max_nacks_per_cycle: Option<usize>,
}

impl GapDetectionConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
pub struct FlowRotationConfig {
    pub enabled: Option<bool>,
    pub min_mbps: Option<f64>,
    pub eval_window_ms: Option<u64>,
    pub cooldown_ms: Option<u64>,
}

impl FlowRotationConfig {
    pub fn enabled(&self) -> bool {
        self.enabled.unwrap_or(false)
    }
}

/// Hot-reloadable handle to the live `Config`. New sessions read through
/// `current()`; a session already open keeps whatever `Config` clone it
/// captured at open time, so a reload never perturbs an in-flight
/// transfer.
pub struct Manager {
    current: Arc<RwLock<Arc<Config>>>,
    // kept alive for the lifetime of the Manager; dropping it stops the
    // watcher thread.
    _watcher: Option<ConfigWatcher>,
}

impl Manager {
    pub fn load(config_path: &str) -> anyhow::Result<Self> {
        let config = read_config(config_path)?;
        let current = Arc::new(RwLock::new(Arc::new(config)));

        let watch_current = Arc::clone(&current);
        let watch_path = config_path.to_string();
        let watcher = ConfigWatcher::new(move || {
            match read_config(&watch_path) {
                Ok(new_config) => {
                    *watch_current.write().unwrap() = Arc::new(new_config);
                    info!("reloaded config from {}", &watch_path);
                }
                Err(err) => {
                    warn!("discarding invalid config reload from {}: {:?}", &watch_path, err);
                }
            }
        })
        .context("starting config watcher")?;
        watcher.watch(Path::new(config_path)).context("watching config file")?;

        Ok(Manager { current, _watcher: Some(watcher) })
    }

    /// For tests: a manager with no filesystem watch at all.
    pub fn static_config(config: Config) -> Self {
        Manager { current: Arc::new(RwLock::new(Arc::new(config))), _watcher: None }
    }

    pub fn current(&self) -> Arc<Config> {
        Arc::clone(&self.current.read().unwrap())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_minimal() {
        let yaml = r#"
storage:
  primary:
    base_dir: /var/backups/primary
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        let storage = config.storage("primary").unwrap();
        assert_eq!(storage.max_backups(), DEFAULT_MAX_BACKUPS);
        assert_eq!(storage.assembler_mode(), AssemblerMode::Eager);
        assert_eq!(storage.extension(), "tar.gz");
    }

    #[test]
    fn parse_full() {
        let yaml = r#"
storage:
  primary:
    base_dir: /var/backups/primary
    max_backups: 10
    assembler_mode: lazy
    assembler_pending_mem_limit: 1048576
    compression_mode: zstd
    chunk_shard_levels: 2
    chunk_fsync: true
chunk_buffer:
  size: 67108864
  drain_ratio: 0.75
  channel_slots: 128
gap_detection:
  enabled: true
  timeout_ms: 50
  in_flight_timeout_ms: 30000
  check_interval_ms: 5000
  max_nacks_per_cycle: 16
flow_rotation:
  enabled: true
  min_mbps: 1.0
  eval_window_ms: 10000
  cooldown_ms: 60000
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_ok());
        let storage = config.storage("primary").unwrap();
        assert_eq!(storage.max_backups(), 10);
        assert_eq!(storage.assembler_mode(), AssemblerMode::Lazy);
        assert_eq!(storage.extension(), "tar.zst");
        assert_eq!(storage.chunk_shard_levels(), 2);
        assert!(storage.chunk_fsync());
        assert!(config.chunk_buffer.enabled());
        assert!(config.gap_detection.enabled());
        assert!(config.flow_rotation.enabled());
    }

    #[test]
    fn rejects_bad_shard_levels() {
        let yaml = r#"
storage:
  primary:
    base_dir: /var/backups/primary
    chunk_shard_levels: 3
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_bad_drain_ratio() {
        let yaml = r#"
storage:
  primary:
    base_dir: /var/backups/primary
chunk_buffer:
  drain_ratio: 1.5
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }
}
