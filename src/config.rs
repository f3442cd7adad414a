use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::queue::ClaimSelector;
use crate::summarize::{ProviderConfig, ReducePolicy};

/// Everything the binary needs, from one TOML file. Every section has
/// defaults so a minimal file only carries `[storage]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub worker: WorkerConfig,
    pub engine: EngineConfig,
    pub drain: DrainConfig,
    pub summarize: SummarizeConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    /// Forward proxy for boxes that cannot reach the share directly.
    pub proxy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub lease_secs: i64,
    pub max_attempts: u8,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_secs: 1800,
            max_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub name: String,
    pub poll_secs: u64,
    pub selector: ClaimSelector,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker-1".to_string(),
            poll_secs: 30,
            selector: ClaimSelector::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub program: String,
    pub model: String,
    pub args: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            program: "whisper-ctranslate2".to_string(),
            model: "large-v3".to_string(),
            args: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrainConfig {
    pub poll_secs: u64,
    pub output_dir: String,
}

impl Default for DrainConfig {
    fn default() -> Self {
        Self {
            poll_secs: 60,
            output_dir: "./transcripts".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizeConfig {
    pub timeout_secs: u64,
    pub retries: u32,
    pub reduce: ReducePolicy,
    pub providers: Vec<ProviderConfig>,
}

impl Default for SummarizeConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            retries: 2,
            reduce: ReducePolicy::default(),
            providers: Vec::new(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        let mut cfg: Config = toml::from_str(&raw)
            .with_context(|| format!("parse config {}", path.display()))?;
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment wins over the file so credentials can stay out of it.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("STT_RELAY_STORAGE_URL") {
            self.storage.url = v;
        }
        if let Ok(v) = std::env::var("STT_RELAY_STORAGE_USERNAME") {
            self.storage.username = v;
        }
        if let Ok(v) = std::env::var("STT_RELAY_STORAGE_PASSWORD") {
            self.storage.password = v;
        }
        if let Ok(v) = std::env::var("STT_RELAY_STORAGE_PROXY") {
            self.storage.proxy = Some(v);
        }
        if let Ok(v) = std::env::var("STT_RELAY_WORKER_NAME") {
            self.worker.name = v;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.storage.url.is_empty() {
            anyhow::bail!("storage.url is required (or set STT_RELAY_STORAGE_URL)");
        }
        Ok(())
    }
}
