//! Trainer configuration.
//!
//! Loaded from a JSON file; every field has a default so a partial file (or no file at
//! all) is valid.

use std::{path::Path, path::PathBuf, time::Duration};

use derivative::Derivative;
use log::info;
use serde::{Deserialize, Serialize};

use crate::error::TrainerResult;

pub const DEFAULT_TABLEBASE_URL: &str = "https://tablebase.lichess.ovh";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TrainerConfig {
    pub tablebase: TablebaseConfig,
    pub engine: EngineConfig,
    pub validation: ValidationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
#[serde(default, rename_all = "camelCase")]
pub struct TablebaseConfig {
    #[derivative(Default(value = "DEFAULT_TABLEBASE_URL.to_string()"))]
    pub base_url: String,
    #[derivative(Default(value = "5000"))]
    pub request_timeout_ms: u64,
    /// Client-side request ceiling. Zero is treated as one.
    #[derivative(Default(value = "4"))]
    pub requests_per_second: u32,
    #[derivative(Default(value = "3"))]
    pub max_background_retries: u32,
    #[derivative(Default(value = "500"))]
    pub retry_base_delay_ms: u64,
    /// Positions with more pieces are answered "no entry" without a request.
    #[derivative(Default(value = "7"))]
    pub max_pieces: usize,
    /// Positions kept per cache (tablebase and engine).
    #[derivative(Default(value = "4096"))]
    pub cache_capacity: usize,
}

impl TablebaseConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Delay before background retry `attempt` (zero-based): doubles every attempt.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(1u64 << attempt.min(16)))
    }
}

/// A UCI `setoption` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineOption {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineConfig {
    /// Engine binary. Without one the trainer runs on tablebase data alone.
    pub path: Option<PathBuf>,
    #[derivative(Default(value = "1"))]
    pub threads: u32,
    #[derivative(Default(value = "64"))]
    pub hash_mb: u32,
    pub extra_options: Vec<EngineOption>,
    /// Interval between `stop`s while waiting for an overdue `bestmove`.
    #[derivative(Default(value = "8000"))]
    pub stop_timeout_ms: u64,
}

impl EngineConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms.max(1))
    }

    /// All options sent to the engine after `uci`, in order.
    pub fn uci_options(&self) -> Vec<EngineOption> {
        let mut options = vec![
            EngineOption {
                name: "Threads".to_string(),
                value: self.threads.max(1).to_string(),
            },
            EngineOption {
                name: "Hash".to_string(),
                value: self.hash_mb.max(1).to_string(),
            },
        ];
        options.extend(self.extra_options.iter().cloned());
        options
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Derivative)]
#[derivative(Default)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidationConfig {
    /// Ceiling per side when waiting for an evaluation before failing open.
    #[derivative(Default(value = "3000"))]
    pub evaluation_timeout_ms: u64,
    /// Alternatives offered when a move is intercepted.
    #[derivative(Default(value = "1"))]
    pub top_moves: usize,
}

impl ValidationConfig {
    pub fn evaluation_timeout(&self) -> Duration {
        Duration::from_millis(self.evaluation_timeout_ms)
    }
}

impl TrainerConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> TrainerResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: TrainerConfig = serde_json::from_str(&text)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }
}
