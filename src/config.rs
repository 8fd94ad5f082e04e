//! TOML configuration for the consensus core.
//!
//! The embedding node loads one `CoreConfig` at start-up; the precompile
//! addresses and the accountability window are fixed here and nowhere else.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CoreConfig {
    #[serde(default)]
    pub consensus: ConsensusSection,
    #[serde(default)]
    pub accountability: AccountabilitySection,
    #[serde(default)]
    pub submission: SubmissionSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusSection {
    #[serde(flatten)]
    pub timeouts: TimeoutConfig,
    /// Hard cap on rounds within one height.
    pub max_round: u64,
    /// Seconds of unchanged (height, round) before asking peers for sync.
    pub sync_interval_secs: u64,
    /// Directory for the persisted signing guard; `None` disables it.
    pub guard_dir: Option<String>,
}

impl Default for ConsensusSection {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            max_round: crate::types::MAX_ROUND,
            sync_interval_secs: 10,
            guard_dir: None,
        }
    }
}

/// Step timer bases and the per-round backoff increment:
/// timeout(step, r) = base_step + r * delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub base_propose_ms: u64,
    pub base_prevote_ms: u64,
    pub base_precommit_ms: u64,
    pub delta_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_propose_ms: 3000,
            base_prevote_ms: 1000,
            base_precommit_ms: 1000,
            delta_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountabilitySection {
    /// Heights are scanned (and the store pruned) once they are this many
    /// blocks behind the committed head.
    pub delta_blocks: u64,
    /// Off-chain accusations accepted per peer per height before the peer is
    /// disconnected.
    pub max_accusations_per_height: u32,
}

impl Default for AccountabilitySection {
    fn default() -> Self {
        Self { delta_blocks: 100, max_accusations_per_height: 1 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionSection {
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
}

impl Default for SubmissionSection {
    fn default() -> Self {
        Self { max_attempts: 5, backoff_base_ms: 1000 }
    }
}

pub fn load_config(path: impl AsRef<Path>) -> Result<CoreConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&raw)?)
}
