//! Engine configuration types.
//!
//! `EngineConfig` represents `stepwise.toml`. All fields have defaults so an
//! empty or missing file yields a working configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to handlers, stages and subworkflow loads.
    #[serde(default = "default_step_timeout_secs")]
    pub default_step_timeout_secs: u64,

    /// Timeout applied to agent delegation calls.
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Concurrency bound for parallel steps without `max_concurrent`.
    #[serde(default = "default_max_concurrent")]
    pub default_max_concurrent: usize,

    /// Capacity of the event broadcast channel.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Directory holding `<workflow>.checkpoint.json` files.
    #[serde(default = "default_checkpoint_dir")]
    pub checkpoint_dir: PathBuf,

    #[serde(default)]
    pub agent: AgentCommandConfig,

    /// Validation stage name -> command line.
    #[serde(default)]
    pub stages: BTreeMap<String, Vec<String>>,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_agent_timeout_secs() -> u64 {
    120
}

fn default_max_concurrent() -> usize {
    4
}

fn default_event_capacity() -> usize {
    1024
}

fn default_checkpoint_dir() -> PathBuf {
    PathBuf::from(".stepwise/checkpoints")
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_step_timeout_secs: default_step_timeout_secs(),
            agent_timeout_secs: default_agent_timeout_secs(),
            default_max_concurrent: default_max_concurrent(),
            event_capacity: default_event_capacity(),
            checkpoint_dir: default_checkpoint_dir(),
            agent: AgentCommandConfig::default(),
            stages: BTreeMap::new(),
        }
    }
}

/// External agent process. The delegation request is written to its stdin
/// as JSON and a JSON result is read from its stdout.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCommandConfig {
    /// Program and arguments. Empty means no agent is configured.
    #[serde(default)]
    pub command: Vec<String>,

    /// Extra environment variables for the agent process.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl AgentCommandConfig {
    pub fn is_configured(&self) -> bool {
        !self.command.is_empty()
    }
}
