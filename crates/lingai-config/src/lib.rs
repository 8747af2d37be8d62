//! Worker configuration.
//!
//! Read from a camelCase JSON file; every field has a default so an empty
//! object (or no file at all) yields a runnable worker.

use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// How the lifecycle manager treats a load/unload issued while another is running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecyclePolicy {
    /// Wait behind the running operation, in arrival order.
    #[default]
    Queue,
    /// Fail immediately with `ConcurrentLifecycleOperation`.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WorkerConfig {
    pub lifecycle_policy: LifecyclePolicy,
    /// Reject `streamInference` requests that carry no correlation id.
    pub require_stream_correlation_id: bool,
    pub log_level: String,
    pub log_file: Option<String>,
    pub simulation: SimulationConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lifecycle_policy: LifecyclePolicy::Queue,
            require_stream_correlation_id: true,
            log_level: "info".to_string(),
            log_file: None,
            simulation: SimulationConfig::default(),
        }
    }
}

/// Timings and canned output of the simulated compute engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SimulationConfig {
    /// Total load time, spread evenly over `load_stages`.
    pub load_delay_ms: u64,
    pub load_stages: Vec<String>,
    pub unload_delay_ms: u64,
    pub infer_delay_ms: u64,
    pub embed_delay_ms: u64,
    /// Pause before each streamed fragment.
    pub chunk_delay_ms: u64,
    pub embedding_dimensions: usize,
    pub context_length: u32,
    /// Replies for single-shot inference; one is picked per prompt.
    pub responses: Vec<String>,
    /// Reply streamed one character at a time.
    pub stream_response: String,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            load_delay_ms: 2000,
            load_stages: [
                "reading model file",
                "parsing model structure",
                "initializing runtime",
                "loading parameters",
                "optimizing compute graph",
                "preparing inference",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            unload_delay_ms: 500,
            infer_delay_ms: 1000,
            embed_delay_ms: 200,
            chunk_delay_ms: 50,
            embedding_dimensions: 384,
            context_length: 2048,
            responses: vec![
                "Hello, I am LingAI. Could you describe your question?".to_string(),
                "That is an interesting topic. We can look at it from a few angles.".to_string(),
                "I suggest three steps: find the root cause, plan a fix, then measure the result."
                    .to_string(),
                "Thanks for the detail. Let us go through the system, the product and the operations side."
                    .to_string(),
                "To help further: set a clear goal first, then move through the plan step by step."
                    .to_string(),
            ],
            stream_response: "Hello, I am LingAI. I can help you, here is a detailed explanation."
                .to_string(),
        }
    }
}

impl SimulationConfig {
    /// Zero delays, for tests and dry runs.
    pub fn instant() -> Self {
        Self {
            load_delay_ms: 0,
            unload_delay_ms: 0,
            infer_delay_ms: 0,
            embed_delay_ms: 0,
            chunk_delay_ms: 0,
            ..Self::default()
        }
    }
}

impl WorkerConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log_level_filter()?;
        if self.simulation.embedding_dimensions == 0 {
            return Err(ConfigError::Invalid(
                "simulation.embeddingDimensions must be greater than 0".to_string(),
            ));
        }
        if self.simulation.responses.is_empty() {
            return Err(ConfigError::Invalid(
                "simulation.responses must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn log_level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log level: {}", self.log_level)))
    }
}
