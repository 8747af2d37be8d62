//! Deterministic stand-in engine.
//!
//! Sleeps for configured durations and returns canned text. The embedding is
//! seeded from a hash of the input so the same text always maps to the same
//! unit vector.

use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use lingai_config::SimulationConfig;
use lingai_types::ModelConfig;
use log::debug;

use crate::{ComputeEngine, EngineError, FragmentStream, ModelDetails};

pub struct SimulatedEngine {
    config: SimulationConfig,
    loaded: Mutex<Option<String>>,
}

impl SimulatedEngine {
    pub fn new(config: SimulationConfig) -> Self {
        Self {
            config,
            loaded: Mutex::new(None),
        }
    }

    pub fn loaded_path(&self) -> Option<String> {
        self.loaded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn ensure_loaded(&self) -> Result<(), EngineError> {
        if self.loaded_path().is_some() {
            Ok(())
        } else {
            Err(EngineError::new("NOT_LOADED", "no model loaded in engine"))
        }
    }

    /// Pick a canned reply by prompt hash so repeated prompts answer the same way.
    fn pick_response(&self, prompt: &str) -> String {
        let responses = &self.config.responses;
        if responses.is_empty() {
            return String::new();
        }
        let slot = hash_string(prompt) as usize % responses.len();
        responses[slot].clone()
    }
}

#[async_trait]
impl ComputeEngine for SimulatedEngine {
    async fn load(&self, path: &str, _config: &ModelConfig) -> Result<ModelDetails, EngineError> {
        let stages = &self.config.load_stages;
        debug!(
            "[ENGINE] Simulating load of {path} ({}ms over {} stages)",
            self.config.load_delay_ms,
            stages.len()
        );

        if stages.is_empty() {
            pause(self.config.load_delay_ms).await;
        } else {
            let per_stage = self.config.load_delay_ms / stages.len() as u64;
            for (i, stage) in stages.iter().enumerate() {
                pause(per_stage).await;
                debug!("[ENGINE] {stage}... ({}/{})", i + 1, stages.len());
            }
        }

        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = Some(path.to_string());

        Ok(ModelDetails {
            name: Path::new(path)
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned()),
            context_length: Some(self.config.context_length),
            embedding_dimensions: Some(self.config.embedding_dimensions),
        })
    }

    async fn unload(&self) -> Result<(), EngineError> {
        pause(self.config.unload_delay_ms).await;
        *self.loaded.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }

    async fn infer(&self, prompt: &str, _config: &ModelConfig) -> Result<String, EngineError> {
        self.ensure_loaded()?;
        pause(self.config.infer_delay_ms).await;
        Ok(self.pick_response(prompt))
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EngineError> {
        self.ensure_loaded()?;
        pause(self.config.embed_delay_ms).await;
        Ok(seeded_embedding(text, self.config.embedding_dimensions))
    }

    async fn stream_infer(
        &self,
        _prompt: &str,
        config: &ModelConfig,
    ) -> Result<FragmentStream, EngineError> {
        self.ensure_loaded()?;

        let limit = config
            .get_u64("maxTokens")
            .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX));
        let fragments: Vec<String> = self
            .config
            .stream_response
            .chars()
            .take(limit)
            .map(String::from)
            .collect();
        let delay = self.config.chunk_delay_ms;

        Ok(Box::pin(async_stream::stream! {
            for fragment in fragments {
                pause(delay).await;
                yield Ok::<String, EngineError>(fragment);
            }
        }))
    }
}

async fn pause(ms: u64) {
    if ms > 0 {
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

/// 31-multiplier string hash over UTF-16 code units, folded to 32 bits.
fn hash_string(text: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in text.encode_utf16() {
        hash = hash
            .wrapping_shl(5)
            .wrapping_sub(hash)
            .wrapping_add(i32::from(unit));
    }
    hash.unsigned_abs()
}

fn seeded_random(seed: f64) -> f64 {
    let x = seed.sin() * 10000.0;
    x - x.floor()
}

fn seeded_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let seed = f64::from(hash_string(text));
    let raw: Vec<f64> = (0..dimensions)
        .map(|i| seeded_random(seed + i as f64) * 2.0 - 1.0)
        .collect();
    let norm = raw.iter().map(|v| v * v).sum::<f64>().sqrt();
    if norm == 0.0 {
        return vec![0.0; dimensions];
    }
    raw.iter().map(|v| (v / norm) as f32).collect()
}
