//! Model lifecycle state machine.
//!
//! State diagram:
//! ```text
//! Unloaded ──load──> Loading ──ok──> Loaded ──unload──> Unloading ──> Unloaded
//!                       │                                   ▲
//!                       └──────────engine error─────────────┘ (straight to Unloaded)
//! ```
//!
//! Mutations go through [`LifecycleManager::load_model`] and
//! [`LifecycleManager::unload_model`], which hold an async gate for their whole
//! duration. Reads go through an `ArcSwap` and never wait on that gate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use lingai_config::LifecyclePolicy;
use lingai_engine::ComputeEngine;
use lingai_types::{LoadInfo, ModelConfig};
use log::{debug, error, info, warn};
use tokio::sync::{Mutex, MutexGuard};

use crate::error::WorkerError;

#[derive(Debug, Clone, PartialEq)]
pub enum ModelState {
    Unloaded,
    Loading {
        path: String,
    },
    Loaded {
        path: String,
        config: ModelConfig,
        loaded_at: DateTime<Utc>,
        /// Bumped on every successful load.
        epoch: u64,
    },
    Unloading,
}

impl ModelState {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Unloaded => "unloaded",
            Self::Loading { .. } => "loading",
            Self::Loaded { .. } => "loaded",
            Self::Unloading => "unloading",
        }
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded { .. })
    }
}

/// What an inference handler saw when it started.
///
/// Handlers re-check the lease after each suspension point; a changed epoch
/// means the model they started on is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelLease {
    pub path: String,
    pub config: ModelConfig,
    pub epoch: u64,
}

/// Sets the state to `Unloaded` on drop unless disarmed, so a failed or
/// abandoned operation never leaves `Loading`/`Unloading` behind.
struct Rollback<'a> {
    state: &'a ArcSwap<ModelState>,
    armed: bool,
}

impl<'a> Rollback<'a> {
    fn arm(state: &'a ArcSwap<ModelState>) -> Self {
        Self { state, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Rollback<'_> {
    fn drop(&mut self) {
        if self.armed {
            warn!("[LIFECYCLE] Rolling back to unloaded");
            self.state.store(Arc::new(ModelState::Unloaded));
        }
    }
}

pub struct LifecycleManager {
    engine: Arc<dyn ComputeEngine>,
    state: ArcSwap<ModelState>,
    gate: Mutex<()>,
    policy: LifecyclePolicy,
    last_epoch: AtomicU64,
}

impl LifecycleManager {
    pub fn new(engine: Arc<dyn ComputeEngine>, policy: LifecyclePolicy) -> Self {
        Self {
            engine,
            state: ArcSwap::from_pointee(ModelState::Unloaded),
            gate: Mutex::new(()),
            policy,
            last_epoch: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> LifecyclePolicy {
        self.policy
    }

    /// Last committed state.
    pub fn snapshot(&self) -> Arc<ModelState> {
        self.state.load_full()
    }

    pub fn is_loaded(&self) -> bool {
        self.state.load().is_loaded()
    }

    pub fn current_path(&self) -> Option<String> {
        match self.state.load().as_ref() {
            ModelState::Loaded { path, .. } => Some(path.clone()),
            _ => None,
        }
    }

    pub fn loaded_at(&self) -> Option<DateTime<Utc>> {
        match self.state.load().as_ref() {
            ModelState::Loaded { loaded_at, .. } => Some(*loaded_at),
            _ => None,
        }
    }

    /// Snapshot the loaded model for an inference-class request.
    pub fn lease(&self) -> Result<ModelLease, WorkerError> {
        match self.state.load().as_ref() {
            ModelState::Loaded {
                path,
                config,
                epoch,
                ..
            } => Ok(ModelLease {
                path: path.clone(),
                config: config.clone(),
                epoch: *epoch,
            }),
            _ => Err(WorkerError::ModelNotLoaded),
        }
    }

    /// Check that the lease still names the loaded model.
    pub fn revalidate(&self, lease: &ModelLease) -> Result<(), WorkerError> {
        match self.state.load().as_ref() {
            ModelState::Loaded { epoch, .. } if *epoch == lease.epoch => Ok(()),
            _ => Err(WorkerError::ModelChanged),
        }
    }

    /// Load a model, replacing any loaded one.
    pub async fn load_model(
        &self,
        path: &str,
        config: ModelConfig,
    ) -> Result<LoadInfo, WorkerError> {
        let gate = self.acquire().await?;

        if self.is_loaded() {
            info!("[LIFECYCLE] Unloading current model before loading {path}");
            self.unload_locked(&gate).await?;
        }

        info!("[LIFECYCLE] Loading model: {path}");
        let rollback = Rollback::arm(&self.state);
        self.commit(ModelState::Loading {
            path: path.to_string(),
        });

        let details = match self.engine.load(path, &config).await {
            Ok(details) => details,
            Err(e) => {
                error!("[LIFECYCLE] Model load failed: {e}");
                return Err(e.into());
            }
        };

        let epoch = self.last_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let loaded_at = Utc::now();
        self.commit(ModelState::Loaded {
            path: path.to_string(),
            config,
            loaded_at,
            epoch,
        });
        rollback.disarm();
        info!("[LIFECYCLE] Model loaded: {path} (epoch {epoch})");

        Ok(LoadInfo {
            model_path: path.to_string(),
            load_time: loaded_at.timestamp_millis(),
            name: details.name,
            context_length: details.context_length,
            embedding_dimensions: details.embedding_dimensions,
        })
    }

    /// Unload the current model. A no-op success when nothing is loaded.
    pub async fn unload_model(&self) -> Result<(), WorkerError> {
        let gate = self.acquire().await?;
        self.unload_locked(&gate).await
    }

    async fn acquire(&self) -> Result<MutexGuard<'_, ()>, WorkerError> {
        match self.policy {
            LifecyclePolicy::Queue => Ok(self.gate.lock().await),
            LifecyclePolicy::Reject => self.gate.try_lock().map_err(|_| {
                warn!("[LIFECYCLE] Rejecting overlapping load/unload");
                WorkerError::ConcurrentLifecycleOperation
            }),
        }
    }

    /// Requires the gate, which the caller proves by passing its guard.
    async fn unload_locked(&self, _gate: &MutexGuard<'_, ()>) -> Result<(), WorkerError> {
        if !self.is_loaded() {
            debug!("[LIFECYCLE] No model loaded to unload");
            return Ok(());
        }

        let rollback = Rollback::arm(&self.state);
        self.commit(ModelState::Unloading);
        let result = self.engine.unload().await;
        self.commit(ModelState::Unloaded);
        rollback.disarm();

        match result {
            Ok(()) => {
                info!("[LIFECYCLE] Model unloaded");
                Ok(())
            }
            Err(e) => {
                error!("[LIFECYCLE] Engine unload failed, state reset to unloaded: {e}");
                Err(e.into())
            }
        }
    }

    fn commit(&self, state: ModelState) {
        debug!("[LIFECYCLE] -> {}", state.name());
        self.state.store(Arc::new(state));
    }
}
