//! Owner of one worker's state.

use std::sync::Arc;

use lingai_config::WorkerConfig;
use lingai_engine::ComputeEngine;
use lingai_types::{InboundMessage, WorkerStatus};
use log::{info, warn};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::dispatcher::Dispatcher;
use crate::lifecycle::LifecycleManager;
use crate::registry::CorrelationRegistry;
use crate::transport::Transport;

/// A running worker: lifecycle manager, registry and dispatcher bound to one
/// engine and one transport.
///
/// Each received message is handled on its own task. Must be used from within
/// a tokio runtime.
pub struct WorkerSession {
    dispatcher: Dispatcher,
    tracker: TaskTracker,
}

impl WorkerSession {
    pub fn new(
        engine: Arc<dyn ComputeEngine>,
        transport: Arc<dyn Transport>,
        config: &WorkerConfig,
    ) -> Self {
        let lifecycle = Arc::new(LifecycleManager::new(
            engine.clone(),
            config.lifecycle_policy,
        ));
        let dispatcher = Dispatcher::new(
            lifecycle,
            Arc::new(CorrelationRegistry::new()),
            engine,
            transport,
            config.require_stream_correlation_id,
        );
        info!(
            "[WORKER] Session ready (lifecycle policy: {:?})",
            config.lifecycle_policy
        );

        Self {
            dispatcher,
            tracker: TaskTracker::new(),
        }
    }

    /// Entry point for the transport: handle one raw frame.
    pub fn on_receive(&self, frame: impl Into<String>) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        let frame = frame.into();
        self.tracker
            .spawn(async move { dispatcher.handle_frame(&frame).await })
    }

    /// Handle an already decoded message.
    pub fn dispatch(&self, message: InboundMessage) -> JoinHandle<()> {
        let dispatcher = self.dispatcher.clone();
        self.tracker
            .spawn(async move { dispatcher.handle(message).await })
    }

    pub fn status(&self) -> WorkerStatus {
        self.dispatcher.status()
    }

    /// Cancel the in-flight request with this id. The request still sends one
    /// terminal `Cancelled` error.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.dispatcher.registry().cancel(correlation_id)
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.registry().in_flight()
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        self.dispatcher.lifecycle()
    }

    /// Cancel everything in flight, wait for every task to send its terminal
    /// response, then release the model.
    pub async fn shutdown(&self) {
        let cancelled = self.dispatcher.registry().cancel_all();
        info!("[WORKER] Shutting down, cancelled {cancelled} in-flight requests");

        self.tracker.close();
        self.tracker.wait().await;

        if let Err(e) = self.lifecycle().unload_model().await {
            warn!("[WORKER] Unload during shutdown failed: {e}");
        }
        info!("[WORKER] Shutdown complete");
    }
}
