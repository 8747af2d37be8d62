//! Request validation and routing.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use lingai_engine::{ComputeEngine, EngineError};
use lingai_types::{
    EmbedResult, InboundMessage, InferResult, ModelConfig, RequestCommand, RequestKind, TokenUsage,
    WorkerResponse, WorkerStatus, FINISH_REASON_STOP,
};
use log::{debug, info, warn};

use crate::emitter::StreamEmitter;
use crate::error::WorkerError;
use crate::lifecycle::{LifecycleManager, ModelState};
use crate::registry::{CorrelationRegistry, CorrelationToken};
use crate::transport::{deliver, send_logged, Transport};

/// Turns inbound messages into exactly one terminal outcome each.
///
/// Cheap to clone; every request runs on its own clone inside its own task.
#[derive(Clone)]
pub struct Dispatcher {
    lifecycle: Arc<LifecycleManager>,
    registry: Arc<CorrelationRegistry>,
    engine: Arc<dyn ComputeEngine>,
    transport: Arc<dyn Transport>,
    require_stream_correlation_id: bool,
}

impl Dispatcher {
    pub fn new(
        lifecycle: Arc<LifecycleManager>,
        registry: Arc<CorrelationRegistry>,
        engine: Arc<dyn ComputeEngine>,
        transport: Arc<dyn Transport>,
        require_stream_correlation_id: bool,
    ) -> Self {
        Self {
            lifecycle,
            registry,
            engine,
            transport,
            require_stream_correlation_id,
        }
    }

    pub fn lifecycle(&self) -> &LifecycleManager {
        &self.lifecycle
    }

    pub fn registry(&self) -> &CorrelationRegistry {
        &self.registry
    }

    /// Handle one raw frame. Undecodable input is answered with whatever
    /// correlation id can still be read from it.
    pub async fn handle_frame(&self, frame: &str) {
        match InboundMessage::parse(frame) {
            Ok(message) => self.handle(message).await,
            Err(e) => {
                let correlation_id = InboundMessage::correlation_id_of(frame);
                warn!("[WORKER] Failed to parse command {correlation_id:?}: {e}");
                self.reply_unregistered(correlation_id, &e.into());
            }
        }
    }

    pub async fn handle(&self, message: InboundMessage) {
        let correlation_id = message.correlation_id.clone();
        let request = match message.into_request() {
            Ok(request) => request,
            Err(e) => {
                warn!("[WORKER] Rejected {correlation_id:?}: {e}");
                self.reply_unregistered(correlation_id, &e.into());
                return;
            }
        };
        let kind = request.kind();

        // Cancel targets another request and answers nothing itself.
        if let RequestCommand::Cancel = request.command {
            let target = request.correlation_id.unwrap_or_default();
            if self.registry.cancel(&target) {
                info!("[WORKER] Cancellation requested for {target}");
            } else {
                debug!("[WORKER] Cancel for {target} ignored, nothing in flight");
            }
            return;
        }

        if kind == RequestKind::StreamInfer
            && self.require_stream_correlation_id
            && request.correlation_id.is_none()
        {
            self.reply_unregistered(None, &WorkerError::MissingStreamCorrelationId);
            return;
        }

        let token = match self
            .registry
            .register(request.correlation_id.as_deref(), kind)
        {
            Ok(token) => token,
            Err(e) => {
                warn!("[WORKER] {e}");
                self.reply_unregistered(correlation_id, &e);
                return;
            }
        };

        debug!("[WORKER] Handling {kind} {:?}", token.correlation_id());
        match self.execute(&token, request.command).await {
            Ok(Some(response)) => {
                deliver(self.transport.as_ref(), &self.registry, &token, response);
            }
            // Streams send their own terminal chunk or error.
            Ok(None) => {}
            Err(e) => {
                if e != WorkerError::Cancelled {
                    warn!("[WORKER] {kind} {:?} failed: {e}", token.correlation_id());
                }
                let response = WorkerResponse::error(correlation_id, e.to_error_body());
                deliver(self.transport.as_ref(), &self.registry, &token, response);
            }
        }
    }

    /// Read-only snapshot; never waits on a running load or unload.
    pub fn status(&self) -> WorkerStatus {
        let state = self.lifecycle.snapshot();
        let (model_path, load_time, uptime) = match state.as_ref() {
            ModelState::Loaded {
                path, loaded_at, ..
            } => {
                let elapsed = (Utc::now() - *loaded_at).num_milliseconds();
                (
                    Some(path.clone()),
                    Some(loaded_at.timestamp_millis()),
                    u64::try_from(elapsed).unwrap_or(0),
                )
            }
            _ => (None, None, 0),
        };

        WorkerStatus {
            model_loaded: state.is_loaded(),
            model_path,
            load_time,
            uptime,
            state: state.name().to_string(),
            in_flight: self.registry.in_flight(),
        }
    }

    async fn execute(
        &self,
        token: &CorrelationToken,
        command: RequestCommand,
    ) -> Result<Option<WorkerResponse>, WorkerError> {
        let correlation_id = token.correlation_id().map(str::to_string);

        match command {
            // Lifecycle operations always run to a committed state; cancel does not apply.
            RequestCommand::LoadModel { model_path, config } => {
                let info = self.lifecycle.load_model(&model_path, config).await?;
                Ok(Some(WorkerResponse::model_loaded(correlation_id, info)))
            }
            RequestCommand::UnloadModel => {
                self.lifecycle.unload_model().await?;
                Ok(Some(WorkerResponse::model_unloaded(correlation_id)))
            }
            RequestCommand::Infer { prompt, config } => {
                let lease = self.lifecycle.lease()?;
                let config = lease.config.merged(&config);
                let content = until_cancelled(token, self.engine.infer(&prompt, &config)).await?;
                self.lifecycle.revalidate(&lease)?;

                let usage = TokenUsage::new(
                    self.engine.count_tokens(&prompt),
                    self.engine.count_tokens(&content),
                );
                Ok(Some(WorkerResponse::infer_result(
                    correlation_id,
                    InferResult {
                        content,
                        finish_reason: FINISH_REASON_STOP.to_string(),
                        usage,
                    },
                )))
            }
            RequestCommand::Embed { text } => {
                let lease = self.lifecycle.lease()?;
                let embedding = until_cancelled(token, self.engine.embed(&text)).await?;
                self.lifecycle.revalidate(&lease)?;
                Ok(Some(WorkerResponse::embed_result(
                    correlation_id,
                    EmbedResult::new(embedding),
                )))
            }
            RequestCommand::StreamInfer { prompt, config } => {
                self.stream(token, &prompt, &config).await?;
                Ok(None)
            }
            RequestCommand::GetStatus => Ok(Some(WorkerResponse::status(
                correlation_id,
                self.status(),
            ))),
            // Answered in `handle` before registration; release if one ever gets here.
            RequestCommand::Cancel => {
                self.registry.sweep(token);
                Ok(None)
            }
        }
    }

    async fn stream(
        &self,
        token: &CorrelationToken,
        prompt: &str,
        config: &ModelConfig,
    ) -> Result<(), WorkerError> {
        let lease = self.lifecycle.lease()?;
        let config = lease.config.merged(config);
        let fragments = until_cancelled(token, self.engine.stream_infer(prompt, &config)).await?;
        self.lifecycle.revalidate(&lease)?;

        let emitter = StreamEmitter::new(
            &self.registry,
            self.transport.as_ref(),
            &self.lifecycle,
            self.engine.as_ref(),
        );
        let outcome = emitter
            .run(token, &lease, fragments, self.engine.count_tokens(prompt))
            .await;
        debug!("[WORKER] Stream {:?} ended: {outcome:?}", token.correlation_id());
        Ok(())
    }

    /// Error reply for a message that never made it into the registry.
    fn reply_unregistered(&self, correlation_id: Option<String>, error: &WorkerError) {
        send_logged(
            self.transport.as_ref(),
            WorkerResponse::error(correlation_id, error.to_error_body()),
        );
    }
}

async fn until_cancelled<T, F>(token: &CorrelationToken, work: F) -> Result<T, WorkerError>
where
    F: Future<Output = Result<T, EngineError>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(WorkerError::Cancelled),
        result = work => result.map_err(WorkerError::from),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use lingai_config::{LifecyclePolicy, SimulationConfig};
    use lingai_engine::SimulatedEngine;
    use lingai_types::{ErrorCode, ResponseData, ResponseKind};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn dispatcher(require_stream_id: bool) -> (Dispatcher, UnboundedReceiver<WorkerResponse>) {
        let engine: Arc<dyn ComputeEngine> =
            Arc::new(SimulatedEngine::new(SimulationConfig::instant()));
        let (transport, rx) = ChannelTransport::new();
        let dispatcher = Dispatcher::new(
            Arc::new(LifecycleManager::new(engine.clone(), LifecyclePolicy::Queue)),
            Arc::new(CorrelationRegistry::new()),
            engine,
            Arc::new(transport),
            require_stream_id,
        );
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn test_malformed_frame_gets_uncorrelated_validation_error() {
        let (dispatcher, mut rx) = dispatcher(true);
        dispatcher.handle_frame("{not json").await;

        let response = rx.try_recv().unwrap();
        assert_eq!(response.kind, ResponseKind::Error);
        assert!(response.correlation_id.is_none());
        assert_eq!(response.error_code(), Some(ErrorCode::ValidationError));
    }

    #[tokio::test]
    async fn test_undecodable_frame_keeps_correlation_id() {
        let (dispatcher, mut rx) = dispatcher(true);
        for (frame, id) in [
            (r#"{"kind":"inference","correlationId":"c7","prompt":42}"#, "c7"),
            (r#"{"correlationId":"c8","prompt":"hi"}"#, "c8"),
            (r#"{"kind":"loadModel","correlationId":"c9","modelPath":"m","config":"fast"}"#, "c9"),
        ] {
            dispatcher.handle_frame(frame).await;
            let response = rx.try_recv().unwrap();
            assert_eq!(response.correlation_id.as_deref(), Some(id), "{frame}");
            assert_eq!(response.error_code(), Some(ErrorCode::ValidationError));
        }
        assert!(!dispatcher.lifecycle().is_loaded());
        assert_eq!(dispatcher.registry().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancel_without_target_is_silent() {
        let (dispatcher, mut rx) = dispatcher(true);
        dispatcher
            .handle_frame(r#"{"kind":"cancel","correlationId":"nobody"}"#)
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stream_without_id() {
        let (strict, mut rx) = dispatcher(true);
        strict
            .handle_frame(r#"{"kind":"streamInference","prompt":"x"}"#)
            .await;
        assert_eq!(
            rx.try_recv().unwrap().error_code(),
            Some(ErrorCode::ValidationError)
        );

        // When allowed, an anonymous stream is only refused for lack of a model.
        let (lenient, mut rx) = dispatcher(false);
        lenient
            .handle_frame(r#"{"kind":"streamInference","prompt":"x"}"#)
            .await;
        assert_eq!(
            rx.try_recv().unwrap().error_code(),
            Some(ErrorCode::ModelNotLoaded)
        );
        assert_eq!(lenient.registry().in_flight(), 0);
    }

    #[tokio::test]
    async fn test_infer_reports_usage() {
        let (dispatcher, mut rx) = dispatcher(true);
        dispatcher
            .handle_frame(r#"{"kind":"loadModel","correlationId":"l","modelPath":"/m/a.bin"}"#)
            .await;
        assert_eq!(rx.try_recv().unwrap().kind, ResponseKind::ModelLoaded);

        dispatcher
            .handle_frame(r#"{"kind":"inference","correlationId":"i","prompt":"hi there"}"#)
            .await;
        let response = rx.try_recv().unwrap();
        assert_eq!(response.correlation_id.as_deref(), Some("i"));
        let Some(ResponseData::Infer(result)) = response.data else {
            panic!("expected inference result, got {response:?}");
        };
        assert_eq!(result.finish_reason, "stop");
        assert_eq!(result.usage.prompt_tokens(), 2);
        assert_eq!(
            result.usage.total_tokens(),
            result.usage.prompt_tokens() + result.usage.completion_tokens()
        );
    }

    #[tokio::test]
    async fn test_status_reflects_loaded_model() {
        let (dispatcher, _rx) = dispatcher(true);
        let status = dispatcher.status();
        assert!(!status.model_loaded);
        assert_eq!(status.uptime, 0);
        assert_eq!(status.state, "unloaded");

        dispatcher
            .lifecycle()
            .load_model("/m/b.bin", ModelConfig::new())
            .await
            .unwrap();
        let status = dispatcher.status();
        assert!(status.model_loaded);
        assert_eq!(status.model_path.as_deref(), Some("/m/b.bin"));
        assert!(status.load_time.is_some());
        assert_eq!(status.state, "loaded");
    }
}
