//! Streaming response emission.
//!
//! Turns an engine fragment stream into `streamChunk` responses:
//! fragments become chunks `0..k-1`, then a completion chunk with index `k`,
//! empty content and aggregate usage. Any other ending is a single terminal
//! error, or silence when the host is gone.

use futures_util::StreamExt;
use lingai_engine::{ComputeEngine, FragmentStream};
use lingai_types::{StreamChunk, TokenUsage, WorkerResponse};
use log::{debug, warn};

use crate::error::WorkerError;
use crate::lifecycle::{LifecycleManager, ModelLease};
use crate::registry::{CorrelationRegistry, CorrelationToken};
use crate::transport::{deliver, Transport};

/// How a stream ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Completion chunk sent; `chunks` counts it.
    Completed { chunks: u64 },
    /// Terminal error sent after `chunks` content chunks.
    Failed { chunks: u64, error: WorkerError },
    /// Host went away; entry released without a terminal response.
    Abandoned { chunks: u64 },
}

pub struct StreamEmitter<'a> {
    registry: &'a CorrelationRegistry,
    transport: &'a dyn Transport,
    lifecycle: &'a LifecycleManager,
    engine: &'a dyn ComputeEngine,
}

impl<'a> StreamEmitter<'a> {
    pub fn new(
        registry: &'a CorrelationRegistry,
        transport: &'a dyn Transport,
        lifecycle: &'a LifecycleManager,
        engine: &'a dyn ComputeEngine,
    ) -> Self {
        Self {
            registry,
            transport,
            lifecycle,
            engine,
        }
    }

    pub async fn run(
        &self,
        token: &CorrelationToken,
        lease: &ModelLease,
        mut fragments: FragmentStream,
        prompt_tokens: u32,
    ) -> StreamOutcome {
        let correlation_id = token.correlation_id().map(str::to_string);
        let mut index: u64 = 0;
        let mut generated = String::new();

        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    return self.fail(token, index, WorkerError::Cancelled);
                }
                next = fragments.next() => next,
            };

            let fragment = match next {
                Some(Ok(fragment)) => fragment,
                Some(Err(e)) => {
                    warn!("[STREAM] Engine failed after {index} chunks: {e}");
                    return self.fail(token, index, e.into());
                }
                None => break,
            };

            if self.transport.is_closed() {
                return self.abandon(token, index);
            }
            if let Err(e) = self.lifecycle.revalidate(lease) {
                return self.fail(token, index, e);
            }

            generated.push_str(&fragment);
            let chunk = WorkerResponse::stream_chunk(
                correlation_id.clone(),
                StreamChunk::partial(fragment, index),
            );
            if !deliver(self.transport, self.registry, token, chunk) {
                return self.abandon(token, index);
            }
            index += 1;
        }

        let usage = TokenUsage::new(prompt_tokens, self.engine.count_tokens(&generated));
        let done = WorkerResponse::stream_chunk(correlation_id, StreamChunk::complete(index, usage));
        if deliver(self.transport, self.registry, token, done) {
            debug!(
                "[STREAM] {:?} complete: {} chunks, {} tokens",
                token.correlation_id(),
                index + 1,
                usage.total_tokens()
            );
            StreamOutcome::Completed { chunks: index + 1 }
        } else {
            StreamOutcome::Abandoned { chunks: index }
        }
    }

    fn fail(&self, token: &CorrelationToken, chunks: u64, error: WorkerError) -> StreamOutcome {
        let response = WorkerResponse::error(
            token.correlation_id().map(str::to_string),
            error.to_error_body(),
        );
        deliver(self.transport, self.registry, token, response);
        StreamOutcome::Failed { chunks, error }
    }

    fn abandon(&self, token: &CorrelationToken, chunks: u64) -> StreamOutcome {
        debug!(
            "[STREAM] Host gone, stopping {:?} after {chunks} chunks",
            token.correlation_id()
        );
        self.registry.sweep(token);
        StreamOutcome::Abandoned { chunks }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;
    use async_trait::async_trait;
    use lingai_config::LifecyclePolicy;
    use lingai_engine::{EngineError, ModelDetails};
    use lingai_types::{ErrorCode, ModelConfig, RequestKind};
    use std::sync::Arc;

    struct NullEngine;

    #[async_trait]
    impl ComputeEngine for NullEngine {
        async fn load(&self, _path: &str, _config: &ModelConfig) -> Result<ModelDetails, EngineError> {
            Ok(ModelDetails::default())
        }
        async fn unload(&self) -> Result<(), EngineError> {
            Ok(())
        }
        async fn infer(&self, _prompt: &str, _config: &ModelConfig) -> Result<String, EngineError> {
            Ok(String::new())
        }
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EngineError> {
            Ok(Vec::new())
        }
        async fn stream_infer(
            &self,
            _prompt: &str,
            _config: &ModelConfig,
        ) -> Result<FragmentStream, EngineError> {
            Ok(fragments(Vec::new()))
        }
    }

    fn fragments(items: Vec<Result<&'static str, EngineError>>) -> FragmentStream {
        Box::pin(futures_util::stream::iter(
            items.into_iter().map(|item| item.map(String::from)),
        ))
    }

    struct Fixture {
        registry: CorrelationRegistry,
        transport: ChannelTransport,
        rx: tokio::sync::mpsc::UnboundedReceiver<WorkerResponse>,
        lifecycle: LifecycleManager,
        engine: Arc<NullEngine>,
    }

    impl Fixture {
        async fn new() -> Self {
            let engine = Arc::new(NullEngine);
            let lifecycle = LifecycleManager::new(engine.clone(), LifecyclePolicy::Queue);
            lifecycle.load_model("m1", ModelConfig::new()).await.unwrap();
            let (transport, rx) = ChannelTransport::new();
            Self {
                registry: CorrelationRegistry::new(),
                transport,
                rx,
                lifecycle,
                engine,
            }
        }

        fn emitter(&self) -> StreamEmitter<'_> {
            StreamEmitter::new(
                &self.registry,
                &self.transport,
                &self.lifecycle,
                self.engine.as_ref(),
            )
        }

        fn drain(&mut self) -> Vec<WorkerResponse> {
            let mut out = Vec::new();
            while let Ok(response) = self.rx.try_recv() {
                out.push(response);
            }
            out
        }
    }

    #[tokio::test]
    async fn test_chunks_are_ordered_and_terminated() {
        let mut fx = Fixture::new().await;
        let token = fx.registry.register(Some("s1"), RequestKind::StreamInfer).unwrap();
        let lease = fx.lifecycle.lease().unwrap();

        let outcome = fx
            .emitter()
            .run(&token, &lease, fragments(vec![Ok("Hel"), Ok("lo"), Ok(" there")]), 1)
            .await;
        assert_eq!(outcome, StreamOutcome::Completed { chunks: 4 });

        let sent = fx.drain();
        let chunks: Vec<_> = sent.iter().map(|r| r.chunk().unwrap().clone()).collect();
        assert_eq!(chunks.iter().map(|c| c.index).collect::<Vec<_>>(), vec![0, 1, 2, 3]);
        assert_eq!(
            chunks.iter().filter(|c| c.is_complete).count(),
            1,
            "exactly one completion chunk"
        );
        assert!(chunks.last().unwrap().is_complete);
        let text: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(text, "Hello there");

        let usage = chunks.last().unwrap().usage.unwrap();
        assert_eq!(usage.prompt_tokens(), 1);
        assert_eq!(usage.completion_tokens(), 2);
        assert_eq!(usage.total_tokens(), 3);
        assert!(sent.iter().all(|r| r.correlation_id.as_deref() == Some("s1")));
        assert_eq!(fx.registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_empty_stream_sends_only_completion() {
        let mut fx = Fixture::new().await;
        let token = fx.registry.register(Some("e"), RequestKind::StreamInfer).unwrap();
        let lease = fx.lifecycle.lease().unwrap();

        let outcome = fx.emitter().run(&token, &lease, fragments(Vec::new()), 0).await;
        assert_eq!(outcome, StreamOutcome::Completed { chunks: 1 });
        let sent = fx.drain();
        assert_eq!(sent.len(), 1);
        let chunk = sent[0].chunk().unwrap();
        assert_eq!(chunk.index, 0);
        assert!(chunk.is_complete);
    }

    #[tokio::test]
    async fn test_engine_failure_mid_stream() {
        let mut fx = Fixture::new().await;
        let token = fx.registry.register(Some("f"), RequestKind::StreamInfer).unwrap();
        let lease = fx.lifecycle.lease().unwrap();

        let stream = fragments(vec![
            Ok("a"),
            Err(EngineError::new("DEVICE_LOST", "gpu went away")),
            Ok("never"),
        ]);
        let outcome = fx.emitter().run(&token, &lease, stream, 1).await;
        assert!(matches!(outcome, StreamOutcome::Failed { chunks: 1, .. }));

        let sent = fx.drain();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].chunk().unwrap().index, 0);
        assert_eq!(sent[1].error_code(), Some(ErrorCode::ComputeEngineFailure));
        assert_eq!(sent[1].error.as_ref().unwrap().message, "gpu went away");
        assert!(sent.iter().all(|r| r.chunk().map_or(true, |c| !c.is_complete)));
        assert_eq!(fx.registry.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_first_fragment() {
        let mut fx = Fixture::new().await;
        let token = fx.registry.register(Some("c"), RequestKind::StreamInfer).unwrap();
        let lease = fx.lifecycle.lease().unwrap();
        fx.registry.cancel("c");

        let outcome = fx
            .emitter()
            .run(&token, &lease, fragments(vec![Ok("a"), Ok("b")]), 1)
            .await;
        assert_eq!(
            outcome,
            StreamOutcome::Failed {
                chunks: 0,
                error: WorkerError::Cancelled
            }
        );
        let sent = fx.drain();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].error_code(), Some(ErrorCode::Cancelled));
    }

    #[tokio::test]
    async fn test_unload_mid_stream_ends_with_model_not_loaded() {
        let mut fx = Fixture::new().await;
        let token = fx.registry.register(Some("u"), RequestKind::StreamInfer).unwrap();
        let lease = fx.lifecycle.lease().unwrap();
        fx.lifecycle.unload_model().await.unwrap();

        let outcome = fx.emitter().run(&token, &lease, fragments(vec![Ok("a")]), 1).await;
        assert!(matches!(
            outcome,
            StreamOutcome::Failed {
                error: WorkerError::ModelChanged,
                ..
            }
        ));
        assert_eq!(fx.drain()[0].error_code(), Some(ErrorCode::ModelNotLoaded));
    }

    #[tokio::test]
    async fn test_closed_transport_abandons_and_releases() {
        let fx = Fixture::new().await;
        let Fixture {
            registry,
            transport,
            rx,
            lifecycle,
            engine,
        } = fx;
        drop(rx);

        let token = registry.register(Some("gone"), RequestKind::StreamInfer).unwrap();
        let lease = lifecycle.lease().unwrap();
        let emitter = StreamEmitter::new(&registry, &transport, &lifecycle, engine.as_ref());
        let outcome = emitter
            .run(&token, &lease, fragments(vec![Ok("a"), Ok("b")]), 1)
            .await;

        assert_eq!(outcome, StreamOutcome::Abandoned { chunks: 0 });
        assert_eq!(registry.in_flight(), 0);
    }
}
