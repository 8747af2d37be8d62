//! Outbound side of the message channel.

use lingai_types::WorkerResponse;
use log::{error, trace};
use tokio::sync::mpsc;

use crate::registry::{CorrelationRegistry, CorrelationToken};

#[derive(Debug, thiserror::Error)]
#[error("channel send failed: {0}")]
pub struct SendError(pub String);

/// Where responses go. Sends never block; delivery failures are reported, not retried.
pub trait Transport: Send + Sync {
    fn send(&self, response: WorkerResponse) -> Result<(), SendError>;

    /// The controlling side is gone and nothing sent will be read.
    fn is_closed(&self) -> bool;
}

/// Transport backed by an unbounded tokio channel.
///
/// The receiving half is drained by whatever owns the real pipe (the stdio
/// writer in the host binary, or a test).
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<WorkerResponse>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkerResponse>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Transport for ChannelTransport {
    fn send(&self, response: WorkerResponse) -> Result<(), SendError> {
        self.tx
            .send(response)
            .map_err(|_| SendError("receiver dropped".to_string()))
    }

    fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Send once and log a failure. Retrying could duplicate a response.
pub(crate) fn send_logged(transport: &dyn Transport, response: WorkerResponse) -> bool {
    let kind = response.kind;
    match transport.send(response) {
        Ok(()) => {
            trace!("[WORKER] Sent {kind:?}");
            true
        }
        Err(e) => {
            error!("[WORKER] ChannelSendFailure while sending {kind:?}: {e}");
            false
        }
    }
}

/// Pass a response through the registry gate, then send it.
///
/// Returns false when the registry dropped the response (request already
/// terminal) or the send failed.
pub(crate) fn deliver(
    transport: &dyn Transport,
    registry: &CorrelationRegistry,
    token: &CorrelationToken,
    response: WorkerResponse,
) -> bool {
    match registry.resolve(token, response) {
        Some(response) => send_logged(transport, response),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_transport_reports_closed_receiver() {
        let (transport, rx) = ChannelTransport::new();
        assert!(!transport.is_closed());
        assert!(transport.send(WorkerResponse::model_unloaded(None)).is_ok());

        drop(rx);
        assert!(transport.is_closed());
        assert!(transport.send(WorkerResponse::model_unloaded(None)).is_err());
        assert!(!send_logged(&transport, WorkerResponse::model_unloaded(None)));
    }
}
