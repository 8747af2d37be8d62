//! Wire protocol types shared by the LingAI worker and its hosts.
//!
//! Messages travel as one JSON object per frame. Inbound frames are decoded
//! loosely into [`InboundMessage`] and then validated into a typed
//! [`Request`]; outbound frames are always a [`WorkerResponse`].

pub mod request;
pub mod response;
pub mod stream;

pub use request::{InboundMessage, ModelConfig, ProtocolError, Request, RequestCommand, RequestKind};
pub use response::{
    EmbedResult, ErrorBody, ErrorCode, InferResult, LoadInfo, ResponseData, ResponseKind,
    WorkerResponse, WorkerStatus,
};
pub use stream::{StreamChunk, TokenUsage};

/// Finish reason reported for generations that ran to the end of their output.
pub const FINISH_REASON_STOP: &str = "stop";
