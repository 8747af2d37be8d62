//! Outbound messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::stream::{StreamChunk, TokenUsage};

/// Response sent from the worker to its host.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResponse {
    pub kind: ResponseKind,
    /// Echo of the originating request's id, verbatim.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ResponseKind {
    ModelLoaded,
    ModelUnloaded,
    #[serde(rename = "inferenceResult")]
    InferResult,
    #[serde(rename = "embeddingResult")]
    EmbedResult,
    StreamChunk,
    Status,
    Error,
}

/// Kind-specific payload carried in `data`.
///
/// Variant order matters for decoding: each variant's required fields are not
/// a subset of any variant listed after it.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ResponseData {
    Chunk(StreamChunk),
    Infer(InferResult),
    Embed(EmbedResult),
    Status(WorkerStatus),
    Loaded(LoadInfo),
}

/// Stable error codes exposed to hosts.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    ValidationError,
    ModelNotLoaded,
    ConcurrentLifecycleOperation,
    ComputeEngineFailure,
    UnknownMessageKind,
    Cancelled,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ValidationError => "ValidationError",
            Self::ModelNotLoaded => "ModelNotLoaded",
            Self::ConcurrentLifecycleOperation => "ConcurrentLifecycleOperation",
            Self::ComputeEngineFailure => "ComputeEngineFailure",
            Self::UnknownMessageKind => "UnknownMessageKind",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    /// Engine-specific code, only set for `ComputeEngineFailure`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_code: Option<String>,
}

impl ErrorBody {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            engine_code: None,
        }
    }

    pub fn with_engine_code(mut self, engine_code: impl Into<String>) -> Self {
        self.engine_code = Some(engine_code.into());
        self
    }
}

/// Result of a successful model load.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LoadInfo {
    pub model_path: String,
    /// Unix timestamp in milliseconds.
    pub load_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding_dimensions: Option<usize>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InferResult {
    pub content: String,
    pub finish_reason: String,
    pub usage: TokenUsage,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EmbedResult {
    pub embedding: Vec<f32>,
    pub dimensions: usize,
}

impl EmbedResult {
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            dimensions: embedding.len(),
            embedding,
        }
    }
}

/// Read-only snapshot of the worker.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerStatus {
    pub model_loaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    /// Unix timestamp in milliseconds of the current load.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_time: Option<i64>,
    /// Milliseconds since the current model was loaded, 0 without a model.
    pub uptime: u64,
    /// Lifecycle state name: `unloaded`, `loading`, `loaded` or `unloading`.
    pub state: String,
    pub in_flight: usize,
}

impl WorkerResponse {
    fn ok(kind: ResponseKind, correlation_id: Option<String>, data: Option<ResponseData>) -> Self {
        Self {
            kind,
            correlation_id,
            success: true,
            data,
            error: None,
        }
    }

    pub fn model_loaded(correlation_id: Option<String>, info: LoadInfo) -> Self {
        Self::ok(
            ResponseKind::ModelLoaded,
            correlation_id,
            Some(ResponseData::Loaded(info)),
        )
    }

    pub fn model_unloaded(correlation_id: Option<String>) -> Self {
        Self::ok(ResponseKind::ModelUnloaded, correlation_id, None)
    }

    pub fn infer_result(correlation_id: Option<String>, result: InferResult) -> Self {
        Self::ok(
            ResponseKind::InferResult,
            correlation_id,
            Some(ResponseData::Infer(result)),
        )
    }

    pub fn embed_result(correlation_id: Option<String>, result: EmbedResult) -> Self {
        Self::ok(
            ResponseKind::EmbedResult,
            correlation_id,
            Some(ResponseData::Embed(result)),
        )
    }

    pub fn stream_chunk(correlation_id: Option<String>, chunk: StreamChunk) -> Self {
        Self::ok(
            ResponseKind::StreamChunk,
            correlation_id,
            Some(ResponseData::Chunk(chunk)),
        )
    }

    pub fn status(correlation_id: Option<String>, status: WorkerStatus) -> Self {
        Self::ok(
            ResponseKind::Status,
            correlation_id,
            Some(ResponseData::Status(status)),
        )
    }

    pub fn error(correlation_id: Option<String>, error: ErrorBody) -> Self {
        Self {
            kind: ResponseKind::Error,
            correlation_id,
            success: false,
            data: None,
            error: Some(error),
        }
    }

    /// Whether this is the last message for its correlation id.
    ///
    /// Everything is terminal except a stream chunk that is not the completion marker.
    pub fn is_terminal(&self) -> bool {
        match self.chunk() {
            Some(chunk) => chunk.is_complete,
            None => self.kind != ResponseKind::StreamChunk,
        }
    }

    pub fn chunk(&self) -> Option<&StreamChunk> {
        match &self.data {
            Some(ResponseData::Chunk(chunk)) => Some(chunk),
            _ => None,
        }
    }

    pub fn error_code(&self) -> Option<ErrorCode> {
        self.error.as_ref().map(|e| e.code)
    }
}
