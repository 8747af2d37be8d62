//! Inbound messages and their validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::response::ErrorCode;

/// Raw inbound frame as it arrives on the channel.
///
/// Every field except `kind` is optional here; which ones are required depends
/// on the kind and is checked by [`InboundMessage::into_request`]. Unused fields
/// are ignored. `type` and `id` are accepted as aliases for older hosts.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InboundMessage {
    #[serde(alias = "type")]
    pub kind: String,
    #[serde(default, alias = "id", skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<ModelConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

/// Kinds of request the worker understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    LoadModel,
    UnloadModel,
    Infer,
    Embed,
    StreamInfer,
    /// Snapshot of the worker state, answered with a `status` response.
    GetStatus,
    /// Cancel the in-flight request carrying the same correlation id.
    Cancel,
}

impl RequestKind {
    /// Parse the wire spelling of a kind.
    pub fn from_wire(kind: &str) -> Option<Self> {
        match kind {
            "loadModel" => Some(Self::LoadModel),
            "unloadModel" => Some(Self::UnloadModel),
            "inference" => Some(Self::Infer),
            "embedding" => Some(Self::Embed),
            "streamInference" => Some(Self::StreamInfer),
            "getStatus" => Some(Self::GetStatus),
            "cancel" => Some(Self::Cancel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoadModel => "loadModel",
            Self::UnloadModel => "unloadModel",
            Self::Infer => "inference",
            Self::Embed => "embedding",
            Self::StreamInfer => "streamInference",
            Self::GetStatus => "getStatus",
            Self::Cancel => "cancel",
        }
    }

    /// Load and unload are the only kinds allowed to change model state.
    pub fn is_lifecycle(self) -> bool {
        matches!(self, Self::LoadModel | Self::UnloadModel)
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated request.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub correlation_id: Option<String>,
    pub command: RequestCommand,
}

impl Request {
    pub fn kind(&self) -> RequestKind {
        self.command.kind()
    }
}

/// Kind-specific payload of a validated request.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestCommand {
    LoadModel { model_path: String, config: ModelConfig },
    UnloadModel,
    Infer { prompt: String, config: ModelConfig },
    Embed { text: String },
    StreamInfer { prompt: String, config: ModelConfig },
    GetStatus,
    Cancel,
}

impl RequestCommand {
    pub fn kind(&self) -> RequestKind {
        match self {
            Self::LoadModel { .. } => RequestKind::LoadModel,
            Self::UnloadModel => RequestKind::UnloadModel,
            Self::Infer { .. } => RequestKind::Infer,
            Self::Embed { .. } => RequestKind::Embed,
            Self::StreamInfer { .. } => RequestKind::StreamInfer,
            Self::GetStatus => RequestKind::GetStatus,
            Self::Cancel => RequestKind::Cancel,
        }
    }
}

/// Reasons an inbound frame cannot become a [`Request`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("missing required field `{field}` for {kind} request")]
    MissingField {
        kind: RequestKind,
        field: &'static str,
    },
    #[error("unknown message kind: {0}")]
    UnknownKind(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}

impl ProtocolError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::UnknownKind(_) => ErrorCode::UnknownMessageKind,
            Self::MissingField { .. } | Self::Malformed(_) => ErrorCode::ValidationError,
        }
    }
}

impl InboundMessage {
    /// Decode a single JSON frame.
    pub fn parse(frame: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(frame).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    /// Correlation id of a frame that failed [`InboundMessage::parse`], if the
    /// frame is a JSON object with a string `correlationId` (or `id`).
    pub fn correlation_id_of(frame: &str) -> Option<String> {
        let value: Value = serde_json::from_str(frame).ok()?;
        ["correlationId", "id"]
            .into_iter()
            .find_map(|key| value.get(key)?.as_str().map(str::to_string))
    }

    /// Check the fields required by this message's kind and build the typed request.
    ///
    /// Empty strings count as missing.
    pub fn into_request(self) -> Result<Request, ProtocolError> {
        let kind = RequestKind::from_wire(&self.kind)
            .ok_or_else(|| ProtocolError::UnknownKind(self.kind.clone()))?;
        let config = self.config.unwrap_or_default();

        let command = match kind {
            RequestKind::LoadModel => RequestCommand::LoadModel {
                model_path: required(kind, "modelPath", self.model_path)?,
                config,
            },
            RequestKind::UnloadModel => RequestCommand::UnloadModel,
            RequestKind::Infer => RequestCommand::Infer {
                prompt: required(kind, "prompt", self.prompt)?,
                config,
            },
            RequestKind::Embed => RequestCommand::Embed {
                text: required(kind, "text", self.text)?,
            },
            RequestKind::StreamInfer => RequestCommand::StreamInfer {
                prompt: required(kind, "prompt", self.prompt)?,
                config,
            },
            RequestKind::GetStatus => RequestCommand::GetStatus,
            RequestKind::Cancel => {
                if self.correlation_id.as_deref().map_or(true, str::is_empty) {
                    return Err(ProtocolError::MissingField {
                        kind,
                        field: "correlationId",
                    });
                }
                RequestCommand::Cancel
            }
        };

        Ok(Request {
            correlation_id: self.correlation_id,
            command,
        })
    }
}

fn required(
    kind: RequestKind,
    field: &'static str,
    value: Option<String>,
) -> Result<String, ProtocolError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ProtocolError::MissingField { kind, field }),
    }
}

/// Free-form model/generation options passed through to the compute engine.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(transparent)]
pub struct ModelConfig(Map<String, Value>);

impl ModelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Layer per-request options over the options the model was loaded with.
    pub fn merged(&self, overrides: &ModelConfig) -> ModelConfig {
        let mut merged = self.0.clone();
        for (key, value) in &overrides.0 {
            merged.insert(key.clone(), value.clone());
        }
        ModelConfig(merged)
    }
}

impl From<Map<String, Value>> for ModelConfig {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_load_model() {
        let msg = InboundMessage::parse(
            r#"{"kind":"loadModel","correlationId":"a1","modelPath":"m1","config":{"threads":4}}"#,
        )
        .unwrap();
        let request = msg.into_request().unwrap();
        assert_eq!(request.correlation_id.as_deref(), Some("a1"));
        match request.command {
            RequestCommand::LoadModel { model_path, config } => {
                assert_eq!(model_path, "m1");
                assert_eq!(config.get_u64("threads"), Some(4));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_legacy_aliases() {
        let msg = InboundMessage::parse(r#"{"type":"inference","id":"x","prompt":"hi"}"#).unwrap();
        assert_eq!(msg.kind, "inference");
        assert_eq!(msg.correlation_id.as_deref(), Some("x"));
    }

    #[test]
    fn test_unused_fields_ignored() {
        let msg = InboundMessage::parse(
            r#"{"kind":"unloadModel","prompt":"ignored","somethingElse":true}"#,
        )
        .unwrap();
        assert_eq!(msg.into_request().unwrap().command, RequestCommand::UnloadModel);
    }

    #[test]
    fn test_missing_prompt() {
        let msg = InboundMessage {
            kind: "inference".into(),
            correlation_id: Some("c".into()),
            ..Default::default()
        };
        let err = msg.into_request().unwrap_err();
        assert_eq!(
            err,
            ProtocolError::MissingField {
                kind: RequestKind::Infer,
                field: "prompt"
            }
        );
        assert_eq!(err.code(), ErrorCode::ValidationError);
    }

    #[test]
    fn test_empty_model_path_is_missing() {
        let msg = InboundMessage {
            kind: "loadModel".into(),
            model_path: Some(String::new()),
            ..Default::default()
        };
        assert!(matches!(
            msg.into_request(),
            Err(ProtocolError::MissingField { field: "modelPath", .. })
        ));
    }

    #[test]
    fn test_embed_requires_text() {
        let msg = InboundMessage {
            kind: "embedding".into(),
            prompt: Some("not text".into()),
            ..Default::default()
        };
        assert!(matches!(
            msg.into_request(),
            Err(ProtocolError::MissingField { field: "text", .. })
        ));
    }

    #[test]
    fn test_cancel_requires_correlation_id() {
        let msg = InboundMessage {
            kind: "cancel".into(),
            ..Default::default()
        };
        assert!(matches!(
            msg.into_request(),
            Err(ProtocolError::MissingField { field: "correlationId", .. })
        ));
    }

    #[test]
    fn test_unknown_kind() {
        let msg = InboundMessage {
            kind: "reticulateSplines".into(),
            ..Default::default()
        };
        let err = msg.into_request().unwrap_err();
        assert_eq!(err, ProtocolError::UnknownKind("reticulateSplines".into()));
        assert_eq!(err.code(), ErrorCode::UnknownMessageKind);
    }

    #[test]
    fn test_malformed_frame() {
        let err = InboundMessage::parse("{not json").unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
        let err = InboundMessage::parse(r#"{"correlationId":"no-kind"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_correlation_id_survives_bad_fields() {
        for (frame, id) in [
            (r#"{"kind":"inference","correlationId":"c7","prompt":42}"#, "c7"),
            (r#"{"correlationId":"c8","prompt":"hi"}"#, "c8"),
            (r#"{"kind":"loadModel","correlationId":"c9","modelPath":"m","config":"fast"}"#, "c9"),
            (r#"{"type":"embedding","id":"c10","text":[1,2]}"#, "c10"),
        ] {
            assert!(InboundMessage::parse(frame).is_err(), "{frame}");
            assert_eq!(InboundMessage::correlation_id_of(frame).as_deref(), Some(id));
        }
        assert_eq!(InboundMessage::correlation_id_of("{not json"), None);
        assert_eq!(InboundMessage::correlation_id_of(r#"{"correlationId":7}"#), None);
        assert_eq!(InboundMessage::correlation_id_of(r#"["c1"]"#), None);
    }

    #[test]
    fn test_config_merge_prefers_overrides() {
        let base = ModelConfig::new().with("temperature", 0.7).with("maxTokens", 64);
        let overrides = ModelConfig::new().with("maxTokens", 8);
        let merged = base.merged(&overrides);
        assert_eq!(merged.get_u64("maxTokens"), Some(8));
        assert_eq!(merged.get_f64("temperature"), Some(0.7));
    }

    #[test]
    fn test_kind_wire_names() {
        for kind in [
            RequestKind::LoadModel,
            RequestKind::UnloadModel,
            RequestKind::Infer,
            RequestKind::Embed,
            RequestKind::StreamInfer,
            RequestKind::GetStatus,
            RequestKind::Cancel,
        ] {
            assert_eq!(RequestKind::from_wire(kind.as_str()), Some(kind));
        }
        assert!(RequestKind::LoadModel.is_lifecycle());
        assert!(RequestKind::UnloadModel.is_lifecycle());
        assert!(!RequestKind::StreamInfer.is_lifecycle());
    }
}
