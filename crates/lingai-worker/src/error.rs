use lingai_engine::EngineError;
use lingai_types::{ErrorBody, ErrorCode, ProtocolError};

/// Everything that can end a request unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("correlation id `{0}` is already in flight")]
    DuplicateCorrelationId(String),
    #[error("streaming requests require a correlation id")]
    MissingStreamCorrelationId,
    #[error("model not loaded")]
    ModelNotLoaded,
    #[error("model was unloaded or replaced while the request was running")]
    ModelChanged,
    #[error("a model load or unload is already in progress")]
    ConcurrentLifecycleOperation,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("request cancelled")]
    Cancelled,
}

impl WorkerError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Protocol(e) => e.code(),
            Self::DuplicateCorrelationId(_) | Self::MissingStreamCorrelationId => {
                ErrorCode::ValidationError
            }
            Self::ModelNotLoaded | Self::ModelChanged => ErrorCode::ModelNotLoaded,
            Self::ConcurrentLifecycleOperation => ErrorCode::ConcurrentLifecycleOperation,
            Self::Engine(_) => ErrorCode::ComputeEngineFailure,
            Self::Cancelled => ErrorCode::Cancelled,
        }
    }

    pub fn to_error_body(&self) -> ErrorBody {
        let body = ErrorBody::new(self.code(), self.to_string());
        match self {
            Self::Engine(e) => body.with_engine_code(e.code.clone()),
            _ => body,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lingai_types::RequestKind;

    #[test]
    fn test_engine_failure_is_verbatim() {
        let err = WorkerError::from(EngineError::new("OOM", "allocation of 4GiB failed"));
        let body = err.to_error_body();
        assert_eq!(body.code, ErrorCode::ComputeEngineFailure);
        assert_eq!(body.message, "allocation of 4GiB failed");
        assert_eq!(body.engine_code.as_deref(), Some("OOM"));
    }

    #[test]
    fn test_codes() {
        let missing = WorkerError::from(ProtocolError::MissingField {
            kind: RequestKind::LoadModel,
            field: "modelPath",
        });
        assert_eq!(missing.code(), ErrorCode::ValidationError);
        assert_eq!(
            WorkerError::from(ProtocolError::UnknownKind("x".into())).code(),
            ErrorCode::UnknownMessageKind
        );
        assert_eq!(WorkerError::ModelChanged.code(), ErrorCode::ModelNotLoaded);
        assert_eq!(
            WorkerError::MissingStreamCorrelationId.code(),
            ErrorCode::ValidationError
        );
        assert!(WorkerError::Cancelled.to_error_body().engine_code.is_none());
    }
}
