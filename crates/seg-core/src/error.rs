//! Top-level error taxonomy: maps every subsystem error onto one of the
//! seven wire error codes, kept as the single source of truth so the
//! dispatch table and the `error` envelope encoder cannot drift apart.

use crate::codec::CodecError;
use crate::inference::InferenceError;
use crate::model_pool::ModelPoolError;
use crate::renderer::RenderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    MalformedFrame,
    InferenceFailed,
    OutOfMemory,
    ModeChangeFailed,
    VizUpdateFailed,
    StatsFailed,
    EncodeFailed,
}

impl ErrorKind {
    pub fn wire_code(self) -> &'static str {
        match self {
            Self::MalformedFrame => "MALFORMED_FRAME",
            Self::InferenceFailed => "INFERENCE_FAILED",
            Self::OutOfMemory => "OUT_OF_MEMORY",
            Self::ModeChangeFailed => "MODE_CHANGE_FAILED",
            Self::VizUpdateFailed => "VIZ_UPDATE_FAILED",
            Self::StatsFailed => "STATS_FAILED",
            Self::EncodeFailed => "ENCODE_FAILED",
        }
    }

    /// All seven error kinds are recoverable at the session level per the
    /// wire protocol; the session stays open and the client may retry.
    pub fn recoverable(self) -> bool {
        true
    }
}

impl From<&CodecError> for ErrorKind {
    fn from(e: &CodecError) -> Self {
        match e {
            CodecError::EncodeFailed(_) => Self::EncodeFailed,
            _ => Self::MalformedFrame,
        }
    }
}

impl From<&RenderError> for ErrorKind {
    fn from(_: &RenderError) -> Self {
        Self::InferenceFailed
    }
}

impl From<&ModelPoolError> for ErrorKind {
    fn from(e: &ModelPoolError) -> Self {
        match e {
            ModelPoolError::NoLoader(_) => Self::ModeChangeFailed,
            ModelPoolError::LoadFailed(_, _) => Self::ModeChangeFailed,
            ModelPoolError::ForwardFailed(msg) if msg.to_lowercase().contains("memory") => Self::OutOfMemory,
            ModelPoolError::ForwardFailed(_) => Self::InferenceFailed,
        }
    }
}

impl From<&InferenceError> for ErrorKind {
    fn from(e: &InferenceError) -> Self {
        match e {
            InferenceError::Pool(inner) => inner.into(),
            InferenceError::Codec(inner) => inner.into(),
            InferenceError::UnexpectedOutputShape { .. } => Self::InferenceFailed,
            InferenceError::OutOfMemory(_) => Self::OutOfMemory,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_failure_maps_to_encode_failed_code() {
        let io_err = image::ImageError::IoError(std::io::Error::new(std::io::ErrorKind::Other, "disk full"));
        let e = CodecError::EncodeFailed(io_err);
        assert_eq!(ErrorKind::from(&e).wire_code(), "ENCODE_FAILED");
    }

    #[test]
    fn empty_payload_maps_to_malformed_frame() {
        let e = CodecError::EmptyPayload;
        assert_eq!(ErrorKind::from(&e).wire_code(), "MALFORMED_FRAME");
    }

    #[test]
    fn no_loader_maps_to_mode_change_failed() {
        let e = ModelPoolError::NoLoader(crate::inference::ModelMode::Sota);
        assert_eq!(ErrorKind::from(&e).wire_code(), "MODE_CHANGE_FAILED");
    }

    #[test]
    fn out_of_memory_forward_failure_is_distinguished_from_generic_inference_failure() {
        let oom = ModelPoolError::ForwardFailed("CUDA out of memory".into());
        let generic = ModelPoolError::ForwardFailed("bad tensor layout".into());
        assert_eq!(ErrorKind::from(&oom).wire_code(), "OUT_OF_MEMORY");
        assert_eq!(ErrorKind::from(&generic).wire_code(), "INFERENCE_FAILED");
    }

    #[test]
    fn all_kinds_are_recoverable() {
        for kind in [
            ErrorKind::MalformedFrame,
            ErrorKind::InferenceFailed,
            ErrorKind::OutOfMemory,
            ErrorKind::ModeChangeFailed,
            ErrorKind::VizUpdateFailed,
            ErrorKind::StatsFailed,
            ErrorKind::EncodeFailed,
        ] {
            assert!(kind.recoverable());
        }
    }
}
