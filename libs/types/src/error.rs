//! Error Types
//!
//! Every failure in the coordination core is recoverable by the caller: it is
//! either returned as a `CoreError` or travels as the `error` field of a
//! response envelope. [`ErrorCode`] is the wire side of that taxonomy.

use crate::address::ActorId;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

/// Wire error codes carried by response envelopes
///
/// Applications may use codes outside this enum; they surface as
/// [`CoreError::Remote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum ErrorCode {
    Success = 0,

    // Dispatch
    UnknownMessageType = 110_001,
    MessageTypeMismatch = 110_002,
    HandlerFailure = 110_003,
    NotFoundActor = 110_004,

    // RPC
    RpcFail = 110_101,
    RpcTimeout = 110_102,
    RpcCancelled = 110_103,
    PeerDisconnected = 110_104,

    // Location
    DuplicateKey = 110_201,
    KeyNotFound = 110_202,
    LockMismatch = 110_203,
    LockLeaseExpired = 110_204,
    LockTimeout = 110_205,
}

/// Coordination core error
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// No handler registered for the opcode
    #[error("Unknown message type: opcode {opcode}")]
    UnknownMessageType { opcode: u16 },

    /// Payload did not decode as the type registered for its opcode
    #[error("Message type mismatch: opcode {opcode} expected {expected}: {message}")]
    MessageTypeMismatch {
        opcode: u16,
        expected: &'static str,
        message: String,
    },

    /// Handler returned an error or panicked
    #[error("Handler failure: {message}")]
    HandlerFailure { message: String },

    /// Target entity has no mailbox on the receiving fiber
    #[error("Actor not found: {actor}")]
    NotFoundActor { actor: ActorId },

    #[error("RPC {rpc_id} timed out after {timeout_ms}ms")]
    RpcTimeout { rpc_id: i32, timeout_ms: u64 },

    #[error("RPC {rpc_id} cancelled")]
    RpcCancelled { rpc_id: i32 },

    /// Call could not be delivered or its completion was lost
    #[error("RPC failed: {message}")]
    RpcFail { message: String },

    #[error("Peer process {process} disconnected")]
    PeerDisconnected { process: u16 },

    #[error("Location key {key} already registered")]
    DuplicateKey { key: u64 },

    #[error("Location key {key} not found")]
    KeyNotFound { key: u64 },

    #[error("Lock mismatch on key {key}: {message}")]
    LockMismatch { key: u64, message: String },

    #[error("Lock lease on key {key} expired")]
    LockLeaseExpired { key: u64 },

    #[error("Coroutine lock ({lock_type}, {key}) not acquired within {timeout_ms}ms")]
    LockTimeout {
        lock_type: u32,
        key: u64,
        timeout_ms: u64,
    },

    /// Envelope or payload encoding failure
    #[error("Codec error: {message}")]
    Codec { message: String },

    #[error("Transport error: {message}")]
    Transport {
        message: String,
        target: Option<ActorId>,
    },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// Error code reported by the remote side of a call
    #[error("Remote error {code}: {text}")]
    Remote { code: i32, text: String },
}

/// Result type alias for coordination operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn handler_failure(message: impl Into<String>) -> Self {
        Self::HandlerFailure {
            message: message.into(),
        }
    }

    pub fn rpc_fail(message: impl Into<String>) -> Self {
        Self::RpcFail {
            message: message.into(),
        }
    }

    pub fn lock_mismatch(key: u64, message: impl Into<String>) -> Self {
        Self::LockMismatch {
            key,
            message: message.into(),
        }
    }

    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>, target: Option<ActorId>) -> Self {
        Self::Transport {
            message: message.into(),
            target,
        }
    }

    pub fn configuration(message: impl Into<String>, field: Option<&str>) -> Self {
        Self::Configuration {
            message: message.into(),
            field: field.map(|s| s.to_string()),
        }
    }

    /// Rebuild an error from a failed response
    ///
    /// Codes generated by the local correlation table keep their structured
    /// form; everything else becomes [`CoreError::Remote`] so callers that know
    /// the request context can refine it.
    pub fn from_response(rpc_id: i32, code: i32, text: impl Into<String>) -> Self {
        let text = text.into();
        match ErrorCode::try_from(code) {
            Ok(ErrorCode::RpcCancelled) => Self::RpcCancelled { rpc_id },
            Ok(ErrorCode::RpcFail) => Self::RpcFail { message: text },
            Ok(ErrorCode::HandlerFailure) => Self::HandlerFailure { message: text },
            _ => Self::Remote { code, text },
        }
    }

    /// Wire error code for this error
    pub fn error_code(&self) -> i32 {
        let code = match self {
            CoreError::UnknownMessageType { .. } => ErrorCode::UnknownMessageType,
            CoreError::MessageTypeMismatch { .. } => ErrorCode::MessageTypeMismatch,
            CoreError::HandlerFailure { .. } => ErrorCode::HandlerFailure,
            CoreError::NotFoundActor { .. } => ErrorCode::NotFoundActor,
            CoreError::RpcTimeout { .. } => ErrorCode::RpcTimeout,
            CoreError::RpcCancelled { .. } => ErrorCode::RpcCancelled,
            CoreError::RpcFail { .. } => ErrorCode::RpcFail,
            CoreError::PeerDisconnected { .. } => ErrorCode::PeerDisconnected,
            CoreError::DuplicateKey { .. } => ErrorCode::DuplicateKey,
            CoreError::KeyNotFound { .. } => ErrorCode::KeyNotFound,
            CoreError::LockMismatch { .. } => ErrorCode::LockMismatch,
            CoreError::LockLeaseExpired { .. } => ErrorCode::LockLeaseExpired,
            CoreError::LockTimeout { .. } => ErrorCode::LockTimeout,
            CoreError::Codec { .. } | CoreError::Transport { .. } => ErrorCode::RpcFail,
            CoreError::Configuration { .. } => ErrorCode::HandlerFailure,
            CoreError::Remote { code, .. } => return *code,
        };
        code.into()
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::RpcTimeout { .. } => true,
            CoreError::RpcFail { .. } => true,
            CoreError::PeerDisconnected { .. } => true,
            CoreError::NotFoundActor { .. } => true,
            CoreError::LockTimeout { .. } => true,
            CoreError::LockLeaseExpired { .. } => true,
            CoreError::Transport { .. } => true,
            CoreError::Remote { code, .. } => {
                matches!(
                    ErrorCode::try_from(*code),
                    Ok(ErrorCode::NotFoundActor | ErrorCode::LockTimeout)
                )
            }
            _ => false,
        }
    }

    /// Error category for metrics and log fields
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::UnknownMessageType { .. }
            | CoreError::MessageTypeMismatch { .. }
            | CoreError::HandlerFailure { .. }
            | CoreError::NotFoundActor { .. } => "dispatch",
            CoreError::RpcTimeout { .. }
            | CoreError::RpcCancelled { .. }
            | CoreError::RpcFail { .. }
            | CoreError::PeerDisconnected { .. } => "rpc",
            CoreError::DuplicateKey { .. }
            | CoreError::KeyNotFound { .. }
            | CoreError::LockMismatch { .. }
            | CoreError::LockLeaseExpired { .. } => "location",
            CoreError::LockTimeout { .. } => "lock",
            CoreError::Codec { .. } => "codec",
            CoreError::Transport { .. } => "transport",
            CoreError::Configuration { .. } => "configuration",
            CoreError::Remote { .. } => "remote",
        }
    }
}

impl From<std::io::Error> for CoreError {
    fn from(error: std::io::Error) -> Self {
        CoreError::transport(error.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_round_trip_through_i32() {
        let code: i32 = ErrorCode::LockMismatch.into();
        assert_eq!(code, 110_203);
        assert_eq!(ErrorCode::try_from(code).ok(), Some(ErrorCode::LockMismatch));
        assert!(ErrorCode::try_from(42).is_err());
    }

    #[test]
    fn test_error_code_mapping() {
        assert_eq!(
            CoreError::DuplicateKey { key: 1 }.error_code(),
            i32::from(ErrorCode::DuplicateKey)
        );
        assert_eq!(
            CoreError::Remote { code: 7, text: String::new() }.error_code(),
            7
        );
    }

    #[test]
    fn test_from_response() {
        assert_eq!(
            CoreError::from_response(4, ErrorCode::RpcCancelled.into(), ""),
            CoreError::RpcCancelled { rpc_id: 4 }
        );
        assert_eq!(
            CoreError::from_response(4, ErrorCode::HandlerFailure.into(), "boom"),
            CoreError::handler_failure("boom")
        );
        match CoreError::from_response(4, ErrorCode::DuplicateKey.into(), "dup") {
            CoreError::Remote { code, text } => {
                assert_eq!(code, i32::from(ErrorCode::DuplicateKey));
                assert_eq!(text, "dup");
            }
            other => panic!("Expected Remote error, got {:?}", other),
        }
    }

    #[test]
    fn test_categories_and_retry() {
        assert_eq!(CoreError::LockLeaseExpired { key: 1 }.category(), "location");
        assert_eq!(CoreError::rpc_fail("x").category(), "rpc");
        assert!(CoreError::RpcTimeout { rpc_id: 1, timeout_ms: 10 }.is_retryable());
        assert!(!CoreError::DuplicateKey { key: 1 }.is_retryable());
        assert!(!CoreError::configuration("bad", Some("process.id")).is_retryable());
    }

    #[test]
    fn test_display() {
        let err = CoreError::LockTimeout {
            lock_type: 1,
            key: 9,
            timeout_ms: 50,
        };
        assert_eq!(err.to_string(), "Coroutine lock (1, 9) not acquired within 50ms");
    }
}
