//! Envelope Contracts
//!
//! Three kinds of traffic move between fibers:
//!
//! - **Message**: fire-and-forget
//! - **Request**: carries an `rpc_id` chosen by the sender's correlation table
//! - **Response**: echoes the `rpc_id` and adds an error code plus text
//!
//! Payloads are opaque bytes at this layer; the typed contracts below tie a
//! Rust type to the opcode that routes it.

use crate::address::ActorId;
use crate::error::ErrorCode;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Typed payload routed by opcode
pub trait ActorMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Wire discriminator, unique per fiber dispatcher
    const OPCODE: u16;
}

/// Payload that expects a reply of type [`ActorRequest::Response`]
pub trait ActorRequest: ActorMessage {
    type Response: ActorMessage;
}

/// Discriminates the three traffic kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvelopeKind {
    Message,
    Request { rpc_id: i32 },
    Response { rpc_id: i32, error: i32, text: String },
}

/// Unit of traffic handed to the transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Entity the envelope is addressed to
    pub target: ActorId,
    pub opcode: u16,
    pub kind: EnvelopeKind,
    pub payload: Bytes,
}

impl Envelope {
    pub fn message(target: ActorId, opcode: u16, payload: Bytes) -> Self {
        Self {
            target,
            opcode,
            kind: EnvelopeKind::Message,
            payload,
        }
    }

    pub fn request(target: ActorId, opcode: u16, rpc_id: i32, payload: Bytes) -> Self {
        Self {
            target,
            opcode,
            kind: EnvelopeKind::Request { rpc_id },
            payload,
        }
    }

    pub fn response(
        target: ActorId,
        opcode: u16,
        rpc_id: i32,
        error: i32,
        text: impl Into<String>,
        payload: Bytes,
    ) -> Self {
        Self {
            target,
            opcode,
            kind: EnvelopeKind::Response {
                rpc_id,
                error,
                text: text.into(),
            },
            payload,
        }
    }

    /// Correlation id for requests and responses
    pub fn rpc_id(&self) -> Option<i32> {
        match &self.kind {
            EnvelopeKind::Message => None,
            EnvelopeKind::Request { rpc_id } | EnvelopeKind::Response { rpc_id, .. } => Some(*rpc_id),
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Request { .. })
    }

    pub fn is_response(&self) -> bool {
        matches!(self.kind, EnvelopeKind::Response { .. })
    }

    /// Split a response envelope into the form the correlation table consumes
    pub fn into_raw_response(self) -> Option<RawResponse> {
        match self.kind {
            EnvelopeKind::Response { rpc_id, error, text } => Some(RawResponse {
                rpc_id,
                opcode: self.opcode,
                error,
                text,
                payload: self.payload,
            }),
            _ => None,
        }
    }
}

/// Untyped response delivered to a suspended caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    pub rpc_id: i32,
    pub opcode: u16,
    pub error: i32,
    pub text: String,
    pub payload: Bytes,
}

impl RawResponse {
    /// Locally synthesized failure with an empty payload
    pub fn failure(rpc_id: i32, code: ErrorCode, text: impl Into<String>) -> Self {
        Self {
            rpc_id,
            opcode: 0,
            error: code.into(),
            text: text.into(),
            payload: Bytes::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.error == i32::from(ErrorCode::Success)
    }

    /// Known error code, `None` for application-defined codes
    pub fn error_code(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.error).ok()
    }
}
