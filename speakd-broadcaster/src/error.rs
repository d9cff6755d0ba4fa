use thiserror::Error;

use crate::client::ClientId;

#[derive(Error, Debug)]
pub enum BroadcasterError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Client {0} disconnected")]
    Disconnected(ClientId),
}

/// Failures decoding an inbound client frame
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid JSON frame: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Invalid {kind} payload: {reason}")]
    InvalidPayload { kind: &'static str, reason: String },

    #[error("Malformed audio chunk: {0}")]
    MalformedChunk(String),
}

impl ProtocolError {
    pub fn invalid(kind: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidPayload {
            kind,
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BroadcasterError>;
