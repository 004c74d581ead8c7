//! Error types for the signaling layer and the media engine boundary

use crate::types::{ConsumerId, Direction, ProducerId, RoomId};
use thiserror::Error;

/// Failure reported by a media engine adapter
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// The engine cannot serve requests yet (e.g. workers still starting)
    #[error("media engine unavailable: {0}")]
    Unavailable(String),

    /// The engine is gone for good
    #[error("media engine closed")]
    Closed,

    /// The engine refused a specific request
    #[error("{0}")]
    Rejected(String),
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

/// Typed failure returned to a peer in a signaling response
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalError {
    #[error("room {0} not found")]
    RoomNotFound(RoomId),

    #[error("not joined to room {0}")]
    NotInRoom(RoomId),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("a {0} transport already exists for this peer")]
    TransportAlreadyExists(Direction),

    #[error("producer {0} not found")]
    ProducerNotFound(ProducerId),

    #[error("consumer {0} not found")]
    ConsumerNotFound(ConsumerId),

    #[error("rtp capabilities cannot consume producer {0}")]
    IncompatibleCapabilities(ProducerId),

    #[error("media engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("media engine error: {0}")]
    Engine(String),

    #[error("already joined to room {0}")]
    AlreadyInRoom(RoomId),

    #[error("room {0} already exists")]
    RoomAlreadyExists(RoomId),

    #[error("room {room_id} is full ({max} peers)")]
    RoomFull { room_id: RoomId, max: usize },

    #[error("room limit reached ({0} rooms)")]
    RoomLimitReached(usize),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SignalError {
    /// Stable error kind sent on the wire
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::RoomNotFound(_) => "RoomNotFound",
            Self::NotInRoom(_) => "NotInRoom",
            Self::TransportNotFound(_) => "TransportNotFound",
            Self::TransportAlreadyExists(_) => "TransportAlreadyExists",
            Self::ProducerNotFound(_) => "ProducerNotFound",
            Self::ConsumerNotFound(_) => "ConsumerNotFound",
            Self::IncompatibleCapabilities(_) => "IncompatibleCapabilities",
            Self::EngineUnavailable(_) => "EngineUnavailable",
            Self::Engine(_) => "EngineError",
            Self::AlreadyInRoom(_) => "AlreadyInRoom",
            Self::RoomAlreadyExists(_) => "RoomAlreadyExists",
            Self::RoomFull { .. } => "RoomFull",
            Self::RoomLimitReached(_) => "RoomLimitReached",
            Self::InvalidRequest(_) => "InvalidRequest",
        }
    }
}

impl From<EngineError> for SignalError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Unavailable(msg) => Self::EngineUnavailable(msg),
            EngineError::Closed => Self::EngineUnavailable("media engine closed".to_string()),
            EngineError::Rejected(msg) => Self::Engine(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, SignalError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_errors_map_to_signal_errors() {
        assert_eq!(
            SignalError::from(EngineError::Rejected("port range exhausted".into())),
            SignalError::Engine("port range exhausted".into())
        );
        assert_eq!(SignalError::from(EngineError::Closed).kind(), "EngineUnavailable");
    }
}
