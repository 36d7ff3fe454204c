use meshroom_protocol::ParticipantId;
use thiserror::Error;

use crate::room::SessionState;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    /// Camera, microphone or screen capture was denied or is unavailable
    #[error("Could not acquire local media: {cause}")]
    MediaAcquisition { cause: String },

    /// The signaling channel is unreachable or was lost
    #[error("Signaling transport error: {0}")]
    Transport(String),

    /// A single peer connection failed to negotiate or connect
    #[error("Negotiation with {participant} failed: {reason}")]
    Negotiation {
        participant: ParticipantId,
        reason: String,
    },

    /// The server rejected a request; the message is passed through verbatim
    #[error("{0}")]
    SignalingProtocol(String),

    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// The join was abandoned before the room was entered
    #[error("Join cancelled")]
    JoinCancelled,

    /// The room task is no longer running
    #[error("Room session closed")]
    Closed,
}

impl RoomError {
    pub fn media(cause: impl std::fmt::Display) -> Self {
        RoomError::MediaAcquisition {
            cause: cause.to_string(),
        }
    }

    pub fn transport(cause: impl std::fmt::Display) -> Self {
        RoomError::Transport(cause.to_string())
    }

    pub fn negotiation(participant: &ParticipantId, reason: impl std::fmt::Display) -> Self {
        RoomError::Negotiation {
            participant: participant.clone(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, RoomError>;
