use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{IceCandidateData, MediaStatePatch, ParticipantData, ParticipantId, RoomId};

/// Messages sent from client to the rendezvous server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Authenticate the connection
    Authenticate { token: String },

    /// Ping to keep connection alive
    Ping,

    /// Join a room with the initial media flags
    JoinRoom {
        room_id: RoomId,
        audio: bool,
        video: bool,
    },

    /// Leave a room
    LeaveRoom { room_id: RoomId },

    /// WebRTC offer
    Offer { target_id: ParticipantId, sdp: String },

    /// WebRTC answer
    Answer { target_id: ParticipantId, sdp: String },

    /// WebRTC ICE candidate
    IceCandidate {
        target_id: ParticipantId,
        candidate: IceCandidateData,
    },

    /// Microphone enabled/disabled
    ToggleAudio { enabled: bool },

    /// Camera enabled/disabled
    ToggleVideo { enabled: bool },

    /// Screen share started/stopped
    ToggleScreen { enabled: bool },
}

/// Messages sent from the rendezvous server to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Authentication successful
    Authenticated { connection_id: Uuid },

    /// Pong response to ping
    Pong,

    /// Join accepted, with everyone already in the room
    JoinedRoom {
        room_id: RoomId,
        self_id: ParticipantId,
        participants: Vec<ParticipantData>,
    },

    /// Another participant entered the room
    ParticipantJoined(ParticipantData),

    /// A participant left the room
    ParticipantLeft { id: ParticipantId },

    /// WebRTC offer from another participant
    Offer { from_id: ParticipantId, sdp: String },

    /// WebRTC answer from another participant
    Answer { from_id: ParticipantId, sdp: String },

    /// WebRTC ICE candidate from another participant
    IceCandidate {
        from_id: ParticipantId,
        candidate: IceCandidateData,
    },

    /// A participant toggled microphone, camera or screen share
    ParticipantMediaChanged {
        id: ParticipantId,
        #[serde(flatten)]
        changes: MediaStatePatch,
    },

    /// The server rejected a request
    SignalingError { message: String },
}
