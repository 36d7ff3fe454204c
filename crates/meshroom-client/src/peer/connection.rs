//! Seam between the link state machine and the WebRTC implementation

use anyhow::Result;
use async_trait::async_trait;
use meshroom_protocol::{IceCandidateData, IceServer, ParticipantId};
use std::fmt;
use std::sync::Arc;
use webrtc::track::track_remote::TrackRemote;

use crate::events::{SessionEvent, SessionEventSender};
use crate::media::{LocalTrack, MediaKind};

/// Transport-level connectivity of a peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// A media track received from a remote participant
#[derive(Clone)]
pub struct RemoteTrack {
    pub id: String,
    pub stream_id: String,
    pub kind: MediaKind,
    /// Native track to read RTP from; absent for tracks that are only
    /// described, not received
    pub handle: Option<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

#[derive(Debug)]
pub enum LinkEventKind {
    /// Locally gathered candidate to forward to the remote side
    LocalCandidate(IceCandidateData),
    RemoteTrack(RemoteTrack),
    Connectivity(Connectivity),
}

/// Event raised by a connection, tagged with the link that owns it
#[derive(Debug)]
pub struct LinkEvent {
    pub participant: ParticipantId,
    pub generation: u64,
    pub kind: LinkEventKind,
}

/// Forwards a connection's callbacks into the room task
#[derive(Clone)]
pub struct LinkEventSink {
    participant: ParticipantId,
    generation: u64,
    tx: SessionEventSender,
}

impl LinkEventSink {
    pub fn new(participant: ParticipantId, generation: u64, tx: SessionEventSender) -> Self {
        Self {
            participant,
            generation,
            tx,
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_candidate(&self, candidate: IceCandidateData) {
        self.emit(LinkEventKind::LocalCandidate(candidate));
    }

    pub fn remote_track(&self, track: RemoteTrack) {
        self.emit(LinkEventKind::RemoteTrack(track));
    }

    pub fn connectivity(&self, state: Connectivity) {
        self.emit(LinkEventKind::Connectivity(state));
    }

    fn emit(&self, kind: LinkEventKind) {
        // The room task may already be gone during shutdown
        let _ = self.tx.send(SessionEvent::Link(LinkEvent {
            participant: self.participant.clone(),
            generation: self.generation,
            kind,
        }));
    }
}

/// One peer connection towards one remote participant
#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Create an offer and apply it as the local description
    async fn create_offer(&self) -> Result<String>;

    /// Create an answer and apply it as the local description
    async fn create_answer(&self) -> Result<String>;

    async fn set_remote_offer(&self, sdp: String) -> Result<()>;

    async fn set_remote_answer(&self, sdp: String) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidateData) -> Result<()>;

    /// Swap the track feeding the outbound video sender, without
    /// renegotiating
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()>;

    /// Stop raising events and release the connection
    async fn close(&self);
}

/// Creates connections configured with the room's ICE servers
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: LinkEventSink,
    ) -> Result<Arc<dyn RtcConnection>>;
}
