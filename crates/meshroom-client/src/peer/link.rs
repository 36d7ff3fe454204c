use anyhow::Result;
use meshroom_protocol::{IceCandidateData, ParticipantId};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use super::connection::{Connectivity, RemoteTrack, RtcConnection};

/// Which side of the offer/answer exchange this link plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Offering,
    AwaitingAnswer,
    AwaitingOffer,
    Answering,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::New => write!(f, "New"),
            LinkState::Offering => write!(f, "Offering"),
            LinkState::AwaitingAnswer => write!(f, "AwaitingAnswer"),
            LinkState::AwaitingOffer => write!(f, "AwaitingOffer"),
            LinkState::Answering => write!(f, "Answering"),
            LinkState::Connected => write!(f, "Connected"),
            LinkState::Failed => write!(f, "Failed"),
            LinkState::Closed => write!(f, "Closed"),
        }
    }
}

/// Peer connection towards one remote participant, with its own
/// negotiation state and queue of early ICE candidates
pub struct PeerLink {
    participant: ParticipantId,
    role: LinkRole,
    state: LinkState,
    generation: u64,
    connection: Arc<dyn RtcConnection>,
    remote_description_set: bool,
    pending_ice: VecDeque<IceCandidateData>,
    remote_tracks: Vec<RemoteTrack>,
}

impl PeerLink {
    pub fn new(
        participant: ParticipantId,
        role: LinkRole,
        generation: u64,
        connection: Arc<dyn RtcConnection>,
    ) -> Self {
        Self {
            participant,
            role,
            state: LinkState::New,
            generation,
            connection,
            remote_description_set: false,
            pending_ice: VecDeque::new(),
            remote_tracks: Vec::new(),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    pub fn role(&self) -> LinkRole {
        self.role
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn has_remote_description(&self) -> bool {
        self.remote_description_set
    }

    pub fn pending_ice_len(&self) -> usize {
        self.pending_ice.len()
    }

    pub fn remote_tracks(&self) -> &[RemoteTrack] {
        &self.remote_tracks
    }

    pub fn connection(&self) -> &Arc<dyn RtcConnection> {
        &self.connection
    }

    /// Create the initial offer. Initiator links only, from `New`.
    pub async fn offer(&mut self) -> Result<Option<String>> {
        if self.role != LinkRole::Initiator || self.state != LinkState::New {
            return Ok(None);
        }
        self.state = LinkState::Offering;
        let sdp = self.connection.create_offer().await?;
        self.state = LinkState::AwaitingAnswer;
        Ok(Some(sdp))
    }

    /// Responder links wait for the remote offer
    pub fn await_offer(&mut self) {
        if self.role == LinkRole::Responder && self.state == LinkState::New {
            self.state = LinkState::AwaitingOffer;
        }
    }

    pub fn can_accept_offer(&self) -> bool {
        self.role == LinkRole::Responder
            && matches!(self.state, LinkState::New | LinkState::AwaitingOffer)
    }

    /// Apply a remote offer and produce the answer
    pub async fn accept_offer(&mut self, sdp: String) -> Result<Option<String>> {
        if !self.can_accept_offer() {
            return Ok(None);
        }
        self.state = LinkState::Answering;
        self.connection.set_remote_offer(sdp).await?;
        self.remote_description_set = true;
        let answer = self.connection.create_answer().await?;
        Ok(Some(answer))
    }

    /// Apply the remote answer. Returns false if the link is not waiting
    /// for one.
    pub async fn accept_answer(&mut self, sdp: String) -> Result<bool> {
        if self.state != LinkState::AwaitingAnswer || self.remote_description_set {
            return Ok(false);
        }
        self.connection.set_remote_answer(sdp).await?;
        self.remote_description_set = true;
        Ok(true)
    }

    /// Apply a remote candidate now, or queue it until the remote
    /// description is in place. Returns true if it was applied.
    pub async fn add_remote_candidate(&mut self, candidate: IceCandidateData) -> Result<bool> {
        if !self.remote_description_set {
            self.pending_ice.push_back(candidate);
            return Ok(false);
        }
        self.connection.add_ice_candidate(candidate).await?;
        Ok(true)
    }

    /// Apply queued candidates in arrival order. A rejected candidate does
    /// not stop the rest.
    pub async fn drain_pending_ice(&mut self) -> usize {
        if !self.remote_description_set {
            return 0;
        }
        let mut applied = 0;
        while let Some(candidate) = self.pending_ice.pop_front() {
            match self.connection.add_ice_candidate(candidate).await {
                Ok(()) => applied += 1,
                Err(e) => {
                    tracing::warn!("Rejected queued ICE candidate from {}: {:#}", self.participant, e)
                }
            }
        }
        applied
    }

    pub fn attach_remote_track(&mut self, track: RemoteTrack) {
        if self.remote_tracks.iter().any(|t| t.id == track.id) {
            return;
        }
        self.remote_tracks.push(track);
    }

    /// Returns true if the link just failed
    pub fn on_connectivity(&mut self, connectivity: Connectivity) -> bool {
        match connectivity {
            Connectivity::Connected => {
                if self.remote_description_set
                    && matches!(self.state, LinkState::AwaitingAnswer | LinkState::Answering)
                {
                    self.state = LinkState::Connected;
                }
                false
            }
            Connectivity::Disconnected | Connectivity::Failed => self.fail(),
            Connectivity::New | Connectivity::Connecting | Connectivity::Closed => false,
        }
    }

    /// Returns true if the link just failed
    pub fn fail(&mut self) -> bool {
        if matches!(self.state, LinkState::Failed | LinkState::Closed) {
            return false;
        }
        self.state = LinkState::Failed;
        true
    }

    /// Release the connection. Returns false if already closed.
    pub async fn close(&mut self) -> bool {
        if self.state == LinkState::Closed {
            return false;
        }
        self.connection.close().await;
        self.state = LinkState::Closed;
        self.pending_ice.clear();
        self.remote_tracks.clear();
        true
    }
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("participant", &self.participant)
            .field("role", &self.role)
            .field("state", &self.state)
            .field("generation", &self.generation)
            .field("pending_ice", &self.pending_ice.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalTrack;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Accepts everything except candidates containing "bad"
    #[derive(Default)]
    struct PickyConnection {
        applied: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl RtcConnection for PickyConnection {
        async fn add_track(&self, _track: &LocalTrack) -> Result<()> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<String> {
            Ok("offer".to_string())
        }
        async fn create_answer(&self) -> Result<String> {
            Ok("answer".to_string())
        }
        async fn set_remote_offer(&self, _sdp: String) -> Result<()> {
            Ok(())
        }
        async fn set_remote_answer(&self, _sdp: String) -> Result<()> {
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: IceCandidateData) -> Result<()> {
            if candidate.candidate.contains("bad") {
                return Err(anyhow!("malformed candidate"));
            }
            self.applied.lock().unwrap().push(candidate.candidate);
            Ok(())
        }
        async fn replace_video_track(&self, _track: &LocalTrack) -> Result<()> {
            Ok(())
        }
        async fn close(&self) {}
    }

    fn candidate(text: &str) -> IceCandidateData {
        IceCandidateData {
            candidate: text.to_string(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }

    fn link(role: LinkRole) -> (PeerLink, Arc<PickyConnection>) {
        let connection = Arc::new(PickyConnection::default());
        (PeerLink::new("bob".into(), role, 1, connection.clone()), connection)
    }

    #[tokio::test]
    async fn test_rejected_candidate_does_not_stop_drain() {
        let (mut link, connection) = link(LinkRole::Responder);
        link.await_offer();
        for text in ["one", "bad", "three"] {
            assert!(!link.add_remote_candidate(candidate(text)).await.unwrap());
        }

        link.accept_offer("offer".to_string()).await.unwrap();
        assert_eq!(link.drain_pending_ice().await, 2);
        assert_eq!(*connection.applied.lock().unwrap(), vec!["one", "three"]);
    }

    #[tokio::test]
    async fn test_responder_does_not_offer() {
        let (mut link, _) = link(LinkRole::Responder);
        assert!(link.offer().await.unwrap().is_none());
        assert_eq!(link.state(), LinkState::New);
    }

    #[tokio::test]
    async fn test_disconnect_fails_once_then_close() {
        let (mut link, _) = link(LinkRole::Initiator);
        link.offer().await.unwrap();
        assert!(link.on_connectivity(Connectivity::Disconnected));
        assert!(!link.on_connectivity(Connectivity::Failed));
        assert_eq!(link.state(), LinkState::Failed);

        assert!(link.close().await);
        assert!(!link.close().await);
        assert_eq!(link.state(), LinkState::Closed);
    }

    #[test]
    fn test_remote_tracks_deduplicated() {
        let connection = Arc::new(PickyConnection::default());
        let mut link = PeerLink::new("bob".into(), LinkRole::Initiator, 1, connection);
        let track = RemoteTrack {
            id: "audio-1".to_string(),
            stream_id: "bob".to_string(),
            kind: crate::media::MediaKind::Audio,
            handle: None,
        };
        link.attach_remote_track(track.clone());
        link.attach_remote_track(track);
        assert_eq!(link.remote_tracks().len(), 1);
    }
}
