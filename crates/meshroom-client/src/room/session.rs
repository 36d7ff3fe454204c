use meshroom_protocol::{
    ClientMessage, IceServer, MediaState, ParticipantData, ParticipantId, RoomId, ServerMessage,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::error::{Result, RoomError};
use crate::events::{SessionEvent, SessionEventReceiver, SessionEventSender};
use crate::media::{LocalStream, MediaController, MediaDevices};
use crate::network::{Credentials, SignalingTransport, TransportEvent, TransportEvents};
use crate::peer::{
    ConnectionFactory, LinkRole, LinkState, PeerConnectionManager, RemoteTrack,
};
use crate::state::{Participant, ParticipantRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    ConnectingTransport,
    TransportReady,
    Joining,
    InRoom,
    Leaving,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::ConnectingTransport => "connecting",
            SessionState::TransportReady => "connected",
            SessionState::Joining => "joining",
            SessionState::InRoom => "in a room",
            SessionState::Leaving => "leaving",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A remote participant together with the state of our link to them
#[derive(Debug, Clone)]
pub struct ParticipantView {
    pub participant: Participant,
    pub link_state: Option<LinkState>,
    pub role: Option<LinkRole>,
    pub remote_tracks: Vec<RemoteTrack>,
}

/// Everything a rendering layer needs to draw the room
#[derive(Debug, Clone, Default)]
pub struct RoomSnapshot {
    pub state: SessionState,
    pub room_id: Option<RoomId>,
    pub self_id: Option<ParticipantId>,
    pub local_media: MediaState,
    pub participants: Vec<ParticipantView>,
    pub last_error: Option<RoomError>,
}

/// Something for the session to react to
#[derive(Debug)]
pub enum SessionInput {
    Transport(TransportEvent),
    Event(SessionEvent),
}

/// Room lifecycle state machine.
///
/// Owns the media controller, the peer links and the participant registry,
/// and is driven from a single task: public operations, transport messages
/// and connection events are all handled one at a time.
pub struct RoomSession {
    state: SessionState,
    transport: Arc<dyn SignalingTransport>,
    transport_events: Option<TransportEvents>,
    events_rx: SessionEventReceiver,
    media: MediaController,
    peers: PeerConnectionManager,
    registry: ParticipantRegistry,
    room_id: Option<RoomId>,
    self_id: Option<ParticipantId>,
    last_error: Option<RoomError>,
    join_outcome: Option<Result<()>>,
    published: watch::Sender<RoomSnapshot>,
}

impl RoomSession {
    pub fn new(
        transport: Arc<dyn SignalingTransport>,
        devices: Arc<dyn MediaDevices>,
        factory: Arc<dyn ConnectionFactory>,
        ice_servers: Vec<IceServer>,
    ) -> Self {
        let (events_tx, events_rx): (SessionEventSender, SessionEventReceiver) =
            mpsc::unbounded_channel();
        let (published, _) = watch::channel(RoomSnapshot::default());

        Self {
            state: SessionState::Idle,
            media: MediaController::new(devices, events_tx.clone()),
            peers: PeerConnectionManager::new(factory, transport.clone(), events_tx, ice_servers),
            transport,
            transport_events: None,
            events_rx,
            registry: ParticipantRegistry::new(),
            room_id: None,
            self_id: None,
            last_error: None,
            join_outcome: None,
            published,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn room_id(&self) -> Option<&RoomId> {
        self.room_id.as_ref()
    }

    pub fn self_id(&self) -> Option<&ParticipantId> {
        self.self_id.as_ref()
    }

    pub fn registry(&self) -> &ParticipantRegistry {
        &self.registry
    }

    pub fn peers(&self) -> &PeerConnectionManager {
        &self.peers
    }

    pub fn media(&self) -> &MediaController {
        &self.media
    }

    pub fn last_error(&self) -> Option<&RoomError> {
        self.last_error.as_ref()
    }

    /// Whether a join is waiting on camera/microphone permission
    pub fn is_acquiring_media(&self) -> bool {
        self.media.is_acquiring()
    }

    /// How the last join that waited on media ended: `Ok` once `join-room`
    /// went out, the failure otherwise
    pub fn take_join_outcome(&mut self) -> Option<Result<()>> {
        self.join_outcome.take()
    }

    pub fn subscribe(&self) -> watch::Receiver<RoomSnapshot> {
        self.published.subscribe()
    }

    pub fn snapshot(&self) -> RoomSnapshot {
        let participants = self
            .registry
            .iter()
            .map(|participant| {
                let link = self.peers.link(&participant.id);
                ParticipantView {
                    participant: participant.clone(),
                    link_state: link.map(|l| l.state()),
                    role: link.map(|l| l.role()),
                    remote_tracks: link.map(|l| l.remote_tracks().to_vec()).unwrap_or_default(),
                }
            })
            .collect();

        RoomSnapshot {
            state: self.state,
            room_id: self.room_id.clone(),
            self_id: self.self_id.clone(),
            local_media: self.media.state(),
            participants,
            last_error: self.last_error.clone(),
        }
    }

    fn publish(&self) {
        self.published.send_replace(self.snapshot());
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Room session: {} -> {}", self.state, state);
            self.state = state;
        }
    }

    /// Open the signaling channel
    pub async fn connect_transport(&mut self, credentials: &Credentials) -> Result<()> {
        match self.state {
            SessionState::Idle | SessionState::Failed => {}
            state => {
                tracing::debug!("connect_transport while {}; nothing to do", state);
                return Ok(());
            }
        }

        self.set_state(SessionState::ConnectingTransport);
        self.publish();

        tracing::info!("Connecting to {}", credentials.url);
        let result = match self.transport.connect(credentials).await {
            Ok(events) => {
                self.transport_events = Some(events);
                self.last_error = None;
                self.set_state(SessionState::TransportReady);
                tracing::info!("Signaling channel ready");
                Ok(())
            }
            Err(e) => {
                let err = match e {
                    RoomError::Transport(_) | RoomError::SignalingProtocol(_) => e,
                    other => RoomError::transport(other),
                };
                tracing::error!("Could not connect: {}", err);
                self.last_error = Some(err.clone());
                self.set_state(SessionState::Failed);
                Err(err)
            }
        };
        self.publish();
        result
    }

    /// Ask to join `room`. Camera and microphone are requested first without
    /// holding up the session; `join-room` goes out once the devices answer
    /// and the room is entered once the server confirms.
    pub async fn join(&mut self, room: RoomId) -> Result<()> {
        match self.state {
            SessionState::Joining | SessionState::InRoom if self.room_id.as_ref() == Some(&room) => {
                tracing::debug!("Already in room {}", room);
                return Ok(());
            }
            SessionState::InRoom => {
                tracing::info!("Switching rooms to {}", room);
                self.leave_room().await;
                self.set_state(SessionState::TransportReady);
            }
            SessionState::TransportReady => {}
            state => {
                return Err(RoomError::InvalidState {
                    operation: "join",
                    state,
                });
            }
        }

        self.join_outcome = None;
        self.room_id = Some(room.clone());
        self.set_state(SessionState::Joining);

        if self.media.acquire_local_media() {
            tracing::info!("Waiting for camera and microphone before joining {}", room);
            self.publish();
            return Ok(());
        }

        let result = self.send_join_request(room).await;
        self.publish();
        result
    }

    async fn send_join_request(&mut self, room: RoomId) -> Result<()> {
        let media = self.media.state();
        let request = ClientMessage::JoinRoom {
            room_id: room.clone(),
            audio: media.audio,
            video: media.video,
        };
        if let Err(e) = self.transport.send(request).await {
            self.abort_join(e.clone());
            return Err(e);
        }
        tracing::info!("Joining room {}", room);
        Ok(())
    }

    /// Leave the room and close the signaling channel. No-op without a room.
    pub async fn leave(&mut self) -> Result<()> {
        if self.room_id.is_none() {
            return Ok(());
        }
        self.leave_room().await;
        self.close_transport().await;
        self.set_state(SessionState::Idle);
        self.publish();
        Ok(())
    }

    /// Leave any room and close the signaling channel, whatever the state
    pub async fn close(&mut self) {
        self.leave_room().await;
        self.close_transport().await;
        self.set_state(SessionState::Idle);
        self.publish();
    }

    pub async fn set_audio_enabled(&mut self, enabled: bool) -> Result<()> {
        if self.media.set_audio_enabled(enabled) {
            self.broadcast(ClientMessage::ToggleAudio { enabled }).await;
        }
        self.publish();
        Ok(())
    }

    pub async fn set_video_enabled(&mut self, enabled: bool) -> Result<()> {
        if self.media.set_video_enabled(enabled) {
            self.broadcast(ClientMessage::ToggleVideo { enabled }).await;
        }
        self.publish();
        Ok(())
    }

    /// Send the screen instead of the camera on every link
    pub async fn start_screen_share(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Joining | SessionState::InRoom) {
            return Err(RoomError::InvalidState {
                operation: "share the screen",
                state: self.state,
            });
        }

        let track = match self.media.start_screen_share().await {
            Ok(Some(track)) => track,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.last_error = Some(e.clone());
                self.publish();
                return Err(e);
            }
        };

        self.peers.replace_outbound_video_track(&track).await;
        self.broadcast(ClientMessage::ToggleScreen { enabled: true }).await;
        self.publish();
        Ok(())
    }

    /// Put the camera back on every link
    pub async fn stop_screen_share(&mut self) -> Result<()> {
        if !self.media.stop_screen_share() {
            return Ok(());
        }

        if let Some(camera) = self.media.camera().cloned() {
            self.peers.replace_outbound_video_track(&camera).await;
        }
        self.broadcast(ClientMessage::ToggleScreen { enabled: false }).await;
        self.publish();
        Ok(())
    }

    /// Wait for the next transport message or connection event
    pub async fn next_input(&mut self) -> Option<SessionInput> {
        let events_rx = &mut self.events_rx;
        match self.transport_events.as_mut() {
            Some(transport) => tokio::select! {
                event = transport.recv() => Some(SessionInput::Transport(event.unwrap_or_else(|| {
                    TransportEvent::Closed {
                        reason: "Signaling channel dropped".to_string(),
                    }
                }))),
                Some(event) = events_rx.recv() => Some(SessionInput::Event(event)),
            },
            None => events_rx.recv().await.map(SessionInput::Event),
        }
    }

    fn try_next_input(&mut self) -> Option<SessionInput> {
        if let Ok(event) = self.events_rx.try_recv() {
            return Some(SessionInput::Event(event));
        }
        let transport = self.transport_events.as_mut()?;
        match transport.try_recv() {
            Ok(event) => Some(SessionInput::Transport(event)),
            Err(mpsc::error::TryRecvError::Empty) => None,
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Some(SessionInput::Transport(TransportEvent::Closed {
                    reason: "Signaling channel dropped".to_string(),
                }))
            }
        }
    }

    /// Handle every input that is already waiting. Returns how many were
    /// handled.
    pub async fn drain_events(&mut self) -> usize {
        let mut handled = 0;
        while let Some(input) = self.try_next_input() {
            self.dispatch(input).await;
            handled += 1;
        }
        handled
    }

    pub async fn dispatch(&mut self, input: SessionInput) {
        match input {
            SessionInput::Transport(event) => self.handle_transport_event(event).await,
            SessionInput::Event(event) => self.handle_session_event(event).await,
        }
        self.publish();
    }

    pub async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Message(message) => self.handle_server_message(message).await,
            TransportEvent::Closed { reason } => {
                self.transport_events = None;
                if self.state == SessionState::Idle {
                    return;
                }
                tracing::error!("Signaling channel lost: {}", reason);
                self.fail(RoomError::Transport(reason)).await;
            }
        }
    }

    pub async fn handle_server_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Authenticated { .. } | ServerMessage::Pong => {}
            ServerMessage::JoinedRoom {
                room_id,
                self_id,
                participants,
            } => self.on_joined_room(room_id, self_id, participants).await,
            ServerMessage::ParticipantJoined(data) => self.on_participant_joined(data).await,
            ServerMessage::ParticipantLeft { id } => {
                if self.ignores(&id) {
                    return;
                }
                tracing::info!("{} left the room", id);
                self.drop_participant(&id).await;
            }
            ServerMessage::Offer { from_id, sdp } => {
                if self.ignores(&from_id) {
                    return;
                }
                if !self.registry.contains(&from_id) {
                    tracing::debug!("Offer from unlisted participant {}", from_id);
                    self.registry.add(ParticipantData {
                        id: from_id.clone(),
                        display_name: None,
                        media: MediaState::default(),
                    });
                }
                let tracks = self.media.outbound_tracks();
                if let Err(e) = self.peers.handle_offer(&from_id, sdp, &tracks).await {
                    self.on_link_error(&from_id, e).await;
                }
            }
            ServerMessage::Answer { from_id, sdp } => {
                if self.ignores(&from_id) {
                    return;
                }
                if let Err(e) = self.peers.handle_answer(&from_id, sdp).await {
                    self.on_link_error(&from_id, e).await;
                }
            }
            ServerMessage::IceCandidate { from_id, candidate } => {
                if self.ignores(&from_id) {
                    return;
                }
                if let Err(e) = self.peers.handle_remote_ice(&from_id, candidate).await {
                    tracing::warn!("{}", e);
                }
            }
            ServerMessage::ParticipantMediaChanged { id, changes } => {
                if self.is_self(&id) || self.room_id.is_none() {
                    return;
                }
                if !self.registry.apply_media(&id, &changes) {
                    tracing::debug!("Media update for unknown participant {} held back", id);
                }
            }
            ServerMessage::SignalingError { message } => {
                tracing::warn!("Server error: {}", message);
                let err = RoomError::SignalingProtocol(message);
                if self.state == SessionState::Joining {
                    self.abort_join(err);
                } else {
                    self.last_error = Some(err);
                }
            }
        }
    }

    pub async fn handle_session_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Link(event) => {
                if let Some(failed) = self.peers.handle_link_event(event).await {
                    tracing::warn!("Connection to {} failed; dropping them", failed);
                    self.drop_participant(&failed).await;
                }
            }
            SessionEvent::LocalMediaAcquired { request, result } => {
                self.on_local_media(request, result).await;
            }
            SessionEvent::ScreenCaptureEnded { track_id } => {
                if self.media.is_current_screen(&track_id) {
                    tracing::info!("Screen capture ended by the source");
                    // Cannot fail once a capture is running
                    let _ = self.stop_screen_share().await;
                }
            }
        }
    }

    async fn on_local_media(&mut self, request: u64, result: anyhow::Result<LocalStream>) {
        let Some(acquired) = self.media.complete_local_media(request, result) else {
            return;
        };
        // Leaving cancels the request, so an answer only arrives while joining
        let Some(room) = self.room_id.clone() else {
            self.media.release();
            return;
        };

        let outcome = match acquired {
            Ok(()) => self.send_join_request(room).await,
            Err(e) => {
                self.abort_join(e.clone());
                Err(e)
            }
        };
        self.join_outcome = Some(outcome);
    }

    async fn on_joined_room(
        &mut self,
        room_id: RoomId,
        self_id: ParticipantId,
        participants: Vec<ParticipantData>,
    ) {
        if self.state != SessionState::Joining
            || self.room_id.as_ref() != Some(&room_id)
            || !self.media.has_local_media()
        {
            tracing::warn!("Ignoring joined-room for {} while {}", room_id, self.state);
            return;
        }

        tracing::info!(
            "Joined room {} as {} with {} others",
            room_id,
            self_id,
            participants.iter().filter(|p| p.id != self_id).count()
        );

        self.registry
            .seed(participants.into_iter().filter(|p| p.id != self_id));
        self.self_id = Some(self_id);

        let tracks = self.media.outbound_tracks();
        for id in self.registry.ids() {
            if let Err(e) = self.peers.open(&id, LinkRole::Initiator, &tracks).await {
                self.on_link_error(&id, e).await;
            }
        }

        self.set_state(SessionState::InRoom);
    }

    async fn on_participant_joined(&mut self, data: ParticipantData) {
        if self.ignores(&data.id) {
            return;
        }
        let id = data.id.clone();
        if self.registry.add(data) {
            tracing::info!("{} joined the room", id);
        }

        let tracks = self.media.outbound_tracks();
        if let Err(e) = self.peers.open(&id, LinkRole::Responder, &tracks).await {
            self.on_link_error(&id, e).await;
        }
    }

    /// Contain a single link's failure to that participant
    async fn on_link_error(&mut self, participant: &ParticipantId, err: RoomError) {
        tracing::warn!("{}", err);
        self.drop_participant(participant).await;
    }

    async fn drop_participant(&mut self, participant: &ParticipantId) {
        self.registry.remove(participant);
        self.peers.close(participant).await;
    }

    fn is_self(&self, id: &ParticipantId) -> bool {
        self.self_id.as_ref() == Some(id)
    }

    /// Peer traffic is only meaningful inside a room, and never about us
    fn ignores(&self, id: &ParticipantId) -> bool {
        if self.is_self(id) {
            tracing::trace!("Ignoring echo about ourselves");
            return true;
        }
        if self.state != SessionState::InRoom {
            tracing::debug!("Ignoring peer message from {} while {}", id, self.state);
            return true;
        }
        false
    }

    async fn broadcast(&self, message: ClientMessage) {
        // Before join-room the flags travel with the join request
        if self.room_id.is_none()
            || self.media.is_acquiring()
            || !matches!(self.state, SessionState::Joining | SessionState::InRoom)
        {
            return;
        }
        if let Err(e) = self.transport.send(message).await {
            tracing::warn!("Could not broadcast media change: {}", e);
        }
    }

    /// Resolve a join still waiting on the devices with `err`
    fn cancel_pending_join(&mut self, err: RoomError) {
        if self.media.is_acquiring() {
            self.media.cancel_acquisition();
            self.join_outcome = Some(Err(err));
        }
    }

    fn abort_join(&mut self, err: RoomError) {
        tracing::warn!("Join aborted: {}", err);
        self.cancel_pending_join(err.clone());
        self.media.release();
        self.registry.clear();
        self.room_id = None;
        self.self_id = None;
        self.last_error = Some(err);
        self.set_state(SessionState::TransportReady);
    }

    /// Leave the current room but keep the signaling channel
    async fn leave_room(&mut self) {
        if let Some(room_id) = self.room_id.clone() {
            self.set_state(SessionState::Leaving);
            if self.media.is_acquiring() {
                // join-room never went out
                tracing::info!("Abandoning join of {}", room_id);
            } else {
                tracing::info!("Leaving room {}", room_id);
                if let Err(e) = self.transport.send(ClientMessage::LeaveRoom { room_id }).await {
                    tracing::warn!("Could not send leave-room: {}", e);
                }
            }
        }
        self.teardown_room().await;
    }

    async fn teardown_room(&mut self) {
        self.cancel_pending_join(RoomError::JoinCancelled);
        self.peers.close_all().await;
        self.media.release();
        self.registry.clear();
        self.room_id = None;
        self.self_id = None;
    }

    async fn close_transport(&mut self) {
        self.transport_events = None;
        self.transport.close().await;
    }

    async fn fail(&mut self, err: RoomError) {
        self.cancel_pending_join(err.clone());
        self.teardown_room().await;
        self.close_transport().await;
        self.last_error = Some(err);
        self.set_state(SessionState::Failed);
    }
}
