//! In-memory stand-ins for the signaling server, the WebRTC stack and the
//! capture devices

#![allow(dead_code)]

use async_trait::async_trait;
use meshroom::error::{Result, RoomError};
use meshroom::media::{LocalStream, LocalTrack, MediaDevices, TrackSource};
use meshroom::network::{Credentials, SignalingTransport, TransportEvent, TransportEvents};
use meshroom::peer::{ConnectionFactory, Connectivity, LinkEventSink, RtcConnection};
use meshroom::RoomSession;
use meshroom_protocol::{
    ClientMessage, IceCandidateData, IceServer, MediaState, ParticipantData, ParticipantId,
    RoomId, ServerMessage,
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

// Signaling

#[derive(Default)]
pub struct FakeTransport {
    sent: Mutex<Vec<ClientMessage>>,
    inbound: Mutex<Option<mpsc::Sender<TransportEvent>>>,
    pub refuse: AtomicBool,
    /// Server message answering the authenticate step instead of success
    pub reject: Mutex<Option<String>>,
    pub connects: AtomicUsize,
    pub closes: AtomicUsize,
}

impl FakeTransport {
    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn take_sent(&self) -> Vec<ClientMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap())
    }

    pub fn is_connected(&self) -> bool {
        self.inbound.lock().unwrap().is_some()
    }

    /// Push a server message to the session
    pub async fn deliver(&self, message: ServerMessage) {
        self.push(TransportEvent::Message(message)).await;
    }

    /// Simulate the server going away
    pub async fn drop_connection(&self, reason: &str) {
        self.push(TransportEvent::Closed {
            reason: reason.to_string(),
        })
        .await;
        self.inbound.lock().unwrap().take();
    }

    async fn push(&self, event: TransportEvent) {
        let tx = self.inbound.lock().unwrap().clone();
        tx.expect("transport not connected")
            .send(event)
            .await
            .expect("session dropped its receiver");
    }
}

#[async_trait]
impl SignalingTransport for FakeTransport {
    async fn connect(&self, _credentials: &Credentials) -> Result<TransportEvents> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(RoomError::transport("Connection refused"));
        }
        if let Some(message) = self.reject.lock().unwrap().clone() {
            return Err(RoomError::SignalingProtocol(message));
        }
        let (tx, rx) = mpsc::channel(64);
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn send(&self, message: ClientMessage) -> Result<()> {
        if !self.is_connected() {
            return Err(RoomError::transport("Not connected"));
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.inbound.lock().unwrap().take();
    }
}

// Peer connections

#[derive(Default)]
pub struct FakeConnection {
    pub tracks: Mutex<Vec<String>>,
    pub remote_descriptions: Mutex<Vec<String>>,
    pub candidates: Mutex<Vec<String>>,
    pub replaced: Mutex<Vec<String>>,
    pub offers: AtomicUsize,
    pub answers: AtomicUsize,
    pub closes: AtomicUsize,
}

#[async_trait]
impl RtcConnection for FakeConnection {
    async fn add_track(&self, track: &LocalTrack) -> anyhow::Result<()> {
        self.tracks.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> anyhow::Result<String> {
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 offer {}", n))
    }

    async fn create_answer(&self) -> anyhow::Result<String> {
        let n = self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(format!("v=0 answer {}", n))
    }

    async fn set_remote_offer(&self, sdp: String) -> anyhow::Result<()> {
        self.remote_descriptions.lock().unwrap().push(sdp);
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: String) -> anyhow::Result<()> {
        self.remote_descriptions.lock().unwrap().push(sdp);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateData) -> anyhow::Result<()> {
        self.candidates.lock().unwrap().push(candidate.candidate);
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> anyhow::Result<()> {
        self.replaced.lock().unwrap().push(track.id().to_string());
        Ok(())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct CreatedConnection {
    pub participant: ParticipantId,
    pub connection: Arc<FakeConnection>,
    pub events: LinkEventSink,
}

#[derive(Default)]
pub struct FakeConnectionFactory {
    created: Mutex<Vec<CreatedConnection>>,
    pub fail_for: Mutex<HashSet<ParticipantId>>,
}

impl FakeConnectionFactory {
    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    /// Most recent connection towards `participant`
    pub fn connection(&self, participant: &str) -> Arc<FakeConnection> {
        self.find(participant, |c| c.connection.clone())
    }

    pub fn sink(&self, participant: &str) -> LinkEventSink {
        self.find(participant, |c| c.events.clone())
    }

    /// Raise a connectivity change on the latest connection to `participant`
    pub fn set_connectivity(&self, participant: &str, state: Connectivity) {
        self.sink(participant).connectivity(state);
    }

    fn find<T>(&self, participant: &str, f: impl Fn(&CreatedConnection) -> T) -> T {
        let created = self.created.lock().unwrap();
        let found = created
            .iter()
            .rev()
            .find(|c| c.participant.as_str() == participant)
            .unwrap_or_else(|| panic!("no connection to {}", participant));
        f(found)
    }
}

#[async_trait]
impl ConnectionFactory for FakeConnectionFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: LinkEventSink,
    ) -> anyhow::Result<Arc<dyn RtcConnection>> {
        if self.fail_for.lock().unwrap().contains(events.participant()) {
            anyhow::bail!("No compatible codecs");
        }
        let connection = Arc::new(FakeConnection::default());
        self.created.lock().unwrap().push(CreatedConnection {
            participant: events.participant().clone(),
            connection: connection.clone(),
            events,
        });
        Ok(connection)
    }
}

// Capture

#[derive(Default)]
pub struct FakeDevices {
    pub deny: AtomicBool,
    /// Leave the permission prompt unanswered
    pub hang: AtomicBool,
    issued: Mutex<Vec<LocalTrack>>,
    screens: AtomicUsize,
}

impl FakeDevices {
    pub fn issued(&self) -> Vec<LocalTrack> {
        self.issued.lock().unwrap().clone()
    }

    pub fn last_screen(&self) -> Option<LocalTrack> {
        self.issued()
            .into_iter()
            .rev()
            .find(|t| t.source() == TrackSource::Screen)
    }
}

#[async_trait]
impl MediaDevices for FakeDevices {
    async fn user_media(&self) -> anyhow::Result<LocalStream> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        if self.deny.load(Ordering::SeqCst) {
            anyhow::bail!("Permission denied by user");
        }
        let stream = LocalStream {
            microphone: LocalTrack::with_source(TrackSource::Microphone, "mic", "local"),
            camera: LocalTrack::with_source(TrackSource::Camera, "camera", "local"),
        };
        let mut issued = self.issued.lock().unwrap();
        issued.push(stream.microphone.clone());
        issued.push(stream.camera.clone());
        Ok(stream)
    }

    async fn display_media(&self) -> anyhow::Result<LocalTrack> {
        let n = self.screens.fetch_add(1, Ordering::SeqCst);
        let track = LocalTrack::with_source(TrackSource::Screen, format!("screen-{}", n), "screen");
        self.issued.lock().unwrap().push(track.clone());
        Ok(track)
    }
}

// Harness

pub struct TestRoom {
    pub session: RoomSession,
    pub transport: Arc<FakeTransport>,
    pub factory: Arc<FakeConnectionFactory>,
    pub devices: Arc<FakeDevices>,
}

impl TestRoom {
    pub fn new() -> Self {
        let transport = Arc::new(FakeTransport::default());
        let factory = Arc::new(FakeConnectionFactory::default());
        let devices = Arc::new(FakeDevices::default());
        let session = RoomSession::new(
            transport.clone(),
            devices.clone(),
            factory.clone(),
            vec![IceServer::stun("stun:stun.l.google.com:19302")],
        );
        Self {
            session,
            transport,
            factory,
            devices,
        }
    }

    pub async fn connected() -> Self {
        let mut room = Self::new();
        room.session
            .connect_transport(&credentials())
            .await
            .expect("connect");
        room
    }

    /// Connect and join `room_id` as `self_id`, with `others` already there
    pub async fn joined(room_id: &str, self_id: &str, others: &[&str]) -> Self {
        let mut room = Self::connected().await;
        room.join(room_id).await.expect("join");
        room.transport
            .deliver(ServerMessage::JoinedRoom {
                room_id: room_id.into(),
                self_id: self_id.into(),
                participants: others.iter().map(|id| participant(id)).collect(),
            })
            .await;
        room.settle().await;
        room
    }

    /// Join `room_id` and run the session until the devices have answered
    pub async fn join(&mut self, room_id: &str) -> Result<()> {
        self.session.join(RoomId::from(room_id)).await?;
        while self.session.is_acquiring_media() {
            let input = tokio::time::timeout(Duration::from_secs(1), self.session.next_input())
                .await
                .expect("no answer from the devices")
                .expect("session inputs closed");
            self.session.dispatch(input).await;
        }
        self.session.take_join_outcome().unwrap_or(Ok(()))
    }

    /// Handle everything waiting for the session
    pub async fn settle(&mut self) {
        while self.session.drain_events().await > 0 {}
    }

    pub async fn deliver(&mut self, message: ServerMessage) {
        self.transport.deliver(message).await;
        self.settle().await;
    }

    pub fn link_count(&self) -> usize {
        self.session.peers().link_count()
    }

    pub fn registry_len(&self) -> usize {
        self.session.registry().len()
    }
}

pub fn credentials() -> Credentials {
    Credentials {
        url: "ws://signaling.test/ws".to_string(),
        token: "token".to_string(),
    }
}

pub fn participant(id: &str) -> ParticipantData {
    ParticipantData {
        id: id.into(),
        display_name: Some(id.to_uppercase()),
        media: MediaState {
            audio: true,
            video: true,
            screen: false,
        },
    }
}

pub fn candidate(text: &str) -> IceCandidateData {
    IceCandidateData {
        candidate: text.to_string(),
        sdp_mid: Some("0".to_string()),
        sdp_mline_index: Some(0),
    }
}
