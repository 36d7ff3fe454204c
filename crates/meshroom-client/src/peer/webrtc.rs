//! webrtc-rs backed connections

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use meshroom_protocol::{IceCandidateData, IceServer};
use std::sync::Arc;
use tokio::sync::Mutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use super::connection::{ConnectionFactory, Connectivity, LinkEventSink, RemoteTrack, RtcConnection};
use crate::media::{LocalTrack, MediaKind};

/// Builds one `RTCPeerConnection` per link from a shared API instance
pub struct WebRtcConnectionFactory {
    api: API,
}

impl WebRtcConnectionFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api })
    }
}

fn rtc_ice_servers(ice_servers: &[IceServer]) -> Vec<RTCIceServer> {
    ice_servers
        .iter()
        .map(|server| RTCIceServer {
            urls: server.urls.clone(),
            username: server.username.clone().unwrap_or_default(),
            credential: server.credential.clone().unwrap_or_default(),
            ..Default::default()
        })
        .collect()
}

fn connectivity(state: RTCPeerConnectionState) -> Option<Connectivity> {
    match state {
        RTCPeerConnectionState::New => Some(Connectivity::New),
        RTCPeerConnectionState::Connecting => Some(Connectivity::Connecting),
        RTCPeerConnectionState::Connected => Some(Connectivity::Connected),
        RTCPeerConnectionState::Disconnected => Some(Connectivity::Disconnected),
        RTCPeerConnectionState::Failed => Some(Connectivity::Failed),
        RTCPeerConnectionState::Closed => Some(Connectivity::Closed),
        RTCPeerConnectionState::Unspecified => None,
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcConnectionFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: LinkEventSink,
    ) -> Result<Arc<dyn RtcConnection>> {
        let config = RTCConfiguration {
            ice_servers: rtc_ice_servers(ice_servers),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);

        let sink = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let sink = sink.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    // End of gathering
                    return;
                };
                match candidate.to_json() {
                    Ok(json) => sink.local_candidate(IceCandidateData {
                        candidate: json.candidate,
                        sdp_mid: json.sdp_mid,
                        sdp_mline_index: json.sdp_mline_index,
                    }),
                    Err(e) => tracing::warn!("Could not serialize local ICE candidate: {}", e),
                }
            })
        }));

        let sink = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let kind = match track.kind() {
                RTPCodecType::Audio => MediaKind::Audio,
                _ => MediaKind::Video,
            };
            tracing::debug!(
                "Remote track from {}: {} ({:?})",
                sink.participant(),
                track.id(),
                kind
            );
            sink.remote_track(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind,
                handle: Some(track),
            });
            Box::pin(async {})
        }));

        let sink = events;
        pc.on_peer_connection_state_change(Box::new(move |state| {
            tracing::debug!("Peer connection to {} is {}", sink.participant(), state);
            if let Some(state) = connectivity(state) {
                sink.connectivity(state);
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(WebRtcConnection {
            pc,
            video_sender: Mutex::new(None),
        }))
    }
}

pub struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    video_sender: Mutex<Option<Arc<RTCRtpSender>>>,
}

#[async_trait]
impl RtcConnection for WebRtcConnection {
    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let sender = self.pc.add_track(track.rtp_track()).await?;

        if track.kind() == MediaKind::Video {
            *self.video_sender.lock().await = Some(sender.clone());
        }

        // RTCP has to be drained for the interceptors to work
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn create_offer(&self) -> Result<String> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer.clone()).await?;
        Ok(offer.sdp)
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn set_remote_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp)?;
        self.pc.set_remote_description(offer).await?;
        Ok(())
    }

    async fn set_remote_answer(&self, sdp: String) -> Result<()> {
        let answer = RTCSessionDescription::answer(sdp)?;
        self.pc.set_remote_description(answer).await?;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidateData) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        let guard = self.video_sender.lock().await;
        let sender = guard
            .as_ref()
            .ok_or_else(|| anyhow!("No video sender on this connection"))?;
        sender.replace_track(Some(track.rtp_track())).await?;
        Ok(())
    }

    async fn close(&self) {
        *self.video_sender.lock().await = None;
        if let Err(e) = self.pc.close().await {
            tracing::warn!("Error closing peer connection: {}", e);
        }
    }
}
