use meshroom_protocol::{ClientMessage, IceCandidateData, IceServer, ParticipantId};
use std::collections::HashMap;
use std::sync::Arc;

use super::connection::{ConnectionFactory, LinkEvent, LinkEventKind, LinkEventSink};
use super::link::{LinkRole, LinkState, PeerLink};
use crate::error::{Result, RoomError};
use crate::events::SessionEventSender;
use crate::media::LocalTrack;
use crate::network::SignalingTransport;

/// Owns one [`PeerLink`] per remote participant and drives their
/// negotiation over the signaling transport.
pub struct PeerConnectionManager {
    factory: Arc<dyn ConnectionFactory>,
    transport: Arc<dyn SignalingTransport>,
    events: SessionEventSender,
    ice_servers: Vec<IceServer>,
    links: HashMap<ParticipantId, PeerLink>,
    next_generation: u64,
}

impl PeerConnectionManager {
    pub fn new(
        factory: Arc<dyn ConnectionFactory>,
        transport: Arc<dyn SignalingTransport>,
        events: SessionEventSender,
        ice_servers: Vec<IceServer>,
    ) -> Self {
        Self {
            factory,
            transport,
            events,
            ice_servers,
            links: HashMap::new(),
            next_generation: 1,
        }
    }

    pub fn link(&self, participant: &ParticipantId) -> Option<&PeerLink> {
        self.links.get(participant)
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Open a link towards `participant`, sending `tracks`. Initiators send
    /// their offer right away. No-op if a link already exists.
    pub async fn open(
        &mut self,
        participant: &ParticipantId,
        role: LinkRole,
        tracks: &[LocalTrack],
    ) -> Result<()> {
        if self.links.contains_key(participant) {
            tracing::debug!("Link to {} already open", participant);
            return Ok(());
        }

        let generation = self.next_generation;
        self.next_generation += 1;

        let sink = LinkEventSink::new(participant.clone(), generation, self.events.clone());
        let connection = self
            .factory
            .create(&self.ice_servers, sink)
            .await
            .map_err(|e| RoomError::negotiation(participant, format!("{:#}", e)))?;

        let mut link = PeerLink::new(participant.clone(), role, generation, connection);

        for track in tracks {
            if let Err(e) = link.connection().add_track(track).await {
                link.close().await;
                return Err(RoomError::negotiation(participant, format!("{:#}", e)));
            }
        }

        tracing::info!(
            "Opened {:?} link to {} (generation {}, {} tracks)",
            role,
            participant,
            generation,
            tracks.len()
        );

        match role {
            LinkRole::Initiator => {
                let offer = match link.offer().await {
                    Ok(offer) => offer,
                    Err(e) => {
                        link.close().await;
                        return Err(RoomError::negotiation(participant, format!("{:#}", e)));
                    }
                };
                self.links.insert(participant.clone(), link);
                if let Some(sdp) = offer {
                    tracing::debug!("Sending offer to {}", participant);
                    self.transport
                        .send(ClientMessage::Offer {
                            target_id: participant.clone(),
                            sdp,
                        })
                        .await?;
                }
            }
            LinkRole::Responder => {
                link.await_offer();
                self.links.insert(participant.clone(), link);
            }
        }

        Ok(())
    }

    /// Answer a remote offer, opening a responder link first if needed
    pub async fn handle_offer(
        &mut self,
        participant: &ParticipantId,
        sdp: String,
        tracks: &[LocalTrack],
    ) -> Result<()> {
        if !self.links.contains_key(participant) {
            self.open(participant, LinkRole::Responder, tracks).await?;
        }

        let Some(link) = self.links.get_mut(participant) else {
            return Ok(());
        };

        if !link.can_accept_offer() {
            tracing::warn!(
                "Ignoring offer from {}: link is {:?} in state {}",
                participant,
                link.role(),
                link.state()
            );
            return Ok(());
        }

        let answer = link
            .accept_offer(sdp)
            .await
            .map_err(|e| RoomError::negotiation(participant, format!("{:#}", e)))?;

        let applied = link.drain_pending_ice().await;
        if applied > 0 {
            tracing::debug!("Applied {} queued ICE candidates from {}", applied, participant);
        }

        if let Some(sdp) = answer {
            tracing::debug!("Sending answer to {}", participant);
            self.transport
                .send(ClientMessage::Answer {
                    target_id: participant.clone(),
                    sdp,
                })
                .await?;
        }
        Ok(())
    }

    pub async fn handle_answer(&mut self, participant: &ParticipantId, sdp: String) -> Result<()> {
        let Some(link) = self.links.get_mut(participant) else {
            tracing::warn!("Ignoring answer from {}: no link", participant);
            return Ok(());
        };

        let accepted = link
            .accept_answer(sdp)
            .await
            .map_err(|e| RoomError::negotiation(participant, format!("{:#}", e)))?;

        if !accepted {
            tracing::warn!(
                "Ignoring answer from {}: link is in state {}",
                participant,
                link.state()
            );
            return Ok(());
        }

        let applied = link.drain_pending_ice().await;
        if applied > 0 {
            tracing::debug!("Applied {} queued ICE candidates from {}", applied, participant);
        }
        Ok(())
    }

    pub async fn handle_remote_ice(
        &mut self,
        participant: &ParticipantId,
        candidate: IceCandidateData,
    ) -> Result<()> {
        let Some(link) = self.links.get_mut(participant) else {
            tracing::debug!("Dropping ICE candidate from {}: no link", participant);
            return Ok(());
        };

        let applied = link
            .add_remote_candidate(candidate)
            .await
            .map_err(|e| RoomError::negotiation(participant, format!("{:#}", e)))?;

        if !applied {
            tracing::trace!(
                "Queued ICE candidate from {} ({} pending)",
                participant,
                link.pending_ice_len()
            );
        }
        Ok(())
    }

    /// Swap the outbound video on every link without renegotiating. A link
    /// that refuses keeps its old track.
    pub async fn replace_outbound_video_track(&mut self, track: &LocalTrack) {
        for (participant, link) in &self.links {
            if let Err(e) = link.connection().replace_video_track(track).await {
                tracing::warn!("Could not replace video track towards {}: {:#}", participant, e);
            }
        }
        tracing::debug!(
            "Outbound video is now {} on {} links",
            track.id(),
            self.links.len()
        );
    }

    /// Route a connection event to its link. Returns the participant whose
    /// link just failed, if any.
    pub async fn handle_link_event(&mut self, event: LinkEvent) -> Option<ParticipantId> {
        let LinkEvent {
            participant,
            generation,
            kind,
        } = event;

        let Some(link) = self.links.get_mut(&participant) else {
            tracing::trace!("Dropping event for closed link to {}", participant);
            return None;
        };
        if link.generation() != generation {
            tracing::trace!(
                "Dropping stale event for {} (generation {}, current {})",
                participant,
                generation,
                link.generation()
            );
            return None;
        }

        match kind {
            LinkEventKind::LocalCandidate(candidate) => {
                let message = ClientMessage::IceCandidate {
                    target_id: participant.clone(),
                    candidate,
                };
                if let Err(e) = self.transport.send(message).await {
                    tracing::warn!("Could not send ICE candidate to {}: {}", participant, e);
                }
                None
            }
            LinkEventKind::RemoteTrack(track) => {
                tracing::info!(
                    "Receiving {:?} track {} from {}",
                    track.kind,
                    track.id,
                    participant
                );
                link.attach_remote_track(track);
                None
            }
            LinkEventKind::Connectivity(connectivity) => {
                let before = link.state();
                let failed = link.on_connectivity(connectivity);
                if link.state() != before {
                    tracing::info!("Link to {}: {} -> {}", participant, before, link.state());
                }
                failed.then_some(participant)
            }
        }
    }

    /// Close and remove the link to `participant`. Returns the closed link,
    /// or `None` if there was none.
    pub async fn close(&mut self, participant: &ParticipantId) -> Option<PeerLink> {
        let mut link = self.links.remove(participant)?;
        if link.close().await {
            tracing::info!("Closed link to {}", participant);
        }
        Some(link)
    }

    pub async fn close_all(&mut self) {
        let participants: Vec<ParticipantId> = self.links.keys().cloned().collect();
        for participant in participants {
            self.close(&participant).await;
        }
    }

    pub fn state_of(&self, participant: &ParticipantId) -> Option<LinkState> {
        self.links.get(participant).map(PeerLink::state)
    }
}
