use meshroom_protocol::{MediaState, MediaStatePatch, ParticipantData, ParticipantId};
use std::collections::{BTreeMap, HashMap};

/// A remote participant as last reported by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub id: ParticipantId,
    pub display_name: Option<String>,
    pub media: MediaState,
}

impl From<ParticipantData> for Participant {
    fn from(data: ParticipantData) -> Self {
        Self {
            id: data.id,
            display_name: data.display_name,
            media: data.media,
        }
    }
}

/// Authoritative local view of who else is in the room.
///
/// Media updates for participants not (yet) in the roster are held back and
/// applied when the participant is added, so the roster only ever contains
/// participants that have a peer link.
#[derive(Debug, Default)]
pub struct ParticipantRegistry {
    participants: BTreeMap<ParticipantId, Participant>,
    pending_media: HashMap<ParticipantId, MediaStatePatch>,
}

impl ParticipantRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the roster with a snapshot
    pub fn seed(&mut self, participants: impl IntoIterator<Item = ParticipantData>) {
        self.participants.clear();
        for data in participants {
            self.add(data);
        }
    }

    /// Returns false if the participant was already known; its entry is
    /// refreshed either way.
    pub fn add(&mut self, data: ParticipantData) -> bool {
        let mut participant = Participant::from(data);
        if let Some(patch) = self.pending_media.remove(&participant.id) {
            participant.media.apply(&patch);
        }
        self.participants
            .insert(participant.id.clone(), participant)
            .is_none()
    }

    pub fn remove(&mut self, id: &ParticipantId) -> Option<Participant> {
        self.pending_media.remove(id);
        self.participants.remove(id)
    }

    /// Apply a media update. Returns false if the participant is unknown, in
    /// which case the update is kept for when they are added.
    pub fn apply_media(&mut self, id: &ParticipantId, patch: &MediaStatePatch) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                participant.media.apply(patch);
                true
            }
            None => {
                let pending = self.pending_media.entry(id.clone()).or_default();
                if patch.audio.is_some() {
                    pending.audio = patch.audio;
                }
                if patch.video.is_some() {
                    pending.video = patch.video;
                }
                if patch.screen.is_some() {
                    pending.screen = patch.screen;
                }
                false
            }
        }
    }

    pub fn get(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.get(id)
    }

    pub fn contains(&self, id: &ParticipantId) -> bool {
        self.participants.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.participants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.participants.is_empty()
    }

    /// Participants ordered by id
    pub fn iter(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    pub fn ids(&self) -> Vec<ParticipantId> {
        self.participants.keys().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
        self.pending_media.clear();
    }
}
