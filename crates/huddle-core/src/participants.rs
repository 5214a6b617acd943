use std::sync::Arc;

use crate::media::RemoteMediaTrack;

/// A remote participant as seen by the UI.
///
/// Track handles are shared with the media SDK; the roster never stops or
/// releases them. Only the video handle lives here. Subscribed audio handles
/// are held in `CallSession::remote_audio`, keyed by participant id, and
/// `has_audio_track` mirrors them.
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    pub id: String,
    pub has_video_track: bool,
    pub has_audio_track: bool,
    pub video_track: Option<Arc<dyn RemoteMediaTrack>>,
}

impl RemoteParticipant {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            has_video_track: false,
            has_audio_track: false,
            video_track: None,
        }
    }
}

/// Remote participants of the current call, unique by id.
///
/// Updated by the controller's media event handlers. Read by the UI.
#[derive(Debug, Clone, Default)]
pub struct ParticipantRoster {
    participants: Vec<RemoteParticipant>,
}

impl ParticipantRoster {
    pub fn new() -> Self {
        Self {
            participants: Vec::new(),
        }
    }

    /// Insert a participant unless one with the same id is already present.
    ///
    /// Returns `true` if a record was created.
    pub fn add_if_absent(&mut self, id: &str) -> bool {
        if self.participant(id).is_some() {
            return false;
        }
        self.participants.push(RemoteParticipant::new(id));
        true
    }

    /// Attach a video track, creating the record if the joined notification
    /// has not arrived yet.
    pub fn upsert_video(&mut self, id: &str, track: Arc<dyn RemoteMediaTrack>) -> &RemoteParticipant {
        let idx = match self.participants.iter().position(|p| p.id == id) {
            Some(idx) => idx,
            None => {
                self.participants.push(RemoteParticipant::new(id));
                self.participants.len() - 1
            }
        };
        let p = &mut self.participants[idx];
        p.has_video_track = true;
        p.video_track = Some(track);
        p
    }

    /// Clear the video flag. The participant stays in the call.
    pub fn clear_video(&mut self, id: &str) -> Option<&RemoteParticipant> {
        let p = self.participant_mut(id)?;
        p.has_video_track = false;
        p.video_track = None;
        Some(p)
    }

    /// Update the audio flag of an existing record; never creates one.
    pub fn set_audio(&mut self, id: &str, has_audio: bool) -> Option<&RemoteParticipant> {
        let p = self.participant_mut(id)?;
        p.has_audio_track = has_audio;
        Some(p)
    }

    /// Returns `true` if a record was removed.
    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.participants.len();
        self.participants.retain(|p| p.id != id);
        self.participants.len() != before
    }

    pub fn participants(&self) -> &[RemoteParticipant] {
        &self.participants
    }

    pub fn participant(&self, id: &str) -> Option<&RemoteParticipant> {
        self.participants.iter().find(|p| p.id == id)
    }

    fn participant_mut(&mut self, id: &str) -> Option<&mut RemoteParticipant> {
        self.participants.iter_mut().find(|p| p.id == id)
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    pub fn clear(&mut self) {
        self.participants.clear();
    }
}
