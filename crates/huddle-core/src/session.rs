use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::media::{LocalMediaTrack, MediaClient, RemoteMediaTrack};
use crate::participants::ParticipantRoster;

/// Lifecycle stage of a call session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallPhase {
    Uninitialized,
    AcquiringCredentials,
    AcquiringMedia,
    Joining,
    Joined,
    Publishing,
    Active,
    TearingDown,
    Closed,
    Failed,
}

impl CallPhase {
    /// Initialization is under way and has not reached `Active`.
    pub fn is_in_flight(self) -> bool {
        matches!(
            self,
            CallPhase::AcquiringCredentials
                | CallPhase::AcquiringMedia
                | CallPhase::Joining
                | CallPhase::Joined
                | CallPhase::Publishing
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CallPhase::Closed | CallPhase::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: CallPhase) -> bool {
        use CallPhase::*;
        match (self, next) {
            (Uninitialized, AcquiringCredentials)
            | (AcquiringCredentials, AcquiringMedia)
            | (AcquiringMedia, Joining)
            | (Joining, Joined)
            | (Joined, Publishing)
            | (Publishing, Active)
            | (TearingDown, Closed) => true,
            (from, TearingDown) => !from.is_terminal() && from != TearingDown,
            (from, Failed) => from.is_in_flight(),
            _ => false,
        }
    }
}

impl fmt::Display for CallPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallPhase::Uninitialized => "uninitialized",
            CallPhase::AcquiringCredentials => "acquiring-credentials",
            CallPhase::AcquiringMedia => "acquiring-media",
            CallPhase::Joining => "joining",
            CallPhase::Joined => "joined",
            CallPhase::Publishing => "publishing",
            CallPhase::Active => "active",
            CallPhase::TearingDown => "tearing-down",
            CallPhase::Closed => "closed",
            CallPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Local microphone/camera tracks, owned by the session until teardown.
#[derive(Default)]
pub struct LocalTrackSlots {
    pub audio: Option<Arc<dyn LocalMediaTrack>>,
    pub video: Option<Arc<dyn LocalMediaTrack>>,
}

/// State of one call attempt, scoped to a single mount of the call UI.
///
/// The controller is the only writer; every control operation reads and
/// writes this object directly.
pub struct CallSession {
    pub session_id: String,
    pub channel: String,
    pub phase: CallPhase,
    pub error: Option<String>,
    pub voice_only: bool,
    pub client: Option<Arc<dyn MediaClient>>,
    pub local: LocalTrackSlots,
    /// The camera track has been handed to the client. Independent of
    /// `camera_enabled`: disabling never unpublishes.
    pub video_published: bool,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub duration_seconds: u64,
    pub started_at: Option<DateTime<Utc>>,
    pub roster: ParticipantRoster,
    /// Subscribed remote audio, keyed by participant id.
    pub remote_audio: HashMap<String, Arc<dyn RemoteMediaTrack>>,
}

impl CallSession {
    pub fn new(channel: String, voice_only: bool) -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            channel,
            phase: CallPhase::Uninitialized,
            error: None,
            voice_only,
            client: None,
            local: LocalTrackSlots::default(),
            video_published: false,
            mic_enabled: true,
            camera_enabled: !voice_only,
            duration_seconds: 0,
            started_at: None,
            roster: ParticipantRoster::new(),
            remote_audio: HashMap::new(),
        }
    }

    /// Move to `next` if the state machine allows it.
    pub fn transition(&mut self, next: CallPhase) -> bool {
        if !self.phase.can_transition_to(next) {
            tracing::debug!(
                "session {}: ignoring transition {} -> {next}",
                self.session_id,
                self.phase
            );
            return false;
        }
        tracing::info!("session {}: {} -> {next}", self.session_id, self.phase);
        self.phase = next;
        true
    }

    pub fn formatted_duration(&self) -> String {
        format_duration(self.duration_seconds)
    }
}

/// Render a call duration as `MM:SS`.
///
/// Minutes are not rolled over into hours; an hour-long call shows `60:00`.
pub fn format_duration(seconds: u64) -> String {
    format!("{:02}:{:02}", seconds / 60, seconds % 60)
}
