use std::sync::Arc;

use crate::media::MediaKind;
use crate::participants::RemoteParticipant;
use crate::session::CallPhase;

/// Events emitted by the controller to UI listeners.
#[derive(Debug, Clone)]
pub enum CallEvent {
    PhaseChanged(CallPhase),
    Failed(String),
    ParticipantJoined(RemoteParticipant),
    ParticipantUpdated(RemoteParticipant),
    ParticipantLeft(String), // participant id
    LocalMediaChanged { mic_enabled: bool, camera_enabled: bool },
    DurationTick(u64),
    CallEnded { duration_seconds: u64, reason: EndReason },
    MaximizeRequested,
}

/// What ended the call from the controller's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    /// The local user pressed end-call (directly or from the minimized widget).
    Local,
    /// A remote participant quit or timed out.
    RemoteLeft(LeaveReason),
}

/// Notifications delivered by the media SDK to the client's registered handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediaEvent {
    ParticipantJoined { participant_id: String },
    ParticipantPublished { participant_id: String, kind: MediaKind },
    ParticipantUnpublished { participant_id: String, kind: MediaKind },
    ParticipantLeft { participant_id: String, reason: LeaveReason },
}

/// Why a remote participant left the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveReason {
    /// The participant left normally.
    Quit,
    /// The server stopped hearing from the participant.
    ServerTimeout,
    /// The participant switched to a non-publishing role.
    RoleChanged,
    Other(String),
}

impl LeaveReason {
    /// Leave reasons that end the local call as well.
    ///
    /// Other reasons keep the session running, even with nobody left in it.
    pub fn ends_call(&self) -> bool {
        matches!(self, LeaveReason::Quit | LeaveReason::ServerTimeout)
    }
}

/// Connection state of a media client handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
}

impl ConnectionState {
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Connecting)
    }
}

/// Trait for receiving events from the controller.
/// Implementations must be Send + Sync (called from tokio tasks).
pub trait CallEventListener: Send + Sync {
    fn on_event(&self, event: CallEvent);
}

/// Internal event emitter that dispatches to registered listeners.
#[derive(Clone)]
pub struct EventEmitter {
    listeners: Arc<std::sync::RwLock<Vec<Arc<dyn CallEventListener>>>>,
}

impl EventEmitter {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(std::sync::RwLock::new(Vec::new())),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.listeners.write().unwrap().push(listener);
    }

    pub fn emit(&self, event: CallEvent) {
        let listeners = self.listeners.read().unwrap();
        for listener in listeners.iter() {
            listener.on_event(event.clone());
        }
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingListener {
        count: Arc<AtomicUsize>,
    }

    impl CallEventListener for CountingListener {
        fn on_event(&self, _event: CallEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn emitter_dispatches_to_every_listener() {
        let emitter = EventEmitter::new();
        let count1 = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::new(AtomicUsize::new(0));

        emitter.add_listener(Arc::new(CountingListener { count: count1.clone() }));
        emitter.add_listener(Arc::new(CountingListener { count: count2.clone() }));

        emitter.emit(CallEvent::PhaseChanged(CallPhase::Joining));

        assert_eq!(count1.load(Ordering::SeqCst), 1);
        assert_eq!(count2.load(Ordering::SeqCst), 1);
    }

    struct EventCapture {
        events: Arc<std::sync::Mutex<Vec<CallEvent>>>,
    }

    impl CallEventListener for EventCapture {
        fn on_event(&self, event: CallEvent) {
            self.events.lock().unwrap().push(event);
        }
    }

    #[test]
    fn emitter_delivers_correct_events() {
        let emitter = EventEmitter::new();
        let events = Arc::new(std::sync::Mutex::new(Vec::new()));
        emitter.add_listener(Arc::new(EventCapture { events: events.clone() }));

        emitter.emit(CallEvent::ParticipantLeft("p1".to_string()));

        let captured = events.lock().unwrap();
        assert_eq!(captured.len(), 1);
        match &captured[0] {
            CallEvent::ParticipantLeft(id) => assert_eq!(id, "p1"),
            _ => panic!("expected ParticipantLeft"),
        }
    }

    #[test]
    fn only_quit_and_timeout_end_the_call() {
        assert!(LeaveReason::Quit.ends_call());
        assert!(LeaveReason::ServerTimeout.ends_call());
        assert!(!LeaveReason::RoleChanged.ends_call());
        assert!(!LeaveReason::Other("kicked".into()).ends_call());
    }

    #[test]
    fn connecting_and_connected_are_live() {
        assert!(ConnectionState::Connected.is_live());
        assert!(ConnectionState::Connecting.is_live());
        assert!(!ConnectionState::Reconnecting.is_live());
        assert!(!ConnectionState::Disconnected.is_live());
    }
}
