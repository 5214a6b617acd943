//! App-wide projection of the active call.
//!
//! The controller writes into the store; it never reads it back. A minimized
//! call widget observes the snapshot and drives the call through
//! [`CallControls`] without holding a reference to the controller.

use std::sync::{Arc, Mutex, OnceLock};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};

/// What the rest of the app may know about the active call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveCallSnapshot {
    pub session_id: String,
    pub channel: String,
    pub voice_only: bool,
    pub duration_seconds: u64,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub started_at: DateTime<Utc>,
}

/// Commands accepted from outside the call screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    ToggleMic,
    ToggleCamera,
    EndCall,
    MaximizeCall,
}

/// Remote control for the active call.
///
/// Each method returns `false` once the call has been torn down.
#[derive(Debug, Clone)]
pub struct CallControls {
    tx: mpsc::UnboundedSender<ControlCommand>,
}

impl CallControls {
    pub(crate) fn new(tx: mpsc::UnboundedSender<ControlCommand>) -> Self {
        Self { tx }
    }

    pub fn toggle_mic(&self) -> bool {
        self.send(ControlCommand::ToggleMic)
    }

    pub fn toggle_camera(&self) -> bool {
        self.send(ControlCommand::ToggleCamera)
    }

    pub fn end_call(&self) -> bool {
        self.send(ControlCommand::EndCall)
    }

    pub fn maximize_call(&self) -> bool {
        self.send(ControlCommand::MaximizeCall)
    }

    fn send(&self, command: ControlCommand) -> bool {
        self.tx.send(command).is_ok()
    }
}

struct StoreInner {
    state: watch::Sender<Option<ActiveCallSnapshot>>,
    controls: Mutex<Option<CallControls>>,
}

/// Observable store holding at most one active call.
#[derive(Clone)]
pub struct ActiveCallStore {
    inner: Arc<StoreInner>,
}

static GLOBAL: OnceLock<ActiveCallStore> = OnceLock::new();

impl ActiveCallStore {
    pub fn new() -> Self {
        let (state, _) = watch::channel(None);
        Self {
            inner: Arc::new(StoreInner {
                state,
                controls: Mutex::new(None),
            }),
        }
    }

    /// The process-wide store shared by all call screens.
    pub fn global() -> &'static ActiveCallStore {
        GLOBAL.get_or_init(ActiveCallStore::new)
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<ActiveCallSnapshot>> {
        self.inner.state.subscribe()
    }

    pub fn current(&self) -> Option<ActiveCallSnapshot> {
        self.inner.state.borrow().clone()
    }

    pub fn controls(&self) -> Option<CallControls> {
        self.inner.controls.lock().unwrap().clone()
    }

    /// Publish a newly active call, replacing whatever was there.
    pub(crate) fn activate(&self, snapshot: ActiveCallSnapshot, controls: CallControls) {
        tracing::debug!("active call published: {}", snapshot.session_id);
        *self.inner.controls.lock().unwrap() = Some(controls);
        self.inner.state.send_replace(Some(snapshot));
    }

    /// Apply `f` to the snapshot if it still belongs to `session_id`.
    pub(crate) fn update(&self, session_id: &str, f: impl FnOnce(&mut ActiveCallSnapshot)) {
        self.inner.state.send_if_modified(|state| match state {
            Some(snapshot) if snapshot.session_id == session_id => {
                f(snapshot);
                true
            }
            _ => false,
        });
    }

    /// Drop the projection of `session_id`. Another session's entry is left alone.
    pub(crate) fn clear(&self, session_id: &str) {
        let cleared = self.inner.state.send_if_modified(|state| {
            if state.as_ref().is_some_and(|s| s.session_id == session_id) {
                *state = None;
                true
            } else {
                false
            }
        });
        if cleared {
            *self.inner.controls.lock().unwrap() = None;
            tracing::debug!("active call cleared: {session_id}");
        }
    }
}

impl Default for ActiveCallStore {
    fn default() -> Self {
        Self::new()
    }
}
