//! Huddle call core.
//!
//! Runs the lifecycle of a one-to-one audio/video call: credentials, local
//! capture tracks, joining and publishing, remote participant tracking, and
//! an ordered teardown that is safe at any point of initialization.
//!
//! The media SDK sits behind the traits in [`media`]; the `livekit` feature
//! provides a LiveKit-backed implementation.

pub mod audio_playout;
pub mod controller;
pub mod credentials;
pub mod errors;
pub mod events;
#[cfg(feature = "livekit")]
pub mod livekit_media;
pub mod media;
pub mod participants;
pub mod session;
pub mod settings;
pub mod store;

#[cfg(test)]
mod testing;

pub use audio_playout::AudioPlayoutBuffer;
pub use controller::{CallController, CallOptions, CallView};
pub use credentials::{CredentialProvider, Credentials, TokenServiceClient};
pub use errors::{HuddleError, MediaError};
pub use events::{CallEvent, CallEventListener, EndReason, LeaveReason, MediaEvent};
pub use media::{MediaClient, MediaKind, MediaProvider, TrackConfig};
pub use participants::RemoteParticipant;
pub use session::CallPhase;
pub use settings::{CallSettings, SettingsStore};
pub use store::{ActiveCallSnapshot, ActiveCallStore, CallControls};

/// Install the process-wide tracing subscriber. Later calls are no-ops.
///
/// Honors `RUST_LOG`; defaults to debug output for this crate.
pub fn init_logging() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("huddle_core=debug"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_ansi(false)
            .try_init();
    });
}
