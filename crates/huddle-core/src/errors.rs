use thiserror::Error;

use crate::media::MediaKind;

/// Failures surfaced by the call controller.
///
/// Initialization failures (credentials, media, join, publish) all end the
/// session in `CallPhase::Failed` with this error's message.
#[derive(Debug, Error)]
pub enum HuddleError {
    /// Shown to the user as-is.
    #[error("{0}")]
    Credential(String),
    #[error("could not start camera or microphone: {0}")]
    MediaAcquisition(#[source] MediaError),
    #[error("could not join the call: {0}")]
    Join(#[source] MediaError),
    #[error("could not publish local media: {0}")]
    Publish(#[source] MediaError),
    #[error("could not subscribe to remote media: {0}")]
    Subscribe(#[source] MediaError),
    #[error("no local {0} track")]
    NoLocalTrack(MediaKind),
    #[error("invalid call target: {0}")]
    InvalidTarget(String),
    #[error("http error: {0}")]
    Http(String),
}

/// Failures reported by the media SDK.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("device error: {0}")]
    Device(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("not connected")]
    NotConnected,
    #[error("unsupported: {0}")]
    Unsupported(String),
}
