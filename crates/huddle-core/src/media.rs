//! Media capability contract.
//!
//! The controller drives the real-time media SDK exclusively through these
//! traits. Codec negotiation, transport and signaling stay inside the SDK.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::credentials::Credentials;
use crate::errors::MediaError;
use crate::events::{ConnectionState, MediaEvent};

/// Default capture profile for calls.
pub const DEFAULT_VIDEO_WIDTH: u32 = 640;
pub const DEFAULT_VIDEO_HEIGHT: u32 = 480;
pub const DEFAULT_VIDEO_FRAME_RATE: u32 = 15;

/// Channel the SDK delivers participant notifications on.
pub type MediaEventSink = mpsc::UnboundedSender<MediaEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoEncoderConfig {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioProcessingConfig {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

/// Encoder parameters for the local microphone/camera pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackConfig {
    pub video: VideoEncoderConfig,
    pub audio: AudioProcessingConfig,
}

impl Default for TrackConfig {
    fn default() -> Self {
        Self {
            video: VideoEncoderConfig {
                width: DEFAULT_VIDEO_WIDTH,
                height: DEFAULT_VIDEO_HEIGHT,
                frame_rate: DEFAULT_VIDEO_FRAME_RATE,
            },
            audio: AudioProcessingConfig {
                echo_cancellation: true,
                noise_suppression: true,
                auto_gain_control: true,
            },
        }
    }
}

/// A local capture track. Owned by exactly one call session.
#[async_trait]
pub trait LocalMediaTrack: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Enable or disable capture without unpublishing.
    async fn set_enabled(&self, enabled: bool) -> Result<(), MediaError>;

    /// Stop capturing from the device.
    fn stop(&self) -> Result<(), MediaError>;

    /// Release the underlying device handle. The track is unusable afterwards.
    fn close(&self) -> Result<(), MediaError>;

    /// Lets SDK adapters recover their concrete track type in `publish`.
    fn as_any(&self) -> &dyn Any;
}

/// A remote track. Its lifecycle belongs to the SDK; the controller only
/// keeps it around for rendering and playback.
pub trait RemoteMediaTrack: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;
    fn kind(&self) -> MediaKind;
    fn play(&self);
    fn stop(&self);
}

/// Microphone and camera created together in one operation.
pub struct LocalTracks {
    pub audio: Arc<dyn LocalMediaTrack>,
    pub video: Arc<dyn LocalMediaTrack>,
}

/// Entry point into the media SDK.
#[async_trait]
pub trait MediaProvider: Send + Sync {
    fn create_client(&self) -> Arc<dyn MediaClient>;

    /// Create the microphone and camera tracks as one joint operation.
    async fn create_local_tracks(&self, config: &TrackConfig) -> Result<LocalTracks, MediaError>;
}

/// A client handle for one channel connection.
#[async_trait]
pub trait MediaClient: Send + Sync {
    fn connection_state(&self) -> ConnectionState;

    /// Route participant notifications to `sink`. Must be called before `join`.
    fn register_handlers(&self, sink: MediaEventSink);

    fn remove_all_handlers(&self);

    async fn join(&self, credentials: &Credentials) -> Result<(), MediaError>;

    async fn publish(&self, tracks: &[Arc<dyn LocalMediaTrack>]) -> Result<(), MediaError>;

    async fn subscribe(
        &self,
        participant_id: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn RemoteMediaTrack>, MediaError>;

    async fn leave(&self) -> Result<(), MediaError>;
}
