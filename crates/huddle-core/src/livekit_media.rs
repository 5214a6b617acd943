//! LiveKit implementation of the media contract.
//!
//! Credentials map onto LiveKit as: `app_id` is the server URL, `token` the
//! access token. Remote participants are identified by their LiveKit identity.
//! Subscriptions are manual (`auto_subscribe = false`) so the controller decides
//! what to pull; decoded remote audio is fed into a shared [`AudioPlayoutBuffer`]
//! for the platform speaker.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use livekit::options::{TrackPublishOptions, VideoEncoding};
use livekit::prelude::{
    LocalAudioTrack, LocalTrack, LocalVideoTrack, RemoteParticipant, RemoteTrack, Room, RoomEvent,
    RoomOptions,
};
use livekit::track::{TrackKind as LkTrackKind, TrackSource as LkTrackSource};
use livekit::webrtc::audio_source::native::NativeAudioSource;
use livekit::webrtc::audio_stream::native::NativeAudioStream;
use livekit::webrtc::prelude::{AudioSourceOptions, RtcAudioSource, RtcVideoSource, VideoResolution};
use livekit::webrtc::video_source::native::NativeVideoSource;
use livekit_api::access_token::{AccessToken, VideoGrants};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;

use crate::audio_playout::{AudioPlayoutBuffer, PLAYOUT_CHANNELS, PLAYOUT_SAMPLE_RATE};
use crate::credentials::{CredentialProvider, Credentials};
use crate::errors::{HuddleError, MediaError};
use crate::events::{ConnectionState, LeaveReason, MediaEvent};
use crate::media::{
    LocalMediaTrack, LocalTracks, MediaClient, MediaEventSink, MediaKind, MediaProvider,
    RemoteMediaTrack, TrackConfig,
};

const AUDIO_QUEUE_SIZE_MS: u32 = 100;

/// Upper bound for the camera encoder at the default 640x480 profile.
const CAMERA_MAX_BITRATE: u64 = 600_000;

/// How long `subscribe` waits for the server to deliver the track.
const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(10);

type PendingSubscriptions = Arc<StdMutex<HashMap<String, oneshot::Sender<RemoteTrack>>>>;
type SharedSink = Arc<StdMutex<Option<MediaEventSink>>>;

fn lk_kind(kind: LkTrackKind) -> MediaKind {
    match kind {
        LkTrackKind::Audio => MediaKind::Audio,
        LkTrackKind::Video => MediaKind::Video,
    }
}

fn forward(sink: &SharedSink, event: MediaEvent) {
    if let Some(tx) = sink.lock().unwrap().as_ref() {
        let _ = tx.send(event);
    }
}

/// Remote participants already in `room`, with the kinds they publish.
fn existing_participants(room: &Room) -> Vec<(String, Vec<MediaKind>)> {
    room.remote_participants()
        .into_values()
        .map(|p| {
            let kinds = p
                .track_publications()
                .into_values()
                .map(|publication| lk_kind(publication.kind()))
                .collect();
            (p.identity().to_string(), kinds)
        })
        .collect()
}

/// Replay joins and publications of participants that were there before us.
fn announce_existing(sink: &SharedSink, participants: &[(String, Vec<MediaKind>)]) {
    for (participant_id, kinds) in participants {
        forward(
            sink,
            MediaEvent::ParticipantJoined {
                participant_id: participant_id.clone(),
            },
        );
        for kind in kinds {
            forward(
                sink,
                MediaEvent::ParticipantPublished {
                    participant_id: participant_id.clone(),
                    kind: *kind,
                },
            );
        }
    }
}

/// Creates LiveKit clients and local capture tracks.
pub struct LiveKitProvider {
    playout: Arc<AudioPlayoutBuffer>,
}

impl LiveKitProvider {
    pub fn new(playout: Arc<AudioPlayoutBuffer>) -> Self {
        Self { playout }
    }

    /// Buffer the platform audio output should pull remote audio from.
    pub fn playout(&self) -> Arc<AudioPlayoutBuffer> {
        self.playout.clone()
    }
}

#[async_trait]
impl MediaProvider for LiveKitProvider {
    fn create_client(&self) -> Arc<dyn MediaClient> {
        Arc::new(LiveKitClient::new(self.playout.clone()))
    }

    async fn create_local_tracks(&self, config: &TrackConfig) -> Result<LocalTracks, MediaError> {
        let audio_source = NativeAudioSource::new(
            AudioSourceOptions {
                echo_cancellation: config.audio.echo_cancellation,
                noise_suppression: config.audio.noise_suppression,
                auto_gain_control: config.audio.auto_gain_control,
            },
            PLAYOUT_SAMPLE_RATE,
            PLAYOUT_CHANNELS,
            AUDIO_QUEUE_SIZE_MS,
        );
        let audio = LocalAudioTrack::create_audio_track(
            "microphone",
            RtcAudioSource::Native(audio_source.clone()),
        );

        let video_source = NativeVideoSource::new(
            VideoResolution {
                width: config.video.width,
                height: config.video.height,
            },
            false,
        );
        let video = LocalVideoTrack::create_video_track(
            "camera",
            RtcVideoSource::Native(video_source.clone()),
        );

        tracing::info!(
            "local tracks created ({}x{} @{}fps)",
            config.video.width,
            config.video.height,
            config.video.frame_rate
        );
        Ok(LocalTracks {
            audio: Arc::new(LiveKitLocalTrack::new(
                LocalTrack::Audio(audio),
                LocalSource::Audio(audio_source),
                None,
            )),
            video: Arc::new(LiveKitLocalTrack::new(
                LocalTrack::Video(video),
                LocalSource::Video(video_source),
                Some(config.video.frame_rate),
            )),
        })
    }
}

/// Capture source native shells feed frames into.
#[derive(Clone)]
pub enum LocalSource {
    Audio(NativeAudioSource),
    Video(NativeVideoSource),
}

pub struct LiveKitLocalTrack {
    kind: MediaKind,
    track: StdMutex<Option<LocalTrack>>,
    source: LocalSource,
    frame_rate: Option<u32>,
    stopped: AtomicBool,
}

impl LiveKitLocalTrack {
    fn new(track: LocalTrack, source: LocalSource, frame_rate: Option<u32>) -> Self {
        let kind = match &track {
            LocalTrack::Audio(_) => MediaKind::Audio,
            LocalTrack::Video(_) => MediaKind::Video,
        };
        Self {
            kind,
            track: StdMutex::new(Some(track)),
            source,
            frame_rate,
            stopped: AtomicBool::new(false),
        }
    }

    pub fn source(&self) -> LocalSource {
        self.source.clone()
    }

    fn track(&self) -> Result<LocalTrack, MediaError> {
        self.track
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| MediaError::Device(format!("{} track closed", self.kind)))
    }

    fn set_muted(track: &LocalTrack, muted: bool) {
        match (track, muted) {
            (LocalTrack::Audio(t), true) => t.mute(),
            (LocalTrack::Audio(t), false) => t.unmute(),
            (LocalTrack::Video(t), true) => t.mute(),
            (LocalTrack::Video(t), false) => t.unmute(),
        }
    }

    fn publish_options(&self) -> TrackPublishOptions {
        match self.kind {
            MediaKind::Audio => TrackPublishOptions {
                source: LkTrackSource::Microphone,
                ..Default::default()
            },
            MediaKind::Video => TrackPublishOptions {
                source: LkTrackSource::Camera,
                video_encoding: self.frame_rate.map(|fps| VideoEncoding {
                    max_bitrate: CAMERA_MAX_BITRATE,
                    max_framerate: fps as f64,
                }),
                ..Default::default()
            },
        }
    }
}

#[async_trait]
impl LocalMediaTrack for LiveKitLocalTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn set_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(MediaError::Device(format!("{} track stopped", self.kind)));
        }
        Self::set_muted(&self.track()?, !enabled);
        Ok(())
    }

    fn stop(&self) -> Result<(), MediaError> {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            Self::set_muted(&self.track()?, true);
        }
        Ok(())
    }

    fn close(&self) -> Result<(), MediaError> {
        self.track.lock().unwrap().take();
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A subscribed remote track. Audio is decoded into the playout buffer
/// while playing; video is handed to the platform renderer.
pub struct LiveKitRemoteTrack {
    id: String,
    kind: MediaKind,
    track: RemoteTrack,
    playout: Arc<AudioPlayoutBuffer>,
    pump: StdMutex<Option<JoinHandle<()>>>,
}

impl LiveKitRemoteTrack {
    pub fn track(&self) -> &RemoteTrack {
        &self.track
    }
}

impl fmt::Debug for LiveKitRemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveKitRemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl RemoteMediaTrack for LiveKitRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self) {
        let RemoteTrack::Audio(audio) = &self.track else {
            return;
        };
        let mut pump = self.pump.lock().unwrap();
        if pump.is_some() {
            return;
        }
        let mut stream = NativeAudioStream::new(
            audio.rtc_track(),
            PLAYOUT_SAMPLE_RATE as i32,
            PLAYOUT_CHANNELS as i32,
        );
        let buf = self.playout.clone();
        let id = self.id.clone();
        *pump = Some(tokio::spawn(async move {
            tracing::info!("audio playout started for track {id}");
            while let Some(frame) = stream.next().await {
                buf.push(&frame.data);
            }
            tracing::info!("audio playout ended for track {id}");
        }));
    }

    fn stop(&self) {
        if let Some(handle) = self.pump.lock().unwrap().take() {
            handle.abort();
            tracing::info!("audio playout stopped for track {}", self.id);
        }
    }
}

/// One LiveKit room connection.
pub struct LiveKitClient {
    playout: Arc<AudioPlayoutBuffer>,
    state: Arc<StdMutex<ConnectionState>>,
    sink: SharedSink,
    room: Mutex<Option<Arc<Room>>>,
    pending: PendingSubscriptions,
    event_task: StdMutex<Option<JoinHandle<()>>>,
}

impl LiveKitClient {
    fn new(playout: Arc<AudioPlayoutBuffer>) -> Self {
        Self {
            playout,
            state: Arc::new(StdMutex::new(ConnectionState::Disconnected)),
            sink: Arc::new(StdMutex::new(None)),
            room: Mutex::new(None),
            pending: Arc::new(StdMutex::new(HashMap::new())),
            event_task: StdMutex::new(None),
        }
    }

    fn set_state(&self, state: ConnectionState) {
        *self.state.lock().unwrap() = state;
    }

    async fn room(&self) -> Result<Arc<Room>, MediaError> {
        self.room.lock().await.clone().ok_or(MediaError::NotConnected)
    }

    async fn pump_room_events(
        mut events: mpsc::UnboundedReceiver<RoomEvent>,
        sink: SharedSink,
        state: Arc<StdMutex<ConnectionState>>,
        pending: PendingSubscriptions,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                RoomEvent::Reconnecting => {
                    *state.lock().unwrap() = ConnectionState::Reconnecting;
                }

                RoomEvent::Reconnected => {
                    *state.lock().unwrap() = ConnectionState::Connected;
                }

                RoomEvent::Disconnected { reason } => {
                    tracing::info!("room disconnected: {reason:?}");
                    *state.lock().unwrap() = ConnectionState::Disconnected;
                    pending.lock().unwrap().clear();
                    break;
                }

                RoomEvent::ParticipantConnected(participant) => {
                    forward(
                        &sink,
                        MediaEvent::ParticipantJoined {
                            participant_id: participant.identity().to_string(),
                        },
                    );
                }

                RoomEvent::ParticipantDisconnected(participant) => {
                    // LiveKit does not tell a clean quit from a timeout here.
                    forward(
                        &sink,
                        MediaEvent::ParticipantLeft {
                            participant_id: participant.identity().to_string(),
                            reason: LeaveReason::Quit,
                        },
                    );
                }

                RoomEvent::TrackPublished { publication, participant } => {
                    forward(
                        &sink,
                        MediaEvent::ParticipantPublished {
                            participant_id: participant.identity().to_string(),
                            kind: lk_kind(publication.kind()),
                        },
                    );
                }

                RoomEvent::TrackUnpublished { publication, participant } => {
                    forward(
                        &sink,
                        MediaEvent::ParticipantUnpublished {
                            participant_id: participant.identity().to_string(),
                            kind: lk_kind(publication.kind()),
                        },
                    );
                }

                RoomEvent::TrackSubscribed { track, publication, .. } => {
                    let sid = publication.sid().to_string();
                    if let Some(waiter) = pending.lock().unwrap().remove(&sid) {
                        let _ = waiter.send(track);
                    }
                }

                _ => {}
            }
        }
        tracing::debug!("room event loop ended");
    }

    fn find_participant(room: &Room, participant_id: &str) -> Option<RemoteParticipant> {
        room.remote_participants()
            .into_values()
            .find(|p| p.identity().to_string() == participant_id)
    }
}

#[async_trait]
impl MediaClient for LiveKitClient {
    fn connection_state(&self) -> ConnectionState {
        self.state.lock().unwrap().clone()
    }

    fn register_handlers(&self, sink: MediaEventSink) {
        *self.sink.lock().unwrap() = Some(sink);
    }

    fn remove_all_handlers(&self) {
        self.sink.lock().unwrap().take();
    }

    async fn join(&self, credentials: &Credentials) -> Result<(), MediaError> {
        self.set_state(ConnectionState::Connecting);

        let mut options = RoomOptions::default();
        options.auto_subscribe = false;

        let (room, events) = match Room::connect(&credentials.app_id, &credentials.token, options).await {
            Ok(connected) => connected,
            Err(e) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(MediaError::Transport(e.to_string()));
            }
        };
        let room = Arc::new(room);
        *self.room.lock().await = Some(room.clone());

        let task = tokio::spawn(Self::pump_room_events(
            events,
            self.sink.clone(),
            self.state.clone(),
            self.pending.clone(),
        ));
        *self.event_task.lock().unwrap() = Some(task);
        self.set_state(ConnectionState::Connected);
        tracing::info!("connected to room {}", credentials.channel_name);

        // Subscribing to what these announce needs the room installed above.
        announce_existing(&self.sink, &existing_participants(&room));
        Ok(())
    }

    async fn publish(&self, tracks: &[Arc<dyn LocalMediaTrack>]) -> Result<(), MediaError> {
        let room = self.room().await?;
        for track in tracks {
            let track = track
                .as_any()
                .downcast_ref::<LiveKitLocalTrack>()
                .ok_or_else(|| MediaError::Unsupported("track was not created by LiveKit".into()))?;
            room.local_participant()
                .publish_track(track.track()?, track.publish_options())
                .await
                .map_err(|e| MediaError::Transport(format!("publish {}: {e}", track.kind)))?;
            tracing::info!("{} track published", track.kind);
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        participant_id: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn RemoteMediaTrack>, MediaError> {
        let room = self.room().await?;
        let participant = Self::find_participant(&room, participant_id)
            .ok_or_else(|| MediaError::Transport(format!("unknown participant {participant_id}")))?;
        let publication = participant
            .track_publications()
            .into_values()
            .find(|p| lk_kind(p.kind()) == kind)
            .ok_or_else(|| MediaError::Transport(format!("{participant_id} has no {kind} track")))?;
        let sid = publication.sid().to_string();

        let track = match publication.track() {
            Some(track) => track,
            None => {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().unwrap().insert(sid.clone(), tx);
                publication.set_subscribed(true);
                match tokio::time::timeout(SUBSCRIBE_TIMEOUT, rx).await {
                    Ok(Ok(track)) => track,
                    Ok(Err(_)) => return Err(MediaError::NotConnected),
                    Err(_) => {
                        self.pending.lock().unwrap().remove(&sid);
                        return Err(MediaError::Transport(format!(
                            "timed out subscribing to {participant_id} {kind}"
                        )));
                    }
                }
            }
        };

        Ok(Arc::new(LiveKitRemoteTrack {
            id: sid,
            kind,
            track,
            playout: self.playout.clone(),
            pump: StdMutex::new(None),
        }))
    }

    async fn leave(&self) -> Result<(), MediaError> {
        self.set_state(ConnectionState::Disconnecting);
        let room = self.room.lock().await.take();
        let result = match room {
            Some(room) => room.close().await.map_err(|e| MediaError::Transport(e.to_string())),
            None => Ok(()),
        };
        if let Some(task) = self.event_task.lock().unwrap().take() {
            task.abort();
        }
        self.pending.lock().unwrap().clear();
        self.playout.clear();
        self.set_state(ConnectionState::Disconnected);
        result
    }
}

/// Issues LiveKit access tokens locally from an API key and secret.
///
/// Meant for development servers; production deployments fetch tokens from
/// a token service instead.
pub struct LiveKitTokenMinter {
    server_url: String,
    api_key: String,
    api_secret: String,
    uid: u32,
    ttl: Duration,
}

impl LiveKitTokenMinter {
    pub fn new(server_url: &str, api_key: &str, api_secret: &str, uid: u32) -> Self {
        Self {
            server_url: server_url.to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            uid,
            ttl: Duration::from_secs(6 * 60 * 60),
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    fn identity(&self) -> String {
        format!("uid-{}", self.uid)
    }
}

#[async_trait]
impl CredentialProvider for LiveKitTokenMinter {
    async fn fetch_credentials(&self, channel: &str) -> Result<Credentials, HuddleError> {
        let token = AccessToken::with_api_key(&self.api_key, &self.api_secret)
            .with_identity(&self.identity())
            .with_ttl(self.ttl)
            .with_grants(VideoGrants {
                room_join: true,
                room: channel.to_string(),
                can_publish: true,
                can_subscribe: true,
                ..Default::default()
            })
            .to_jwt()
            .map_err(|e| HuddleError::Credential(format!("could not mint access token: {e}")))?;

        Ok(Credentials {
            app_id: self.server_url.clone(),
            channel_name: channel.to_string(),
            token,
            uid: self.uid,
        })
    }
}
