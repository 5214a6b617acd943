//! In-memory credential and media providers that record every call.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::credentials::{CredentialProvider, Credentials};
use crate::errors::{HuddleError, MediaError};
use crate::events::{CallEvent, CallEventListener, ConnectionState, MediaEvent};
use crate::media::{
    LocalMediaTrack, LocalTracks, MediaClient, MediaEventSink, MediaKind, MediaProvider,
    RemoteMediaTrack, TrackConfig,
};

pub struct FakeCredentials {
    fetches: AtomicUsize,
    delay: Duration,
    failure: Option<String>,
}

impl FakeCredentials {
    pub fn new() -> Self {
        Self {
            fetches: AtomicUsize::new(0),
            delay: Duration::ZERO,
            failure: None,
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            failure: Some(message.to_string()),
            ..Self::new()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::new()
        }
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialProvider for FakeCredentials {
    async fn fetch_credentials(&self, channel: &str) -> Result<Credentials, HuddleError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(message) = &self.failure {
            return Err(HuddleError::Credential(message.clone()));
        }
        Ok(Credentials {
            app_id: "test-app".into(),
            channel_name: channel.to_string(),
            token: format!("token-{channel}"),
            uid: 1,
        })
    }
}

pub struct FakeLocalTrack {
    kind: MediaKind,
    enabled: AtomicBool,
    stops: AtomicUsize,
    closes: AtomicUsize,
    fail_stop: AtomicBool,
}

impl FakeLocalTrack {
    pub fn new(kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            kind,
            enabled: AtomicBool::new(true),
            stops: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            fail_stop: AtomicBool::new(false),
        })
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn fail_stop(&self) {
        self.fail_stop.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalMediaTrack for FakeLocalTrack {
    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn set_enabled(&self, enabled: bool) -> Result<(), MediaError> {
        self.enabled.store(enabled, Ordering::SeqCst);
        Ok(())
    }

    fn stop(&self) -> Result<(), MediaError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        if self.fail_stop.load(Ordering::SeqCst) {
            return Err(MediaError::Device("device busy".into()));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), MediaError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
pub struct FakeRemoteTrack {
    id: String,
    kind: MediaKind,
    plays: AtomicUsize,
    stops: AtomicUsize,
}

impl FakeRemoteTrack {
    pub fn new(id: &str, kind: MediaKind) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            kind,
            plays: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
        })
    }

    pub fn play_count(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    pub fn stop_count(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

impl RemoteMediaTrack for FakeRemoteTrack {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn play(&self) {
        self.plays.fetch_add(1, Ordering::SeqCst);
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

/// Shared record of everything the controller asked the SDK to do.
#[derive(Default)]
pub struct FakeMediaState {
    clients_created: AtomicUsize,
    joins: AtomicUsize,
    leaves: AtomicUsize,
    handlers_removed: AtomicUsize,
    handlers_before_join: AtomicBool,
    joined_with: Mutex<Option<Credentials>>,
    publishes: Mutex<Vec<Vec<MediaKind>>>,
    subscribes: Mutex<Vec<(String, MediaKind)>>,
    remote_tracks: Mutex<Vec<Arc<FakeRemoteTrack>>>,
    audio: Mutex<Option<Arc<FakeLocalTrack>>>,
    video: Mutex<Option<Arc<FakeLocalTrack>>>,
    sink: Mutex<Option<MediaEventSink>>,
    connection: Mutex<Option<ConnectionState>>,
    track_delay: Mutex<Duration>,
    join_delay: Mutex<Duration>,
    track_failure: Mutex<Option<MediaError>>,
    join_failure: Mutex<Option<MediaError>>,
    leave_failure: Mutex<Option<MediaError>>,
    publish_failure: Mutex<Option<MediaError>>,
    /// Publishes that succeed before `publish_failure` applies.
    publishes_before_failure: AtomicUsize,
    subscribe_failure: Mutex<Option<MediaError>>,
}

#[derive(Clone, Default)]
pub struct FakeMedia {
    state: Arc<FakeMediaState>,
}

impl FakeMedia {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_track_delay(self, delay: Duration) -> Self {
        *self.state.track_delay.lock().unwrap() = delay;
        self
    }

    pub fn with_join_delay(self, delay: Duration) -> Self {
        *self.state.join_delay.lock().unwrap() = delay;
        self
    }

    pub fn failing_tracks(self, error: MediaError) -> Self {
        *self.state.track_failure.lock().unwrap() = Some(error);
        self
    }

    pub fn failing_join(self, error: MediaError) -> Self {
        *self.state.join_failure.lock().unwrap() = Some(error);
        self
    }

    pub fn failing_leave(self, error: MediaError) -> Self {
        *self.state.leave_failure.lock().unwrap() = Some(error);
        self
    }

    /// Every publish fails.
    pub fn failing_publish(self, error: MediaError) -> Self {
        *self.state.publish_failure.lock().unwrap() = Some(error);
        self
    }

    /// The initial publish succeeds; later ones fail.
    pub fn failing_later_publish(self, error: MediaError) -> Self {
        self.state.publishes_before_failure.store(1, Ordering::SeqCst);
        self.failing_publish(error)
    }

    pub fn failing_subscribe(self, error: MediaError) -> Self {
        *self.state.subscribe_failure.lock().unwrap() = Some(error);
        self
    }

    /// Deliver an SDK notification to the registered handlers.
    pub fn emit(&self, event: MediaEvent) {
        let sink = self.state.sink.lock().unwrap();
        let sink = sink.as_ref().expect("no handlers registered");
        sink.send(event).expect("event pump stopped");
    }

    pub fn clients_created(&self) -> usize {
        self.state.clients_created.load(Ordering::SeqCst)
    }

    pub fn joins(&self) -> usize {
        self.state.joins.load(Ordering::SeqCst)
    }

    pub fn leaves(&self) -> usize {
        self.state.leaves.load(Ordering::SeqCst)
    }

    pub fn handlers_removed(&self) -> usize {
        self.state.handlers_removed.load(Ordering::SeqCst)
    }

    pub fn handlers_registered_before_join(&self) -> bool {
        self.state.handlers_before_join.load(Ordering::SeqCst)
    }

    pub fn joined_with(&self) -> Option<Credentials> {
        self.state.joined_with.lock().unwrap().clone()
    }

    pub fn publishes(&self) -> Vec<Vec<MediaKind>> {
        self.state.publishes.lock().unwrap().clone()
    }

    pub fn subscribes(&self) -> Vec<(String, MediaKind)> {
        self.state.subscribes.lock().unwrap().clone()
    }

    pub fn remote_track(&self, id: &str) -> Option<Arc<FakeRemoteTrack>> {
        self.state
            .remote_tracks
            .lock()
            .unwrap()
            .iter()
            .find(|t| t.id == id)
            .cloned()
    }

    pub fn audio_track(&self) -> Option<Arc<FakeLocalTrack>> {
        self.state.audio.lock().unwrap().clone()
    }

    pub fn video_track(&self) -> Option<Arc<FakeLocalTrack>> {
        self.state.video.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaProvider for FakeMedia {
    fn create_client(&self) -> Arc<dyn MediaClient> {
        self.state.clients_created.fetch_add(1, Ordering::SeqCst);
        *self.state.connection.lock().unwrap() = Some(ConnectionState::Disconnected);
        Arc::new(FakeClient {
            state: self.state.clone(),
        })
    }

    async fn create_local_tracks(&self, _config: &TrackConfig) -> Result<LocalTracks, MediaError> {
        let delay = *self.state.track_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.state.track_failure.lock().unwrap().clone() {
            return Err(err);
        }
        let audio = FakeLocalTrack::new(MediaKind::Audio);
        let video = FakeLocalTrack::new(MediaKind::Video);
        *self.state.audio.lock().unwrap() = Some(audio.clone());
        *self.state.video.lock().unwrap() = Some(video.clone());
        Ok(LocalTracks { audio, video })
    }
}

struct FakeClient {
    state: Arc<FakeMediaState>,
}

#[async_trait]
impl MediaClient for FakeClient {
    fn connection_state(&self) -> ConnectionState {
        self.state
            .connection
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ConnectionState::Disconnected)
    }

    fn register_handlers(&self, sink: MediaEventSink) {
        *self.state.sink.lock().unwrap() = Some(sink);
    }

    fn remove_all_handlers(&self) {
        self.state.handlers_removed.fetch_add(1, Ordering::SeqCst);
        *self.state.sink.lock().unwrap() = None;
    }

    async fn join(&self, credentials: &Credentials) -> Result<(), MediaError> {
        self.state.joins.fetch_add(1, Ordering::SeqCst);
        let registered = self.state.sink.lock().unwrap().is_some();
        self.state.handlers_before_join.store(registered, Ordering::SeqCst);
        *self.state.connection.lock().unwrap() = Some(ConnectionState::Connecting);

        let delay = *self.state.join_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.state.join_failure.lock().unwrap().clone() {
            *self.state.connection.lock().unwrap() = Some(ConnectionState::Disconnected);
            return Err(err);
        }
        *self.state.joined_with.lock().unwrap() = Some(credentials.clone());
        *self.state.connection.lock().unwrap() = Some(ConnectionState::Connected);
        Ok(())
    }

    async fn publish(&self, tracks: &[Arc<dyn LocalMediaTrack>]) -> Result<(), MediaError> {
        let kinds = tracks.iter().map(|t| t.kind()).collect();
        let mut publishes = self.state.publishes.lock().unwrap();
        publishes.push(kinds);
        if publishes.len() > self.state.publishes_before_failure.load(Ordering::SeqCst) {
            if let Some(err) = self.state.publish_failure.lock().unwrap().clone() {
                return Err(err);
            }
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        participant_id: &str,
        kind: MediaKind,
    ) -> Result<Arc<dyn RemoteMediaTrack>, MediaError> {
        self.state
            .subscribes
            .lock()
            .unwrap()
            .push((participant_id.to_string(), kind));
        if let Some(err) = self.state.subscribe_failure.lock().unwrap().clone() {
            return Err(err);
        }
        let track = FakeRemoteTrack::new(&format!("{participant_id}-{kind}"), kind);
        self.state.remote_tracks.lock().unwrap().push(track.clone());
        Ok(track)
    }

    async fn leave(&self) -> Result<(), MediaError> {
        self.state.leaves.fetch_add(1, Ordering::SeqCst);
        *self.state.connection.lock().unwrap() = Some(ConnectionState::Disconnected);
        match self.state.leave_failure.lock().unwrap().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Listener that keeps every event it sees.
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Vec<CallEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<CallEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&CallEvent) -> bool) -> usize {
        self.events.lock().unwrap().iter().filter(|e| pred(e)).count()
    }
}

impl CallEventListener for RecordingListener {
    fn on_event(&self, event: CallEvent) {
        self.events.lock().unwrap().push(event);
    }
}
