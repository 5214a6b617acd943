//! Call session controller.
//!
//! Drives one call attempt from credential fetch to teardown:
//!
//! ```text
//! Uninitialized -> AcquiringCredentials -> AcquiringMedia -> Joining
//!     -> Joined -> Publishing -> Active -> TearingDown -> Closed
//! ```
//!
//! Any initialization failure ends in `Failed`. Media SDK operations cannot be
//! cancelled, so every step re-checks the mounted flag once it resumes and
//! discards its result if the call screen has gone away in the meantime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::credentials::{resolve_channel, CredentialProvider, CredentialRequest};
use crate::errors::HuddleError;
use crate::events::{CallEvent, CallEventListener, EndReason, EventEmitter, MediaEvent};
use crate::media::{LocalMediaTrack, MediaClient, MediaKind, MediaProvider, RemoteMediaTrack, TrackConfig};
use crate::participants::RemoteParticipant;
use crate::session::{format_duration, CallPhase, CallSession};
use crate::settings::CallSettings;
use crate::store::{ActiveCallSnapshot, ActiveCallStore, CallControls, ControlCommand};

/// Callback invoked once when the call ends, with the elapsed seconds.
pub type CallEndCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Construction-time inputs for one call.
#[derive(Clone)]
pub struct CallOptions {
    pub recipient: String,
    pub channel_override: Option<String>,
    pub preset_token: Option<String>,
    pub preset_uid: Option<u32>,
    pub preset_app_id: Option<String>,
    pub voice_only: bool,
    pub on_call_end: CallEndCallback,
}

impl CallOptions {
    pub fn new(recipient: impl Into<String>, on_call_end: impl Fn(u64) + Send + Sync + 'static) -> Self {
        Self {
            recipient: recipient.into(),
            channel_override: None,
            preset_token: None,
            preset_uid: None,
            preset_app_id: None,
            voice_only: false,
            on_call_end: Arc::new(on_call_end),
        }
    }
}

/// Snapshot of the session for rendering.
#[derive(Debug, Clone)]
pub struct CallView {
    pub session_id: String,
    pub channel: String,
    pub phase: CallPhase,
    pub error: Option<String>,
    pub participants: Vec<RemoteParticipant>,
    pub mic_enabled: bool,
    pub camera_enabled: bool,
    pub video_published: bool,
    pub duration_seconds: u64,
    pub formatted_duration: String,
}

struct ControllerInner {
    session_id: String,
    session: Mutex<CallSession>,
    request: CredentialRequest,
    on_call_end: CallEndCallback,
    credentials: Arc<dyn CredentialProvider>,
    media: Arc<dyn MediaProvider>,
    track_config: TrackConfig,
    teardown_grace: Duration,
    emitter: EventEmitter,
    store: ActiveCallStore,
    mounted: AtomicBool,
    teardown_started: AtomicBool,
    ended: AtomicBool,
    /// Held for the duration of every client operation; teardown takes it to
    /// wait out whatever step is in flight.
    op_gate: Mutex<()>,
    /// Serializes mic/camera toggles.
    toggle_lock: Mutex<()>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

/// Owns the call session, the media client handle and the local tracks for
/// one mount of the call screen.
#[derive(Clone)]
pub struct CallController {
    inner: Arc<ControllerInner>,
}

impl CallController {
    pub fn new(
        options: CallOptions,
        settings: &CallSettings,
        credentials: Arc<dyn CredentialProvider>,
        media: Arc<dyn MediaProvider>,
        store: ActiveCallStore,
    ) -> Result<Self, HuddleError> {
        let channel = resolve_channel(&options.recipient, options.channel_override.as_deref())?;
        let session = CallSession::new(channel.clone(), options.voice_only);
        let request = CredentialRequest {
            channel,
            preset_token: options.preset_token,
            preset_app_id: options.preset_app_id,
            preset_uid: options.preset_uid,
        };

        Ok(Self {
            inner: Arc::new(ControllerInner {
                session_id: session.session_id.clone(),
                session: Mutex::new(session),
                request,
                on_call_end: options.on_call_end,
                credentials,
                media,
                track_config: settings.track_config(),
                teardown_grace: settings.teardown_grace(),
                emitter: EventEmitter::new(),
                store,
                mounted: AtomicBool::new(true),
                teardown_started: AtomicBool::new(false),
                ended: AtomicBool::new(false),
                op_gate: Mutex::new(()),
                toggle_lock: Mutex::new(()),
                tasks: std::sync::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Register a listener for call events.
    pub fn add_listener(&self, listener: Arc<dyn CallEventListener>) {
        self.inner.emitter.add_listener(listener);
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub async fn phase(&self) -> CallPhase {
        self.inner.session.lock().await.phase
    }

    pub async fn view(&self) -> CallView {
        let s = self.inner.session.lock().await;
        CallView {
            session_id: s.session_id.clone(),
            channel: s.channel.clone(),
            phase: s.phase,
            error: s.error.clone(),
            participants: s.roster.participants().to_vec(),
            mic_enabled: s.mic_enabled,
            camera_enabled: s.camera_enabled,
            video_published: s.video_published,
            duration_seconds: s.duration_seconds,
            formatted_duration: s.formatted_duration(),
        }
    }

    /// The subscribed video track of a remote participant, for rendering.
    pub async fn remote_video_track(&self, participant_id: &str) -> Option<Arc<dyn RemoteMediaTrack>> {
        let s = self.inner.session.lock().await;
        s.roster.participant(participant_id)?.video_track.clone()
    }

    /// Start the call: fetch credentials, create tracks, join and publish.
    ///
    /// Does nothing if the session has already been started or the screen was
    /// unmounted. On failure the session ends in `Failed`, its resources are
    /// released, and the error is returned.
    pub async fn mount(&self) -> Result<(), HuddleError> {
        {
            let mut s = self.inner.session.lock().await;
            if !self.is_mounted() || s.phase != CallPhase::Uninitialized {
                tracing::debug!("mount ignored in phase {}", s.phase);
                return Ok(());
            }
            self.set_phase(&mut s, CallPhase::AcquiringCredentials);
        }

        match self.initialize().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.fail(&e).await;
                Err(e)
            }
        }
    }

    async fn initialize(&self) -> Result<(), HuddleError> {
        let inner = &self.inner;
        let credentials = inner.request.resolve(inner.credentials.as_ref()).await?;

        let client = {
            let mut s = inner.session.lock().await;
            if !self.is_mounted() {
                tracing::info!("unmounted while fetching credentials; not connecting");
                return Ok(());
            }
            self.set_phase(&mut s, CallPhase::AcquiringMedia);
            let client = inner.media.create_client();
            let (tx, rx) = mpsc::unbounded_channel();
            client.register_handlers(tx);
            s.client = Some(client.clone());
            self.spawn_task(self.clone().event_pump(rx));
            client
        };

        {
            let _gate = inner.op_gate.lock().await;
            if !self.is_mounted() {
                return Ok(());
            }
            let tracks = inner
                .media
                .create_local_tracks(&inner.track_config)
                .await
                .map_err(HuddleError::MediaAcquisition)?;

            let voice_only = inner.session.lock().await.voice_only;
            if voice_only {
                if let Err(e) = tracks.video.set_enabled(false).await {
                    release_local_track(tracks.audio.as_ref());
                    release_local_track(tracks.video.as_ref());
                    return Err(HuddleError::MediaAcquisition(e));
                }
            }

            let mut s = inner.session.lock().await;
            if !self.is_mounted() {
                tracing::info!("unmounted while creating tracks; closing them");
                release_local_track(tracks.audio.as_ref());
                release_local_track(tracks.video.as_ref());
                return Ok(());
            }
            s.local.audio = Some(tracks.audio);
            s.local.video = Some(tracks.video);
            self.set_phase(&mut s, CallPhase::Joining);
        }

        {
            let _gate = inner.op_gate.lock().await;
            if !self.is_mounted() {
                return Ok(());
            }
            client.join(&credentials).await.map_err(HuddleError::Join)?;
            let mut s = inner.session.lock().await;
            if !self.is_mounted() {
                return Ok(());
            }
            tracing::info!("joined channel {} as uid {}", credentials.channel_name, credentials.uid);
            self.set_phase(&mut s, CallPhase::Joined);
        }

        let _gate = inner.op_gate.lock().await;
        if !self.is_mounted() {
            return Ok(());
        }
        let (tracks, includes_video) = {
            let mut s = inner.session.lock().await;
            self.set_phase(&mut s, CallPhase::Publishing);
            // A camera switched on while joining goes out with the first publish.
            let includes_video = !s.voice_only || s.camera_enabled;
            let mut tracks: Vec<Arc<dyn LocalMediaTrack>> = Vec::with_capacity(2);
            tracks.extend(s.local.audio.clone());
            if includes_video {
                tracks.extend(s.local.video.clone());
            }
            (tracks, includes_video)
        };
        client.publish(&tracks).await.map_err(HuddleError::Publish)?;

        let mut s = inner.session.lock().await;
        if !self.is_mounted() {
            return Ok(());
        }
        s.video_published = includes_video;
        self.set_phase(&mut s, CallPhase::Active);
        let started_at = Utc::now();
        s.started_at = Some(started_at);
        let snapshot = ActiveCallSnapshot {
            session_id: s.session_id.clone(),
            channel: s.channel.clone(),
            voice_only: s.voice_only,
            duration_seconds: s.duration_seconds,
            mic_enabled: s.mic_enabled,
            camera_enabled: s.camera_enabled,
            started_at,
        };
        drop(s);

        let (tx, rx) = mpsc::unbounded_channel();
        self.spawn_task(self.clone().command_loop(rx));
        self.spawn_task(self.clone().run_ticker());
        inner.store.activate(snapshot, CallControls::new(tx));
        Ok(())
    }

    /// Record an initialization failure and release whatever was acquired.
    async fn fail(&self, error: &HuddleError) {
        let message = error.to_string();
        tracing::error!("call setup failed: {message}");
        if self.inner.teardown_started.swap(true, Ordering::SeqCst) {
            // Unmounted mid-setup; that teardown owns the cleanup.
            return;
        }
        self.inner.mounted.store(false, Ordering::SeqCst);
        {
            let mut s = self.inner.session.lock().await;
            if s.transition(CallPhase::Failed) {
                s.error = Some(message.clone());
                self.inner.emitter.emit(CallEvent::PhaseChanged(CallPhase::Failed));
                self.inner.emitter.emit(CallEvent::Failed(message));
            }
        }
        self.release().await;
    }

    /// Flip the microphone. Returns the new state.
    pub async fn toggle_mic(&self) -> Result<bool, HuddleError> {
        let _toggle = self.inner.toggle_lock.lock().await;
        let (track, enabled) = {
            let s = self.inner.session.lock().await;
            let track = s.local.audio.clone().ok_or(HuddleError::NoLocalTrack(MediaKind::Audio))?;
            (track, !s.mic_enabled)
        };
        track.set_enabled(enabled).await.map_err(HuddleError::MediaAcquisition)?;
        self.inner.session.lock().await.mic_enabled = enabled;
        tracing::info!("microphone enabled: {enabled}");
        self.project_local_media().await;
        Ok(enabled)
    }

    /// Flip the camera. Returns the new state.
    ///
    /// Turning the camera off only disables the track. Turning it on publishes
    /// the track the first time if the call started voice-only.
    pub async fn toggle_camera(&self) -> Result<bool, HuddleError> {
        let _toggle = self.inner.toggle_lock.lock().await;
        let (track, enabled) = {
            let s = self.inner.session.lock().await;
            let track = s.local.video.clone().ok_or(HuddleError::NoLocalTrack(MediaKind::Video))?;
            (track, !s.camera_enabled)
        };
        track.set_enabled(enabled).await.map_err(HuddleError::MediaAcquisition)?;
        self.inner.session.lock().await.camera_enabled = enabled;
        tracing::info!("camera enabled: {enabled}");
        if enabled {
            if let Err(e) = self.ensure_video_published().await {
                // Not sent anywhere, so stop capturing and report the camera off.
                if let Err(disable) = track.set_enabled(false).await {
                    tracing::warn!("could not disable unpublished camera: {disable}");
                }
                self.inner.session.lock().await.camera_enabled = false;
                self.project_local_media().await;
                return Err(e);
            }
        }
        self.project_local_media().await;
        Ok(enabled)
    }

    async fn ensure_video_published(&self) -> Result<(), HuddleError> {
        let _gate = self.inner.op_gate.lock().await;
        if !self.is_mounted() {
            return Ok(());
        }
        let (client, track) = {
            let s = self.inner.session.lock().await;
            // Before Active the initial publish picks the camera up.
            if s.phase != CallPhase::Active || s.video_published || !s.camera_enabled {
                return Ok(());
            }
            match (s.client.clone(), s.local.video.clone()) {
                (Some(client), Some(track)) => (client, track),
                _ => return Ok(()),
            }
        };
        client.publish(&[track]).await.map_err(HuddleError::Publish)?;
        self.inner.session.lock().await.video_published = true;
        tracing::info!("camera track published");
        Ok(())
    }

    /// Report the end of the call to the owner.
    ///
    /// Only invokes the end-of-call callback; resources are released when the
    /// call screen unmounts.
    pub async fn end_call(&self) {
        self.finish(EndReason::Local).await;
    }

    /// Ask the UI to bring the full call screen back.
    pub fn maximize_call(&self) {
        self.inner.emitter.emit(CallEvent::MaximizeRequested);
    }

    async fn finish(&self, reason: EndReason) {
        if self.inner.ended.swap(true, Ordering::SeqCst) {
            tracing::debug!("call already ended; ignoring {reason:?}");
            return;
        }
        let duration_seconds = self.inner.session.lock().await.duration_seconds;
        tracing::info!("call ended after {} ({reason:?})", format_duration(duration_seconds));
        (self.inner.on_call_end)(duration_seconds);
        self.inner.emitter.emit(CallEvent::CallEnded { duration_seconds, reason });
    }

    /// Tear the session down. Safe to call any number of times and at any
    /// phase; only the first call does anything.
    pub async fn unmount(&self) {
        if self.inner.teardown_started.swap(true, Ordering::SeqCst) {
            tracing::debug!("teardown already started");
            return;
        }
        self.inner.mounted.store(false, Ordering::SeqCst);
        {
            let mut s = self.inner.session.lock().await;
            self.set_phase(&mut s, CallPhase::TearingDown);
        }
        self.release().await;
    }

    /// Release resources in order. Every step runs even if an earlier one failed.
    async fn release(&self) {
        let inner = &self.inner;
        let _gate = inner.op_gate.lock().await;
        tokio::time::sleep(inner.teardown_grace).await;

        let (audio, video, client, remote_audio) = {
            let mut s = inner.session.lock().await;
            (
                s.local.audio.take(),
                s.local.video.take(),
                s.client.take(),
                std::mem::take(&mut s.remote_audio),
            )
        };

        for track in remote_audio.values() {
            track.stop();
        }
        if let Some(audio) = audio {
            release_local_track(audio.as_ref());
        }
        if let Some(video) = video {
            release_local_track(video.as_ref());
        }
        if let Some(client) = client {
            if let Err(e) = client.leave().await {
                tracing::warn!("teardown: leaving channel failed: {e}");
            }
            client.remove_all_handlers();
        }

        for task in inner.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
        inner.store.clear(&inner.session_id);

        let mut s = inner.session.lock().await;
        s.roster.clear();
        // Failed sessions keep their phase so the error stays on screen.
        if s.phase == CallPhase::TearingDown {
            self.set_phase(&mut s, CallPhase::Closed);
        }
        tracing::info!("session {} released", inner.session_id);
    }

    async fn handle_media_event(&self, event: MediaEvent) {
        match event {
            MediaEvent::ParticipantJoined { participant_id } => {
                let mut s = self.inner.session.lock().await;
                if s.roster.add_if_absent(&participant_id) {
                    tracing::info!("participant joined: {participant_id}");
                    if let Some(p) = s.roster.participant(&participant_id) {
                        self.inner.emitter.emit(CallEvent::ParticipantJoined(p.clone()));
                    }
                }
            }

            MediaEvent::ParticipantPublished { participant_id, kind } => {
                let Some(client) = self.client().await else {
                    return;
                };
                let track = match client.subscribe(&participant_id, kind).await {
                    Ok(track) => track,
                    Err(e) => {
                        tracing::warn!("{participant_id}: {}", HuddleError::Subscribe(e));
                        return;
                    }
                };
                if !self.is_mounted() {
                    return;
                }

                let mut s = self.inner.session.lock().await;
                match kind {
                    MediaKind::Video => {
                        let p = s.roster.upsert_video(&participant_id, track).clone();
                        self.inner.emitter.emit(CallEvent::ParticipantUpdated(p));
                    }
                    MediaKind::Audio => {
                        track.play();
                        if let Some(previous) = s.remote_audio.insert(participant_id.clone(), track) {
                            previous.stop();
                        }
                        if let Some(p) = s.roster.set_audio(&participant_id, true) {
                            self.inner.emitter.emit(CallEvent::ParticipantUpdated(p.clone()));
                        }
                    }
                }
                tracing::debug!("subscribed to {participant_id} {kind}");
            }

            MediaEvent::ParticipantUnpublished { participant_id, kind } => {
                let mut s = self.inner.session.lock().await;
                let updated = match kind {
                    MediaKind::Video => s.roster.clear_video(&participant_id).cloned(),
                    MediaKind::Audio => {
                        if let Some(track) = s.remote_audio.remove(&participant_id) {
                            track.stop();
                        }
                        s.roster.set_audio(&participant_id, false).cloned()
                    }
                };
                if let Some(p) = updated {
                    self.inner.emitter.emit(CallEvent::ParticipantUpdated(p));
                }
            }

            MediaEvent::ParticipantLeft { participant_id, reason } => {
                let removed = {
                    let mut s = self.inner.session.lock().await;
                    if let Some(track) = s.remote_audio.remove(&participant_id) {
                        track.stop();
                    }
                    s.roster.remove(&participant_id)
                };
                tracing::info!("participant left: {participant_id} ({reason:?})");
                if removed {
                    self.inner.emitter.emit(CallEvent::ParticipantLeft(participant_id));
                }
                if reason.ends_call() {
                    self.finish(EndReason::RemoteLeft(reason)).await;
                }
            }
        }
    }

    async fn event_pump(self, mut events: mpsc::UnboundedReceiver<MediaEvent>) {
        while let Some(event) = events.recv().await {
            if !self.is_mounted() {
                break;
            }
            self.handle_media_event(event).await;
        }
        tracing::debug!("media event pump ended");
    }

    async fn command_loop(self, mut commands: mpsc::UnboundedReceiver<ControlCommand>) {
        while let Some(command) = commands.recv().await {
            let result = match command {
                ControlCommand::ToggleMic => self.toggle_mic().await.map(|_| ()),
                ControlCommand::ToggleCamera => self.toggle_camera().await.map(|_| ()),
                ControlCommand::EndCall => {
                    self.end_call().await;
                    Ok(())
                }
                ControlCommand::MaximizeCall => {
                    self.maximize_call();
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!("control command {command:?} failed: {e}");
            }
        }
    }

    async fn run_ticker(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval.tick().await;
        loop {
            interval.tick().await;
            let duration = {
                let mut s = self.inner.session.lock().await;
                if s.phase != CallPhase::Active {
                    break;
                }
                s.duration_seconds += 1;
                s.duration_seconds
            };
            self.inner
                .store
                .update(&self.inner.session_id, |snapshot| snapshot.duration_seconds = duration);
            self.inner.emitter.emit(CallEvent::DurationTick(duration));
        }
    }

    async fn project_local_media(&self) {
        let (mic_enabled, camera_enabled) = {
            let s = self.inner.session.lock().await;
            (s.mic_enabled, s.camera_enabled)
        };
        self.inner.store.update(&self.inner.session_id, |snapshot| {
            snapshot.mic_enabled = mic_enabled;
            snapshot.camera_enabled = camera_enabled;
        });
        self.inner
            .emitter
            .emit(CallEvent::LocalMediaChanged { mic_enabled, camera_enabled });
    }

    async fn client(&self) -> Option<Arc<dyn MediaClient>> {
        self.inner.session.lock().await.client.clone()
    }

    fn is_mounted(&self) -> bool {
        self.inner.mounted.load(Ordering::SeqCst)
    }

    fn set_phase(&self, session: &mut CallSession, next: CallPhase) {
        if session.transition(next) {
            self.inner.emitter.emit(CallEvent::PhaseChanged(next));
        }
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.inner.tasks.lock().unwrap().push(tokio::spawn(task));
    }
}

/// Stop and close a local track, logging failures.
fn release_local_track(track: &dyn LocalMediaTrack) {
    let kind = track.kind();
    if let Err(e) = track.stop() {
        tracing::warn!("teardown: stopping local {kind} track failed: {e}");
    }
    if let Err(e) = track.close() {
        tracing::warn!("teardown: closing local {kind} track failed: {e}");
    }
}
