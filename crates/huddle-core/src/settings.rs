use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::media::{
    AudioProcessingConfig, DEFAULT_VIDEO_FRAME_RATE, DEFAULT_VIDEO_HEIGHT, DEFAULT_VIDEO_WIDTH,
    TrackConfig, VideoEncoderConfig,
};

const SETTINGS_FILE: &str = "call_settings.json";

/// App-level call tuning, persisted as JSON.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CallSettings {
    #[serde(default)]
    pub token_service_url: Option<String>,
    /// Pause before releasing media so in-flight publish/subscribe can settle.
    #[serde(default = "default_grace_ms")]
    pub teardown_grace_ms: u64,
    #[serde(default = "default_video_width")]
    pub video_width: u32,
    #[serde(default = "default_video_height")]
    pub video_height: u32,
    #[serde(default = "default_video_frame_rate")]
    pub video_frame_rate: u32,
    #[serde(default = "default_true")]
    pub echo_cancellation: bool,
    #[serde(default = "default_true")]
    pub noise_suppression: bool,
    #[serde(default = "default_true")]
    pub auto_gain_control: bool,
}

fn default_true() -> bool {
    true
}

fn default_grace_ms() -> u64 {
    300
}

fn default_video_width() -> u32 {
    DEFAULT_VIDEO_WIDTH
}

fn default_video_height() -> u32 {
    DEFAULT_VIDEO_HEIGHT
}

fn default_video_frame_rate() -> u32 {
    DEFAULT_VIDEO_FRAME_RATE
}

impl Default for CallSettings {
    fn default() -> Self {
        Self {
            token_service_url: None,
            teardown_grace_ms: default_grace_ms(),
            video_width: DEFAULT_VIDEO_WIDTH,
            video_height: DEFAULT_VIDEO_HEIGHT,
            video_frame_rate: DEFAULT_VIDEO_FRAME_RATE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

impl CallSettings {
    pub fn track_config(&self) -> TrackConfig {
        TrackConfig {
            video: VideoEncoderConfig {
                width: self.video_width,
                height: self.video_height,
                frame_rate: self.video_frame_rate,
            },
            audio: AudioProcessingConfig {
                echo_cancellation: self.echo_cancellation,
                noise_suppression: self.noise_suppression,
                auto_gain_control: self.auto_gain_control,
            },
        }
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

pub struct SettingsStore {
    settings: Mutex<CallSettings>,
    file_path: PathBuf,
}

impl SettingsStore {
    pub fn new(data_dir: &str) -> Self {
        let file_path = PathBuf::from(data_dir).join(SETTINGS_FILE);
        let settings = Self::load(&file_path);
        Self {
            settings: Mutex::new(settings),
            file_path,
        }
    }

    pub fn get(&self) -> CallSettings {
        self.settings.lock().unwrap().clone()
    }

    pub fn set_token_service_url(&self, url: Option<String>) {
        self.settings.lock().unwrap().token_service_url = url;
        self.save();
    }

    pub fn set_teardown_grace_ms(&self, ms: u64) {
        self.settings.lock().unwrap().teardown_grace_ms = ms;
        self.save();
    }

    pub fn set_video_profile(&self, width: u32, height: u32, frame_rate: u32) {
        {
            let mut s = self.settings.lock().unwrap();
            s.video_width = width;
            s.video_height = height;
            s.video_frame_rate = frame_rate;
        }
        self.save();
    }

    pub fn set_audio_processing(
        &self,
        echo_cancellation: bool,
        noise_suppression: bool,
        auto_gain_control: bool,
    ) {
        {
            let mut s = self.settings.lock().unwrap();
            s.echo_cancellation = echo_cancellation;
            s.noise_suppression = noise_suppression;
            s.auto_gain_control = auto_gain_control;
        }
        self.save();
    }

    fn save(&self) {
        let settings = self.settings.lock().unwrap().clone();
        if let Some(parent) = self.file_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match serde_json::to_string_pretty(&settings) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.file_path, json) {
                    tracing::warn!("could not save call settings: {e}");
                }
            }
            Err(e) => tracing::warn!("could not serialize call settings: {e}"),
        }
    }

    fn load(path: &Path) -> CallSettings {
        match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("ignoring unreadable call settings: {e}");
                CallSettings::default()
            }),
            Err(_) => CallSettings::default(),
        }
    }
}
