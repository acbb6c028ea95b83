//! Persistent application settings (JSON file in the user config directory).

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parley_core::{
    transport::{DEFAULT_LIVE_URL, DEFAULT_MODEL, DEFAULT_VOICE},
    CaptureConfig, PlaybackConfig, RemoteEndpoint, SessionConfig, SessionSetup,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(default)]
pub struct AppSettings {
    pub api_key: Option<String>,
    pub url: String,
    pub model: String,
    pub voice_name: Option<String>,
    pub system_instruction: Option<String>,
    pub preferred_input_device: Option<String>,
    pub preferred_output_device: Option<String>,
    pub capture_sample_rate: u32,
    pub capture_frame_size: usize,
    pub playback_sample_rate: u32,
    pub outbound_queue: usize,
    pub connect_timeout_secs: u64,
    pub fft_size: usize,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            url: DEFAULT_LIVE_URL.into(),
            model: DEFAULT_MODEL.into(),
            voice_name: Some(DEFAULT_VOICE.into()),
            system_instruction: None,
            preferred_input_device: None,
            preferred_output_device: None,
            capture_sample_rate: 16_000,
            capture_frame_size: 4_096,
            playback_sample_rate: 24_000,
            outbound_queue: 8,
            connect_timeout_secs: 10,
            fft_size: 512,
        }
    }
}

impl AppSettings {
    pub fn normalize(&mut self) {
        self.api_key = trimmed(self.api_key.take());
        self.voice_name = trimmed(self.voice_name.take());
        self.system_instruction = trimmed(self.system_instruction.take());
        self.preferred_input_device = trimmed(self.preferred_input_device.take());
        self.preferred_output_device = trimmed(self.preferred_output_device.take());

        let url = self.url.trim();
        self.url = if url.is_empty() {
            DEFAULT_LIVE_URL.into()
        } else {
            url.into()
        };
        let model = self.model.trim();
        self.model = if model.is_empty() {
            DEFAULT_MODEL.into()
        } else {
            model.into()
        };

        self.capture_sample_rate = self.capture_sample_rate.clamp(8_000, 48_000);
        self.capture_frame_size = self.capture_frame_size.clamp(256, 16_384);
        self.playback_sample_rate = self.playback_sample_rate.clamp(8_000, 48_000);
        self.outbound_queue = self.outbound_queue.clamp(1, 64);
        self.connect_timeout_secs = self.connect_timeout_secs.clamp(1, 120);
        self.fft_size = self.fft_size.clamp(32, 32_768);
    }

    /// Fill a missing API key from the environment.
    pub fn apply_env(&mut self) {
        self.api_key = pick_api_key(
            self.api_key.take(),
            std::env::var("GEMINI_API_KEY").ok(),
            std::env::var("API_KEY").ok(),
        );
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            capture: CaptureConfig {
                sample_rate: self.capture_sample_rate,
                frame_size: self.capture_frame_size,
                preferred_device: self.preferred_input_device.clone(),
            },
            playback: PlaybackConfig {
                sample_rate: self.playback_sample_rate,
                preferred_device: self.preferred_output_device.clone(),
                ..PlaybackConfig::default()
            },
            fft_size: self.fft_size,
        }
    }

    pub fn endpoint(&self) -> RemoteEndpoint {
        RemoteEndpoint {
            url: self.url.clone(),
            api_key: self.api_key.clone(),
            setup: SessionSetup {
                model: self.model.clone(),
                voice_name: self.voice_name.clone(),
                system_instruction: self.system_instruction.clone(),
            },
            connect_timeout: Duration::from_secs(self.connect_timeout_secs),
            outbound_queue: self.outbound_queue,
        }
    }
}

fn trimmed(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The settings file wins, then `GEMINI_API_KEY`, then `API_KEY`.
fn pick_api_key(
    file: Option<String>,
    gemini: Option<String>,
    generic: Option<String>,
) -> Option<String> {
    trimmed(file)
        .or_else(|| trimmed(gemini))
        .or_else(|| trimmed(generic))
}

pub fn default_settings_path() -> PathBuf {
    if let Some(path) = std::env::var_os("PARLEY_SETTINGS") {
        return PathBuf::from(path);
    }
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Parley")
            .join("settings.json")
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                std::env::var_os("HOME")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("/tmp"))
                    .join(".config")
            })
            .join("parley")
            .join("settings.json")
    }
}

/// Read settings from `path`. A missing or unreadable file yields defaults.
pub fn load_settings(path: &Path) -> AppSettings {
    let mut settings = fs::read_to_string(path)
        .ok()
        .and_then(|raw| parse_settings(&raw))
        .unwrap_or_default();
    settings.normalize();
    settings
}

fn parse_settings(raw: &str) -> Option<AppSettings> {
    match serde_json::from_str::<AppSettings>(raw) {
        Ok(settings) => Some(settings),
        Err(e) => {
            tracing::warn!("ignoring malformed settings file: {e}");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults_for_missing_fields() {
        let settings =
            parse_settings(r#"{"voiceName":"Puck","captureFrameSize":2048}"#).expect("parses");
        assert_eq!(settings.voice_name.as_deref(), Some("Puck"));
        assert_eq!(settings.capture_frame_size, 2_048);
        assert_eq!(settings.capture_sample_rate, 16_000);
        assert_eq!(settings.model, DEFAULT_MODEL);
    }

    #[test]
    fn normalize_clamps_and_trims() {
        let mut settings = AppSettings {
            api_key: Some("   ".into()),
            model: " ".into(),
            preferred_input_device: Some("  USB Mic ".into()),
            capture_frame_size: 1,
            outbound_queue: 0,
            connect_timeout_secs: 10_000,
            playback_sample_rate: 0,
            ..AppSettings::default()
        };
        settings.normalize();

        assert_eq!(settings.api_key, None);
        assert_eq!(settings.model, DEFAULT_MODEL);
        assert_eq!(settings.preferred_input_device.as_deref(), Some("USB Mic"));
        assert_eq!(settings.capture_frame_size, 256);
        assert_eq!(settings.outbound_queue, 1);
        assert_eq!(settings.connect_timeout_secs, 120);
        assert_eq!(settings.playback_sample_rate, 8_000);
    }

    #[test]
    fn api_key_precedence() {
        let key = |s: &str| Some(s.to_string());
        assert_eq!(pick_api_key(key("file"), key("g"), key("a")), key("file"));
        assert_eq!(pick_api_key(None, key("g"), key("a")), key("g"));
        assert_eq!(pick_api_key(key(" "), None, key("a")), key("a"));
        assert_eq!(pick_api_key(None, None, None), None);
    }

    #[test]
    fn settings_map_onto_core_config() {
        let settings = AppSettings {
            api_key: Some("k".into()),
            preferred_output_device: Some("Speakers".into()),
            outbound_queue: 4,
            ..AppSettings::default()
        };
        let config = settings.session_config();
        assert_eq!(config.capture.frame_size, 4_096);
        assert_eq!(config.playback.channels, 1);
        assert_eq!(config.playback.preferred_device.as_deref(), Some("Speakers"));

        let endpoint = settings.endpoint();
        assert_eq!(endpoint.outbound_queue, 4);
        assert_eq!(endpoint.api_key.as_deref(), Some("k"));
        assert_eq!(endpoint.connect_timeout, Duration::from_secs(10));
    }
}
