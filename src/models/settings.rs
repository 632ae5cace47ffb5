// Settings Model
// Application-wide configuration

use serde::{Deserialize, Serialize};

fn default_rtmp_port() -> u16 {
    1935
}

fn default_ffmpeg_path() -> String {
    String::new()
}

fn default_buffer_duration() -> f64 {
    0.0
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_max_retries() -> u32 {
    5
}

fn default_minimize_to_tray() -> bool {
    true
}

fn default_start_minimized() -> bool {
    false
}

fn default_theme() -> ThemeMode {
    ThemeMode::Dark
}

/// UI colour scheme, persisted for the desktop shell
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThemeMode {
    #[default]
    Dark,
    Light,
}

/// Application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    /// Port of the local RTMP ingest listener
    #[serde(default = "default_rtmp_port")]
    pub rtmp_port: u16,

    /// Explicit FFmpeg binary; empty means auto-detect
    #[serde(default = "default_ffmpeg_path")]
    pub ffmpeg_path: String,

    /// Input/muxing buffer in seconds (0 disables buffering flags)
    #[serde(default = "default_buffer_duration")]
    pub buffer_duration: f64,

    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_minimize_to_tray")]
    pub minimize_to_tray: bool,

    #[serde(default = "default_start_minimized")]
    pub start_minimized: bool,

    #[serde(default = "default_theme")]
    pub theme: ThemeMode,
}

impl Settings {
    /// Buffer duration in microseconds, as FFmpeg expects for its buffering options
    pub fn buffer_micros(&self) -> Option<u64> {
        if self.buffer_duration.is_finite() && self.buffer_duration > 0.0 {
            Some((self.buffer_duration * 1_000_000.0).round() as u64)
        } else {
            None
        }
    }

    /// Custom FFmpeg path, if one has been configured
    pub fn custom_ffmpeg_path(&self) -> Option<&str> {
        let trimmed = self.ffmpeg_path.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed)
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rtmp_port: default_rtmp_port(),
            ffmpeg_path: default_ffmpeg_path(),
            buffer_duration: default_buffer_duration(),
            auto_reconnect: default_auto_reconnect(),
            max_retries: default_max_retries(),
            minimize_to_tray: default_minimize_to_tray(),
            start_minimized: default_start_minimized(),
            theme: default_theme(),
        }
    }
}
