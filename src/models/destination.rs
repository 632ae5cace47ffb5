// Destination Model
// A remote streaming endpoint and its per-destination encoding configuration

use serde::{Deserialize, Serialize};
use std::fmt;

/// Known streaming platforms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Twitch,
    Youtube,
    Facebook,
    Tiktok,
    Instagram,
    Kick,
    X,
    Rumble,
    Linkedin,
    Trovo,
    Bilibili,
    Soop,
    Mixcloud,
    #[default]
    Custom,
}

impl Platform {
    pub const ALL: [Platform; 14] = [
        Platform::Twitch,
        Platform::Youtube,
        Platform::Facebook,
        Platform::Tiktok,
        Platform::Instagram,
        Platform::Kick,
        Platform::X,
        Platform::Rumble,
        Platform::Linkedin,
        Platform::Trovo,
        Platform::Bilibili,
        Platform::Soop,
        Platform::Mixcloud,
        Platform::Custom,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Twitch => "twitch",
            Platform::Youtube => "youtube",
            Platform::Facebook => "facebook",
            Platform::Tiktok => "tiktok",
            Platform::Instagram => "instagram",
            Platform::Kick => "kick",
            Platform::X => "x",
            Platform::Rumble => "rumble",
            Platform::Linkedin => "linkedin",
            Platform::Trovo => "trovo",
            Platform::Bilibili => "bilibili",
            Platform::Soop => "soop",
            Platform::Mixcloud => "mixcloud",
            Platform::Custom => "custom",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Video encoder used for a destination. `Copy` passes the ingest through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum VideoEncoder {
    #[default]
    #[serde(rename = "copy")]
    Copy,
    #[serde(rename = "libx264")]
    Libx264,
    #[serde(rename = "h264_videotoolbox")]
    VideoToolbox,
    #[serde(rename = "h264_nvenc")]
    Nvenc,
    #[serde(rename = "h264_qsv")]
    Qsv,
    #[serde(rename = "h264_amf")]
    Amf,
}

impl VideoEncoder {
    /// Hardware encoders in detection order
    pub const HARDWARE: [VideoEncoder; 4] = [
        VideoEncoder::VideoToolbox,
        VideoEncoder::Nvenc,
        VideoEncoder::Qsv,
        VideoEncoder::Amf,
    ];

    /// FFmpeg encoder name
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoEncoder::Copy => "copy",
            VideoEncoder::Libx264 => "libx264",
            VideoEncoder::VideoToolbox => "h264_videotoolbox",
            VideoEncoder::Nvenc => "h264_nvenc",
            VideoEncoder::Qsv => "h264_qsv",
            VideoEncoder::Amf => "h264_amf",
        }
    }

    pub fn is_hardware(&self) -> bool {
        Self::HARDWARE.contains(self)
    }
}

impl fmt::Display for VideoEncoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RateControl {
    #[default]
    Cbr,
    Vbr,
}

/// Output resolution. `Source` keeps the ingest resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Resolution {
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[default]
    #[serde(rename = "source")]
    Source,
}

impl Resolution {
    /// Scale filter dimensions (`W:H`), or `None` for source resolution
    pub fn scale(&self) -> Option<&'static str> {
        match self {
            Resolution::P1080 => Some("1920:1080"),
            Resolution::P720 => Some("1280:720"),
            Resolution::P480 => Some("854:480"),
            Resolution::Source => None,
        }
    }
}

/// Output frame rate. Serialized as a number or the string `"source"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "FrameRateRepr", into = "FrameRateRepr")]
pub enum FrameRate {
    #[default]
    Source,
    Fixed(u32),
}

impl FrameRate {
    pub fn fixed(&self) -> Option<u32> {
        match self {
            FrameRate::Fixed(fps) => Some(*fps),
            FrameRate::Source => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum FrameRateRepr {
    Number(u32),
    Text(String),
}

impl TryFrom<FrameRateRepr> for FrameRate {
    type Error = String;

    fn try_from(value: FrameRateRepr) -> Result<Self, Self::Error> {
        let fps = match value {
            FrameRateRepr::Number(n) => n,
            FrameRateRepr::Text(text) => {
                let text = text.trim();
                if text.eq_ignore_ascii_case("source") {
                    return Ok(FrameRate::Source);
                }
                text.parse::<u32>()
                    .map_err(|_| format!("Invalid frame rate: {text}"))?
            }
        };

        if fps == 0 {
            Ok(FrameRate::Source)
        } else {
            Ok(FrameRate::Fixed(fps))
        }
    }
}

impl From<FrameRate> for FrameRateRepr {
    fn from(value: FrameRate) -> Self {
        match value {
            FrameRate::Source => FrameRateRepr::Text("source".to_string()),
            FrameRate::Fixed(fps) => FrameRateRepr::Number(fps),
        }
    }
}

/// Per-destination encoding settings. Every field except `encoder` is ignored for copy.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncodingSettings {
    #[serde(default)]
    pub encoder: VideoEncoder,

    /// Target video bitrate in kbps
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,

    #[serde(default)]
    pub rate_control: RateControl,

    #[serde(default)]
    pub resolution: Resolution,

    #[serde(default)]
    pub fps: FrameRate,

    /// Keyframe interval in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyframe_interval: Option<u32>,

    /// x264 speed preset (libx264 only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x264_preset: Option<String>,
}

impl EncodingSettings {
    pub fn passthrough() -> Self {
        Self::default()
    }

    pub fn is_passthrough(&self) -> bool {
        self.encoder == VideoEncoder::Copy
    }
}

/// A configured restream destination. The stream key lives in the secret store, never here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    pub id: String,
    #[serde(default)]
    pub platform: Platform,
    pub name: String,
    /// Base ingest URL without the stream key
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
    /// Creation time in milliseconds since the Unix epoch
    #[serde(default)]
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<EncodingSettings>,
}

impl Destination {
    /// Create a new enabled destination with a fresh id
    pub fn new(platform: Platform, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            platform,
            name: name.into(),
            url: url.into(),
            enabled: true,
            created_at: chrono::Utc::now().timestamp_millis(),
            encoding: None,
        }
    }

    pub fn with_encoding(mut self, encoding: EncodingSettings) -> Self {
        self.encoding = Some(encoding);
        self
    }

    /// Compose the publish URL: base URL, exactly one `/`, then the stream key
    pub fn publish_url(&self, stream_key: &str) -> String {
        compose_stream_url(&self.url, stream_key)
    }
}

/// Join a base URL and stream key with exactly one separating slash
pub fn compose_stream_url(base: &str, stream_key: &str) -> String {
    let base = base.trim();
    let key = stream_key.trim().trim_start_matches('/');
    if base.ends_with('/') {
        format!("{base}{key}")
    } else {
        format!("{base}/{key}")
    }
}
