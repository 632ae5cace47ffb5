// Platform Registry
// Known streaming platforms, their ingest defaults and recommended encodings

use serde::Serialize;

use crate::models::{EncodingSettings, FrameRate, Platform, RateControl, Resolution, VideoEncoder};

/// Static ingest information for one platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformPreset {
    pub platform: Platform,
    /// Display name
    pub name: &'static str,
    /// Default ingest URL, empty when the platform issues per-stream servers
    pub default_url: &'static str,
    pub requires_rtmps: bool,
}

/// Recommended encoding for a platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlatformEncodingPreset {
    /// kbps
    pub bitrate: u32,
    pub resolution: Resolution,
    pub fps: u32,
}

const PRESETS: [PlatformPreset; 14] = [
    PlatformPreset { platform: Platform::Twitch, name: "Twitch", default_url: "rtmp://live.twitch.tv/app/", requires_rtmps: false },
    PlatformPreset { platform: Platform::Youtube, name: "YouTube", default_url: "rtmp://a.rtmp.youtube.com/live2/", requires_rtmps: false },
    PlatformPreset { platform: Platform::Facebook, name: "Facebook", default_url: "rtmps://live-api-s.facebook.com:443/rtmp/", requires_rtmps: true },
    PlatformPreset { platform: Platform::Tiktok, name: "TikTok", default_url: "", requires_rtmps: false },
    PlatformPreset { platform: Platform::Instagram, name: "Instagram", default_url: "rtmps://live-upload.instagram.com:443/rtmp/", requires_rtmps: true },
    PlatformPreset { platform: Platform::Kick, name: "Kick", default_url: "rtmps://fa723fc1b171.global-contribute.live-video.net:443/app/", requires_rtmps: true },
    PlatformPreset { platform: Platform::X, name: "X (Twitter)", default_url: "", requires_rtmps: false },
    PlatformPreset { platform: Platform::Rumble, name: "Rumble", default_url: "", requires_rtmps: false },
    PlatformPreset { platform: Platform::Linkedin, name: "LinkedIn Live", default_url: "", requires_rtmps: true },
    PlatformPreset { platform: Platform::Trovo, name: "Trovo", default_url: "rtmp://livepush.trovo.live/live/", requires_rtmps: false },
    PlatformPreset { platform: Platform::Bilibili, name: "Bilibili", default_url: "rtmp://live-push.bilivideo.com/live-bvc/", requires_rtmps: false },
    PlatformPreset { platform: Platform::Soop, name: "SOOP", default_url: "rtmp://stream.sooplive.co.kr/app/", requires_rtmps: false },
    PlatformPreset { platform: Platform::Mixcloud, name: "Mixcloud", default_url: "rtmp://rtmp.mixcloud.com/broadcast", requires_rtmps: false },
    PlatformPreset { platform: Platform::Custom, name: "Custom RTMP", default_url: "", requires_rtmps: false },
];

pub struct PlatformRegistry;

impl PlatformRegistry {
    pub fn all() -> &'static [PlatformPreset] {
        &PRESETS
    }

    pub fn get(platform: Platform) -> &'static PlatformPreset {
        PRESETS
            .iter()
            .find(|preset| preset.platform == platform)
            .unwrap_or(&PRESETS[PRESETS.len() - 1])
    }

    /// Recommended encoding, for platforms that publish one
    pub fn encoding_preset(platform: Platform) -> Option<PlatformEncodingPreset> {
        let (bitrate, resolution, fps) = match platform {
            Platform::Twitch | Platform::Youtube | Platform::Kick => (6000, Resolution::P1080, 60),
            Platform::Facebook | Platform::Tiktok | Platform::X => (4000, Resolution::P1080, 30),
            Platform::Instagram => (3500, Resolution::P720, 30),
            Platform::Linkedin => (4000, Resolution::P720, 30),
            _ => return None,
        };
        Some(PlatformEncodingPreset { bitrate, resolution, fps })
    }

    /// Encoding settings a new destination on `platform` should start with.
    /// Uses the first available hardware encoder, else libx264 at veryfast.
    pub fn recommended_encoding(platform: Platform, available: &[VideoEncoder]) -> EncodingSettings {
        let Some(preset) = Self::encoding_preset(platform) else {
            return EncodingSettings::passthrough();
        };

        let encoder = available
            .iter()
            .copied()
            .find(VideoEncoder::is_hardware)
            .unwrap_or(VideoEncoder::Libx264);

        EncodingSettings {
            encoder,
            bitrate: Some(preset.bitrate),
            rate_control: RateControl::Cbr,
            resolution: preset.resolution,
            fps: FrameRate::Fixed(preset.fps),
            keyframe_interval: Some(2),
            x264_preset: (encoder == VideoEncoder::Libx264).then(|| "veryfast".to_string()),
        }
    }

    /// Generic redaction for publish URLs: keeps scheme, host and app, masks the key.
    /// A single path segment is taken to be the key itself.
    pub fn generic_redact(url: &str) -> String {
        if !(url.starts_with("rtmp://") || url.starts_with("rtmps://")) {
            return url.to_string();
        }

        let (scheme, rest) = match url.split_once("://") {
            Some(parts) => parts,
            None => return url.to_string(),
        };

        let (host, path) = match rest.split_once('/') {
            Some(parts) => parts,
            None => return url.to_string(),
        };

        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match segments.as_slice() {
            [] => url.to_string(),
            [_] => format!("{scheme}://{host}/***"),
            [app, ..] => format!("{scheme}://{host}/{app}/***"),
        }
    }

    /// Mask every occurrence of a known stream key, then any publish URLs left in `text`
    pub fn redact_key(text: &str, stream_key: &str) -> String {
        let key = stream_key.trim();
        if key.is_empty() {
            return Self::redact_text(text);
        }
        Self::redact_text(&text.replace(key, "***"))
    }

    /// Redact every RTMP(S) URL in an argument list
    pub fn redact_args(args: &[String]) -> Vec<String> {
        args.iter().map(|arg| Self::generic_redact(arg)).collect()
    }

    /// Redact publish URLs embedded anywhere in a line of FFmpeg output
    pub fn redact_text(text: &str) -> String {
        if !(text.contains("rtmp://") || text.contains("rtmps://")) {
            return text.to_string();
        }

        text.split(' ')
            .map(|token| {
                let Some(pos) = token.find("rtmp://").or_else(|| token.find("rtmps://")) else {
                    return token.to_string();
                };
                let (prefix, rest) = token.split_at(pos);
                let end = rest
                    .find(|c: char| matches!(c, '\'' | '"' | ','))
                    .unwrap_or(rest.len());
                let (url, suffix) = rest.split_at(end);
                format!("{prefix}{}{suffix}", Self::generic_redact(url))
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}
