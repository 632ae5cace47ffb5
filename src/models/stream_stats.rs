// StreamStats Model
// Real-time FFmpeg progress telemetry parsed from stderr

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// Progress metrics from one FFmpeg stderr line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStats {
    /// Current frame number
    pub frame: u64,

    /// Frames per second
    pub fps: f64,

    /// Output size as printed by FFmpeg (e.g. "1024kB")
    pub size: String,

    /// Elapsed media time as printed by FFmpeg (HH:MM:SS.ms)
    pub time: String,

    /// Current bitrate in kbps
    pub bitrate: f64,

    /// Encoding speed (e.g., 1.0x = real-time)
    pub speed: f64,
}

impl Default for StreamStats {
    fn default() -> Self {
        Self {
            frame: 0,
            fps: 0.0,
            size: "0kB".to_string(),
            time: "00:00:00.00".to_string(),
            bitrate: 0.0,
            speed: 0.0,
        }
    }
}

struct Patterns {
    frame: Regex,
    fps: Regex,
    size: Regex,
    time: Regex,
    bitrate: Regex,
    speed: Regex,
}

fn patterns() -> &'static Patterns {
    static PATTERNS: OnceLock<Patterns> = OnceLock::new();
    PATTERNS.get_or_init(|| Patterns {
        frame: Regex::new(r"frame=\s*(\d+)").expect("valid frame regex"),
        fps: Regex::new(r"fps=\s*([\d.]+)").expect("valid fps regex"),
        size: Regex::new(r"size=\s*(\S+)").expect("valid size regex"),
        time: Regex::new(r"time=\s*([\d:.]+)").expect("valid time regex"),
        bitrate: Regex::new(r"bitrate=\s*([\d.]+)kbits").expect("valid bitrate regex"),
        speed: Regex::new(r"speed=\s*([\d.]+)x").expect("valid speed regex"),
    })
}

impl StreamStats {
    /// Parse an FFmpeg stderr line for progress statistics.
    /// FFmpeg outputs lines like:
    /// frame= 1234 fps= 60 q=28.0 size=   12345kB time=00:01:23.45 bitrate=1234.5kbits/s speed=1.0x
    ///
    /// Returns `None` unless the line carries a numeric frame counter. Every other
    /// field is optional and falls back to its default when missing or malformed.
    pub fn parse(line: &str) -> Option<Self> {
        let p = patterns();
        let frame = Self::extract_value(&p.frame, line)?.parse::<u64>().ok()?;

        let defaults = Self::default();
        Some(Self {
            frame,
            fps: Self::extract_number(&p.fps, line),
            size: Self::extract_value(&p.size, line)
                .map(str::to_string)
                .unwrap_or(defaults.size),
            time: Self::extract_value(&p.time, line)
                .map(str::to_string)
                .unwrap_or(defaults.time),
            bitrate: Self::extract_number(&p.bitrate, line),
            speed: Self::extract_number(&p.speed, line),
        })
    }

    /// Whether the line is a progress line at all
    pub fn is_progress_line(line: &str) -> bool {
        patterns().frame.is_match(line)
    }

    fn extract_value<'a>(pattern: &Regex, line: &'a str) -> Option<&'a str> {
        pattern
            .captures(line)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
    }

    fn extract_number(pattern: &Regex, line: &str) -> f64 {
        Self::extract_value(pattern, line)
            .and_then(|value| value.parse::<f64>().ok())
            .filter(|value| value.is_finite())
            .unwrap_or(0.0)
    }
}
