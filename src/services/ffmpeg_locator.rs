// FFmpeg Locator Service
// Finds a working FFmpeg binary and detects which H.264 encoders it offers

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use crate::models::VideoEncoder;
use crate::services::ffmpeg_process::ffmpeg_command;

const VALIDATE_TIMEOUT: Duration = Duration::from_secs(5);
const ENCODER_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Install locations checked after the custom path and PATH
pub const COMMON_PATHS: [&str; 5] = [
    "/usr/local/bin/ffmpeg",
    "/usr/bin/ffmpeg",
    "/opt/homebrew/bin/ffmpeg",
    r"C:\ffmpeg\bin\ffmpeg.exe",
    r"C:\Program Files\ffmpeg\bin\ffmpeg.exe",
];

/// Locate FFmpeg: custom path, then `ffmpeg` on PATH, then [`COMMON_PATHS`].
/// Every candidate must answer `-version` with an FFmpeg banner.
pub async fn locate(custom_path: Option<&str>) -> Option<PathBuf> {
    if let Some(custom) = custom_path.map(str::trim).filter(|p| !p.is_empty()) {
        let path = PathBuf::from(custom);
        if is_valid_ffmpeg(&path).await {
            log::info!("Using custom FFmpeg path from settings: {custom}");
            return Some(path);
        }
        log::warn!("Custom FFmpeg path is not a working FFmpeg binary: {custom}");
    }

    if let Ok(found) = which::which("ffmpeg") {
        log::debug!("Found ffmpeg in PATH: {found:?}");
        let bare = PathBuf::from("ffmpeg");
        if is_valid_ffmpeg(&bare).await {
            return Some(bare);
        }
    }

    for candidate in COMMON_PATHS {
        let path = Path::new(candidate);
        if path.exists() && is_valid_ffmpeg(path).await {
            log::info!("Using FFmpeg at {candidate}");
            return Some(path.to_path_buf());
        }
    }

    log::warn!("FFmpeg binary not found in any location");
    None
}

/// Run `<binary> -version` and check for the FFmpeg banner
pub async fn is_valid_ffmpeg(binary: &Path) -> bool {
    let mut cmd = ffmpeg_command(binary);
    cmd.arg("-version").stdout(Stdio::piped()).stderr(Stdio::null());

    match tokio::time::timeout(VALIDATE_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) => {
            output.status.success()
                && String::from_utf8_lossy(&output.stdout).contains("ffmpeg version")
        }
        Ok(Err(e)) => {
            log::debug!("FFmpeg candidate {binary:?} failed to run: {e}");
            false
        }
        Err(_) => {
            log::debug!("FFmpeg candidate {binary:?} timed out answering -version");
            false
        }
    }
}

/// Encoders usable for destinations on this machine
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailableEncoders {
    pub hardware: Vec<VideoEncoder>,
    pub software: Vec<VideoEncoder>,
}

impl AvailableEncoders {
    pub fn software_only() -> Self {
        Self {
            hardware: Vec::new(),
            software: vec![VideoEncoder::Libx264],
        }
    }

    /// Hardware encoders first, then software
    pub fn all(&self) -> Vec<VideoEncoder> {
        self.hardware.iter().chain(self.software.iter()).copied().collect()
    }

    /// Parse `ffmpeg -encoders` output
    pub fn from_encoder_listing(listing: &str) -> Self {
        let hardware = VideoEncoder::HARDWARE
            .into_iter()
            .filter(|encoder| listing.contains(encoder.as_str()))
            .collect();
        Self {
            hardware,
            software: vec![VideoEncoder::Libx264],
        }
    }
}

impl Default for AvailableEncoders {
    fn default() -> Self {
        Self::software_only()
    }
}

/// Ask FFmpeg which encoders it was built with. Any failure degrades to software only.
pub async fn detect_encoders(binary: &Path) -> AvailableEncoders {
    let mut cmd = ffmpeg_command(binary);
    cmd.args(["-hide_banner", "-encoders"])
        .stdout(Stdio::piped())
        .stderr(Stdio::null());

    match tokio::time::timeout(ENCODER_QUERY_TIMEOUT, cmd.output()).await {
        Ok(Ok(output)) if output.status.success() => {
            let listing = String::from_utf8_lossy(&output.stdout);
            let encoders = AvailableEncoders::from_encoder_listing(&listing);
            log::debug!("Detected hardware encoders: {:?}", encoders.hardware);
            encoders
        }
        Ok(Ok(output)) => {
            log::warn!("FFmpeg encoder query exited with {}", output.status);
            AvailableEncoders::software_only()
        }
        Ok(Err(e)) => {
            log::warn!("FFmpeg encoder query failed: {e}");
            AvailableEncoders::software_only()
        }
        Err(_) => {
            log::warn!("FFmpeg encoder query timed out");
            AvailableEncoders::software_only()
        }
    }
}
