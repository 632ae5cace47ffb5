// System Commands
// FFmpeg discovery, encoder detection and stream key verification

use std::path::Path;

use crate::services::ffmpeg_locator::is_valid_ffmpeg;
use crate::services::{AvailableEncoders, ConnectionTestResult, FFmpegHandler};

/// Locate FFmpeg again (custom path, PATH, common locations) and re-detect its encoders
pub async fn detect_ffmpeg(handler: &FFmpegHandler) -> Result<Option<String>, String> {
    let path = handler.initialize().await;
    Ok(path.map(|p| p.display().to_string()))
}

/// Encoders the located FFmpeg offers, hardware first
pub fn get_encoders(handler: &FFmpegHandler) -> Result<AvailableEncoders, String> {
    Ok(handler.available_encoders())
}

/// Check that a user-supplied path runs as FFmpeg
pub async fn validate_ffmpeg_path(path: String) -> Result<String, String> {
    let path = path.trim();
    if path.is_empty() {
        return Err("FFmpeg path is required".to_string());
    }
    if is_valid_ffmpeg(Path::new(path)).await {
        Ok(path.to_string())
    } else {
        Err(format!("Not a working FFmpeg binary: {path}"))
    }
}

/// Publish a short test stream to `url` with `stream_key`
pub async fn test_stream_key(
    handler: &FFmpegHandler,
    url: String,
    stream_key: String,
) -> Result<ConnectionTestResult, String> {
    validate_rtmp_url(&url)?;
    if stream_key.trim().is_empty() {
        return Err("Stream key is required".to_string());
    }
    Ok(handler.test_connection(url.trim(), stream_key.trim()).await)
}

/// Require an rtmp:// or rtmps:// URL with a non-empty host and a valid port
fn validate_rtmp_url(url: &str) -> Result<(), String> {
    let url = url.trim();
    let rest = url
        .strip_prefix("rtmps://")
        .or_else(|| url.strip_prefix("rtmp://"))
        .ok_or_else(|| "Invalid RTMP URL: must start with rtmp:// or rtmps://".to_string())?;

    let host_port = rest.split('/').next().unwrap_or(rest);
    let host = match host_port.split_once(':') {
        Some((host, port)) => {
            port.parse::<u16>()
                .map_err(|_| format!("Invalid port in URL: {port}"))?;
            host
        }
        None => host_port,
    };

    if host.is_empty() {
        return Err("Empty host in RTMP URL".to_string());
    }
    Ok(())
}
