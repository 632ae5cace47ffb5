// Connection Tester
// Publishes a few seconds of synthetic video to check a destination URL and stream key

use serde::Serialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use crate::models::{compose_stream_url, StreamStats};
use crate::services::encoding_args::build_test_publish_args;
use crate::services::ffmpeg_process::{ffmpeg_command, StderrLines};

const TEST_DURATION_SECS: u32 = 3;
const TEST_TIMEOUT: Duration = Duration::from_secs(8);
const MAX_MESSAGE_CHARS: usize = 200;

const AUTH_MARKERS: [&str; 5] = [
    "Authorization",
    "Unauthorized",
    "403",
    "NetStream.Publish.BadName",
    "Authentication",
];
const UNREACHABLE_MARKERS: [&str; 4] = [
    "Connection refused",
    "Connection timed out",
    "No route to host",
    "getaddrinfo",
];
const DETAIL_MARKERS: [&str; 3] = ["Server error", "NetStream", "RTMP_"];

pub const AUTH_FAILED_MESSAGE: &str = "Authentication failed — check your stream key";
pub const UNREACHABLE_MESSAGE: &str = "Could not reach server — check the RTMP URL";
pub const REJECTED_MESSAGE: &str = "Connection rejected — check that your stream key is correct";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ConnectionTestResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(message.into()),
        }
    }
}

enum PublishOutcome {
    Frames,
    Exited { code: Option<i32>, stderr: String },
}

/// Publish a short synthetic stream to `url` + `stream_key`.
/// Reaching the frame counter, or running out the clock, counts as success.
pub async fn test_connection(binary: &Path, url: &str, stream_key: &str) -> ConnectionTestResult {
    test_connection_within(binary, url, stream_key, TEST_TIMEOUT).await
}

pub(crate) async fn test_connection_within(
    binary: &Path,
    url: &str,
    stream_key: &str,
    limit: Duration,
) -> ConnectionTestResult {
    let target = compose_stream_url(url, stream_key);
    let args = build_test_publish_args(&target, TEST_DURATION_SECS).to_tokens();

    let mut cmd = ffmpeg_command(binary);
    cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::warn!("[FFmpeg:test] Failed to start connection test: {e}");
            return ConnectionTestResult::failed(format!("FFmpeg error: {e}"));
        }
    };

    let Some(stderr) = child.stderr.take() else {
        let _ = child.start_kill();
        return ConnectionTestResult::failed("FFmpeg error: stderr unavailable");
    };

    let watch = async {
        let mut lines = StderrLines::new(stderr);
        let mut collected = String::new();
        while let Some(line) = lines.next_line().await {
            if StreamStats::is_progress_line(&line) {
                return PublishOutcome::Frames;
            }
            collected.push_str(&line);
            collected.push('\n');
        }
        let code = child.wait().await.ok().and_then(|status| status.code());
        PublishOutcome::Exited { code, stderr: collected }
    };

    let result = match tokio::time::timeout(limit, watch).await {
        Ok(PublishOutcome::Frames) => ConnectionTestResult::ok(),
        Ok(PublishOutcome::Exited { code: Some(0), .. }) => ConnectionTestResult::ok(),
        Ok(PublishOutcome::Exited { code, stderr }) => {
            ConnectionTestResult::failed(classify_failure(&stderr, code))
        }
        Err(_) => {
            log::debug!("[FFmpeg:test] Connection test ran out the clock, treating as success");
            ConnectionTestResult::ok()
        }
    };

    let _ = child.start_kill();
    let _ = child.wait().await;

    match &result.error {
        Some(error) => log::info!("[FFmpeg:test] Connection test failed: {error}"),
        None => log::info!("[FFmpeg:test] Connection test succeeded"),
    }
    result
}

/// Turn FFmpeg's stderr from a failed publish into a user-facing message
pub fn classify_failure(stderr: &str, code: Option<i32>) -> String {
    if AUTH_MARKERS.iter().any(|m| stderr.contains(m)) {
        return AUTH_FAILED_MESSAGE.to_string();
    }
    if UNREACHABLE_MARKERS.iter().any(|m| stderr.contains(m)) {
        return UNREACHABLE_MESSAGE.to_string();
    }
    if stderr.contains("Input/output error") {
        return REJECTED_MESSAGE.to_string();
    }

    let lines: Vec<&str> = stderr
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();

    let message = lines
        .iter()
        .find(|line| DETAIL_MARKERS.iter().any(|m| line.contains(m)))
        .or_else(|| lines.last())
        .map(|line| line.to_string())
        .unwrap_or_else(|| format!("FFmpeg exited with code {}", code.unwrap_or(-1)));

    message.chars().take(MAX_MESSAGE_CHARS).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use crate::services::test_support::fake_ffmpeg;

    #[test]
    fn test_auth_failure() {
        let stderr = "[rtmp @ 0x1] Server error: Authorization failed\nError opening output";
        assert_eq!(classify_failure(stderr, Some(1)), AUTH_FAILED_MESSAGE);
        assert_eq!(
            classify_failure("NetStream.Publish.BadName", Some(1)),
            AUTH_FAILED_MESSAGE
        );
    }

    #[test]
    fn test_unreachable() {
        let stderr = "[tcp @ 0x1] Connection to tcp://nope:1935 failed: Connection refused";
        assert_eq!(classify_failure(stderr, Some(1)), UNREACHABLE_MESSAGE);
        assert_eq!(
            classify_failure("Failed to resolve hostname x: getaddrinfo failed", Some(1)),
            UNREACHABLE_MESSAGE
        );
    }

    #[test]
    fn test_rejected() {
        let stderr = "rtmp://host/app/key: Input/output error";
        assert_eq!(classify_failure(stderr, Some(1)), REJECTED_MESSAGE);
    }

    #[test]
    fn test_detail_line_preferred_over_last_line() {
        let stderr = "ffmpeg version 6\nRTMP_ReadPacket, failed to read header\nConversion failed!";
        assert_eq!(
            classify_failure(stderr, Some(1)),
            "RTMP_ReadPacket, failed to read header"
        );
    }

    #[test]
    fn test_fallbacks() {
        assert_eq!(classify_failure("one\ntwo\n\n", Some(1)), "two");
        assert_eq!(classify_failure("", Some(255)), "FFmpeg exited with code 255");
        assert_eq!(classify_failure("", None), "FFmpeg exited with code -1");

        let long = "x".repeat(500);
        assert_eq!(classify_failure(&long, Some(1)).chars().count(), 200);
    }

    #[tokio::test]
    async fn test_missing_binary_reports_ffmpeg_error() {
        let result = test_connection(Path::new("/nonexistent/ffmpeg"), "rtmp://host/app", "key").await;
        assert!(!result.success);
        assert!(result.error.unwrap().starts_with("FFmpeg error: "));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_frames_mean_success() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "echo 'frame=    1 fps=0.0 q=0.0 size=0kB' >&2\nexec sleep 5");
        let result = test_connection(&bin, "rtmp://host/app/", "key").await;
        assert_eq!(result, ConnectionTestResult::ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_clean_exit_without_frames_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "echo 'Output #0, flv' >&2\nexit 0");
        let result = test_connection(&bin, "rtmp://host/app", "key").await;
        assert_eq!(result, ConnectionTestResult::ok());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_silent_server_until_timeout_is_success() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "exec sleep 30");
        let started = std::time::Instant::now();
        let result =
            test_connection_within(&bin, "rtmp://host/app", "key", Duration::from_millis(300)).await;
        assert_eq!(result, ConnectionTestResult::ok());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_auth_error_from_process() {
        let dir = tempfile::tempdir().unwrap();
        let bin = fake_ffmpeg(dir.path(), "echo 'Server error: 403 Forbidden' >&2\nexit 1");
        let result = test_connection(&bin, "rtmp://host/app", "bad").await;
        assert_eq!(result, ConnectionTestResult::failed(AUTH_FAILED_MESSAGE));
    }
}
