// Ingest Service
// State of the local RTMP publish that every destination relays from

use serde::Deserialize;
use std::sync::{Mutex, MutexGuard};
use std::time::Instant;
use tokio::sync::broadcast;

use crate::models::IngestStatus;

pub const RTMP_APP_NAME: &str = "live";
pub const RTMP_STREAM_KEY: &str = "stream";
const HTTP_PORT_OFFSET: u16 = 8000;

/// Change in the inbound publish
#[derive(Debug, Clone, PartialEq)]
pub enum IngestEvent {
    Connected(IngestStatus),
    Disconnected,
    StatsUpdated(IngestStatus),
}

/// Status and events of whatever RTMP listener receives the encoder's stream
pub trait IngestSource: Send + Sync {
    fn is_connected(&self) -> bool;
    fn ingest_status(&self) -> IngestStatus;
    /// URL relays should read from: the published path if known, else the default
    fn ingest_url(&self) -> String;
    fn subscribe(&self) -> broadcast::Receiver<IngestEvent>;
}

/// Publisher statistics reported by the RTMP listener
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PublisherStats {
    /// Total bytes received since the publish started
    pub bytes: u64,
    pub video_codec: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub audio_codec: Option<String>,
    pub audio_channels: Option<u32>,
    pub sample_rate: Option<u32>,
}

#[derive(Default)]
struct IngestState {
    status: IngestStatus,
    stream_path: Option<String>,
    connected_at: Option<Instant>,
    last_sample: Option<(u64, Instant)>,
}

/// Ingest state for the embedded listener on localhost
pub struct LocalIngest {
    port: u16,
    state: Mutex<IngestState>,
    events_tx: broadcast::Sender<IngestEvent>,
}

impl LocalIngest {
    pub fn new(port: u16) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            port,
            state: Mutex::new(IngestState::default()),
            events_tx,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn http_port(&self) -> u16 {
        self.port.saturating_add(HTTP_PORT_OFFSET)
    }

    /// Server URL for the encoder's "Server" field
    pub fn server_url(&self) -> String {
        format!("rtmp://localhost:{}/{RTMP_APP_NAME}", self.port)
    }

    /// Stream key for the encoder's "Stream Key" field
    pub fn stream_key(&self) -> &'static str {
        RTMP_STREAM_KEY
    }

    /// HTTP-FLV URL for the live preview
    pub fn preview_url(&self) -> String {
        let state = self.state();
        self.preview_url_for(state.stream_path.as_deref())
    }

    fn preview_url_for(&self, stream_path: Option<&str>) -> String {
        match stream_path {
            Some(path) => format!("http://localhost:{}{path}.flv", self.http_port()),
            None => format!(
                "http://localhost:{}/{RTMP_APP_NAME}/{RTMP_STREAM_KEY}.flv",
                self.http_port()
            ),
        }
    }

    /// A publisher connected on `stream_path` (e.g. `/live/stream`)
    pub fn publish_started(&self, stream_path: &str, client_ip: Option<String>) {
        log::info!("Ingest publish started: {stream_path}");
        let status = {
            let mut state = self.state();
            state.stream_path = Some(stream_path.to_string());
            state.connected_at = Some(Instant::now());
            state.last_sample = None;
            state.status = IngestStatus {
                connected: true,
                client_ip: Some(client_ip.unwrap_or_else(|| "unknown".to_string())),
                preview_url: Some(self.preview_url_for(Some(stream_path))),
                ..Default::default()
            };
            state.status.clone()
        };
        let _ = self.events_tx.send(IngestEvent::Connected(status));
    }

    pub fn publish_ended(&self) {
        log::info!("Ingest publish ended");
        *self.state() = IngestState::default();
        let _ = self.events_tx.send(IngestEvent::Disconnected);
    }

    /// Fold a stats sample into the status. Ignored while nothing is publishing.
    pub fn update_stats(&self, stats: PublisherStats) {
        self.record_stats(stats, Instant::now());
    }

    fn record_stats(&self, stats: PublisherStats, now: Instant) {
        let status = {
            let mut state = self.state();
            if !state.status.connected {
                return;
            }

            let mut bitrate = state.status.bitrate.unwrap_or(0.0);
            if let Some((prev_bytes, prev_time)) = state.last_sample {
                let elapsed = now.saturating_duration_since(prev_time).as_secs_f64();
                if elapsed > 0.0 && stats.bytes >= prev_bytes {
                    bitrate = ((stats.bytes - prev_bytes) as f64 * 8.0 / (elapsed * 1000.0)).round();
                }
            }
            state.last_sample = Some((stats.bytes, now));

            let uptime = state
                .connected_at
                .map(|t| now.saturating_duration_since(t).as_secs());
            let resolution = match (stats.width, stats.height) {
                (Some(w), Some(h)) if w > 0 && h > 0 => Some(format!("{w}x{h}")),
                _ => None,
            };

            state.status = IngestStatus {
                connected: true,
                client_ip: state.status.client_ip.clone(),
                codec: stats.video_codec,
                bitrate: Some(bitrate),
                fps: stats.fps,
                resolution,
                audio_codec: stats.audio_codec,
                audio_channels: stats.audio_channels,
                sample_rate: stats.sample_rate,
                uptime,
                preview_url: Some(self.preview_url_for(state.stream_path.as_deref())),
            };
            state.status.clone()
        };
        let _ = self.events_tx.send(IngestEvent::StatsUpdated(status));
    }

    fn state(&self) -> MutexGuard<'_, IngestState> {
        self.state.lock().unwrap_or_else(|e| {
            log::warn!("Ingest state mutex poisoned, recovering: {e}");
            e.into_inner()
        })
    }
}

impl IngestSource for LocalIngest {
    fn is_connected(&self) -> bool {
        self.state().status.connected
    }

    fn ingest_status(&self) -> IngestStatus {
        self.state().status.clone()
    }

    fn ingest_url(&self) -> String {
        match self.state().stream_path.as_deref() {
            Some(path) => format!("rtmp://localhost:{}{path}", self.port),
            None => format!(
                "rtmp://localhost:{}/{RTMP_APP_NAME}/{RTMP_STREAM_KEY}",
                self.port
            ),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.events_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_urls_without_publisher() {
        let ingest = LocalIngest::new(1935);
        assert!(!ingest.is_connected());
        assert_eq!(ingest.ingest_url(), "rtmp://localhost:1935/live/stream");
        assert_eq!(ingest.server_url(), "rtmp://localhost:1935/live");
        assert_eq!(ingest.preview_url(), "http://localhost:9935/live/stream.flv");
        assert_eq!(ingest.stream_key(), "stream");
    }

    #[test]
    fn test_publish_lifecycle() {
        let ingest = LocalIngest::new(1936);
        let mut rx = ingest.subscribe();

        ingest.publish_started("/live/obs", Some("10.0.0.2".to_string()));
        assert!(ingest.is_connected());
        assert_eq!(ingest.ingest_url(), "rtmp://localhost:1936/live/obs");
        match rx.try_recv().unwrap() {
            IngestEvent::Connected(status) => {
                assert_eq!(status.client_ip.as_deref(), Some("10.0.0.2"));
                assert_eq!(status.preview_url.as_deref(), Some("http://localhost:9936/live/obs.flv"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        ingest.publish_ended();
        assert!(!ingest.is_connected());
        assert_eq!(rx.try_recv().unwrap(), IngestEvent::Disconnected);
        assert_eq!(ingest.ingest_url(), "rtmp://localhost:1936/live/stream");
    }

    #[test]
    fn test_bitrate_from_byte_delta() {
        let ingest = LocalIngest::new(1935);
        ingest.publish_started("/live/stream", None);
        let t0 = Instant::now();

        ingest.record_stats(PublisherStats { bytes: 1_000, ..Default::default() }, t0);
        assert_eq!(ingest.ingest_status().bitrate, Some(0.0));

        let stats = PublisherStats {
            bytes: 1_000 + 750_000,
            video_codec: Some("H264".to_string()),
            width: Some(1920),
            height: Some(1080),
            fps: Some(60.0),
            ..Default::default()
        };
        ingest.record_stats(stats, t0 + Duration::from_secs(2));

        let status = ingest.ingest_status();
        assert_eq!(status.bitrate, Some(3000.0));
        assert_eq!(status.resolution.as_deref(), Some("1920x1080"));
        assert_eq!(status.client_ip.as_deref(), Some("unknown"));
    }

    #[test]
    fn test_stats_ignored_when_disconnected() {
        let ingest = LocalIngest::new(1935);
        let mut rx = ingest.subscribe();
        ingest.update_stats(PublisherStats { bytes: 10, ..Default::default() });
        assert!(rx.try_recv().is_err());
        assert_eq!(ingest.ingest_status(), IngestStatus::disconnected());
    }
}
