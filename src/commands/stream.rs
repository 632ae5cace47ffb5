// Stream Commands
// Going live, stopping, and reporting the state of a restream session

use serde::Serialize;

use crate::models::{Destination, DestinationStatus, IngestStatus};
use crate::services::{FFmpegHandler, IngestSource, StreamMonitor, DEFAULT_POLL_INTERVAL};

pub const NO_ENABLED_DESTINATIONS: &str = "No enabled destinations";
pub const NO_INGEST_CONNECTED: &str = "No ingest stream connected. Start streaming from OBS first.";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamStatusResponse {
    pub ingest: IngestStatus,
    pub destinations: Vec<DestinationStatus>,
    pub is_live: bool,
}

/// Start relaying the connected ingest to every enabled destination
pub async fn go_live(
    handler: &FFmpegHandler,
    monitor: &StreamMonitor,
    ingest: &dyn IngestSource,
    destinations: &[Destination],
) -> Result<(), String> {
    if !destinations.iter().any(|d| d.enabled) {
        return Err(NO_ENABLED_DESTINATIONS.to_string());
    }
    if !ingest.is_connected() {
        return Err(NO_INGEST_CONNECTED.to_string());
    }

    // relay from whatever path the encoder actually publishes to
    handler.set_ingest_url(ingest.ingest_url());
    handler.start_all(destinations).await;
    monitor.start_polling(DEFAULT_POLL_INTERVAL);
    Ok(())
}

/// Stop every destination and end the session
pub async fn stop_all_streams(handler: &FFmpegHandler, monitor: &StreamMonitor) -> Result<(), String> {
    monitor.stop_polling();
    handler.stop_all().await;
    Ok(())
}

/// Stop one destination; the rest of the session keeps running
pub async fn stop_stream(handler: &FFmpegHandler, destination_id: &str) -> Result<(), String> {
    if destination_id.trim().is_empty() {
        return Err("Destination id is required".to_string());
    }
    handler.stop_destination(destination_id).await;
    Ok(())
}

pub fn get_stream_status(handler: &FFmpegHandler, monitor: &StreamMonitor) -> StreamStatusResponse {
    StreamStatusResponse {
        ingest: monitor.get_ingest_status(),
        destinations: monitor.get_destination_statuses(),
        is_live: handler.is_running(),
    }
}
