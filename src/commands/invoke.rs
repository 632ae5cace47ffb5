// Invoke Dispatch
// Named-command entry point shared by every host transport

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use super::{
    detect_ffmpeg, get_encoders, get_stream_status, go_live, stop_all_streams, stop_stream,
    test_stream_key, validate_ffmpeg_path,
};
use crate::services::{
    ConfigStore, EventBus, FFmpegHandler, IngestEvent, IngestSource, LocalIngest,
    MemorySecretStore, PlatformRegistry, PublisherStats, SettingsProvider, StreamMonitor,
};

/// Everything a command may touch, cloned into each request
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub secrets: Arc<MemorySecretStore>,
    pub handler: FFmpegHandler,
    pub ingest: Arc<LocalIngest>,
    pub monitor: Arc<StreamMonitor>,
    pub event_bus: EventBus,
}

impl AppState {
    /// Must be called inside a tokio runtime; the monitor spawns its forwarders here.
    pub fn new(config: Arc<ConfigStore>, secrets: Arc<MemorySecretStore>, event_bus: EventBus) -> Self {
        let handler = FFmpegHandler::new(config.clone(), secrets.clone());
        let ingest = Arc::new(LocalIngest::new(config.settings().rtmp_port));
        let monitor = Arc::new(StreamMonitor::new(ingest.clone(), handler.clone()));
        Self {
            config,
            secrets,
            handler,
            ingest,
            monitor,
            event_bus,
        }
    }
}

pub async fn invoke_command(state: &AppState, command: &str, payload: Value) -> Result<Value, String> {
    match command {
        // Session
        "go_live" => {
            let destinations = state.config.destinations().map_err(|e| e.to_string())?;
            go_live(&state.handler, &state.monitor, state.ingest.as_ref(), &destinations).await?;
            Ok(Value::Null)
        }
        "stop_all_streams" => {
            stop_all_streams(&state.handler, &state.monitor).await?;
            Ok(Value::Null)
        }
        "stop_stream" => {
            let destination_id: String = get_arg(&payload, "destinationId")?;
            stop_stream(&state.handler, &destination_id).await?;
            Ok(Value::Null)
        }
        "get_stream_status" => Ok(json!(get_stream_status(&state.handler, &state.monitor))),

        // FFmpeg
        "detect_ffmpeg" => Ok(json!(detect_ffmpeg(&state.handler).await?)),
        "get_encoders" => Ok(json!(get_encoders(&state.handler)?)),
        "validate_ffmpeg_path" => {
            let path: String = get_arg(&payload, "path")?;
            Ok(json!(validate_ffmpeg_path(path).await?))
        }
        "test_stream_key" => {
            let url: String = get_arg(&payload, "url")?;
            let stream_key: String = get_arg(&payload, "streamKey")?;
            Ok(json!(test_stream_key(&state.handler, url, stream_key).await?))
        }

        // Configuration
        "get_settings" => Ok(json!(state.config.settings())),
        "get_destinations" => {
            let destinations = state.config.destinations().map_err(|e| e.to_string())?;
            Ok(json!(destinations))
        }
        "get_platform_presets" => Ok(json!(PlatformRegistry::all())),
        "set_stream_key" => {
            let destination_id: String = get_arg(&payload, "destinationId")?;
            let stream_key: String = get_arg(&payload, "streamKey")?;
            if stream_key.trim().is_empty() {
                state.secrets.delete_stream_key(&destination_id);
            } else {
                state.secrets.set_stream_key(&destination_id, stream_key.trim());
            }
            Ok(Value::Null)
        }

        // Ingest
        "get_ingest_info" => Ok(json!({
            "serverUrl": state.ingest.server_url(),
            "streamKey": state.ingest.stream_key(),
            "ingestUrl": state.ingest.ingest_url(),
            "previewUrl": state.ingest.preview_url(),
        })),
        "ingest_publish_started" => {
            let stream_path: String = get_arg(&payload, "streamPath")?;
            let client_ip: Option<String> = get_opt_arg(&payload, "clientIp")?;
            state.ingest.publish_started(&stream_path, client_ip);
            Ok(Value::Null)
        }
        "ingest_publish_ended" => {
            state.ingest.publish_ended();
            Ok(Value::Null)
        }
        "ingest_stats" => {
            let stats: PublisherStats = get_arg(&payload, "stats")?;
            state.ingest.update_stats(stats);
            Ok(Value::Null)
        }

        _ => Err(format!("Unknown command: {command}")),
    }
}

/// End the session when the encoder stops publishing
pub fn watch_ingest(state: &AppState) -> JoinHandle<()> {
    let mut events = IngestSource::subscribe(state.ingest.as_ref());
    let handler = state.handler.clone();
    let monitor = state.monitor.clone();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(IngestEvent::Disconnected) if handler.is_running() => {
                    log::warn!("Ingest disconnected while live, stopping all destinations");
                    if let Err(e) = stop_all_streams(&handler, &monitor).await {
                        log::warn!("Error stopping relays: {e}");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    log::debug!("Ingest watcher skipped {skipped} event(s)");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn get_arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<T, String> {
    let obj = payload
        .as_object()
        .ok_or_else(|| "Invalid payload".to_string())?;
    let value = obj
        .get(key)
        .ok_or_else(|| format!("Missing argument: {key}"))?;
    serde_json::from_value(value.clone()).map_err(|e| format!("Invalid {key}: {e}"))
}

fn get_opt_arg<T: DeserializeOwned>(payload: &Value, key: &str) -> Result<Option<T>, String> {
    let obj = payload
        .as_object()
        .ok_or_else(|| "Invalid payload".to_string())?;
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| format!("Invalid {key}: {e}")),
    }
}
