// FreEstream Server
// HTTP/WebSocket host for the restream supervisor: config, logging, invoke, event stream, shutdown

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path as UrlPath, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::Local;
use log::{Level, LevelFilter, Log, Metadata, Record};
use serde::Serialize;
use serde_json::{json, Value};
use std::env;
use std::fs::OpenOptions;
use std::io::Write;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tower_http::cors::{AllowOrigin, CorsLayer};

use freestream_server::commands::{self, invoke_command, watch_ingest, AppState};
use freestream_server::services::{
    ConfigStore, EventBus, EventSink, FFmpegHandler, MemorySecretStore, ServerEvent,
};

const DEFAULT_PORT: u16 = 8008;
const DEFAULT_CORS_ORIGINS: &str = "http://localhost:*,http://127.0.0.1:*,tauri://localhost";
const CPU_POLL_INTERVAL: Duration = Duration::from_secs(2);

// ============================================================================
// Logging
// ============================================================================

struct ServerLogger {
    file: Mutex<std::fs::File>,
    event_bus: EventBus,
    level: LevelFilter,
}

impl ServerLogger {
    fn new(log_dir: &Path, event_bus: EventBus) -> Result<Self, Box<dyn std::error::Error>> {
        let log_path = log_dir.join("freestream-server.log");
        let file = OpenOptions::new().create(true).append(true).open(log_path)?;
        Ok(Self {
            file: Mutex::new(file),
            event_bus,
            level: LevelFilter::Info,
        })
    }
}

impl Log for ServerLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let timestamp = Local::now();
        let date = timestamp.format("%Y-%m-%d");
        let time = timestamp.format("%H:%M:%S");
        let target = record.target();
        let level = record.level();
        let message = format!("{}", record.args());
        let line = format!("[{date}][{time}][{target}][{level}] {message}");

        if let Ok(mut file) = self.file.try_lock() {
            let _ = writeln!(file, "{line}");
        }

        let level_number = match level {
            Level::Error => 1,
            Level::Warn => 2,
            Level::Info => 3,
            Level::Debug => 4,
            Level::Trace => 5,
        };

        self.event_bus.emit(
            "log://log",
            json!({ "level": level_number, "message": message, "target": target }),
        );
    }

    fn flush(&self) {
        if let Ok(mut file) = self.file.try_lock() {
            let _ = file.flush();
        }
    }
}

fn init_logger(log_dir: &Path, event_bus: EventBus) -> Result<(), Box<dyn std::error::Error>> {
    let logger = ServerLogger::new(log_dir, event_bus)?;
    log::set_boxed_logger(Box::new(logger))?;
    log::set_max_level(LevelFilter::Info);
    Ok(())
}

// ============================================================================
// HTTP
// ============================================================================

#[derive(Serialize)]
struct InvokeResponse {
    ok: bool,
    data: Option<Value>,
    error: Option<String>,
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true }))
}

async fn invoke(
    UrlPath(command): UrlPath<String>,
    State(state): State<AppState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    match invoke_command(&state, &command, payload).await {
        Ok(data) => {
            let response = InvokeResponse {
                ok: true,
                data: Some(data),
                error: None,
            };
            (StatusCode::OK, Json(response))
        }
        Err(error) => {
            log::debug!("Command {command} failed: {error}");
            let response = InvokeResponse {
                ok: false,
                data: None,
                error: Some(error),
            };
            (StatusCode::BAD_REQUEST, Json(response))
        }
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.event_bus.subscribe()))
}

async fn handle_socket(mut socket: WebSocket, mut receiver: broadcast::Receiver<ServerEvent>) {
    loop {
        let event = match receiver.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                log::debug!("WebSocket client lagged, dropped {skipped} event(s)");
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        if let Ok(payload) = serde_json::to_string(&event) {
            if socket.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    }
}

/// `allowed` entries ending in `:*` match any port on that origin
fn origin_allowed(origin: &str, allowed: &[String]) -> bool {
    allowed.iter().any(|entry| match entry.strip_suffix(":*") {
        Some(prefix) => origin
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with(':')),
        None => origin == entry,
    })
}

fn build_cors_layer() -> CorsLayer {
    let allowed: Vec<String> = env::var("FREESTREAM_CORS_ORIGINS")
        .unwrap_or_else(|_| DEFAULT_CORS_ORIGINS.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
            origin
                .to_str()
                .is_ok_and(|origin| origin_allowed(origin, &allowed))
        }))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE])
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/invoke/:command", post(invoke))
        .route("/ws", get(ws_handler))
        .with_state(state)
        .layer(build_cors_layer())
}

// ============================================================================
// Startup
// ============================================================================

fn resolve_data_dir() -> PathBuf {
    if let Ok(dir) = env::var("FREESTREAM_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    dirs_next::data_dir()
        .map(|dir| dir.join("freestream"))
        .unwrap_or_else(|| PathBuf::from("data"))
}

fn parse_host(host: &str) -> IpAddr {
    host.parse().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

fn resolve_address() -> SocketAddr {
    let host = env::var("FREESTREAM_HOST").unwrap_or_default();
    let port = env::var("FREESTREAM_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(DEFAULT_PORT);
    SocketAddr::new(parse_host(&host), port)
}

fn resolve_log_dir(data_dir: &Path) -> PathBuf {
    env::var("FREESTREAM_LOG_DIR")
        .ok()
        .filter(|dir| !dir.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| data_dir.join("logs"))
}

/// Keep CPU usage on destination statuses fresh while a session is live
fn spawn_cpu_poller(handler: FFmpegHandler) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CPU_POLL_INTERVAL);
        loop {
            ticker.tick().await;
            if handler.is_running() && handler.active_count() > 0 {
                handler.poll_cpu_usage().await;
            }
        }
    })
}

/// Waits for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let data_dir = resolve_data_dir();
    let log_dir = resolve_log_dir(&data_dir);
    std::fs::create_dir_all(&data_dir)?;
    std::fs::create_dir_all(&log_dir)?;

    let event_bus = EventBus::new();
    init_logger(&log_dir, event_bus.clone())?;
    log::info!("FreEstream server starting (data dir: {})", data_dir.display());

    let config = Arc::new(ConfigStore::new(&data_dir));
    let loaded = match config.load() {
        Ok(loaded) => loaded,
        Err(e) => {
            log::error!("Failed to load {}: {e}; using defaults", config.path().display());
            Default::default()
        }
    };
    log::info!(
        "Loaded {} destination(s), {} enabled",
        loaded.destinations.len(),
        loaded.destinations.iter().filter(|d| d.enabled).count()
    );

    let secrets = Arc::new(MemorySecretStore::new());
    let keyed = secrets.load_from_env(loaded.destinations.iter().map(|d| d.id.clone()));
    log::info!("Stream keys available for {keyed} destination(s)");

    let state = AppState::new(config, secrets, event_bus.clone());
    if let Ok(Some(path)) = commands::detect_ffmpeg(&state.handler).await {
        log::info!("Relays will use {path}");
    }
    log::info!(
        "Point your encoder at {} with stream key \"{}\"",
        state.ingest.server_url(),
        state.ingest.stream_key()
    );

    let forwarder = state.monitor.forward_to(Arc::new(event_bus.clone()));
    let ingest_watcher = watch_ingest(&state);
    let cpu_poller = spawn_cpu_poller(state.handler.clone());

    let address = resolve_address();
    let listener = tokio::net::TcpListener::bind(address).await?;
    log::info!("FreEstream server listening on http://{address}");

    axum::serve(listener, build_router(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    log::info!("Shutdown signal received, stopping relays...");

    if let Err(e) = commands::stop_all_streams(&state.handler, &state.monitor).await {
        log::warn!("Error stopping relays: {e}");
    }
    cpu_poller.abort();
    ingest_watcher.abort();
    forwarder.abort();

    log::info!("All relays stopped, server shutting down");
    log::logger().flush();
    Ok(())
}
