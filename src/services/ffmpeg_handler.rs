// FFmpegHandler Service
// Supervises one FFmpeg relay per destination with live telemetry and automatic retry

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::process::{Child, ChildStderr};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use crate::models::{Destination, DestinationHealth, DestinationStatus, Settings, StreamStats};
use crate::services::connection_tester::{self, ConnectionTestResult};
use crate::services::encoding_args::build_relay_args;
use crate::services::ffmpeg_locator::{self, AvailableEncoders};
use crate::services::ffmpeg_process::{ffmpeg_command, query_cpu_usage, request_terminate, StderrLines};
use crate::services::{PlatformRegistry, SecretStore, SettingsProvider};

pub const NO_STREAM_KEY_MESSAGE: &str = "No stream key configured";
pub const FFMPEG_NOT_FOUND_MESSAGE: &str = "FFmpeg not found";
pub const DEFAULT_INGEST_URL: &str = "rtmp://localhost:1935/live/stream";

const STOP_GRACE_PERIOD: Duration = Duration::from_secs(3);
const KILL_WAIT: Duration = Duration::from_secs(2);
const RECENT_LINES: usize = 40;
const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Reconnection configuration
#[derive(Debug, Clone)]
struct ReconnectionConfig {
    auto_reconnect: bool,
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_retries: 5,
            initial_delay: Duration::from_millis(2000),
            max_delay: Duration::from_millis(60_000),
        }
    }
}

impl ReconnectionConfig {
    fn from_settings(settings: &Settings) -> Self {
        Self {
            auto_reconnect: settings.auto_reconnect,
            max_retries: settings.max_retries,
            ..Default::default()
        }
    }

    fn should_retry(&self, retry_count: u32) -> bool {
        self.auto_reconnect && retry_count < self.max_retries
    }

    fn next_delay(&self, retry_count: u32) -> Duration {
        // Exponential backoff: initial * 2^attempt, capped at max_delay
        let factor = 1u32.checked_shl(retry_count).unwrap_or(u32::MAX);
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Delay before retry number `retry_count + 1`
pub fn retry_delay(retry_count: u32) -> Duration {
    ReconnectionConfig::default().next_delay(retry_count)
}

/// Handles to a running process owned by its supervisor task
#[derive(Clone)]
struct ProcessControl {
    pid: Option<u32>,
    kill_tx: mpsc::UnboundedSender<()>,
    exited: watch::Receiver<bool>,
}

impl ProcessControl {
    fn has_exited(&self) -> bool {
        *self.exited.borrow()
    }

    fn force_kill(&self) {
        let _ = self.kill_tx.send(());
    }
}

/// Identity of one spawned process, carried by its supervisor task
struct RunContext {
    id: String,
    name: String,
    generation: u64,
    stream_key: String,
}

/// Tracking record for one destination
struct Instance {
    destination: Destination,
    /// Bumped on every spawn so exits of replaced processes are ignored
    generation: u64,
    status: DestinationStatus,
    retry_count: u32,
    live_since: Option<Instant>,
    stopping: bool,
    control: Option<ProcessControl>,
    retry_task: Option<JoinHandle<()>>,
}

struct Inner {
    settings: Arc<dyn SettingsProvider>,
    secrets: Arc<dyn SecretStore>,
    ffmpeg_path: RwLock<Option<PathBuf>>,
    encoders: RwLock<AvailableEncoders>,
    ingest_url: RwLock<String>,
    running: AtomicBool,
    next_generation: AtomicU64,
    instances: Mutex<HashMap<String, Instance>>,
    status_tx: broadcast::Sender<DestinationStatus>,
}

/// Manages FFmpeg relay processes, one per destination
#[derive(Clone)]
pub struct FFmpegHandler {
    inner: Arc<Inner>,
}

impl FFmpegHandler {
    pub fn new(settings: Arc<dyn SettingsProvider>, secrets: Arc<dyn SecretStore>) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                settings,
                secrets,
                ffmpeg_path: RwLock::new(None),
                encoders: RwLock::new(AvailableEncoders::software_only()),
                ingest_url: RwLock::new(DEFAULT_INGEST_URL.to_string()),
                running: AtomicBool::new(false),
                next_generation: AtomicU64::new(0),
                instances: Mutex::new(HashMap::new()),
                status_tx,
            }),
        }
    }

    /// Locate FFmpeg and detect its encoders. Call once before starting destinations.
    pub async fn initialize(&self) -> Option<PathBuf> {
        let settings = self.inner.settings.settings();
        let path = ffmpeg_locator::locate(settings.custom_ffmpeg_path()).await;

        let encoders = match &path {
            Some(path) => ffmpeg_locator::detect_encoders(path).await,
            None => AvailableEncoders::software_only(),
        };

        match &path {
            Some(path) => log::info!(
                "FFmpeg ready at {} ({} hardware encoder(s))",
                path.display(),
                encoders.hardware.len()
            ),
            None => log::error!("FFmpeg not found; destinations cannot be started"),
        }

        *write_lock(&self.inner.encoders) = encoders;
        self.set_ffmpeg_path(path.clone());
        path
    }

    pub fn set_ffmpeg_path(&self, path: Option<PathBuf>) {
        *write_lock(&self.inner.ffmpeg_path) = path;
    }

    pub fn ffmpeg_path(&self) -> Option<PathBuf> {
        self.inner.ffmpeg_path()
    }

    pub fn available_encoders(&self) -> AvailableEncoders {
        read_lock(&self.inner.encoders).clone()
    }

    /// Set the local URL every relay reads from
    pub fn set_ingest_url(&self, url: impl Into<String>) {
        *write_lock(&self.inner.ingest_url) = url.into();
    }

    pub fn ingest_url(&self) -> String {
        self.inner.ingest_url()
    }

    /// Receive every status change from now on
    pub fn subscribe(&self) -> broadcast::Receiver<DestinationStatus> {
        self.inner.status_tx.subscribe()
    }

    /// (Re)start one destination. Any existing process for it is fully stopped first.
    pub async fn start_destination(&self, destination: &Destination) {
        self.stop_destination(&destination.id).await;

        let Some(key) = self.inner.secrets.get_stream_key(&destination.id).await else {
            log::warn!("[FFmpeg:{}] {NO_STREAM_KEY_MESSAGE}", destination.name);
            self.inner
                .emit(DestinationStatus::error(&destination.id, NO_STREAM_KEY_MESSAGE));
            return;
        };

        self.inner.spawn(destination.clone(), key, 0, None);
    }

    /// Stop one destination: cancel any pending retry, SIGTERM, then kill after a grace period.
    pub async fn stop_destination(&self, id: &str) {
        let (generation, control) = {
            let mut instances = self.inner.instances();
            let Some(instance) = instances.get_mut(id) else {
                return;
            };
            instance.stopping = true;
            if let Some(task) = instance.retry_task.take() {
                task.abort();
            }
            (instance.generation, instance.control.clone())
        };

        if let Some(control) = control {
            if !control.has_exited() {
                terminate(id, &control).await;
            }
        }

        let removed = {
            let mut instances = self.inner.instances();
            if instances.get(id).is_some_and(|i| i.generation == generation) {
                instances.remove(id);
                true
            } else {
                false
            }
        };

        if removed {
            log::info!("[FFmpeg:{id}] Stopped");
            self.inner.emit(DestinationStatus::idle(id));
        } else {
            log::debug!("[FFmpeg:{id}] Replaced while stopping, keeping the newer process");
        }
    }

    /// Mark the session live and start every enabled destination concurrently
    pub async fn start_all(&self, destinations: &[Destination]) {
        self.inner.running.store(true, Ordering::SeqCst);
        let enabled: Vec<&Destination> = destinations.iter().filter(|d| d.enabled).collect();
        log::info!(
            "Starting {} of {} destination(s)",
            enabled.len(),
            destinations.len()
        );
        join_all(enabled.into_iter().map(|d| self.start_destination(d))).await;
    }

    /// End the session and stop every tracked destination concurrently
    pub async fn stop_all(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let ids: Vec<String> = self.inner.instances().keys().cloned().collect();
        if ids.is_empty() {
            return;
        }
        log::info!("Stopping {} destination(s)", ids.len());
        join_all(ids.iter().map(|id| self.stop_destination(id))).await;
    }

    pub fn get_status(&self, id: &str) -> Option<DestinationStatus> {
        self.inner.instances().get(id).map(|i| i.status.clone())
    }

    pub fn get_all_statuses(&self) -> Vec<DestinationStatus> {
        let mut statuses: Vec<DestinationStatus> = self
            .inner
            .instances()
            .values()
            .map(|i| i.status.clone())
            .collect();
        statuses.sort_by(|a, b| a.id.cmp(&b.id));
        statuses
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .instances()
            .values()
            .filter(|i| i.control.as_ref().is_some_and(|c| !c.has_exited()))
            .count()
    }

    /// Refresh the CPU usage of every live process with one `ps` query
    pub async fn poll_cpu_usage(&self) {
        let pids: Vec<u32> = self
            .inner
            .instances()
            .values()
            .filter_map(|i| i.control.as_ref())
            .filter(|c| !c.has_exited())
            .filter_map(|c| c.pid)
            .collect();

        let Some(usage) = query_cpu_usage(&pids).await else {
            return;
        };

        let mut instances = self.inner.instances();
        for instance in instances.values_mut() {
            let Some(pid) = instance.control.as_ref().and_then(|c| c.pid) else {
                continue;
            };
            if let Some(cpu) = usage.get(&pid) {
                instance.status.cpu_percent = Some(*cpu);
            }
        }
    }

    /// Publish a short synthetic stream to check a URL and stream key
    pub async fn test_connection(&self, url: &str, stream_key: &str) -> ConnectionTestResult {
        match self.ffmpeg_path() {
            Some(binary) => connection_tester::test_connection(&binary, url, stream_key).await,
            None => ConnectionTestResult::failed(FFMPEG_NOT_FOUND_MESSAGE),
        }
    }
}

impl Inner {
    fn instances(&self) -> MutexGuard<'_, HashMap<String, Instance>> {
        self.instances.lock().unwrap_or_else(|e| {
            log::warn!("Instances mutex poisoned, recovering: {e}");
            e.into_inner()
        })
    }

    fn ffmpeg_path(&self) -> Option<PathBuf> {
        read_lock(&self.ffmpeg_path).clone()
    }

    fn ingest_url(&self) -> String {
        read_lock(&self.ingest_url).clone()
    }

    fn emit(&self, status: DestinationStatus) {
        log::debug!("[FFmpeg:{}] status -> {:?}", status.id, status.health);
        let _ = self.status_tx.send(status);
    }

    /// Drop the record for `generation` and publish its final status.
    /// A record that is being stopped is left to the stop path.
    fn finish(&self, id: &str, generation: u64, status: DestinationStatus) {
        let removed = {
            let mut instances = self.instances();
            match instances.get(id) {
                Some(i) if i.generation == generation && !i.stopping => {
                    instances.remove(id);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.emit(status);
        }
    }

    /// Launch FFmpeg for a destination. `retry_of` is the generation being retried;
    /// the retry is dropped if that record was stopped or replaced meanwhile.
    fn spawn(
        self: &Arc<Self>,
        destination: Destination,
        stream_key: String,
        retry_count: u32,
        retry_of: Option<u64>,
    ) {
        let id = destination.id.clone();
        let name = destination.name.clone();
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let status = DestinationStatus::connecting(&id, retry_count);

        {
            let mut instances = self.instances();
            if let Some(expected) = retry_of {
                match instances.get(&id) {
                    Some(existing) if existing.generation == expected && !existing.stopping => {}
                    _ => {
                        log::debug!("[FFmpeg:{name}] Retry dropped, destination was stopped or replaced");
                        return;
                    }
                }
            }

            let replaced = instances.insert(
                id.clone(),
                Instance {
                    destination: destination.clone(),
                    generation,
                    status: status.clone(),
                    retry_count,
                    live_since: None,
                    stopping: false,
                    control: None,
                    retry_task: None,
                },
            );

            if let Some(old) = replaced {
                if retry_of.is_none() {
                    if let Some(task) = old.retry_task {
                        task.abort();
                    }
                }
                if let Some(control) = old.control.filter(|c| !c.has_exited()) {
                    log::warn!("[FFmpeg:{name}] Replacing a running process");
                    control.force_kill();
                }
            }
        }
        self.emit(status);

        let Some(binary) = self.ffmpeg_path() else {
            log::error!("[FFmpeg:{name}] {FFMPEG_NOT_FOUND_MESSAGE}");
            self.finish(&id, generation, DestinationStatus::error(&id, FFMPEG_NOT_FOUND_MESSAGE));
            return;
        };

        let settings = self.settings.settings();
        let target_url = destination.publish_url(&stream_key);
        let args = build_relay_args(
            &self.ingest_url(),
            destination.encoding.as_ref(),
            settings.buffer_micros(),
            &target_url,
        )
        .to_tokens();

        log::info!(
            "[FFmpeg:{name}] Starting relay (attempt {}): {} {}",
            retry_count + 1,
            binary.display(),
            PlatformRegistry::redact_key(&args.join(" "), &stream_key)
        );

        let mut cmd = ffmpeg_command(&binary);
        cmd.args(&args).stdout(Stdio::null()).stderr(Stdio::piped());

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::error!("[FFmpeg:{name}] Failed to start FFmpeg: {e}");
                self.finish(&id, generation, DestinationStatus::error(&id, e.to_string()));
                return;
            }
        };

        let pid = child.id();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(false);

        let attached = {
            let mut instances = self.instances();
            match instances.get_mut(&id) {
                Some(instance) if instance.generation == generation && !instance.stopping => {
                    instance.control = Some(ProcessControl {
                        pid,
                        kill_tx,
                        exited: exit_rx,
                    });
                    true
                }
                _ => false,
            }
        };

        if !attached {
            log::debug!("[FFmpeg:{name}] Stopped while starting, discarding new process");
            let _ = child.start_kill();
            tokio::spawn(async move {
                let _ = child.wait().await;
            });
            return;
        }

        log::debug!("[FFmpeg:{name}] Started (PID: {pid:?})");
        let run = RunContext {
            id,
            name,
            generation,
            stream_key,
        };
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.supervise(run, child, stderr, kill_rx, exit_tx).await;
        });
    }

    /// Own the child: read telemetry until stderr closes, reap it, then decide what happens next
    async fn supervise(
        self: Arc<Self>,
        run: RunContext,
        mut child: Child,
        stderr: Option<ChildStderr>,
        mut kill_rx: mpsc::UnboundedReceiver<()>,
        exit_tx: watch::Sender<bool>,
    ) {
        let mut recent_lines: VecDeque<String> = VecDeque::with_capacity(RECENT_LINES);

        if let Some(stderr) = stderr {
            let mut lines = StderrLines::new(stderr);
            loop {
                tokio::select! {
                    line = lines.next_line() => {
                        let Some(line) = line else { break };
                        self.handle_line(&run, &line, &mut recent_lines);
                    }
                    Some(()) = kill_rx.recv() => {
                        log::debug!("[FFmpeg:{}] Killing process", run.name);
                        let _ = child.start_kill();
                    }
                }
            }
        }

        let code = loop {
            tokio::select! {
                status = child.wait() => {
                    break status.ok().and_then(|s| s.code()).unwrap_or(-1);
                }
                Some(()) = kill_rx.recv() => {
                    let _ = child.start_kill();
                }
            }
        };

        let _ = exit_tx.send(true);
        self.handle_exit(&run.id, &run.name, run.generation, code, &recent_lines);
    }

    fn handle_line(&self, run: &RunContext, line: &str, recent_lines: &mut VecDeque<String>) {
        let RunContext { id, name, generation, .. } = run;
        let generation = *generation;
        let sanitized = PlatformRegistry::redact_key(line, &run.stream_key);
        if recent_lines.len() == RECENT_LINES {
            recent_lines.pop_front();
        }
        recent_lines.push_back(sanitized.clone());

        if let Some(stats) = StreamStats::parse(line) {
            let status = {
                let mut instances = self.instances();
                let Some(instance) = instances.get_mut(id) else {
                    return;
                };
                if instance.generation != generation || instance.stopping {
                    return;
                }
                if instance.status.health != DestinationHealth::Live {
                    log::info!("[FFmpeg:{name}] Live");
                }
                let live_since = *instance.live_since.get_or_insert_with(Instant::now);
                instance.status = DestinationStatus {
                    id: id.to_string(),
                    health: DestinationHealth::Live,
                    bitrate: Some(stats.bitrate),
                    fps: Some(stats.fps),
                    uptime: Some(live_since.elapsed().as_secs()),
                    cpu_percent: instance.status.cpu_percent,
                    error: None,
                    retry_count: instance.retry_count,
                };
                instance.status.clone()
            };
            self.emit(status);
            return;
        }

        // Only log errors and warnings (not frame stats which are too verbose)
        let lower = line.to_ascii_lowercase();
        if lower.contains("error") || lower.contains("warning") {
            log::warn!("[FFmpeg:{name}] {sanitized}");
        }
    }

    fn handle_exit(
        self: &Arc<Self>,
        id: &str,
        name: &str,
        generation: u64,
        code: i32,
        recent_lines: &VecDeque<String>,
    ) {
        if !self.running.load(Ordering::SeqCst) {
            log::debug!("[FFmpeg:{name}] Exited with code {code} outside a live session");
            return;
        }

        let policy = ReconnectionConfig::from_settings(&self.settings.settings());

        let status = {
            let mut instances = self.instances();
            let Some(instance) = instances.get_mut(id) else {
                return;
            };
            if instance.generation != generation || instance.stopping {
                return;
            }

            log::error!("[FFmpeg:{name}] Disconnected with exit code {code}");
            if !recent_lines.is_empty() {
                log::warn!("[FFmpeg:{name}] Last 10 stderr lines:");
                for entry in recent_lines.iter().rev().take(10).rev() {
                    log::warn!("[FFmpeg:{name}]   {entry}");
                }
            }

            if policy.should_retry(instance.retry_count) {
                let delay = policy.next_delay(instance.retry_count);
                let next = instance.retry_count + 1;
                log::info!(
                    "[FFmpeg:{name}] Reconnecting in {}s (attempt {next}/{})",
                    delay.as_secs(),
                    policy.max_retries
                );

                instance.control = None;
                instance.status = DestinationStatus::retrying(
                    id,
                    next,
                    format!("Disconnected (exit code {code}). Retrying..."),
                );

                let inner = Arc::clone(self);
                let destination = instance.destination.clone();
                instance.retry_task = Some(tokio::spawn(async move {
                    inner.retry_after(destination, generation, next, delay).await;
                }));
                instance.status.clone()
            } else {
                let status = DestinationStatus {
                    retry_count: instance.retry_count,
                    ..DestinationStatus::error(
                        id,
                        format!("Disconnected (exit code {code}). Max retries reached."),
                    )
                };
                instances.remove(id);
                status
            }
        };

        self.emit(status);
    }

    async fn retry_after(
        self: Arc<Self>,
        destination: Destination,
        generation: u64,
        retry_count: u32,
        delay: Duration,
    ) {
        tokio::time::sleep(delay).await;

        // The key may have changed while we were waiting
        let key = self.secrets.get_stream_key(&destination.id).await;
        if !self.running.load(Ordering::SeqCst) {
            return;
        }

        let Some(key) = key else {
            log::warn!("[FFmpeg:{}] {NO_STREAM_KEY_MESSAGE}", destination.name);
            self.finish(
                &destination.id,
                generation,
                DestinationStatus::error(&destination.id, NO_STREAM_KEY_MESSAGE),
            );
            return;
        };

        self.spawn(destination, key, retry_count, Some(generation));
    }
}

/// SIGTERM, wait for the grace period, then force kill
async fn terminate(id: &str, control: &ProcessControl) {
    let mut exited = control.exited.clone();
    let signalled = control.pid.is_some_and(request_terminate);

    if signalled {
        if tokio::time::timeout(STOP_GRACE_PERIOD, exited.wait_for(|done| *done))
            .await
            .is_ok()
        {
            return;
        }
        log::warn!("[FFmpeg:{id}] Still running {}s after SIGTERM, killing", STOP_GRACE_PERIOD.as_secs());
    }

    control.force_kill();
    if tokio::time::timeout(KILL_WAIT, exited.wait_for(|done| *done))
        .await
        .is_err()
    {
        log::warn!("[FFmpeg:{id}] Process did not report exit after kill");
    }
}

fn read_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| {
        log::warn!("FFmpegHandler lock poisoned (read), recovering: {e}");
        e.into_inner()
    })
}

fn write_lock<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| {
        log::warn!("FFmpegHandler lock poisoned (write), recovering: {e}");
        e.into_inner()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemorySecretStore;
    #[cfg(unix)]
    use crate::services::test_support::fake_ffmpeg;

    const PROGRESS: &str =
        "frame=  10 fps=30 q=-1.0 size=     100kB time=00:00:01.00 bitrate= 800.0kbits/s speed=1x";

    fn handler_with(settings: Settings, keys: &[(&str, &str)]) -> FFmpegHandler {
        let secrets = MemorySecretStore::new();
        for (id, key) in keys {
            secrets.set_stream_key(id, key);
        }
        FFmpegHandler::new(Arc::new(settings), Arc::new(secrets))
    }

    fn destination(id: &str) -> Destination {
        Destination {
            id: id.to_string(),
            ..Destination::new(crate::models::Platform::Custom, id, "rtmp://example.com/live")
        }
    }

    async fn next_matching(
        rx: &mut broadcast::Receiver<DestinationStatus>,
        pred: impl Fn(&DestinationStatus) -> bool,
    ) -> DestinationStatus {
        tokio::time::timeout(Duration::from_secs(10), async {
            loop {
                match rx.recv().await {
                    Ok(status) if pred(&status) => return status,
                    Ok(_) => continue,
                    Err(e) => panic!("status channel failed: {e}"),
                }
            }
        })
        .await
        .expect("expected status was not emitted")
    }

    #[test]
    fn test_retry_delay() {
        assert_eq!(retry_delay(0), Duration::from_millis(2000));
        assert_eq!(retry_delay(1), Duration::from_millis(4000));
        assert_eq!(retry_delay(4), Duration::from_millis(32_000));
        assert_eq!(retry_delay(5), Duration::from_millis(60_000));
        assert_eq!(retry_delay(40), Duration::from_millis(60_000));
    }

    #[test]
    fn test_retry_policy_from_settings() {
        let settings = Settings {
            max_retries: 2,
            ..Default::default()
        };
        let policy = ReconnectionConfig::from_settings(&settings);
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));

        let settings = Settings {
            auto_reconnect: false,
            ..Default::default()
        };
        assert!(!ReconnectionConfig::from_settings(&settings).should_retry(0));
    }

    #[tokio::test]
    async fn test_missing_stream_key() {
        let handler = handler_with(Settings::default(), &[]);
        handler.set_ffmpeg_path(Some(PathBuf::from("/nonexistent/ffmpeg")));
        let mut rx = handler.subscribe();

        handler.start_destination(&destination("d1")).await;

        let status = next_matching(&mut rx, |_| true).await;
        assert_eq!(status.health, DestinationHealth::Error);
        assert_eq!(status.error.as_deref(), Some(NO_STREAM_KEY_MESSAGE));
        assert!(handler.get_status("d1").is_none());
        assert_eq!(handler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_reports_error() {
        let handler = handler_with(Settings::default(), &[("d1", "key")]);
        handler.set_ffmpeg_path(Some(PathBuf::from("/nonexistent/ffmpeg")));
        let mut rx = handler.subscribe();

        handler.start_destination(&destination("d1")).await;

        let connecting = next_matching(&mut rx, |_| true).await;
        assert_eq!(connecting.health, DestinationHealth::Connecting);
        let failed = next_matching(&mut rx, |_| true).await;
        assert_eq!(failed.health, DestinationHealth::Error);
        assert!(!failed.error.unwrap_or_default().is_empty());
        assert!(handler.get_status("d1").is_none());
    }

    #[tokio::test]
    async fn test_stop_unknown_is_noop() {
        let handler = handler_with(Settings::default(), &[]);
        let mut rx = handler.subscribe();
        handler.stop_destination("missing").await;
        assert!(rx.try_recv().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_start_all_skips_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(Settings::default(), &[("a", "ka"), ("b", "kb")]);
        handler.set_ffmpeg_path(Some(fake_ffmpeg(dir.path(), "exec sleep 30")));

        let mut disabled = destination("b");
        disabled.enabled = false;

        handler.start_all(&[destination("a"), disabled]).await;
        assert!(handler.is_running());

        let statuses = handler.get_all_statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].id, "a");
        assert_eq!(statuses[0].health, DestinationHealth::Connecting);
        assert_eq!(handler.active_count(), 1);

        handler.stop_all().await;
        assert!(!handler.is_running());
        assert!(handler.get_all_statuses().is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_telemetry_makes_destination_live() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(Settings::default(), &[("d1", "key")]);
        let script = format!("echo '{PROGRESS}' >&2\nexec sleep 30");
        handler.set_ffmpeg_path(Some(fake_ffmpeg(dir.path(), &script)));
        let mut rx = handler.subscribe();

        handler.start_all(&[destination("d1")]).await;

        let live = next_matching(&mut rx, |s| s.health == DestinationHealth::Live).await;
        assert_eq!(live.bitrate, Some(800.0));
        assert_eq!(live.fps, Some(30.0));
        assert_eq!(live.uptime, Some(0));
        assert_eq!(live.retry_count, 0);
        assert_eq!(handler.get_status("d1").map(|s| s.health), Some(DestinationHealth::Live));

        handler.poll_cpu_usage().await;

        handler.stop_all().await;
        let idle = next_matching(&mut rx, |s| s.health == DestinationHealth::Idle).await;
        assert_eq!(idle.id, "d1");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_retries_until_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_retries: 1,
            ..Default::default()
        };
        let handler = handler_with(settings, &[("d1", "key")]);
        handler.set_ffmpeg_path(Some(fake_ffmpeg(dir.path(), "exit 3")));
        let mut rx = handler.subscribe();

        handler.start_all(&[destination("d1")]).await;

        let retrying = next_matching(&mut rx, |s| s.health == DestinationHealth::Retrying).await;
        assert_eq!(retrying.retry_count, 1);
        assert_eq!(
            retrying.error.as_deref(),
            Some("Disconnected (exit code 3). Retrying...")
        );

        let reconnecting =
            next_matching(&mut rx, |s| s.health == DestinationHealth::Connecting).await;
        assert_eq!(reconnecting.retry_count, 1);

        let failed = next_matching(&mut rx, |s| s.health == DestinationHealth::Error).await;
        assert_eq!(
            failed.error.as_deref(),
            Some("Disconnected (exit code 3). Max retries reached.")
        );
        assert!(handler.get_status("d1").is_none());
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_backoff_doubles_between_attempts() {
        use tokio::time::Instant as TokioInstant;

        let dir = tempfile::tempdir().unwrap();
        let settings = Settings {
            max_retries: 3,
            ..Default::default()
        };
        let handler = handler_with(settings, &[("d1", "key")]);
        handler.set_ffmpeg_path(Some(fake_ffmpeg(dir.path(), "exit 3")));
        let mut rx = handler.subscribe();

        // no timeout wrapper: a pending timer would let paused time jump while a process runs
        async fn recv(rx: &mut broadcast::Receiver<DestinationStatus>) -> DestinationStatus {
            rx.recv().await.expect("status channel closed")
        }

        handler.start_all(&[destination("d1")]).await;
        let first = recv(&mut rx).await;
        assert_eq!((first.health, first.retry_count), (DestinationHealth::Connecting, 0));

        for attempt in 1..=3u32 {
            let retrying = recv(&mut rx).await;
            assert_eq!(retrying.health, DestinationHealth::Retrying);
            assert_eq!(retrying.retry_count, attempt);
            let scheduled_at = TokioInstant::now();

            let connecting = recv(&mut rx).await;
            assert_eq!(connecting.health, DestinationHealth::Connecting);
            assert_eq!(connecting.retry_count, attempt);

            let gap = scheduled_at.elapsed();
            let expected = retry_delay(attempt - 1);
            assert!(
                gap >= expected && gap < expected + Duration::from_millis(500),
                "attempt {attempt}: waited {gap:?}, expected {expected:?}"
            );
        }

        let failed = recv(&mut rx).await;
        assert_eq!(failed.health, DestinationHealth::Error);
        assert_eq!(failed.retry_count, 3);
        assert_eq!(
            failed.error.as_deref(),
            Some("Disconnected (exit code 3). Max retries reached.")
        );
        assert!(handler.get_status("d1").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stale_stop_does_not_report_idle() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(Settings::default(), &[("d1", "key")]);
        // ignores SIGTERM so the stop waits out its grace period
        handler.set_ffmpeg_path(Some(fake_ffmpeg(
            dir.path(),
            "trap '' TERM\nwhile true; do sleep 0.1; done",
        )));
        let dest = destination("d1");
        handler.start_all(std::slice::from_ref(&dest)).await;
        assert_eq!(handler.active_count(), 1);

        let mut rx = handler.subscribe();
        let replacing = async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            handler.inner.spawn(dest.clone(), "key".to_string(), 0, None);
        };
        tokio::join!(handler.stop_destination("d1"), replacing);

        let mut statuses = Vec::new();
        while let Ok(status) = rx.try_recv() {
            statuses.push(status);
        }
        assert!(
            statuses.iter().all(|s| s.health != DestinationHealth::Idle),
            "stale stop reported idle: {statuses:?}"
        );
        assert!(handler.get_status("d1").is_some());
        assert_eq!(handler.active_count(), 1);
        handler.stop_all().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_cancels_pending_retry() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(Settings::default(), &[("d1", "key")]);
        handler.set_ffmpeg_path(Some(fake_ffmpeg(dir.path(), "exit 1")));
        let mut rx = handler.subscribe();

        handler.start_all(&[destination("d1")]).await;
        next_matching(&mut rx, |s| s.health == DestinationHealth::Retrying).await;

        handler.stop_destination("d1").await;
        next_matching(&mut rx, |s| s.health == DestinationHealth::Idle).await;

        tokio::time::sleep(retry_delay(0) + Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err(), "no status may follow an explicit stop");
        assert!(handler.get_status("d1").is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_restart_replaces_process() {
        let dir = tempfile::tempdir().unwrap();
        let handler = handler_with(Settings::default(), &[("d1", "key")]);
        handler.set_ffmpeg_path(Some(fake_ffmpeg(dir.path(), "exec sleep 30")));

        let dest = destination("d1");
        handler.start_all(&[dest.clone()]).await;
        handler.start_destination(&dest).await;

        assert_eq!(handler.get_all_statuses().len(), 1);
        assert_eq!(handler.active_count(), 1);
        handler.stop_all().await;
        assert_eq!(handler.active_count(), 0);
    }

    #[tokio::test]
    async fn test_connection_without_ffmpeg() {
        let handler = handler_with(Settings::default(), &[]);
        let result = handler.test_connection("rtmp://host/app", "key").await;
        assert_eq!(result, ConnectionTestResult::failed(FFMPEG_NOT_FOUND_MESSAGE));
    }
}
