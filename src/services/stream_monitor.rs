// Stream Monitor
// Merges ingest and destination health into one event stream for the UI

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::models::{DestinationStatus, IngestStatus};
use crate::services::events::{emit_event, EventSink};
use crate::services::ffmpeg_handler::FFmpegHandler;
use crate::services::ingest::{IngestEvent, IngestSource};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    IngestStatusChanged(IngestStatus),
    DestinationStatusChanged(DestinationStatus),
}

pub struct StreamMonitor {
    ingest: Arc<dyn IngestSource>,
    handler: FFmpegHandler,
    events_tx: broadcast::Sender<MonitorEvent>,
    forwarders: Vec<JoinHandle<()>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

impl StreamMonitor {
    /// Must be called inside a tokio runtime; subscribes to both sources immediately.
    pub fn new(ingest: Arc<dyn IngestSource>, handler: FFmpegHandler) -> Self {
        let (events_tx, _) = broadcast::channel(256);

        let ingest_task = {
            let tx = events_tx.clone();
            let mut rx = ingest.subscribe();
            tokio::spawn(async move {
                loop {
                    let event = match rx.recv().await {
                        Ok(event) => event,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Stream monitor skipped {n} ingest events");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    };
                    let status = match event {
                        IngestEvent::Connected(status) | IngestEvent::StatsUpdated(status) => status,
                        IngestEvent::Disconnected => IngestStatus::disconnected(),
                    };
                    let _ = tx.send(MonitorEvent::IngestStatusChanged(status));
                }
            })
        };

        let destination_task = {
            let tx = events_tx.clone();
            let mut rx = handler.subscribe();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(status) => {
                            let _ = tx.send(MonitorEvent::DestinationStatusChanged(status));
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Stream monitor skipped {n} destination updates");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        Self {
            ingest,
            handler,
            events_tx,
            forwarders: vec![ingest_task, destination_task],
            poll_task: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events_tx.subscribe()
    }

    pub fn get_ingest_status(&self) -> IngestStatus {
        self.ingest.ingest_status()
    }

    pub fn get_destination_statuses(&self) -> Vec<DestinationStatus> {
        self.handler.get_all_statuses()
    }

    /// Re-emit every destination status each `interval`. Replaces any running poller.
    pub fn start_polling(&self, interval: Duration) {
        let handler = self.handler.clone();
        let tx = self.events_tx.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // interval fires immediately; first re-emit waits one period
            ticker.tick().await;
            loop {
                ticker.tick().await;
                for status in handler.get_all_statuses() {
                    let _ = tx.send(MonitorEvent::DestinationStatusChanged(status));
                }
            }
        });

        let previous = self.poll_slot().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    pub fn stop_polling(&self) {
        if let Some(task) = self.poll_slot().take() {
            task.abort();
        }
    }

    pub fn is_polling(&self) -> bool {
        self.poll_slot().is_some()
    }

    /// Publish monitor events on `sink` as `event:ingest-status` and
    /// `event:destination-status` until the monitor is dropped.
    pub fn forward_to(&self, sink: Arc<dyn EventSink>) -> JoinHandle<()> {
        let mut stream = BroadcastStream::new(self.subscribe());
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(MonitorEvent::IngestStatusChanged(status)) => {
                        emit_event(sink.as_ref(), "event:ingest-status", &status);
                    }
                    Ok(MonitorEvent::DestinationStatusChanged(status)) => {
                        emit_event(sink.as_ref(), "event:destination-status", &status);
                    }
                    Err(e) => log::warn!("Event forwarder lagged: {e}"),
                }
            }
        })
    }

    fn poll_slot(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.poll_task.lock().unwrap_or_else(|e| {
            log::warn!("Poll task mutex poisoned, recovering: {e}");
            e.into_inner()
        })
    }
}

impl Drop for StreamMonitor {
    fn drop(&mut self) {
        self.stop_polling();
        for task in &self.forwarders {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Destination, DestinationHealth, Platform, Settings};
    use crate::services::events::EventBus;
    use crate::services::ingest::LocalIngest;
    use crate::services::secrets::MemorySecretStore;

    fn monitor_with(ingest: Arc<LocalIngest>) -> (StreamMonitor, FFmpegHandler) {
        let handler = FFmpegHandler::new(
            Arc::new(Settings::default()),
            Arc::new(MemorySecretStore::new()),
        );
        let monitor = StreamMonitor::new(ingest, handler.clone());
        (monitor, handler)
    }

    async fn next_event(rx: &mut broadcast::Receiver<MonitorEvent>) -> MonitorEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for monitor event")
            .expect("monitor channel closed")
    }

    #[tokio::test]
    async fn test_ingest_events_are_relabelled() {
        let ingest = Arc::new(LocalIngest::new(1935));
        let (monitor, _handler) = monitor_with(ingest.clone());
        let mut rx = monitor.subscribe();

        ingest.publish_started("/live/stream", Some("127.0.0.1".to_string()));
        match next_event(&mut rx).await {
            MonitorEvent::IngestStatusChanged(status) => assert!(status.connected),
            other => panic!("unexpected event {other:?}"),
        }

        ingest.publish_ended();
        assert_eq!(
            next_event(&mut rx).await,
            MonitorEvent::IngestStatusChanged(IngestStatus::disconnected())
        );
        assert!(!monitor.get_ingest_status().connected);
    }

    #[tokio::test]
    async fn test_destination_statuses_are_forwarded() {
        let ingest = Arc::new(LocalIngest::new(1935));
        let (monitor, handler) = monitor_with(ingest);
        let mut rx = monitor.subscribe();

        let destination = Destination::new(Platform::Twitch, "Twitch", "rtmp://live.twitch.tv/app/");
        handler.start_destination(&destination).await;

        match next_event(&mut rx).await {
            MonitorEvent::DestinationStatusChanged(status) => {
                assert_eq!(status.id, destination.id);
                assert_eq!(status.health, DestinationHealth::Error);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_polling_can_be_restarted_and_stopped() {
        let ingest = Arc::new(LocalIngest::new(1935));
        let (monitor, _handler) = monitor_with(ingest);

        assert!(!monitor.is_polling());
        monitor.start_polling(Duration::from_millis(10));
        monitor.start_polling(DEFAULT_POLL_INTERVAL);
        assert!(monitor.is_polling());
        monitor.stop_polling();
        assert!(!monitor.is_polling());
    }

    #[cfg(unix)]
    #[tokio::test(start_paused = true)]
    async fn test_polling_reemits_unchanged_status_from_one_poller() {
        let dir = tempfile::tempdir().unwrap();
        let destination = Destination::new(Platform::Custom, "Relay", "rtmp://example.com/live");
        let secrets = MemorySecretStore::new();
        secrets.set_stream_key(&destination.id, "key");
        let handler = FFmpegHandler::new(Arc::new(Settings::default()), Arc::new(secrets));
        handler.set_ffmpeg_path(Some(crate::services::test_support::fake_ffmpeg(
            dir.path(),
            "exec sleep 30",
        )));
        let monitor = StreamMonitor::new(Arc::new(LocalIngest::new(1935)), handler.clone());
        let mut rx = monitor.subscribe();

        handler.start_all(std::slice::from_ref(&destination)).await;
        // edge event from the spawn; plain recv so paused time cannot jump ahead
        let edge = match rx.recv().await.unwrap() {
            MonitorEvent::DestinationStatusChanged(status) => status,
            other => panic!("unexpected event {other:?}"),
        };
        assert_eq!(edge.health, DestinationHealth::Connecting);

        let period = Duration::from_secs(2);
        monitor.start_polling(period);
        monitor.start_polling(period);
        tokio::time::sleep(period * 3 + Duration::from_millis(100)).await;

        let mut reemitted = Vec::new();
        while let Ok(event) = rx.try_recv() {
            reemitted.push(event);
        }
        // ticks at 2s, 4s and 6s from a single poller
        assert_eq!(reemitted.len(), 3, "{reemitted:?}");
        for event in reemitted {
            assert_eq!(event, MonitorEvent::DestinationStatusChanged(edge.clone()));
        }

        monitor.stop_polling();
        tokio::time::sleep(period * 2).await;
        assert!(rx.try_recv().is_err());
        handler.stop_all().await;
    }

    #[tokio::test]
    async fn test_forward_to_event_bus() {
        let ingest = Arc::new(LocalIngest::new(1935));
        let (monitor, _handler) = monitor_with(ingest.clone());
        let bus = EventBus::new();
        let mut bus_rx = bus.subscribe();
        let _forwarder = monitor.forward_to(Arc::new(bus.clone()));

        ingest.publish_ended();
        let event = tokio::time::timeout(Duration::from_secs(2), bus_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event, "event:ingest-status");
        assert_eq!(event.payload["connected"], false);
    }
}
