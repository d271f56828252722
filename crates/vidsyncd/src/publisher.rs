//! Event fan-out: SSE subscribers, the recent-log buffer, and optionally NATS.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

use vidsync_core::types::LogEntry;
use vidsync_core::{Event, Publisher};

/// Entries kept for `GET /api/logs`.
pub const RECENT_LOG_CAPACITY: usize = 400;

const CHANNEL_CAPACITY: usize = 1024;

/// Broadcasts every event to live subscribers and remembers recent log lines.
pub struct BroadcastPublisher {
    tx: broadcast::Sender<Event>,
    recent: Mutex<VecDeque<LogEntry>>,
    mirrors: Vec<Arc<dyn Publisher>>,
}

impl BroadcastPublisher {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        BroadcastPublisher {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(RECENT_LOG_CAPACITY)),
            mirrors: Vec::new(),
        }
    }

    /// Also forward every event to `mirror`.
    pub fn with_mirror(mut self, mirror: Arc<dyn Publisher>) -> Self {
        self.mirrors.push(mirror);
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Recent log lines, oldest first.
    pub fn recent_logs(&self) -> Vec<LogEntry> {
        self.recent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    fn remember(&self, entry: LogEntry) {
        let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        if recent.len() == RECENT_LOG_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(entry);
    }
}

impl Default for BroadcastPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for BroadcastPublisher {
    fn emit(&self, event: Event) {
        match &event {
            Event::Log {
                timestamp,
                msg,
                level,
            } => self.remember(LogEntry {
                timestamp: *timestamp,
                level: *level,
                msg: msg.clone(),
            }),
            Event::JobLog { entry, .. } => self.remember(entry.clone()),
            _ => {}
        }
        for mirror in &self.mirrors {
            mirror.emit(event.clone());
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

#[cfg(feature = "nats")]
pub use nats::NatsPublisher;

#[cfg(feature = "nats")]
mod nats {
    use anyhow::Result;
    use tokio::sync::mpsc;
    use tracing::{info, warn};

    use vidsync_core::{Event, Publisher};

    pub const SUBJECT_PREFIX: &str = "vidsync.events";

    /// Publishes each event on `vidsync.events.<event>`.
    ///
    /// `emit` only queues; a background task owns the connection.
    pub struct NatsPublisher {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl NatsPublisher {
        pub async fn connect(url: &str) -> Result<Self> {
            let client = async_nats::connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("connecting to NATS at {url}: {e}"))?;
            info!("NATS: connected to {url}");

            let (tx, mut rx) = mpsc::unbounded_channel::<Event>();
            tokio::spawn(async move {
                while let Some(event) = rx.recv().await {
                    let subject = format!("{SUBJECT_PREFIX}.{}", event.event_type());
                    let payload = match event.to_bytes() {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("NATS: {e}");
                            continue;
                        }
                    };
                    if let Err(e) = client.publish(subject, payload.into()).await {
                        warn!("NATS: publishing event failed: {e}");
                    }
                }
            });
            Ok(NatsPublisher { tx })
        }
    }

    impl Publisher for NatsPublisher {
        fn emit(&self, event: Event) {
            let _ = self.tx.send(event);
        }
    }
}
