//! Notifier Pipeline (C10): buffers log records emitted during a session
//! and dispatches a templated message per configured transport at session
//! end. Transports are interchangeable behind one small trait, registered
//! in an open map keyed by URL scheme.

pub mod layer;
pub mod template;
pub mod transports;

pub use layer::SinkLayer;

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::metrics::Report;

const RING_BUFFER_CAPACITY: usize = 256;
const BROADCAST_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("transport request failed: {0}")]
    Transport(String),

    #[error("unrecognized notifier scheme {0:?}")]
    UnknownScheme(String),

    #[error("malformed notifier url {0:?}: {1}")]
    MalformedUrl(String, String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
}

/// A dispatchable notification transport, addressed by URL scheme
/// (`slack://`, `gotify://`, ...).
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, level: Level, message: &str) -> Result<(), NotifyError>;
    fn name(&self) -> &str;
}

/// Buffers log records at or above `min_level` during a session; same
/// shape as a broadcast channel plus a mutex-guarded ring buffer so late
/// subscribers (the HTTP API, tests) can still see recent history.
pub struct LogSink {
    min_level: Mutex<Level>,
    ring: Mutex<VecDeque<LogEntry>>,
    tx: broadcast::Sender<LogEntry>,
}

impl LogSink {
    pub fn new(min_level: Level) -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self {
            min_level: Mutex::new(min_level),
            ring: Mutex::new(VecDeque::with_capacity(RING_BUFFER_CAPACITY)),
            tx,
        }
    }

    /// Adjusts the buffering threshold after construction, since the sink is
    /// installed as a tracing layer before `--notifications-level` is parsed
    /// out of the fully-loaded config.
    pub fn set_min_level(&self, min_level: Level) {
        *self.min_level.lock() = min_level;
    }

    pub fn record(&self, level: Level, message: impl Into<String>) {
        if level < *self.min_level.lock() {
            return;
        }
        let entry = LogEntry {
            level,
            message: message.into(),
        };
        let mut ring = self.ring.lock();
        if ring.len() == RING_BUFFER_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(entry.clone());
        let _ = self.tx.send(entry);
    }

    pub fn drain(&self) -> Vec<LogEntry> {
        self.ring.lock().iter().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LogEntry> {
        self.tx.subscribe()
    }
}

pub struct NotifierPipeline {
    sink: Arc<LogSink>,
    transports: Vec<Arc<dyn Notifier>>,
    title: String,
    host: String,
}

impl NotifierPipeline {
    pub fn new(sink: Arc<LogSink>, transports: Vec<Arc<dyn Notifier>>, host: String) -> Self {
        Self {
            sink,
            transports,
            title: "containerwatch".to_string(),
            host,
        }
    }

    pub fn sink(&self) -> Arc<LogSink> {
        self.sink.clone()
    }

    /// Renders the report + buffered entries once and dispatches to every
    /// transport; one transport's failure never affects the others.
    pub async fn flush(&self, report: &Report) {
        if self.transports.is_empty() {
            return;
        }
        let entries = self.sink.drain();
        let message = template::render(report, &entries, &self.title, &self.host);

        for transport in &self.transports {
            match transport.send(Level::Info, &message).await {
                Ok(()) => info!(transport = transport.name(), "notification delivered"),
                Err(e) => warn!(transport = transport.name(), "notification failed: {e}"),
            }
        }
    }
}

/// Parses `--notifications` URLs (`slack://...`, `gotify://...`) into
/// concrete transports, skipping and logging any unrecognized scheme
/// rather than failing startup.
pub fn build_transports(urls: &[String]) -> Vec<Arc<dyn Notifier>> {
    let mut transports = Vec::new();
    for raw in urls {
        match transports::from_url(raw) {
            Ok(transport) => transports.push(transport),
            Err(e) => warn!("skipping notifier url: {e}"),
        }
    }
    transports
}
