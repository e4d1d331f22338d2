//! Registries for application data listeners and log sinks.
//!
//! Every mesh log line goes to `tracing` first; registered log listeners get
//! a copy as a [`LogRecord`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;

use crate::membership::now_ms;

/// Receives `(from_label, payload)` for every generic message addressed to this node.
pub type DataListener = Arc<dyn Fn(&str, &Value) + Send + Sync>;

pub type LogListener = Arc<dyn Fn(&LogRecord) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Error,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: LogLevel,
    pub tag: &'static str,
    pub message: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Insertion-ordered set of listeners addressable by id.
pub struct ListenerSet<T> {
    next_id: AtomicU64,
    entries: RwLock<Vec<(ListenerId, T)>>,
}

impl<T: Clone> ListenerSet<T> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(Vec::new()),
        }
    }

    pub fn add(&self, listener: T) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.entries.write().push((id, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|(existing, _)| *existing != id);
        entries.len() != before
    }

    /// Clones the current listeners so callbacks run without the lock held.
    pub fn snapshot(&self) -> Vec<T> {
        self.entries.read().iter().map(|(_, l)| l.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T: Clone> Default for ListenerSet<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Log front for mesh components: `tracing` plus the registered sinks.
#[derive(Clone)]
pub struct MeshLog {
    label: Arc<str>,
    sinks: Arc<ListenerSet<LogListener>>,
}

impl MeshLog {
    pub fn new(label: &str) -> Self {
        Self {
            label: Arc::from(label),
            sinks: Arc::new(ListenerSet::new()),
        }
    }

    pub fn sinks(&self) -> &ListenerSet<LogListener> {
        &self.sinks
    }

    pub fn debug(&self, tag: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(node = %self.label, tag, "{message}");
        self.fan_out(LogLevel::Debug, tag, message);
    }

    pub fn info(&self, tag: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::info!(node = %self.label, tag, "{message}");
        self.fan_out(LogLevel::Info, tag, message);
    }

    pub fn error(&self, tag: &'static str, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(node = %self.label, tag, "{message}");
        self.fan_out(LogLevel::Error, tag, message);
    }

    fn fan_out(&self, level: LogLevel, tag: &'static str, message: String) {
        let sinks = self.sinks.snapshot();
        if sinks.is_empty() {
            return;
        }
        let record = LogRecord {
            level,
            tag,
            message,
            timestamp_ms: now_ms(),
        };
        for sink in sinks {
            sink(&record);
        }
    }
}
