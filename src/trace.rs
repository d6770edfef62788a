//! Per-attempt trace capture for mapping runs.

use serde::Serialize;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{mpsc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::validator::RejectionReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceOutcome {
    Accepted,
    Rejected,
    TransportError,
    Exhausted,
    Cancelled,
}

/// One line per batch attempt, plus a terminal line for exhausted or
/// cancelled batches.
#[derive(Debug, Clone, Serialize)]
pub struct BatchTrace {
    pub timestamp_ms: i64,
    pub batch_index: usize,
    pub requirement_ids: Vec<String>,
    pub key_hash: String,
    pub tier: Option<String>,
    pub attempt: usize,
    pub cached: bool,
    pub transport_retries: u32,
    pub outcome: TraceOutcome,
    pub reasons: Vec<String>,
    pub catalog_version: u64,
    pub error: Option<String>,
}

impl BatchTrace {
    pub fn new(
        batch_index: usize,
        requirement_ids: Vec<String>,
        key_hash: impl Into<String>,
        catalog_version: u64,
        outcome: TraceOutcome,
    ) -> Self {
        Self {
            timestamp_ms: now_epoch_ms(),
            batch_index,
            requirement_ids,
            key_hash: key_hash.into(),
            tier: None,
            attempt: 0,
            cached: false,
            transport_retries: 0,
            outcome,
            reasons: Vec::new(),
            catalog_version,
            error: None,
        }
    }

    pub fn tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn attempt(mut self, attempt: usize) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn transport_retries(mut self, retries: u32) -> Self {
        self.transport_retries = retries;
        self
    }

    pub fn reasons(mut self, reasons: &[RejectionReason]) -> Self {
        self.reasons = reasons.iter().map(ToString::to_string).collect();
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(String),
    #[error("trace channel closed")]
    Closed,
    #[error("trace worker failed: {0}")]
    Join(String),
}

pub trait TraceSink: Send + Sync {
    fn record(&self, event: BatchTrace) -> Result<(), TraceError>;
}

/// Writes traces as JSON lines on a background thread.
pub struct JsonlTraceSink {
    sender: Mutex<mpsc::Sender<BatchTrace>>,
}

pub struct TraceWorker {
    handle: Option<std::thread::JoinHandle<Result<(), TraceError>>>,
}

impl TraceWorker {
    /// Wait for every queued event to be flushed. Drop the sink first.
    pub fn join(mut self) -> Result<(), TraceError> {
        match self.handle.take() {
            Some(handle) => match handle.join() {
                Ok(result) => result,
                Err(_) => Err(TraceError::Join("trace worker panicked".to_string())),
            },
            None => Ok(()),
        }
    }
}

impl JsonlTraceSink {
    pub fn new(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = std::fs::File::create(path)?;
        let (sender, receiver) = mpsc::channel::<BatchTrace>();
        let handle = std::thread::spawn(move || write_trace_loop(file, receiver));
        Ok((
            Self {
                sender: Mutex::new(sender),
            },
            TraceWorker {
                handle: Some(handle),
            },
        ))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: BatchTrace) -> Result<(), TraceError> {
        let sender = self.sender.lock().map_err(|_| TraceError::Closed)?;
        sender.send(event).map_err(|_| TraceError::Closed)
    }
}

/// Keeps traces in memory. Handy for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTraceSink {
    events: Mutex<Vec<BatchTrace>>,
}

impl MemoryTraceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<BatchTrace> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl TraceSink for MemoryTraceSink {
    fn record(&self, event: BatchTrace) -> Result<(), TraceError> {
        self.events
            .lock()
            .map_err(|_| TraceError::Closed)?
            .push(event);
        Ok(())
    }
}

fn write_trace_loop(
    file: std::fs::File,
    receiver: mpsc::Receiver<BatchTrace>,
) -> Result<(), TraceError> {
    let mut writer = BufWriter::new(file);
    for event in receiver {
        let line = serde_json::to_string(&event).map_err(|e| TraceError::Serde(e.to_string()))?;
        writeln!(writer, "{line}")?;
    }
    writer.flush()?;
    Ok(())
}

pub fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}
