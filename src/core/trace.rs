//! Structured decision trace for a single run.
//!
//! Every decision the controller makes lands here as an append-only event,
//! detailed enough to reconstruct the state transitions after the fact. The
//! in-memory [`ControllerTrace`] travels in the output; [`JsonlTraceSink`]
//! optionally mirrors the stream to a file.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// One logged decision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    pub component: String,
    pub action: String,
    #[serde(default)]
    pub details: Map<String, Value>,
}

/// Full execution history of one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerTrace {
    pub run_id: Uuid,
    pub events: Vec<TraceEvent>,
}

impl ControllerTrace {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            events: Vec::new(),
        }
    }

    /// Append an event. `details` must be a JSON object (pass
    /// `serde_json::json!({...})`).
    pub fn add(&mut self, component: &str, action: &str, details: Value) {
        let details = match details {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.events.push(TraceEvent {
            timestamp: Utc::now(),
            component: component.to_string(),
            action: action.to_string(),
            details,
        });
    }

    /// Action names in append order; the determinism tests compare these.
    pub fn actions(&self) -> Vec<&str> {
        self.events.iter().map(|e| e.action.as_str()).collect()
    }

    pub fn contains_action(&self, action: &str) -> bool {
        self.events.iter().any(|e| e.action == action)
    }
}

impl Default for ControllerTrace {
    fn default() -> Self {
        Self::new()
    }
}

/// Events buffered between `record` and the writer. Producers block once
/// the writer falls this far behind, so a stalled disk applies
/// backpressure instead of growing an unbounded queue.
const SINK_CHANNEL_DEPTH: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace file: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not encode `{action}` event: {message}")]
    Encode { action: String, message: String },
    #[error("trace writer is gone: {0}")]
    WriterGone(String),
}

/// Receives a copy of every trace event the controller records.
pub trait TraceSink: Send + Sync {
    fn record(&self, event: TraceEvent) -> Result<(), TraceError>;
}

/// Mirrors trace events to a file as JSON lines.
///
/// The sink owns its writer thread and feeds it through a bounded channel.
/// Call [`JsonlTraceSink::finish`] once the run is over: it closes the
/// stream, waits for the flush, and reports how many events reached the
/// file. Dropping the sink without calling `finish` also closes the
/// stream; the writer then flushes on its own, but any write error is
/// lost with it.
pub struct JsonlTraceSink {
    sender: SyncSender<TraceEvent>,
    writer: Option<JoinHandle<Result<usize, TraceError>>>,
}

impl JsonlTraceSink {
    pub fn create(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        let file = File::create(path)?;
        let (sender, receiver) = mpsc::sync_channel(SINK_CHANNEL_DEPTH);
        let writer = std::thread::Builder::new()
            .name("ragtune-trace".to_string())
            .spawn(move || drain_events(file, receiver))?;
        Ok(Self {
            sender,
            writer: Some(writer),
        })
    }

    /// Close the event stream and wait for the writer. Returns the number
    /// of events written to the file.
    pub fn finish(mut self) -> Result<usize, TraceError> {
        let writer = self.writer.take();
        drop(self);
        match writer {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                Err(TraceError::WriterGone(
                    "writer thread panicked before the stream closed".to_string(),
                ))
            }),
            None => Ok(0),
        }
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, event: TraceEvent) -> Result<(), TraceError> {
        self.sender
            .send(event)
            .map_err(|_| TraceError::WriterGone("event stream already closed".to_string()))
    }
}

fn drain_events(file: File, receiver: Receiver<TraceEvent>) -> Result<usize, TraceError> {
    let mut out = BufWriter::new(file);
    let mut written = 0usize;
    while let Ok(event) = receiver.recv() {
        serde_json::to_writer(&mut out, &event).map_err(|e| TraceError::Encode {
            action: event.action.clone(),
            message: e.to_string(),
        })?;
        out.write_all(b"\n")?;
        written += 1;
    }
    out.flush()?;
    Ok(written)
}
