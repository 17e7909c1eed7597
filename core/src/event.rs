//! Event traces: named, ordered, thread-safe logs of timestamped messages.
//!
//! A [`Trace`] is a cheap cloneable handle to an append-only event log.
//! Components receive a trace handle from the engine and append milestones
//! to it; the engine serializes all traces into a single structured record
//! when it terminates. A [`Trace::noop`] handle drops appends silently, so
//! call sites never need to branch on whether tracing is wired up.

use crate::error::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;

/// A single `(timestamp, message)` record within a trace.
#[derive(Debug, Clone, Serialize)]
pub struct TraceEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

#[derive(Debug)]
struct Inner {
    id: String,
    /// Instant traces additionally forward each event to the log sink at
    /// trace verbosity.
    instant: bool,
    events: Mutex<Vec<TraceEvent>>,
}

/// Handle to a named event trace.
///
/// Cloning shares the underlying log. Appends are thread-safe.
#[derive(Debug, Clone)]
pub struct Trace {
    inner: Option<Arc<Inner>>,
}

impl Trace {
    /// Create a new buffered trace with the given stable id.
    pub fn new(id: impl Into<String>) -> Self {
        Self::build(id.into(), false)
    }

    /// Create an instant trace: events are buffered like [`Trace::new`]
    /// and also emitted to the log sink as they happen.
    pub fn instant(id: impl Into<String>) -> Self {
        Self::build(id.into(), true)
    }

    fn build(id: String, instant: bool) -> Self {
        Self {
            inner: Some(Arc::new(Inner {
                id,
                instant,
                events: Mutex::new(Vec::new()),
            })),
        }
    }

    /// A trace that drops every append.
    pub fn noop() -> Self {
        Self { inner: None }
    }

    /// Stable id of this trace, or the empty string for a no-op trace.
    pub fn id(&self) -> &str {
        self.inner.as_ref().map(|inner| inner.id.as_str()).unwrap_or("")
    }

    /// Append a timestamped message to the trace.
    pub fn add_event(&self, message: impl Into<String>) {
        let Some(inner) = &self.inner else {
            return;
        };
        let message = message.into();
        if inner.instant {
            tracing::trace!(trace_id = %inner.id, event = %message);
        }
        inner.events.lock().push(TraceEvent {
            timestamp: Utc::now(),
            message,
        });
    }

    /// Freeze the trace into a structured record carrying its id and all
    /// events. A no-op trace serializes to `null`.
    pub fn fire(&self) -> Result<serde_json::Value> {
        let Some(inner) = &self.inner else {
            return Ok(serde_json::Value::Null);
        };
        #[derive(Serialize)]
        struct Record<'a> {
            id: &'a str,
            events: Vec<TraceEvent>,
        }
        let events = inner.events.lock().clone();
        Ok(serde_json::to_value(Record {
            id: &inner.id,
            events,
        })?)
    }

    /// Number of events appended so far.
    pub fn len(&self) -> usize {
        self.inner
            .as_ref()
            .map(|inner| inner.events.lock().len())
            .unwrap_or(0)
    }

    /// Whether the trace holds no events.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Serialize a set of traces into one record per trace.
pub fn fire_all(traces: &[Trace]) -> Result<Vec<serde_json::Value>> {
    traces.iter().map(Trace::fire).collect()
}
