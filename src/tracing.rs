//! Chrome Tracing capture of tear execution.
//!
//! Spans are recorded into a thread-local buffer with no contention. Each
//! worker moves its buffer into the rift's collector when it exits, and the
//! merged events can be written to a JSON file readable by chrome://tracing
//! or ui.perfetto.dev.

use serde::Serialize;
use std::cell::RefCell;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// One executed tear.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceEvent {
    pub name: &'static str,
    pub worker: usize,
    /// Microseconds since the rift started.
    pub start_us: u64,
    pub duration_us: u64,
}

struct Span {
    name: &'static str,
    worker: usize,
    start: Instant,
    duration: Duration,
}

thread_local! {
    static TRACE_BUFFER: RefCell<Vec<Span>> = RefCell::new(Vec::with_capacity(1024));
}

/// Records a span of work on the calling thread.
// Not inlined so the thread-local is resolved on the thread the fiber is
// running on right now.
#[inline(never)]
pub fn record_event(name: &'static str, worker: usize, start: Instant, duration: Duration) {
    TRACE_BUFFER.with(|buf| {
        buf.borrow_mut().push(Span {
            name,
            worker,
            start,
            duration,
        });
    });
}

/// Events merged from every worker of one rift.
pub(crate) struct TraceCollector {
    origin: Instant,
    events: Mutex<Vec<TraceEvent>>,
}

impl TraceCollector {
    pub(crate) fn new() -> Self {
        TraceCollector {
            origin: Instant::now(),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Moves the calling thread's buffer into the collector.
    #[inline(never)]
    pub(crate) fn collect_local(&self) {
        let spans = TRACE_BUFFER.with(|buf| std::mem::take(&mut *buf.borrow_mut()));
        if spans.is_empty() {
            return;
        }
        let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        events.extend(spans.into_iter().map(|span| TraceEvent {
            name: span.name,
            worker: span.worker,
            start_us: span.start.saturating_duration_since(self.origin).as_micros() as u64,
            duration_us: span.duration.as_micros() as u64,
        }));
    }

    pub(crate) fn into_events(self) -> Vec<TraceEvent> {
        let mut events = self
            .events
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        events.sort_by_key(|event| event.start_us);
        events
    }
}

/// Chrome "complete event" (`ph: X`).
#[derive(Serialize)]
struct ChromeEvent<'a> {
    name: &'a str,
    ph: &'static str,
    ts: u64,
    dur: u64,
    pid: u32,
    tid: usize,
}

/// Writes `events` as a Chrome Tracing JSON array.
pub fn export_to_file(events: &[TraceEvent], path: impl AsRef<Path>) -> std::io::Result<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    let chrome: Vec<ChromeEvent<'_>> = events
        .iter()
        .map(|event| ChromeEvent {
            name: event.name,
            ph: "X",
            ts: event.start_us,
            dur: event.duration_us,
            pid: 1,
            tid: event.worker,
        })
        .collect();
    serde_json::to_writer(&mut writer, &chrome)?;
    writer.flush()
}
