//! Chrome trace output.
//!
//! Load the resulting file in chrome://tracing or Perfetto.  Pips show up on
//! one track per fake thread id, so the trace shows how full the dispatcher
//! queues were over time.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::Mutex;
use std::time::Instant;

static TRACE: Mutex<Option<Trace>> = Mutex::new(None);

struct Event<'a> {
    name: &'a str,
    tid: usize,
    start: Instant,
    end: Instant,
}

struct Trace {
    start: Instant,
    w: BufWriter<File>,
}

impl Trace {
    fn new(path: &str) -> std::io::Result<Self> {
        let mut w = BufWriter::new(File::create(path)?);
        writeln!(w, "[")?;
        Ok(Trace {
            start: Instant::now(),
            w,
        })
    }

    fn write_event(&mut self, event: &Event) -> std::io::Result<()> {
        write!(
            self.w,
            "{{ \"pid\": 0, \"tid\": {}, \"name\": {:?}, \"ts\": {}, \"ph\": \"X\", \"dur\": {} }}",
            event.tid,
            event.name,
            event.start.saturating_duration_since(self.start).as_micros(),
            event.end.saturating_duration_since(event.start).as_micros(),
        )
    }

    fn write(&mut self, event: &Event) -> std::io::Result<()> {
        self.write_event(event)?;
        writeln!(self.w, ",")
    }

    fn close(&mut self) -> std::io::Result<()> {
        self.write_event(&Event {
            name: "main",
            tid: 0,
            start: self.start,
            end: Instant::now(),
        })?;
        writeln!(self.w, "]")?;
        self.w.flush()
    }
}

fn with_trace<T>(f: impl FnOnce(&mut Trace) -> T) -> Option<T> {
    // A panic while tracing leaves the file half written; keep going.
    let mut guard = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    guard.as_mut().map(f)
}

pub fn open(path: &str) -> std::io::Result<()> {
    let trace = Trace::new(path)?;
    *TRACE.lock().unwrap_or_else(|e| e.into_inner()) = Some(trace);
    Ok(())
}

pub fn is_enabled() -> bool {
    with_trace(|_| ()).is_some()
}

/// Runs `f`, recording it as a span on the main track.
#[inline]
pub fn scope<T>(name: &'static str, f: impl FnOnce() -> T) -> T {
    if !is_enabled() {
        return f();
    }
    let start = Instant::now();
    let result = f();
    let end = Instant::now();
    if let Some(Err(err)) = with_trace(|t| {
        t.write(&Event {
            name,
            tid: 0,
            start,
            end,
        })
    }) {
        tracing::warn!(%err, "writing trace event");
    }
    result
}

/// Records an already finished span, e.g. a pip that ran on a worker.
pub fn write_complete(name: &str, tid: usize, start: Instant, end: Instant) -> std::io::Result<()> {
    with_trace(|t| {
        t.write(&Event {
            name,
            tid,
            start,
            end,
        })
    })
    .unwrap_or(Ok(()))
}

pub fn close() -> std::io::Result<()> {
    let mut guard = TRACE.lock().unwrap_or_else(|e| e.into_inner());
    match guard.take() {
        Some(mut t) => t.close(),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The trace is process global, so everything lives in one test.
    #[test]
    fn writes_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.json");
        assert!(!is_enabled());
        open(path.to_str().unwrap()).unwrap();
        assert_eq!(scope("load", || 3), 3);
        let now = Instant::now();
        write_complete("Pip0000000000000001", 2, now, now).unwrap();
        close().unwrap();
        assert!(!is_enabled());

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("[\n"));
        assert!(text.trim_end().ends_with(']'));
        assert!(text.contains("\"name\": \"load\""));
        assert!(text.contains("\"tid\": 2, \"name\": \"Pip0000000000000001\""));
        assert!(text.contains("\"name\": \"main\""));
    }
}
