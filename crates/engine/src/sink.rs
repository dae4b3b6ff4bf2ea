//! Output sinks.
//!
//! A sink is the destination of a drained stream. [`OutputCapture`] picks
//! the sink kind; [`SinkHandle`] shares one sink between the draining task
//! and readers, wakes readers waiting for output, and delivers the events a
//! sink reports to its diagnostics listener.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::warn;

use crate::diagnostics::{Charset, DiagnosticsEvent, DiagnosticsListener, StreamKind};
use crate::error::EngineError;
use crate::lock_unpoisoned;

/// Default retention limit for bounded capture: 1 MiB.
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

/// Passive byte accumulator fed by a drain.
pub trait OutputSink: Send {
    /// Accepts a chunk, returning an event to report when one is due.
    fn append(&mut self, data: &[u8]) -> Option<DiagnosticsEvent>;

    /// Retained bytes, decoded.
    fn content(&self) -> String;

    /// Number of retained bytes.
    fn retained(&self) -> usize;

    fn clear(&mut self);
}

/// Keeps the first `max_bytes` bytes and reports everything past that.
pub struct BoundedOutputSink {
    max_bytes: usize,
    charset: Charset,
    stream: StreamKind,
    buffer: Vec<u8>,
}

impl BoundedOutputSink {
    pub fn new(max_bytes: usize, charset: Charset, stream: StreamKind) -> Result<Self, EngineError> {
        if max_bytes == 0 {
            return Err(EngineError::InvalidRequest(
                "bounded capture needs max_bytes >= 1".to_string(),
            ));
        }
        Ok(Self {
            max_bytes,
            charset,
            stream,
            buffer: Vec::new(),
        })
    }
}

impl OutputSink for BoundedOutputSink {
    fn append(&mut self, data: &[u8]) -> Option<DiagnosticsEvent> {
        if data.is_empty() {
            return None;
        }
        let remaining = self.max_bytes.saturating_sub(self.buffer.len());
        let keep = remaining.min(data.len());
        self.buffer.extend_from_slice(&data[..keep]);
        if keep == data.len() {
            return None;
        }
        let dropped = &data[keep..];
        DiagnosticsEvent::truncated(
            self.stream,
            dropped,
            self.charset,
            self.buffer.len() as u64,
            dropped.len() as u64,
        )
    }

    fn content(&self) -> String {
        self.charset.decode(&self.buffer)
    }

    fn retained(&self) -> usize {
        self.buffer.len()
    }

    fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Drops everything.
#[derive(Debug, Default)]
pub struct DiscardOutputSink;

impl OutputSink for DiscardOutputSink {
    fn append(&mut self, _data: &[u8]) -> Option<DiagnosticsEvent> {
        None
    }

    fn content(&self) -> String {
        String::new()
    }

    fn retained(&self) -> usize {
        0
    }

    fn clear(&mut self) {}
}

/// Retains nothing; reports each chunk as an event.
pub struct StreamingOutputSink {
    charset: Charset,
    stream: StreamKind,
}

impl StreamingOutputSink {
    pub fn new(charset: Charset, stream: StreamKind) -> Self {
        Self { charset, stream }
    }
}

impl OutputSink for StreamingOutputSink {
    fn append(&mut self, data: &[u8]) -> Option<DiagnosticsEvent> {
        if data.is_empty() {
            return None;
        }
        Some(DiagnosticsEvent::OutputChunk {
            stream: self.stream,
            payload: data.to_vec(),
            charset: self.charset,
        })
    }

    fn content(&self) -> String {
        String::new()
    }

    fn retained(&self) -> usize {
        0
    }

    fn clear(&mut self) {}
}

/// How a stream's output is captured.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum OutputCapture {
    Bounded {
        max_bytes: usize,
        #[serde(default)]
        charset: Charset,
    },
    Discard,
    Streaming {
        #[serde(default)]
        charset: Charset,
    },
}

impl OutputCapture {
    pub fn bounded(max_bytes: usize) -> Self {
        OutputCapture::Bounded {
            max_bytes,
            charset: Charset::utf8(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            OutputCapture::Bounded { .. } => "bounded",
            OutputCapture::Discard => "discard",
            OutputCapture::Streaming { .. } => "streaming",
        }
    }

    pub fn charset(&self) -> Charset {
        match self {
            OutputCapture::Bounded { charset, .. } | OutputCapture::Streaming { charset } => {
                *charset
            }
            OutputCapture::Discard => Charset::utf8(),
        }
    }

    /// Builds a fresh sink for `stream`.
    pub fn create_sink(&self, stream: StreamKind) -> Result<Box<dyn OutputSink>, EngineError> {
        Ok(match *self {
            OutputCapture::Bounded { max_bytes, charset } => {
                Box::new(BoundedOutputSink::new(max_bytes, charset, stream)?)
            }
            OutputCapture::Discard => Box::new(DiscardOutputSink),
            OutputCapture::Streaming { charset } => {
                Box::new(StreamingOutputSink::new(charset, stream))
            }
        })
    }
}

impl Default for OutputCapture {
    fn default() -> Self {
        Self::bounded(DEFAULT_MAX_BYTES)
    }
}

struct SharedSink {
    stream: StreamKind,
    sink: Mutex<Box<dyn OutputSink>>,
    diagnostics: DiagnosticsListener,
    appended: Notify,
}

/// Shared, cloneable access to a sink.
#[derive(Clone)]
pub struct SinkHandle {
    shared: Arc<SharedSink>,
}

impl SinkHandle {
    /// Wraps a sink whose events are dropped.
    pub fn new(sink: Box<dyn OutputSink>, stream: StreamKind) -> Self {
        Self::with_diagnostics(sink, stream, DiagnosticsListener::noop())
    }

    pub fn with_diagnostics(
        sink: Box<dyn OutputSink>,
        stream: StreamKind,
        diagnostics: DiagnosticsListener,
    ) -> Self {
        Self {
            shared: Arc::new(SharedSink {
                stream,
                sink: Mutex::new(sink),
                diagnostics,
                appended: Notify::new(),
            }),
        }
    }

    /// Creates a sink from `capture` and wraps it.
    pub fn from_capture(
        capture: &OutputCapture,
        stream: StreamKind,
        diagnostics: &DiagnosticsListener,
    ) -> Result<Self, EngineError> {
        Ok(Self::with_diagnostics(
            capture.create_sink(stream)?,
            stream,
            diagnostics.clone(),
        ))
    }

    pub fn stream(&self) -> StreamKind {
        self.shared.stream
    }

    /// Appends a chunk, then reports any resulting event.
    ///
    /// The listener runs without the sink locked, so it may read this handle.
    /// A panicking listener is logged and does not stop the caller.
    pub fn append(&self, data: &[u8]) {
        let event = lock_unpoisoned(&self.shared.sink).append(data);
        self.shared.appended.notify_waiters();

        if let Some(event) = event {
            let listener = &self.shared.diagnostics;
            if catch_unwind(AssertUnwindSafe(|| listener.emit(&event))).is_err() {
                warn!(stream = %self.shared.stream, "Diagnostics listener panicked");
            }
        }
    }

    pub fn content(&self) -> String {
        lock_unpoisoned(&self.shared.sink).content()
    }

    pub fn retained(&self) -> usize {
        lock_unpoisoned(&self.shared.sink).retained()
    }

    /// Returns the retained content and clears the sink.
    pub fn take(&self) -> String {
        let mut sink = lock_unpoisoned(&self.shared.sink);
        let content = sink.content();
        sink.clear();
        content
    }

    pub fn clear(&self) {
        lock_unpoisoned(&self.shared.sink).clear();
    }

    /// Waits until the retained content satisfies `predicate`.
    ///
    /// Returns the matching content, or `None` once `timeout` elapses. A
    /// timeout too large to represent waits without a deadline.
    pub async fn wait_until<F>(&self, predicate: F, timeout: Duration) -> Option<String>
    where
        F: Fn(&str) -> bool,
    {
        let deadline = tokio::time::Instant::now().checked_add(timeout);
        loop {
            let notified = self.shared.appended.notified();
            tokio::pin!(notified);
            // Register before checking so an append in between is not missed.
            notified.as_mut().enable();

            let content = self.content();
            if predicate(&content) {
                return Some(content);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return None;
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Waits until the retained content contains `needle`.
    pub async fn wait_for(&self, needle: &str, timeout: Duration) -> Option<String> {
        self.wait_until(|content| content.contains(needle), timeout)
            .await
    }
}

impl std::fmt::Debug for SinkHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkHandle")
            .field("stream", &self.shared.stream)
            .field("retained", &self.retained())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_listener() -> (DiagnosticsListener, Arc<Mutex<Vec<DiagnosticsEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let listener = {
            let events = Arc::clone(&events);
            DiagnosticsListener::new(move |event| events.lock().unwrap().push(event.clone()))
        };
        (listener, events)
    }

    #[test]
    fn test_bounded_sink_rejects_zero_capacity() {
        let result = BoundedOutputSink::new(0, Charset::utf8(), StreamKind::Stdout);
        assert!(matches!(result, Err(EngineError::InvalidRequest(_))));
    }

    #[test]
    fn test_bounded_sink_single_overflow() {
        let mut sink = BoundedOutputSink::new(4, Charset::utf8(), StreamKind::Stdout).unwrap();

        let event = sink.append(b"abcdefghij");

        assert_eq!(sink.content(), "abcd");
        assert_eq!(sink.retained(), 4);
        match event {
            Some(DiagnosticsEvent::OutputTruncated {
                stream,
                preview,
                retained_bytes,
                discarded_bytes,
                ..
            }) => {
                assert_eq!(stream, StreamKind::Stdout);
                assert_eq!(preview.as_slice(), b"efghij");
                assert_eq!(retained_bytes, 4);
                assert_eq!(discarded_bytes, 6);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_bounded_sink_never_exceeds_capacity() {
        let mut sink = BoundedOutputSink::new(10, Charset::utf8(), StreamKind::Stderr).unwrap();

        let events: Vec<DiagnosticsEvent> = (0..7).filter_map(|_| sink.append(b"xyz")).collect();

        assert_eq!(sink.retained(), 10);
        assert!(sink.content().len() <= 10);

        let discarded: u64 = events
            .iter()
            .map(|event| match event {
                DiagnosticsEvent::OutputTruncated {
                    discarded_bytes, ..
                } => *discarded_bytes,
                _ => 0,
            })
            .sum();
        assert_eq!(discarded, 21 - 10);
        assert!(events.iter().all(|event| matches!(
            event,
            DiagnosticsEvent::OutputTruncated { retained_bytes: 10, discarded_bytes, .. } if *discarded_bytes > 0
        )));
    }

    #[test]
    fn test_bounded_sink_exact_fit_emits_nothing() {
        let mut sink = BoundedOutputSink::new(5, Charset::utf8(), StreamKind::Stdout).unwrap();
        assert!(sink.append(b"hello").is_none());
        assert!(sink.append(b"").is_none());
        assert_eq!(sink.content(), "hello");
    }

    #[test]
    fn test_discard_sink_is_always_empty() {
        let mut sink = DiscardOutputSink;
        assert!(sink.append(b"anything at all").is_none());
        assert!(sink.append(&[0u8; 4096]).is_none());
        assert_eq!(sink.content(), "");
        assert_eq!(sink.retained(), 0);
    }

    #[test]
    fn test_streaming_sink_forwards_chunks() {
        let (listener, events) = recording_listener();
        let handle = SinkHandle::from_capture(
            &OutputCapture::Streaming {
                charset: Charset::utf8(),
            },
            StreamKind::Merged,
            &listener,
        )
        .unwrap();
        handle.append(b"one");
        handle.append(b"two");

        assert_eq!(handle.content(), "");
        let texts: Vec<String> = events.lock().unwrap().iter().map(|e| e.text()).collect();
        assert_eq!(texts, vec!["one", "two"]);
    }

    #[test]
    fn test_listener_can_read_the_handle_it_observes() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let slot: Arc<Mutex<Option<SinkHandle>>> = Arc::new(Mutex::new(None));
        let listener = {
            let seen = Arc::clone(&seen);
            let slot = Arc::clone(&slot);
            DiagnosticsListener::new(move |_event| {
                if let Some(handle) = slot.lock().unwrap().as_ref() {
                    seen.lock().unwrap().push(handle.content());
                }
            })
        };
        let handle =
            SinkHandle::from_capture(&OutputCapture::bounded(4), StreamKind::Stdout, &listener)
                .unwrap();
        *slot.lock().unwrap() = Some(handle.clone());

        handle.append(b"abcdef");

        assert_eq!(*seen.lock().unwrap(), vec!["abcd".to_string()]);
        slot.lock().unwrap().take();
    }

    #[test]
    fn test_panicking_listener_does_not_stop_appends() {
        let listener = DiagnosticsListener::new(|_event| panic!("listener failure"));
        let handle =
            SinkHandle::from_capture(&OutputCapture::bounded(2), StreamKind::Stderr, &listener)
                .unwrap();

        handle.append(b"abc");
        handle.append(b"def");

        assert_eq!(handle.content(), "ab");
    }

    #[test]
    fn test_capture_serde_tagged() {
        let capture: OutputCapture =
            serde_json::from_str(r#"{"mode":"bounded","max_bytes":64}"#).unwrap();
        assert_eq!(capture, OutputCapture::bounded(64));

        let discard: OutputCapture = serde_json::from_str(r#"{"mode":"discard"}"#).unwrap();
        assert_eq!(discard, OutputCapture::Discard);
        assert_eq!(discard.name(), "discard");
    }

    #[test]
    fn test_sink_handle_take_clears() {
        let handle = SinkHandle::from_capture(
            &OutputCapture::bounded(32),
            StreamKind::Stdout,
            &DiagnosticsListener::noop(),
        )
        .unwrap();
        handle.append(b"first");
        assert_eq!(handle.take(), "first");
        assert_eq!(handle.content(), "");
        assert_eq!(handle.retained(), 0);
    }

    #[tokio::test]
    async fn test_sink_handle_wait_for_wakes_on_append() {
        let handle = SinkHandle::from_capture(
            &OutputCapture::bounded(1024),
            StreamKind::Stdout,
            &DiagnosticsListener::noop(),
        )
        .unwrap();

        let writer = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(b"partial ");
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(b"READY\n");
        });

        let content = handle.wait_for("READY", Duration::from_secs(2)).await;
        assert_eq!(content.as_deref(), Some("partial READY\n"));
    }

    #[tokio::test]
    async fn test_sink_handle_wait_times_out() {
        let handle = SinkHandle::new(Box::new(DiscardOutputSink), StreamKind::Stdout);
        let result = handle
            .wait_until(|content| !content.is_empty(), Duration::from_millis(30))
            .await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_sink_handle_wait_with_unbounded_timeout() {
        let handle = SinkHandle::from_capture(
            &OutputCapture::bounded(64),
            StreamKind::Stdout,
            &DiagnosticsListener::noop(),
        )
        .unwrap();
        handle.append(b"already here");
        let content = handle.wait_for("already", Duration::MAX).await;
        assert_eq!(content.as_deref(), Some("already here"));

        let writer = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.append(b" later");
        });
        let content = tokio::time::timeout(
            Duration::from_secs(2),
            handle.wait_for("later", Duration::MAX),
        )
        .await
        .unwrap();
        assert!(content.unwrap().ends_with("later"));
    }
}
