//! Diagnostics events emitted while draining process output.
//!
//! Sinks report what happens to the bytes they receive through a
//! [`DiagnosticsListener`]. Listeners run synchronously on the draining task,
//! so they should return quickly.

use std::fmt;
use std::sync::Arc;

use encoding_rs::Encoding;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
    /// stdout and stderr sharing one pipe, or a PTY.
    Merged,
}

impl StreamKind {
    pub fn as_str(self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
            StreamKind::Merged => "merged",
        }
    }
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Character set used to decode captured bytes.
///
/// Resolved from WHATWG labels (`"utf-8"`, `"latin1"`, `"shift_jis"`, ...).
/// Decoding is lossy: malformed sequences become U+FFFD.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Charset(&'static Encoding);

impl Charset {
    pub fn utf8() -> Self {
        Charset(encoding_rs::UTF_8)
    }

    pub fn for_label(label: &str) -> Option<Self> {
        Encoding::for_label(label.trim().as_bytes()).map(Charset)
    }

    /// Canonical encoding name, e.g. `"UTF-8"`.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        let (text, _had_errors) = self.0.decode_without_bom_handling(bytes);
        text.into_owned()
    }
}

impl Default for Charset {
    fn default() -> Self {
        Self::utf8()
    }
}

impl fmt::Debug for Charset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Charset").field(&self.name()).finish()
    }
}

impl Serialize for Charset {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for Charset {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let label = String::deserialize(deserializer)?;
        Charset::for_label(&label)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown charset label: {label}")))
    }
}

/// Something noteworthy happened to a stream's output.
///
/// Payloads are owned copies; they never alias a sink's buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticsEvent {
    /// A chunk was forwarded without being retained.
    OutputChunk {
        stream: StreamKind,
        payload: Vec<u8>,
        charset: Charset,
    },
    /// Bytes were dropped because a bounded sink was full.
    OutputTruncated {
        stream: StreamKind,
        preview: Vec<u8>,
        charset: Charset,
        /// Bytes held by the sink after this append.
        retained_bytes: u64,
        /// Bytes dropped by this append. Always positive.
        discarded_bytes: u64,
    },
}

impl DiagnosticsEvent {
    /// Builds a truncation event, or `None` if nothing was discarded.
    pub fn truncated(
        stream: StreamKind,
        preview: &[u8],
        charset: Charset,
        retained_bytes: u64,
        discarded_bytes: u64,
    ) -> Option<Self> {
        if discarded_bytes == 0 {
            return None;
        }
        Some(DiagnosticsEvent::OutputTruncated {
            stream,
            preview: preview.to_vec(),
            charset,
            retained_bytes,
            discarded_bytes,
        })
    }

    pub fn stream(&self) -> StreamKind {
        match self {
            DiagnosticsEvent::OutputChunk { stream, .. }
            | DiagnosticsEvent::OutputTruncated { stream, .. } => *stream,
        }
    }

    /// Decoded payload or preview.
    pub fn text(&self) -> String {
        match self {
            DiagnosticsEvent::OutputChunk {
                payload, charset, ..
            } => charset.decode(payload),
            DiagnosticsEvent::OutputTruncated {
                preview, charset, ..
            } => charset.decode(preview),
        }
    }
}

type ListenerFn = dyn Fn(&DiagnosticsEvent) + Send + Sync;

/// Receives [`DiagnosticsEvent`]s. Cheap to clone.
#[derive(Clone)]
pub struct DiagnosticsListener {
    inner: Arc<ListenerFn>,
}

impl DiagnosticsListener {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&DiagnosticsEvent) + Send + Sync + 'static,
    {
        Self { inner: Arc::new(f) }
    }

    /// Listener that ignores everything.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Listener that logs every event through `tracing`.
    pub fn tracing() -> Self {
        Self::new(|event| match event {
            DiagnosticsEvent::OutputChunk {
                stream, payload, ..
            } => {
                tracing::trace!(stream = %stream, bytes = payload.len(), "output chunk");
            }
            DiagnosticsEvent::OutputTruncated {
                stream,
                retained_bytes,
                discarded_bytes,
                ..
            } => {
                tracing::debug!(
                    stream = %stream,
                    retained_bytes,
                    discarded_bytes,
                    "output truncated"
                );
            }
        })
    }

    pub fn emit(&self, event: &DiagnosticsEvent) {
        (self.inner)(event)
    }

    /// Delivers to `self` first, then to `next`.
    ///
    /// There is no isolation between the two: if `self` panics, `next` does
    /// not see the event.
    pub fn and_then(&self, next: DiagnosticsListener) -> Self {
        let first = self.clone();
        Self::new(move |event| {
            first.emit(event);
            next.emit(event);
        })
    }
}

impl Default for DiagnosticsListener {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for DiagnosticsListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiagnosticsListener").finish_non_exhaustive()
    }
}
