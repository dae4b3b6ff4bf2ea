//! Stream draining.
//!
//! Each drained stream gets its own task that copies bytes into a
//! [`SinkHandle`] until EOF, so a child never blocks on a full pipe.

use std::io::{self, Read};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::{AbortHandle, JoinHandle};

use crate::diagnostics::StreamKind;
use crate::sink::SinkHandle;

const READ_BUFFER_SIZE: usize = 8192;

/// Join handle of a running drain.
///
/// Completes exactly once with the number of bytes pumped, or the I/O error
/// that stopped it. The source is dropped when the task ends.
#[derive(Debug)]
pub struct DrainHandle {
    stream: StreamKind,
    task: JoinHandle<io::Result<u64>>,
}

impl DrainHandle {
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.task.abort_handle()
    }

    pub async fn wait(self) -> io::Result<u64> {
        match self.task.await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                format!("{} drain cancelled", self.stream),
            )),
            Err(e) => Err(io::Error::other(format!(
                "{} drain panicked: {e}",
                self.stream
            ))),
        }
    }
}

/// Pumps an async reader into `sink` on a runtime task.
pub fn drain<R>(source: R, sink: SinkHandle) -> DrainHandle
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let stream = sink.stream();
    let task = tokio::spawn(async move {
        let mut source = source;
        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            sink.append(&buf[..n]);
            total += n as u64;
        }
        tracing::trace!(stream = %stream, bytes = total, "drain reached EOF");
        Ok(total)
    });
    DrainHandle { stream, task }
}

/// Pumps a blocking reader (PTY master, raw pipe) into `sink` on the
/// blocking pool.
pub fn drain_blocking<R>(source: R, sink: SinkHandle) -> DrainHandle
where
    R: Read + Send + 'static,
{
    let stream = sink.stream();
    let task = tokio::task::spawn_blocking(move || {
        let mut source = source;
        let mut buf = [0u8; READ_BUFFER_SIZE];
        let mut total = 0u64;
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            sink.append(&buf[..n]);
            total += n as u64;
        }
        tracing::trace!(stream = %stream, bytes = total, "drain reached EOF");
        Ok(total)
    });
    DrainHandle { stream, task }
}
