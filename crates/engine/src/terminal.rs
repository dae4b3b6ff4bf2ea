//! Terminal control for interactive sessions.

use std::io::Write;
use std::sync::{Arc, Mutex};

use portable_pty::{MasterPty, PtySize};

use crate::error::SessionError;
use crate::lock_unpoisoned;
use crate::plan::ShutdownSignal;
use crate::terminate::ProcessTerminator;

/// ASCII ETX, delivered as SIGINT by the terminal line discipline.
pub const CTRL_C: u8 = 0x03;

/// Resize and signal operations that depend on how a session is attached.
pub trait TerminalController: Send + Sync {
    /// Resizes the terminal. Non-positive sizes are ignored.
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError>;

    fn send(&self, signal: ShutdownSignal) -> Result<(), SessionError>;

    fn is_pty(&self) -> bool {
        false
    }
}

/// Controller for pipe-backed sessions. Ignores everything; termination
/// goes through the shutdown escalation instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTerminalController;

impl TerminalController for NoopTerminalController {
    fn resize(&self, _cols: u16, _rows: u16) -> Result<(), SessionError> {
        Ok(())
    }

    fn send(&self, _signal: ShutdownSignal) -> Result<(), SessionError> {
        Ok(())
    }
}

pub(crate) type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

/// Controller backed by a pseudo-terminal.
pub struct PtyTerminalController {
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: SharedWriter,
    pid: Option<u32>,
    terminator: Arc<dyn ProcessTerminator>,
    size: Mutex<(u16, u16)>,
}

impl PtyTerminalController {
    pub(crate) fn new(
        master: Box<dyn MasterPty + Send>,
        writer: SharedWriter,
        pid: Option<u32>,
        terminator: Arc<dyn ProcessTerminator>,
        cols: u16,
        rows: u16,
    ) -> Self {
        Self {
            master: Mutex::new(master),
            writer,
            pid,
            terminator,
            size: Mutex::new((cols, rows)),
        }
    }

    /// Last applied size as `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *lock_unpoisoned(&self.size)
    }
}

impl TerminalController for PtyTerminalController {
    fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Ok(());
        }
        lock_unpoisoned(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::ResizeFailed(e.to_string()))?;
        *lock_unpoisoned(&self.size) = (cols, rows);
        tracing::debug!(cols, rows, "terminal resized");
        Ok(())
    }

    fn send(&self, signal: ShutdownSignal) -> Result<(), SessionError> {
        match signal {
            ShutdownSignal::Interrupt => {
                let mut writer = lock_unpoisoned(&self.writer);
                writer
                    .write_all(&[CTRL_C])
                    .and_then(|_| writer.flush())
                    .map_err(|e| SessionError::WriteFailed(e.to_string()))
            }
            ShutdownSignal::Terminate | ShutdownSignal::Kill => {
                let pid = self.pid.ok_or_else(|| {
                    SessionError::SignalFailed("pty child has no process id".to_string())
                })?;
                self.terminator
                    .terminate(pid, signal, false)
                    .map_err(|e| SessionError::SignalFailed(e.to_string()))
            }
        }
    }

    fn is_pty(&self) -> bool {
        true
    }
}
