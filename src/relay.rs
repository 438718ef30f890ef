//! Forward a process's output stream to a sink and await its exit.

use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{DevError, DevResult};
use crate::process::{OutputStream, ProcessHandle};
use crate::terminal::TerminalWidget;
use std::sync::Arc;

/// Receives output chunks in the order the process produced them.
pub trait OutputSink: Send + 'static {
    fn write(&mut self, chunk: &[u8]);

    /// Called once after the last chunk.
    fn finish(&mut self) {}
}

impl<F> OutputSink for F
where
    F: FnMut(&[u8]) + Send + 'static,
{
    fn write(&mut self, chunk: &[u8]) {
        self(chunk)
    }
}

/// Logs process output line by line, tagged with the process name.
pub struct LogSink {
    name: String,
    pending: Vec<u8>,
}

impl LogSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            pending: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        if !line.is_empty() {
            info!(process = %self.name, "{}", line);
        }
    }
}

impl OutputSink for LogSink {
    fn write(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
    }

    fn finish(&mut self) {
        let rest = std::mem::take(&mut self.pending);
        self.emit(&rest);
    }
}

/// Writes process output into a terminal widget.
pub struct TerminalSink {
    terminal: Arc<TerminalWidget>,
}

impl TerminalSink {
    pub fn new(terminal: Arc<TerminalWidget>) -> Self {
        Self { terminal }
    }
}

impl OutputSink for TerminalSink {
    fn write(&mut self, chunk: &[u8]) {
        self.terminal.write(chunk);
    }
}

/// Deliver every chunk of `output` to `sink` until the stream ends.
pub fn relay_output<S: OutputSink>(mut output: OutputStream, mut sink: S) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(chunk) = output.next().await {
            sink.write(&chunk);
        }
        sink.finish();
    })
}

/// Relay the handle's output into `sink` and return its exit code once both
/// the output has drained and the process has exited.
pub async fn run_to_exit<S: OutputSink>(handle: &mut ProcessHandle, sink: S) -> DevResult<i32> {
    let output = handle.take_output().ok_or(DevError::ProcessClosed)?;
    let relay = relay_output(output, sink);
    let code = handle.wait().await?;
    let _ = relay.await;
    Ok(code)
}
