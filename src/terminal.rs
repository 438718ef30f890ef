//! Terminal widgets and the interactive shell bound to them.
//!
//! A widget is created when a hosting surface (an xterm.js client connected
//! over a websocket) appears, sized from the client's fit, and disposed when
//! the surface goes away. Its output side fans out to every attached viewer;
//! its input side is taken exactly once by the shell binding.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DevError, DevResult};
use crate::process::TerminalSize;
use crate::relay::{relay_output, TerminalSink};
use crate::sandbox::{Sandbox, SpawnOptions};

const BACKLOG_LIMIT: usize = 64 * 1024;

#[derive(Default)]
struct Backlog {
    chunks: VecDeque<Vec<u8>>,
    total_bytes: usize,
}

impl Backlog {
    fn push(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.chunks.push_back(data.to_vec());
        self.total_bytes += data.len();
        while self.total_bytes > BACKLOG_LIMIT {
            match self.chunks.pop_front() {
                Some(removed) => self.total_bytes -= removed.len(),
                None => {
                    self.total_bytes = 0;
                    break;
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<Vec<u8>> {
        self.chunks.iter().cloned().collect()
    }
}

pub struct TerminalWidget {
    id: Uuid,
    size: watch::Sender<TerminalSize>,
    output: broadcast::Sender<Vec<u8>>,
    backlog: Mutex<Backlog>,
    input_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    input_rx: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    disposed: AtomicBool,
}

impl TerminalWidget {
    pub fn new(size: TerminalSize) -> Arc<Self> {
        let (size, _) = watch::channel(size);
        let (output, _) = broadcast::channel(256);
        let (input_tx, input_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id: Uuid::new_v4(),
            size,
            output,
            backlog: Mutex::new(Backlog::default()),
            input_tx: Mutex::new(Some(input_tx)),
            input_rx: Mutex::new(Some(input_rx)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn size(&self) -> TerminalSize {
        *self.size.borrow()
    }

    pub fn cols(&self) -> u16 {
        self.size().cols
    }

    pub fn rows(&self) -> u16 {
        self.size().rows
    }

    pub fn watch_size(&self) -> watch::Receiver<TerminalSize> {
        self.size.subscribe()
    }

    pub fn resize(&self, size: TerminalSize) {
        self.size.send_replace(size);
    }

    /// Render output. Ignored once disposed.
    pub fn write(&self, data: &[u8]) {
        if self.is_disposed() {
            return;
        }
        // Send under the backlog lock so a new viewer never sees a chunk twice.
        if let Ok(mut backlog) = self.backlog.lock() {
            backlog.push(data);
            let _ = self.output.send(data.to_vec());
        }
    }

    /// Replayable history plus a live feed of everything written afterwards.
    pub fn subscribe_output(&self) -> (Vec<Vec<u8>>, broadcast::Receiver<Vec<u8>>) {
        let backlog = self.backlog.lock();
        let rx = self.output.subscribe();
        let history = backlog.map(|b| b.snapshot()).unwrap_or_default();
        (history, rx)
    }

    /// Emit a `data` event, as if typed by the user.
    pub fn push_input(&self, data: impl Into<Vec<u8>>) -> DevResult<()> {
        let guard = self
            .input_tx
            .lock()
            .map_err(|_| DevError::Sandbox("terminal lock poisoned".into()))?;
        match guard.as_ref() {
            Some(tx) => tx.send(data.into()).map_err(|_| DevError::ProcessClosed),
            None => Err(DevError::ProcessClosed),
        }
    }

    /// The `data` event stream. Only the first caller gets it.
    pub fn take_input(&self) -> Option<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.input_rx.lock().ok()?.take()
    }

    /// Close the input stream and stop rendering. Bound processes are left
    /// to notice the closed input and exit on their own.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut tx) = self.input_tx.lock() {
            tx.take();
        }
        info!(terminal_id = %self.id, "Terminal disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Serve this widget over a websocket until either side closes, then
    /// dispose it.
    pub async fn attach_socket(self: Arc<Self>, socket: WebSocket) {
        let (history, mut rx) = self.subscribe_output();
        let (mut ws_tx, mut ws_rx) = socket.split();

        // Widget -> socket
        let send_task = tokio::spawn(async move {
            for chunk in history {
                if ws_tx.send(Message::Binary(chunk)).await.is_err() {
                    return;
                }
            }
            loop {
                match rx.recv().await {
                    Ok(data) => {
                        if ws_tx.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Terminal viewer lagged, output dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        // Socket -> widget
        while let Some(Ok(msg)) = ws_rx.next().await {
            let result = match msg {
                Message::Text(text) => match serde_json::from_str::<ControlMsg>(&text) {
                    Ok(ctrl) => {
                        self.handle_control(ctrl);
                        Ok(())
                    }
                    Err(_) => self.push_input(text.into_bytes()),
                },
                Message::Binary(bin) => self.push_input(bin),
                Message::Close(_) => break,
                Message::Ping(_) | Message::Pong(_) => Ok(()),
            };
            if result.is_err() {
                debug!(terminal_id = %self.id, "Terminal input closed");
            }
        }

        send_task.abort();
        self.dispose();
    }

    fn handle_control(&self, ctrl: ControlMsg) {
        if ctrl.typ == "resize" {
            if let (Some(cols), Some(rows)) = (ctrl.cols, ctrl.rows) {
                self.resize(TerminalSize { cols, rows });
            }
        }
    }
}

#[derive(Deserialize)]
struct ControlMsg {
    #[serde(rename = "type")]
    typ: String,
    cols: Option<u16>,
    rows: Option<u16>,
}

/// Spawn `program` in a pseudoterminal sized like `terminal` and wire it
/// both ways: shell output to `terminal.write`, terminal input to the shell.
///
/// The returned task ends when the terminal's input closes; dropping the
/// process handle then closes the shell's input. The exit status is ignored.
pub async fn bind_shell(
    sandbox: &dyn Sandbox,
    terminal: Arc<TerminalWidget>,
    program: &str,
    args: &[String],
) -> DevResult<JoinHandle<()>> {
    let mut input_events = terminal
        .take_input()
        .ok_or_else(|| DevError::Sandbox("terminal input already bound".into()))?;

    let mut shell = sandbox
        .spawn(program, args, SpawnOptions::with_terminal(terminal.size()))
        .await?;
    if let Some(output) = shell.take_output() {
        relay_output(output, TerminalSink::new(Arc::clone(&terminal)));
    }
    let input = shell.input();
    let mut sizes = terminal.watch_size();
    let terminal_id = terminal.id();
    info!(terminal_id = %terminal_id, process_id = %shell.id(), shell = %program, "Shell bound to terminal");

    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                data = input_events.recv() => match data {
                    Some(data) => {
                        if input.write(data).is_err() {
                            break;
                        }
                    }
                    None => break,
                },
                changed = sizes.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let size = *sizes.borrow_and_update();
                    if let Err(e) = shell.resize(size) {
                        warn!(terminal_id = %terminal_id, error = %e, "Shell resize failed");
                    }
                }
            }
        }
        debug!(terminal_id = %terminal_id, "Shell binding finished");
        drop(shell);
    }))
}
