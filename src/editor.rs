//! The editable source buffer and its mirror inside the sandbox.
//!
//! Edits are accepted immediately. A single sync task per session writes the
//! latest revision to the fixed path, so writes never reorder and the file
//! always converges on the last edit. Intermediate revisions may be skipped.

use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::sandbox::Sandbox;

#[derive(Debug, Clone, Default)]
struct Revision {
    number: u64,
    contents: String,
}

pub struct SourceBuffer {
    path: String,
    current: watch::Sender<Revision>,
    synced: watch::Sender<u64>,
    last_error: Arc<Mutex<Option<String>>>,
    sync_task: Mutex<Option<JoinHandle<()>>>,
}

impl SourceBuffer {
    pub fn new(path: impl Into<String>, initial: impl Into<String>) -> Self {
        let (current, _) = watch::channel(Revision {
            number: 0,
            contents: initial.into(),
        });
        let (synced, _) = watch::channel(0);
        Self {
            path: path.into(),
            current,
            synced,
            last_error: Arc::new(Mutex::new(None)),
            sync_task: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn contents(&self) -> String {
        self.current.borrow().contents.clone()
    }

    pub fn revision(&self) -> u64 {
        self.current.borrow().number
    }

    /// Replace the buffer and return the new revision number. Returns
    /// without waiting for the sandbox write.
    pub fn set(&self, contents: impl Into<String>) -> u64 {
        let contents = contents.into();
        let mut number = 0;
        self.current.send_modify(|rev| {
            rev.number += 1;
            rev.contents = contents;
            number = rev.number;
        });
        number
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().ok().and_then(|e| e.clone())
    }

    /// Resolve once `revision` (or a later one) has been written.
    pub async fn wait_synced(&self, revision: u64) {
        let mut rx = self.synced.subscribe();
        let _ = rx.wait_for(|&synced| synced >= revision).await;
    }

    /// Start mirroring into `sandbox`. Edits made before this call are
    /// flushed first. Only the first call starts a task.
    pub fn start_sync(&self, sandbox: Arc<dyn Sandbox>) {
        let Ok(mut slot) = self.sync_task.lock() else {
            return;
        };
        if slot.is_some() {
            return;
        }

        let mut rx = self.current.subscribe();
        let pending_edits = rx.borrow().number > 0;
        let synced = self.synced.clone();
        let last_error = Arc::clone(&self.last_error);
        let path = self.path.clone();

        *slot = Some(tokio::spawn(async move {
            let mut changed = pending_edits;
            loop {
                if !changed && rx.changed().await.is_err() {
                    break;
                }
                changed = false;
                let rev = rx.borrow_and_update().clone();
                match sandbox.write_file(&path, rev.contents.as_bytes()).await {
                    Ok(()) => {
                        debug!(path = %path, revision = rev.number, bytes = rev.contents.len(), "Source synced");
                        if let Ok(mut err) = last_error.lock() {
                            err.take();
                        }
                    }
                    Err(e) => {
                        error!(path = %path, revision = rev.number, error = %e, "Source sync failed");
                        if let Ok(mut err) = last_error.lock() {
                            *err = Some(e.to_string());
                        }
                    }
                }
                // Failed writes still settle the revision; there is no retry.
                synced.send_replace(rev.number);
            }
        }));
    }

    pub fn stop_sync(&self) {
        if let Ok(mut slot) = self.sync_task.lock() {
            if let Some(task) = slot.take() {
                task.abort();
            }
        }
    }
}

impl Drop for SourceBuffer {
    fn drop(&mut self) {
        self.stop_sync();
    }
}
