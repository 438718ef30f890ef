//! Bridges the sandbox's recurring `ServerReady` event into a one-time
//! awaitable and a long-lived preview subscription.
//!
//! Each form owns its own receiver. Both must be created before the server
//! process is spawned, otherwise the first notification can be missed.

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{DevError, DevResult};
use crate::preview::Preview;
use crate::sandbox::{Sandbox, SandboxEvent};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReadyNotification {
    pub port: u16,
    pub url: String,
}

async fn next_ready(rx: &mut broadcast::Receiver<SandboxEvent>) -> DevResult<ReadyNotification> {
    loop {
        match rx.recv().await {
            Ok(SandboxEvent::ServerReady { port, url }) => {
                return Ok(ReadyNotification { port, url })
            }
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Ready listener lagged behind sandbox events");
            }
            Err(RecvError::Closed) => return Err(DevError::ReadyChannelClosed),
        }
    }
}

/// Resolves exactly once, with the first notification emitted after it was
/// created. Consumed by [`ReadyOnce::wait`].
pub struct ReadyOnce {
    rx: broadcast::Receiver<SandboxEvent>,
}

impl ReadyOnce {
    pub fn new(sandbox: &dyn Sandbox) -> Self {
        Self {
            rx: sandbox.events(),
        }
    }

    pub async fn wait(mut self) -> DevResult<ReadyNotification> {
        next_ready(&mut self.rx).await
    }
}

/// Publishes every notification to the preview for as long as it lives.
/// Dropping it ends the subscription.
pub struct ReadySubscription {
    task: JoinHandle<()>,
}

impl ReadySubscription {
    pub fn spawn(sandbox: &dyn Sandbox, preview: Preview) -> Self {
        let mut rx = sandbox.events();
        let task = tokio::spawn(async move {
            while let Ok(ready) = next_ready(&mut rx).await {
                let state = preview.publish(ready.url);
                debug!(port = ready.port, generation = state.generation, "Preview refreshed");
            }
        });
        Self { task }
    }
}

impl Drop for ReadySubscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
