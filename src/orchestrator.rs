//! The session orchestrator: boots the sandbox once, runs the sequential
//! setup (mount, install, start, first ready), and keeps the preview, the
//! editable buffer and any terminals in step with the session.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::{CommandLine, Config};
use crate::editor::SourceBuffer;
use crate::error::{DevError, DevResult};
use crate::files::FileTree;
use crate::preview::Preview;
use crate::process::ProcessHandle;
use crate::ready::{ReadyNotification, ReadyOnce, ReadySubscription};
use crate::relay::{relay_output, run_to_exit, LogSink};
use crate::sandbox::{Sandbox, SandboxBooter, SpawnOptions};
use crate::terminal::{bind_shell, TerminalWidget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SetupStage {
    Boot,
    Mount,
    Install,
    StartServer,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SetupFailure {
    pub stage: SetupStage,
    pub message: String,
    /// Exit code of the failing process, when there is one.
    pub exit_code: Option<i32>,
}

impl From<SetupFailure> for DevError {
    fn from(failure: SetupFailure) -> Self {
        match (failure.stage, failure.exit_code) {
            (SetupStage::Install, Some(code)) => DevError::InstallFailed { code },
            _ => DevError::SetupFailed(failure.message),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SetupState {
    Unbooted,
    Booting,
    Booted,
    Mounting,
    Mounted,
    Installing,
    StartingServer,
    Serving { port: u16, url: String },
    Failed(SetupFailure),
}

#[derive(Default)]
struct TerminalSlots {
    pending: Vec<Arc<TerminalWidget>>,
    bound: HashSet<Uuid>,
    bindings: Vec<JoinHandle<()>>,
}

pub struct Orchestrator {
    config: Config,
    tree: FileTree,
    booter: Arc<dyn SandboxBooter>,
    session: OnceLock<Arc<dyn Sandbox>>,
    started: AtomicBool,
    outcome: watch::Sender<Option<Result<ReadyNotification, SetupFailure>>>,
    state: watch::Sender<SetupState>,
    preview: Preview,
    source: SourceBuffer,
    ready_subscription: Mutex<Option<ReadySubscription>>,
    server: Mutex<Option<ProcessHandle>>,
    terminals: Mutex<TerminalSlots>,
}

impl Orchestrator {
    pub fn new(config: Config, booter: Arc<dyn SandboxBooter>) -> DevResult<Self> {
        let tree = config.file_tree()?;
        Ok(Self::with_tree(config, tree, booter))
    }

    pub fn with_tree(config: Config, tree: FileTree, booter: Arc<dyn SandboxBooter>) -> Self {
        let initial = tree.file(&config.edit_path).unwrap_or_default().to_string();
        let source = SourceBuffer::new(config.edit_path.clone(), initial);
        let (state, _) = watch::channel(SetupState::Unbooted);
        let (outcome, _) = watch::channel(None);
        Self {
            config,
            tree,
            booter,
            session: OnceLock::new(),
            started: AtomicBool::new(false),
            outcome,
            state,
            preview: Preview::new(),
            source,
            ready_subscription: Mutex::new(None),
            server: Mutex::new(None),
            terminals: Mutex::new(TerminalSlots::default()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> SetupState {
        self.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<SetupState> {
        self.state.subscribe()
    }

    pub fn preview(&self) -> &Preview {
        &self.preview
    }

    pub fn source(&self) -> &SourceBuffer {
        &self.source
    }

    pub fn session(&self) -> Option<Arc<dyn Sandbox>> {
        self.session.get().cloned()
    }

    /// The application load trigger. The first call starts the setup
    /// sequence on its own task; every call, this one included, waits for
    /// that single outcome. Dropping a `load` future does not cancel setup.
    pub async fn load(self: &Arc<Self>) -> DevResult<ReadyNotification> {
        if !self.started.swap(true, Ordering::SeqCst) {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                let outcome = this.setup().await;
                this.outcome.send_replace(Some(outcome));
            });
        }

        let mut outcome = self.outcome.subscribe();
        let settled = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| DevError::SetupFailed("setup outcome dropped".into()))?
            .clone();
        settled
            .ok_or_else(|| DevError::SetupFailed("setup outcome missing".into()))?
            .map_err(DevError::from)
    }

    async fn setup(&self) -> Result<ReadyNotification, SetupFailure> {
        self.set_state(SetupState::Booting);
        let sandbox = self
            .booter
            .boot()
            .await
            .map_err(|e| self.fail(SetupStage::Boot, e.to_string(), None))?;
        self.adopt_session(Arc::clone(&sandbox));
        self.set_state(SetupState::Booted);

        self.set_state(SetupState::Mounting);
        sandbox
            .mount(&self.tree)
            .await
            .map_err(|e| self.fail(SetupStage::Mount, e.to_string(), None))?;
        // Mirror edits only once the mounted copy can no longer overwrite them.
        self.source.start_sync(Arc::clone(&sandbox));
        self.set_state(SetupState::Mounted);

        self.set_state(SetupState::Installing);
        let code = self
            .run_install(sandbox.as_ref())
            .await
            .map_err(|e| self.fail(SetupStage::Install, e.to_string(), None))?;
        if code != 0 {
            let err = DevError::InstallFailed { code };
            return Err(self.fail(SetupStage::Install, err.to_string(), Some(code)));
        }

        self.set_state(SetupState::StartingServer);
        let ready = self.start_server(sandbox.as_ref()).await?;

        info!(port = ready.port, url = %ready.url, "Dev server ready");
        self.set_state(SetupState::Serving {
            port: ready.port,
            url: ready.url.clone(),
        });
        Ok(ready)
    }

    /// Make the session visible to every concern that was waiting for it.
    fn adopt_session(&self, sandbox: Arc<dyn Sandbox>) {
        let pending = {
            let mut slots = match self.terminals.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            if self.session.set(Arc::clone(&sandbox)).is_err() {
                warn!("Session already adopted");
                return;
            }
            std::mem::take(&mut slots.pending)
        };

        if let Ok(mut sub) = self.ready_subscription.lock() {
            *sub = Some(ReadySubscription::spawn(sandbox.as_ref(), self.preview.clone()));
        }
        for terminal in pending {
            self.bind_terminal(Arc::clone(&sandbox), terminal);
        }
    }

    async fn run_install(&self, sandbox: &dyn Sandbox) -> DevResult<i32> {
        let install = &self.config.install;
        let mut handle = spawn_command(sandbox, install).await?;
        let code = run_to_exit(&mut handle, LogSink::new(install.program.clone())).await?;
        info!(command = %install, code, "Install finished");
        Ok(code)
    }

    async fn start_server(&self, sandbox: &dyn Sandbox) -> Result<ReadyNotification, SetupFailure> {
        let start = &self.config.start;
        let generation = self.preview.current().generation;
        // Listen before spawning so the first notification cannot slip past.
        let once = ReadyOnce::new(sandbox);

        let mut server = spawn_command(sandbox, start)
            .await
            .map_err(|e| self.fail(SetupStage::StartServer, e.to_string(), None))?;
        if let Some(output) = server.take_output() {
            relay_output(output, LogSink::new(start.program.clone()));
        }

        let ready = tokio::select! {
            ready = once.wait() => ready
                .map_err(|e| self.fail(SetupStage::StartServer, e.to_string(), None))?,
            code = server.wait() => {
                let code = code.unwrap_or(-1);
                let message = format!("dev server exited with code {} before it was ready", code);
                return Err(self.fail(SetupStage::StartServer, message, Some(code)));
            }
        };

        if let Ok(mut slot) = self.server.lock() {
            *slot = Some(server);
        }

        // The subscription publishes every notification, this one included.
        let mut preview = self.preview.subscribe();
        let _ = preview.wait_for(|s| s.generation > generation).await;
        Ok(ready)
    }

    /// Hand a terminal to the orchestrator. A shell is bound to it exactly
    /// once, as soon as both the terminal and the session exist.
    pub fn attach_terminal(&self, terminal: Arc<TerminalWidget>) {
        if terminal.is_disposed() {
            return;
        }
        let sandbox = {
            let mut slots = match self.terminals.lock() {
                Ok(slots) => slots,
                Err(poisoned) => poisoned.into_inner(),
            };
            if slots.bound.contains(&terminal.id())
                || slots.pending.iter().any(|t| t.id() == terminal.id())
            {
                return;
            }
            match self.session.get() {
                Some(sandbox) => Arc::clone(sandbox),
                None => {
                    info!(terminal_id = %terminal.id(), "Terminal waiting for session");
                    slots.pending.push(terminal);
                    return;
                }
            }
        };
        self.bind_terminal(sandbox, terminal);
    }

    /// Forget a terminal that went away before it was bound.
    pub fn detach_terminal(&self, id: Uuid) {
        if let Ok(mut slots) = self.terminals.lock() {
            slots.pending.retain(|t| t.id() != id);
        }
    }

    fn bind_terminal(&self, sandbox: Arc<dyn Sandbox>, terminal: Arc<TerminalWidget>) {
        let mut slots = match self.terminals.lock() {
            Ok(slots) => slots,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !slots.bound.insert(terminal.id()) {
            return;
        }
        let shell: CommandLine = self.config.shell.clone();
        slots.bindings.push(tokio::spawn(async move {
            let id = terminal.id();
            match bind_shell(sandbox.as_ref(), terminal, &shell.program, &shell.args).await {
                Ok(binding) => {
                    let _ = binding.await;
                }
                Err(e) => error!(terminal_id = %id, error = %e, "Failed to start shell"),
            }
        }));
    }

    /// Tear the session down: stop the subscriptions, dispose terminals and
    /// terminate every process spawned in the session.
    pub async fn shutdown(&self) {
        if let Ok(mut sub) = self.ready_subscription.lock() {
            sub.take();
        }
        self.source.stop_sync();

        let bindings = match self.terminals.lock() {
            Ok(mut slots) => {
                for terminal in slots.pending.drain(..) {
                    terminal.dispose();
                }
                std::mem::take(&mut slots.bindings)
            }
            Err(_) => Vec::new(),
        };
        for binding in bindings {
            binding.abort();
        }

        if let Ok(mut server) = self.server.lock() {
            server.take();
        }
        if let Some(sandbox) = self.session.get() {
            sandbox.teardown().await;
        }
        info!("Session shut down");
    }

    fn set_state(&self, state: SetupState) {
        info!(state = ?state, "Setup state");
        self.state.send_replace(state);
    }

    fn fail(&self, stage: SetupStage, message: String, exit_code: Option<i32>) -> SetupFailure {
        error!(stage = ?stage, error = %message, "Setup failed");
        let failure = SetupFailure {
            stage,
            message,
            exit_code,
        };
        self.state.send_replace(SetupState::Failed(failure.clone()));
        failure
    }
}

async fn spawn_command(sandbox: &dyn Sandbox, command: &CommandLine) -> DevResult<ProcessHandle> {
    sandbox
        .spawn(&command.program, &command.args, SpawnOptions::default())
        .await
}
