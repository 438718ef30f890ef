//! Spawned process handles: output stream, input stream and exit status.
//!
//! A handle is produced either by a piped child (stdout and stderr merged
//! into one output stream) or by a child running inside a pseudoterminal.
//! Each logical step spawns its own handle; handles are never reused.

use portable_pty::{native_pty_system, ChildKiller, CommandBuilder, MasterPty, PtySize};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Notify};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DevError, DevResult};

const OUTPUT_CHANNEL_SIZE: usize = 256;
const READ_BUF_SIZE: usize = 4096;

/// Pseudoterminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

impl From<TerminalSize> for PtySize {
    fn from(size: TerminalSize) -> Self {
        PtySize {
            rows: size.rows,
            cols: size.cols,
            pixel_width: 0,
            pixel_height: 0,
        }
    }
}

/// Limits applied to piped children before exec.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    pub nofile: u64,
    /// Maximum file size in KB, `None` for unlimited.
    pub fsize_kb: Option<u64>,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            nofile: 4096,
            fsize_kb: None,
        }
    }
}

/// Everything needed to start one process.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: HashMap<String, String>,
    pub limits: ResourceLimits,
}

/// Terminates a process. Calling it more than once is harmless.
pub type KillSwitch = Arc<dyn Fn() + Send + Sync>;

type SharedMaster = Arc<Mutex<Box<dyn MasterPty + Send>>>;

/// Producer side of a process: chunks in the order the process wrote them.
#[derive(Debug)]
pub struct OutputStream {
    rx: mpsc::Receiver<Vec<u8>>,
}

impl OutputStream {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx }
    }

    /// Next chunk, or `None` once the process closed its output.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }
}

/// Writable consumer side of a process. Cheap to clone.
#[derive(Debug, Clone)]
pub struct ProcessInput {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ProcessInput {
    pub fn new(tx: mpsc::UnboundedSender<Vec<u8>>) -> Self {
        Self { tx }
    }

    pub fn write(&self, data: impl Into<Vec<u8>>) -> DevResult<()> {
        self.tx.send(data.into()).map_err(|_| DevError::ProcessClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct ProcessHandle {
    id: Uuid,
    command: String,
    output: Option<OutputStream>,
    input: ProcessInput,
    exit: Option<oneshot::Receiver<i32>>,
    exit_code: Option<i32>,
    kill: KillSwitch,
    master: Option<SharedMaster>,
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("id", &self.id)
            .field("command", &self.command)
            .field("exit_code", &self.exit_code)
            .field("pty", &self.master.is_some())
            .finish()
    }
}

impl ProcessHandle {
    /// Assemble a handle from its channels. Used by backends other than the
    /// local ones below.
    pub fn from_parts(
        command: impl Into<String>,
        output: mpsc::Receiver<Vec<u8>>,
        input: mpsc::UnboundedSender<Vec<u8>>,
        exit: oneshot::Receiver<i32>,
        kill: KillSwitch,
    ) -> Self {
        Self::assemble(Uuid::new_v4(), command.into(), output, input, exit, kill)
    }

    fn assemble(
        id: Uuid,
        command: String,
        output: mpsc::Receiver<Vec<u8>>,
        input: mpsc::UnboundedSender<Vec<u8>>,
        exit: oneshot::Receiver<i32>,
        kill: KillSwitch,
    ) -> Self {
        Self {
            id,
            command,
            output: Some(OutputStream::new(output)),
            input: ProcessInput::new(input),
            exit: Some(exit),
            exit_code: None,
            kill,
            master: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// The output stream can be taken exactly once.
    pub fn take_output(&mut self) -> Option<OutputStream> {
        self.output.take()
    }

    pub fn input(&self) -> ProcessInput {
        self.input.clone()
    }

    pub fn kill_switch(&self) -> KillSwitch {
        Arc::clone(&self.kill)
    }

    pub fn kill(&self) {
        (self.kill.as_ref())()
    }

    /// Resolve the exit status. A process killed by a signal reports
    /// `128 + signal`. Repeated calls return the same code, and the future
    /// can be dropped and retried (safe inside `select!`).
    pub async fn wait(&mut self) -> DevResult<i32> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let rx = self.exit.as_mut().ok_or(DevError::ProcessClosed)?;
        let code = rx.await.map_err(|_| DevError::ProcessClosed)?;
        self.exit = None;
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Resize the pseudoterminal; a no-op for piped processes.
    pub fn resize(&self, size: TerminalSize) -> DevResult<()> {
        if let Some(master) = &self.master {
            let master = master
                .lock()
                .map_err(|_| DevError::Sandbox("pty lock poisoned".into()))?;
            master
                .resize(size.into())
                .map_err(|e| DevError::Sandbox(format!("resize: {}", e)))?;
        }
        Ok(())
    }
}

/// Kill switches of the live processes of one sandbox session. Entries are
/// added at spawn and dropped by the exit watcher once the child is reaped.
#[derive(Clone, Default)]
pub struct ProcessRegistry {
    inner: Arc<Mutex<HashMap<Uuid, (String, KillSwitch)>>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: Uuid, command: &str, kill: KillSwitch) {
        if let Ok(mut map) = self.inner.lock() {
            map.insert(id, (command.to_string(), kill));
        }
    }

    fn remove(&self, id: Uuid) {
        if let Ok(mut map) = self.inner.lock() {
            map.remove(&id);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Terminate and forget every tracked process.
    pub fn kill_all(&self) {
        let drained: Vec<_> = match self.inner.lock() {
            Ok(mut map) => map.drain().collect(),
            Err(_) => return,
        };
        for (id, (command, kill)) in drained {
            info!(process_id = %id, command = %command, "Terminating process");
            (kill.as_ref())();
        }
    }
}

/// Spawn a child with piped stdio. Stdout and stderr feed the same stream.
/// The child stays in `registry` until it has been reaped.
pub fn spawn_piped(spec: &CommandSpec, registry: &ProcessRegistry) -> DevResult<ProcessHandle> {
    info!(program = %spec.program, args = ?spec.args, cwd = %spec.cwd.display(), "Spawning process");

    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    #[cfg(unix)]
    {
        let limits = spec.limits;
        // SAFETY: set_resource_limits only issues setpgid(2) and
        // setrlimit(2), both async-signal-safe.
        unsafe {
            cmd.pre_exec(move || set_resource_limits(&limits));
        }
    }

    let mut child = cmd.spawn().map_err(|e| DevError::Spawn {
        command: spec.program.clone(),
        message: e.to_string(),
    })?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdin = child.stdin.take();

    let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
    if let Some(stdout) = stdout {
        tokio::spawn(pump_async(stdout, out_tx.clone()));
    }
    if let Some(stderr) = stderr {
        tokio::spawn(pump_async(stderr, out_tx.clone()));
    }
    drop(out_tx);

    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    if let Some(mut stdin) = stdin {
        tokio::spawn(async move {
            while let Some(data) = in_rx.recv().await {
                if stdin.write_all(&data).await.is_err() || stdin.flush().await.is_err() {
                    break;
                }
            }
        });
    }

    let id = Uuid::new_v4();
    let kill_notify = Arc::new(Notify::new());
    let kill: KillSwitch = {
        let notify = Arc::clone(&kill_notify);
        Arc::new(move || notify.notify_one())
    };
    registry.register(id, &spec.program, Arc::clone(&kill));

    let (exit_tx, exit_rx) = oneshot::channel();
    let program = spec.program.clone();
    let notify = kill_notify;
    let reaped = registry.clone();
    tokio::spawn(async move {
        let status = tokio::select! {
            status = child.wait() => status,
            _ = notify.notified() => {
                // Dev servers fork (npm -> node); take the whole group down.
                if let Some(pid) = child.id() {
                    kill_process_group(pid);
                }
                let _ = child.start_kill();
                child.wait().await
            }
        };
        let code = match status {
            Ok(status) => exit_code_of(status),
            Err(e) => {
                warn!(program = %program, error = %e, "Waiting for process failed");
                -1
            }
        };
        debug!(program = %program, code, "Process exited");
        reaped.remove(id);
        let _ = exit_tx.send(code);
    });

    Ok(ProcessHandle::assemble(
        id,
        spec.program.clone(),
        out_rx,
        in_tx,
        exit_rx,
        kill,
    ))
}

/// Spawn a child attached to a fresh pseudoterminal of the given size.
/// The child stays in `registry` until it has been reaped.
pub fn spawn_pty(
    spec: &CommandSpec,
    size: TerminalSize,
    registry: &ProcessRegistry,
) -> DevResult<ProcessHandle> {
    info!(program = %spec.program, args = ?spec.args, cols = size.cols, rows = size.rows, "Spawning process in pty");

    let spawn_err = |e: &dyn std::fmt::Display| DevError::Spawn {
        command: spec.program.clone(),
        message: e.to_string(),
    };

    let pair = native_pty_system()
        .openpty(size.into())
        .map_err(|e| spawn_err(&e))?;

    let mut cmd = CommandBuilder::new(&spec.program);
    cmd.args(&spec.args);
    cmd.cwd(&spec.cwd);
    cmd.env("TERM", "xterm-256color");
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }

    let mut child = pair.slave.spawn_command(cmd).map_err(|e| spawn_err(&e))?;
    // The reader only sees EOF once every slave handle is gone.
    drop(pair.slave);

    let mut reader = pair.master.try_clone_reader().map_err(|e| spawn_err(&e))?;
    let mut writer = pair.master.take_writer().map_err(|e| spawn_err(&e))?;

    let (out_tx, out_rx) = mpsc::channel(OUTPUT_CHANNEL_SIZE);
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; READ_BUF_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if out_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    let (in_tx, mut in_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::task::spawn_blocking(move || {
        while let Some(data) = in_rx.blocking_recv() {
            if writer.write_all(&data).is_err() || writer.flush().is_err() {
                break;
            }
        }
    });

    let id = Uuid::new_v4();
    // Cleared once the child is reaped so its pid is never signalled again.
    let killer: Arc<Mutex<Option<Box<dyn ChildKiller + Send + Sync>>>> =
        Arc::new(Mutex::new(Some(child.clone_killer())));
    let kill: KillSwitch = {
        let killer = Arc::clone(&killer);
        Arc::new(move || {
            if let Ok(mut killer) = killer.lock() {
                if let Some(killer) = killer.as_mut() {
                    let _ = killer.kill();
                }
            }
        })
    };
    registry.register(id, &spec.program, Arc::clone(&kill));

    let (exit_tx, exit_rx) = oneshot::channel();
    let program = spec.program.clone();
    let reaped = registry.clone();
    tokio::task::spawn_blocking(move || {
        let code = match child.wait() {
            Ok(status) => status.exit_code() as i32,
            Err(e) => {
                warn!(program = %program, error = %e, "Waiting for pty process failed");
                -1
            }
        };
        if let Ok(mut killer) = killer.lock() {
            killer.take();
        }
        debug!(program = %program, code, "Pty process exited");
        reaped.remove(id);
        let _ = exit_tx.send(code);
    });

    let mut handle =
        ProcessHandle::assemble(id, spec.program.clone(), out_rx, in_tx, exit_rx, kill);
    handle.master = Some(Arc::new(Mutex::new(pair.master)));
    Ok(handle)
}

async fn pump_async<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
        }
    }
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(unix)]
fn set_resource_limits(limits: &ResourceLimits) -> std::io::Result<()> {
    use nix::sys::resource::{setrlimit, Resource};
    use nix::unistd::{setpgid, Pid};

    setpgid(Pid::from_raw(0), Pid::from_raw(0))?;
    setrlimit(Resource::RLIMIT_NOFILE, limits.nofile, limits.nofile)?;
    setrlimit(Resource::RLIMIT_CORE, 0, 0)?;
    if let Some(fsize_kb) = limits.fsize_kb {
        let bytes = fsize_kb * 1024;
        setrlimit(Resource::RLIMIT_FSIZE, bytes, bytes)?;
    }
    Ok(())
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as libc::pid_t), Signal::SIGKILL) {
        debug!(pid, error = %e, "killpg failed");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pid: u32) {}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: std::env::temp_dir(),
            env: HashMap::new(),
            limits: ResourceLimits::default(),
        }
    }

    fn spawn(script: &str) -> ProcessHandle {
        spawn_piped(&sh(script), &ProcessRegistry::new()).unwrap()
    }

    async fn collect(mut out: OutputStream) -> String {
        let mut buf = Vec::new();
        while let Some(chunk) = out.next().await {
            buf.extend(chunk);
        }
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[tokio::test]
    async fn piped_process_reports_output_and_exit_code() {
        let mut handle = spawn("echo out; echo err >&2; exit 3");
        let out = handle.take_output().unwrap();
        let text = collect(out).await;
        assert!(text.contains("out"));
        assert!(text.contains("err"));
        assert_eq!(handle.wait().await.unwrap(), 3);
        assert_eq!(handle.wait().await.unwrap(), 3);
        assert!(handle.take_output().is_none());
    }

    #[tokio::test]
    async fn piped_process_reads_input() {
        let mut handle = spawn("read line; echo got:$line");
        let out = handle.take_output().unwrap();
        handle.input().write("hello\n").unwrap();
        assert!(collect(out).await.contains("got:hello"));
        assert_eq!(handle.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn kill_terminates_with_signal_code() {
        let mut handle = spawn("sleep 30");
        handle.kill();
        handle.kill();
        let code = handle.wait().await.unwrap();
        assert_eq!(code, 128 + libc::SIGKILL);
    }

    #[tokio::test]
    async fn registry_kills_everything() {
        let registry = ProcessRegistry::new();
        let mut a = spawn_piped(&sh("sleep 30"), &registry).unwrap();
        let mut b = spawn_piped(&sh("sleep 30"), &registry).unwrap();
        assert_eq!(registry.len(), 2);
        registry.kill_all();
        assert!(registry.is_empty());
        assert_ne!(a.wait().await.unwrap(), 0);
        assert_ne!(b.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn pty_process_echoes() {
        let registry = ProcessRegistry::new();
        let mut handle =
            spawn_pty(&sh("echo from-pty"), TerminalSize::default(), &registry).unwrap();
        let out = handle.take_output().unwrap();
        assert!(collect(out).await.contains("from-pty"));
        assert_eq!(handle.wait().await.unwrap(), 0);
        assert!(registry.is_empty());
        // Killing a reaped child is a no-op.
        handle.kill();
    }

    #[tokio::test]
    async fn reaped_processes_leave_the_registry() {
        let registry = ProcessRegistry::new();
        let mut done = spawn_piped(&sh("exit 0"), &registry).unwrap();
        let mut live = spawn_piped(&sh("sleep 30"), &registry).unwrap();
        assert_eq!(done.wait().await.unwrap(), 0);
        assert_eq!(registry.len(), 1);

        live.kill();
        assert_ne!(live.wait().await.unwrap(), 0);
        assert!(registry.is_empty());
    }
}
