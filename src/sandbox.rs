//! Sandbox capability: boot, mount, spawn, filesystem and ready events.
//!
//! [`LocalSandbox`] is the host backend. Each session gets its own root
//! directory; the mounted project lives there, every process runs with it as
//! working directory, and a port watcher turns listening sockets into
//! [`SandboxEvent::ServerReady`] notifications.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DevError, DevResult};
use crate::files::FileTree;
use crate::process::{
    spawn_piped, spawn_pty, CommandSpec, ProcessHandle, ProcessRegistry, ResourceLimits,
    TerminalSize,
};

const EVENT_CHANNEL_SIZE: usize = 64;
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Notifications emitted by a sandbox session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SandboxEvent {
    /// A process bound a listening socket on `port`, reachable at `url`.
    ServerReady { port: u16, url: String },
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    /// Run inside a pseudoterminal of this size.
    pub terminal: Option<TerminalSize>,
    pub env: HashMap<String, String>,
}

impl SpawnOptions {
    pub fn with_terminal(size: TerminalSize) -> Self {
        Self {
            terminal: Some(size),
            ..Self::default()
        }
    }
}

/// A booted sandbox session.
#[async_trait]
pub trait Sandbox: Send + Sync + 'static {
    fn id(&self) -> Uuid;
    async fn mount(&self, tree: &FileTree) -> DevResult<()>;
    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> DevResult<ProcessHandle>;
    async fn write_file(&self, path: &str, contents: &[u8]) -> DevResult<()>;
    async fn read_file(&self, path: &str) -> DevResult<Vec<u8>>;
    /// A fresh receiver for events emitted from now on.
    fn events(&self) -> broadcast::Receiver<SandboxEvent>;
    /// Terminate every spawned process and release the session.
    async fn teardown(&self);
}

/// Creates sandbox sessions.
#[async_trait]
pub trait SandboxBooter: Send + Sync + 'static {
    async fn boot(&self) -> DevResult<Arc<dyn Sandbox>>;
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Directory under which session roots are created.
    pub base_dir: PathBuf,
    /// Ports watched for listening servers. The first one is exported as `PORT`.
    pub preview_ports: Vec<u16>,
    /// Host name used when building ready urls.
    pub public_host: String,
    pub poll_interval: Duration,
    pub limits: ResourceLimits,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_dir: std::env::temp_dir(),
            preview_ports: vec![3111],
            public_host: "localhost".to_string(),
            poll_interval: Duration::from_millis(250),
            limits: ResourceLimits::default(),
        }
    }
}

/// Boots [`LocalSandbox`] sessions.
#[derive(Debug, Clone, Default)]
pub struct LocalBooter {
    config: SandboxConfig,
}

impl LocalBooter {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SandboxBooter for LocalBooter {
    async fn boot(&self) -> DevResult<Arc<dyn Sandbox>> {
        let sandbox = LocalSandbox::boot(self.config.clone()).await?;
        Ok(Arc::new(sandbox))
    }
}

pub struct LocalSandbox {
    id: Uuid,
    root: PathBuf,
    config: SandboxConfig,
    events: broadcast::Sender<SandboxEvent>,
    processes: ProcessRegistry,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl LocalSandbox {
    pub async fn boot(config: SandboxConfig) -> DevResult<Self> {
        let id = Uuid::new_v4();
        let root = config.base_dir.join(format!("devpreview-{}", id));

        tokio::task::spawn_blocking({
            let root = root.clone();
            move || setup_sandbox_dir(&root)
        })
        .await
        .map_err(|e| DevError::Sandbox(e.to_string()))??;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        let watcher = tokio::spawn(watch_ports(
            config.preview_ports.clone(),
            config.public_host.clone(),
            config.poll_interval,
            events.clone(),
        ));

        info!(sandbox_id = %id, root = %root.display(), ports = ?config.preview_ports, "Sandbox booted");

        Ok(Self {
            id,
            root,
            config,
            events,
            processes: ProcessRegistry::new(),
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn process_count(&self) -> usize {
        self.processes.len()
    }

    #[cfg(test)]
    pub(crate) fn event_sender(&self) -> broadcast::Sender<SandboxEvent> {
        self.events.clone()
    }

    fn command_spec(&self, command: &str, args: &[String], extra: HashMap<String, String>) -> CommandSpec {
        let mut env = HashMap::new();
        if let Some(port) = self.config.preview_ports.first() {
            env.insert("PORT".to_string(), port.to_string());
        }
        env.insert(
            "HOME".to_string(),
            self.root.join("home").to_string_lossy().into_owned(),
        );
        env.extend(extra);

        CommandSpec {
            program: command.to_string(),
            args: args.to_vec(),
            cwd: self.root.clone(),
            env,
            limits: self.config.limits,
        }
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn mount(&self, tree: &FileTree) -> DevResult<()> {
        let root = self.root.clone();
        let files: Vec<(String, String)> = tree
            .flatten()
            .into_iter()
            .map(|(path, contents)| (path, contents.to_string()))
            .collect();
        let count = files.len();

        tokio::task::spawn_blocking(move || {
            for (path, contents) in files {
                write_file_in_sandbox(&root, &path, contents.as_bytes())?;
            }
            Ok::<_, DevError>(())
        })
        .await
        .map_err(|e| DevError::Sandbox(e.to_string()))??;

        info!(sandbox_id = %self.id, files = count, "Mounted project tree");
        Ok(())
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> DevResult<ProcessHandle> {
        let spec = self.command_spec(command, args, options.env);
        match options.terminal {
            Some(size) => spawn_pty(&spec, size, &self.processes),
            None => spawn_piped(&spec, &self.processes),
        }
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> DevResult<()> {
        let root = self.root.clone();
        let path = path.to_string();
        let contents = contents.to_vec();
        tokio::task::spawn_blocking(move || write_file_in_sandbox(&root, &path, &contents))
            .await
            .map_err(|e| DevError::Sandbox(e.to_string()))?
    }

    async fn read_file(&self, path: &str) -> DevResult<Vec<u8>> {
        let full_path = resolve_in_sandbox(&self.root, path)?;
        Ok(tokio::fs::read(full_path).await?)
    }

    fn events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    async fn teardown(&self) {
        self.processes.kill_all();
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(task) = watcher.take() {
                task.abort();
            }
        }
        let root = self.root.clone();
        let _ = tokio::task::spawn_blocking(move || cleanup_sandbox(&root)).await;
        info!(sandbox_id = %self.id, "Sandbox torn down");
    }
}

impl Drop for LocalSandbox {
    fn drop(&mut self) {
        if let Ok(mut watcher) = self.watcher.lock() {
            if let Some(task) = watcher.take() {
                task.abort();
            }
        }
    }
}

/// Map a sandbox path (absolute or relative) onto the session root.
/// Anything that would escape the root is rejected.
pub fn resolve_in_sandbox(sandbox_root: &Path, path: &str) -> DevResult<PathBuf> {
    let relative = Path::new(path.trim_start_matches('/'));
    let valid = relative.components().count() > 0
        && relative
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !valid {
        return Err(DevError::InvalidPath(path.to_string()));
    }
    Ok(sandbox_root.join(relative))
}

/// Write a file into the sandbox, creating parent directories.
pub fn write_file_in_sandbox(sandbox_root: &Path, path: &str, content: &[u8]) -> DevResult<()> {
    let full_path = resolve_in_sandbox(sandbox_root, path)?;
    if let Some(parent) = full_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&full_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&full_path, fs::Permissions::from_mode(0o644))?;
    }
    Ok(())
}

fn setup_sandbox_dir(sandbox_root: &Path) -> DevResult<()> {
    if sandbox_root.exists() {
        cleanup_sandbox(sandbox_root);
    }
    fs::create_dir_all(sandbox_root.join("home"))?;
    fs::create_dir_all(sandbox_root.join("tmp"))?;
    Ok(())
}

fn cleanup_sandbox(sandbox_root: &Path) {
    if let Err(e) = fs::remove_dir_all(sandbox_root) {
        debug!(root = %sandbox_root.display(), error = %e, "Sandbox root cleanup failed");
    }
}

async fn port_is_open(port: u16) -> bool {
    matches!(
        timeout(CONNECT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// Emit `ServerReady` on every closed -> open transition of a watched port.
async fn watch_ports(
    ports: Vec<u16>,
    public_host: String,
    poll: Duration,
    events: broadcast::Sender<SandboxEvent>,
) {
    let mut open: HashSet<u16> = HashSet::new();
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut first_poll = true;

    loop {
        ticker.tick().await;
        for &port in &ports {
            let up = port_is_open(port).await;
            match (up, open.contains(&port)) {
                (true, false) => {
                    if first_poll {
                        warn!(port, "Port already in use before any server was started");
                    }
                    open.insert(port);
                    let url = format!("http://{}:{}", public_host, port);
                    info!(port, url = %url, "Server ready");
                    let _ = events.send(SandboxEvent::ServerReady { port, url });
                }
                (false, true) => {
                    open.remove(&port);
                    debug!(port, "Server stopped listening");
                }
                _ => {}
            }
        }
        first_poll = false;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn config_in(dir: &Path, ports: Vec<u16>) -> SandboxConfig {
        SandboxConfig {
            base_dir: dir.to_path_buf(),
            preview_ports: ports,
            poll_interval: Duration::from_millis(20),
            ..SandboxConfig::default()
        }
    }

    #[test]
    fn rejects_paths_outside_root() {
        let root = Path::new("/sandbox");
        assert_eq!(
            resolve_in_sandbox(root, "/index.js").unwrap(),
            PathBuf::from("/sandbox/index.js")
        );
        assert_eq!(
            resolve_in_sandbox(root, "src/a.js").unwrap(),
            PathBuf::from("/sandbox/src/a.js")
        );
        assert!(resolve_in_sandbox(root, "../etc/passwd").is_err());
        assert!(resolve_in_sandbox(root, "/src/../../x").is_err());
        assert!(resolve_in_sandbox(root, "/").is_err());
    }

    #[tokio::test]
    async fn mount_write_and_read() {
        let base = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::boot(config_in(base.path(), vec![])).await.unwrap();
        sandbox.mount(&FileTree::tutorial()).await.unwrap();

        let index = sandbox.read_file("/index.js").await.unwrap();
        assert!(String::from_utf8(index).unwrap().contains("express"));

        sandbox.write_file("/index.js", b"changed").await.unwrap();
        assert_eq!(sandbox.read_file("index.js").await.unwrap(), b"changed");

        let root = sandbox.root().to_path_buf();
        sandbox.teardown().await;
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn spawned_processes_run_in_root_and_see_port() {
        let base = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::boot(config_in(base.path(), vec![4567])).await.unwrap();
        sandbox.write_file("marker.txt", b"here").await.unwrap();

        let args = vec!["-c".to_string(), "cat marker.txt; echo :$PORT".to_string()];
        let mut handle = sandbox
            .spawn("/bin/sh", &args, SpawnOptions::default())
            .await
            .unwrap();
        let mut out = handle.take_output().unwrap();
        let mut text = Vec::new();
        while let Some(chunk) = out.next().await {
            text.extend(chunk);
        }
        assert_eq!(String::from_utf8_lossy(&text).trim(), "here:4567");
        assert_eq!(handle.wait().await.unwrap(), 0);
        sandbox.teardown().await;
    }

    #[tokio::test]
    async fn teardown_kills_spawned_processes() {
        let base = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::boot(config_in(base.path(), vec![])).await.unwrap();
        let args = vec!["-c".to_string(), "sleep 30".to_string()];
        let mut handle = sandbox
            .spawn("/bin/sh", &args, SpawnOptions::default())
            .await
            .unwrap();
        assert_eq!(sandbox.process_count(), 1);
        sandbox.teardown().await;
        assert_ne!(handle.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn exited_processes_are_forgotten() {
        let base = tempfile::tempdir().unwrap();
        let sandbox = LocalSandbox::boot(config_in(base.path(), vec![])).await.unwrap();
        let args = vec!["-c".to_string(), "exit 0".to_string()];
        for options in [
            SpawnOptions::default(),
            SpawnOptions::with_terminal(TerminalSize::default()),
        ] {
            let mut handle = sandbox.spawn("/bin/sh", &args, options).await.unwrap();
            assert_eq!(handle.wait().await.unwrap(), 0);
        }
        assert_eq!(sandbox.process_count(), 0);
        sandbox.teardown().await;
    }

    #[tokio::test]
    async fn listening_socket_emits_ready_again_after_restart() {
        let base = tempfile::tempdir().unwrap();
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let sandbox = LocalSandbox::boot(config_in(base.path(), vec![port])).await.unwrap();
        let mut events = sandbox.events();

        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let event = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            event,
            SandboxEvent::ServerReady {
                port,
                url: format!("http://localhost:{}", port)
            }
        );

        drop(listener);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let _listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let again = timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(again, SandboxEvent::ServerReady { port: p, .. } if p == port));
        sandbox.teardown().await;
    }
}
