//! A scripted, in-memory sandbox for driving the orchestrator in tests.
//!
//! Commands are recognised by their first argument: `install` exits with the
//! scripted code, `run` emits the scripted ready urls (or exits early), and
//! anything spawned with a terminal echoes its input back as output.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use uuid::Uuid;

use devpreview::config::{CommandLine, Config};
use devpreview::files::FileTree;
use devpreview::process::{KillSwitch, ProcessHandle, TerminalSize};
use devpreview::sandbox::{Sandbox, SandboxBooter, SandboxEvent, SpawnOptions};
use devpreview::{DevError, DevResult, Orchestrator};

pub const PORT: u16 = 3111;

pub fn url(n: usize) -> String {
    format!("http://localhost:{}/r{}", PORT, n)
}

#[derive(Debug, Clone)]
pub struct Script {
    pub install_exit: i32,
    /// Urls announced once the start command runs.
    pub ready_urls: Vec<String>,
    /// Exit the start command with this code instead of serving.
    pub start_exit: Option<i32>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            install_exit: 0,
            ready_urls: vec![url(1)],
            start_exit: None,
        }
    }
}

pub struct FakeSandbox {
    id: Uuid,
    script: Script,
    files: Mutex<HashMap<String, Vec<u8>>>,
    events: broadcast::Sender<SandboxEvent>,
    ops: Mutex<Vec<String>>,
    terminal_sizes: Mutex<Vec<TerminalSize>>,
    shell_input: Arc<Mutex<Vec<u8>>>,
    kill_switches: Mutex<Vec<KillSwitch>>,
    kills: Arc<AtomicUsize>,
    torn_down: AtomicBool,
}

impl FakeSandbox {
    pub fn new(script: Script) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            id: Uuid::new_v4(),
            script,
            files: Mutex::new(HashMap::new()),
            events,
            ops: Mutex::new(Vec::new()),
            terminal_sizes: Mutex::new(Vec::new()),
            shell_input: Arc::new(Mutex::new(Vec::new())),
            kill_switches: Mutex::new(Vec::new()),
            kills: Arc::new(AtomicUsize::new(0)),
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn emit_ready(&self, url: impl Into<String>) {
        let _ = self.events.send(SandboxEvent::ServerReady {
            port: PORT,
            url: url.into(),
        });
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn spawned(&self, command: &str) -> usize {
        let needle = format!("spawn {}", command);
        self.ops().iter().filter(|op| **op == needle).count()
    }

    pub fn file(&self, path: &str) -> Option<String> {
        let files = self.files.lock().unwrap();
        files
            .get(path.trim_start_matches('/'))
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn shell_input(&self) -> String {
        String::from_utf8_lossy(&self.shell_input.lock().unwrap()).into_owned()
    }

    pub fn terminal_sizes(&self) -> Vec<TerminalSize> {
        self.terminal_sizes.lock().unwrap().clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }
}

struct Scripted {
    output: mpsc::Sender<Vec<u8>>,
    input: mpsc::UnboundedReceiver<Vec<u8>>,
    exit: Arc<Mutex<Option<oneshot::Sender<i32>>>>,
}

impl Scripted {
    fn exit(&self, code: i32) {
        if let Some(tx) = self.exit.lock().unwrap().take() {
            let _ = tx.send(code);
        }
    }
}

fn scripted_process(command: String, kills: Arc<AtomicUsize>) -> (ProcessHandle, Scripted) {
    let (out_tx, out_rx) = mpsc::channel(64);
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let exit = Arc::new(Mutex::new(Some(exit_tx)));

    let kill: KillSwitch = {
        let exit = Arc::clone(&exit);
        Arc::new(move || {
            if let Some(tx) = exit.lock().unwrap().take() {
                kills.fetch_add(1, Ordering::SeqCst);
                let _ = tx.send(137);
            }
        })
    };

    let handle = ProcessHandle::from_parts(command, out_rx, in_tx, exit_rx, kill);
    (
        handle,
        Scripted {
            output: out_tx,
            input: in_rx,
            exit,
        },
    )
}

#[async_trait]
impl Sandbox for FakeSandbox {
    fn id(&self) -> Uuid {
        self.id
    }

    async fn mount(&self, tree: &FileTree) -> DevResult<()> {
        self.record("mount".to_string());
        let mut files = self.files.lock().unwrap();
        for (path, contents) in tree.flatten() {
            files.insert(path, contents.as_bytes().to_vec());
        }
        Ok(())
    }

    async fn spawn(
        &self,
        command: &str,
        args: &[String],
        options: SpawnOptions,
    ) -> DevResult<ProcessHandle> {
        let line = CommandLine {
            program: command.to_string(),
            args: args.to_vec(),
        }
        .to_string();
        self.record(format!("spawn {}", line));

        let (handle, mut process) = scripted_process(line, Arc::clone(&self.kills));
        self.kill_switches.lock().unwrap().push(handle.kill_switch());

        if let Some(size) = options.terminal {
            self.terminal_sizes.lock().unwrap().push(size);
            let recorded = Arc::clone(&self.shell_input);
            tokio::spawn(async move {
                while let Some(data) = process.input.recv().await {
                    recorded.lock().unwrap().extend_from_slice(&data);
                    if process.output.send(data).await.is_err() {
                        break;
                    }
                }
                process.exit(0);
            });
            return Ok(handle);
        }

        match args.first().map(String::as_str) {
            Some("install") => {
                let code = self.script.install_exit;
                tokio::spawn(async move {
                    let _ = process.output.send(b"added 57 packages\n".to_vec()).await;
                    process.exit(code);
                });
            }
            Some("run") => {
                let script = self.script.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let _ = process.output.send(b"> node index.js\n".to_vec()).await;
                    if let Some(code) = script.start_exit {
                        process.exit(code);
                        return;
                    }
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    for url in script.ready_urls {
                        let _ = events.send(SandboxEvent::ServerReady { port: PORT, url });
                    }
                    // Serve until the handle is dropped.
                    while process.input.recv().await.is_some() {}
                    process.exit(0);
                });
            }
            _ => {
                tokio::spawn(async move { process.exit(0) });
            }
        }
        Ok(handle)
    }

    async fn write_file(&self, path: &str, contents: &[u8]) -> DevResult<()> {
        self.record(format!("write {}", path));
        self.files
            .lock()
            .unwrap()
            .insert(path.trim_start_matches('/').to_string(), contents.to_vec());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> DevResult<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path.trim_start_matches('/'))
            .cloned()
            .ok_or_else(|| DevError::Io(io::Error::from(io::ErrorKind::NotFound)))
    }

    fn events(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    async fn teardown(&self) {
        let switches: Vec<KillSwitch> = self.kill_switches.lock().unwrap().drain(..).collect();
        for kill in switches {
            (kill.as_ref())();
        }
        self.torn_down.store(true, Ordering::SeqCst);
    }
}

/// Hands out the same [`FakeSandbox`] and counts how often it was asked to.
pub struct FakeBooter {
    pub sandbox: Arc<FakeSandbox>,
    boots: AtomicUsize,
}

impl FakeBooter {
    pub fn new(sandbox: Arc<FakeSandbox>) -> Arc<Self> {
        Arc::new(Self {
            sandbox,
            boots: AtomicUsize::new(0),
        })
    }

    pub fn boots(&self) -> usize {
        self.boots.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SandboxBooter for FakeBooter {
    async fn boot(&self) -> DevResult<Arc<dyn Sandbox>> {
        self.boots.fetch_add(1, Ordering::SeqCst);
        // Give concurrent loads a chance to pile up on the boot guard.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let sandbox: Arc<dyn Sandbox> = self.sandbox.clone();
        Ok(sandbox)
    }
}

pub fn test_config() -> Config {
    Config {
        install: CommandLine::new("npm", &["install"]),
        start: CommandLine::new("npm", &["run", "start"]),
        shell: CommandLine::new("sh", &[]),
        ..Config::default()
    }
}

pub fn orchestrator(script: Script) -> (Arc<Orchestrator>, Arc<FakeBooter>) {
    let booter = FakeBooter::new(FakeSandbox::new(script));
    let orchestrator = Orchestrator::with_tree(test_config(), FileTree::tutorial(), booter.clone());
    (Arc::new(orchestrator), booter)
}

/// Poll `check` until it holds, failing the test after a few seconds.
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
