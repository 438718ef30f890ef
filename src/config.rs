//! Command-line arguments and the runtime configuration built from them.

use clap::{Args, Parser, Subcommand};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{DevError, DevResult};
use crate::files::FileTree;
use crate::process::ResourceLimits;
use crate::sandbox::SandboxConfig;

#[derive(Parser, Debug)]
#[command(name = "devpreview")]
#[command(about = "Run a project's dev server in a sandbox with a live preview, editor and terminal")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the HTTP server hosting the editor, preview and terminal
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Serve UI assets from this directory instead of the built-in page
        #[arg(long)]
        static_dir: Option<PathBuf>,

        #[command(flatten)]
        session: SessionArgs,
    },
    /// Run the setup sequence headless and keep the dev server up until Ctrl-C
    Run {
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    /// Project directory to mount (defaults to the built-in tutorial app)
    #[arg(long)]
    pub project: Option<PathBuf>,

    /// Directory under which sandbox roots are created
    #[arg(long)]
    pub sandbox_base: Option<PathBuf>,

    /// Ports watched for the dev server; the first is exported as PORT
    #[arg(long = "preview-port", default_value = "3111")]
    pub preview_ports: Vec<u16>,

    /// Host name used in preview urls
    #[arg(long, default_value = "localhost")]
    pub public_host: String,

    /// Dependency installation command
    #[arg(long, default_value = "npm install")]
    pub install_cmd: CommandLine,

    /// Dev server command
    #[arg(long, default_value = "npm run start")]
    pub start_cmd: CommandLine,

    /// Interactive shell bound to terminals (defaults to $SHELL, then /bin/sh)
    #[arg(long)]
    pub shell: Option<CommandLine>,

    /// Sandbox path mirrored from the editor
    #[arg(long, default_value = "/index.js")]
    pub edit_path: String,

    /// Maximum number of open files per process
    #[arg(long, default_value = "4096")]
    pub nofile: u64,

    /// Maximum file size in KB a process may write (unlimited when omitted)
    #[arg(long)]
    pub fsize: Option<u64>,
}

impl SessionArgs {
    pub fn into_config(self) -> Config {
        let defaults = Config::default();
        let mut sandbox = defaults.sandbox;
        if let Some(base) = self.sandbox_base {
            sandbox.base_dir = base;
        }
        sandbox.preview_ports = self.preview_ports;
        sandbox.public_host = self.public_host;
        sandbox.limits = ResourceLimits {
            nofile: self.nofile,
            fsize_kb: self.fsize,
        };

        Config {
            project: self.project,
            sandbox,
            install: self.install_cmd,
            start: self.start_cmd,
            shell: self.shell.unwrap_or(defaults.shell),
            edit_path: self.edit_path,
        }
    }
}

/// A program and its arguments, parsed from a whitespace-separated string.
/// Quoting is not supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }
}

impl FromStr for CommandLine {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or_else(|| "empty command".to_string())?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Everything a session needs: what to mount, how to run it, where to put it.
#[derive(Debug, Clone)]
pub struct Config {
    pub project: Option<PathBuf>,
    pub sandbox: SandboxConfig,
    pub install: CommandLine,
    pub start: CommandLine,
    pub shell: CommandLine,
    pub edit_path: String,
}

impl Default for Config {
    fn default() -> Self {
        let shell = std::env::var("SHELL")
            .ok()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "/bin/sh".to_string());
        Self {
            project: None,
            sandbox: SandboxConfig::default(),
            install: CommandLine::new("npm", &["install"]),
            start: CommandLine::new("npm", &["run", "start"]),
            shell: CommandLine::new(shell, &[]),
            edit_path: "/index.js".to_string(),
        }
    }
}

impl Config {
    /// The tree to mount: the project directory when given, else the
    /// built-in tutorial app.
    pub fn file_tree(&self) -> DevResult<FileTree> {
        match &self.project {
            Some(dir) => {
                let tree = FileTree::from_dir(dir)?;
                if tree.is_empty() {
                    return Err(DevError::SetupFailed(format!(
                        "project directory {} has no files to mount",
                        dir.display()
                    )));
                }
                Ok(tree)
            }
            None => Ok(FileTree::tutorial()),
        }
    }
}
