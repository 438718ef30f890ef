//! devpreview - boot a project sandbox, install and start its dev server,
//! and serve an editor, live preview and terminal bound to the session.

pub mod config;
pub mod editor;
pub mod error;
pub mod files;
pub mod http_server;
pub mod orchestrator;
pub mod preview;
pub mod process;
pub mod ready;
pub mod relay;
pub mod sandbox;
pub mod state;
pub mod terminal;

pub use config::{CommandLine, Config};
pub use error::{DevError, DevResult};
pub use files::FileTree;
pub use orchestrator::{Orchestrator, SetupFailure, SetupStage, SetupState};
pub use sandbox::{LocalBooter, LocalSandbox, Sandbox, SandboxBooter, SandboxEvent};
