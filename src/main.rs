//! devpreview - sandboxed dev server with live preview, editor and terminal.
//!
//! Usage:
//!   devpreview serve [--port 8080] [--project DIR]   # UI over HTTP
//!   devpreview run [--project DIR]                   # headless setup

use clap::Parser;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use devpreview::config::{Cli, Commands};
use devpreview::http_server;
use devpreview::state::AppState;
use devpreview::{LocalBooter, Orchestrator};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let (session, http) = match cli.command {
        Commands::Serve {
            port,
            static_dir,
            session,
        } => (session, Some((port, static_dir))),
        Commands::Run { session } => (session, None),
    };

    let config = session.into_config();
    let booter = Arc::new(LocalBooter::new(config.sandbox.clone()));
    let orchestrator = match Orchestrator::new(config, booter) {
        Ok(o) => Arc::new(o),
        Err(e) => {
            eprintln!("Error: {}", e);
            exit(1);
        }
    };

    let setup = tokio::spawn({
        let orchestrator = Arc::clone(&orchestrator);
        async move {
            match orchestrator.load().await {
                Ok(ready) => info!("Preview available at {}", ready.url),
                Err(e) => error!("Setup aborted: {}", e),
            }
        }
    });

    let code = match http {
        Some((port, static_dir)) => {
            let state = AppState::new(Arc::clone(&orchestrator)).with_static_dir(static_dir);
            match http_server::run_server(port, state, shutdown_signal()).await {
                Ok(()) => 0,
                Err(e) => {
                    error!("HTTP server failed: {}", e);
                    1
                }
            }
        }
        None => {
            let _ = setup.await;
            if matches!(orchestrator.state(), devpreview::SetupState::Failed(_)) {
                1
            } else {
                shutdown_signal().await;
                0
            }
        }
    };

    orchestrator.shutdown().await;
    exit(code);
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl-C: {}", e);
    }
    info!("Shutting down");
}
