//! Shared application state for the HTTP layer.

use std::path::PathBuf;
use std::sync::Arc;

use crate::orchestrator::Orchestrator;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    /// Serve `index.html` from here instead of the built-in page.
    pub static_dir: Option<PathBuf>,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            static_dir: None,
        }
    }

    pub fn with_static_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.static_dir = dir;
        self
    }
}
