//! The url shown in the preview pane, paired with a reload generation.
//!
//! Consumers must treat `(url, generation)` as the reload key: a new
//! generation means "load again" even when the url string is unchanged.

use serde::Serialize;
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PreviewState {
    pub url: Option<String>,
    pub generation: u64,
}

impl PreviewState {
    /// The url with the generation appended as a cache-busting query.
    pub fn address(&self) -> Option<String> {
        let url = self.url.as_ref()?;
        let sep = if url.contains('?') { '&' } else { '?' };
        Some(format!("{}{}{}", url, sep, self.generation))
    }
}

/// Last-write-wins holder of the preview state.
#[derive(Debug, Clone)]
pub struct Preview {
    tx: watch::Sender<PreviewState>,
}

impl Default for Preview {
    fn default() -> Self {
        Self::new()
    }
}

impl Preview {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(PreviewState::default());
        Self { tx }
    }

    /// Record `url` and bump the generation, even if the url is unchanged.
    pub fn publish(&self, url: impl Into<String>) -> PreviewState {
        let url = url.into();
        let mut published = PreviewState::default();
        self.tx.send_modify(|state| {
            state.url = Some(url);
            state.generation += 1;
            published = state.clone();
        });
        published
    }

    pub fn current(&self) -> PreviewState {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PreviewState> {
        self.tx.subscribe()
    }
}
