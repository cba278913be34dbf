//! Shared application state for the `cellar` server.

use std::sync::Arc;

use cellar_core::core::Core;

/// Shared application state passed to all HTTP handlers.
pub struct AppState {
    /// The core every route calls into.
    pub core: Arc<Core>,
}

impl AppState {
    /// Wrap a core for use as router state.
    #[must_use]
    pub fn new(core: Arc<Core>) -> Arc<Self> {
        Arc::new(Self { core })
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}
