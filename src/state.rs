//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::protocol::TusServer;
use crate::store::UploadStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    tus: TusServer,
}

impl AppState {
    /// Create the state around an already constructed backend
    pub fn new(config: Config, store: Arc<dyn UploadStore>) -> Self {
        let tus = TusServer::new(store, config.tus.clone());
        Self {
            inner: Arc::new(AppStateInner { config, tus }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the protocol engine
    pub fn tus(&self) -> &TusServer {
        &self.inner.tus
    }
}
