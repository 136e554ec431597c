//! Shared application state passed to every HTTP handler.

use crate::clock::Clock;
use crate::config::Config;
use crate::scheduler::Scheduler;
use crate::store::TaskStore;
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Shared application state (grouped by concern, following the gateway's
/// `AppState` convention):
/// - **Core services** — config, clock
/// - **Domain** — task store, scheduler
/// - **Security** — cached API token digest (`None` means dev mode, no auth)
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub clock: Arc<dyn Clock>,

    pub store: Arc<TaskStore>,
    pub scheduler: Arc<Scheduler>,

    /// SHA-256 digest of the configured bearer token, cached once at startup
    /// so `require_api_token` never has to re-read the environment per
    /// request. `None` in dev mode.
    pub api_token_hash: Option<Vec<u8>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, clock: Arc<dyn Clock>, store: Arc<TaskStore>, scheduler: Arc<Scheduler>) -> Self {
        let api_token_hash = config.api_token().map(|token| Sha256::digest(token.as_bytes()).to_vec());
        AppState { config, clock, store, scheduler, api_token_hash }
    }
}
