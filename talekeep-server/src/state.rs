use std::sync::Arc;

use talekeep_config::Config;
use talekeep_core::cache::SizeCache;
use talekeep_core::events::EventHub;
use talekeep_core::ops::OpsContext;
use talekeep_core::queue::OperationQueue;
use talekeep_core::secrets::Vault;
use talekeep_core::store::Store;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub hub: Arc<EventHub>,
    pub cache: Arc<SizeCache>,
    pub queue: Arc<OperationQueue>,
    pub ops: OpsContext,
    pub config: Config,
    /// Present when a secrets passphrase was configured; secret settings are
    /// stored as opaque ciphertext without it.
    pub vault: Option<Vault>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("vault", &self.vault.is_some())
            .finish_non_exhaustive()
    }
}
