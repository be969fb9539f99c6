use std::io;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::listing::Listing;
use crate::protection::ProtectionRegistry;
use crate::session::SessionStore;
use crate::storage::LocalStorage;
use crate::visibility::VisibilityRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub storage: Arc<LocalStorage>,
    pub protection: Arc<ProtectionRegistry>,
    pub visibility: Arc<VisibilityRegistry>,
    pub sessions: SessionStore,
    pub listing: Listing,
}

impl AppState {
    /// Create the public root if needed and load both registries.
    pub async fn new(config: ServerConfig) -> io::Result<Self> {
        let storage = Arc::new(LocalStorage::new(config.public_dir.clone())?);
        let protection = Arc::new(ProtectionRegistry::open(config.folder_keys_config.clone()).await);
        let visibility = Arc::new(VisibilityRegistry::open(config.visibility_config.clone()).await);
        let listing = Listing::new(storage.root().to_path_buf(), protection.clone(), visibility.clone());
        Ok(Self {
            config: Arc::new(config),
            storage,
            protection,
            visibility,
            sessions: SessionStore::new(),
            listing,
        })
    }
}
