use std::sync::Arc;

use crate::config::ServerConfig;
use crate::db::Database;
use crate::store::ClipboardStore;

pub struct ServerContext {
    pub db: Arc<Database>,

    pub store: ClipboardStore,

    pub cfg: ServerConfig,
}

impl ServerContext {
    #[cfg(test)]
    pub fn new_test() -> Arc<Self> {
        Self::new_test_cfg(Self::test_cfg())
    }

    #[cfg(test)]
    pub fn new_test_cfg(cfg: ServerConfig) -> Arc<Self> {
        let db = Arc::new(Database::new_test());
        let store = ClipboardStore::new(db.clone(), None);
        Arc::new(Self { db, store, cfg })
    }

    #[cfg(test)]
    pub fn new_test_with_images(images_root: std::path::PathBuf) -> Arc<Self> {
        let db = Arc::new(Database::new_test());
        let store = ClipboardStore::new(db.clone(), Some(images_root));
        Arc::new(Self {
            db,
            store,
            cfg: Self::test_cfg(),
        })
    }

    #[cfg(test)]
    pub fn test_cfg() -> ServerConfig {
        let mut cfg = ServerConfig::default();
        // Ephemeral loopback port; the adaptive hash dominates test time
        // at production rounds.
        cfg.bind = String::from("127.0.0.1:0");
        cfg.password_hash_rounds = 10_000;
        cfg
    }
}
