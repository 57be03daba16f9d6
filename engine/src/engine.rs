//! The engine value built once at startup
//!
//! Everything that used to be a process-wide singleton in the original
//! desktop app (database handle, encryption key, event channel) lives on one
//! `Engine` value that is threaded through the scheduler, the executor, and
//! the management handlers.

use crate::events::EventBus;
use crate::scheduler::SyncScheduler;
use crate::secret::SecretBox;
use crate::store::TaskStore;
use crate::transfer::TransferExecutor;
use anyhow::Result;
use shared::config::{Tunables, WardenSettings};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Name of the secret key file inside the data directory.
const KEY_FILE: &str = "secret.key";

pub struct Engine {
    pub store: Arc<RwLock<TaskStore>>,
    pub secrets: SecretBox,
    pub events: EventBus,
    pub tunables: Arc<Tunables>,
    pub settings: WardenSettings,
}

impl Engine {
    /// Open the engine: load or create the secret key, open the store, and
    /// run the schema and password migrations.
    pub async fn open(settings: WardenSettings, tunables: Tunables) -> Result<Self> {
        let data_dir = Path::new(&settings.data_dir);
        let secrets = SecretBox::from_key_file(&data_dir.join(KEY_FILE))?;

        let mut store = TaskStore::new(data_dir, settings.database_busy_timeout_seconds)?;
        store.initialize().await?;
        store.migrate_plaintext_passwords(&secrets).await?;

        Ok(Self {
            store: Arc::new(RwLock::new(store)),
            secrets,
            events: EventBus::new(settings.channel_buffer_size),
            tunables: Arc::new(tunables),
            settings,
        })
    }

    /// A transfer executor wired to this engine's store and event bus.
    pub fn executor(&self) -> TransferExecutor {
        TransferExecutor::new(
            self.store.clone(),
            self.secrets.clone(),
            self.events.clone(),
            self.tunables.clone(),
        )
    }

    /// A scheduler wired to this engine. The caller owns it; the engine
    /// itself never calls back into scheduling.
    pub fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(
            self.store.clone(),
            self.executor(),
            self.events.clone(),
            self.tunables.clone(),
            &self.settings,
        )
    }

    pub async fn close(&self) {
        self.store.write().await.close().await;
    }
}
