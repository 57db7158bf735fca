//! Shop POS - offline-first core
//!
//! A cashier-facing local store for one shop at a time, a durable queue of
//! writes that could not reach the backend, and the engine that replays the
//! queue once the backend is reachable again. UI shells embed [`PosApp`] and
//! call the mutation façade and the session manager; everything else runs in
//! the background.

use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod auth;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod models;
pub mod mutations;
pub mod network;
pub mod operations;
pub mod queue;
pub mod remote;
pub mod settings;
pub mod storage;
pub mod store;
pub mod sync;
pub mod tasks;

#[cfg(test)]
mod testutil;

pub use api::HttpRemote;
pub use auth::{LoginOutcome, LoginSource, SessionManager};
pub use error::{AuthError, PosError, PosResult, RemoteError};
pub use mutations::{CommitOutcome, Mutations};
pub use network::NetworkStatus;
pub use operations::Operation;
pub use queue::OperationQueue;
pub use remote::RemoteDataAccess;
pub use settings::SyncSettings;
pub use store::LocalStore;
pub use sync::{DrainReport, SyncEngine, SyncStatus};
pub use tasks::BackgroundTasks;

/// Every long-lived component, wired together over one database.
pub struct PosApp {
    pub db: Arc<db::DbState>,
    pub settings: SyncSettings,
    pub store: Arc<LocalStore>,
    pub queue: Arc<OperationQueue>,
    pub network: Arc<NetworkStatus>,
    pub remote: Arc<dyn RemoteDataAccess>,
    pub engine: Arc<SyncEngine>,
    pub tasks: Arc<BackgroundTasks>,
    pub mutations: Arc<Mutations>,
    pub session: SessionManager,
    cancel: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl PosApp {
    /// Open (or create) `{data_dir}/pos.db` and restore the persisted
    /// snapshot and queue.
    pub fn open(
        data_dir: &Path,
        remote: Arc<dyn RemoteDataAccess>,
        online: bool,
    ) -> PosResult<Self> {
        let db = db::init(data_dir).map_err(PosError::Storage)?;
        Self::with_db(Arc::new(db), remote, online)
    }

    /// Open against the backend stored in the OS credential store. Starts
    /// offline; the connectivity probe flips the signal once the backend
    /// answers.
    pub fn open_configured(data_dir: &Path) -> PosResult<Self> {
        let credentials = storage::load_backend_credentials().ok_or_else(|| {
            PosError::Validation("backend connection is not configured".into())
        })?;
        let remote = HttpRemote::new(&credentials.backend_url, credentials.api_key.as_str())?;
        let app = Self::open(data_dir, Arc::new(remote), false)?;
        app.check_provisioned_shop(credentials.shop_id.as_deref())?;
        Ok(app)
    }

    /// When the device was provisioned for one shop, the cached snapshot
    /// must belong to it. A cache for any other shop is dropped so the next
    /// login starts clean; queued writes stay tagged with their own shop.
    fn check_provisioned_shop(&self, provisioned: Option<&str>) -> PosResult<()> {
        let Some(provisioned) = provisioned else {
            return Ok(());
        };
        let active = self.store.active_shop_id()?;
        match active.as_deref() {
            Some(active) if active != provisioned => {
                warn!(
                    provisioned,
                    cached = active,
                    "Cached snapshot belongs to another shop; discarding it"
                );
                self.store.clear()
            }
            _ => Ok(()),
        }
    }

    pub fn with_db(
        db: Arc<db::DbState>,
        remote: Arc<dyn RemoteDataAccess>,
        online: bool,
    ) -> PosResult<Self> {
        let settings = {
            let conn = db.conn.lock().map_err(|e| PosError::Storage(e.to_string()))?;
            SyncSettings::load(&conn)
        };

        let store = Arc::new(LocalStore::load(db.clone())?);
        let queue = Arc::new(OperationQueue::load(db.clone(), settings.max_retries)?);
        let network = Arc::new(NetworkStatus::new(online));
        let tasks = Arc::new(BackgroundTasks::new());

        let engine = Arc::new(SyncEngine::new(
            db.clone(),
            store.clone(),
            queue.clone(),
            remote.clone(),
            network.clone(),
            settings.request_timeout(),
        ));
        let mutations = Arc::new(Mutations::new(
            store.clone(),
            queue.clone(),
            engine.clone(),
            remote.clone(),
            tasks.clone(),
            settings.clone(),
        ));
        let session = SessionManager::new(
            db.clone(),
            store.clone(),
            remote.clone(),
            network.clone(),
            mutations.clone(),
            settings.request_timeout(),
        );

        info!(
            pending = queue.count(),
            dead_letters = queue.dead_letters().len(),
            online,
            "POS core ready"
        );

        Ok(Self {
            db,
            settings,
            store,
            queue,
            network,
            remote,
            engine,
            tasks,
            mutations,
            session,
            cancel: CancellationToken::new(),
            background: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the sync loop and the connectivity probe. Must be called from
    /// within a tokio runtime.
    pub fn start_background_sync(&self) {
        let sync_loop = sync::start_sync_loop(
            self.engine.clone(),
            self.settings.interval(),
            self.cancel.child_token(),
        );
        let probe = network::spawn_connectivity_probe(
            self.remote.clone(),
            self.network.clone(),
            self.settings.interval(),
            self.cancel.child_token(),
        );
        match self.background.lock() {
            Ok(mut handles) => handles.extend([sync_loop, probe]),
            Err(e) => warn!("background handle list poisoned: {e}"),
        }
    }

    /// Stop the background loops and wait for detached side effects.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles: Vec<JoinHandle<()>> = match self.background.lock() {
            Ok(mut handles) => handles.drain(..).collect(),
            Err(_) => Vec::new(),
        };
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("background loop ended abnormally: {e}");
            }
        }
        self.tasks.flush().await;
        info!(pending = self.queue.count(), "POS core stopped");
    }

    /// Shut down, then forget the backend connection and every local record,
    /// unsynced operations included.
    pub async fn factory_reset(self) -> PosResult<()> {
        self.shutdown().await;
        storage::factory_reset(&self.db).map_err(PosError::Storage)
    }
}
