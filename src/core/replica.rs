//! Bounded-staleness in-memory replicas of authoritative tables.
//!
//! Each replica is single-writer (its refresher task) and multi-reader.
//! Readers load an atomically-published snapshot map, so a refresh can
//! never be observed half-applied. A failed refresh keeps the previous
//! snapshot: stale data beats an empty replica.

use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::core::database::{
    CustomProviderEntity, KeyEntity, ProviderSettingEntity, RouteEntity, Store,
};
use crate::core::metrics::get_metrics;

/// Full authoritative listing of one table.
#[async_trait]
pub trait SnapshotSource<T>: Send + Sync + 'static {
    async fn load(&self) -> anyhow::Result<Vec<T>>;
}

#[async_trait]
impl SnapshotSource<KeyEntity> for Store {
    async fn load(&self) -> anyhow::Result<Vec<KeyEntity>> {
        Ok(self.list_keys().await?)
    }
}

#[async_trait]
impl SnapshotSource<ProviderSettingEntity> for Store {
    async fn load(&self) -> anyhow::Result<Vec<ProviderSettingEntity>> {
        Ok(self.list_provider_settings().await?)
    }
}

#[async_trait]
impl SnapshotSource<RouteEntity> for Store {
    async fn load(&self) -> anyhow::Result<Vec<RouteEntity>> {
        Ok(self.list_routes().await?)
    }
}

#[async_trait]
impl SnapshotSource<CustomProviderEntity> for Store {
    async fn load(&self) -> anyhow::Result<Vec<CustomProviderEntity>> {
        Ok(self.list_custom_providers().await?)
    }
}

/// Read-optimized replica of one table, refreshed in the background.
pub struct Replica<T> {
    name: &'static str,
    map: ArcSwap<HashMap<String, Arc<T>>>,
    key_fn: fn(&T) -> String,
    source: Arc<dyn SnapshotSource<T>>,
    interval: Duration,
    stop_tx: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + Sync + 'static> Replica<T> {
    pub fn new(
        name: &'static str,
        source: Arc<dyn SnapshotSource<T>>,
        key_fn: fn(&T) -> String,
        interval: Duration,
    ) -> Self {
        Self {
            name,
            map: ArcSwap::from_pointee(HashMap::new()),
            key_fn,
            source,
            interval,
            stop_tx: Mutex::new(None),
            task: Mutex::new(None),
        }
    }

    /// Non-blocking single-record lookup against the current snapshot.
    pub fn get(&self, id: &str) -> Option<Arc<T>> {
        self.map.load().get(id).cloned()
    }

    /// The whole current generation. Callers that must read several records
    /// consistently capture this once and index into it.
    pub fn snapshot(&self) -> Arc<HashMap<String, Arc<T>>> {
        self.map.load_full()
    }

    pub fn len(&self) -> usize {
        self.map.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.load().is_empty()
    }

    /// Pull the authoritative set once and swap the snapshot.
    pub async fn refresh_once(&self) -> anyhow::Result<()> {
        let records = self.source.load().await?;
        let mut next = HashMap::with_capacity(records.len());
        for record in records {
            next.insert((self.key_fn)(&record), Arc::new(record));
        }
        self.map.store(Arc::new(next));
        debug!(replica = self.name, records = self.len(), "replica refreshed");
        Ok(())
    }

    /// Start the background refresher. Idempotent: a second call while one
    /// is running is a no-op.
    pub fn listen(self: &Arc<Self>) {
        let mut task_guard = self.task.lock().expect("replica task lock poisoned");
        if task_guard.is_some() {
            return;
        }

        let (stop_tx, mut stop_rx) = watch::channel(false);
        *self.stop_tx.lock().expect("replica stop lock poisoned") = Some(stop_tx);

        let replica = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(replica.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = replica.refresh_once().await {
                            get_metrics()
                                .replica_refresh_failures
                                .with_label_values(&[replica.name])
                                .inc();
                            warn!(
                                replica = replica.name,
                                error = %e,
                                "replica refresh failed, keeping previous snapshot"
                            );
                        }
                    }
                    _ = stop_rx.changed() => {
                        if *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });
        *task_guard = Some(handle);
    }

    /// Halt the refresher and wait for it to exit.
    pub async fn stop(&self) {
        let stop_tx = self.stop_tx.lock().expect("replica stop lock poisoned").take();
        if let Some(tx) = stop_tx {
            let _ = tx.send(true);
        }
        let handle = self.task.lock().expect("replica task lock poisoned").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

/// The four replicas the request pipeline reads.
pub struct ReplicaSet {
    /// Keys indexed by `key_hash`.
    pub keys: Arc<Replica<KeyEntity>>,
    /// Provider settings indexed by `setting_id`.
    pub settings: Arc<Replica<ProviderSettingEntity>>,
    /// Routes indexed by public `path`.
    pub routes: Arc<Replica<RouteEntity>>,
    /// Custom providers indexed by `name`.
    pub custom_providers: Arc<Replica<CustomProviderEntity>>,
}

impl ReplicaSet {
    pub fn new(store: Store, interval: Duration) -> Self {
        let store = Arc::new(store);
        Self {
            keys: Arc::new(Replica::new(
                "keys",
                store.clone() as Arc<dyn SnapshotSource<KeyEntity>>,
                |k: &KeyEntity| k.key_hash.clone(),
                interval,
            )),
            settings: Arc::new(Replica::new(
                "provider_settings",
                store.clone() as Arc<dyn SnapshotSource<ProviderSettingEntity>>,
                |s: &ProviderSettingEntity| s.setting_id.clone(),
                interval,
            )),
            routes: Arc::new(Replica::new(
                "routes",
                store.clone() as Arc<dyn SnapshotSource<RouteEntity>>,
                |r: &RouteEntity| r.path.clone(),
                interval,
            )),
            custom_providers: Arc::new(Replica::new(
                "custom_providers",
                store as Arc<dyn SnapshotSource<CustomProviderEntity>>,
                |c: &CustomProviderEntity| c.name.clone(),
                interval,
            )),
        }
    }

    /// Initial load of all four replicas; startup fails if any table cannot
    /// be read once.
    pub async fn warm_up(&self) -> anyhow::Result<()> {
        self.keys.refresh_once().await?;
        self.settings.refresh_once().await?;
        self.routes.refresh_once().await?;
        self.custom_providers.refresh_once().await?;
        Ok(())
    }

    pub fn listen(&self) {
        self.keys.listen();
        self.settings.listen();
        self.routes.listen();
        self.custom_providers.listen();
    }

    pub async fn stop(&self) {
        self.keys.stop().await;
        self.settings.stop().await;
        self.routes.stop().await;
        self.custom_providers.stop().await;
    }
}
