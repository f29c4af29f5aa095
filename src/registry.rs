//! Ownership of every scan in the process

use crate::coordinator::ScanCoordinator;
use crate::hash::HashEngine;
use crate::models::{ScanConfig, ScanId, ScanStatus};
use crate::progress::ProgressHub;
use crate::store::ResultStore;
use crate::{error::ScanError, Config, HashAlgorithm, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

/// Service-level view of the registry
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub status: String,
    pub active_scans: usize,
    pub total_scans: usize,
    pub scan_ids: Vec<ScanId>,
    pub workers: usize,
    pub chunk_size: usize,
    pub available_algorithms: Vec<HashAlgorithm>,
    pub subscribers: usize,
}

/// Hands out scan ids, keeps coordinators reachable and owns the shared
/// hash engine and progress hub.
///
/// Finished scans are retained up to `history_capacity`; the oldest finished
/// scans are evicted first and running scans are never evicted.
pub struct ScanRegistry {
    config: Config,
    engine: Arc<HashEngine>,
    hub: Arc<ProgressHub>,
    store: Option<Arc<dyn ResultStore>>,
    scans: RwLock<BTreeMap<ScanId, Arc<ScanCoordinator>>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl ScanRegistry {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let engine = Arc::new(HashEngine::new(config.chunk_size, config.workers));
        Ok(Self::with_engine(config, engine))
    }

    /// Build a registry around an existing engine
    pub fn with_engine(config: Config, engine: Arc<HashEngine>) -> Self {
        info!(
            workers = config.workers,
            chunk_size = config.chunk_size,
            history_capacity = config.history_capacity,
            "Scan registry initialized"
        );
        Self {
            config,
            engine,
            hub: Arc::new(ProgressHub::new()),
            store: None,
            scans: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Persist completed scans through `store`
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn hub(&self) -> Arc<ProgressHub> {
        Arc::clone(&self.hub)
    }

    pub fn engine(&self) -> Arc<HashEngine> {
        Arc::clone(&self.engine)
    }

    /// Validate `config`, create its coordinator and start it
    pub async fn start(&self, config: ScanConfig) -> Result<ScanId> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ScanError::ShuttingDown);
        }
        config.validate()?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut coordinator = ScanCoordinator::new(id, config, &self.config, self.engine(), self.hub());
        if let Some(store) = &self.store {
            coordinator = coordinator.with_store(Arc::clone(store));
        }
        let coordinator = Arc::new(coordinator);

        {
            let mut scans = self.scans.write().await;
            // Shutdown snapshots the map after raising the flag, so a scan
            // inserted under this lock is always seen and waited for
            if self.shutting_down.load(Ordering::SeqCst) {
                return Err(ScanError::ShuttingDown);
            }
            scans.insert(id, Arc::clone(&coordinator));
            self.evict_finished(&mut scans);
            coordinator.start();
        }

        info!(scan_id = id, name = coordinator.name(), "Scan registered");
        Ok(id)
    }

    pub async fn get(&self, id: ScanId) -> Result<Arc<ScanCoordinator>> {
        self.scans
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(ScanError::ScanNotFound(id))
    }

    /// Status of every retained scan, oldest first
    pub async fn list(&self) -> Vec<ScanStatus> {
        self.scans.read().await.values().map(|scan| scan.status()).collect()
    }

    /// Cancel a scan. `Ok(false)` means it had already finished.
    pub async fn cancel(&self, id: ScanId) -> Result<bool> {
        let scan = self.get(id).await?;
        Ok(scan.cancel())
    }

    pub async fn service_status(&self) -> ServiceStatus {
        let scans = self.scans.read().await;
        let active_scans = scans.values().filter(|scan| !scan.state().is_terminal()).count();
        ServiceStatus {
            status: if self.shutting_down.load(Ordering::SeqCst) {
                "shutting_down".to_string()
            } else {
                "running".to_string()
            },
            active_scans,
            total_scans: scans.len(),
            scan_ids: scans.keys().copied().collect(),
            workers: self.engine.workers(),
            chunk_size: self.config.chunk_size,
            available_algorithms: HashAlgorithm::ALL
                .into_iter()
                .filter(|algorithm| self.engine.capabilities().is_available(*algorithm))
                .collect(),
            subscribers: self.hub.subscriber_count(),
        }
    }

    /// Cancel every unfinished scan, wait for all of them, then stop the
    /// hash engine. New scans are rejected from the moment this is called.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down scan registry");

        let scans: Vec<Arc<ScanCoordinator>> = self.scans.read().await.values().cloned().collect();
        for scan in &scans {
            if scan.cancel() {
                debug!(scan_id = scan.id(), "Cancelled scan during shutdown");
            }
        }
        for scan in &scans {
            let state = scan.join().await;
            debug!(scan_id = scan.id(), state = %state, "Scan settled");
        }

        self.engine.shutdown().await;
        info!("Scan registry shutdown complete");
    }

    fn evict_finished(&self, scans: &mut BTreeMap<ScanId, Arc<ScanCoordinator>>) {
        let finished: Vec<ScanId> = scans
            .iter()
            .filter(|(_, scan)| scan.state().is_terminal())
            .map(|(id, _)| *id)
            .collect();

        let excess = finished.len().saturating_sub(self.config.history_capacity);
        for id in finished.into_iter().take(excess) {
            scans.remove(&id);
            debug!(scan_id = id, "Evicted finished scan");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ScanState;
    use crate::store::JsonFileStore;
    use std::fs;
    use tempfile::TempDir;

    fn registry(history_capacity: usize) -> ScanRegistry {
        ScanRegistry::new(Config {
            history_capacity,
            ..Config::default()
        })
        .unwrap()
    }

    fn fixture() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a.txt"), "same").unwrap();
        fs::write(temp_dir.path().join("b.txt"), "same").unwrap();
        temp_dir
    }

    #[tokio::test]
    async fn test_ids_are_monotonic_and_lookups_work() {
        let temp_dir = fixture();
        let registry = registry(16);

        let first = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();
        let second = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();
        assert_eq!((first, second), (1, 2));

        let scan = registry.get(first).await.unwrap();
        assert_eq!(scan.join().await, ScanState::Completed);
        registry.get(second).await.unwrap().join().await;

        let statuses = registry.list().await;
        assert_eq!(statuses.iter().map(|s| s.scan_id).collect::<Vec<_>>(), vec![1, 2]);
        assert!(matches!(registry.get(99).await, Err(ScanError::ScanNotFound(99))));
        assert!(matches!(registry.cancel(99).await, Err(ScanError::ScanNotFound(99))));
        assert!(!registry.cancel(first).await.unwrap());
    }

    #[tokio::test]
    async fn test_invalid_config_rejected_before_registration() {
        let registry = registry(16);
        let err = registry.start(ScanConfig::new(Vec::<std::path::PathBuf>::new())).await.unwrap_err();
        assert!(matches!(err, ScanError::InvalidConfig(_)));
        assert!(registry.list().await.is_empty());

        // The rejected request did not consume an id
        let temp_dir = fixture();
        assert_eq!(registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_finished_scans_are_evicted_oldest_first() {
        let temp_dir = fixture();
        let registry = registry(2);

        for _ in 0..4 {
            let id = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();
            registry.get(id).await.unwrap().join().await;
        }
        // Eviction runs on start, so the last finished scan is still counted
        let id = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();
        registry.get(id).await.unwrap().join().await;

        let ids: Vec<ScanId> = registry.list().await.iter().map(|s| s.scan_id).collect();
        assert_eq!(ids, vec![3, 4, 5]);
        assert!(registry.get(1).await.is_err());
    }

    #[tokio::test]
    async fn test_completed_scans_are_persisted() {
        let temp_dir = fixture();
        let results = TempDir::new().unwrap();
        let store = Arc::new(JsonFileStore::new(results.path()).unwrap());
        let registry = registry(16).with_store(store.clone());

        let id = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();
        assert_eq!(registry.get(id).await.unwrap().join().await, ScanState::Completed);

        let report = store.load(id).unwrap();
        assert_eq!(report.summary.duplicate_groups, 1);
        assert_eq!(report.status.state, ScanState::Completed);
    }

    #[tokio::test]
    async fn test_service_status() {
        let registry = registry(16);
        let status = registry.service_status().await;
        assert_eq!(status.status, "running");
        assert_eq!(status.active_scans, 0);
        assert_eq!(status.workers, crate::DEFAULT_WORKERS);
        assert_eq!(status.available_algorithms.len(), 4);
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_scans_and_stops_engine() {
        let temp_dir = fixture();
        let registry = registry(16);
        let id = registry.start(ScanConfig::new([temp_dir.path()])).await.unwrap();

        registry.shutdown().await;

        assert!(registry.get(id).await.unwrap().state().is_terminal());
        assert!(registry.engine().is_stopped());
        assert!(matches!(
            registry.start(ScanConfig::new([temp_dir.path()])).await,
            Err(ScanError::ShuttingDown)
        ));
        assert_eq!(registry.service_status().await.status, "shutting_down");
    }

    #[tokio::test]
    async fn test_start_racing_shutdown_is_rejected_under_lock() {
        let temp_dir = fixture();
        let registry = Arc::new(registry(16));

        // Hold the map so `start` passes its first check and then queues
        let guard = registry.scans.write().await;
        let starting = {
            let registry = Arc::clone(&registry);
            let path = temp_dir.path().to_path_buf();
            tokio::spawn(async move { registry.start(ScanConfig::new([path])).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let stopping = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.shutdown().await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(registry.shutting_down.load(Ordering::SeqCst));
        drop(guard);

        assert!(matches!(starting.await.unwrap(), Err(ScanError::ShuttingDown)));
        stopping.await.unwrap();
        assert!(registry.list().await.is_empty());
        assert!(registry.engine().is_stopped());
    }
}
