//! Orchestration of a single scan: discovery, hashing, grouping and events

use crate::discovery::{DiscoveryOptions, DiscoveryOutcome, FileDiscoverer};
use crate::hash::{HashEngine, HashRequest, HashResult};
use crate::models::*;
use crate::progress::{ProgressHub, ScanEvent};
use crate::store::ResultStore;
use crate::{error::ScanError, Config, HashAlgorithm, Result};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

type IndexKey = (HashAlgorithm, String);

/// Mutable scan state guarded by the coordinator lock
struct ScanRecord {
    state: ScanState,
    progress: ScanProgress,
    error: Option<String>,
    /// Primary hash -> files sharing it
    index: HashMap<IndexKey, Vec<FileEntry>>,
    groups: Option<Vec<DuplicateGroup>>,
    file_errors: Vec<FileError>,
    started_at: Option<SystemTime>,
    completed_at: Option<SystemTime>,
}

/// How a scan's run loop ended
enum RunOutcome {
    Finished,
    Cancelled,
}

/// Drives one scan through `Pending -> Running -> {Completed | Failed | Cancelled}`
pub struct ScanCoordinator {
    id: ScanId,
    name: String,
    description: Option<String>,
    paths: Vec<std::path::PathBuf>,
    algorithms: Vec<HashAlgorithm>,
    chunk_size: usize,
    workers: usize,
    progress_interval: u64,
    created_at: SystemTime,
    discoverer: FileDiscoverer,
    engine: Arc<HashEngine>,
    hub: Arc<ProgressHub>,
    store: Option<Arc<dyn ResultStore>>,
    record: Mutex<ScanRecord>,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel_requested: AtomicBool,
    started: AtomicBool,
    state_tx: watch::Sender<ScanState>,
}

impl ScanCoordinator {
    /// Create a coordinator in the `Pending` state. The config is expected to
    /// have been validated already.
    pub fn new(
        id: ScanId,
        config: ScanConfig,
        settings: &Config,
        engine: Arc<HashEngine>,
        hub: Arc<ProgressHub>,
    ) -> Self {
        let algorithms = if config.algorithms.is_empty() {
            settings.default_algorithms.clone()
        } else {
            config.algorithms.clone()
        };

        let discoverer = FileDiscoverer::new(DiscoveryOptions {
            exclude_patterns: config.exclude_patterns.clone(),
            max_file_size: settings.max_file_size,
            ..DiscoveryOptions::default()
        });

        let (state_tx, _) = watch::channel(ScanState::Pending);

        Self {
            id,
            name: config.name.clone().unwrap_or_else(|| format!("Scan {}", id)),
            description: config.description.clone(),
            paths: config.paths,
            algorithms,
            chunk_size: config.chunk_size.unwrap_or(settings.chunk_size),
            workers: config.workers.unwrap_or_else(|| engine.workers()).max(1),
            progress_interval: settings.progress_interval.max(1),
            created_at: SystemTime::now(),
            discoverer,
            engine,
            hub,
            store: None,
            record: Mutex::new(ScanRecord {
                state: ScanState::Pending,
                progress: ScanProgress::default(),
                error: None,
                index: HashMap::new(),
                groups: None,
                file_errors: Vec::new(),
                started_at: None,
                completed_at: None,
            }),
            task: Mutex::new(None),
            cancel_requested: AtomicBool::new(false),
            started: AtomicBool::new(false),
            state_tx,
        }
    }

    /// Persist the report through `store` once the scan completes
    pub fn with_store(mut self, store: Arc<dyn ResultStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn id(&self) -> ScanId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn algorithms(&self) -> &[HashAlgorithm] {
        &self.algorithms
    }

    /// Begin the scan on the runtime and return immediately. Returns false if
    /// the scan was already started.
    pub fn start(self: &Arc<Self>) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        let this = Arc::clone(self);
        let handle = tokio::spawn(async move { this.run().await });
        *self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(handle);
        true
    }

    pub fn state(&self) -> ScanState {
        self.lock().state
    }

    pub fn progress(&self) -> ScanProgress {
        self.lock().progress.clone()
    }

    /// Snapshot of state, counters and metadata
    pub fn status(&self) -> ScanStatus {
        let record = self.lock();
        ScanStatus {
            scan_id: self.id,
            name: self.name.clone(),
            description: self.description.clone(),
            state: record.state,
            progress: record.progress.clone(),
            error: record.error.clone(),
            algorithms: self.algorithms.clone(),
            paths: self.paths.clone(),
            created_at: self.created_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
        }
    }

    /// Finalized groups; only present once the scan has completed
    pub fn duplicate_groups(&self) -> Option<Vec<DuplicateGroup>> {
        self.lock().groups.clone()
    }

    /// Per-file and per-subtree errors recorded so far
    pub fn file_errors(&self) -> Vec<FileError> {
        self.lock().file_errors.clone()
    }

    /// Files held in the hash index that have not been finalized into groups
    pub fn indexed_files(&self) -> usize {
        self.lock().index.values().map(Vec::len).sum()
    }

    /// Full report for a completed scan
    pub fn report(&self) -> Option<ScanReport> {
        let status = self.status();
        let record = self.lock();
        let groups = record.groups.as_ref()?;
        Some(ScanReport {
            summary: ScanSummary::from_groups(&record.progress, groups),
            duplicate_groups: groups.clone(),
            errors: record.file_errors.clone(),
            status,
        })
    }

    /// Request cancellation. Pending scans are cancelled on the spot; running
    /// scans stop before their next file. Returns false for finished scans.
    pub fn cancel(&self) -> bool {
        let mut record = self.lock();
        match record.state {
            ScanState::Pending => {
                self.cancel_requested.store(true, Ordering::SeqCst);
                self.transition(&mut record, ScanState::Cancelled);
                drop(record);
                info!(scan_id = self.id, "Pending scan cancelled");
                self.hub.broadcast(&ScanEvent::ScanCancelled {
                    scan_id: self.id,
                    files_processed: 0,
                });
                true
            }
            ScanState::Running => {
                self.cancel_requested.store(true, Ordering::SeqCst);
                info!(scan_id = self.id, "Cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Wait until the scan reaches a terminal state
    pub async fn wait(&self) -> ScanState {
        let mut rx = self.state_tx.subscribe();
        let result = rx.wait_for(|state| state.is_terminal()).await.map(|state| *state);
        match result {
            Ok(state) => state,
            Err(_) => self.state(),
        }
    }

    /// Wait for the run task, including persistence, to finish
    pub async fn join(&self) -> ScanState {
        let handle = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                error!(scan_id = self.id, error = %err, "Scan task aborted");
                self.fail(ScanError::Task(err));
            }
        }
        self.wait().await
    }

    async fn run(self: Arc<Self>) {
        {
            let mut record = self.lock();
            if !self.transition(&mut record, ScanState::Running) {
                debug!(scan_id = self.id, state = %record.state, "Scan not started");
                return;
            }
        }

        info!(scan_id = self.id, name = %self.name, paths = ?self.paths, algorithms = ?self.algorithms, "Scan started");
        self.hub.broadcast(&ScanEvent::ScanStarted {
            scan_id: self.id,
            name: self.name.clone(),
            paths: self.paths.clone(),
            algorithms: self.algorithms.clone(),
        });

        match self.execute().await {
            Ok(RunOutcome::Finished) => {
                self.complete();
                self.persist().await;
            }
            Ok(RunOutcome::Cancelled) => self.finish_cancelled(),
            Err(err) => self.fail(err),
        }
    }

    async fn execute(&self) -> Result<RunOutcome> {
        let discoverer = self.discoverer.clone();
        let paths = self.paths.clone();
        let outcome: DiscoveryOutcome =
            tokio::task::spawn_blocking(move || discoverer.discover(paths).finish()).await?;

        if outcome.no_roots_resolved() {
            self.lock().file_errors.extend(outcome.errors);
            return Err(ScanError::StructuralFailure("none of the scan roots could be resolved".into()));
        }

        let snapshot = {
            let mut record = self.lock();
            record.progress.files_discovered = outcome.files.len() as u64;
            record.file_errors.extend(outcome.errors);
            record.progress.clone()
        };
        info!(scan_id = self.id, files = snapshot.files_discovered, "Discovery complete");
        self.hub.broadcast(&ScanEvent::ScanProgress {
            scan_id: self.id,
            progress: snapshot,
        });

        let mut hashed = stream::iter(outcome.files)
            .map(|file| self.hash_one(file))
            .buffer_unordered(self.workers);

        while let Some(result) = hashed.next().await {
            if let Some((file, result)) = result {
                self.record_outcome(file, result)?;
            }
        }

        if self.is_cancel_requested() {
            Ok(RunOutcome::Cancelled)
        } else {
            Ok(RunOutcome::Finished)
        }
    }

    /// Hash one file unless cancellation has been requested
    async fn hash_one(&self, file: DiscoveredFile) -> Option<(DiscoveredFile, Result<HashResult>)> {
        if self.is_cancel_requested() {
            return None;
        }
        self.lock().progress.current_file = Some(file.path.clone());

        let request = HashRequest {
            path: file.path.clone(),
            algorithms: self.algorithms.clone(),
            chunk_size: self.chunk_size,
        };
        let result = self.engine.hash(&request, None).await;
        Some((file, result))
    }

    fn record_outcome(&self, file: DiscoveredFile, result: Result<HashResult>) -> Result<()> {
        let snapshot = {
            let mut record = self.lock();
            match result {
                Ok(hashes) => {
                    let Some((algorithm, primary)) = hashes.primary() else {
                        return Err(ScanError::StructuralFailure(format!(
                            "no digest computed for {}",
                            file.path.display()
                        )));
                    };
                    let key = (algorithm, primary.to_string());
                    record.progress.bytes_processed += file.size;

                    let bucket = record.index.entry(key).or_default();
                    bucket.push(FileEntry::new(&file, hashes.digests));
                    if bucket.len() == 2 {
                        record.progress.duplicate_groups += 1;
                    }
                }
                Err(err) if !err.is_per_file() => return Err(err),
                Err(err) => {
                    warn!(scan_id = self.id, path = %file.path.display(), error = %err, "Failed to hash file");
                    record.progress.files_failed += 1;
                    record.file_errors.push(FileError::from_hash_error(file.path.clone(), &err));
                }
            }
            record.progress.files_processed += 1;

            if record.progress.files_processed % self.progress_interval == 0 {
                Some(record.progress.clone())
            } else {
                None
            }
        };

        if let Some(progress) = snapshot {
            debug!(
                scan_id = self.id,
                processed = progress.files_processed,
                discovered = progress.files_discovered,
                "Scan progress"
            );
            self.hub.broadcast(&ScanEvent::ScanProgress {
                scan_id: self.id,
                progress,
            });
        }
        Ok(())
    }

    fn complete(&self) {
        let event = {
            let mut record = self.lock();
            let index = std::mem::take(&mut record.index);
            let mut groups: Vec<DuplicateGroup> = index
                .into_iter()
                .filter(|(_, files)| files.len() > 1)
                .map(|((algorithm, hash), files)| DuplicateGroup::new(algorithm, hash, files))
                .collect();
            groups.sort_by(|a, b| b.space_wasted.cmp(&a.space_wasted).then_with(|| a.hash.cmp(&b.hash)));

            record.progress.duplicate_groups = groups.len() as u64;
            record.progress.current_file = None;
            let space_wasted = groups.iter().map(|g| g.space_wasted).sum();
            let duplicate_groups = groups.len();
            record.groups = Some(groups);

            if !self.transition(&mut record, ScanState::Completed) {
                return;
            }
            ScanEvent::ScanCompleted {
                scan_id: self.id,
                files_processed: record.progress.files_processed,
                duplicate_groups,
                space_wasted,
            }
        };

        info!(scan_id = self.id, event = ?event, "Scan completed");
        self.hub.broadcast(&event);
    }

    async fn persist(&self) {
        let (Some(store), Some(report)) = (self.store.clone(), self.report()) else {
            return;
        };
        let scan_id = self.id;
        match tokio::task::spawn_blocking(move || store.store(&report)).await {
            Ok(Ok(())) => debug!(scan_id, "Scan result persisted"),
            Ok(Err(err)) => warn!(scan_id, error = %err, "Failed to persist scan result"),
            Err(err) => warn!(scan_id, error = %err, "Persistence task failed"),
        }
    }

    fn finish_cancelled(&self) {
        let files_processed = {
            let mut record = self.lock();
            record.progress.current_file = None;
            if !self.transition(&mut record, ScanState::Cancelled) {
                return;
            }
            record.progress.files_processed
        };

        info!(scan_id = self.id, files_processed, "Scan cancelled");
        self.hub.broadcast(&ScanEvent::ScanCancelled {
            scan_id: self.id,
            files_processed,
        });
    }

    fn fail(&self, err: ScanError) {
        let message = err.to_string();
        {
            let mut record = self.lock();
            record.progress.current_file = None;
            record.error = Some(message.clone());
            if !self.transition(&mut record, ScanState::Failed) {
                return;
            }
        }

        error!(scan_id = self.id, error = %message, "Scan failed");
        self.hub.broadcast(&ScanEvent::ScanFailed {
            scan_id: self.id,
            error: message,
        });
    }

    /// Apply a state change if the state machine allows it
    fn transition(&self, record: &mut ScanRecord, next: ScanState) -> bool {
        if !record.state.can_transition_to(next) {
            return false;
        }
        record.state = next;
        match next {
            ScanState::Running => record.started_at = Some(SystemTime::now()),
            state if state.is_terminal() => record.completed_at = Some(SystemTime::now()),
            _ => {}
        }
        self.state_tx.send_replace(next);
        true
    }

    fn lock(&self) -> MutexGuard<'_, ScanRecord> {
        self.record.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
