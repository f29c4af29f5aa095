//! Chunked multi-algorithm file hashing on a bounded worker pool

use crate::{error::ScanError, HashAlgorithm, Result, DEFAULT_CHUNK_SIZE, DEFAULT_WORKERS};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use xxhash_rust::xxh64::Xxh64;

/// Error type a progress callback may return
pub type CallbackError = Box<dyn std::error::Error + Send + Sync>;

/// Per-chunk progress callback. Failures are logged and ignored.
pub type ProgressCallback = Arc<dyn Fn(HashProgress) -> std::result::Result<(), CallbackError> + Send + Sync>;

/// Progress of a single file's hashing
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HashProgress {
    /// Fraction of the file consumed, 0.0 to 1.0
    pub fraction: f64,
    pub bytes_done: u64,
    pub total_bytes: u64,
}

/// Which algorithms this process can compute, resolved once at startup
#[derive(Debug, Clone)]
pub struct AlgorithmCapabilities {
    available: BTreeMap<HashAlgorithm, bool>,
}

impl AlgorithmCapabilities {
    /// Build the table for everything compiled into this binary
    pub fn detect() -> Self {
        Self {
            available: HashAlgorithm::ALL.iter().map(|a| (*a, true)).collect(),
        }
    }

    /// Mark an algorithm as unavailable. The fallback cannot be disabled.
    pub fn without(mut self, algorithm: HashAlgorithm) -> Self {
        if algorithm != HashAlgorithm::FALLBACK {
            self.available.insert(algorithm, false);
        }
        self
    }

    pub fn is_available(&self, algorithm: HashAlgorithm) -> bool {
        self.available.get(&algorithm).copied().unwrap_or(false)
    }

    /// Algorithms that will actually run for `requested`, and whether the
    /// fallback had to be substituted
    pub fn resolve(&self, requested: &[HashAlgorithm]) -> (Vec<HashAlgorithm>, bool) {
        let mut resolved = Vec::with_capacity(requested.len());
        for algorithm in requested {
            if self.is_available(*algorithm) && !resolved.contains(algorithm) {
                resolved.push(*algorithm);
            }
        }
        if resolved.is_empty() {
            (vec![HashAlgorithm::FALLBACK], true)
        } else {
            (resolved, false)
        }
    }
}

impl Default for AlgorithmCapabilities {
    fn default() -> Self {
        Self::detect()
    }
}

/// Request to hash one file
#[derive(Debug, Clone, PartialEq)]
pub struct HashRequest {
    pub path: PathBuf,
    /// Requested algorithms, deduplicated in first-seen order
    pub algorithms: Vec<HashAlgorithm>,
    pub chunk_size: usize,
}

impl HashRequest {
    pub fn new(path: impl Into<PathBuf>, algorithms: &[HashAlgorithm], chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(ScanError::InvalidConfig("chunk size must be positive".into()));
        }
        let mut deduped = Vec::with_capacity(algorithms.len());
        for algorithm in algorithms {
            if !deduped.contains(algorithm) {
                deduped.push(*algorithm);
            }
        }
        Ok(Self {
            path: path.into(),
            algorithms: deduped,
            chunk_size,
        })
    }
}

/// Digests of one file, one entry per algorithm that was computed
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HashResult {
    pub digests: BTreeMap<HashAlgorithm, String>,
}

impl HashResult {
    pub fn get(&self, algorithm: HashAlgorithm) -> Option<&str> {
        self.digests.get(&algorithm).map(String::as_str)
    }

    /// First digest in grouping preference order
    pub fn primary(&self) -> Option<(HashAlgorithm, &str)> {
        HashAlgorithm::PRIMARY_PREFERENCE
            .iter()
            .find_map(|algorithm| self.get(*algorithm).map(|hash| (*algorithm, hash)))
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }
}

/// Running state of one streaming digest
enum DigestState {
    Blake3(blake3::Hasher),
    Xxhash64(Xxh64),
    Sha256(Sha256),
    Md5(md5::Context),
}

impl DigestState {
    fn new(algorithm: HashAlgorithm) -> Self {
        match algorithm {
            HashAlgorithm::Blake3 => DigestState::Blake3(blake3::Hasher::new()),
            HashAlgorithm::Xxhash64 => DigestState::Xxhash64(Xxh64::new(0)),
            HashAlgorithm::Sha256 => DigestState::Sha256(Sha256::new()),
            HashAlgorithm::Md5 => DigestState::Md5(md5::Context::new()),
        }
    }

    fn algorithm(&self) -> HashAlgorithm {
        match self {
            DigestState::Blake3(_) => HashAlgorithm::Blake3,
            DigestState::Xxhash64(_) => HashAlgorithm::Xxhash64,
            DigestState::Sha256(_) => HashAlgorithm::Sha256,
            DigestState::Md5(_) => HashAlgorithm::Md5,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            DigestState::Blake3(hasher) => {
                hasher.update(data);
            }
            DigestState::Xxhash64(hasher) => hasher.update(data),
            DigestState::Sha256(hasher) => hasher.update(data),
            DigestState::Md5(hasher) => hasher.consume(data),
        }
    }

    fn finalize_hex(self) -> String {
        match self {
            DigestState::Blake3(hasher) => hasher.finalize().to_hex().to_string(),
            DigestState::Xxhash64(hasher) => format!("{:016x}", hasher.digest()),
            DigestState::Sha256(hasher) => format!("{:x}", hasher.finalize()),
            DigestState::Md5(hasher) => format!("{:x}", hasher.compute()),
        }
    }
}

/// Streams files through one or more digests.
///
/// Chunk updates run on blocking threads gated by a semaphore with `workers`
/// permits. The semaphore is shared by every caller of the engine, so many
/// concurrent scans queue for the same bounded pool in FIFO order.
pub struct HashEngine {
    workers: usize,
    chunk_size: usize,
    capabilities: AlgorithmCapabilities,
    pool: Arc<Semaphore>,
    stopped: AtomicBool,
}

impl HashEngine {
    /// Create a new hash engine
    pub fn new(chunk_size: usize, workers: usize) -> Self {
        Self::with_capabilities(chunk_size, workers, AlgorithmCapabilities::detect())
    }

    /// Create a hash engine with an explicit capability table
    pub fn with_capabilities(chunk_size: usize, workers: usize, capabilities: AlgorithmCapabilities) -> Self {
        let chunk_size = chunk_size.max(1);
        let workers = workers.max(1);
        info!(chunk_size, workers, "Hash engine initialized");
        Self {
            workers,
            chunk_size,
            capabilities,
            pool: Arc::new(Semaphore::new(workers)),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Default chunk size used by `hash_file` and `quick_hash`
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn capabilities(&self) -> &AlgorithmCapabilities {
        &self.capabilities
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Hash a file with the default chunk size
    pub async fn hash_file(&self, path: &Path, algorithms: &[HashAlgorithm]) -> Result<HashResult> {
        let request = HashRequest::new(path, algorithms, self.chunk_size)?;
        self.hash(&request, None).await
    }

    /// Hash a file with every requested algorithm.
    ///
    /// The file either hashes completely or the call fails; no partial
    /// digests are ever returned.
    pub async fn hash(&self, request: &HashRequest, on_progress: Option<&ProgressCallback>) -> Result<HashResult> {
        if self.is_stopped() {
            return Err(ScanError::EngineStopped);
        }

        let (algorithms, degraded) = self.capabilities.resolve(&request.algorithms);
        if degraded {
            warn!(
                requested = ?request.algorithms,
                fallback = %HashAlgorithm::FALLBACK,
                "No requested hash algorithm available, using fallback"
            );
        }

        let states = algorithms.into_iter().map(DigestState::new).collect();
        let states = self
            .stream_file(&request.path, request.chunk_size, states, on_progress)
            .await
            .inspect_err(|err| debug!(path = %request.path.display(), error = %err, "Error hashing file"))?;

        let digests: BTreeMap<_, _> = states
            .into_iter()
            .map(|state| (state.algorithm(), state.finalize_hex()))
            .collect();

        debug!(
            path = %request.path.display(),
            algorithms = ?digests.keys().collect::<Vec<_>>(),
            "File hashed successfully"
        );
        Ok(HashResult { digests })
    }

    /// Single-algorithm digest for cheap pre-filtering.
    ///
    /// Prefers xxHash64, otherwise the fallback algorithm.
    pub async fn quick_hash(&self, path: &Path) -> Result<String> {
        if self.is_stopped() {
            return Err(ScanError::EngineStopped);
        }

        let algorithm = if self.capabilities.is_available(HashAlgorithm::Xxhash64) {
            HashAlgorithm::Xxhash64
        } else {
            HashAlgorithm::FALLBACK
        };

        let mut states = self
            .stream_file(path, self.chunk_size, vec![DigestState::new(algorithm)], None)
            .await?;
        match states.pop() {
            Some(state) => Ok(state.finalize_hex()),
            None => Err(ScanError::StructuralFailure("quick hash produced no digest".into())),
        }
    }

    /// Wait for in-flight chunk work and release the pool. Later requests
    /// fail with `EngineStopped`.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        // Holding every permit means no chunk update is still running
        match self.pool.acquire_many(self.workers as u32).await {
            Ok(permits) => drop(permits),
            Err(_) => debug!("Hash pool already closed"),
        }
        self.pool.close();
        info!("Hash engine shutdown complete");
    }

    async fn stream_file(
        &self,
        path: &Path,
        chunk_size: usize,
        mut states: Vec<DigestState>,
        on_progress: Option<&ProgressCallback>,
    ) -> Result<Vec<DigestState>> {
        let mut file = File::open(path).await.map_err(|e| ScanError::from_io(path, e))?;
        let total_bytes = file
            .metadata()
            .await
            .map_err(|e| ScanError::from_io(path, e))?
            .len();

        let mut bytes_done = 0u64;
        loop {
            let remaining = total_bytes.saturating_sub(bytes_done);
            let capacity = (chunk_size as u64).min(remaining.max(1)) as usize;
            let mut chunk = Vec::with_capacity(capacity);
            (&mut file)
                .take(chunk_size as u64)
                .read_to_end(&mut chunk)
                .await
                .map_err(|e| ScanError::from_io(path, e))?;

            if chunk.is_empty() {
                break;
            }

            bytes_done += chunk.len() as u64;
            states = self.update_on_pool(states, chunk).await?;

            if let Some(callback) = on_progress {
                let fraction = if total_bytes > 0 {
                    (bytes_done as f64 / total_bytes as f64).min(1.0)
                } else {
                    1.0
                };
                notify_progress(callback, HashProgress { fraction, bytes_done, total_bytes });
            }
        }

        Ok(states)
    }

    /// Feed one chunk to every digest on the worker pool. The next chunk is
    /// not read until this returns.
    async fn update_on_pool(&self, mut states: Vec<DigestState>, chunk: Vec<u8>) -> Result<Vec<DigestState>> {
        let _permit = self.pool.acquire().await.map_err(|_| ScanError::EngineStopped)?;
        let states = tokio::task::spawn_blocking(move || {
            for state in states.iter_mut() {
                state.update(&chunk);
            }
            states
        })
        .await?;
        Ok(states)
    }
}

impl Default for HashEngine {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_WORKERS)
    }
}

fn notify_progress(callback: &ProgressCallback, progress: HashProgress) {
    match catch_unwind(AssertUnwindSafe(|| callback(progress))) {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Progress callback failed"),
        Err(_) => warn!("Progress callback panicked"),
    }
}
