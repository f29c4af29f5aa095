//! Data models for the duplicate scanner

use crate::{error::ScanError, HashAlgorithm, Result};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Identifier handed out by the registry; never reused within a process
pub type ScanId = u64;

// Timestamps are exchanged as signed whole seconds since the epoch
pub(crate) fn to_epoch_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(after) => i64::try_from(after.as_secs()).unwrap_or(i64::MAX),
        Err(err) => i64::try_from(err.duration().as_secs()).map(|secs| -secs).unwrap_or(i64::MIN),
    }
}

pub(crate) fn from_epoch_secs(secs: i64) -> SystemTime {
    let offset = Duration::from_secs(secs.unsigned_abs());
    let time = if secs >= 0 {
        UNIX_EPOCH.checked_add(offset)
    } else {
        UNIX_EPOCH.checked_sub(offset)
    };
    time.unwrap_or(UNIX_EPOCH)
}

pub(crate) fn serialize_systemtime<S>(time: &SystemTime, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(to_epoch_secs(*time))
}

pub(crate) fn deserialize_systemtime<'de, D>(deserializer: D) -> std::result::Result<SystemTime, D::Error>
where
    D: Deserializer<'de>,
{
    let secs = i64::deserialize(deserializer)?;
    Ok(from_epoch_secs(secs))
}

pub(crate) fn serialize_optional_systemtime<S>(
    time: &Option<SystemTime>,
    serializer: S,
) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    match time {
        Some(t) => serializer.serialize_some(&to_epoch_secs(*t)),
        None => serializer.serialize_none(),
    }
}

pub(crate) fn deserialize_optional_systemtime<'de, D>(
    deserializer: D,
) -> std::result::Result<Option<SystemTime>, D::Error>
where
    D: Deserializer<'de>,
{
    let secs: Option<i64> = Option::deserialize(deserializer)?;
    Ok(secs.map(from_epoch_secs))
}

fn deserialize_algorithms<'de, D>(deserializer: D) -> std::result::Result<Vec<HashAlgorithm>, D::Error>
where
    D: Deserializer<'de>,
{
    let names: Vec<String> = Vec::deserialize(deserializer)?;
    Ok(HashAlgorithm::parse_list(names))
}

/// A file produced by discovery
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveredFile {
    /// Absolute file path
    pub path: PathBuf,
    /// File size in bytes
    pub size: u64,
    /// Last modification timestamp
    #[serde(serialize_with = "serialize_systemtime", deserialize_with = "deserialize_systemtime")]
    pub modified_time: SystemTime,
}

impl DiscoveredFile {
    pub fn new(path: PathBuf, size: u64, modified_time: SystemTime) -> Self {
        Self { path, size, modified_time }
    }

    /// Get the file name
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    /// Get the file extension
    pub fn extension(&self) -> Option<&str> {
        self.path.extension().and_then(|ext| ext.to_str())
    }
}

/// Categories of recoverable errors recorded during a scan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    NotFound,
    Permission,
    FileSystem,
    HashComputation,
}

/// A per-file or per-subtree error that did not stop the scan
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileError {
    /// Error message
    pub message: String,
    /// Path the error relates to (if known)
    pub path: Option<PathBuf>,
    /// Error category
    pub category: ErrorCategory,
}

impl FileError {
    pub fn new(message: impl Into<String>, path: Option<PathBuf>, category: ErrorCategory) -> Self {
        Self {
            message: message.into(),
            path,
            category,
        }
    }

    /// Record a hashing failure for `path`
    pub fn from_hash_error(path: PathBuf, err: &ScanError) -> Self {
        let category = match err {
            ScanError::NotFound(_) => ErrorCategory::NotFound,
            ScanError::Permission(_) => ErrorCategory::Permission,
            _ => ErrorCategory::HashComputation,
        };
        Self::new(err.to_string(), Some(path), category)
    }
}

/// Caller-supplied description of a scan; copied into the coordinator at start
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanConfig {
    /// Root paths to scan
    pub paths: Vec<PathBuf>,
    /// Requested algorithms, first-seen order, unknown names dropped
    #[serde(default, deserialize_with = "deserialize_algorithms")]
    pub algorithms: Vec<HashAlgorithm>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Read chunk size override
    #[serde(default)]
    pub chunk_size: Option<usize>,
    /// Maximum files hashed concurrently by this scan
    #[serde(default)]
    pub workers: Option<usize>,
    /// Glob patterns excluded from discovery
    #[serde(default)]
    pub exclude_patterns: Vec<String>,
}

impl ScanConfig {
    /// Create a scan over `paths` with default settings
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            paths: paths.into_iter().map(Into::into).collect(),
            algorithms: Vec::new(),
            name: None,
            description: None,
            chunk_size: None,
            workers: None,
            exclude_patterns: Vec::new(),
        }
    }

    /// Set the algorithm list
    pub fn algorithms<I>(mut self, algorithms: I) -> Self
    where
        I: IntoIterator<Item = HashAlgorithm>,
    {
        self.algorithms.clear();
        for algorithm in algorithms {
            if !self.algorithms.contains(&algorithm) {
                self.algorithms.push(algorithm);
            }
        }
        self
    }

    /// Set the display name
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the chunk size override
    pub fn chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = Some(chunk_size);
        self
    }

    /// Set the per-scan parallelism override
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Add a discovery exclude pattern
    pub fn exclude_pattern<S: Into<String>>(mut self, pattern: S) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    /// Reject malformed configurations before any state exists
    pub fn validate(&self) -> Result<()> {
        if self.paths.is_empty() {
            return Err(ScanError::InvalidConfig("at least one path must be specified".into()));
        }
        if self.chunk_size == Some(0) {
            return Err(ScanError::InvalidConfig("chunk size must be positive".into()));
        }
        if self.workers == Some(0) {
            return Err(ScanError::InvalidConfig("worker count must be positive".into()));
        }
        Ok(())
    }
}

/// Lifecycle state of a scan
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ScanState {
    /// Terminal states are sticky
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Completed | ScanState::Failed | ScanState::Cancelled)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: ScanState) -> bool {
        match (self, next) {
            (ScanState::Pending, ScanState::Running) => true,
            (ScanState::Pending, ScanState::Cancelled) => true,
            (ScanState::Running, next) => next.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanState::Pending => "pending",
            ScanState::Running => "running",
            ScanState::Completed => "completed",
            ScanState::Failed => "failed",
            ScanState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Live counters for one scan
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanProgress {
    /// Files found by discovery; set once discovery finishes
    pub files_discovered: u64,
    /// Files attempted so far, successful or not
    pub files_processed: u64,
    /// Files whose hashing failed
    pub files_failed: u64,
    /// Buckets in the hash index that already hold more than one file
    pub duplicate_groups: u64,
    /// Bytes hashed by successfully processed files
    pub bytes_processed: u64,
    /// File currently being hashed
    pub current_file: Option<PathBuf>,
}

impl ScanProgress {
    /// Calculate progress percentage (0.0 to 100.0)
    pub fn progress_percentage(&self) -> f64 {
        if self.files_discovered == 0 {
            0.0
        } else {
            (self.files_processed as f64 / self.files_discovered as f64 * 100.0).min(100.0)
        }
    }
}

/// A hashed file as stored in the index and in duplicate groups
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub name: String,
    pub extension: Option<String>,
    pub size: u64,
    #[serde(serialize_with = "serialize_systemtime", deserialize_with = "deserialize_systemtime")]
    pub modified_time: SystemTime,
    /// Every digest computed for the file
    pub hashes: BTreeMap<HashAlgorithm, String>,
}

impl FileEntry {
    pub fn new(file: &DiscoveredFile, hashes: BTreeMap<HashAlgorithm, String>) -> Self {
        Self {
            path: file.path.clone(),
            name: file.file_name().unwrap_or_default().to_string(),
            extension: file.extension().map(|ext| ext.to_lowercase()),
            size: file.size,
            modified_time: file.modified_time,
            hashes,
        }
    }
}

/// A group of files with identical content
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DuplicateGroup {
    /// Unique identifier for the group
    pub id: String,
    /// Digest shared by every member
    pub hash: String,
    /// Algorithm that produced `hash`
    pub algorithm: HashAlgorithm,
    /// All members
    pub files: Vec<FileEntry>,
    pub file_count: u64,
    /// Size of one member in bytes
    pub total_size: u64,
    /// Bytes reclaimable by keeping a single copy
    pub space_wasted: u64,
    /// 0-100 match certainty; 100 for exact digest matches
    pub confidence_score: u8,
    pub similarity_type: String,
}

impl DuplicateGroup {
    /// Create a group from the members of one hash bucket
    pub fn new(algorithm: HashAlgorithm, hash: String, files: Vec<FileEntry>) -> Self {
        let total_size = files.first().map(|f| f.size).unwrap_or(0);
        let file_count = files.len() as u64;
        let space_wasted = total_size * file_count.saturating_sub(1);

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            hash,
            algorithm,
            files,
            file_count,
            total_size,
            space_wasted,
            confidence_score: 100,
            similarity_type: "exact".to_string(),
        }
    }
}

/// Summary counts of a finished scan
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ScanSummary {
    pub files_discovered: u64,
    pub files_processed: u64,
    pub files_failed: u64,
    pub duplicate_groups: u64,
    pub duplicate_files: u64,
    pub space_wasted: u64,
}

impl ScanSummary {
    /// Derive totals from the progress counters and the finalized groups
    pub fn from_groups(progress: &ScanProgress, groups: &[DuplicateGroup]) -> Self {
        Self {
            files_discovered: progress.files_discovered,
            files_processed: progress.files_processed,
            files_failed: progress.files_failed,
            duplicate_groups: groups.len() as u64,
            duplicate_files: groups.iter().map(|g| g.file_count).sum(),
            space_wasted: groups.iter().map(|g| g.space_wasted).sum(),
        }
    }
}

/// Point-in-time view of a scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanStatus {
    pub scan_id: ScanId,
    pub name: String,
    pub description: Option<String>,
    pub state: ScanState,
    pub progress: ScanProgress,
    /// Failure message for scans in the `failed` state
    pub error: Option<String>,
    pub algorithms: Vec<HashAlgorithm>,
    pub paths: Vec<PathBuf>,
    #[serde(serialize_with = "serialize_systemtime", deserialize_with = "deserialize_systemtime")]
    pub created_at: SystemTime,
    #[serde(
        serialize_with = "serialize_optional_systemtime",
        deserialize_with = "deserialize_optional_systemtime"
    )]
    pub started_at: Option<SystemTime>,
    #[serde(
        serialize_with = "serialize_optional_systemtime",
        deserialize_with = "deserialize_optional_systemtime"
    )]
    pub completed_at: Option<SystemTime>,
}

impl ScanStatus {
    /// Seconds between start and completion (or now, while running)
    pub fn elapsed_seconds(&self) -> f64 {
        let Some(started) = self.started_at else {
            return 0.0;
        };
        let end = self.completed_at.unwrap_or_else(SystemTime::now);
        end.duration_since(started).map(|d| d.as_secs_f64()).unwrap_or(0.0)
    }
}

/// Finalized result of a completed scan, handed to persistence and reports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanReport {
    pub status: ScanStatus,
    pub summary: ScanSummary,
    pub duplicate_groups: Vec<DuplicateGroup>,
    pub errors: Vec<FileError>,
}
