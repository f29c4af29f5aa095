//! Duplicate Scanner
//!
//! Discovers duplicate files across one or more filesystem roots by hashing
//! file contents and grouping files that share a digest. This library provides
//! the hashing engine, file discovery, scan orchestration, the scan registry
//! and live progress fan-out.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod coordinator;
pub mod discovery;
pub mod error;
pub mod hash;
pub mod models;
pub mod progress;
pub mod registry;
pub mod report;
pub mod store;
pub mod web;

pub use coordinator::ScanCoordinator;
pub use error::ScanError;
pub use hash::HashEngine;
pub use models::*;
pub use progress::ProgressHub;
pub use registry::ScanRegistry;

/// Result type used throughout the library
pub type Result<T> = std::result::Result<T, ScanError>;

/// Default read chunk size for streaming digests (8 MiB)
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Default size of the shared hashing worker pool
pub const DEFAULT_WORKERS: usize = 4;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of permits in the shared hashing worker pool
    pub workers: usize,
    /// Chunk size used when a scan does not override it
    pub chunk_size: usize,
    /// Number of processed files between `scan_progress` events
    pub progress_interval: u64,
    /// Number of finished scans the registry keeps around
    pub history_capacity: usize,
    /// Files larger than this are skipped during discovery
    pub max_file_size: Option<u64>,
    /// Algorithms used when a scan requests none
    pub default_algorithms: Vec<HashAlgorithm>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval: 10,
            history_capacity: 64,
            max_file_size: Some(10 * 1024 * 1024 * 1024), // 10GB
            default_algorithms: vec![HashAlgorithm::Blake3, HashAlgorithm::Xxhash64],
        }
    }
}

impl Config {
    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(ScanError::InvalidConfig("worker count must be positive".into()));
        }
        if self.chunk_size == 0 {
            return Err(ScanError::InvalidConfig("chunk size must be positive".into()));
        }
        if self.progress_interval == 0 {
            return Err(ScanError::InvalidConfig("progress interval must be positive".into()));
        }
        Ok(())
    }
}

/// Hash algorithm options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// BLAKE3, the fast cryptographic primary key
    Blake3,
    /// 64-bit xxHash, fast non-cryptographic
    Xxhash64,
    /// SHA-256, slower verification hash and the guaranteed fallback
    Sha256,
    /// MD5, verification only
    Md5,
}

impl HashAlgorithm {
    /// Every algorithm this build knows about
    pub const ALL: [HashAlgorithm; 4] = [
        HashAlgorithm::Blake3,
        HashAlgorithm::Xxhash64,
        HashAlgorithm::Sha256,
        HashAlgorithm::Md5,
    ];

    /// Order in which a file's digests are considered for the grouping key
    pub const PRIMARY_PREFERENCE: [HashAlgorithm; 4] = [
        HashAlgorithm::Blake3,
        HashAlgorithm::Xxhash64,
        HashAlgorithm::Sha256,
        HashAlgorithm::Md5,
    ];

    /// Algorithm that is always available and used when nothing else is
    pub const FALLBACK: HashAlgorithm = HashAlgorithm::Sha256;

    /// Identifier used on the wire and in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::Blake3 => "blake3",
            HashAlgorithm::Xxhash64 => "xxhash64",
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Md5 => "md5",
        }
    }

    /// Parse a list of identifiers, dropping unknown names and duplicates
    /// while keeping the first-seen order
    pub fn parse_list<I, S>(names: I) -> Vec<HashAlgorithm>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut algorithms = Vec::new();
        for name in names {
            match name.as_ref().parse::<HashAlgorithm>() {
                Ok(algorithm) if !algorithms.contains(&algorithm) => algorithms.push(algorithm),
                Ok(_) => {}
                Err(_) => tracing::debug!(algorithm = name.as_ref(), "ignoring unknown hash algorithm"),
            }
        }
        algorithms
    }
}

impl std::fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "blake3" => Ok(HashAlgorithm::Blake3),
            "xxhash64" | "xxh64" | "xxhash" => Ok(HashAlgorithm::Xxhash64),
            "sha256" | "sha-256" => Ok(HashAlgorithm::Sha256),
            "md5" => Ok(HashAlgorithm::Md5),
            other => Err(ScanError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_drops_unknown_and_duplicates() {
        let parsed = HashAlgorithm::parse_list(["sha256", "whirlpool", "BLAKE3", "sha256", "xxh64"]);
        assert_eq!(
            parsed,
            vec![HashAlgorithm::Sha256, HashAlgorithm::Blake3, HashAlgorithm::Xxhash64]
        );
    }

    #[test]
    fn test_algorithm_display_matches_serde_name() {
        for algorithm in HashAlgorithm::ALL {
            let json = serde_json::to_string(&algorithm).unwrap();
            assert_eq!(json, format!("\"{}\"", algorithm));
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());

        let config = Config { workers: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ScanError::InvalidConfig(_))));

        let config = Config { chunk_size: 0, ..Config::default() };
        assert!(matches!(config.validate(), Err(ScanError::InvalidConfig(_))));
    }
}
