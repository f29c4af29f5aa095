//! Durable storage of finished scan results

use crate::{error::ScanError, models::ScanId, models::ScanReport, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Accepts a finalized scan result. Called from a blocking thread after the
/// scan has completed; failures never change the scan's state.
pub trait ResultStore: Send + Sync {
    fn store(&self, report: &ScanReport) -> Result<()>;
}

/// Writes one pretty-printed `scan-<id>.json` per completed scan
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// Create a store rooted at `dir`, creating the directory if needed
    pub fn new<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| ScanError::from_io(&dir, e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, scan_id: ScanId) -> PathBuf {
        self.dir.join(format!("scan-{}.json", scan_id))
    }

    /// Read back a stored report
    pub fn load(&self, scan_id: ScanId) -> Result<ScanReport> {
        let path = self.path_for(scan_id);
        let json = fs::read_to_string(&path).map_err(|e| ScanError::from_io(&path, e))?;
        Ok(serde_json::from_str(&json)?)
    }
}

impl ResultStore for JsonFileStore {
    fn store(&self, report: &ScanReport) -> Result<()> {
        let path = self.path_for(report.status.scan_id);
        let json = serde_json::to_string_pretty(report)?;

        // Write to a temporary file first so readers never see a partial report
        let temp = path.with_extension("json.tmp");
        fs::write(&temp, json).map_err(|e| ScanError::from_io(&temp, e))?;
        fs::rename(&temp, &path).map_err(|e| ScanError::from_io(&path, e))?;

        debug!(scan_id = report.status.scan_id, path = %path.display(), "Scan result stored");
        Ok(())
    }
}
