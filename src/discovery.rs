//! Lazy recursive file discovery across one or more roots

use crate::models::{DiscoveredFile, ErrorCategory, FileError};
use glob::Pattern;
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::{DirEntry, FilterEntry, WalkDir};

/// Filters applied on top of the always-on hidden and zero-byte exclusions
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DiscoveryOptions {
    /// Glob patterns matched against the full path and the file name
    pub exclude_patterns: Vec<String>,
    /// Files larger than this many bytes are skipped
    pub max_file_size: Option<u64>,
    /// Follow symbolic links while walking
    pub follow_symlinks: bool,
    /// Maximum directory depth below each root
    pub max_depth: Option<usize>,
}

impl DiscoveryOptions {
    pub fn exclude_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.exclude_patterns.push(pattern.into());
        self
    }

    pub fn max_file_size(mut self, max: u64) -> Self {
        self.max_file_size = Some(max);
        self
    }

    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = Some(depth);
        self
    }
}

/// Enumerates eligible files under a set of roots
#[derive(Debug, Clone, Default)]
pub struct FileDiscoverer {
    options: DiscoveryOptions,
}

impl FileDiscoverer {
    pub fn new(options: DiscoveryOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DiscoveryOptions {
        &self.options
    }

    /// Start a fresh walk over `roots`. Nothing touches the filesystem until
    /// the returned iterator is polled.
    pub fn discover<I, P>(&self, roots: I) -> Discovery
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let roots: Vec<PathBuf> = roots.into_iter().map(Into::into).collect();
        let exclusions = self
            .options
            .exclude_patterns
            .iter()
            .map(|raw| match Pattern::new(raw) {
                Ok(pattern) => Exclusion::Glob(pattern),
                Err(err) => {
                    warn!(pattern = %raw, error = %err, "Invalid exclude pattern, matching as substring");
                    Exclusion::Substring(raw.clone())
                }
            })
            .collect();

        Discovery {
            root_count: roots.len(),
            roots: roots.into_iter(),
            walk: None,
            options: self.options.clone(),
            exclusions,
            seen: HashSet::new(),
            errors: Vec::new(),
            resolved_roots: 0,
        }
    }
}

#[derive(Debug, Clone)]
enum Exclusion {
    Glob(Pattern),
    Substring(String),
}

impl Exclusion {
    fn matches(&self, path: &Path) -> bool {
        let path_str = path.to_string_lossy();
        match self {
            Exclusion::Glob(pattern) => {
                pattern.matches(&path_str)
                    || path
                        .file_name()
                        .map(|name| pattern.matches(&name.to_string_lossy()))
                        .unwrap_or(false)
            }
            Exclusion::Substring(needle) => path_str.contains(needle.as_str()),
        }
    }
}

type VisibleWalk = FilterEntry<walkdir::IntoIter, fn(&DirEntry) -> bool>;

/// An in-progress walk. Yields each eligible file exactly once and collects
/// every per-entry error it steps over.
pub struct Discovery {
    roots: std::vec::IntoIter<PathBuf>,
    walk: Option<VisibleWalk>,
    options: DiscoveryOptions,
    exclusions: Vec<Exclusion>,
    seen: HashSet<PathBuf>,
    errors: Vec<FileError>,
    root_count: usize,
    resolved_roots: usize,
}

/// Everything a completed walk produced
#[derive(Debug, Clone, Default)]
pub struct DiscoveryOutcome {
    pub files: Vec<DiscoveredFile>,
    pub errors: Vec<FileError>,
    pub root_count: usize,
    pub resolved_roots: usize,
}

impl DiscoveryOutcome {
    /// True when roots were given but none of them could be opened
    pub fn no_roots_resolved(&self) -> bool {
        self.root_count > 0 && self.resolved_roots == 0
    }
}

impl Discovery {
    /// Errors recorded so far
    pub fn errors(&self) -> &[FileError] {
        &self.errors
    }

    /// Number of roots that existed and could be opened so far
    pub fn resolved_roots(&self) -> usize {
        self.resolved_roots
    }

    /// Drain the walk and return files plus errors
    pub fn finish(mut self) -> DiscoveryOutcome {
        let files: Vec<DiscoveredFile> = self.by_ref().collect();
        debug!(
            files = files.len(),
            errors = self.errors.len(),
            roots = self.root_count,
            resolved = self.resolved_roots,
            "Discovery finished"
        );
        DiscoveryOutcome {
            files,
            errors: self.errors,
            root_count: self.root_count,
            resolved_roots: self.resolved_roots,
        }
    }

    fn open_root(&mut self, root: PathBuf) -> Option<DiscoveredFile> {
        let root = match fs::canonicalize(&root) {
            Ok(path) => path,
            Err(err) => {
                self.record_io_error(&root, &err, "Cannot resolve scan root");
                return None;
            }
        };

        let metadata = match fs::metadata(&root) {
            Ok(metadata) => metadata,
            Err(err) => {
                self.record_io_error(&root, &err, "Cannot read scan root");
                return None;
            }
        };
        self.resolved_roots += 1;

        if metadata.is_file() {
            if root.file_name().map(is_hidden).unwrap_or(false) {
                return None;
            }
            return self.accept_file(root, &metadata);
        }

        if metadata.is_dir() {
            let mut walker = WalkDir::new(&root).follow_links(self.options.follow_symlinks);
            if let Some(depth) = self.options.max_depth {
                walker = walker.max_depth(depth);
            }
            self.walk = Some(walker.into_iter().filter_entry(is_visible as fn(&DirEntry) -> bool));
        } else {
            debug!(path = %root.display(), "Skipping scan root that is neither a file nor a directory");
        }
        None
    }

    fn accept_entry(&mut self, entry: DirEntry) -> Option<DiscoveredFile> {
        let file_type = entry.file_type();
        if file_type.is_dir() || (file_type.is_symlink() && !self.options.follow_symlinks) {
            return None;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                self.record_walk_error(err);
                return None;
            }
        };
        if !metadata.is_file() {
            return None;
        }

        self.accept_file(entry.into_path(), &metadata)
    }

    fn accept_file(&mut self, path: PathBuf, metadata: &fs::Metadata) -> Option<DiscoveredFile> {
        let size = metadata.len();
        if size == 0 {
            return None;
        }
        if let Some(max) = self.options.max_file_size {
            if size > max {
                debug!(path = %path.display(), size, max, "Skipping file above size limit");
                return None;
            }
        }
        if self.exclusions.iter().any(|exclusion| exclusion.matches(&path)) {
            return None;
        }
        if !self.seen.insert(path.clone()) {
            return None;
        }

        let modified_time = metadata.modified().unwrap_or(std::time::UNIX_EPOCH);
        Some(DiscoveredFile::new(path, size, modified_time))
    }

    fn record_walk_error(&mut self, err: walkdir::Error) {
        let path = err.path().map(Path::to_path_buf);
        let category = match err.io_error().map(io::Error::kind) {
            Some(io::ErrorKind::PermissionDenied) => ErrorCategory::Permission,
            Some(io::ErrorKind::NotFound) => ErrorCategory::NotFound,
            _ => ErrorCategory::FileSystem,
        };
        warn!(path = ?path, error = %err, "Error walking directory");
        self.errors.push(FileError::new(format!("Error walking directory: {}", err), path, category));
    }

    fn record_io_error(&mut self, path: &Path, err: &io::Error, context: &str) {
        let category = match err.kind() {
            io::ErrorKind::PermissionDenied => ErrorCategory::Permission,
            io::ErrorKind::NotFound => ErrorCategory::NotFound,
            _ => ErrorCategory::FileSystem,
        };
        warn!(path = %path.display(), error = %err, "{}", context);
        self.errors.push(FileError::new(
            format!("{} {}: {}", context, path.display(), err),
            Some(path.to_path_buf()),
            category,
        ));
    }
}

impl Iterator for Discovery {
    type Item = DiscoveredFile;

    fn next(&mut self) -> Option<DiscoveredFile> {
        loop {
            if let Some(walk) = self.walk.as_mut() {
                match walk.next() {
                    Some(Ok(entry)) => {
                        if let Some(file) = self.accept_entry(entry) {
                            return Some(file);
                        }
                    }
                    Some(Err(err)) => self.record_walk_error(err),
                    None => self.walk = None,
                }
                continue;
            }

            let root = self.roots.next()?;
            if let Some(file) = self.open_root(root) {
                return Some(file);
            }
        }
    }
}

fn is_hidden(name: &OsStr) -> bool {
    name.to_string_lossy().starts_with('.')
}

/// Prunes hidden entries and the subtrees below hidden directories. The root
/// itself is always walked.
fn is_visible(entry: &DirEntry) -> bool {
    entry.depth() == 0 || !is_hidden(entry.file_name())
}
