//! Directory scanner
//!
//! Builds raw archive requests from a directory tree, one request per copy
//! set of the requested archive set. Paths are recorded relative to the
//! scanned root.

use crate::archreq::priority::{file_priority, PriorityInputs};
use crate::archreq::{ArchReq, FileInfo};
use crate::config::{ArchiveSet, ConfigSnapshot};
use crate::error::{Result, RustArchiverError};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Debug, Clone)]
pub struct ScanOptions {
    pub root: PathBuf,
    /// File system name recorded on each request.
    pub fsname: String,
    /// Archive set base name, e.g. `home` for `home.1` and `home.2`.
    pub set: String,
    /// First request sequence number.
    pub first_seq: u32,
    pub follow_links: bool,
}

impl ScanOptions {
    pub fn new(root: impl Into<PathBuf>, fsname: &str, set: &str) -> Self {
        Self {
            root: root.into(),
            fsname: fsname.to_string(),
            set: set.to_string(),
            first_seq: 1,
            follow_links: false,
        }
    }
}

/// A regular file found below the root.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub path: String,
    pub size: u64,
    pub modtime: DateTime<Utc>,
    pub uid: u32,
    pub gid: u32,
}

#[cfg(unix)]
fn owner(meta: &std::fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (meta.uid(), meta.gid())
}

#[cfg(not(unix))]
fn owner(_meta: &std::fs::Metadata) -> (u32, u32) {
    (0, 0)
}

fn relative(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| RustArchiverError::parse(format!("{:?} is outside {:?}", path, root)))?;
    let parts: Vec<_> = rel.components().map(|c| c.as_os_str().to_string_lossy()).collect();
    Ok(parts.join("/"))
}

/// Walk `root` and collect regular files in path order. Unreadable
/// entries are logged and skipped.
pub fn walk(root: &Path, follow_links: bool) -> Result<Vec<ScannedFile>> {
    if !root.is_dir() {
        return Err(RustArchiverError::parameter_validation(format!(
            "{:?} is not a directory",
            root
        )));
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(follow_links).sort_by_file_name() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(e) => {
                warn!("Skipping {:?}: {}", entry.path(), e);
                continue;
            }
        };
        let modtime = meta.modified().map(DateTime::<Utc>::from).unwrap_or_else(|_| Utc::now());
        let (uid, gid) = owner(&meta);
        files.push(ScannedFile {
            path: relative(root, entry.path())?,
            size: meta.len(),
            modtime,
            uid,
            gid,
        });
    }
    debug!("Scanned {} files below {:?}", files.len(), root);
    Ok(files)
}

fn file_info(file: &ScannedFile, set: &ArchiveSet, now: DateTime<Utc>) -> FileInfo {
    let inputs = PriorityInputs {
        copy: set.copy.unwrap_or(1),
        age_secs: (now - file.modtime).num_milliseconds() as f64 / 1000.0,
        size: file.size,
        ..Default::default()
    };
    FileInfo::new(file.path.clone(), file.size, file.modtime)
        .with_owner(file.uid, file.gid)
        .with_priority(file_priority(&set.priorities, &inputs))
}

/// Build one request per copy set of `files`.
pub fn build_requests(config: &ConfigSnapshot, options: &ScanOptions, files: &[ScannedFile]) -> Result<Vec<ArchReq>> {
    let sets: Vec<&ArchiveSet> = config
        .copy_sets()
        .filter(|s| s.base_name() == options.set)
        .collect();
    if sets.is_empty() {
        return Err(RustArchiverError::config(format!(
            "archive set {} has no copies defined",
            options.set
        )));
    }
    if files.is_empty() {
        return Ok(Vec::new());
    }

    let now = Utc::now();
    let requests = sets
        .into_iter()
        .enumerate()
        .map(|(i, set)| {
            let mut ar = ArchReq::new(&options.fsname, &set.name, options.first_seq + i as u32, set.drives);
            for file in files {
                ar.add_file(file_info(file, set, now));
            }
            ar
        })
        .collect::<Vec<_>>();
    info!(
        "{} files below {:?} -> {} request(s)",
        files.len(),
        options.root,
        requests.len()
    );
    Ok(requests)
}

/// Walk the tree and build requests.
pub fn scan(config: &ConfigSnapshot, options: &ScanOptions) -> Result<Vec<ArchReq>> {
    let files = walk(&options.root, options.follow_links)?;
    build_requests(config, options, &files)
}
