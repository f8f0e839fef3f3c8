//! Archiver configuration
//!
//! Archive sets, media parameters, VSN pools and the static library table
//! are read from a TOML file and resolved into an immutable
//! [`ConfigSnapshot`]. Running components hold an `Arc` to the snapshot
//! they started with; [`ConfigHandle::publish`] swaps in a new one.

pub mod archive_set;
pub mod media;
pub mod vsn;

pub use archive_set::{
    split_copy, ArchiveSet, JoinMethod, OfflineCopy, OwnerKind, PriorityWeights, RecycleParams,
    ReserveMethod, SortMethod, ALLSETS, MAX_COPIES,
};
pub use media::{DeviceOp, MediaKind, MediaParams, MediaTimeouts, DISK_MTYPE, HONEYCOMB_MTYPE};
pub use vsn::{matches_any, VsnDesc, VsnPool};

use crate::error::{ConfigIssue, Result, RustArchiverError};
use crate::utils::parse_size;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// A size given either as a byte count or as text such as `"10M"`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl SizeValue {
    pub fn bytes(&self) -> Result<u64> {
        match self {
            SizeValue::Bytes(b) => Ok(*b),
            SizeValue::Text(t) => parse_size(t),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigFile {
    pub daemon: DaemonToml,
    pub media: Vec<MediaToml>,
    pub vsn_pool: Vec<VsnPoolToml>,
    pub archive_set: Vec<ArchiveSetToml>,
    pub library: Vec<LibraryToml>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonToml {
    pub schedule_interval: Option<u64>,
    pub device_interval: Option<u64>,
    pub max_stage_attempts: Option<u32>,
    pub queue_time_default: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MediaToml {
    pub mtype: String,
    pub archmax: Option<SizeValue>,
    pub ovflmin: Option<SizeValue>,
    #[serde(default)]
    pub timeouts: TimeoutsToml,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutsToml {
    pub read: Option<u64>,
    pub request: Option<u64>,
    pub stage: Option<u64>,
    pub write: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VsnPoolToml {
    pub name: String,
    pub vsns: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ArchiveSetToml {
    pub name: String,
    pub mtype: Option<String>,
    pub archmax: Option<SizeValue>,
    pub drives: Option<usize>,
    pub drivemax: Option<SizeValue>,
    pub drivemin: Option<SizeValue>,
    pub ovflmin: Option<SizeValue>,
    pub join: Option<String>,
    pub sort: Option<String>,
    pub offline_copy: Option<String>,
    pub reserve: Option<Vec<String>>,
    pub vsns: Option<Vec<String>>,
    pub vsn_pools: Option<Vec<String>>,
    pub fillvsns: Option<bool>,
    pub fillvsns_min: Option<SizeValue>,
    pub queue_time: Option<u64>,
    pub priority: PriorityToml,
    pub recycle: RecycleToml,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PriorityToml {
    pub age: Option<f64>,
    pub size: Option<f64>,
    pub copy1: Option<f64>,
    pub copy2: Option<f64>,
    pub copy3: Option<f64>,
    pub copy4: Option<f64>,
    pub copies: Option<f64>,
    pub rearchive: Option<f64>,
    pub immediate: Option<f64>,
    pub release: Option<f64>,
    pub loaded: Option<f64>,
    pub offline: Option<f64>,
    pub overflow: Option<f64>,
    pub queue_wait: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecycleToml {
    pub hwm: Option<u8>,
    pub mingain: Option<u8>,
    pub vsncount: Option<u32>,
    pub dataquantity: Option<SizeValue>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LibraryToml {
    pub name: String,
    pub eq: u32,
    pub kind: String,
    #[serde(default)]
    pub simulated: bool,
    #[serde(default = "default_true")]
    pub available: bool,
    pub drives_allow: Option<usize>,
    /// Concurrent copy streams for disk and honeycomb libraries.
    pub streams: Option<usize>,
    #[serde(default)]
    pub drive: Vec<DriveToml>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DriveToml {
    pub name: String,
    pub eq: u32,
    #[serde(default = "default_true")]
    pub available: bool,
    pub mtype: Option<String>,
    pub vsn: Option<String>,
}

fn default_true() -> bool {
    true
}

macro_rules! inherit {
    ($child:expr, $parent:expr, $($field:ident),+ $(,)?) => {{
        let child = &mut $child;
        let parent = &$parent;
        $(
            if child.$field.is_none() {
                child.$field = parent.$field.clone();
            }
        )+
    }};
}

impl ArchiveSetToml {
    /// Fill every unset field from `parent`.
    fn inherit_from(&mut self, parent: &ArchiveSetToml) {
        inherit!(
            *self, *parent, mtype, archmax, drives, drivemax, drivemin, ovflmin, join, sort,
            offline_copy, reserve, vsns, vsn_pools, fillvsns, fillvsns_min, queue_time,
        );
        inherit!(
            self.priority, parent.priority, age, size, copy1, copy2, copy3, copy4, copies,
            rearchive, immediate, release, loaded, offline, overflow, queue_wait,
        );
        inherit!(self.recycle, parent.recycle, hwm, mingain, vsncount, dataquantity);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibraryKind {
    Robot,
    Manual,
    Disk,
    Honeycomb,
    Historian,
}

impl LibraryKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "robot" => LibraryKind::Robot,
            "manual" => LibraryKind::Manual,
            "disk" => LibraryKind::Disk,
            "honeycomb" => LibraryKind::Honeycomb,
            "historian" => LibraryKind::Historian,
            _ => return None,
        })
    }

    pub fn is_disk_like(self) -> bool {
        matches!(self, LibraryKind::Disk | LibraryKind::Honeycomb)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveConfig {
    pub name: String,
    pub eq: u32,
    pub available: bool,
    pub loaded: Option<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryConfig {
    pub name: String,
    pub eq: u32,
    pub kind: LibraryKind,
    pub simulated: bool,
    pub available: bool,
    pub drives_allow: Option<usize>,
    pub drives: Vec<DriveConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DaemonParams {
    pub schedule_interval: Duration,
    pub device_interval: Duration,
    pub max_stage_attempts: u32,
    pub queue_time_default: Duration,
}

impl Default for DaemonParams {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(10),
            device_interval: Duration::from_secs(60),
            max_stage_attempts: 3,
            queue_time_default: Duration::from_secs(24 * 3600),
        }
    }
}

/// Immutable resolved configuration.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub version: u64,
    pub daemon: DaemonParams,
    pub media: BTreeMap<String, MediaParams>,
    pub pools: BTreeMap<String, Arc<VsnPool>>,
    /// Archive set table; `allsets` is always entry 0.
    pub sets: Vec<ArchiveSet>,
    pub libraries: Vec<LibraryConfig>,
}

impl ConfigSnapshot {
    pub fn archive_set(&self, name: &str) -> Option<&ArchiveSet> {
        self.sets.iter().find(|s| s.name == name)
    }

    pub fn media_params(&self, mtype: &str) -> MediaParams {
        self.media
            .get(mtype)
            .cloned()
            .unwrap_or_else(|| MediaParams::defaults(mtype))
    }

    /// Archive file size for a set, falling back to its media default.
    pub fn archmax(&self, set: &ArchiveSet) -> u64 {
        match (set.archmax, set.mtype.as_deref()) {
            (Some(a), _) => a,
            (None, Some(mtype)) => self.media_params(mtype).archmax,
            (None, None) => MediaParams::defaults("").archmax,
        }
    }

    /// Minimum overflow file size, `None` when volume overflow is not allowed.
    pub fn ovflmin(&self, set: &ArchiveSet, mtype: &str) -> Option<u64> {
        let ovflmin = match set.ovflmin {
            Some(v) => v,
            None => self.media_params(mtype).ovflmin?,
        };
        Some(ovflmin.max(1))
    }

    pub fn drivemax(&self, set: &ArchiveSet) -> u64 {
        set.drivemax.unwrap_or(u64::MAX)
    }

    /// Sets that can actually receive archive copies.
    pub fn copy_sets(&self) -> impl Iterator<Item = &ArchiveSet> {
        self.sets
            .iter()
            .filter(|s| s.copy.is_some() && !s.name.starts_with(ALLSETS))
    }

    /// The set receiving copy `copy` of files of archive set `base`.
    pub fn copy_set(&self, base: &str, copy: u8) -> Option<&ArchiveSet> {
        self.archive_set(&format!("{}.{}", base, copy))
    }
}

impl Default for ConfigSnapshot {
    fn default() -> Self {
        let mut issues = Vec::new();
        let allsets = resolve_set(&default_allsets(), &BTreeMap::new(), &DaemonParams::default(), &mut issues);
        Self {
            version: 0,
            daemon: DaemonParams::default(),
            media: BTreeMap::new(),
            pools: BTreeMap::new(),
            sets: vec![allsets],
            libraries: Vec::new(),
        }
    }
}

/// Shared, atomically replaceable configuration.
#[derive(Debug)]
pub struct ConfigHandle {
    current: RwLock<Arc<ConfigSnapshot>>,
}

impl ConfigHandle {
    pub fn new(snapshot: ConfigSnapshot) -> Self {
        Self {
            current: RwLock::new(Arc::new(snapshot)),
        }
    }

    pub fn current(&self) -> Arc<ConfigSnapshot> {
        self.current.read().clone()
    }

    /// Install a new snapshot and return its version.
    pub fn publish(&self, mut snapshot: ConfigSnapshot) -> u64 {
        let mut guard = self.current.write();
        snapshot.version = guard.version + 1;
        let version = snapshot.version;
        *guard = Arc::new(snapshot);
        info!("Published configuration version {}", version);
        version
    }
}

/// Read and resolve a configuration file.
pub fn load(path: &Path) -> Result<ConfigSnapshot> {
    debug!("Loading configuration from {:?}", path);
    let text = std::fs::read_to_string(path)?;
    parse(&text)
}

pub fn parse(text: &str) -> Result<ConfigSnapshot> {
    let file: ConfigFile = toml::from_str(text)?;
    resolve(file)
}

/// Resolve a parsed file. All problems are collected before failing.
pub fn resolve(file: ConfigFile) -> Result<ConfigSnapshot> {
    let mut issues = Vec::new();

    let daemon = resolve_daemon(&file.daemon, &mut issues);

    let mut media = BTreeMap::new();
    for m in &file.media {
        let ctx = format!("media {}", m.mtype);
        if media.contains_key(&m.mtype) {
            push_issue(&mut issues, &ctx, "duplicate media definition");
            continue;
        }
        let mut params = MediaParams::defaults(&m.mtype);
        if let Some(v) = size_field(&m.archmax, &ctx, "archmax", &mut issues) {
            params.archmax = v;
        }
        params.ovflmin = size_field(&m.ovflmin, &ctx, "ovflmin", &mut issues);
        let t = &m.timeouts;
        let secs = Duration::from_secs;
        params.timeouts.read = t.read.map(secs).unwrap_or(params.timeouts.read);
        params.timeouts.request = t.request.map(secs).unwrap_or(params.timeouts.request);
        params.timeouts.stage = t.stage.map(secs).unwrap_or(params.timeouts.stage);
        params.timeouts.write = t.write.map(secs).unwrap_or(params.timeouts.write);
        media.insert(m.mtype.clone(), params);
    }

    let mut pools = BTreeMap::new();
    for p in &file.vsn_pool {
        let ctx = format!("vsn_pool {}", p.name);
        if pools.contains_key(&p.name) {
            push_issue(&mut issues, &ctx, "duplicate pool");
            continue;
        }
        match VsnPool::new(&p.name, &p.vsns) {
            Ok(pool) => {
                pools.insert(p.name.clone(), Arc::new(pool));
            }
            Err(e) => push_issue(&mut issues, &ctx, e),
        }
    }

    let mut raw: Vec<ArchiveSetToml> = Vec::new();
    for s in &file.archive_set {
        if raw.iter().any(|r| r.name == s.name) {
            push_issue(&mut issues, format!("archive_set {}", s.name), "duplicate archive set");
            continue;
        }
        raw.push(s.clone());
    }
    if let Some(pos) = raw.iter().position(|r| r.name == ALLSETS) {
        let allsets = raw.remove(pos);
        raw.insert(0, allsets);
    } else {
        raw.insert(0, default_allsets());
    }

    let allsets = raw[0].clone();
    let mut sets = Vec::with_capacity(raw.len());
    for (i, set) in raw.iter().enumerate() {
        let mut merged = set.clone();
        if i != 0 {
            let (base, copy) = split_copy(&set.name);
            if base != ALLSETS {
                if let Some(copy) = copy {
                    let copy_defaults = format!("{}.{}", ALLSETS, copy);
                    if let Some(parent) = raw.iter().find(|r| r.name == copy_defaults) {
                        merged.inherit_from(parent);
                    }
                }
            }
            merged.inherit_from(&allsets);
        }
        sets.push(resolve_set(&merged, &pools, &daemon, &mut issues));
    }

    let mut libraries = Vec::new();
    for lib in &file.library {
        if let Some(l) = resolve_library(lib, &mut issues) {
            if libraries.iter().any(|o: &LibraryConfig| o.eq == l.eq) {
                push_issue(&mut issues, format!("library {}", l.name), "duplicate equipment number");
                continue;
            }
            libraries.push(l);
        }
    }

    if !issues.is_empty() {
        for issue in &issues {
            warn!("Configuration: {}", issue);
        }
        return Err(RustArchiverError::ConfigErrors {
            count: issues.len(),
            issues,
        });
    }

    info!(
        "Configuration resolved: {} archive sets, {} media, {} pools, {} libraries",
        sets.len(),
        media.len(),
        pools.len(),
        libraries.len()
    );

    Ok(ConfigSnapshot {
        version: 1,
        daemon,
        media,
        pools,
        sets,
        libraries,
    })
}

fn default_allsets() -> ArchiveSetToml {
    ArchiveSetToml {
        name: ALLSETS.to_string(),
        ..Default::default()
    }
}

fn push_issue(issues: &mut Vec<ConfigIssue>, context: impl Into<String>, message: impl Into<String>) {
    issues.push(ConfigIssue {
        context: context.into(),
        message: message.into(),
    });
}

fn size_field(
    value: &Option<SizeValue>,
    ctx: &str,
    field: &str,
    issues: &mut Vec<ConfigIssue>,
) -> Option<u64> {
    match value.as_ref().map(SizeValue::bytes) {
        Some(Ok(v)) => Some(v),
        Some(Err(e)) => {
            push_issue(issues, ctx, format!("{}: {}", field, e));
            None
        }
        None => None,
    }
}

fn resolve_daemon(d: &DaemonToml, issues: &mut Vec<ConfigIssue>) -> DaemonParams {
    let mut params = DaemonParams::default();
    if let Some(s) = d.schedule_interval {
        params.schedule_interval = Duration::from_secs(s.max(1));
    }
    if let Some(s) = d.device_interval {
        params.device_interval = Duration::from_secs(s.max(1));
    }
    if let Some(n) = d.max_stage_attempts {
        if n == 0 {
            push_issue(issues, "daemon", "max_stage_attempts must be at least 1");
        } else {
            params.max_stage_attempts = n;
        }
    }
    if let Some(s) = d.queue_time_default {
        params.queue_time_default = Duration::from_secs(s);
    }
    params
}

fn resolve_set(
    raw: &ArchiveSetToml,
    pools: &BTreeMap<String, Arc<VsnPool>>,
    daemon: &DaemonParams,
    issues: &mut Vec<ConfigIssue>,
) -> ArchiveSet {
    let ctx = format!("archive_set {}", raw.name);
    let (base, copy) = split_copy(&raw.name);
    if let Some(c) = copy {
        if c == 0 || c > MAX_COPIES {
            push_issue(issues, &ctx, format!("copy number {} out of range 1..{}", c, MAX_COPIES));
        }
    }
    if raw.name.is_empty() {
        push_issue(issues, &ctx, "missing name");
    }

    let mtype = raw.mtype.clone();
    if base != ALLSETS && copy.is_some() && mtype.is_none() {
        push_issue(issues, &ctx, "no media type");
    }

    let drives = raw.drives.unwrap_or(1);
    if drives == 0 {
        push_issue(issues, &ctx, "drives must be at least 1");
    }

    let join = match raw.join.as_deref() {
        None => JoinMethod::None,
        Some(s) => JoinMethod::parse(s).unwrap_or_else(|| {
            push_issue(issues, &ctx, format!("unknown join method '{}'", s));
            JoinMethod::None
        }),
    };
    let sort = match raw.sort.as_deref() {
        None => SortMethod::None,
        Some(s) => SortMethod::parse(s).unwrap_or_else(|| {
            push_issue(issues, &ctx, format!("unknown sort method '{}'", s));
            SortMethod::None
        }),
    };
    let offline_copy = match raw.offline_copy.as_deref() {
        None => OfflineCopy::None,
        Some(s) => OfflineCopy::parse(s).unwrap_or_else(|| {
            push_issue(issues, &ctx, format!("unknown offline copy method '{}'", s));
            OfflineCopy::None
        }),
    };

    let mut reserve = ReserveMethod::default();
    for keyword in raw.reserve.iter().flatten() {
        if let Err(e) = reserve.add(keyword) {
            push_issue(issues, &ctx, e);
        }
    }

    let mut vsns = Vec::new();
    for expr in raw.vsns.iter().flatten() {
        match VsnDesc::parse(expr) {
            Ok(d) => vsns.push(d),
            Err(e) => push_issue(issues, &ctx, e),
        }
    }
    for pool in raw.vsn_pools.iter().flatten() {
        match pools.get(pool) {
            Some(p) => vsns.push(VsnDesc::Pool(p.clone())),
            None => push_issue(issues, &ctx, format!("unknown VSN pool '{}'", pool)),
        }
    }

    let p = &raw.priority;
    let priorities = PriorityWeights {
        age: p.age.unwrap_or(0.0),
        size: p.size.unwrap_or(0.0),
        copy: [
            p.copy1.unwrap_or(0.0),
            p.copy2.unwrap_or(0.0),
            p.copy3.unwrap_or(0.0),
            p.copy4.unwrap_or(0.0),
        ],
        copies: p.copies.unwrap_or(0.0),
        rearchive: p.rearchive.unwrap_or(0.0),
        immediate: p.immediate.unwrap_or(0.0),
        release: p.release.unwrap_or(0.0),
        loaded: p.loaded.unwrap_or(0.0),
        offline: p.offline.unwrap_or(0.0),
        overflow: p.overflow.unwrap_or(0.0),
        queue_wait: p.queue_wait.unwrap_or(0.0),
    };

    let recycle = RecycleParams {
        hwm: raw.recycle.hwm,
        mingain: raw.recycle.mingain,
        vsncount: raw.recycle.vsncount,
        dataquantity: size_field(&raw.recycle.dataquantity, &ctx, "dataquantity", issues),
    };
    if raw.recycle.hwm.is_some_and(|h| h > 100) {
        push_issue(issues, &ctx, "recycle hwm must be a percentage");
    }

    ArchiveSet {
        name: raw.name.clone(),
        copy,
        mtype,
        archmax: size_field(&raw.archmax, &ctx, "archmax", issues),
        drives: drives.max(1),
        drivemax: size_field(&raw.drivemax, &ctx, "drivemax", issues),
        drivemin: size_field(&raw.drivemin, &ctx, "drivemin", issues),
        ovflmin: size_field(&raw.ovflmin, &ctx, "ovflmin", issues),
        join,
        sort,
        offline_copy,
        reserve,
        vsns,
        priorities,
        fillvsns: raw.fillvsns.unwrap_or(false),
        fillvsns_min: size_field(&raw.fillvsns_min, &ctx, "fillvsns_min", issues).unwrap_or(0),
        queue_time: raw
            .queue_time
            .map(Duration::from_secs)
            .unwrap_or(daemon.queue_time_default),
        recycle,
    }
}

fn resolve_library(lib: &LibraryToml, issues: &mut Vec<ConfigIssue>) -> Option<LibraryConfig> {
    let ctx = format!("library {}", lib.name);
    let kind = match LibraryKind::parse(&lib.kind) {
        Some(k) => k,
        None => {
            push_issue(issues, &ctx, format!("unknown library kind '{}'", lib.kind));
            return None;
        }
    };
    let drives = if kind.is_disk_like() {
        if !lib.drive.is_empty() {
            push_issue(issues, &ctx, "disk libraries take 'streams', not drives");
        }
        (0..lib.streams.unwrap_or(1))
            .map(|i| DriveConfig {
                name: format!("{}{}", lib.name, i),
                eq: lib.eq,
                available: true,
                loaded: None,
            })
            .collect()
    } else {
        lib.drive
            .iter()
            .map(|d| DriveConfig {
                name: d.name.clone(),
                eq: d.eq,
                available: d.available,
                loaded: match (&d.mtype, &d.vsn) {
                    (Some(m), Some(v)) => Some((m.clone(), v.clone())),
                    _ => None,
                },
            })
            .collect()
    };
    Some(LibraryConfig {
        name: lib.name.clone(),
        eq: lib.eq,
        kind,
        simulated: lib.simulated,
        available: lib.available,
        drives_allow: lib.drives_allow,
        drives,
    })
}
