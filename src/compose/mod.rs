//! Compose engine
//!
//! Compose turns a raw or returning [`ArchReq`] into one the scheduler can
//! work with: finished files are pruned, offline files are checked for a
//! stage volume, segments are ordered, files are joined and sorted by the
//! archive set's policy, and the request aggregates are recomputed. The
//! scheduler later calls [`compose_drives`] to split the request between
//! copy instances once it knows how many drives it can have, and
//! [`make_tarballs`] when a volume has been chosen.

pub mod join;
pub mod offline;
pub mod order;
pub mod owner;
pub mod tarball;

pub use join::join_files;
pub use offline::{check_offline, find_stage_volume, non_stage_files};
pub use owner::{OwnerNames, SystemOwnerNames};
pub use tarball::{make_tarballs, select_fit};

use crate::archreq::{ArchReq, ArchReqState, CpiSlot, DivideRule, FileInfo, PR_MIN};
use crate::config::{ArchiveSet, ConfigSnapshot, JoinMethod, OwnerKind, SortMethod};
use crate::device::ArchLibTable;
use crate::notify::Notifier;
use crate::volume::VolumeTables;
use order::{by_segment, sort_by_method};
use tracing::{debug, info, warn};

/// Collaborators compose reads during one pass.
#[derive(Clone, Copy)]
pub struct ComposeContext<'a> {
    pub config: &'a ConfigSnapshot,
    pub volumes: &'a VolumeTables,
    pub libs: &'a ArchLibTable,
    pub owners: &'a dyn OwnerNames,
    pub notifier: &'a dyn Notifier,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComposeOutcome {
    /// Nothing left to archive, or the request was withdrawn.
    Dropped,
    /// Ready for the scheduler.
    Ready,
}

/// Run one compose pass over a request.
pub fn compose(ar: &mut ArchReq, ctx: &ComposeContext<'_>) -> ComposeOutcome {
    let name = ar.name();
    if ar.flags.unqueue {
        info!("{} withdrawn", name);
        ar.state = ArchReqState::Dropped;
        return ComposeOutcome::Dropped;
    }
    if !ar.flags.first {
        prune(ar);
        if ar.files.is_empty() {
            debug!("{}: all files done", name);
            ar.state = ArchReqState::Dropped;
            return ComposeOutcome::Dropped;
        }
        ar.state = ArchReqState::Pruned;
    }

    let Some(set) = ctx.config.archive_set(&ar.asname) else {
        warn!("{}: archive set {} is not defined", name, ar.asname);
        ar.state = ArchReqState::Dropped;
        return ComposeOutcome::Dropped;
    };

    let flags = ar.flags;
    ar.flags = Default::default();
    ar.flags.offline = flags.offline;
    ar.flags.segment = flags.segment;
    ar.flags.disk = set.is_disk();
    ar.flags.honeycomb = set.is_honeycomb();
    ar.drives_used = 0;
    ar.divides = DivideRule::None;
    ar.sel_files = ar.files.len();
    ar.sel_space = ar.space;
    ar.stall_reason = None;

    if ar.flags.offline {
        check_offline(ar, ctx);
        ar.divides = DivideRule::Offline;
        ar.state = ArchReqState::OfflineChecked;
    }
    if ar.flags.segment {
        ar.divides = DivideRule::Segment;
        ar.files[..ar.sel_files].sort_by(by_segment);
        ar.state = ArchReqState::SegmentSorted;
    }
    if set.join != JoinMethod::None {
        join_files(ar, set);
        ar.state = ArchReqState::Joined;
    }
    if set.sort != SortMethod::None {
        sort_files(ar, set.sort);
        ar.state = ArchReqState::Sorted;
    }
    if let Some(kind) = set.reserve.owner {
        ar.divides = match kind {
            OwnerKind::Dir => DivideRule::OwnerDir,
            OwnerKind::User | OwnerKind::Group => DivideRule::OwnerUidGid,
        };
    }
    prepare(ar);
    ar.state = ArchReqState::Prepared;
    debug!(
        "{} composed: {} entries, {} bytes, divides {:?}",
        name, ar.sel_files, ar.sel_space, ar.divides
    );
    ComposeOutcome::Ready
}

/// Sort the schedulable entries of a request.
pub fn sort_files(ar: &mut ArchReq, method: SortMethod) {
    if ar.sel_files == 0 {
        return;
    }
    sort_by_method(&mut ar.files[..ar.sel_files], method);
    debug!("{} sorted by {:?}", ar.name(), method);
}

/// Recompute request aggregates from entries not waiting for another pass.
pub fn prepare(ar: &mut ArchReq) {
    ar.min_space = u64::MAX;
    ar.priority = PR_MIN;
    ar.sel_space = 0;
    ar.flags.offline = false;
    ar.flags.segment = false;
    for i in 0..ar.sel_files {
        let fi = &ar.files[i];
        if matches!(fi.cpi, CpiSlot::More | CpiSlot::Later) {
            continue;
        }
        ar.min_space = ar.min_space.min(fi.space);
        ar.priority = ar.priority.max(fi.priority);
        ar.sel_space += fi.space;
        if fi.is_offline() {
            ar.flags.offline = true;
        }
        if ar.members(i).iter().any(|m| m.segment.is_some()) {
            ar.flags.segment = true;
        }
    }
}

/// Drop finished files and any join entries; reset per-pass markers.
///
/// The offline and segment flags are rebuilt from every remaining file,
/// including those `prepare` skipped as deferred on the last pass.
pub fn prune(ar: &mut ArchReq) {
    if ar.flags.join {
        ar.files.drain(..ar.sel_files);
        ar.flags.join = false;
    }
    ar.files.retain(|fi| !fi.is_finished());
    ar.space = 0;
    for fi in ar.files.iter_mut() {
        fi.cpi = CpiSlot::Unassigned;
        fi.first = false;
        fi.stage_sim = false;
        fi.join = None;
        ar.space += fi.space;
    }
    ar.sel_files = ar.files.len();
    ar.flags.offline = ar.files.iter().any(FileInfo::is_offline);
    ar.flags.segment = ar.files.iter().any(|fi| fi.segment.is_some());
}

/// Divide a request between `drives` copy instances. Every entry not
/// deferred to a later pass is offered to each copy instance in turn.
pub fn compose_drives(ar: &mut ArchReq, set: &ArchiveSet, drives: usize, owners: &dyn OwnerNames) {
    let drives = drives.clamp(1, ar.drives);
    ar.drives_used = drives;
    ar.reset_copy_instances();
    for i in 0..ar.sel_files {
        let fi = &mut ar.files[i];
        if fi.cpi != CpiSlot::Later {
            fi.cpi = CpiSlot::More;
        }
    }
    if drives > 1 {
        info!("{}: dividing between {} drives", ar.name(), drives);
    } else if ar.divides == DivideRule::Segment {
        ar.divides = DivideRule::None;
    }
    for cpi in 0..drives {
        compose_for_cpi(ar, set, cpi, owners);
    }
    ar.state = ArchReqState::DrivesAssigned;
}

/// Largest amount of data one copy instance may take.
///
/// The even share `sel_space / drives` is capped by `drivemax` first and
/// then raised to the request's smallest entry, so the result is
/// `max(min_space, min(share, drivemax))`. When `drivemax` is below the
/// smallest entry, the smallest entry wins and every copy instance can
/// still take at least one entry.
pub fn drive_ceiling(ar: &ArchReq, set: &ArchiveSet) -> u64 {
    let drives = ar.drives_used.max(1) as u64;
    let drivemax = set.drivemax.unwrap_or(u64::MAX);
    (ar.sel_space / drives).min(drivemax).max(ar.min_space)
}

/// Group key of an entry under the request's divide rule.
fn divide_key(ar: &ArchReq, i: usize, set: &ArchiveSet, owners: &dyn OwnerNames) -> Option<String> {
    let fi = &ar.files[i];
    match ar.divides {
        DivideRule::None | DivideRule::Segment => None,
        DivideRule::Offline => Some(
            fi.offline
                .as_ref()
                .map(|o| o.vsn.clone())
                .unwrap_or_else(|| " ".to_string()),
        ),
        DivideRule::OwnerDir => Some(match fi.path.split_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => ".".to_string(),
        }),
        DivideRule::OwnerUidGid => Some(match set.reserve.owner {
            Some(OwnerKind::Group) => owners
                .group_name(fi.gid)
                .unwrap_or_else(|| format!("G{}", fi.gid)),
            _ => owners
                .user_name(fi.uid)
                .unwrap_or_else(|| format!("U{}", fi.uid)),
        }),
    }
}

/// Select entries for copy instance `cpi`.
///
/// Entries that do not fit under the drive ceiling, or belong to another
/// group under the divide rule, stay marked [`CpiSlot::More`] and set the
/// copy instance's `more` flag. Offline groups end at the first change of
/// stage volume so one copy never alternates between source volumes.
pub fn compose_for_cpi(ar: &mut ArchReq, set: &ArchiveSet, cpi: usize, owners: &dyn OwnerNames) {
    let ceiling = drive_ceiling(ar, set);
    let slot = CpiSlot::Assigned(cpi as u16);
    let drives_used = ar.drives_used.max(1) as u32;
    let mut group: Option<String> = None;
    let mut group_closed = false;
    let mut files = 0;
    let mut space: u64 = 0;
    let mut min_space = u64::MAX;
    let mut more = 0;

    for i in 0..ar.sel_files {
        if ar.files[i].cpi != CpiSlot::More {
            continue;
        }
        if ar.divides == DivideRule::Segment
            && ar.files[i].segment.unwrap_or(0) % drives_used != cpi as u32
        {
            continue;
        }
        let key = divide_key(ar, i, set, owners);
        if let Some(key) = key {
            match &group {
                Some(g) if *g != key => {
                    if ar.divides == DivideRule::Offline {
                        group_closed = true;
                    }
                    more += 1;
                    continue;
                }
                Some(_) if group_closed => {
                    more += 1;
                    continue;
                }
                Some(_) => {}
                None => group = Some(key),
            }
        }
        let fi = &mut ar.files[i];
        if space.saturating_add(fi.space) > ceiling {
            more += 1;
            continue;
        }
        fi.cpi = slot;
        files += 1;
        space += fi.space;
        min_space = min_space.min(fi.space);
    }

    let ci = &mut ar.cpi[cpi];
    ci.files = files;
    ci.space = space;
    ci.min_space = min_space;
    ci.owner = group.unwrap_or_default();
    ci.more = more != 0;
    debug!(
        "cpi {}: {} entries, {} bytes (ceiling {}), more {}",
        cpi, files, space, ceiling, ci.more
    );
}
