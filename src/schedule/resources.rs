//! Drive and volume assignment for one request
//!
//! [`find_resources`] decides how many drives a request may use, divides
//! it between that many copy instances and gives every copy instance a
//! volume. Resources held by requests already archiving count as in use.
//! A copy instance counts as active while it holds a volume assignment.

use crate::archreq::{ArchReq, VolumeAssignment};
use crate::compose::{compose_drives, select_fit, OwnerNames};
use crate::config::{ArchiveSet, ConfigSnapshot};
use crate::device::{ArchLibTable, DriveClass};
use crate::notify::{Notification, Notifier};
use crate::volume::{OwnerContext, VolumeInfo, VolumeTables};
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Most volumes one overflowing file may span.
pub const MAX_VOLUMES: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FindStatus {
    /// Resources assigned.
    Start,
    /// Resources in use; try again later.
    Busy,
    /// No volume can take the request.
    Volumes,
    /// The request cannot be archived as it stands.
    NoArch,
}

/// A volume held outside any copy instance, e.g. by an overflowing copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeldVolume {
    pub request: String,
    pub cpi: usize,
    pub mtype: String,
    pub vsn: String,
}

/// What the resource search reads.
pub struct ResourceContext<'a> {
    pub config: &'a ConfigSnapshot,
    pub libs: &'a ArchLibTable,
    pub volumes: &'a VolumeTables,
    pub owners: &'a dyn OwnerNames,
    pub notifier: &'a dyn Notifier,
    /// Requests whose copies are running.
    pub archiving: Vec<&'a ArchReq>,
    pub held: &'a [HeldVolume],
    /// Selected space of every queued request, per archive set.
    pub set_space: &'a HashMap<String, u64>,
}

/// Volume chosen for a copy instance.
#[derive(Debug, Clone)]
pub struct RmVolume {
    pub volume: VolumeInfo,
    /// Volumes needed when the copy overflows.
    pub to_use: usize,
}

/// A failed search and the notification to send if nothing was found.
#[derive(Debug)]
pub struct Miss {
    pub status: FindStatus,
    pub notice: Option<Notification>,
}

impl Miss {
    fn busy(ar: &mut ArchReq, reason: &str) -> Self {
        ar.stall_reason = Some(reason.to_string());
        Miss {
            status: FindStatus::Busy,
            notice: None,
        }
    }
}

pub fn drive_class(ar: &ArchReq) -> DriveClass {
    if ar.flags.honeycomb {
        DriveClass::Honeycomb
    } else if ar.flags.disk {
        DriveClass::Disk
    } else {
        DriveClass::Removable
    }
}

fn is_disk_request(ar: &ArchReq) -> bool {
    ar.flags.disk || ar.flags.honeycomb
}

/// Deliver a notification once per request.
pub fn notify_once(ar: &mut ArchReq, notifier: &dyn Notifier, notice: Notification) {
    if ar.mark_sent(notice.key()) {
        notifier.notify(notice);
    }
}

pub fn assignment(vi: &VolumeInfo, vol_space: u64) -> VolumeAssignment {
    VolumeAssignment {
        mtype: vi.mtype.clone(),
        vsn: vi.vsn.clone(),
        aln: vi.aln,
        slot: vi.slot,
        vol_space,
        loaded: vi.flags.loaded,
    }
}

/// Drives and volumes for every copy instance of `ar`.
pub fn find_resources(ar: &mut ArchReq, set: &ArchiveSet, ctx: &ResourceContext<'_>) -> FindStatus {
    let class = drive_class(ar);
    let mut class_drives = ctx.libs.class_drives_allowed(class) as i64;
    if class_drives <= 0 {
        Miss::busy(ar, "no drives allowed for archiving");
        return FindStatus::Busy;
    }

    let mut set_drives = set.drives.max(1).min(ar.drives) as i64;
    if set_drives > 1 {
        if let Some(drivemin) = set.drivemin {
            let queued = ctx.set_space.get(&set.name).copied().unwrap_or(0);
            if queued < drivemin {
                set_drives = 1;
            }
        }
    }

    for other in ctx.archiving.iter().filter(|o| drive_class(o) == class) {
        for _ in other.cpi.iter().filter(|c| c.is_active()) {
            if other.asname == set.name {
                set_drives -= 1;
                if set_drives <= 0 {
                    Miss::busy(ar, "archive set drives busy");
                    return FindStatus::Busy;
                }
            }
            class_drives -= 1;
            if class_drives <= 0 {
                Miss::busy(ar, "all drives in use");
                return FindStatus::Busy;
            }
        }
    }

    let mut drives_to_use = (class_drives.min(set_drives) as usize)
        .min(ar.drives)
        .min(ar.sel_files);
    if ar.stage_vols != 0 {
        drives_to_use = drives_to_use.min(ar.stage_vols);
    }
    if drives_to_use > 1 {
        let min_size = set.drivemin.unwrap_or_else(|| ctx.config.archmax(set));
        if min_size > 0 {
            let count = (ar.sel_space / min_size) as usize;
            drives_to_use = drives_to_use.min(count);
        }
        drives_to_use = drives_to_use.max(1);
    }

    let name = ar.name();
    let used = if is_disk_request(ar) {
        match assign_disk_volumes(ar, set, drives_to_use, ctx) {
            Ok(used) => used,
            Err(status) => return status,
        }
    } else {
        let mut status = FindStatus::Busy;
        let mut notice = None;
        let mut used = 0;
        while drives_to_use > 0 {
            compose_drives(ar, set, drives_to_use, ctx.owners);
            used = 0;
            for cpi in 0..drives_to_use {
                if ar.cpi[cpi].files == 0 {
                    continue;
                }
                let space = ar.cpi[cpi].space;
                match find_rm_volume(ar, set, space, cpi, false, ctx) {
                    Ok(found) => {
                        ar.cpi[cpi].volume = Some(assignment(&found.volume, found.volume.space));
                        used += 1;
                    }
                    Err(miss) => {
                        status = miss.status;
                        notice = miss.notice;
                        break;
                    }
                }
            }
            if used >= drives_to_use {
                break;
            }
            drives_to_use = used;
        }
        if used == 0 {
            if let Some(notice) = notice {
                notify_once(ar, ctx.notifier, notice);
            }
            return status;
        }
        used
    };

    if used > 1 {
        info!("{} divided for {} drives", name, used);
    }
    ar.stall_reason = None;
    FindStatus::Start
}

fn assign_disk_volumes(
    ar: &mut ArchReq,
    set: &ArchiveSet,
    drives_to_use: usize,
    ctx: &ResourceContext<'_>,
) -> std::result::Result<usize, FindStatus> {
    let vols = find_dk_volumes(ar, set, drives_to_use, ctx)?;
    compose_drives(ar, set, drives_to_use, ctx.owners);

    let drives = ar.drives_used;
    let mut picks = Vec::with_capacity(drives);
    for cpi in 0..drives {
        if ar.cpi[cpi].files != 0 {
            picks.push((cpi, cpi % vols.len()));
        }
    }
    let mut sharers = vec![0u64; vols.len()];
    for &(_, vii) in &picks {
        sharers[vii] += 1;
    }
    for &(cpi, vii) in &picks {
        let vi = &vols[vii];
        let ci = &mut ar.cpi[cpi];
        ci.disk = true;
        ci.volume = Some(assignment(vi, vi.space / sharers[vii]));
    }
    Ok(picks.len())
}

/// Usable disk volumes for `drives_to_use` copies, best first.
pub fn find_dk_volumes(
    ar: &mut ArchReq,
    set: &ArchiveSet,
    drives_to_use: usize,
    ctx: &ResourceContext<'_>,
) -> std::result::Result<Vec<VolumeInfo>, FindStatus> {
    debug!("{}: assigning disk volumes, space {}", ar.name(), ar.sel_space);
    let table = ctx.volumes.disk();
    let mut vols: Vec<VolumeInfo> = table
        .cursor(set, ctx.volumes.disk_dictionary())
        .filter(|vi| vi.space >= ar.min_space)
        .collect();

    if vols.len() > 1 {
        if set.fillvsns {
            vols.sort_by(|a, b| a.space.cmp(&b.space));
            vols.truncate(1);
        } else {
            vols.sort_by(|a, b| b.space.cmp(&a.space));
        }
    }
    vols.truncate(drives_to_use.max(1));
    let space: u64 = vols.iter().map(|v| v.space).fold(0, u64::saturating_add);
    if !vols.is_empty() && ar.min_space < space {
        return Ok(vols);
    }

    ar.stall_reason = Some("no volumes available".to_string());
    notify_once(
        ar,
        ctx.notifier,
        Notification::NoVolumes {
            set: set.name.clone(),
        },
    );
    Err(FindStatus::Volumes)
}

/// True if library `aln` has a drive not used by a running copy.
pub fn is_lib_drive_free(aln: usize, ar: &ArchReq, ctx: &ResourceContext<'_>) -> bool {
    let Some(lib) = ctx.libs.libs.get(aln) else {
        return false;
    };
    let mut allow = lib.drives_allow.min(lib.drives_avail) as i64;
    for other in ctx.archiving.iter().copied().chain(std::iter::once(ar)) {
        for ci in other.cpi.iter().filter(|c| !c.disk) {
            if ci.volume.as_ref().is_some_and(|v| v.aln == aln) {
                allow -= 1;
            }
        }
    }
    allow > 0
}

/// Whether a cartridge is in use: `Some(true)` when another request has
/// it, `Some(false)` when only `ar` itself does.
pub fn cartridge_busy(vi: &VolumeInfo, ar: &ArchReq, ctx: &ResourceContext<'_>) -> Option<bool> {
    let uses = |r: &ArchReq| {
        r.cpi.iter().any(|ci| {
            ci.volume
                .as_ref()
                .is_some_and(|v| v.aln == vi.aln && v.mtype == vi.mtype && v.vsn == vi.vsn)
        })
    };
    if ctx.archiving.iter().any(|r| uses(*r))
        || ctx.held.iter().any(|h| h.mtype == vi.mtype && h.vsn == vi.vsn)
    {
        return Some(true);
    }
    uses(ar).then_some(false)
}

// Non-busy volumes first, then by free space.
fn cmp_space(a: &VolumeInfo, b: &VolumeInfo, ascending: bool) -> Ordering {
    a.flags.busy.cmp(&b.flags.busy).then_with(|| {
        if ascending {
            a.space.cmp(&b.space)
        } else {
            b.space.cmp(&a.space)
        }
    })
}

/// Find a removable volume for copy instance `cpi` needing
/// `space_required` bytes. With `overflow_request` the caller only needs
/// a continuation volume and the copy instance's files are not touched.
pub fn find_rm_volume(
    ar: &mut ArchReq,
    set: &ArchiveSet,
    space_required: u64,
    cpi: usize,
    overflow_request: bool,
    ctx: &ResourceContext<'_>,
) -> std::result::Result<RmVolume, Miss> {
    debug!("{}: assigning volumes for cpi {}, space {}", ar.name(), cpi, space_required);
    let table = ctx.volumes.removable(ctx.libs);
    let owner = ar.cpi[cpi].owner.clone();
    let fsname = ar.fsname.clone();
    let min_space = ar.cpi[cpi].min_space;
    let cursor = table.cursor(
        set,
        ctx.libs,
        Some(OwnerContext {
            owner: &owner,
            fsname: &fsname,
        }),
    );

    let mut avail: Vec<VolumeInfo> = Vec::new();
    let mut tried = 0;
    let mut drives_in_use = 0;
    let mut no_drives = true;
    let mut fillvsns = set.fillvsns;
    let mut ovflmin = None;

    for mut vi in cursor {
        if tried == 0 {
            ovflmin = ctx.config.ovflmin(set, &vi.mtype);
            if ovflmin.is_some_and(|o| min_space > o) {
                fillvsns = false;
            }
        }
        tried += 1;

        if fillvsns && vi.space < set.fillvsns_min {
            debug!(
                "{}.{} has {} bytes free, below fillvsns minimum; setting full",
                vi.mtype, vi.vsn, vi.space
            );
            if let Err(e) = ctx.volumes.catalog().set_archive_full(&vi.mtype, &vi.vsn) {
                warn!("Catalog set full failed for {}.{}: {}", vi.mtype, vi.vsn, e);
            }
            continue;
        }
        if ctx.libs.libs.get(vi.aln).map_or(0, |l| l.drives_avail) == 0 {
            continue;
        }
        no_drives = false;
        if !is_lib_drive_free(vi.aln, ar, ctx) {
            drives_in_use += 1;
            continue;
        }
        if vi.space < min_space && ovflmin.is_none() {
            continue;
        }
        if let Some(other) = cartridge_busy(&vi, ar, ctx) {
            vi.flags.busy = true;
            if other && vi.flags.reserved {
                return Err(Miss::busy(ar, "reserved volume busy"));
            }
        }
        if !fillvsns && !vi.flags.busy && vi.space >= space_required {
            return Ok(RmVolume { volume: vi, to_use: 1 });
        }
        avail.push(vi);
    }

    if avail.is_empty() {
        if tried != 0 {
            if drives_in_use != 0 {
                return Err(Miss::busy(ar, "drives busy"));
            }
            if no_drives {
                return Err(Miss::busy(ar, "no drives available"));
            }
        }
        ar.stall_reason = Some("no volumes available".to_string());
        return Err(Miss {
            status: FindStatus::Volumes,
            notice: Some(Notification::NoVolumes {
                set: set.name.clone(),
            }),
        });
    }

    avail.sort_by(|a, b| cmp_space(a, b, fillvsns));
    if avail[0].flags.busy {
        return Err(Miss::busy(ar, "available volume busy"));
    }
    let free: Vec<&VolumeInfo> = avail.iter().filter(|v| !v.flags.busy).collect();
    if let Some(vi) = free.iter().find(|v| v.space > min_space) {
        if !overflow_request {
            return Ok(RmVolume {
                volume: (*vi).clone(),
                to_use: 1,
            });
        }
    }

    let joined = ar.selected().first().is_some_and(|f| f.is_join());
    let request = ar.name();
    let Some(ovflmin) = ovflmin else {
        ar.stall_reason = Some("file too large for any volume".to_string());
        return Err(Miss {
            status: FindStatus::NoArch,
            notice: Some(Notification::FileTooLarge {
                request,
                joined,
                overflow: false,
            }),
        });
    };

    let mut avail_space: u64 = 0;
    let mut to_use = 0;
    for vi in &free {
        to_use += 1;
        if to_use > MAX_VOLUMES {
            break;
        }
        avail_space = avail_space.saturating_add(vi.space);
        if avail_space >= space_required {
            if overflow_request {
                return Ok(RmVolume {
                    volume: free[0].clone(),
                    to_use,
                });
            }
            break;
        }
    }
    if !overflow_request {
        select_fit(ar, cpi, avail_space, ovflmin);
        if ar.cpi[cpi].space > 0 {
            return Ok(RmVolume {
                volume: free[0].clone(),
                to_use,
            });
        }
    }
    ar.stall_reason = Some("file too large for volume overflow".to_string());
    Err(Miss {
        status: FindStatus::NoArch,
        notice: Some(Notification::FileTooLarge {
            request,
            joined,
            overflow: true,
        }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archreq::FileInfo;
    use crate::compose::SystemOwnerNames;
    use crate::config;
    use crate::device::{DeviceLayer, StaticDeviceLayer};
    use crate::notify::ChannelNotifier;
    use crate::volume::{CatalogEntry, DiskVolumeInfo, InMemoryCatalog, InMemoryDiskDictionary};
    use chrono::Utc;
    use crossbeam::channel::Receiver;
    use std::sync::Arc;

    const GB: u64 = 1 << 30;

    const CONFIG: &str = r#"
[[archive_set]]
name = "s.1"
mtype = "li"
drives = 2
vsns = ["^VOL"]

[[archive_set]]
name = "big.1"
mtype = "li"
ovflmin = "1G"
vsns = ["^VOL"]

[[archive_set]]
name = "none.1"
mtype = "li"
vsns = ["^NOMATCH"]

[[archive_set]]
name = "dk.1"
mtype = "dk"
drives = 2
vsns = ["^disk"]

[[library]]
name = "lib50"
eq = 50
kind = "robot"

[[library.drive]]
name = "lt0"
eq = 51

[[library.drive]]
name = "lt1"
eq = 52

[[library]]
name = "dklib"
eq = 90
kind = "disk"
streams = 2
"#;

    struct Fixture {
        config: ConfigSnapshot,
        libs: ArchLibTable,
        volumes: VolumeTables,
        owners: SystemOwnerNames,
        notifier: ChannelNotifier,
        rx: Receiver<Notification>,
        set_space: HashMap<String, u64>,
    }

    impl Fixture {
        fn new() -> Self {
            let config = config::parse(CONFIG).unwrap();
            let libs = ArchLibTable::build(&StaticDeviceLayer::new(&config.libraries).status(), None);
            let catalog = InMemoryCatalog::new(vec![
                CatalogEntry::new(50, 1, "li", "VOL001", 100 * GB, 40 * GB),
                CatalogEntry::new(50, 2, "li", "VOL002", 100 * GB, 30 * GB),
            ]);
            let disk = InMemoryDiskDictionary::new(vec![
                DiskVolumeInfo::new("disk01", 100 * GB, 80 * GB),
                DiskVolumeInfo::new("disk02", 100 * GB, 60 * GB),
            ]);
            let volumes = VolumeTables::new(Arc::new(catalog), Arc::new(disk), &libs);
            let (notifier, rx) = ChannelNotifier::new();
            Self {
                config,
                libs,
                volumes,
                owners: SystemOwnerNames::new(),
                notifier,
                rx,
                set_space: HashMap::new(),
            }
        }

        fn ctx<'a>(&'a self, archiving: Vec<&'a ArchReq>) -> ResourceContext<'a> {
            ResourceContext {
                config: &self.config,
                libs: &self.libs,
                volumes: &self.volumes,
                owners: &self.owners,
                notifier: &self.notifier,
                archiving,
                held: &[],
                set_space: &self.set_space,
            }
        }

        fn set(&self, name: &str) -> &ArchiveSet {
            self.config.archive_set(name).unwrap()
        }

        fn notices(&self) -> Vec<Notification> {
            self.rx.try_iter().collect()
        }
    }

    fn request(set: &str, seq: u32, drives: usize, sizes: &[u64]) -> ArchReq {
        let mut ar = ArchReq::new("samfs1", set, seq, drives);
        for (i, s) in sizes.iter().enumerate() {
            ar.add_file(FileInfo::new(format!("d/f{}", i), *s, Utc::now()));
        }
        ar
    }

    fn vsn(ar: &ArchReq, cpi: usize) -> Option<&str> {
        ar.cpi[cpi].volume.as_ref().map(|v| v.vsn.as_str())
    }

    #[test]
    fn test_two_drives_get_different_volumes() {
        let fx = Fixture::new();
        let mut ar = request("s.1", 1, 2, &[GB, GB, GB, GB]);
        let status = find_resources(&mut ar, fx.set("s.1"), &fx.ctx(Vec::new()));
        assert_eq!(status, FindStatus::Start);
        assert_eq!(ar.drives_used, 2);
        assert_eq!(ar.active_copies(), 2);
        assert_ne!(vsn(&ar, 0), vsn(&ar, 1));
        assert!(ar.stall_reason.is_none());
    }

    #[test]
    fn test_small_request_uses_one_drive() {
        let fx = Fixture::new();
        // below one archmax of data, so one drive is enough
        let mut ar = request("s.1", 1, 2, &[1 << 20, 1 << 20]);
        let status = find_resources(&mut ar, fx.set("s.1"), &fx.ctx(Vec::new()));
        assert_eq!(status, FindStatus::Start);
        assert_eq!(ar.active_copies(), 1);
        assert_eq!(ar.cpi[0].files, 2);
    }

    #[test]
    fn test_set_drives_busy() {
        let fx = Fixture::new();
        let mut running = request("s.1", 1, 2, &[GB, GB, GB, GB]);
        assert_eq!(
            find_resources(&mut running, fx.set("s.1"), &fx.ctx(Vec::new())),
            FindStatus::Start
        );

        let mut ar = request("s.1", 2, 2, &[GB]);
        let status = find_resources(&mut ar, fx.set("s.1"), &fx.ctx(vec![&running]));
        assert_eq!(status, FindStatus::Busy);
        assert_eq!(ar.stall_reason.as_deref(), Some("archive set drives busy"));
    }

    #[test]
    fn test_other_set_waits_for_free_drive() {
        let fx = Fixture::new();
        let mut running = request("s.1", 1, 2, &[GB, GB, GB, GB]);
        find_resources(&mut running, fx.set("s.1"), &fx.ctx(Vec::new()));

        let mut ar = request("big.1", 1, 1, &[GB]);
        let status = find_resources(&mut ar, fx.set("big.1"), &fx.ctx(vec![&running]));
        assert_eq!(status, FindStatus::Busy);
        assert_eq!(ar.stall_reason.as_deref(), Some("all drives in use"));
    }

    #[test]
    fn test_no_matching_volumes_notifies_once() {
        let fx = Fixture::new();
        let mut ar = request("none.1", 1, 1, &[GB]);
        assert_eq!(
            find_resources(&mut ar, fx.set("none.1"), &fx.ctx(Vec::new())),
            FindStatus::Volumes
        );
        assert_eq!(
            find_resources(&mut ar, fx.set("none.1"), &fx.ctx(Vec::new())),
            FindStatus::Volumes
        );
        let notices = fx.notices();
        assert_eq!(notices.len(), 1);
        assert!(matches!(&notices[0], Notification::NoVolumes { set } if set == "none.1"));
    }

    #[test]
    fn test_file_larger_than_any_volume() {
        let fx = Fixture::new();
        let mut ar = request("s.1", 1, 1, &[60 * GB]);
        assert_eq!(
            find_resources(&mut ar, fx.set("s.1"), &fx.ctx(Vec::new())),
            FindStatus::Volumes
        );
    }

    #[test]
    fn test_overflow_spans_volumes() {
        let fx = Fixture::new();
        let mut ar = request("big.1", 1, 1, &[50 * GB]);
        let status = find_resources(&mut ar, fx.set("big.1"), &fx.ctx(Vec::new()));
        assert_eq!(status, FindStatus::Start);
        assert_eq!(vsn(&ar, 0), Some("VOL001"));
        assert_eq!(ar.cpi[0].files, 1);
    }

    #[test]
    fn test_overflow_too_large_for_all_volumes() {
        let fx = Fixture::new();
        let mut ar = request("big.1", 1, 1, &[90 * GB]);
        let status = find_resources(&mut ar, fx.set("big.1"), &fx.ctx(Vec::new()));
        assert_eq!(status, FindStatus::NoArch);
        let notices = fx.notices();
        assert!(matches!(
            &notices[0],
            Notification::FileTooLarge { overflow: true, joined: false, .. }
        ));
    }

    #[test]
    fn test_overflow_request_needs_continuation() {
        let fx = Fixture::new();
        let mut ar = request("big.1", 1, 1, &[50 * GB]);
        find_resources(&mut ar, fx.set("big.1"), &fx.ctx(Vec::new()));
        let found = find_rm_volume(&mut ar, fx.set("big.1"), 20 * GB, 0, true, &fx.ctx(Vec::new()))
            .unwrap();
        // VOL001 is held by this request already
        assert_eq!(found.volume.vsn, "VOL002");
    }

    #[test]
    fn test_disk_volumes_round_robin() {
        let fx = Fixture::new();
        let mut ar = request("dk.1", 1, 2, &[GB, GB, GB, GB]);
        ar.flags.disk = true;
        let status = find_resources(&mut ar, fx.set("dk.1"), &fx.ctx(Vec::new()));
        assert_eq!(status, FindStatus::Start);
        assert_eq!(vsn(&ar, 0), Some("disk01"));
        assert_eq!(vsn(&ar, 1), Some("disk02"));
        assert!(ar.cpi.iter().take(2).all(|c| c.disk));
    }

    #[test]
    fn test_cartridge_busy_self_and_other() {
        let fx = Fixture::new();
        let mut running = request("s.1", 1, 1, &[GB]);
        find_resources(&mut running, fx.set("s.1"), &fx.ctx(Vec::new()));
        let held = running.cpi[0].volume.clone().unwrap();
        let vi = fx
            .volumes
            .removable(&fx.libs)
            .cursor(fx.set("s.1"), &fx.libs, None)
            .find(|v| v.vsn == held.vsn)
            .unwrap();

        let idle = request("s.1", 2, 1, &[GB]);
        assert_eq!(cartridge_busy(&vi, &running, &fx.ctx(Vec::new())), Some(false));
        assert_eq!(cartridge_busy(&vi, &idle, &fx.ctx(vec![&running])), Some(true));
        assert_eq!(cartridge_busy(&vi, &idle, &fx.ctx(Vec::new())), None);
    }
}
