//! Offline files and their stage volumes
//!
//! An offline file must be staged from removable media before it can be
//! archived again. These passes find which stage volumes are reachable,
//! switch files to an alternate archive copy when the primary one is not,
//! and park the request when nothing can be staged at all.

use super::order::by_stage_volume;
use super::ComposeContext;
use crate::archreq::{ArchReq, CpiSlot};
use crate::notify::Notification;
use crate::volume::StageAvailability;
use tracing::{debug, warn};

/// Count selected files whose stage volume is unavailable; such files
/// become [`CpiSlot::Later`]. Each change of stage volume in the selected
/// order counts as one stage volume.
pub fn non_stage_files(ar: &mut ArchReq, ctx: &ComposeContext<'_>) -> usize {
    ar.stage_vols = 0;
    let mut current: Option<(String, String)> = None;
    let mut state = StageAvailability::Unavailable;
    let mut non_stage = 0;
    let request = ar.name();
    let mut notices = Vec::new();

    for fi in ar.files[..ar.sel_files].iter_mut() {
        let Some(oi) = fi.offline.as_ref() else {
            continue;
        };
        let volume = (oi.media.clone(), oi.vsn.clone());
        if current.as_ref() != Some(&volume) {
            ar.stage_vols += 1;
            state = ctx.volumes.stage_availability(ctx.libs, &volume.0, &volume.1);
            if !state.is_available() {
                notices.push(Notification::StageVolumeUnavailable {
                    request: request.clone(),
                    mtype: volume.0.clone(),
                    vsn: volume.1.clone(),
                });
            }
            current = Some(volume);
        }
        match state {
            StageAvailability::Available { simulated } => {
                fi.stage_sim = simulated;
                if fi.cpi == CpiSlot::Later {
                    fi.cpi = CpiSlot::Unassigned;
                }
            }
            StageAvailability::Unavailable => {
                fi.stage_sim = false;
                fi.cpi = CpiSlot::Later;
                non_stage += 1;
            }
        }
    }

    for n in notices {
        if ar.mark_sent(n.key()) {
            ctx.notifier.notify(n);
        }
    }
    debug!("{}: {} stage volumes, {} non-stageable files", request, ar.stage_vols, non_stage);
    non_stage
}

/// Look for a reachable copy of every selected offline file. Files whose
/// primary volume is unavailable switch to the first undamaged alternate
/// copy on an available volume. True if any file can be staged.
pub fn find_stage_volume(ar: &mut ArchReq, ctx: &ComposeContext<'_>) -> bool {
    let mut found = false;
    for fi in ar.files[..ar.sel_files].iter_mut() {
        let Some(oi) = fi.offline.as_ref() else {
            continue;
        };
        if let StageAvailability::Available { simulated } =
            ctx.volumes.stage_availability(ctx.libs, &oi.media, &oi.vsn)
        {
            fi.stage_sim = simulated;
            found = true;
            continue;
        }
        let alternate = fi.alt_copies.iter().filter(|c| !c.damaged).find_map(|c| {
            match ctx
                .volumes
                .stage_availability(ctx.libs, &c.location.media, &c.location.vsn)
            {
                StageAvailability::Available { simulated } => Some((c.clone(), simulated)),
                StageAvailability::Unavailable => None,
            }
        });
        if let Some((copy, simulated)) = alternate {
            debug!(
                "{}: stage from copy {} on {} instead of {}",
                fi.path, copy.copy, copy.location.vsn, oi.vsn
            );
            fi.stage_copy = Some(copy.copy);
            fi.stage_sim = simulated;
            fi.offline = Some(copy.location);
            found = true;
        }
    }
    found
}

/// Order offline files by stage volume and make sure at least one of
/// them can be staged. Gives up after `max_stage_attempts` volume
/// searches and marks the request non-stageable.
pub fn check_offline(ar: &mut ArchReq, ctx: &ComposeContext<'_>) {
    let max_attempts = ctx.config.daemon.max_stage_attempts;
    ar.files[..ar.sel_files].sort_by(by_stage_volume);
    let mut attempts = 0;
    while non_stage_files(ar, ctx) == ar.sel_files {
        if attempts >= max_attempts || !find_stage_volume(ar, ctx) {
            warn!("{}: no offline file can be staged", ar.name());
            ar.flags.nonstage = true;
            ar.stall_reason = Some("waiting for a stage volume".to_string());
            let n = Notification::NonStageable { request: ar.name() };
            if ar.mark_sent(n.key()) {
                ctx.notifier.notify(n);
            }
            return;
        }
        attempts += 1;
        ar.files[..ar.sel_files].sort_by(by_stage_volume);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archreq::{AltCopy, FileInfo, OfflineInfo};
    use crate::compose::SystemOwnerNames;
    use crate::config::{self, ConfigSnapshot};
    use crate::device::ArchLibTable;
    use crate::notify::ChannelNotifier;
    use crate::volume::{DiskVolumeDictionary, DiskVolumeInfo, InMemoryCatalog, InMemoryDiskDictionary, VolumeTables};
    use chrono::Utc;
    use crossbeam::channel::Receiver;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Reports its one volume unavailable on every other lookup.
    struct FlappingDisk {
        lookups: AtomicUsize,
    }

    impl DiskVolumeDictionary for FlappingDisk {
        fn names(&self) -> Vec<String> {
            vec!["flap".to_string()]
        }

        fn get(&self, vsn: &str) -> Option<DiskVolumeInfo> {
            let n = self.lookups.fetch_add(1, Ordering::SeqCst);
            let mut dv = DiskVolumeInfo::new(vsn, 100, 50);
            dv.flags.unavailable = n % 2 == 0;
            Some(dv)
        }

        fn consume_space(&self, _vsn: &str, _bytes: u64) {}
    }

    struct Fixture {
        config: ConfigSnapshot,
        volumes: VolumeTables,
        libs: ArchLibTable,
        owners: SystemOwnerNames,
        notifier: ChannelNotifier,
        rx: Receiver<Notification>,
    }

    impl Fixture {
        fn new(attempts: u32, disk: Arc<dyn DiskVolumeDictionary>) -> Self {
            let config = config::parse(&format!(
                "[daemon]\nmax_stage_attempts = {}\n\n[[archive_set]]\nname = \"s.1\"\nmtype = \"li\"\n",
                attempts
            ))
            .unwrap();
            let libs = ArchLibTable::default();
            let volumes = VolumeTables::new(Arc::new(InMemoryCatalog::new(Vec::new())), disk, &libs);
            let (notifier, rx) = ChannelNotifier::new();
            Self {
                config,
                volumes,
                libs,
                owners: SystemOwnerNames::new(),
                notifier,
                rx,
            }
        }

        fn with_disks(vsns: &[&str]) -> Self {
            let dict = InMemoryDiskDictionary::new(vsns.iter().map(|v| DiskVolumeInfo::new(v, 100, 50)).collect());
            Self::new(3, Arc::new(dict))
        }

        fn ctx(&self) -> ComposeContext<'_> {
            ComposeContext {
                config: &self.config,
                volumes: &self.volumes,
                libs: &self.libs,
                owners: &self.owners,
                notifier: &self.notifier,
            }
        }

        fn notices(&self) -> Vec<Notification> {
            self.rx.try_iter().collect()
        }
    }

    fn request(files: Vec<FileInfo>) -> ArchReq {
        let mut ar = ArchReq::new("fs", "s.1", 1, 1);
        for fi in files {
            ar.add_file(fi);
        }
        ar.sel_files = ar.files.len();
        ar
    }

    fn alt(copy: u8, vsn: &str, damaged: bool) -> AltCopy {
        AltCopy {
            copy,
            location: OfflineInfo {
                media: "dk".to_string(),
                vsn: vsn.to_string(),
                position: 7,
                offset: 0,
            },
            damaged,
        }
    }

    #[test]
    fn test_nothing_stageable_parks_request() {
        let fx = Fixture::with_disks(&[]);
        let mut ar = request(vec![FileInfo::new("a", 10, Utc::now()).with_offline("dk", "GONE", 1, 0)]);
        check_offline(&mut ar, &fx.ctx());
        assert!(ar.flags.nonstage);
        assert_eq!(ar.files[0].cpi, CpiSlot::Later);
        assert!(ar.stall_reason.is_some());
        let notices = fx.notices();
        assert_eq!(notices.len(), 2);
        assert_eq!(notices[0].key(), "stagevol:dk.GONE");
        assert_eq!(notices[1], Notification::NonStageable { request: ar.name() });
    }

    #[test]
    fn test_partially_stageable_is_not_parked() {
        let fx = Fixture::with_disks(&["disk01"]);
        let mut ar = request(vec![
            FileInfo::new("a", 10, Utc::now()).with_offline("dk", "GONE", 1, 0),
            FileInfo::new("b", 10, Utc::now()).with_offline("dk", "disk01", 2, 0),
        ]);
        check_offline(&mut ar, &fx.ctx());
        assert!(!ar.flags.nonstage);
        let later: Vec<&str> = ar
            .files
            .iter()
            .filter(|f| f.cpi == CpiSlot::Later)
            .map(|f| f.path.as_str())
            .collect();
        assert_eq!(later, ["a"]);
        assert_eq!(ar.stage_vols, 2);
    }

    #[test]
    fn test_stage_attempts_are_bounded() {
        let disk = Arc::new(FlappingDisk {
            lookups: AtomicUsize::new(0),
        });
        let fx = Fixture::new(2, disk.clone());
        let mut ar = request(vec![FileInfo::new("a", 10, Utc::now()).with_offline("dk", "flap", 1, 0)]);
        check_offline(&mut ar, &fx.ctx());
        assert!(ar.flags.nonstage);
        // three unavailable counts and two successful searches
        assert_eq!(disk.lookups.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn test_non_stageable_notice_sent_once() {
        let fx = Fixture::with_disks(&[]);
        let mut ar = request(vec![FileInfo::new("a", 10, Utc::now()).with_offline("dk", "GONE", 1, 0)]);
        check_offline(&mut ar, &fx.ctx());
        check_offline(&mut ar, &fx.ctx());
        let nonstage = fx
            .notices()
            .into_iter()
            .filter(|n| matches!(n, Notification::NonStageable { .. }))
            .count();
        assert_eq!(nonstage, 1);
    }

    #[test]
    fn test_falls_back_to_undamaged_alternate_copy() {
        let fx = Fixture::with_disks(&["disk01", "disk02"]);
        let mut fi = FileInfo::new("a", 10, Utc::now()).with_offline("dk", "GONE", 1, 0);
        fi.alt_copies = vec![alt(2, "disk01", true), alt(3, "disk02", false)];
        let mut ar = request(vec![fi]);
        assert!(find_stage_volume(&mut ar, &fx.ctx()));
        assert_eq!(ar.files[0].stage_copy, Some(3));
        assert_eq!(ar.files[0].offline.as_ref().unwrap().vsn, "disk02");

        check_offline(&mut ar, &fx.ctx());
        assert!(!ar.flags.nonstage);
        assert_ne!(ar.files[0].cpi, CpiSlot::Later);
    }

    #[test]
    fn test_no_alternate_copy_means_no_stage_volume() {
        let fx = Fixture::with_disks(&["disk01"]);
        let mut fi = FileInfo::new("a", 10, Utc::now()).with_offline("dk", "GONE", 1, 0);
        fi.alt_copies = vec![alt(2, "disk01", true)];
        let mut ar = request(vec![fi]);
        assert!(!find_stage_volume(&mut ar, &fx.ctx()));
        assert_eq!(ar.files[0].stage_copy, None);
    }
}
