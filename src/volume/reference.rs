//! Removable volume reference table
//!
//! Joins catalog entries to archive library indices and keeps them in
//! selection order. [`RemovableCursor`] walks the table for one archive
//! set in three phases: volumes already mounted, volumes reserved to the
//! set, then every volume matching the set's VSN descriptors.

use super::catalog::{Catalog, CatalogEntry};
use super::{VolumeFlags, VolumeInfo};
use crate::config::ArchiveSet;
use crate::device::ArchLibTable;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use tracing::{debug, trace};

#[derive(Debug, Clone)]
pub struct VolRefEntry {
    pub aln: usize,
    pub entry: CatalogEntry,
}

impl VolRefEntry {
    // Usable labeled volumes with data first, then freshly labeled ones,
    // then blank ones; unusable volumes last.
    fn group(&self) -> u8 {
        let ce = &self.entry;
        if !ce.usable() {
            3
        } else if !ce.status.labeled {
            2
        } else if ce.labeled_empty() {
            1
        } else {
            0
        }
    }
}

fn cmp_vol_ref(a: &VolRefEntry, b: &VolRefEntry) -> Ordering {
    let (ga, gb) = (a.group(), b.group());
    if ga == 3 && gb == 3 {
        return Ordering::Equal;
    }
    ga.cmp(&gb)
        .then_with(|| {
            let t = |e: &VolRefEntry| e.entry.label_time.unwrap_or(DateTime::<Utc>::MIN_UTC);
            t(a).cmp(&t(b))
        })
        .then_with(|| a.aln.cmp(&b.aln))
        .then_with(|| a.entry.slot.cmp(&b.entry.slot))
}

/// Reservation context of the request looking for a volume.
#[derive(Debug, Clone, Copy)]
pub struct OwnerContext<'a> {
    pub owner: &'a str,
    pub fsname: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct VolumeRefTable {
    entries: Vec<VolRefEntry>,
    index: HashMap<(String, String), usize>,
    generation: u64,
}

impl VolumeRefTable {
    /// Build from the catalog. Volumes in libraries the archiver does not
    /// know, or in disk libraries, are left out.
    pub fn build(catalog: &dyn Catalog, libs: &ArchLibTable) -> Self {
        let generation = catalog.generation();
        let mut entries: Vec<VolRefEntry> = catalog
            .entries()
            .into_iter()
            .filter_map(|entry| {
                let aln = libs.find_eq(entry.eq)?;
                if libs.libs[aln].is_disk_like() {
                    return None;
                }
                Some(VolRefEntry { aln, entry })
            })
            .collect();
        entries.sort_by(cmp_vol_ref);
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| ((e.entry.mtype.clone(), e.entry.vsn.clone()), i))
            .collect();
        if entries.is_empty() {
            debug!("No removable archive media available");
        }
        Self {
            entries,
            index,
            generation,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn entries(&self) -> &[VolRefEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn find(&self, mtype: &str, vsn: &str) -> Option<usize> {
        self.index.get(&(mtype.to_string(), vsn.to_string())).copied()
    }

    /// Snapshot of one table entry.
    pub fn volume_info(&self, vin: usize, libs: &ArchLibTable) -> VolumeInfo {
        let vr = &self.entries[vin];
        let ce = &vr.entry;
        let usable = ce.usable();
        VolumeInfo {
            mtype: ce.mtype.clone(),
            vsn: ce.vsn.clone(),
            capacity: ce.capacity,
            space: ce.usable_space(),
            aln: vr.aln,
            slot: ce.slot,
            flags: VolumeFlags {
                busy: false,
                loaded: usable && libs.is_loaded(vr.aln, &ce.mtype, &ce.vsn),
                reserved: ce.reservation.is_some(),
                unusable: !usable,
            },
        }
    }

    /// Start a search for `set`. Without an owner context the cursor is
    /// in lister mode: the loaded and reserved phases are skipped.
    pub fn cursor<'a>(
        &'a self,
        set: &'a ArchiveSet,
        libs: &'a ArchLibTable,
        ctx: Option<OwnerContext<'a>>,
    ) -> RemovableCursor<'a> {
        let asname = if set.reserve.set { set.name.as_str() } else { "" };
        let owner = match ctx {
            Some(c) if set.reserve.owner.is_some() => c.owner,
            _ => "",
        };
        let fsname = match ctx {
            Some(c) if set.reserve.fs => c.fsname,
            _ => "",
        };
        RemovableCursor {
            table: self,
            set,
            libs,
            asname,
            owner,
            fsname,
            lister: ctx.is_none(),
            phase: Phase::Loaded,
            aln: 0,
            adn: 0,
            vin: 0,
            exprs: set.vsns.iter().flat_map(|d| d.expressions()).collect(),
            expr_idx: 0,
            returned: HashSet::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Loaded,
    Reserved,
    Descriptors,
    Done,
}

/// Explicit continuation state of a volume search.
pub struct RemovableCursor<'a> {
    table: &'a VolumeRefTable,
    set: &'a ArchiveSet,
    libs: &'a ArchLibTable,
    asname: &'a str,
    owner: &'a str,
    fsname: &'a str,
    lister: bool,
    phase: Phase,
    aln: usize,
    adn: usize,
    vin: usize,
    exprs: Vec<Option<&'a Regex>>,
    expr_idx: usize,
    returned: HashSet<usize>,
}

impl RemovableCursor<'_> {
    fn reservation_ok(&self, ce: &CatalogEntry) -> bool {
        ce.reservation
            .as_ref()
            .map_or(true, |r| r.matches(self.asname, self.owner, self.fsname))
    }

    fn acceptable(&self, ce: &CatalogEntry) -> bool {
        self.set.mtype.as_deref() == Some(ce.mtype.as_str())
            && self.reservation_ok(ce)
            && self.set.vsns.iter().any(|d| d.matches(&ce.vsn))
    }

    fn take(&mut self, vin: usize) -> Option<VolumeInfo> {
        if !self.returned.insert(vin) {
            return None;
        }
        let vi = self.table.volume_info(vin, self.libs);
        trace!("Volume {}.{} offered for {}", vi.mtype, vi.vsn, self.set.name);
        Some(vi)
    }

    fn next_loaded(&mut self) -> Option<VolumeInfo> {
        while self.aln < self.libs.libs.len() {
            let lib = &self.libs.libs[self.aln];
            if self.adn >= lib.drives.len() || lib.is_disk_like() || lib.class().is_none() {
                self.aln += 1;
                self.adn = 0;
                continue;
            }
            let drive = &lib.drives[self.adn];
            self.adn += 1;
            let Some(loaded) = &drive.loaded else {
                continue;
            };
            let Some(vin) = self.table.find(&loaded.mtype, &loaded.vsn) else {
                continue;
            };
            let ce = &self.table.entries[vin].entry;
            if ce.usable() && !ce.labeled_empty() && self.acceptable(ce) {
                if let Some(vi) = self.take(vin) {
                    return Some(vi);
                }
            }
        }
        None
    }

    fn next_reserved(&mut self) -> Option<VolumeInfo> {
        if self.set.reserve.is_none() {
            return None;
        }
        while self.vin < self.table.entries.len() {
            let vin = self.vin;
            self.vin += 1;
            let ce = &self.table.entries[vin].entry;
            if !ce.usable() {
                // the rest of the table is unusable too
                self.vin = self.table.entries.len();
                break;
            }
            if ce.reservation.is_some() && self.acceptable(ce) {
                if let Some(vi) = self.take(vin) {
                    return Some(vi);
                }
            }
        }
        None
    }

    fn next_matching(&mut self) -> Option<VolumeInfo> {
        let mtype = self.set.mtype.as_deref()?;
        while self.expr_idx < self.exprs.len() {
            let expr = self.exprs[self.expr_idx];
            while self.vin < self.table.entries.len() {
                let vin = self.vin;
                self.vin += 1;
                let ce = &self.table.entries[vin].entry;
                if !ce.usable() {
                    self.vin = self.table.entries.len();
                    break;
                }
                if !self.reservation_ok(ce) || ce.mtype != mtype {
                    continue;
                }
                if expr.map_or(true, |re| re.is_match(&ce.vsn)) {
                    if let Some(vi) = self.take(vin) {
                        return Some(vi);
                    }
                }
            }
            self.expr_idx += 1;
            self.vin = 0;
        }
        None
    }
}

impl Iterator for RemovableCursor<'_> {
    type Item = VolumeInfo;

    fn next(&mut self) -> Option<VolumeInfo> {
        loop {
            match self.phase {
                Phase::Loaded => {
                    if !self.lister {
                        if let Some(vi) = self.next_loaded() {
                            return Some(vi);
                        }
                    }
                    self.phase = Phase::Reserved;
                    self.vin = 0;
                }
                Phase::Reserved => {
                    if !self.lister {
                        if let Some(vi) = self.next_reserved() {
                            return Some(vi);
                        }
                    }
                    self.phase = Phase::Descriptors;
                    self.vin = 0;
                    self.expr_idx = 0;
                }
                Phase::Descriptors => {
                    if let Some(vi) = self.next_matching() {
                        return Some(vi);
                    }
                    self.phase = Phase::Done;
                }
                Phase::Done => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::device::{DeviceLayer, StaticDeviceLayer};
    use crate::volume::catalog::{InMemoryCatalog, Reservation};
    use chrono::TimeZone;

    const GIB: u64 = 1 << 30;

    const CONFIG: &str = r#"
[[vsn_pool]]
name = "scratch"
vsns = ["^S"]

[[archive_set]]
name = "home.1"
mtype = "li"
vsns = ["^VOL"]
vsn_pools = ["scratch"]

[[archive_set]]
name = "proj.1"
mtype = "li"
reserve = ["set", "fs"]
vsns = [".*"]

[[archive_set]]
name = "none.1"
mtype = "li"
vsns = ["^NOMATCH"]

[[library]]
name = "lib50"
eq = 50
kind = "robot"

[[library.drive]]
name = "lt0"
eq = 51
mtype = "li"
vsn = "VOL002"

[[library.drive]]
name = "lt1"
eq = 52
"#;

    fn labeled(slot: u32, vsn: &str, space: u64, day: u32) -> CatalogEntry {
        let mut ce = CatalogEntry::new(50, slot, "li", vsn, 100 * GIB, space);
        ce.label_time = Some(Utc.with_ymd_and_hms(2024, 1, day, 0, 0, 0).unwrap());
        ce
    }

    fn catalog() -> InMemoryCatalog {
        let mut blank = CatalogEntry::new(50, 1, "li", "VOL009", 100 * GIB, 100 * GIB);
        blank.status.labeled = false;
        let mut full = labeled(2, "VOL008", 50 * GIB, 1);
        full.status.archive_full = true;
        let mut reserved = labeled(8, "VOL007", 60 * GIB, 9);
        reserved.reservation = Some(Reservation {
            time: Utc::now(),
            asname: "other.1".into(),
            owner: String::new(),
            fsname: String::new(),
        });
        InMemoryCatalog::new(vec![
            blank,
            full,
            labeled(3, "VOL003", 40 * GIB, 5),
            labeled(4, "VOL002", 30 * GIB, 7),
            labeled(5, "VOL001", 20 * GIB, 3),
            labeled(6, "SCR01", 100 * GIB, 2),
            labeled(7, "XYZ01", 10 * GIB, 1),
            reserved,
            CatalogEntry::new(99, 1, "li", "VOL100", 100 * GIB, 90 * GIB),
        ])
    }

    fn setup() -> (config::ConfigSnapshot, ArchLibTable, VolumeRefTable) {
        let cfg = config::parse(CONFIG).unwrap();
        let libs = ArchLibTable::build(&StaticDeviceLayer::new(&cfg.libraries).status(), None);
        let table = VolumeRefTable::build(&catalog(), &libs);
        (cfg, libs, table)
    }

    #[test]
    fn test_table_order() {
        let (_, _, table) = setup();
        let vsns: Vec<&str> = table.entries().iter().map(|e| e.entry.vsn.as_str()).collect();
        // unknown library eq 99 is dropped
        assert_eq!(
            vsns,
            vec!["XYZ01", "VOL001", "VOL003", "VOL002", "VOL007", "SCR01", "VOL009", "VOL008"]
        );
    }

    #[test]
    fn test_loaded_volume_first_then_descriptors() {
        let (cfg, libs, table) = setup();
        let set = cfg.archive_set("home.1").unwrap();
        let ctx = OwnerContext {
            owner: "",
            fsname: "samfs1",
        };
        let vols: Vec<VolumeInfo> = table.cursor(set, &libs, Some(ctx)).collect();
        let vsns: Vec<&str> = vols.iter().map(|v| v.vsn.as_str()).collect();
        assert_eq!(vsns, vec!["VOL002", "VOL001", "VOL003", "VOL009", "SCR01"]);
        assert!(vols[0].flags.loaded);
        assert!(!vols[1].flags.loaded);
    }

    #[test]
    fn test_lister_mode_skips_loaded_phase() {
        let (cfg, libs, table) = setup();
        let set = cfg.archive_set("home.1").unwrap();
        let vsns: Vec<String> = table.cursor(set, &libs, None).map(|v| v.vsn).collect();
        assert_eq!(vsns, vec!["VOL001", "VOL003", "VOL002", "VOL009", "SCR01"]);
    }

    #[test]
    fn test_reserved_volumes_are_private() {
        let (cfg, libs, table) = setup();
        let set = cfg.archive_set("proj.1").unwrap();
        let ctx = OwnerContext {
            owner: "",
            fsname: "samfs1",
        };
        let vsns: Vec<String> = table.cursor(set, &libs, Some(ctx)).map(|v| v.vsn).collect();
        assert!(!vsns.contains(&"VOL007".to_string()));
        assert!(!vsns.contains(&"VOL008".to_string()));
        assert_eq!(vsns.len(), 6);
    }

    #[test]
    fn test_no_matching_descriptor() {
        let (cfg, libs, table) = setup();
        let set = cfg.archive_set("none.1").unwrap();
        let ctx = OwnerContext {
            owner: "",
            fsname: "samfs1",
        };
        assert!(table.cursor(set, &libs, Some(ctx)).next().is_none());
    }
}
