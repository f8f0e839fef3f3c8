//! Disk volume and honeycomb silo selection

use super::{dk_vol_capacity, dk_vol_space, VolumeFlags, VolumeInfo};
use crate::config::{ArchiveSet, LibraryKind};
use crate::device::ArchLibTable;
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiskVolumeFlags {
    pub unavailable: bool,
    pub bad_media: bool,
    pub read_only: bool,
    /// Not available to the archiver.
    pub archive_excluded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskVolumeInfo {
    pub vsn: String,
    pub capacity: u64,
    pub space: u64,
    #[serde(default)]
    pub honeycomb: bool,
    #[serde(default)]
    pub flags: DiskVolumeFlags,
}

impl DiskVolumeInfo {
    pub fn new(vsn: &str, capacity: u64, space: u64) -> Self {
        Self {
            vsn: vsn.to_string(),
            capacity,
            space,
            honeycomb: false,
            flags: DiskVolumeFlags::default(),
        }
    }

    pub fn is_available(&self) -> bool {
        !self.flags.unavailable && !self.flags.archive_excluded
    }

    pub fn usable(&self) -> bool {
        !(self.flags.bad_media || self.flags.read_only || self.flags.unavailable) && dk_vol_space(self) != 0
    }
}

/// Disk volume registry collaborator, keyed by volume name.
pub trait DiskVolumeDictionary: Send + Sync {
    fn names(&self) -> Vec<String>;
    fn get(&self, vsn: &str) -> Option<DiskVolumeInfo>;
    fn consume_space(&self, vsn: &str, bytes: u64);
}

#[derive(Debug, Default)]
pub struct InMemoryDiskDictionary {
    volumes: RwLock<BTreeMap<String, DiskVolumeInfo>>,
}

impl InMemoryDiskDictionary {
    pub fn new(volumes: Vec<DiskVolumeInfo>) -> Self {
        Self {
            volumes: RwLock::new(volumes.into_iter().map(|v| (v.vsn.clone(), v)).collect()),
        }
    }
}

impl DiskVolumeDictionary for InMemoryDiskDictionary {
    fn names(&self) -> Vec<String> {
        self.volumes.read().keys().cloned().collect()
    }

    fn get(&self, vsn: &str) -> Option<DiskVolumeInfo> {
        self.volumes.read().get(vsn).cloned()
    }

    fn consume_space(&self, vsn: &str, bytes: u64) {
        if let Some(dv) = self.volumes.write().get_mut(vsn) {
            dv.space = dv.space.saturating_sub(bytes);
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DiskVolumeTable {
    names: Vec<String>,
    disk_aln: Option<usize>,
    honeycomb_aln: Option<usize>,
}

impl DiskVolumeTable {
    pub fn build(dict: &dyn DiskVolumeDictionary, libs: &ArchLibTable) -> Self {
        let find = |kind: LibraryKind| libs.libs.iter().position(|l| l.kind == kind);
        let any = libs.libs.iter().position(|l| l.is_disk_like());
        Self {
            names: dict.names(),
            disk_aln: find(LibraryKind::Disk).or(any),
            honeycomb_aln: find(LibraryKind::Honeycomb).or(any),
        }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Start a fresh pass over the volumes a set may use.
    pub fn cursor<'a>(&'a self, set: &'a ArchiveSet, dict: &'a dyn DiskVolumeDictionary) -> DiskVolumeCursor<'a> {
        let exprs = set.vsns.iter().flat_map(|d| d.expressions()).collect();
        let aln = if set.is_honeycomb() {
            self.honeycomb_aln
        } else {
            self.disk_aln
        };
        DiskVolumeCursor {
            table: self,
            dict,
            set,
            aln,
            exprs,
            expr_idx: 0,
            vin: 0,
            selected: HashSet::new(),
        }
    }
}

/// Iterates usable disk volumes matching a set's VSN descriptors.
/// Each volume is returned at most once per cursor.
pub struct DiskVolumeCursor<'a> {
    table: &'a DiskVolumeTable,
    dict: &'a dyn DiskVolumeDictionary,
    set: &'a ArchiveSet,
    aln: Option<usize>,
    exprs: Vec<Option<&'a Regex>>,
    expr_idx: usize,
    vin: usize,
    selected: HashSet<usize>,
}

impl Iterator for DiskVolumeCursor<'_> {
    type Item = VolumeInfo;

    fn next(&mut self) -> Option<VolumeInfo> {
        let aln = self.aln?;
        let mtype = self.set.mtype.as_deref()?;
        while self.expr_idx < self.exprs.len() {
            let expr = self.exprs[self.expr_idx];
            while self.vin < self.table.names.len() {
                let vin = self.vin;
                self.vin += 1;
                if self.selected.contains(&vin) {
                    continue;
                }
                let name = &self.table.names[vin];
                if !expr.map_or(true, |re| re.is_match(name)) {
                    continue;
                }
                let Some(dv) = self.dict.get(name) else {
                    continue;
                };
                if dv.honeycomb != self.set.is_honeycomb() || !dv.is_available() || !dv.usable() {
                    continue;
                }
                self.selected.insert(vin);
                return Some(VolumeInfo {
                    mtype: mtype.to_string(),
                    vsn: dv.vsn.clone(),
                    capacity: dk_vol_capacity(&dv),
                    space: dk_vol_space(&dv),
                    aln,
                    slot: None,
                    flags: VolumeFlags::default(),
                });
            }
            self.expr_idx += 1;
            self.vin = 0;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;

    const CONFIG: &str = r#"
[[archive_set]]
name = "dkset.1"
mtype = "dk"
vsns = ["^disk0[12]$", "^disk"]

[[archive_set]]
name = "cbset.1"
mtype = "cb"
vsns = [".*"]

[[library]]
name = "diskarch"
eq = 90
kind = "disk"

[[library]]
name = "silo"
eq = 91
kind = "honeycomb"
"#;

    fn setup() -> (config::ConfigSnapshot, ArchLibTable, InMemoryDiskDictionary) {
        use crate::device::{DeviceLayer, StaticDeviceLayer};
        let cfg = config::parse(CONFIG).unwrap();
        let libs = ArchLibTable::build(&StaticDeviceLayer::new(&cfg.libraries).status(), None);
        let mut full = DiskVolumeInfo::new("disk03", 100, 0);
        full.space = 0;
        let mut silo = DiskVolumeInfo::new("silo1", 0, 0);
        silo.honeycomb = true;
        let mut excluded = DiskVolumeInfo::new("disk04", 100, 50);
        excluded.flags.archive_excluded = true;
        let dict = InMemoryDiskDictionary::new(vec![
            DiskVolumeInfo::new("disk01", 100, 80),
            DiskVolumeInfo::new("disk02", 100, 10),
            full,
            excluded,
            DiskVolumeInfo::new("disk05", 100, 70),
            silo,
        ]);
        (cfg, libs, dict)
    }

    #[test]
    fn test_each_volume_returned_once() {
        let (cfg, libs, dict) = setup();
        let table = DiskVolumeTable::build(&dict, &libs);
        let set = cfg.archive_set("dkset.1").unwrap();
        let vsns: Vec<String> = table.cursor(set, &dict).map(|v| v.vsn).collect();
        assert_eq!(vsns, vec!["disk01", "disk02", "disk05"]);
        // a fresh cursor starts over
        assert_eq!(table.cursor(set, &dict).count(), 3);
    }

    #[test]
    fn test_honeycomb_set_only_sees_silos() {
        let (cfg, libs, dict) = setup();
        let table = DiskVolumeTable::build(&dict, &libs);
        let set = cfg.archive_set("cbset.1").unwrap();
        let vols: Vec<VolumeInfo> = table.cursor(set, &dict).collect();
        assert_eq!(vols.len(), 1);
        assert_eq!(vols[0].vsn, "silo1");
        assert_eq!(vols[0].aln, 1);
        assert_eq!(vols[0].space, super::super::HONEYCOMB_SPACE);
        assert!(vols[0].space <= vols[0].capacity);
    }
}
