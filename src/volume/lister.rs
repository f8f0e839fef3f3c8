//! Volumes each archive set may use, in selection order.

use super::VolumeTables;
use crate::config::ConfigSnapshot;
use crate::device::ArchLibTable;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ListedVolume {
    pub mtype: String,
    pub vsn: String,
    pub library: String,
    pub slot: Option<u32>,
    pub capacity: u64,
    pub space: u64,
    pub loaded: bool,
    /// `set/owner/fs` of a catalog reservation.
    pub reserved: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SetVolumes {
    pub set: String,
    pub volumes: Vec<ListedVolume>,
}

/// Walk a fresh cursor for every archive set that receives copies.
pub fn list_volumes(config: &ConfigSnapshot, tables: &VolumeTables, libs: &ArchLibTable) -> Vec<SetVolumes> {
    let removable = tables.removable(libs);
    let disk = tables.disk();
    let library = |aln: usize| libs.libs.get(aln).map(|l| l.name.clone()).unwrap_or_default();

    config
        .copy_sets()
        .map(|set| {
            let volumes = if set.is_disk() || set.is_honeycomb() {
                disk.cursor(set, tables.disk_dictionary())
                    .map(|vi| ListedVolume {
                        library: library(vi.aln),
                        mtype: vi.mtype,
                        vsn: vi.vsn,
                        slot: None,
                        capacity: vi.capacity,
                        space: vi.space,
                        loaded: false,
                        reserved: None,
                    })
                    .collect()
            } else {
                removable
                    .cursor(set, libs, None)
                    .map(|vi| {
                        let reserved = tables
                            .catalog()
                            .lookup(&vi.mtype, &vi.vsn)
                            .and_then(|ce| ce.reservation)
                            .map(|r| format!("{}/{}/{}", r.asname, r.owner, r.fsname));
                        ListedVolume {
                            library: library(vi.aln),
                            mtype: vi.mtype,
                            vsn: vi.vsn,
                            slot: vi.slot,
                            capacity: vi.capacity,
                            space: vi.space,
                            loaded: vi.flags.loaded,
                            reserved,
                        }
                    })
                    .collect()
            };
            SetVolumes {
                set: set.name.clone(),
                volumes,
            }
        })
        .collect()
}

/// Number of sets left without any usable volume.
pub fn sets_without_volumes(listing: &[SetVolumes]) -> usize {
    listing.iter().filter(|s| s.volumes.is_empty()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::device::{DeviceLayer, StaticDeviceLayer};
    use crate::volume::{CatalogEntry, DiskVolumeInfo, InMemoryCatalog, InMemoryDiskDictionary, Reservation};
    use chrono::Utc;
    use std::sync::Arc;

    const GB: u64 = 1 << 30;

    #[test]
    fn test_list_per_set() {
        let cfg = config::parse(
            r#"
[[archive_set]]
name = "tape.1"
mtype = "li"
reserve = ["set"]
vsns = ["^T"]

[[archive_set]]
name = "dk.1"
mtype = "dk"
vsns = ["^d"]

[[archive_set]]
name = "empty.1"
mtype = "li"
vsns = ["^NONE"]

[[library]]
name = "lib50"
eq = 50
kind = "robot"

[[library.drive]]
name = "lt0"
eq = 51

[[library]]
name = "dklib"
eq = 90
kind = "disk"
"#,
        )
        .unwrap();
        let libs = ArchLibTable::build(&StaticDeviceLayer::new(&cfg.libraries).status(), None);
        let mut reserved = CatalogEntry::new(50, 2, "li", "T2", 100 * GB, 50 * GB);
        reserved.reservation = Some(Reservation {
            time: Utc::now(),
            asname: "tape.1".into(),
            owner: String::new(),
            fsname: String::new(),
        });
        let tables = VolumeTables::new(
            Arc::new(InMemoryCatalog::new(vec![
                CatalogEntry::new(50, 1, "li", "T1", 100 * GB, 90 * GB),
                reserved,
            ])),
            Arc::new(InMemoryDiskDictionary::new(vec![DiskVolumeInfo::new("d1", 10 * GB, 5 * GB)])),
            &libs,
        );

        let listing = list_volumes(&cfg, &tables, &libs);
        let by_set = |name: &str| listing.iter().find(|s| s.set == name).unwrap();

        let tape = by_set("tape.1");
        assert_eq!(tape.volumes.len(), 2);
        assert!(tape.volumes.iter().all(|v| v.library == "lib50"));
        let t2 = tape.volumes.iter().find(|v| v.vsn == "T2").unwrap();
        assert_eq!(t2.reserved.as_deref(), Some("tape.1//"));

        let dk = by_set("dk.1");
        assert_eq!(dk.volumes.len(), 1);
        assert_eq!(dk.volumes[0].space, 5 * GB);
        assert_eq!(dk.volumes[0].library, "dklib");

        assert!(by_set("empty.1").volumes.is_empty());
        assert_eq!(sets_without_volumes(&listing), 1);
    }
}
