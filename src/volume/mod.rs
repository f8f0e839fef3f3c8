//! Volumes the archiver can write to or stage from
//!
//! Removable volumes come from the library catalog, disk and honeycomb
//! volumes from the disk volume dictionary. Both are summarised as
//! [`VolumeInfo`] snapshots whose space already carries the slack
//! discount used for sizing decisions.

pub mod catalog;
pub mod disk;
pub mod lister;
pub mod reference;

pub use catalog::{
    load_inventory, Catalog, CatalogEntry, CatalogStatus, InMemoryCatalog, Inventory, Reservation,
};
pub use disk::{
    DiskVolumeCursor, DiskVolumeDictionary, DiskVolumeFlags, DiskVolumeInfo, DiskVolumeTable,
    InMemoryDiskDictionary,
};
pub use lister::{list_volumes, sets_without_volumes, ListedVolume, SetVolumes};
pub use reference::{OwnerContext, RemovableCursor, VolumeRefTable};

use crate::config::{MediaKind, DISK_MTYPE};
use crate::device::ArchLibTable;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Fraction of a tape's capacity held back because the true end of
/// tape is unknown.
pub const TAPE_SPACE_FACTOR: f64 = 0.02;
/// Optical space discount.
pub const SPACE_DISCOUNT: f64 = 0.99;
/// Optical space reserve in bytes.
pub const SPACE_FACTOR: u64 = 2048 * 1024;
/// Nominal space reported for a honeycomb silo.
pub const HONEYCOMB_SPACE: u64 = 1 << 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VolumeFlags {
    /// In use by another archive request.
    pub busy: bool,
    /// Mounted in a drive.
    pub loaded: bool,
    pub reserved: bool,
    pub unusable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeInfo {
    pub mtype: String,
    pub vsn: String,
    pub capacity: u64,
    /// Usable space after the media discount.
    pub space: u64,
    /// Archive library index.
    pub aln: usize,
    pub slot: Option<u32>,
    pub flags: VolumeFlags,
}

/// Usable space of a removable volume.
pub fn rm_vol_space(kind: MediaKind, space: u64, capacity: u64) -> u64 {
    let fspace = match kind {
        MediaKind::Optical => SPACE_DISCOUNT * space as f64 - SPACE_FACTOR as f64,
        _ => space as f64 - TAPE_SPACE_FACTOR * capacity as f64,
    };
    if fspace <= 0.0 {
        0
    } else {
        (fspace as u64).min(capacity)
    }
}

/// Capacity reported for a disk volume; a honeycomb silo never reports
/// less than its nominal space.
pub fn dk_vol_capacity(dv: &DiskVolumeInfo) -> u64 {
    if dv.honeycomb {
        dv.capacity.max(HONEYCOMB_SPACE)
    } else {
        dv.capacity
    }
}

/// Usable space of a disk volume or honeycomb silo.
pub fn dk_vol_space(dv: &DiskVolumeInfo) -> u64 {
    if dv.honeycomb {
        HONEYCOMB_SPACE
    } else {
        dv.space
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageAvailability {
    Unavailable,
    Available {
        /// The volume sits in a simulated library.
        simulated: bool,
    },
}

impl StageAvailability {
    pub fn is_available(self) -> bool {
        matches!(self, StageAvailability::Available { .. })
    }
}

/// Shared catalog, disk dictionary and the reference tables derived
/// from them.
pub struct VolumeTables {
    catalog: Arc<dyn Catalog>,
    disk: Arc<dyn DiskVolumeDictionary>,
    removable: Mutex<Arc<VolumeRefTable>>,
    disk_table: Mutex<Arc<DiskVolumeTable>>,
}

impl VolumeTables {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        disk: Arc<dyn DiskVolumeDictionary>,
        libs: &ArchLibTable,
    ) -> Self {
        let removable = VolumeRefTable::build(catalog.as_ref(), libs);
        let disk_table = DiskVolumeTable::build(disk.as_ref(), libs);
        Self {
            catalog,
            disk,
            removable: Mutex::new(Arc::new(removable)),
            disk_table: Mutex::new(Arc::new(disk_table)),
        }
    }

    pub fn catalog(&self) -> &dyn Catalog {
        self.catalog.as_ref()
    }

    pub fn disk_dictionary(&self) -> &dyn DiskVolumeDictionary {
        self.disk.as_ref()
    }

    /// Current removable table; rebuilt when the catalog has changed.
    pub fn removable(&self, libs: &ArchLibTable) -> Arc<VolumeRefTable> {
        let mut table = self.removable.lock();
        if table.generation() != self.catalog.generation() {
            debug!("Catalog changed, rebuilding volume reference table");
            *table = Arc::new(VolumeRefTable::build(self.catalog.as_ref(), libs));
        }
        table.clone()
    }

    pub fn disk(&self) -> Arc<DiskVolumeTable> {
        self.disk_table.lock().clone()
    }

    /// Rebuild both tables after a library table change.
    pub fn rebuild(&self, libs: &ArchLibTable) {
        *self.removable.lock() = Arc::new(VolumeRefTable::build(self.catalog.as_ref(), libs));
        *self.disk_table.lock() = Arc::new(DiskVolumeTable::build(self.disk.as_ref(), libs));
    }

    /// Can a file on this volume be staged right now.
    pub fn stage_availability(&self, libs: &ArchLibTable, media: &str, vsn: &str) -> StageAvailability {
        if media == DISK_MTYPE {
            return match self.disk.get(vsn) {
                Some(dv) if !dv.flags.unavailable && !dv.flags.bad_media => {
                    StageAvailability::Available { simulated: false }
                }
                _ => StageAvailability::Unavailable,
            };
        }
        let Some(ce) = self.catalog.lookup(media, vsn) else {
            return StageAvailability::Unavailable;
        };
        if !ce.available() {
            return StageAvailability::Unavailable;
        }
        match libs.find_eq(ce.eq).map(|aln| &libs.libs[aln]) {
            Some(lib) if lib.available && lib.drives_avail != 0 => StageAvailability::Available {
                simulated: lib.simulated,
            },
            _ => StageAvailability::Unavailable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tape_space_holds_back_two_percent() {
        let gib = 1u64 << 30;
        assert_eq!(rm_vol_space(MediaKind::Tape, 10 * gib, 100 * gib), 8 * gib);
        assert_eq!(rm_vol_space(MediaKind::Tape, gib, 100 * gib), 0);
    }

    #[test]
    fn test_optical_space_discount() {
        let space = 100u64 << 20;
        let expected = (0.99 * space as f64 - (2048 * 1024) as f64) as u64;
        assert_eq!(rm_vol_space(MediaKind::Optical, space, 600 << 20), expected);
        assert_eq!(rm_vol_space(MediaKind::Optical, 1 << 20, 600 << 20), 0);
    }

    #[test]
    fn test_space_never_exceeds_capacity() {
        assert_eq!(rm_vol_space(MediaKind::Tape, 500, 100), 100);
    }

    #[test]
    fn test_honeycomb_space_is_nominal() {
        let mut dv = DiskVolumeInfo::new("silo1", 0, 0);
        assert_eq!(dk_vol_space(&dv), 0);
        dv.honeycomb = true;
        assert_eq!(dk_vol_space(&dv), HONEYCOMB_SPACE);
    }
}
