//! Removable media catalog
//!
//! The catalog records every cartridge the libraries hold. The archiver
//! reads it to pick volumes and writes back reservations, archive-full
//! marks and consumed space.

use super::disk::DiskVolumeInfo;
use super::rm_vol_space;
use crate::config::MediaKind;
use crate::error::{Result, RustArchiverError};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogStatus {
    /// Slot is occupied.
    pub in_use: bool,
    pub labeled: bool,
    pub bad_media: bool,
    pub unavailable: bool,
    pub read_only: bool,
    pub write_protect: bool,
    pub archive_full: bool,
    pub recycle: bool,
    pub cleaning: bool,
}

impl Default for CatalogStatus {
    fn default() -> Self {
        Self {
            in_use: true,
            labeled: true,
            bad_media: false,
            unavailable: false,
            read_only: false,
            write_protect: false,
            archive_full: false,
            recycle: false,
            cleaning: false,
        }
    }
}

/// Ownership of a volume by an archive set, owner and filesystem.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    pub time: DateTime<Utc>,
    #[serde(default)]
    pub asname: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub fsname: String,
}

impl Reservation {
    /// True when the reservation belongs to exactly this triple.
    pub fn matches(&self, asname: &str, owner: &str, fsname: &str) -> bool {
        self.asname == asname && self.owner == owner && self.fsname == fsname
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogEntry {
    /// Library equipment number.
    pub eq: u32,
    #[serde(default)]
    pub slot: Option<u32>,
    pub mtype: String,
    pub vsn: String,
    /// Bytes.
    pub capacity: u64,
    /// Bytes remaining.
    pub space: u64,
    #[serde(default)]
    pub label_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: CatalogStatus,
    #[serde(default)]
    pub reservation: Option<Reservation>,
}

impl CatalogEntry {
    pub fn new(eq: u32, slot: u32, mtype: &str, vsn: &str, capacity: u64, space: u64) -> Self {
        Self {
            eq,
            slot: Some(slot),
            mtype: mtype.to_string(),
            vsn: vsn.to_string(),
            capacity,
            space,
            label_time: None,
            status: CatalogStatus::default(),
            reservation: None,
        }
    }

    fn identified(&self) -> bool {
        self.status.in_use && !self.mtype.is_empty() && !self.vsn.is_empty()
    }

    /// Can be staged from.
    pub fn available(&self) -> bool {
        self.identified()
            && !(self.status.unavailable || self.status.bad_media || self.status.cleaning)
    }

    /// Can be archived to.
    pub fn usable(&self) -> bool {
        let s = &self.status;
        self.identified()
            && !(s.bad_media
                || s.unavailable
                || s.read_only
                || s.write_protect
                || s.archive_full
                || s.recycle
                || s.cleaning)
            && self.usable_space() != 0
    }

    pub fn usable_space(&self) -> u64 {
        rm_vol_space(MediaKind::from_mtype(&self.mtype), self.space, self.capacity)
    }

    /// Labeled but holding no data yet.
    pub fn labeled_empty(&self) -> bool {
        self.status.labeled && self.space >= self.capacity
    }
}

/// Library catalog collaborator.
pub trait Catalog: Send + Sync {
    fn entries(&self) -> Vec<CatalogEntry>;
    fn lookup(&self, mtype: &str, vsn: &str) -> Option<CatalogEntry>;
    fn set_archive_full(&self, mtype: &str, vsn: &str) -> Result<()>;
    fn reserve(&self, mtype: &str, vsn: &str, reservation: Reservation) -> Result<()>;
    fn consume_space(&self, mtype: &str, vsn: &str, bytes: u64) -> Result<()>;
    /// Bumped on every change so derived tables know to rebuild.
    fn generation(&self) -> u64;
}

#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    entries: RwLock<Vec<CatalogEntry>>,
    generation: AtomicU64,
}

impl InMemoryCatalog {
    pub fn new(entries: Vec<CatalogEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
            generation: AtomicU64::new(1),
        }
    }

    fn update<F>(&self, mtype: &str, vsn: &str, f: F) -> Result<()>
    where
        F: FnOnce(&mut CatalogEntry),
    {
        let mut entries = self.entries.write();
        let ce = entries
            .iter_mut()
            .find(|e| e.mtype == mtype && e.vsn == vsn)
            .ok_or_else(|| RustArchiverError::catalog(format!("volume {}.{} not in catalog", mtype, vsn)))?;
        f(ce);
        self.generation.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl Catalog for InMemoryCatalog {
    fn entries(&self) -> Vec<CatalogEntry> {
        self.entries.read().clone()
    }

    fn lookup(&self, mtype: &str, vsn: &str) -> Option<CatalogEntry> {
        self.entries
            .read()
            .iter()
            .find(|e| e.mtype == mtype && e.vsn == vsn)
            .cloned()
    }

    fn set_archive_full(&self, mtype: &str, vsn: &str) -> Result<()> {
        info!("Volume {}.{} set archive full", mtype, vsn);
        self.update(mtype, vsn, |ce| ce.status.archive_full = true)
    }

    fn reserve(&self, mtype: &str, vsn: &str, reservation: Reservation) -> Result<()> {
        info!(
            "Reserving {}.{} to {}/{}/{}",
            mtype, vsn, reservation.asname, reservation.owner, reservation.fsname
        );
        self.update(mtype, vsn, |ce| ce.reservation = Some(reservation))
    }

    fn consume_space(&self, mtype: &str, vsn: &str, bytes: u64) -> Result<()> {
        debug!("Volume {}.{} wrote {} bytes", mtype, vsn, bytes);
        self.update(mtype, vsn, |ce| {
            ce.space = ce.space.saturating_sub(bytes);
            ce.status.labeled = true;
            if ce.label_time.is_none() {
                ce.label_time = Some(Utc::now());
            }
        })
    }

    fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

/// Catalog and disk volume contents read from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub catalog: Vec<CatalogEntry>,
    #[serde(default)]
    pub disk_volumes: Vec<DiskVolumeInfo>,
}

pub fn load_inventory(path: &Path) -> Result<Inventory> {
    let text = std::fs::read_to_string(path)?;
    let inventory: Inventory = serde_json::from_str(&text)?;
    info!(
        "Loaded {} catalog entries and {} disk volumes from {}",
        inventory.catalog.len(),
        inventory.disk_volumes.len(),
        path.display()
    );
    Ok(inventory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const GIB: u64 = 1 << 30;

    #[test]
    fn test_usable_and_available() {
        let mut ce = CatalogEntry::new(50, 1, "li", "VOL001", 100 * GIB, 50 * GIB);
        assert!(ce.usable());
        assert!(ce.available());
        ce.status.archive_full = true;
        assert!(!ce.usable());
        assert!(ce.available());
        ce.status.archive_full = false;
        ce.space = GIB;
        assert!(!ce.usable(), "less than the tape reserve left");
        ce.status.bad_media = true;
        assert!(!ce.available());
    }

    #[test]
    fn test_updates_bump_generation() {
        let catalog = InMemoryCatalog::new(vec![CatalogEntry::new(50, 1, "li", "VOL001", 100 * GIB, 100 * GIB)]);
        let g = catalog.generation();
        catalog.consume_space("li", "VOL001", 10 * GIB).unwrap();
        assert!(catalog.generation() > g);
        let ce = catalog.lookup("li", "VOL001").unwrap();
        assert_eq!(ce.space, 90 * GIB);
        assert!(ce.label_time.is_some());
        assert!(catalog.set_archive_full("li", "NOPE").is_err());
    }

    #[test]
    fn test_reservation_matches_triple() {
        let r = Reservation {
            time: Utc::now(),
            asname: "home.1".into(),
            owner: String::new(),
            fsname: "samfs1".into(),
        };
        assert!(r.matches("home.1", "", "samfs1"));
        assert!(!r.matches("home.1", "", "samfs2"));
    }

    #[test]
    fn test_load_inventory() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{
  "catalog": [
    {{ "eq": 50, "slot": 3, "mtype": "li", "vsn": "VOL003", "capacity": 1000, "space": 900,
       "status": {{ "read_only": true }} }}
  ],
  "disk_volumes": [ {{ "vsn": "disk01", "capacity": 5000, "space": 4000 }} ]
}}"#
        )
        .unwrap();
        let inv = load_inventory(file.path()).unwrap();
        assert_eq!(inv.catalog.len(), 1);
        assert!(inv.catalog[0].status.read_only);
        assert!(inv.catalog[0].status.in_use);
        assert_eq!(inv.disk_volumes[0].space, 4000);
    }
}
