//! Archive library and drive table
//!
//! The scheduler's view of which libraries and drives can be used right
//! now. The table is derived from live device status, supplied by a
//! [`DeviceLayer`], or from the static `[[library]]` configuration.

pub mod classifier;
pub mod command;

pub use classifier::{classifier_for, ErrorClassifier, RecoveryAction, SenseData};
pub use command::{CommandOutcome, CommandRunner, DeviceCommand};

use crate::config::{LibraryConfig, LibraryKind, MediaKind};
use crate::error::{Result, RustArchiverError};
use crate::volume::{rm_vol_space, Catalog, VolumeFlags, VolumeInfo};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Live state of one drive as reported by the device layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DriveStatus {
    pub name: String,
    pub eq: u32,
    pub on: bool,
    pub ready: bool,
    pub present: bool,
    pub labeled: bool,
    pub mtype: Option<String>,
    pub vsn: Option<String>,
    pub capacity: u64,
    pub space: u64,
    pub bad_media: bool,
    pub read_only: bool,
    pub write_protect: bool,
    pub strange: bool,
    pub unload: bool,
}

/// Live state of one library.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LibraryStatus {
    pub name: String,
    pub eq: u32,
    pub kind: LibraryKind,
    pub simulated: bool,
    pub on: bool,
    pub ready: bool,
    pub auditing: bool,
    /// Configured cap on drives used for archiving.
    pub drives_allow: Option<usize>,
    pub drives: Vec<DriveStatus>,
}

/// Platform device control.
pub trait DeviceLayer: Send + Sync {
    fn status(&self) -> Vec<LibraryStatus>;
    fn vendor(&self, lib_eq: u32) -> String;
    fn mount(&self, lib_eq: u32, drive_eq: u32, mtype: &str, vsn: &str) -> std::result::Result<(), SenseData>;
    fn dismount(&self, lib_eq: u32, drive_eq: u32) -> std::result::Result<(), SenseData>;
    fn reinit(&self, eq: u32);
    /// Turn a library or drive logically on or off.
    fn set_state(&self, eq: u32, on: bool);
}

/// Volume loaded in a ready drive, if it can be described.
pub fn get_drive_vol_info(drive: &DriveStatus) -> Option<VolumeInfo> {
    if !drive.on || !drive.ready || !drive.present || !drive.labeled {
        return None;
    }
    let mtype = drive.mtype.clone()?;
    let vsn = drive.vsn.clone().unwrap_or_default();
    let space = rm_vol_space(MediaKind::from_mtype(&mtype), drive.space, drive.capacity);
    let unusable = vsn.is_empty()
        || space == 0
        || drive.bad_media
        || drive.read_only
        || drive.write_protect
        || drive.strange
        || drive.unload;
    Some(VolumeInfo {
        mtype,
        vsn,
        capacity: drive.capacity,
        space,
        aln: 0,
        slot: None,
        flags: VolumeFlags {
            loaded: true,
            unusable,
            ..Default::default()
        },
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchDrive {
    pub name: String,
    pub eq: u32,
    pub available: bool,
    pub busy: bool,
    pub loaded: Option<VolumeInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArchLib {
    pub name: String,
    pub eq: u32,
    pub kind: LibraryKind,
    pub available: bool,
    pub simulated: bool,
    pub drives_allow: usize,
    pub drives_avail: usize,
    pub drives: Vec<ArchDrive>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveClass {
    Removable,
    Disk,
    Honeycomb,
}

impl ArchLib {
    pub fn class(&self) -> Option<DriveClass> {
        match self.kind {
            LibraryKind::Robot | LibraryKind::Manual => Some(DriveClass::Removable),
            LibraryKind::Disk => Some(DriveClass::Disk),
            LibraryKind::Honeycomb => Some(DriveClass::Honeycomb),
            LibraryKind::Historian => None,
        }
    }

    pub fn is_disk_like(&self) -> bool {
        self.kind.is_disk_like()
    }
}

/// Runtime archive library table.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ArchLibTable {
    pub libs: Vec<ArchLib>,
    pub robots: usize,
    pub manual_drives: usize,
    pub disk_libs: usize,
}

impl ArchLibTable {
    /// Build the table from scratch. Administrative drive caps from
    /// `previous` survive when the library name matches.
    pub fn build(status: &[LibraryStatus], previous: Option<&ArchLibTable>) -> Self {
        let mut table = ArchLibTable::default();
        for ls in status {
            match ls.kind {
                LibraryKind::Robot => table.robots += 1,
                LibraryKind::Manual => table.manual_drives += ls.drives.len(),
                LibraryKind::Disk | LibraryKind::Honeycomb => table.disk_libs += 1,
                LibraryKind::Historian => {}
            }
            let drives_allow = previous
                .and_then(|p| p.find_name(&ls.name).map(|i| p.libs[i].drives_allow))
                .or(ls.drives_allow)
                .unwrap_or(ls.drives.len());
            table.libs.push(ArchLib {
                name: ls.name.clone(),
                eq: ls.eq,
                kind: ls.kind,
                available: false,
                simulated: ls.simulated,
                drives_allow,
                drives_avail: 0,
                drives: ls
                    .drives
                    .iter()
                    .map(|d| ArchDrive {
                        name: d.name.clone(),
                        eq: d.eq,
                        available: false,
                        busy: false,
                        loaded: None,
                    })
                    .collect(),
            });
        }
        table.refresh_availability(status);
        info!(
            "Archive library table: {} robots, {} manual drives, {} disk libraries",
            table.robots, table.manual_drives, table.disk_libs
        );
        table
    }

    /// Update availability and loaded volumes without rebuilding.
    pub fn refresh_availability(&mut self, status: &[LibraryStatus]) {
        for (aln, lib) in self.libs.iter_mut().enumerate() {
            let Some(ls) = status.iter().find(|s| s.eq == lib.eq) else {
                lib.available = false;
                lib.drives_avail = 0;
                continue;
            };
            lib.available = match lib.kind {
                LibraryKind::Disk | LibraryKind::Honeycomb => true,
                LibraryKind::Historian => false,
                _ => ls.on && ls.ready && !ls.auditing,
            };
            let mut avail = 0;
            for drive in lib.drives.iter_mut() {
                let ds = ls.drives.iter().find(|d| d.name == drive.name);
                drive.available = lib.available
                    && (lib.kind.is_disk_like() || ds.map(|d| d.on).unwrap_or(false));
                drive.loaded = ds.and_then(get_drive_vol_info).map(|mut vi| {
                    vi.aln = aln;
                    vi
                });
                if drive.available {
                    avail += 1;
                }
            }
            lib.drives_avail = avail;
        }
    }

    pub fn find_eq(&self, eq: u32) -> Option<usize> {
        self.libs.iter().position(|l| l.eq == eq)
    }

    pub fn find_name(&self, name: &str) -> Option<usize> {
        self.libs.iter().position(|l| l.name == name)
    }

    /// Total of administrative drive caps for a class of archiving.
    pub fn class_drives_allowed(&self, class: DriveClass) -> usize {
        self.libs
            .iter()
            .filter(|l| l.class() == Some(class))
            .map(|l| l.drives_allow)
            .sum()
    }

    pub fn drives_available(&self) -> usize {
        self.libs
            .iter()
            .filter(|l| l.class().is_some())
            .map(|l| l.drives_avail)
            .sum()
    }

    /// True if a volume is loaded in one of the library's drives.
    pub fn is_loaded(&self, aln: usize, mtype: &str, vsn: &str) -> bool {
        self.libs.get(aln).is_some_and(|l| {
            l.drives.iter().any(|d| {
                d.loaded
                    .as_ref()
                    .is_some_and(|vi| vi.mtype == mtype && vi.vsn == vsn)
            })
        })
    }

    /// Free drive in a library; prefers one already holding `vsn`.
    pub fn free_drive(&self, aln: usize, vsn: Option<&str>) -> Option<usize> {
        let lib = self.libs.get(aln)?;
        let free = |d: &&ArchDrive| d.available && !d.busy;
        if let Some(vsn) = vsn {
            if let Some(adn) = lib
                .drives
                .iter()
                .position(|d| free(&d) && d.loaded.as_ref().is_some_and(|vi| vi.vsn == vsn))
            {
                return Some(adn);
            }
        }
        lib.drives.iter().position(|d| free(&d))
    }
}

/// Shared library table bound to a device layer.
pub struct DeviceTable {
    layer: Arc<dyn DeviceLayer>,
    table: Mutex<ArchLibTable>,
}

impl DeviceTable {
    pub fn new(layer: Arc<dyn DeviceLayer>) -> Self {
        let status = layer.status();
        let table = ArchLibTable::build(&status, None);
        Self {
            layer,
            table: Mutex::new(table),
        }
    }

    pub fn layer(&self) -> Arc<dyn DeviceLayer> {
        self.layer.clone()
    }

    pub fn snapshot(&self) -> ArchLibTable {
        self.table.lock().clone()
    }

    pub fn refresh_availability(&self) {
        let status = self.layer.status();
        let mut table = self.table.lock();
        let before: Vec<bool> = table.libs.iter().map(|l| l.available).collect();
        table.refresh_availability(&status);
        for (lib, was) in table.libs.iter().zip(before) {
            if lib.available != was {
                info!(
                    "Library {} is now {}",
                    lib.name,
                    if lib.available { "available" } else { "unavailable" }
                );
            }
        }
    }

    /// Rebuild after a device configuration change. Busy drives stay busy.
    pub fn rebuild(&self) {
        let status = self.layer.status();
        let mut table = self.table.lock();
        let busy: HashSet<(String, String)> = table
            .libs
            .iter()
            .flat_map(|l| {
                l.drives
                    .iter()
                    .filter(|d| d.busy)
                    .map(move |d| (l.name.clone(), d.name.clone()))
            })
            .collect();
        let mut new_table = ArchLibTable::build(&status, Some(&table));
        for lib in new_table.libs.iter_mut() {
            for drive in lib.drives.iter_mut() {
                drive.busy = busy.contains(&(lib.name.clone(), drive.name.clone()));
            }
        }
        *table = new_table;
    }

    /// Take a library or drive out of service.
    pub fn mark_down(&self, eq: u32) {
        warn!("Marking equipment {} down", eq);
        self.layer.set_state(eq, false);
        let mut table = self.table.lock();
        for lib in table.libs.iter_mut() {
            if lib.eq == eq {
                lib.available = false;
                lib.drives_avail = 0;
                for d in lib.drives.iter_mut() {
                    d.available = false;
                }
            } else if let Some(d) = lib.drives.iter_mut().find(|d| d.eq == eq) {
                if d.available {
                    d.available = false;
                    lib.drives_avail = lib.drives_avail.saturating_sub(1);
                }
            }
        }
    }

    pub fn set_drives_allowed(&self, name: &str, count: usize) -> Result<()> {
        let mut table = self.table.lock();
        let aln = table
            .find_name(name)
            .ok_or_else(|| RustArchiverError::device(format!("unknown library '{}'", name)))?;
        let lib = &mut table.libs[aln];
        if count > lib.drives.len() {
            return Err(RustArchiverError::parameter_validation(format!(
                "library {} has only {} drives",
                name,
                lib.drives.len()
            )));
        }
        info!("Library {} drives allowed {} -> {}", name, lib.drives_allow, count);
        lib.drives_allow = count;
        Ok(())
    }

    /// Reserve a free drive in a library for a copy.
    pub fn claim_drive(&self, aln: usize, vsn: Option<&str>) -> Option<usize> {
        let mut table = self.table.lock();
        let adn = table.free_drive(aln, vsn)?;
        table.libs[aln].drives[adn].busy = true;
        debug!("Claimed drive {} of {}", table.libs[aln].drives[adn].name, table.libs[aln].name);
        Some(adn)
    }

    pub fn release_drive(&self, aln: usize, adn: usize) {
        let mut table = self.table.lock();
        if let Some(d) = table.libs.get_mut(aln).and_then(|l| l.drives.get_mut(adn)) {
            d.busy = false;
        }
    }
}

/// Device layer backed by the static `[[library]]` configuration.
/// Loaded volume sizes are taken from the catalog when one is attached.
pub struct StaticDeviceLayer {
    libs: Mutex<Vec<LibraryStatus>>,
    catalog: Option<Arc<dyn Catalog>>,
    faults: Mutex<HashMap<u32, VecDeque<SenseData>>>,
    hangs: Mutex<HashMap<u32, VecDeque<Duration>>>,
    delay: Option<Duration>,
    vendor: String,
}

impl StaticDeviceLayer {
    pub fn new(config: &[LibraryConfig]) -> Self {
        let libs = config
            .iter()
            .map(|lc| LibraryStatus {
                name: lc.name.clone(),
                eq: lc.eq,
                kind: lc.kind,
                simulated: lc.simulated,
                on: lc.available,
                ready: true,
                auditing: false,
                drives_allow: lc.drives_allow,
                drives: lc
                    .drives
                    .iter()
                    .map(|d| DriveStatus {
                        name: d.name.clone(),
                        eq: d.eq,
                        on: d.available,
                        ready: d.loaded.is_some(),
                        present: d.loaded.is_some(),
                        labeled: d.loaded.is_some(),
                        mtype: d.loaded.as_ref().map(|(m, _)| m.clone()),
                        vsn: d.loaded.as_ref().map(|(_, v)| v.clone()),
                        ..Default::default()
                    })
                    .collect(),
            })
            .collect();
        Self {
            libs: Mutex::new(libs),
            catalog: None,
            faults: Mutex::new(HashMap::new()),
            hangs: Mutex::new(HashMap::new()),
            delay: None,
            vendor: "generic".to_string(),
        }
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn Catalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Make every mount take this long.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_vendor(mut self, vendor: &str) -> Self {
        self.vendor = vendor.to_string();
        self
    }

    /// Queue a failure for the next command on a drive.
    pub fn inject_fault(&self, drive_eq: u32, sense: SenseData) {
        self.faults.lock().entry(drive_eq).or_default().push_back(sense);
    }

    fn take_fault(&self, drive_eq: u32) -> Option<SenseData> {
        self.faults.lock().get_mut(&drive_eq).and_then(|q| q.pop_front())
    }

    /// Make the next mount on a drive stall for `delay`.
    pub fn inject_hang(&self, drive_eq: u32, delay: Duration) {
        self.hangs.lock().entry(drive_eq).or_default().push_back(delay);
    }

    fn take_hang(&self, drive_eq: u32) -> Option<Duration> {
        self.hangs.lock().get_mut(&drive_eq).and_then(|q| q.pop_front())
    }

    fn fill_sizes(&self, drive: &mut DriveStatus) {
        if let (Some(catalog), Some(mtype), Some(vsn)) = (&self.catalog, &drive.mtype, &drive.vsn) {
            if let Some(ce) = catalog.lookup(mtype, vsn) {
                drive.capacity = ce.capacity;
                drive.space = ce.space;
                drive.bad_media = ce.status.bad_media;
                drive.read_only = ce.status.read_only;
                drive.write_protect = ce.status.write_protect;
            }
        }
    }
}

impl DeviceLayer for StaticDeviceLayer {
    fn status(&self) -> Vec<LibraryStatus> {
        let mut libs = self.libs.lock().clone();
        for lib in libs.iter_mut() {
            for drive in lib.drives.iter_mut() {
                self.fill_sizes(drive);
            }
        }
        libs
    }

    fn vendor(&self, _lib_eq: u32) -> String {
        self.vendor.clone()
    }

    fn mount(&self, lib_eq: u32, drive_eq: u32, mtype: &str, vsn: &str) -> std::result::Result<(), SenseData> {
        if let Some(delay) = self.take_hang(drive_eq).or(self.delay) {
            std::thread::sleep(delay);
        }
        if let Some(sense) = self.take_fault(drive_eq) {
            return Err(sense);
        }
        let mut libs = self.libs.lock();
        let drive = libs
            .iter_mut()
            .filter(|l| l.eq == lib_eq)
            .flat_map(|l| l.drives.iter_mut())
            .find(|d| d.eq == drive_eq)
            .ok_or_else(|| SenseData::new(0x05, 0x25, 0x00))?;
        drive.ready = true;
        drive.present = true;
        drive.labeled = true;
        drive.mtype = Some(mtype.to_string());
        drive.vsn = Some(vsn.to_string());
        Ok(())
    }

    fn dismount(&self, lib_eq: u32, drive_eq: u32) -> std::result::Result<(), SenseData> {
        if let Some(sense) = self.take_fault(drive_eq) {
            return Err(sense);
        }
        let mut libs = self.libs.lock();
        if let Some(drive) = libs
            .iter_mut()
            .filter(|l| l.eq == lib_eq)
            .flat_map(|l| l.drives.iter_mut())
            .find(|d| d.eq == drive_eq)
        {
            drive.ready = false;
            drive.present = false;
            drive.labeled = false;
            drive.mtype = None;
            drive.vsn = None;
        }
        Ok(())
    }

    fn reinit(&self, eq: u32) {
        debug!("Reinitializing equipment {}", eq);
    }

    fn set_state(&self, eq: u32, on: bool) {
        let mut libs = self.libs.lock();
        for lib in libs.iter_mut() {
            if lib.eq == eq {
                lib.on = on;
            }
            for d in lib.drives.iter_mut().filter(|d| d.eq == eq) {
                d.on = on;
            }
        }
    }
}
