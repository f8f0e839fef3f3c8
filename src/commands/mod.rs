//! Command Handlers Module
//!
//! This module contains handlers for all CLI subcommands.

pub mod check;
pub mod plan;
pub mod run;
pub mod volumes;

use crate::config::{self, ConfigSnapshot};
use crate::device::{DeviceTable, StaticDeviceLayer};
use crate::error::Result;
use crate::volume::{load_inventory, InMemoryCatalog, InMemoryDiskDictionary, Inventory, VolumeTables};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Configuration file used when `--config` is not given.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("rustarchiver")
        .join("archiver.toml")
}

/// Configuration, device table and volume tables a command works with.
pub struct Environment {
    pub config: ConfigSnapshot,
    pub devices: Arc<DeviceTable>,
    pub volumes: Arc<VolumeTables>,
}

impl Environment {
    pub fn load(config_path: Option<&Path>, inventory: Option<&Path>) -> Result<Self> {
        let path = config_path.map(Path::to_path_buf).unwrap_or_else(default_config_path);
        let config = config::load(&path)?;
        info!(
            "Loaded {} archive sets and {} libraries from {}",
            config.copy_sets().count(),
            config.libraries.len(),
            path.display()
        );
        let inventory = match inventory {
            Some(p) => load_inventory(p)?,
            None => {
                debug!("No inventory given; catalog is empty");
                Inventory::default()
            }
        };
        Ok(Self::build(config, inventory))
    }

    pub fn build(config: ConfigSnapshot, inventory: Inventory) -> Self {
        let catalog = Arc::new(InMemoryCatalog::new(inventory.catalog));
        let layer = StaticDeviceLayer::new(&config.libraries).with_catalog(catalog.clone());
        let devices = Arc::new(DeviceTable::new(Arc::new(layer)));
        let volumes = Arc::new(VolumeTables::new(
            catalog,
            Arc::new(InMemoryDiskDictionary::new(inventory.disk_volumes)),
            &devices.snapshot(),
        ));
        Self {
            config,
            devices,
            volumes,
        }
    }
}
