//! Volumes Command Handler
//!
//! Handles the `volumes` subcommand: list the volumes each archive set may
//! use, in selection order.

use super::Environment;
use crate::display;
use crate::error::{Result, RustArchiverError};
use crate::volume::{list_volumes, sets_without_volumes};
use std::path::PathBuf;
use tracing::{info, warn};

pub async fn execute(
    config_path: Option<PathBuf>,
    inventory: Option<PathBuf>,
    set: Option<String>,
    json: bool,
) -> Result<()> {
    let env = Environment::load(config_path.as_deref(), inventory.as_deref())?;
    let libs = env.devices.snapshot();
    let mut listing = list_volumes(&env.config, &env.volumes, &libs);
    if let Some(name) = &set {
        listing.retain(|sv| sv.set == *name || sv.set.rsplit_once('.').map(|(b, _)| b) == Some(name.as_str()));
        if listing.is_empty() {
            return Err(RustArchiverError::config(format!("archive set {} is not defined", name)));
        }
    }
    info!("Listed volumes for {} archive sets", listing.len());

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
    } else {
        display::display_volumes(&listing);
    }

    let empty = sets_without_volumes(&listing);
    if empty > 0 {
        warn!("{} archive set(s) have no volumes available", empty);
    }
    Ok(())
}
