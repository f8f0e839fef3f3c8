//! Check Command Handler
//!
//! Handles the `check` subcommand: load and validate the configuration.

use super::default_config_path;
use crate::config;
use crate::display;
use crate::error::{Result, RustArchiverError};
use std::path::PathBuf;
use tracing::info;

pub async fn execute(config_path: Option<PathBuf>, detailed: bool) -> Result<()> {
    let path = config_path.unwrap_or_else(default_config_path);
    info!("Checking configuration {}", path.display());

    let snapshot = match config::load(&path) {
        Ok(snapshot) => snapshot,
        Err(RustArchiverError::ConfigErrors { count, issues }) => {
            display::display_config_issues(&issues);
            return Err(RustArchiverError::ConfigErrors { count, issues });
        }
        Err(e) => return Err(e),
    };

    display::display_sets(&snapshot);
    if detailed {
        println!();
        display::display_libraries(&snapshot.libraries);
    }
    println!();
    println!("Configuration OK: {} archive sets", snapshot.copy_sets().count());
    Ok(())
}
