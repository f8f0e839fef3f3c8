//! Run Command Handler
//!
//! Handles the `run` subcommand: start the daemon with the simulated copy
//! executor, archive a scanned directory and stop once every request is
//! done, stalled, timed out or interrupted.

use super::Environment;
use crate::compose::SystemOwnerNames;
use crate::config::ConfigHandle;
use crate::copy::SimulatedExecutor;
use crate::daemon::{Daemon, DaemonOptions, DaemonParts};
use crate::device::CommandRunner;
use crate::display;
use crate::error::Result;
use crate::notify::TracingNotifier;
use crate::scan::{self, ScanOptions};
use crossbeam::channel::unbounded;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

const POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Done,
    Stalled,
    TimedOut,
    Interrupted,
}

#[allow(clippy::too_many_arguments)]
pub async fn execute(
    config_path: Option<PathBuf>,
    inventory: Option<PathBuf>,
    root: PathBuf,
    fs: String,
    set: String,
    file_delay: u64,
    timeout: Option<u64>,
    directives: Vec<String>,
) -> Result<()> {
    let env = Environment::load(config_path.as_deref(), inventory.as_deref())?;
    let options = ScanOptions::new(root.clone(), &fs, &set);
    let requests = scan::scan(&env.config, &options)?;
    if requests.is_empty() {
        println!("Nothing to archive below {}", root.display());
        return Ok(());
    }

    let (events_tx, events) = unbounded();
    let runner = Arc::new(CommandRunner::new(env.devices.clone()).with_media(&env.config.media));
    let executor = SimulatedExecutor::new(events_tx)
        .with_runner(runner)
        .with_file_delay(Duration::from_millis(file_delay))
        .with_source_root(root);
    let parts = DaemonParts {
        config: Arc::new(ConfigHandle::new(env.config)),
        devices: env.devices,
        volumes: env.volumes,
        owners: Arc::new(SystemOwnerNames::new()),
        notifier: Arc::new(TracingNotifier),
        executor: Arc::new(executor),
        events,
    };
    let daemon = Daemon::start(parts, DaemonOptions::default())?;

    for line in &directives {
        match daemon.control(line) {
            Ok(reply) => println!("{}", reply),
            Err(e) => warn!("Directive '{}' failed: {}", line, e),
        }
    }
    let count = requests.len();
    for ar in requests {
        daemon.submit(ar)?;
    }
    info!("Submitted {} request(s)", count);

    let deadline = timeout.map(|secs| Instant::now() + Duration::from_secs(secs));
    let finish = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break Finish::Interrupted,
            _ = tokio::time::sleep(POLL) => {}
        }
        if daemon.pending() == 0 {
            break Finish::Done;
        }
        if daemon.stalled() {
            break Finish::Stalled;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break Finish::TimedOut;
        }
    };

    display::display_status(&daemon.scheduler().status());
    match finish {
        Finish::Done => println!("All requests archived"),
        Finish::Stalled => warn!("Remaining requests are waiting; see reasons above"),
        Finish::TimedOut => warn!("Timed out with {} request(s) pending", daemon.pending()),
        Finish::Interrupted => info!("Interrupted"),
    }

    tokio::task::spawn_blocking(move || daemon.shutdown())
        .await
        .map_err(anyhow::Error::from)?;
    Ok(())
}
