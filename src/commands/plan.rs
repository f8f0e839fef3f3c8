//! Plan Command Handler
//!
//! Handles the `plan` subcommand: scan a directory, compose the requests
//! and run one scheduling pass without starting any copy.

use super::Environment;
use crate::compose::SystemOwnerNames;
use crate::config::ConfigHandle;
use crate::copy::{CopyJob, DryRunExecutor};
use crate::display;
use crate::error::Result;
use crate::notify::TracingNotifier;
use crate::queue::{QueueKind, QueueSummary, Queues};
use crate::scan::{self, ScanOptions};
use crate::schedule::Scheduler;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Serialize)]
pub struct Plan {
    pub jobs: Vec<CopyJob>,
    pub queues: Vec<QueueSummary>,
}

/// Compose `env`'s requests for `options` and collect the copies one pass
/// would start.
pub fn build_plan(env: Environment, options: &ScanOptions) -> Result<Plan> {
    let requests = scan::scan(&env.config, options)?;
    let executor = Arc::new(DryRunExecutor::new());
    let scheduler = Scheduler::new(
        Arc::new(ConfigHandle::new(env.config)),
        Arc::new(Queues::new()),
        env.devices,
        env.volumes,
        Arc::new(SystemOwnerNames::new()),
        Arc::new(TracingNotifier),
        executor.clone(),
    );

    for ar in requests {
        scheduler.queues().submit(ar)?;
    }
    loop {
        let next = scheduler.queues().lock().pop(QueueKind::Compose);
        match next {
            Some(ar) => {
                scheduler.compose_and_enqueue(ar);
            }
            None => break,
        }
    }
    let pass = scheduler.run_pass();
    info!("{} copies planned, {} requests waiting", pass.started.len(), pass.waiting);

    Ok(Plan {
        jobs: executor.take_jobs(),
        queues: scheduler.queues().summary(),
    })
}

pub async fn execute(
    config_path: Option<PathBuf>,
    inventory: Option<PathBuf>,
    root: PathBuf,
    fs: String,
    set: String,
    json: bool,
) -> Result<()> {
    info!("Planning archive of {} for set {}", root.display(), set);
    let env = Environment::load(config_path.as_deref(), inventory.as_deref())?;
    let options = ScanOptions::new(root, &fs, &set);
    let plan = build_plan(env, &options)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&plan)?);
    } else {
        display::display_plan(&plan.jobs, &plan.queues);
    }
    Ok(())
}
