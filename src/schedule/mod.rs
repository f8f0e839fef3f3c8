//! Archive scheduler
//!
//! Composed requests wait in the schedule queue until [`Scheduler::run_pass`]
//! finds drives and volumes for them, starts their copies and moves them
//! to the archive queue. Copy completions, overflow volume requests and
//! operator directives all come through the same [`Scheduler`].
//!
//! Locks are always taken in the order queues, scheduler state, device
//! table.

pub mod resources;

pub use resources::{
    cartridge_busy, find_dk_volumes, find_resources, find_rm_volume, is_lib_drive_free, FindStatus, HeldVolume,
    ResourceContext, MAX_VOLUMES,
};

use crate::archreq::{schedule_priority, ArchReq, ArchReqState, CpiSlot, FileState, ScheduleFactors};
use crate::compose::{compose, compose_for_cpi, make_tarballs, non_stage_files, ComposeContext, ComposeOutcome, OwnerNames};
use crate::config::{ArchiveSet, ConfigHandle, ConfigSnapshot};
use crate::copy::{CopyEvent, CopyExecutor, CopyFile, CopyJob, CopyReport, DriveTarget, StopMode, VolumeRequest};
use crate::device::{ArchLibTable, DeviceTable};
use crate::error::{Result, RustArchiverError};
use crate::notify::{Notification, Notifier};
use crate::queue::{DequeueResult, Location, QueueKind, QueueSet, QueueSummary, Queues};
use crate::volume::{Reservation, VolumeTables};
use chrono::Utc;
use parking_lot::Mutex;
use resources::{assignment, notify_once};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Operator run state of a class of copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    #[default]
    Run,
    /// Finish the current archive file, then stop.
    Idle,
    Stop,
}

impl RunState {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "run" => Some(RunState::Run),
            "idle" => Some(RunState::Idle),
            "stop" => Some(RunState::Stop),
            _ => None,
        }
    }

    fn stop_mode(self) -> Option<StopMode> {
        match self {
            RunState::Run => None,
            RunState::Idle => Some(StopMode::Idle),
            RunState::Stop => Some(StopMode::Stop),
        }
    }
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunState::Run => "run",
            RunState::Idle => "idle",
            RunState::Stop => "stop",
        };
        f.write_str(s)
    }
}

/// Which copies a run state directive applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunTarget {
    Removable,
    Disk,
    FileSystem(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DequeueStatus {
    /// Removed before any copy started.
    Dequeued,
    /// Copies are being stopped; the request is dropped when they end.
    Stopping,
    /// Held by a worker right now; try again.
    Busy,
    NotFound,
}

#[derive(Debug, Default)]
struct SchedState {
    rm: RunState,
    dk: RunState,
    fs: HashMap<String, RunState>,
    /// Copy instances with files left for another run.
    more_work: Vec<(String, usize)>,
    held: Vec<HeldVolume>,
    /// Scheduler-wide notices already sent.
    sent: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LibraryUsage {
    pub name: String,
    pub drives_allow: usize,
    pub drives_avail: usize,
    pub drives_busy: usize,
}

/// Snapshot of scheduler state for the trace directive.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub rm: RunState,
    pub dk: RunState,
    pub fs: BTreeMap<String, RunState>,
    pub queues: Vec<QueueSummary>,
    pub more_work: Vec<String>,
    pub overflow: Vec<HeldVolume>,
    pub libraries: Vec<LibraryUsage>,
}

/// Result of one scheduling pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PassSummary {
    pub started: Vec<String>,
    pub waiting: usize,
    pub scheduled: usize,
}

pub struct Scheduler {
    config: Arc<ConfigHandle>,
    queues: Arc<Queues>,
    devices: Arc<DeviceTable>,
    volumes: Arc<VolumeTables>,
    owners: Arc<dyn OwnerNames>,
    notifier: Arc<dyn Notifier>,
    executor: Arc<dyn CopyExecutor>,
    state: Mutex<SchedState>,
}

impl Scheduler {
    pub fn new(
        config: Arc<ConfigHandle>,
        queues: Arc<Queues>,
        devices: Arc<DeviceTable>,
        volumes: Arc<VolumeTables>,
        owners: Arc<dyn OwnerNames>,
        notifier: Arc<dyn Notifier>,
        executor: Arc<dyn CopyExecutor>,
    ) -> Self {
        Self {
            config,
            queues,
            devices,
            volumes,
            owners,
            notifier,
            executor,
            state: Mutex::new(SchedState::default()),
        }
    }

    pub fn queues(&self) -> &Arc<Queues> {
        &self.queues
    }

    fn compose_ctx<'a>(&'a self, config: &'a ConfigSnapshot, libs: &'a ArchLibTable) -> ComposeContext<'a> {
        ComposeContext {
            config,
            volumes: &self.volumes,
            libs,
            owners: self.owners.as_ref(),
            notifier: self.notifier.as_ref(),
        }
    }

    /// Compose a request taken from the compose queue and hand it on.
    pub fn compose_and_enqueue(&self, mut ar: ArchReq) -> ComposeOutcome {
        let config = self.config.current();
        let libs = self.devices.snapshot();
        let ctx = self.compose_ctx(&config, &libs);
        let outcome = compose(&mut ar, &ctx);
        match outcome {
            ComposeOutcome::Dropped => self.queues.release(&ar.name()),
            ComposeOutcome::Ready => self.enqueue_with(ar, &ctx),
        }
        outcome
    }

    /// Queue a composed request for scheduling, or park it when its copies
    /// may not run now.
    pub fn enqueue(&self, ar: ArchReq) {
        let config = self.config.current();
        let libs = self.devices.snapshot();
        let ctx = self.compose_ctx(&config, &libs);
        self.enqueue_with(ar, &ctx);
    }

    fn enqueue_with(&self, mut ar: ArchReq, ctx: &ComposeContext<'_>) {
        ar.state = ArchReqState::HandedToScheduler;
        ar.time_queued = Utc::now();
        ar.sched_priority = ar.priority;
        let reason = {
            let state = self.state.lock();
            wait_reason(&mut ar, &state, ctx)
        };
        match reason {
            Some(reason) => {
                debug!("{}: {}", ar.name(), reason);
                ar.stall_reason = Some(reason);
                self.queues.lock().insert(QueueKind::Wait, ar);
            }
            None => self.queues.to_schedule(ar),
        }
    }

    /// One scheduling pass over the schedule queue.
    pub fn run_pass(&self) -> PassSummary {
        let config = self.config.current();
        let libs = self.devices.snapshot();
        let cctx = self.compose_ctx(&config, &libs);
        let mut summary = PassSummary::default();

        let mut queues = self.queues.lock();
        let mut state = self.state.lock();
        self.check_queue_time(&mut queues, &config);

        if libs.drives_available() == 0 {
            if state.sent.insert(Notification::NoDrives.key()) {
                self.notifier.notify(Notification::NoDrives);
            }
            summary.scheduled = queues.len(QueueKind::Schedule);
            return summary;
        }
        state.sent.remove(&Notification::NoDrives.key());

        self.run_more_work(&mut queues, &mut state, &config, &libs, &mut summary);

        let entries = queues.drain(QueueKind::Schedule);
        let mut set_space: HashMap<String, u64> = HashMap::new();
        for ar in entries
            .iter()
            .chain(queues.queue(QueueKind::Archive).iter())
            .chain(queues.queue(QueueKind::Wait).iter())
        {
            *set_space.entry(ar.asname.clone()).or_default() += ar.sel_space;
        }

        for mut ar in entries {
            let name = ar.name();
            let Some(set) = config.archive_set(&ar.asname) else {
                warn!("{}: archive set {} is no longer defined", name, ar.asname);
                ar.flags.unqueue = true;
                queues.to_compose(ar);
                continue;
            };

            let mut reason = wait_reason(&mut ar, &state, &cctx);
            if reason.is_none() && ar.sel_space == 0 {
                reason = Some("nothing to archive until the next pass".to_string());
            }
            if reason.is_none() && ar.flags.offline && non_stage_files(&mut ar, &cctx) == ar.sel_files {
                ar.flags.nonstage = true;
                reason = Some("waiting for a stage volume".to_string());
            }
            if let Some(reason) = reason {
                debug!("{}: {}", name, reason);
                ar.stall_reason = Some(reason);
                queues.insert(QueueKind::Wait, ar);
                summary.waiting += 1;
                continue;
            }

            ar.reset_copy_instances();
            let status = {
                let ctx = ResourceContext {
                    config: &config,
                    libs: &libs,
                    volumes: &self.volumes,
                    owners: self.owners.as_ref(),
                    notifier: self.notifier.as_ref(),
                    archiving: queues.queue(QueueKind::Archive).iter().collect(),
                    held: &state.held,
                    set_space: &set_space,
                };
                find_resources(&mut ar, set, &ctx)
            };
            debug!("{}: resources {:?}", name, status);

            match status {
                FindStatus::Start => {
                    let factors = ScheduleFactors {
                        volume_loaded: ar.cpi.iter().filter_map(|c| c.volume.as_ref()).any(|v| v.loaded),
                        offline_files: ar.flags.offline,
                        overflow: ar
                            .cpi
                            .iter()
                            .any(|c| c.volume.as_ref().is_some_and(|v| c.space > v.vol_space)),
                        waited_secs: (Utc::now() - ar.time_queued).num_milliseconds() as f64 / 1000.0,
                    };
                    ar.sched_priority = schedule_priority(&set.priorities, ar.priority, &factors);
                    let started = self.start_copies(&mut ar, set, &config, &libs);
                    if started == 0 {
                        warn!("{}: schedule error, no copy could be started", name);
                        ar.flags.schederr = true;
                        ar.stall_reason = Some("schedule error".to_string());
                        ar.drives_used = 0;
                        ar.reset_copy_instances();
                        queues.insert(QueueKind::Schedule, ar);
                        summary.scheduled += 1;
                    } else {
                        ar.flags.schederr = false;
                        ar.state = ArchReqState::Archiving;
                        summary.started.push(name);
                        queues.insert(QueueKind::Archive, ar);
                    }
                }
                FindStatus::NoArch => {
                    ar.drives_used = 0;
                    ar.reset_copy_instances();
                    queues.insert(QueueKind::Wait, ar);
                    summary.waiting += 1;
                }
                FindStatus::Busy | FindStatus::Volumes => {
                    ar.drives_used = 0;
                    ar.reset_copy_instances();
                    queues.insert(QueueKind::Schedule, ar);
                    summary.scheduled += 1;
                }
            }
        }

        // Archive entries left without any copy go back to compose.
        let idle: Vec<String> = queues
            .queue(QueueKind::Archive)
            .iter()
            .filter(|ar| ar.active_copies() == 0)
            .map(|ar| ar.name())
            .filter(|n| !state.more_work.iter().any(|(m, _)| m == n))
            .collect();
        for name in idle {
            if let Some(ar) = queues.take(QueueKind::Archive, &name) {
                queues.to_compose(ar);
            }
        }
        drop(state);
        drop(queues);
        self.queues.notify_compose();

        if !summary.started.is_empty() {
            info!("Scheduling pass started {} request(s)", summary.started.len());
        }
        summary
    }

    /// Start every copy instance that has a volume; returns how many ran.
    fn start_copies(&self, ar: &mut ArchReq, set: &ArchiveSet, config: &ConfigSnapshot, libs: &ArchLibTable) -> usize {
        let mut started = 0;
        for cpi in 0..ar.drives_used {
            if ar.cpi[cpi].volume.is_none() {
                continue;
            }
            match self.start_copy(ar, cpi, set, config, libs) {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!("{} cpi {}: {}", ar.name(), cpi, e);
                    ar.cpi[cpi].volume = None;
                    unassign(ar, cpi);
                }
            }
        }
        started
    }

    fn start_copy(
        &self,
        ar: &mut ArchReq,
        cpi: usize,
        set: &ArchiveSet,
        config: &ConfigSnapshot,
        libs: &ArchLibTable,
    ) -> Result<()> {
        let volume = ar.cpi[cpi]
            .volume
            .clone()
            .ok_or_else(|| RustArchiverError::schedule("copy has no volume"))?;
        let ovflmin = config.ovflmin(set, &volume.mtype);
        make_tarballs(ar, cpi, config.archmax(set), ovflmin, volume.vol_space);

        let disk = ar.cpi[cpi].disk;
        let drive = if disk {
            None
        } else {
            let adn = self.devices.claim_drive(volume.aln, Some(&volume.vsn)).ok_or_else(|| {
                RustArchiverError::device(format!("no free drive for {}.{}", volume.mtype, volume.vsn))
            })?;
            ar.cpi[cpi].drive = Some((volume.aln, adn));
            libs.libs.get(volume.aln).and_then(|lib| {
                lib.drives.get(adn).map(|d| DriveTarget {
                    lib_eq: lib.eq,
                    drive_eq: d.eq,
                })
            })
        };

        if !disk && !set.reserve.is_none() {
            let reservation = Reservation {
                time: Utc::now(),
                asname: if set.reserve.set { set.name.clone() } else { String::new() },
                owner: ar.cpi[cpi].owner.clone(),
                fsname: if set.reserve.fs { ar.fsname.clone() } else { String::new() },
            };
            if let Err(e) = self.volumes.catalog().reserve(&volume.mtype, &volume.vsn, reservation) {
                warn!("Reserving {}.{} failed: {}", volume.mtype, volume.vsn, e);
            }
        }

        let job = CopyJob {
            request: ar.name(),
            cpi,
            volume,
            drive,
            disk,
            ovflmin,
            files: job_files(ar, cpi),
        };
        if let Err(e) = self.executor.start(job) {
            if let Some((aln, adn)) = ar.cpi[cpi].drive.take() {
                self.devices.release_drive(aln, adn);
            }
            return Err(e);
        }
        Ok(())
    }

    fn run_more_work(
        &self,
        queues: &mut QueueSet,
        state: &mut SchedState,
        config: &ConfigSnapshot,
        libs: &ArchLibTable,
        summary: &mut PassSummary,
    ) {
        let pending = std::mem::take(&mut state.more_work);
        for (name, cpi) in pending {
            let Some(mut ar) = queues.take(QueueKind::Archive, &name) else {
                continue;
            };
            let Some(set) = config.archive_set(&ar.asname) else {
                queues.insert(QueueKind::Archive, ar);
                continue;
            };
            if ar.flags.unqueue || ar.cpi[cpi].is_active() {
                queues.insert(QueueKind::Archive, ar);
                continue;
            }

            compose_for_cpi(&mut ar, set, cpi, self.owners.as_ref());
            let mut keep = false;
            if ar.cpi[cpi].files != 0 {
                let space = ar.cpi[cpi].space;
                let found = {
                    let ctx = ResourceContext {
                        config,
                        libs,
                        volumes: &self.volumes,
                        owners: self.owners.as_ref(),
                        notifier: self.notifier.as_ref(),
                        archiving: queues.queue(QueueKind::Archive).iter().collect(),
                        held: &state.held,
                        set_space: &HashMap::new(),
                    };
                    find_rm_volume(&mut ar, set, space, cpi, false, &ctx)
                };
                match found {
                    Ok(found) => {
                        ar.cpi[cpi].volume = Some(assignment(&found.volume, found.volume.space));
                        match self.start_copy(&mut ar, cpi, set, config, libs) {
                            Ok(()) => {
                                info!("{} cpi {}: more work started", name, cpi);
                                summary.started.push(name.clone());
                            }
                            Err(e) => {
                                warn!("{} cpi {}: {}", name, cpi, e);
                                ar.cpi[cpi].volume = None;
                                unassign(&mut ar, cpi);
                                keep = true;
                            }
                        }
                    }
                    Err(miss) => {
                        unassign(&mut ar, cpi);
                        keep = miss.status == FindStatus::Busy;
                    }
                }
            }
            if keep {
                state.more_work.push((name, cpi));
            }
            queues.insert(QueueKind::Archive, ar);
        }
    }

    /// Route a copy event to its handler.
    pub fn handle_event(&self, event: CopyEvent) {
        match event {
            CopyEvent::Done(report) => self.copy_complete(report),
            CopyEvent::NeedVolume(request) => self.request_overflow_volume(request),
        }
    }

    /// Account for a finished copy instance.
    pub fn copy_complete(&self, report: CopyReport) {
        let name = report.request.clone();
        let cpi = report.cpi;
        let mut queues = self.queues.lock();
        let mut state = self.state.lock();
        let Some(mut ar) = queues.take(QueueKind::Archive, &name) else {
            warn!("Copy {}.{} finished for an unknown request", name, cpi);
            return;
        };
        if cpi >= ar.cpi.len() {
            warn!("Copy {}.{} finished for an unknown copy instance", name, cpi);
            queues.insert(QueueKind::Archive, ar);
            return;
        }

        for seq in &report.archived {
            if let Some(fi) = ar.file_mut(*seq) {
                fi.state = FileState::Archived;
            }
        }
        for seq in &report.failed {
            if let Some(fi) = ar.file_mut(*seq) {
                fi.state = FileState::Errored;
            }
        }
        if let Some(e) = &report.error {
            warn!("Copy {}.{} ended: {}", name, cpi, e);
        }

        let disk = ar.cpi[cpi].disk;
        for usage in &report.volumes {
            if disk {
                self.volumes.disk_dictionary().consume_space(&usage.vsn, usage.bytes);
                continue;
            }
            if let Err(e) = self.volumes.catalog().consume_space(&usage.mtype, &usage.vsn, usage.bytes) {
                warn!("Catalog update for {}.{} failed: {}", usage.mtype, usage.vsn, e);
            }
            if usage.full {
                if let Err(e) = self.volumes.catalog().set_archive_full(&usage.mtype, &usage.vsn) {
                    warn!("Catalog set full failed for {}.{}: {}", usage.mtype, usage.vsn, e);
                }
            }
        }

        let ci = &mut ar.cpi[cpi];
        if let Some((aln, adn)) = ci.drive.take() {
            self.devices.release_drive(aln, adn);
        }
        ci.bytes_written += report.volumes.iter().map(|u| u.bytes).sum::<u64>();
        ci.volume = None;
        ci.overflow_vsns.clear();
        let more = ci.more && !ci.disk && report.error.is_none();
        state.held.retain(|h| !(h.request == name && h.cpi == cpi));
        info!(
            "Copy {}.{} complete: {} archived, {} failed",
            name,
            cpi,
            report.archived.len(),
            report.failed.len()
        );

        if more && !ar.flags.unqueue && ar.active_copies() > 0 {
            debug!("{} cpi {}: more work", name, cpi);
            state.more_work.push((name, cpi));
            queues.insert(QueueKind::Archive, ar);
            drop(state);
            drop(queues);
            self.queues.wake_scheduler();
            return;
        }
        if ar.active_copies() > 0 || state.more_work.iter().any(|(n, _)| *n == name) {
            queues.insert(QueueKind::Archive, ar);
            return;
        }

        let pending = ar
            .files
            .iter()
            .skip(if ar.flags.join { ar.sel_files } else { 0 })
            .filter(|f| f.state == FileState::Pending)
            .count();
        if pending == 0 {
            let (archived, failed) = ar.files.iter().fold((0, 0), |(a, f), fi| match fi.state {
                FileState::Archived => (a + 1, f),
                FileState::Errored => (a, f + 1),
                _ => (a, f),
            });
            ar.state = ArchReqState::Done;
            notify_once(
                &mut ar,
                self.notifier.as_ref(),
                Notification::RequestDone {
                    request: name.clone(),
                    archived,
                    failed,
                },
            );
        }
        queues.to_compose(ar);
        drop(state);
        drop(queues);
        self.queues.notify_compose();
        self.queues.wake_scheduler();
    }

    /// Find a continuation volume for a copy whose file overflows.
    pub fn request_overflow_volume(&self, request: VolumeRequest) {
        let reply = self.overflow_volume(&request);
        if request.reply.send(reply).is_err() {
            debug!("Copy {}.{} gone before overflow reply", request.request, request.cpi);
        }
    }

    fn overflow_volume(&self, request: &VolumeRequest) -> Option<crate::archreq::VolumeAssignment> {
        let config = self.config.current();
        let libs = self.devices.snapshot();
        let mut queues = self.queues.lock();
        let mut state = self.state.lock();
        let mut ar = queues.take(QueueKind::Archive, &request.request)?;
        let cpi = request.cpi;
        let result = match (config.archive_set(&ar.asname), ar.cpi.get(cpi).and_then(|c| c.volume.clone())) {
            (Some(set), Some(current)) => {
                let found = {
                    let ctx = ResourceContext {
                        config: &config,
                        libs: &libs,
                        volumes: &self.volumes,
                        owners: self.owners.as_ref(),
                        notifier: self.notifier.as_ref(),
                        archiving: queues.queue(QueueKind::Archive).iter().collect(),
                        held: &state.held,
                        set_space: &HashMap::new(),
                    };
                    find_rm_volume(&mut ar, set, request.file_size, cpi, true, &ctx)
                };
                match found {
                    Ok(found) if found.volume.aln == current.aln => {
                        info!(
                            "{} cpi {}: overflow onto {}.{} ({} volumes)",
                            ar.name(),
                            cpi,
                            found.volume.mtype,
                            found.volume.vsn,
                            found.to_use
                        );
                        state.held.push(HeldVolume {
                            request: request.request.clone(),
                            cpi,
                            mtype: found.volume.mtype.clone(),
                            vsn: found.volume.vsn.clone(),
                        });
                        ar.cpi[cpi].overflow_vsns.push(found.volume.vsn.clone());
                        Some(assignment(&found.volume, found.volume.space))
                    }
                    Ok(found) => {
                        warn!("{}: overflow volume {} is in another library", ar.name(), found.volume.vsn);
                        None
                    }
                    Err(miss) => {
                        if let Some(notice) = miss.notice {
                            notify_once(&mut ar, self.notifier.as_ref(), notice);
                        }
                        None
                    }
                }
            }
            _ => None,
        };
        queues.insert(QueueKind::Archive, ar);
        result
    }

    /// Withdraw a request. Requests with running copies have them stopped
    /// and are dropped when the copies end.
    pub fn dequeue(&self, name: &str) -> DequeueStatus {
        let mut queues = self.queues.lock();
        if queues.location(name) == Some(Location::Queued(QueueKind::Archive)) {
            if let Some(ar) = queues.get_mut(QueueKind::Archive, name) {
                ar.flags.unqueue = true;
                for (cpi, ci) in ar.cpi.iter().enumerate() {
                    if ci.is_active() {
                        self.executor.stop(name, cpi, StopMode::Stop);
                    }
                }
            }
            self.state.lock().more_work.retain(|(n, _)| n != name);
            info!("{} dequeued, stopping copies", name);
            return DequeueStatus::Stopping;
        }
        match queues.dequeue(name) {
            DequeueResult::Dequeued(mut ar) => {
                ar.flags.unqueue = true;
                queues.to_compose(*ar);
                drop(queues);
                self.queues.notify_compose();
                info!("{} dequeued", name);
                DequeueStatus::Dequeued
            }
            DequeueResult::Busy => DequeueStatus::Busy,
            DequeueResult::NotFound => DequeueStatus::NotFound,
        }
    }

    /// Apply an `:arrun`, `:aridle` or `:arstop` style directive.
    pub fn set_run_state(&self, target: RunTarget, run: RunState) {
        let mut queues = self.queues.lock();
        let mut state = self.state.lock();
        match &target {
            RunTarget::Removable => state.rm = run,
            RunTarget::Disk => state.dk = run,
            RunTarget::FileSystem(fs) => {
                state.fs.insert(fs.clone(), run);
            }
        }
        info!("Archiving {:?} set to {}", target, run);

        if let Some(mode) = run.stop_mode() {
            let matches = |ar: &ArchReq| match &target {
                RunTarget::Removable => !(ar.flags.disk || ar.flags.honeycomb),
                RunTarget::Disk => ar.flags.disk || ar.flags.honeycomb,
                RunTarget::FileSystem(fs) => ar.fsname == *fs,
            };
            for ar in queues.queue(QueueKind::Archive).iter().filter(|ar| matches(*ar)) {
                for (cpi, ci) in ar.cpi.iter().enumerate() {
                    if ci.is_active() {
                        self.executor.stop(&ar.name(), cpi, mode);
                    }
                }
            }
            let parked: Vec<String> = queues
                .queue(QueueKind::Schedule)
                .iter()
                .filter(|ar| matches(*ar))
                .map(|ar| ar.name())
                .collect();
            for name in parked {
                if let Some(mut ar) = queues.take(QueueKind::Schedule, &name) {
                    ar.stall_reason = Some(run_wait_reason(&ar, &state).unwrap_or_default());
                    queues.insert(QueueKind::Wait, ar);
                }
            }
            return;
        }

        let waiting = requeue_waiting(&mut queues);
        drop(state);
        drop(queues);
        if waiting > 0 {
            self.queues.notify_compose();
        }
    }

    /// Return every parked request to compose. Returns how many moved.
    pub fn requeue_waiting(&self) -> usize {
        let moved = requeue_waiting(&mut self.queues.lock());
        if moved > 0 {
            self.queues.notify_compose();
        }
        moved
    }

    pub fn set_drives_allowed(&self, library: &str, count: usize) -> Result<()> {
        self.devices.set_drives_allowed(library, count)?;
        self.queues.wake_scheduler();
        Ok(())
    }

    pub fn status(&self) -> SchedulerStatus {
        let libs = self.devices.snapshot();
        let queues = self.queues.lock();
        let state = self.state.lock();
        SchedulerStatus {
            rm: state.rm,
            dk: state.dk,
            fs: state.fs.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            queues: queues.summary(),
            more_work: state.more_work.iter().map(|(n, c)| format!("{}.{}", n, c)).collect(),
            overflow: state.held.clone(),
            libraries: libs
                .libs
                .iter()
                .map(|l| LibraryUsage {
                    name: l.name.clone(),
                    drives_allow: l.drives_allow,
                    drives_avail: l.drives_avail,
                    drives_busy: l.drives.iter().filter(|d| d.busy).count(),
                })
                .collect(),
        }
    }

    fn check_queue_time(&self, queues: &mut QueueSet, config: &ConfigSnapshot) {
        let now = Utc::now();
        for kind in [QueueKind::Schedule, QueueKind::Wait] {
            for ar in queues.iter_mut(kind) {
                let Some(set) = config.archive_set(&ar.asname) else {
                    continue;
                };
                if set.queue_time.is_zero() {
                    continue;
                }
                let waited = (now - ar.time_queued).num_seconds();
                if waited > set.queue_time.as_secs() as i64 {
                    let notice = Notification::QueueTimeExceeded {
                        request: ar.name(),
                        waited_secs: waited,
                    };
                    notify_once(ar, self.notifier.as_ref(), notice);
                }
            }
        }
    }
}

fn run_wait_reason(ar: &ArchReq, state: &SchedState) -> Option<String> {
    if state.fs.get(&ar.fsname).is_some_and(|s| *s != RunState::Run) {
        return Some(format!("waiting for :arrun fs.{}", ar.fsname));
    }
    if ar.flags.disk || ar.flags.honeycomb {
        if state.dk != RunState::Run {
            return Some("waiting for :arrun dk".to_string());
        }
    } else if state.rm != RunState::Run {
        return Some("waiting for :arrun rm".to_string());
    }
    None
}

/// Why a request must wait instead of being scheduled, if it must.
fn wait_reason(ar: &mut ArchReq, state: &SchedState, ctx: &ComposeContext<'_>) -> Option<String> {
    if let Some(reason) = run_wait_reason(ar, state) {
        return Some(reason);
    }
    if ar.flags.nonstage {
        if non_stage_files(ar, ctx) != ar.sel_files {
            ar.flags.nonstage = false;
        } else {
            return Some("waiting for a stage volume".to_string());
        }
    }
    None
}

fn requeue_waiting(queues: &mut QueueSet) -> usize {
    let waiting = queues.drain(QueueKind::Wait);
    let moved = waiting.len();
    for mut ar in waiting {
        ar.stall_reason = None;
        queues.to_compose(ar);
    }
    if moved > 0 {
        debug!("{} waiting request(s) returned to compose", moved);
    }
    moved
}

/// Put the entries of a copy instance back for another try.
fn unassign(ar: &mut ArchReq, cpi: usize) {
    let slot = CpiSlot::Assigned(cpi as u16);
    for fi in ar.files[..ar.sel_files].iter_mut() {
        if fi.cpi == slot {
            fi.cpi = CpiSlot::More;
        }
    }
    let ci = &mut ar.cpi[cpi];
    ci.files = 0;
    ci.space = 0;
}

fn job_files(ar: &ArchReq, cpi: usize) -> Vec<CopyFile> {
    ar.copy_files(cpi)
        .into_iter()
        .map(|(first, fi)| CopyFile {
            seq: fi.seq,
            path: fi.path.clone(),
            space: fi.space,
            first,
        })
        .collect()
}
