//! Copy execution
//!
//! The scheduler hands every started copy instance to a [`CopyExecutor`]
//! and learns how it ended through [`CopyEvent`]s. [`SimulatedExecutor`]
//! runs each copy on its own thread, mounts through the device command
//! runner and accounts for volume space without moving any data.

use crate::archreq::VolumeAssignment;
use crate::config::DeviceOp;
use crate::device::{CommandOutcome, CommandRunner, DeviceCommand};
use crate::error::{Result, RustArchiverError};
use crossbeam::channel::{bounded, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CopyFile {
    pub seq: u64,
    pub path: String,
    pub space: u64,
    /// Starts a new archive file.
    pub first: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DriveTarget {
    pub lib_eq: u32,
    pub drive_eq: u32,
}

/// One copy instance ready to run.
#[derive(Debug, Clone, Serialize)]
pub struct CopyJob {
    pub request: String,
    pub cpi: usize,
    pub volume: VolumeAssignment,
    /// Drive to mount on; `None` for disk archiving.
    pub drive: Option<DriveTarget>,
    pub disk: bool,
    pub ovflmin: Option<u64>,
    pub files: Vec<CopyFile>,
}

impl CopyJob {
    /// `fs.set.seq.cpi`
    pub fn id(&self) -> String {
        copy_id(&self.request, self.cpi)
    }
}

fn copy_id(request: &str, cpi: usize) -> String {
    format!("{}.{}", request, cpi)
}

/// Bytes a copy wrote to one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeUsage {
    pub mtype: String,
    pub vsn: String,
    pub bytes: u64,
    /// The volume ran out of space.
    pub full: bool,
}

impl VolumeUsage {
    fn of(volume: &VolumeAssignment, bytes: u64, full: bool) -> Self {
        Self {
            mtype: volume.mtype.clone(),
            vsn: volume.vsn.clone(),
            bytes,
            full,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CopyReport {
    pub request: String,
    pub cpi: usize,
    /// Insertion numbers of archived files.
    pub archived: Vec<u64>,
    pub failed: Vec<u64>,
    pub volumes: Vec<VolumeUsage>,
    pub error: Option<String>,
}

/// A running copy asks for a continuation volume.
#[derive(Debug)]
pub struct VolumeRequest {
    pub request: String,
    pub cpi: usize,
    pub file_size: u64,
    pub reply: Sender<Option<VolumeAssignment>>,
}

#[derive(Debug)]
pub enum CopyEvent {
    Done(CopyReport),
    NeedVolume(VolumeRequest),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StopMode {
    /// Finish the current archive file, then stop.
    Idle,
    /// Stop now.
    Stop,
}

pub trait CopyExecutor: Send + Sync {
    fn start(&self, job: CopyJob) -> Result<()>;
    fn stop(&self, request: &str, cpi: usize, mode: StopMode);
}

const RUN: u8 = 0;
const IDLE: u8 = 1;
const STOP: u8 = 2;

pub struct SimulatedExecutor {
    runner: Option<Arc<CommandRunner>>,
    events: Sender<CopyEvent>,
    controls: Arc<Mutex<HashMap<String, Arc<AtomicU8>>>>,
    file_delay: Duration,
    reply_timeout: Duration,
    source_root: Option<PathBuf>,
}

impl SimulatedExecutor {
    pub fn new(events: Sender<CopyEvent>) -> Self {
        Self {
            runner: None,
            events,
            controls: Arc::new(Mutex::new(HashMap::new())),
            file_delay: Duration::ZERO,
            reply_timeout: Duration::from_secs(30),
            source_root: None,
        }
    }

    /// Mount and dismount removable volumes through `runner`.
    pub fn with_runner(mut self, runner: Arc<CommandRunner>) -> Self {
        self.runner = Some(runner);
        self
    }

    pub fn with_file_delay(mut self, delay: Duration) -> Self {
        self.file_delay = delay;
        self
    }

    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Files missing below `root` when their turn comes are reported failed.
    pub fn with_source_root(mut self, root: PathBuf) -> Self {
        self.source_root = Some(root);
        self
    }

    pub fn running(&self) -> usize {
        self.controls.lock().len()
    }
}

impl CopyExecutor for SimulatedExecutor {
    fn start(&self, job: CopyJob) -> Result<()> {
        let id = job.id();
        let control = Arc::new(AtomicU8::new(RUN));
        {
            let mut controls = self.controls.lock();
            if controls.contains_key(&id) {
                return Err(RustArchiverError::schedule(format!("copy {} is already running", id)));
            }
            controls.insert(id.clone(), control.clone());
        }
        let worker = CopyWorker {
            runner: self.runner.clone(),
            events: self.events.clone(),
            control,
            file_delay: self.file_delay,
            reply_timeout: self.reply_timeout,
            source_root: self.source_root.clone(),
        };
        let controls = self.controls.clone();
        let thread_id = id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("copy-{}", id))
            .spawn(move || {
                let report = worker.run(job);
                controls.lock().remove(&thread_id);
                // Nobody listening means the daemon is shutting down.
                let _ = worker.events.send(CopyEvent::Done(report));
            });
        if let Err(e) = spawned {
            self.controls.lock().remove(&id);
            return Err(e.into());
        }
        info!("Copy {} started", id);
        Ok(())
    }

    fn stop(&self, request: &str, cpi: usize, mode: StopMode) {
        let id = copy_id(request, cpi);
        if let Some(control) = self.controls.lock().get(&id) {
            let value = match mode {
                StopMode::Idle => IDLE,
                StopMode::Stop => STOP,
            };
            control.store(value, Ordering::SeqCst);
            info!("Copy {}: {:?} requested", id, mode);
        }
    }
}

struct CopyWorker {
    runner: Option<Arc<CommandRunner>>,
    events: Sender<CopyEvent>,
    control: Arc<AtomicU8>,
    file_delay: Duration,
    reply_timeout: Duration,
    source_root: Option<PathBuf>,
}

impl CopyWorker {
    fn run(&self, job: CopyJob) -> CopyReport {
        let mut report = CopyReport {
            request: job.request.clone(),
            cpi: job.cpi,
            ..Default::default()
        };
        let mut volume = job.volume.clone();
        if let Err(e) = self.mount(job.drive, &volume) {
            warn!("Copy {}: {}", job.id(), e);
            report.error = Some(e);
            return report;
        }

        let mut used: u64 = 0;
        let mut full = false;
        let mut closed = false;
        for file in &job.files {
            match self.control.load(Ordering::SeqCst) {
                STOP => {
                    report.error = Some("stopped".to_string());
                    break;
                }
                IDLE if file.first && (!report.archived.is_empty() || !report.failed.is_empty()) => {
                    debug!("Copy {} idled at archive file boundary", job.id());
                    break;
                }
                _ => {}
            }
            if let Some(root) = &self.source_root {
                if !root.join(&file.path).exists() {
                    warn!("Copy {}: {} no longer exists", job.id(), file.path);
                    report.failed.push(file.seq);
                    continue;
                }
            }
            if self.write_timed_out(&volume.mtype) {
                warn!("Copy {}: write of {} to {} timed out", job.id(), file.path, volume.vsn);
                report.failed.push(file.seq);
                continue;
            }

            if used.saturating_add(file.space) > volume.vol_space {
                if !job.ovflmin.is_some_and(|m| file.space >= m) {
                    debug!("Copy {}: volume {} full", job.id(), volume.vsn);
                    full = true;
                    break;
                }
                let mut left = file.space;
                let mut continued = true;
                loop {
                    let fits = volume.vol_space.saturating_sub(used);
                    if left <= fits {
                        used += left;
                        break;
                    }
                    left -= fits;
                    report.volumes.push(VolumeUsage::of(&volume, volume.vol_space, true));
                    let next = self.request_volume(&job, file.space);
                    match next {
                        Some(next) => {
                            self.dismount(job.drive, &volume.mtype);
                            if let Err(e) = self.mount(job.drive, &next) {
                                report.error = Some(e);
                                continued = false;
                                break;
                            }
                            info!("Copy {}: {} continues on {}", job.id(), file.path, next.vsn);
                            volume = next;
                            used = 0;
                        }
                        None => {
                            continued = false;
                            break;
                        }
                    }
                }
                if !continued {
                    closed = true;
                    break;
                }
            } else {
                used += file.space;
            }
            report.archived.push(file.seq);
            if !self.file_delay.is_zero() {
                std::thread::sleep(self.file_delay);
            }
        }

        if !closed {
            report.volumes.push(VolumeUsage::of(&volume, used, full));
        }
        self.dismount(job.drive, &volume.mtype);
        debug!(
            "Copy {} finished: {} archived, {} failed",
            job.id(),
            report.archived.len(),
            report.failed.len()
        );
        report
    }

    /// A simulated write slower than the media's write timeout fails.
    fn write_timed_out(&self, mtype: &str) -> bool {
        match &self.runner {
            Some(runner) => self.file_delay > runner.timeout(mtype, DeviceOp::Write),
            None => false,
        }
    }

    fn mount(&self, drive: Option<DriveTarget>, volume: &VolumeAssignment) -> std::result::Result<(), String> {
        let (Some(runner), Some(drive)) = (&self.runner, drive) else {
            return Ok(());
        };
        let cmd = DeviceCommand::Mount {
            lib_eq: drive.lib_eq,
            drive_eq: drive.drive_eq,
            mtype: volume.mtype.clone(),
            vsn: volume.vsn.clone(),
        };
        match runner.execute(&cmd) {
            CommandOutcome::Completed => Ok(()),
            CommandOutcome::EquipmentDown(reason) => Err(format!("mount {} failed: {}", volume.vsn, reason)),
            CommandOutcome::TimedOut => Err(format!("mount {} timed out", volume.vsn)),
        }
    }

    fn dismount(&self, drive: Option<DriveTarget>, mtype: &str) {
        let (Some(runner), Some(drive)) = (&self.runner, drive) else {
            return;
        };
        let cmd = DeviceCommand::Dismount {
            lib_eq: drive.lib_eq,
            drive_eq: drive.drive_eq,
            mtype: mtype.to_string(),
        };
        if runner.execute(&cmd) != CommandOutcome::Completed {
            warn!("Dismount from drive {} failed", drive.drive_eq);
        }
    }

    fn request_volume(&self, job: &CopyJob, file_size: u64) -> Option<VolumeAssignment> {
        let (tx, rx) = bounded(1);
        let request = VolumeRequest {
            request: job.request.clone(),
            cpi: job.cpi,
            file_size,
            reply: tx,
        };
        if self.events.send(CopyEvent::NeedVolume(request)).is_err() {
            return None;
        }
        match rx.recv_timeout(self.reply_timeout) {
            Ok(volume) => volume,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Copy {}: no reply to overflow volume request", job.id());
                None
            }
            Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

/// Records started copies without running them.
#[derive(Default)]
pub struct DryRunExecutor {
    jobs: Mutex<Vec<CopyJob>>,
}

impl DryRunExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take_jobs(&self) -> Vec<CopyJob> {
        std::mem::take(&mut *self.jobs.lock())
    }
}

impl CopyExecutor for DryRunExecutor {
    fn start(&self, job: CopyJob) -> Result<()> {
        debug!("Planned copy {} on {}", job.id(), job.volume.vsn);
        self.jobs.lock().push(job);
        Ok(())
    }

    fn stop(&self, _request: &str, _cpi: usize, _mode: StopMode) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::{unbounded, Receiver};

    fn volume(vsn: &str, space: u64) -> VolumeAssignment {
        VolumeAssignment {
            mtype: "dk".into(),
            vsn: vsn.into(),
            aln: 0,
            slot: None,
            vol_space: space,
            loaded: false,
        }
    }

    fn job(sizes: &[u64], space: u64, ovflmin: Option<u64>) -> CopyJob {
        CopyJob {
            request: "fs.s.1.1".into(),
            cpi: 0,
            volume: volume("d1", space),
            drive: None,
            disk: true,
            ovflmin,
            files: sizes
                .iter()
                .enumerate()
                .map(|(i, s)| CopyFile {
                    seq: i as u64,
                    path: format!("f{}", i),
                    space: *s,
                    first: i == 0,
                })
                .collect(),
        }
    }

    fn done(rx: &Receiver<CopyEvent>) -> CopyReport {
        loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                CopyEvent::Done(report) => return report,
                CopyEvent::NeedVolume(req) => req.reply.send(None).unwrap(),
            }
        }
    }

    #[test]
    fn test_copy_archives_all_files() {
        let (tx, rx) = unbounded();
        let exec = SimulatedExecutor::new(tx);
        exec.start(job(&[100, 200, 300], 1000, None)).unwrap();
        let report = done(&rx);
        assert_eq!(report.archived, [0, 1, 2]);
        assert_eq!(report.volumes, [VolumeUsage::of(&volume("d1", 1000), 600, false)]);
        assert_eq!(exec.running(), 0);
    }

    #[test]
    fn test_copy_stops_when_volume_full() {
        let (tx, rx) = unbounded();
        let exec = SimulatedExecutor::new(tx);
        exec.start(job(&[400, 400, 400], 1000, None)).unwrap();
        let report = done(&rx);
        assert_eq!(report.archived, [0, 1]);
        assert!(report.volumes[0].full);
    }

    #[test]
    fn test_copy_overflows_onto_continuation_volume() {
        let (tx, rx) = unbounded();
        let exec = SimulatedExecutor::new(tx);
        exec.start(job(&[400, 900], 1000, Some(500))).unwrap();
        let report = loop {
            match rx.recv_timeout(Duration::from_secs(5)).unwrap() {
                CopyEvent::NeedVolume(req) => {
                    assert_eq!(req.file_size, 900);
                    req.reply.send(Some(volume("d2", 1000))).unwrap();
                }
                CopyEvent::Done(report) => break report,
            }
        };
        assert_eq!(report.archived, [0, 1]);
        assert_eq!(report.volumes.len(), 2);
        assert_eq!(report.volumes[0].bytes, 1000);
        assert_eq!(report.volumes[1].vsn, "d2");
        assert_eq!(report.volumes[1].bytes, 300);
    }

    #[test]
    fn test_stop_and_duplicate_start() {
        let (tx, rx) = unbounded();
        let exec = SimulatedExecutor::new(tx).with_file_delay(Duration::from_millis(20));
        exec.start(job(&[10; 20], 1000, None)).unwrap();
        assert!(exec.start(job(&[10], 1000, None)).is_err());
        exec.stop("fs.s.1.1", 0, StopMode::Stop);
        let report = done(&rx);
        assert_eq!(report.error.as_deref(), Some("stopped"));
        assert!(report.archived.len() < 20);
    }

    #[test]
    fn test_write_slower_than_media_timeout_fails() {
        use crate::config::MediaTimeouts;
        use crate::device::{DeviceTable, StaticDeviceLayer};
        let devices = Arc::new(DeviceTable::new(Arc::new(StaticDeviceLayer::new(&[]))));
        let runner = CommandRunner::new(devices).with_default_timeouts(MediaTimeouts {
            write: Duration::from_millis(5),
            ..Default::default()
        });
        let (tx, rx) = unbounded();
        let exec = SimulatedExecutor::new(tx)
            .with_runner(Arc::new(runner))
            .with_file_delay(Duration::from_millis(20));
        exec.start(job(&[10, 10], 1000, None)).unwrap();
        let report = done(&rx);
        assert!(report.archived.is_empty());
        assert_eq!(report.failed, [0, 1]);
    }

    #[test]
    fn test_missing_source_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f0"), b"x").unwrap();
        let (tx, rx) = unbounded();
        let exec = SimulatedExecutor::new(tx).with_source_root(dir.path().to_path_buf());
        exec.start(job(&[10, 10], 1000, None)).unwrap();
        let report = done(&rx);
        assert_eq!(report.archived, [0]);
        assert_eq!(report.failed, [1]);
    }
}
