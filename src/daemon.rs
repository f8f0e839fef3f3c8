//! Archiver daemon
//!
//! Four long-running workers share one [`Scheduler`]: compose, schedule,
//! copy events and device status. Configuration reloads and device table
//! rebuilds go through a [`ReconfigGate`] so they never overlap a compose
//! or scheduling decision. Operators steer the daemon with short text
//! directives, see [`Directive`].

use crate::archreq::ArchReq;
use crate::compose::OwnerNames;
use crate::config::{ConfigHandle, ConfigSnapshot};
use crate::copy::{CopyEvent, CopyExecutor};
use crate::device::DeviceTable;
use crate::error::{Result, RustArchiverError};
use crate::notify::Notifier;
use crate::queue::{QueueKind, Queues};
use crate::schedule::{DequeueStatus, RunState, RunTarget, Scheduler, SchedulerStatus};
use crate::volume::{list_volumes, SetVolumes, VolumeTables};
use crossbeam::channel::{Receiver, RecvTimeoutError};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Execution state of the daemon as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    /// The configuration has errors; nothing is scheduled.
    CmdErrors,
    /// Started but held until a `run` directive.
    Wait,
    Run,
    Term,
}

#[derive(Debug, Default)]
struct GateState {
    working: usize,
    reconfiguring: bool,
}

/// Rendezvous between workers and reconfiguration.
#[derive(Debug, Default)]
pub struct ReconfigGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

/// Held by a worker while it is working.
pub struct WorkGuard<'a> {
    gate: &'a ReconfigGate,
}

impl Drop for WorkGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.gate.state.lock();
        state.working -= 1;
        self.gate.changed.notify_all();
    }
}

impl ReconfigGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Announce work; waits while a reconfiguration is in progress.
    pub fn enter(&self) -> WorkGuard<'_> {
        let mut state = self.state.lock();
        while state.reconfiguring {
            self.changed.wait(&mut state);
        }
        state.working += 1;
        WorkGuard { gate: self }
    }

    /// Run `f` once every worker is idle. New work waits until it returns.
    pub fn reconfigure<R>(&self, f: impl FnOnce() -> R) -> R {
        {
            let mut state = self.state.lock();
            while state.reconfiguring {
                self.changed.wait(&mut state);
            }
            state.reconfiguring = true;
            while state.working > 0 {
                self.changed.wait(&mut state);
            }
        }
        let result = f();
        let mut state = self.state.lock();
        state.reconfiguring = false;
        self.changed.notify_all();
        result
    }

    pub fn working(&self) -> usize {
        self.state.lock().working
    }
}

/// Operator directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// `run`, `idle` or `stop` all archiving.
    All(RunState),
    FileSystem(String, RunState),
    Removable(RunState),
    Disk(RunState),
    Drives { library: String, count: usize },
    Dequeue(String),
    Trace,
}

fn run_state(word: &str, line: &str) -> Result<RunState> {
    RunState::parse(word).ok_or_else(|| RustArchiverError::parse(format!("expected run, idle or stop in '{}'", line)))
}

impl FromStr for Directive {
    type Err = RustArchiverError;

    fn from_str(line: &str) -> Result<Self> {
        let words: Vec<&str> = line.split_whitespace().collect();
        let directive = match words.as_slice() {
            [word] if RunState::parse(word).is_some() => Directive::All(run_state(word, line)?),
            ["trace"] => Directive::Trace,
            ["fs", name, state] => Directive::FileSystem(name.to_string(), run_state(state, line)?),
            ["rm", state] => Directive::Removable(run_state(state, line)?),
            ["dk", state] => Directive::Disk(run_state(state, line)?),
            ["drives", library, count] => Directive::Drives {
                library: library.to_string(),
                count: count
                    .parse()
                    .map_err(|_| RustArchiverError::parse(format!("invalid drive count '{}'", count)))?,
            },
            ["dequeue", name] => Directive::Dequeue(name.to_string()),
            [] => return Err(RustArchiverError::parse("empty directive")),
            _ => return Err(RustArchiverError::parse(format!("unknown directive '{}'", line.trim()))),
        };
        Ok(directive)
    }
}

/// Everything the trace directive dumps.
#[derive(Debug, Clone, Serialize)]
pub struct TraceDump {
    pub exec: ExecState,
    pub config_version: u64,
    pub scheduler: SchedulerStatus,
    pub volumes: Vec<SetVolumes>,
}

/// Collaborators a daemon runs with.
pub struct DaemonParts {
    pub config: Arc<ConfigHandle>,
    pub devices: Arc<DeviceTable>,
    pub volumes: Arc<VolumeTables>,
    pub owners: Arc<dyn OwnerNames>,
    pub notifier: Arc<dyn Notifier>,
    pub executor: Arc<dyn CopyExecutor>,
    pub events: Receiver<CopyEvent>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DaemonOptions {
    /// Hold scheduling until a `run` directive.
    pub start_waiting: bool,
}

struct Shared {
    config: Arc<ConfigHandle>,
    devices: Arc<DeviceTable>,
    volumes: Arc<VolumeTables>,
    queues: Arc<Queues>,
    scheduler: Arc<Scheduler>,
    gate: ReconfigGate,
    exec: Mutex<ExecState>,
    stop: Condvar,
}

impl Shared {
    fn exec(&self) -> ExecState {
        *self.exec.lock()
    }

    fn set_exec(&self, state: ExecState) {
        let mut exec = self.exec.lock();
        if *exec != state {
            info!("Execution state {:?} -> {:?}", *exec, state);
            *exec = state;
        }
        self.stop.notify_all();
    }

    /// Sleep up to `timeout`; false once the daemon is terminating.
    fn pause(&self, timeout: Duration) -> bool {
        let mut exec = self.exec.lock();
        if *exec != ExecState::Term {
            self.stop.wait_for(&mut exec, timeout);
        }
        *exec != ExecState::Term
    }
}

pub struct Daemon {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Daemon {
    /// Start the worker threads.
    pub fn start(parts: DaemonParts, options: DaemonOptions) -> Result<Self> {
        let queues = Arc::new(Queues::new());
        let scheduler = Arc::new(Scheduler::new(
            parts.config.clone(),
            queues.clone(),
            parts.devices.clone(),
            parts.volumes.clone(),
            parts.owners,
            parts.notifier,
            parts.executor,
        ));
        let exec = if options.start_waiting {
            ExecState::Wait
        } else {
            ExecState::Run
        };
        let shared = Arc::new(Shared {
            config: parts.config,
            devices: parts.devices,
            volumes: parts.volumes,
            queues,
            scheduler,
            gate: ReconfigGate::new(),
            exec: Mutex::new(exec),
            stop: Condvar::new(),
        });

        let mut daemon = Daemon {
            shared,
            workers: Vec::new(),
        };
        let events = parts.events;
        daemon.spawn("compose", compose_worker)?;
        daemon.spawn("schedule", schedule_worker)?;
        daemon.spawn("device", device_worker)?;
        daemon.spawn("copy-events", move |shared| event_worker(shared, events))?;
        info!("Archiver daemon started ({:?})", exec);
        Ok(daemon)
    }

    fn spawn(&mut self, name: &str, body: impl FnOnce(Arc<Shared>) + Send + 'static) -> Result<()> {
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || body(shared))?;
        self.workers.push(handle);
        Ok(())
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.shared.scheduler
    }

    pub fn exec_state(&self) -> ExecState {
        self.shared.exec()
    }

    /// Hand a new request to compose.
    pub fn submit(&self, ar: ArchReq) -> Result<()> {
        self.shared.queues.submit(ar)?;
        Ok(())
    }

    /// Requests anywhere in the pipeline.
    pub fn pending(&self) -> usize {
        self.shared.queues.lock().registered()
    }

    /// True when every remaining request is parked in the wait queue.
    pub fn stalled(&self) -> bool {
        let queues = self.shared.queues.lock();
        let pending = queues.registered();
        pending > 0 && queues.len(QueueKind::Wait) == pending
    }

    /// Install a newly loaded configuration. A failed load leaves the
    /// daemon refusing to schedule until a good one arrives.
    pub fn reload(&self, loaded: Result<ConfigSnapshot>) -> Result<u64> {
        let snapshot = match loaded {
            Ok(snapshot) => snapshot,
            Err(e) => {
                error!("Configuration rejected: {}", e);
                self.shared.set_exec(ExecState::CmdErrors);
                return Err(e);
            }
        };
        let shared = &self.shared;
        let version = shared.gate.reconfigure(|| {
            let version = shared.config.publish(snapshot);
            shared.devices.rebuild();
            shared.volumes.rebuild(&shared.devices.snapshot());
            version
        });
        if shared.exec() == ExecState::CmdErrors {
            shared.set_exec(ExecState::Run);
        }
        shared.scheduler.requeue_waiting();
        shared.queues.wake_scheduler();
        info!("Configuration version {} installed", version);
        Ok(version)
    }

    /// Apply an operator directive; returns the reply text.
    pub fn control(&self, line: &str) -> Result<String> {
        let directive: Directive = line.parse()?;
        debug!("Directive {:?}", directive);
        let shared = &self.shared;
        let sched = &shared.scheduler;
        let reply = match directive {
            Directive::All(state) => {
                if state == RunState::Run {
                    match shared.exec() {
                        ExecState::CmdErrors => {
                            return Err(RustArchiverError::config(
                                "configuration has errors; correct it before running",
                            ))
                        }
                        ExecState::Wait => shared.set_exec(ExecState::Run),
                        _ => {}
                    }
                }
                sched.set_run_state(RunTarget::Removable, state);
                sched.set_run_state(RunTarget::Disk, state);
                shared.queues.wake_scheduler();
                format!("archiving {}", state)
            }
            Directive::FileSystem(fs, state) => {
                sched.set_run_state(RunTarget::FileSystem(fs.clone()), state);
                shared.queues.wake_scheduler();
                format!("archiving of {} {}", fs, state)
            }
            Directive::Removable(state) => {
                sched.set_run_state(RunTarget::Removable, state);
                shared.queues.wake_scheduler();
                format!("removable media archiving {}", state)
            }
            Directive::Disk(state) => {
                sched.set_run_state(RunTarget::Disk, state);
                shared.queues.wake_scheduler();
                format!("disk archiving {}", state)
            }
            Directive::Drives { library, count } => {
                shared.gate.reconfigure(|| sched.set_drives_allowed(&library, count))?;
                format!("{} drives allowed for {}", count, library)
            }
            Directive::Dequeue(name) => match sched.dequeue(&name) {
                DequeueStatus::Dequeued => format!("{} dequeued", name),
                DequeueStatus::Stopping => format!("{} stopping", name),
                DequeueStatus::Busy => format!("{} busy, try again", name),
                DequeueStatus::NotFound => format!("{} not found", name),
            },
            Directive::Trace => serde_json::to_string_pretty(&self.trace())?,
        };
        info!("{}", reply.lines().next().unwrap_or_default());
        Ok(reply)
    }

    pub fn trace(&self) -> TraceDump {
        let shared = &self.shared;
        let config = shared.config.current();
        let libs = shared.devices.snapshot();
        TraceDump {
            exec: shared.exec(),
            config_version: config.version,
            scheduler: shared.scheduler.status(),
            volumes: list_volumes(&config, &shared.volumes, &libs),
        }
    }

    /// Stop the workers and wait for them.
    pub fn shutdown(self) {
        info!("Archiver daemon stopping");
        self.shared.set_exec(ExecState::Term);
        self.shared.queues.shutdown();
        for handle in self.workers {
            let name = handle.thread().name().unwrap_or("worker").to_string();
            if handle.join().is_err() {
                warn!("Worker {} panicked", name);
            }
        }
    }
}

fn compose_worker(shared: Arc<Shared>) {
    while let Some(ar) = shared.queues.next_for_compose() {
        let _work = shared.gate.enter();
        shared.scheduler.compose_and_enqueue(ar);
    }
    debug!("Compose worker done");
}

fn schedule_worker(shared: Arc<Shared>) {
    loop {
        let interval = shared.config.current().daemon.schedule_interval;
        if !shared.queues.wait_for_schedule(interval) {
            break;
        }
        if shared.exec() != ExecState::Run {
            continue;
        }
        let _work = shared.gate.enter();
        shared.scheduler.run_pass();
    }
    debug!("Schedule worker done");
}

fn device_worker(shared: Arc<Shared>) {
    loop {
        let interval = shared.config.current().daemon.device_interval;
        if !shared.pause(interval) {
            break;
        }
        let _work = shared.gate.enter();
        shared.devices.refresh_availability();
        shared.queues.wake_scheduler();
    }
    debug!("Device worker done");
}

fn event_worker(shared: Arc<Shared>, events: Receiver<CopyEvent>) {
    loop {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(event) => {
                let _work = shared.gate.enter();
                shared.scheduler.handle_event(event);
            }
            Err(RecvTimeoutError::Timeout) => {
                if shared.exec() == ExecState::Term {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("Copy event worker done");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archreq::FileInfo;
    use crate::compose::SystemOwnerNames;
    use crate::config;
    use crate::copy::SimulatedExecutor;
    use crate::device::StaticDeviceLayer;
    use crate::notify::{ChannelNotifier, Notification};
    use crate::volume::{CatalogEntry, InMemoryCatalog, InMemoryDiskDictionary};
    use chrono::Utc;
    use crossbeam::channel::unbounded;
    use std::time::Instant;

    const GB: u64 = 1 << 30;

    const CONFIG: &str = r#"
[daemon]
schedule_interval = 1
device_interval = 1

[[archive_set]]
name = "s.1"
mtype = "li"
vsns = ["^VOL"]

[[library]]
name = "lib50"
eq = 50
kind = "robot"

[[library.drive]]
name = "lt0"
eq = 51
"#;

    fn daemon(options: DaemonOptions) -> (Daemon, Receiver<Notification>) {
        let cfg = config::parse(CONFIG).unwrap();
        let devices = Arc::new(DeviceTable::new(Arc::new(StaticDeviceLayer::new(&cfg.libraries))));
        let volumes = Arc::new(VolumeTables::new(
            Arc::new(InMemoryCatalog::new(vec![CatalogEntry::new(
                50,
                1,
                "li",
                "VOL001",
                100 * GB,
                50 * GB,
            )])),
            Arc::new(InMemoryDiskDictionary::new(Vec::new())),
            &devices.snapshot(),
        ));
        let (tx, events) = unbounded();
        let (notifier, rx) = ChannelNotifier::new();
        let parts = DaemonParts {
            config: Arc::new(ConfigHandle::new(cfg)),
            devices,
            volumes,
            owners: Arc::new(SystemOwnerNames::new()),
            notifier: Arc::new(notifier),
            executor: Arc::new(SimulatedExecutor::new(tx)),
            events,
        };
        (Daemon::start(parts, options).unwrap(), rx)
    }

    fn request(seq: u32) -> ArchReq {
        let mut ar = ArchReq::new("samfs1", "s.1", seq, 1);
        for i in 0..3 {
            ar.add_file(FileInfo::new(format!("d/f{}", i), GB, Utc::now()));
        }
        ar
    }

    fn wait_until(what: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if what() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
        false
    }

    #[test]
    fn test_directive_parsing() {
        assert_eq!("run".parse::<Directive>().unwrap(), Directive::All(RunState::Run));
        assert_eq!(
            "fs samfs1 idle".parse::<Directive>().unwrap(),
            Directive::FileSystem("samfs1".into(), RunState::Idle)
        );
        assert_eq!("rm stop".parse::<Directive>().unwrap(), Directive::Removable(RunState::Stop));
        assert_eq!("dk run".parse::<Directive>().unwrap(), Directive::Disk(RunState::Run));
        assert_eq!(
            "drives lib50 2".parse::<Directive>().unwrap(),
            Directive::Drives {
                library: "lib50".into(),
                count: 2
            }
        );
        assert_eq!(
            "dequeue samfs1.s.1.1".parse::<Directive>().unwrap(),
            Directive::Dequeue("samfs1.s.1.1".into())
        );
        assert_eq!("  trace ".parse::<Directive>().unwrap(), Directive::Trace);
        assert!("rm sleep".parse::<Directive>().is_err());
        assert!("drives lib50 many".parse::<Directive>().is_err());
        assert!("".parse::<Directive>().is_err());
        assert!("launch".parse::<Directive>().is_err());
    }

    #[test]
    fn test_gate_waits_for_workers() {
        let gate = Arc::new(ReconfigGate::new());
        let guard = gate.enter();
        let done = Arc::new(Mutex::new(false));
        let handle = {
            let gate = gate.clone();
            let done = done.clone();
            std::thread::spawn(move || gate.reconfigure(|| *done.lock() = true))
        };
        std::thread::sleep(Duration::from_millis(50));
        assert!(!*done.lock());
        drop(guard);
        handle.join().unwrap();
        assert!(*done.lock());
        assert_eq!(gate.working(), 0);
    }

    #[test]
    fn test_request_runs_to_completion() {
        let (daemon, rx) = daemon(DaemonOptions::default());
        daemon.submit(request(1)).unwrap();
        assert!(wait_until(|| daemon.pending() == 0));
        let done: Vec<_> = rx
            .try_iter()
            .filter(|n| matches!(n, Notification::RequestDone { .. }))
            .collect();
        assert_eq!(
            done,
            vec![Notification::RequestDone {
                request: "samfs1.s.1.1".into(),
                archived: 3,
                failed: 0
            }]
        );
        daemon.shutdown();
    }

    #[test]
    fn test_waiting_daemon_needs_run() {
        let (daemon, _rx) = daemon(DaemonOptions { start_waiting: true });
        assert_eq!(daemon.exec_state(), ExecState::Wait);
        daemon.submit(request(1)).unwrap();
        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(daemon.pending(), 1);

        assert_eq!(daemon.control("run").unwrap(), "archiving run");
        assert_eq!(daemon.exec_state(), ExecState::Run);
        assert!(wait_until(|| daemon.pending() == 0));
        daemon.shutdown();
    }

    #[test]
    fn test_bad_config_blocks_run() {
        let (daemon, _rx) = daemon(DaemonOptions::default());
        assert!(daemon.reload(config::parse("[[archive_set]]\nname = \"x.1\"\nsort = \"sideways\"\n")).is_err());
        assert_eq!(daemon.exec_state(), ExecState::CmdErrors);
        assert!(daemon.control("run").is_err());

        let version = daemon.reload(config::parse(CONFIG)).unwrap();
        assert!(version > 0);
        assert_eq!(daemon.exec_state(), ExecState::Run);
        daemon.shutdown();
    }

    #[test]
    fn test_trace_is_json() {
        let (daemon, _rx) = daemon(DaemonOptions { start_waiting: true });
        daemon.control("rm idle").unwrap();
        let text = daemon.control("trace").unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["exec"], "wait");
        assert_eq!(value["scheduler"]["rm"], "idle");
        assert_eq!(value["volumes"][0]["volumes"][0]["vsn"], "VOL001");
        assert_eq!(daemon.control("dequeue nothing.here.1").unwrap(), "nothing.here.1 not found");
        daemon.shutdown();
    }
}
