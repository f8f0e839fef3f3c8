//! Device command runner
//!
//! Mount and dismount requests run on short-lived helper threads so a hung
//! robot cannot stall the caller. Failures are classified and retried
//! according to the vendor classifier; a helper that does not answer within
//! the media's timeout for the operation is retried the same way. Callers
//! only see the final outcome.

use super::classifier::{classifier_for, RecoveryAction, SenseData};
use super::DeviceTable;
use crate::config::{DeviceOp, MediaParams, MediaTimeouts};
use crossbeam::channel::{bounded, RecvTimeoutError};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    Mount {
        lib_eq: u32,
        drive_eq: u32,
        mtype: String,
        vsn: String,
    },
    Dismount {
        lib_eq: u32,
        drive_eq: u32,
        mtype: String,
    },
}

impl DeviceCommand {
    fn target(&self) -> (u32, u32) {
        match self {
            DeviceCommand::Mount { lib_eq, drive_eq, .. } => (*lib_eq, *drive_eq),
            DeviceCommand::Dismount { lib_eq, drive_eq, .. } => (*lib_eq, *drive_eq),
        }
    }

    fn mtype(&self) -> &str {
        match self {
            DeviceCommand::Mount { mtype, .. } | DeviceCommand::Dismount { mtype, .. } => mtype,
        }
    }

    pub fn op(&self) -> DeviceOp {
        match self {
            DeviceCommand::Mount { .. } | DeviceCommand::Dismount { .. } => DeviceOp::Request,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed,
    EquipmentDown(String),
    TimedOut,
}

pub struct CommandRunner {
    devices: Arc<DeviceTable>,
    timeouts: HashMap<String, MediaTimeouts>,
    default_timeouts: MediaTimeouts,
    max_retries: u32,
    short_wait: Duration,
    long_wait: Duration,
}

impl CommandRunner {
    pub fn new(devices: Arc<DeviceTable>) -> Self {
        Self {
            devices,
            timeouts: HashMap::new(),
            default_timeouts: MediaTimeouts::default(),
            max_retries: 3,
            short_wait: Duration::from_millis(100),
            long_wait: Duration::from_secs(2),
        }
    }

    /// Per-media timeouts from the configured media table.
    pub fn with_media(mut self, media: &BTreeMap<String, MediaParams>) -> Self {
        self.timeouts = media.iter().map(|(m, p)| (m.clone(), p.timeouts)).collect();
        self
    }

    /// Timeouts for media types without their own entry.
    pub fn with_default_timeouts(mut self, timeouts: MediaTimeouts) -> Self {
        self.default_timeouts = timeouts;
        self
    }

    pub fn with_waits(mut self, short_wait: Duration, long_wait: Duration) -> Self {
        self.short_wait = short_wait;
        self.long_wait = long_wait;
        self
    }

    /// Time allowed for one `op` on `mtype` media.
    pub fn timeout(&self, mtype: &str, op: DeviceOp) -> Duration {
        self.timeouts.get(mtype).unwrap_or(&self.default_timeouts).for_op(op)
    }

    /// Run a command to completion, retrying transient failures and
    /// expired helpers.
    pub fn execute(&self, cmd: &DeviceCommand) -> CommandOutcome {
        let (lib_eq, drive_eq) = cmd.target();
        let layer = self.devices.layer();
        let classifier = classifier_for(&layer.vendor(lib_eq));
        let timeout = self.timeout(cmd.mtype(), cmd.op());
        let mut timed_out = false;

        for attempt in 0..=self.max_retries {
            let sense = match self.run_once(cmd, timeout) {
                None => {
                    warn!(
                        "Device command {:?} timed out after {:?}, attempt {}",
                        cmd,
                        timeout,
                        attempt + 1
                    );
                    timed_out = true;
                    std::thread::sleep(self.short_wait);
                    continue;
                }
                Some(Ok(())) => {
                    debug!("Device command {:?} completed", cmd);
                    return CommandOutcome::Completed;
                }
                Some(Err(sense)) => sense,
            };
            timed_out = false;

            let action = classifier.classify(&sense);
            info!(
                "Device command on eq {} failed ({}), {} action {:?}, attempt {}",
                drive_eq,
                sense.describe(),
                classifier.name(),
                action,
                attempt + 1
            );
            match action {
                RecoveryAction::Ignore => return CommandOutcome::Completed,
                RecoveryAction::WaitShort => std::thread::sleep(self.short_wait),
                RecoveryAction::WaitLong => std::thread::sleep(self.long_wait),
                RecoveryAction::ReinitRetry => layer.reinit(drive_eq),
                RecoveryAction::DownEquipment | RecoveryAction::IllegalRequest => {
                    return self.down(drive_eq, &sense);
                }
            }
        }
        error!("Device command {:?} retries exhausted", cmd);
        if timed_out {
            self.devices.mark_down(drive_eq);
            return CommandOutcome::TimedOut;
        }
        self.down(drive_eq, &SenseData::default())
    }

    fn down(&self, eq: u32, sense: &SenseData) -> CommandOutcome {
        self.devices.mark_down(eq);
        CommandOutcome::EquipmentDown(format!("eq {}: {}", eq, sense.describe()))
    }

    // None means the helper did not answer in time.
    fn run_once(&self, cmd: &DeviceCommand, timeout: Duration) -> Option<std::result::Result<(), SenseData>> {
        let (tx, rx) = bounded(1);
        let layer = self.devices.layer();
        let cmd = cmd.clone();
        std::thread::spawn(move || {
            let result = match &cmd {
                DeviceCommand::Mount {
                    lib_eq,
                    drive_eq,
                    mtype,
                    vsn,
                } => layer.mount(*lib_eq, *drive_eq, mtype, vsn),
                DeviceCommand::Dismount { lib_eq, drive_eq, .. } => layer.dismount(*lib_eq, *drive_eq),
            };
            let _ = tx.send(result);
        });
        match rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DriveConfig, LibraryConfig, LibraryKind};
    use crate::device::{DeviceLayer, StaticDeviceLayer};

    fn library() -> Vec<LibraryConfig> {
        vec![LibraryConfig {
            name: "lib50".into(),
            eq: 50,
            kind: LibraryKind::Robot,
            simulated: false,
            available: true,
            drives_allow: None,
            drives: vec![
                DriveConfig {
                    name: "lt0".into(),
                    eq: 51,
                    available: true,
                    loaded: None,
                },
                DriveConfig {
                    name: "lt1".into(),
                    eq: 52,
                    available: true,
                    loaded: None,
                },
            ],
        }]
    }

    fn mount() -> DeviceCommand {
        DeviceCommand::Mount {
            lib_eq: 50,
            drive_eq: 51,
            mtype: "li".into(),
            vsn: "VOL001".into(),
        }
    }

    fn runner(layer: Arc<StaticDeviceLayer>, timeout: Duration) -> (Arc<DeviceTable>, CommandRunner) {
        let devices = Arc::new(DeviceTable::new(layer));
        let timeouts = MediaTimeouts {
            read: timeout,
            request: timeout,
            stage: timeout,
            write: timeout,
        };
        let runner = CommandRunner::new(devices.clone())
            .with_default_timeouts(timeouts)
            .with_waits(Duration::from_millis(1), Duration::from_millis(1));
        (devices, runner)
    }

    #[test]
    fn test_mount_completes() {
        let layer = Arc::new(StaticDeviceLayer::new(&library()));
        let (_, runner) = runner(layer.clone(), Duration::from_secs(5));
        assert_eq!(runner.execute(&mount()), CommandOutcome::Completed);
        let status = layer.status();
        assert_eq!(status[0].drives[0].vsn.as_deref(), Some("VOL001"));
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let layer = Arc::new(StaticDeviceLayer::new(&library()));
        layer.inject_fault(51, SenseData::new(0x02, 0x04, 0x01));
        layer.inject_fault(51, SenseData::new(0x06, 0x29, 0x00));
        let (_, runner) = runner(layer, Duration::from_secs(5));
        assert_eq!(runner.execute(&mount()), CommandOutcome::Completed);
    }

    #[test]
    fn test_hardware_error_downs_drive() {
        let layer = Arc::new(StaticDeviceLayer::new(&library()));
        layer.inject_fault(51, SenseData::new(0x04, 0x44, 0x00));
        let (devices, runner) = runner(layer, Duration::from_secs(5));
        assert!(matches!(runner.execute(&mount()), CommandOutcome::EquipmentDown(_)));
        let table = devices.snapshot();
        assert!(!table.libs[0].drives[0].available);
        assert!(table.libs[0].drives[1].available);
    }

    #[test]
    fn test_hung_helper_times_out_after_retries() {
        let layer = Arc::new(StaticDeviceLayer::new(&library()).with_delay(Duration::from_millis(500)));
        let (devices, runner) = runner(layer, Duration::from_millis(20));
        assert_eq!(runner.execute(&mount()), CommandOutcome::TimedOut);
        assert_eq!(devices.snapshot().libs[0].drives_avail, 1);
    }

    #[test]
    fn test_single_timeout_is_retried() {
        let layer = Arc::new(StaticDeviceLayer::new(&library()));
        layer.inject_hang(51, Duration::from_millis(300));
        let (devices, runner) = runner(layer, Duration::from_millis(50));
        assert_eq!(runner.execute(&mount()), CommandOutcome::Completed);
        let table = devices.snapshot();
        assert!(table.libs[0].drives[0].available);
        assert_eq!(table.libs[0].drives_avail, 2);
    }

    #[test]
    fn test_timeout_follows_media_and_operation() {
        let cfg = crate::config::parse(
            "[[media]]\nmtype = \"li\"\n[media.timeouts]\nrequest = 5\nwrite = 9\n",
        )
        .unwrap();
        let layer = Arc::new(StaticDeviceLayer::new(&library()));
        let devices = Arc::new(DeviceTable::new(layer));
        let runner = CommandRunner::new(devices).with_media(&cfg.media);
        assert_eq!(mount().op(), DeviceOp::Request);
        assert_eq!(runner.timeout("li", DeviceOp::Request), Duration::from_secs(5));
        assert_eq!(runner.timeout("li", DeviceOp::Write), Duration::from_secs(9));
        assert_eq!(runner.timeout("li", DeviceOp::Read), Duration::from_secs(60));
        assert_eq!(runner.timeout("mo", DeviceOp::Request), Duration::from_secs(900));
    }
}
