//! Operator notifications
//!
//! Compose and the scheduler report conditions an operator has to act on
//! through a [`Notifier`]. Delivery is fire-and-forget. Callers deduplicate
//! per request (see [`crate::archreq::ArchReq::mark_sent`]) so each
//! condition reaches the notifier once.

use crossbeam::channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Notification {
    /// No drive in any library is available.
    NoDrives,
    NoVolumes {
        set: String,
    },
    StageVolumeUnavailable {
        request: String,
        mtype: String,
        vsn: String,
    },
    NonStageable {
        request: String,
    },
    FileTooLarge {
        request: String,
        joined: bool,
        overflow: bool,
    },
    QueueTimeExceeded {
        request: String,
        waited_secs: i64,
    },
    EquipmentDown {
        eq: u32,
        reason: String,
    },
    RequestDone {
        request: String,
        archived: usize,
        failed: usize,
    },
}

impl Notification {
    /// Key used to deduplicate per request.
    pub fn key(&self) -> String {
        match self {
            Notification::NoDrives => "nodrives".to_string(),
            Notification::NoVolumes { set } => format!("novolumes:{}", set),
            Notification::StageVolumeUnavailable { mtype, vsn, .. } => {
                format!("stagevol:{}.{}", mtype, vsn)
            }
            Notification::NonStageable { .. } => "nonstage".to_string(),
            Notification::FileTooLarge { .. } => "toolarge".to_string(),
            Notification::QueueTimeExceeded { .. } => "queuetime".to_string(),
            Notification::EquipmentDown { eq, .. } => format!("down:{}", eq),
            Notification::RequestDone { .. } => "done".to_string(),
        }
    }
}

impl std::fmt::Display for Notification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Notification::NoDrives => write!(f, "No drives available for archiving"),
            Notification::NoVolumes { set } => write!(f, "No volumes available for archive set {}", set),
            Notification::StageVolumeUnavailable { request, mtype, vsn } => {
                write!(f, "{}: stage volume {}.{} not available", request, mtype, vsn)
            }
            Notification::NonStageable { request } => {
                write!(f, "{}: no offline file can be staged", request)
            }
            Notification::FileTooLarge {
                request,
                joined,
                overflow,
            } => {
                let what = if *joined { "joined files" } else { "file" };
                if *overflow {
                    write!(f, "{}: {} too large for volume overflow", request, what)
                } else {
                    write!(f, "{}: {} too large for any volume", request, what)
                }
            }
            Notification::QueueTimeExceeded { request, waited_secs } => {
                write!(f, "{}: queued for {}s without being scheduled", request, waited_secs)
            }
            Notification::EquipmentDown { eq, reason } => {
                write!(f, "Equipment {} down: {}", eq, reason)
            }
            Notification::RequestDone {
                request,
                archived,
                failed,
            } => write!(f, "{}: done, {} archived, {} failed", request, archived, failed),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Logs every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notification: Notification) {
        match notification {
            Notification::RequestDone { .. } => info!("{}", notification),
            _ => warn!("{}", notification),
        }
    }
}

/// Forwards notifications to a channel and logs them at debug level.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new() -> (Self, Receiver<Notification>) {
        let (tx, rx) = unbounded();
        (Self { tx }, rx)
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        tracing::debug!("notify: {}", notification);
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_notifier_delivers() {
        let (n, rx) = ChannelNotifier::new();
        n.notify(Notification::NoVolumes { set: "home.1".into() });
        n.notify(Notification::NoDrives);
        let got: Vec<_> = rx.try_iter().collect();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].key(), "novolumes:home.1");
    }

    #[test]
    fn test_display_too_large() {
        let n = Notification::FileTooLarge {
            request: "fs.a.1.3".into(),
            joined: true,
            overflow: false,
        };
        assert_eq!(n.to_string(), "fs.a.1.3: joined files too large for any volume");
    }
}
