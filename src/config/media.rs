//! Media parameters
//!
//! Per media type defaults for archive file size, volume overflow and
//! device command timeouts.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Optical media type mnemonics. Everything else removable is treated as tape.
const OPTICAL_TYPES: &[&str] = &["mo", "o2", "od", "wo", "mf", "pd", "pe", "wp"];

/// Disk archive media type.
pub const DISK_MTYPE: &str = "dk";
/// Honeycomb (object store silo) media type.
pub const HONEYCOMB_MTYPE: &str = "cb";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Tape,
    Optical,
    Disk,
    Honeycomb,
}

impl MediaKind {
    pub fn from_mtype(mtype: &str) -> Self {
        match mtype {
            DISK_MTYPE => MediaKind::Disk,
            HONEYCOMB_MTYPE => MediaKind::Honeycomb,
            m if OPTICAL_TYPES.contains(&m) => MediaKind::Optical,
            _ => MediaKind::Tape,
        }
    }

    pub fn is_removable(self) -> bool {
        matches!(self, MediaKind::Tape | MediaKind::Optical)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MediaTimeouts {
    pub read: Duration,
    pub request: Duration,
    pub stage: Duration,
    pub write: Duration,
}

/// Device operation kinds that carry their own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceOp {
    Read,
    /// Robot requests: mount and dismount.
    Request,
    Stage,
    Write,
}

impl MediaTimeouts {
    pub fn for_op(&self, op: DeviceOp) -> Duration {
        match op {
            DeviceOp::Read => self.read,
            DeviceOp::Request => self.request,
            DeviceOp::Stage => self.stage,
            DeviceOp::Write => self.write,
        }
    }
}

impl Default for MediaTimeouts {
    fn default() -> Self {
        Self {
            read: Duration::from_secs(60),
            request: Duration::from_secs(15 * 60),
            stage: Duration::from_secs(15 * 60),
            write: Duration::from_secs(15 * 60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MediaParams {
    pub mtype: String,
    pub kind: MediaKind,
    /// Default archive file (tarball) size.
    pub archmax: u64,
    /// Minimum file size allowed to overflow volumes; `None` disables overflow.
    pub ovflmin: Option<u64>,
    pub timeouts: MediaTimeouts,
}

impl MediaParams {
    pub fn defaults(mtype: &str) -> Self {
        let kind = MediaKind::from_mtype(mtype);
        let archmax = match kind {
            MediaKind::Tape => 512 << 20,
            MediaKind::Optical => 5 << 20,
            MediaKind::Disk | MediaKind::Honeycomb => 1 << 30,
        };
        Self {
            mtype: mtype.to_string(),
            kind,
            archmax,
            ovflmin: None,
            timeouts: MediaTimeouts::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_media_kind_from_mtype() {
        assert_eq!(MediaKind::from_mtype("dk"), MediaKind::Disk);
        assert_eq!(MediaKind::from_mtype("cb"), MediaKind::Honeycomb);
        assert_eq!(MediaKind::from_mtype("mo"), MediaKind::Optical);
        assert_eq!(MediaKind::from_mtype("li"), MediaKind::Tape);
        assert!(MediaKind::Tape.is_removable());
        assert!(!MediaKind::Disk.is_removable());
    }

    #[test]
    fn test_timeout_per_operation() {
        let t = MediaTimeouts {
            write: Duration::from_secs(7),
            ..Default::default()
        };
        assert_eq!(t.for_op(DeviceOp::Write), Duration::from_secs(7));
        assert_eq!(t.for_op(DeviceOp::Read), Duration::from_secs(60));
        assert_eq!(t.for_op(DeviceOp::Request), Duration::from_secs(900));
    }

    #[test]
    fn test_media_defaults() {
        let mp = MediaParams::defaults("mo");
        assert_eq!(mp.archmax, 5 << 20);
        assert!(mp.ovflmin.is_none());
    }
}
