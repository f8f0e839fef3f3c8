//! rust-archiver
//!
//! Archive request composition and volume scheduling for a tiered storage
//! archiver: requests of candidate files are composed into per-drive work,
//! matched against drives and volumes, and handed to copy executors.

pub mod archreq;
pub mod cli;
pub mod commands;
pub mod compose;
pub mod config;
pub mod copy;
pub mod daemon;
pub mod device;
pub mod display;
pub mod error;
pub mod logger;
pub mod notify;
pub mod queue;
pub mod scan;
pub mod schedule;
pub mod utils;
pub mod volume;


// Re-export key types for easier use
pub use archreq::{ArchReq, CopyInstance, FileInfo};
pub use config::{ConfigHandle, ConfigSnapshot};
pub use daemon::{Daemon, DaemonOptions, DaemonParts, Directive, ExecState};
pub use error::{Result, RustArchiverError};
pub use queue::{QueueKind, Queues};
pub use schedule::{RunState, Scheduler};
pub use volume::{VolumeInfo, VolumeTables};
