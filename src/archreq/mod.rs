//! Archive requests
//!
//! An [`ArchReq`] is a batch of candidate files waiting for the same archive
//! set copy. File entries live in one index-addressed vector; join
//! pseudo-entries, when present, occupy the front of that vector and refer
//! to their members by index range.

pub mod priority;

pub use priority::{schedule_priority, PriorityInputs, ScheduleFactors, PR_MAX, PR_MIN};

use crate::utils::archive_space;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;

/// Copy-instance slot of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CpiSlot {
    Unassigned,
    /// Waiting for selection by a copy instance.
    More,
    /// Cannot be archived during this pass.
    Later,
    Assigned(u16),
}

impl CpiSlot {
    pub fn is_assigned(self) -> bool {
        matches!(self, CpiSlot::Assigned(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FileState {
    Pending,
    Archived,
    Errored,
    Removed,
}

/// Where an offline file's data currently lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OfflineInfo {
    pub media: String,
    pub vsn: String,
    pub position: u64,
    pub offset: u64,
}

/// Another archived copy of an offline file that may be staged from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AltCopy {
    pub copy: u8,
    pub location: OfflineInfo,
    pub damaged: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct JoinRange {
    pub start: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileInfo {
    pub path: String,
    /// Insertion order; the final sort tie-break.
    pub seq: u64,
    pub modtime: DateTime<Utc>,
    pub priority: f64,
    pub file_size: u64,
    /// Space the file occupies in an archive file.
    pub space: u64,
    pub uid: u32,
    pub gid: u32,
    pub offline: Option<OfflineInfo>,
    pub alt_copies: Vec<AltCopy>,
    pub segment: Option<u32>,
    /// Starts a new archive file (tarball).
    pub first: bool,
    pub cpi: CpiSlot,
    pub state: FileState,
    /// Stage source sits in a simulated library.
    pub stage_sim: bool,
    /// Copy used for staging when the primary location is unavailable.
    pub stage_copy: Option<u8>,
    pub join: Option<JoinRange>,
}

impl FileInfo {
    pub fn new(path: impl Into<String>, file_size: u64, modtime: DateTime<Utc>) -> Self {
        Self {
            path: path.into(),
            seq: 0,
            modtime,
            priority: 0.0,
            file_size,
            space: archive_space(file_size),
            uid: 0,
            gid: 0,
            offline: None,
            alt_copies: Vec::new(),
            segment: None,
            first: false,
            cpi: CpiSlot::Unassigned,
            state: FileState::Pending,
            stage_sim: false,
            stage_copy: None,
            join: None,
        }
    }

    pub fn with_priority(mut self, priority: f64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_owner(mut self, uid: u32, gid: u32) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    pub fn with_offline(mut self, media: &str, vsn: &str, position: u64, offset: u64) -> Self {
        self.offline = Some(OfflineInfo {
            media: media.to_string(),
            vsn: vsn.to_string(),
            position,
            offset,
        });
        self
    }

    pub fn with_segment(mut self, ordinal: u32) -> Self {
        self.segment = Some(ordinal);
        self
    }

    pub fn is_offline(&self) -> bool {
        self.offline.is_some()
    }

    pub fn is_join(&self) -> bool {
        self.join.is_some()
    }

    /// Archived, failed or removed since the request was built.
    pub fn is_finished(&self) -> bool {
        self.state != FileState::Pending
    }

    /// Directory portion of the path, if any.
    pub fn dir(&self) -> Option<&str> {
        self.path.rsplit_once('/').map(|(d, _)| d)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ArchReqFlags {
    /// Not yet composed.
    pub first: bool,
    pub offline: bool,
    pub segment: bool,
    pub disk: bool,
    pub honeycomb: bool,
    pub join: bool,
    pub nonstage: bool,
    /// Remove from the pipeline at the next compose pass.
    pub unqueue: bool,
    pub schederr: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ArchReqState {
    Received,
    Pruned,
    OfflineChecked,
    SegmentSorted,
    Joined,
    Sorted,
    DrivesAssigned,
    Prepared,
    HandedToScheduler,
    Archiving,
    Dropped,
    Done,
}

/// How a request's files are divided between copy instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum DivideRule {
    #[default]
    None,
    Offline,
    OwnerDir,
    OwnerUidGid,
    Segment,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeAssignment {
    pub mtype: String,
    pub vsn: String,
    /// Archive library index.
    pub aln: usize,
    pub slot: Option<u32>,
    pub vol_space: u64,
    pub loaded: bool,
}

/// Work for one drive.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CopyInstance {
    pub files: usize,
    pub space: u64,
    pub min_space: u64,
    pub owner: String,
    /// Not every file was examined; another pass is needed.
    pub more: bool,
    pub volume: Option<VolumeAssignment>,
    pub disk: bool,
    /// Drive the copy runs on.
    pub drive: Option<(usize, usize)>,
    pub bytes_written: u64,
    /// Overflow continuation volumes requested by the running copy.
    pub overflow_vsns: Vec<String>,
}

impl CopyInstance {
    pub fn empty() -> Self {
        Self {
            min_space: u64::MAX,
            ..Default::default()
        }
    }

    /// A copy is active while it holds a volume.
    pub fn is_active(&self) -> bool {
        self.volume.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchReq {
    pub fsname: String,
    pub asname: String,
    pub seqnum: u32,
    pub files: Vec<FileInfo>,
    /// Leading entries of `files` the scheduler works on.
    pub sel_files: usize,
    pub space: u64,
    pub sel_space: u64,
    pub min_space: u64,
    pub priority: f64,
    pub sched_priority: f64,
    pub flags: ArchReqFlags,
    pub state: ArchReqState,
    /// Copy instance slots; the drive limit for this request.
    pub drives: usize,
    pub drives_used: usize,
    pub divides: DivideRule,
    pub cpi: Vec<CopyInstance>,
    pub stage_vols: usize,
    pub time_created: DateTime<Utc>,
    pub time_queued: DateTime<Utc>,
    /// Notifications already delivered for this request.
    pub sent: BTreeSet<String>,
    /// Human readable reason the request is not progressing.
    pub stall_reason: Option<String>,
}

impl ArchReq {
    pub fn new(fsname: &str, asname: &str, seqnum: u32, drives: usize) -> Self {
        let now = Utc::now();
        let drives = drives.max(1);
        Self {
            fsname: fsname.to_string(),
            asname: asname.to_string(),
            seqnum,
            files: Vec::new(),
            sel_files: 0,
            space: 0,
            sel_space: 0,
            min_space: u64::MAX,
            priority: PR_MIN,
            sched_priority: PR_MIN,
            flags: ArchReqFlags {
                first: true,
                ..Default::default()
            },
            state: ArchReqState::Received,
            drives,
            drives_used: 0,
            divides: DivideRule::None,
            cpi: vec![CopyInstance::empty(); drives],
            stage_vols: 0,
            time_created: now,
            time_queued: now,
            sent: BTreeSet::new(),
            stall_reason: None,
        }
    }

    /// `fs.set.seq`
    pub fn name(&self) -> String {
        format!("{}.{}.{}", self.fsname, self.asname, self.seqnum)
    }

    /// Append a candidate file.
    pub fn add_file(&mut self, mut file: FileInfo) {
        file.seq = self.files.len() as u64;
        self.space = self.space.saturating_add(file.space);
        self.min_space = self.min_space.min(file.space);
        self.priority = self.priority.max(file.priority);
        if file.is_offline() {
            self.flags.offline = true;
        }
        if file.segment.is_some() {
            self.flags.segment = true;
        }
        self.files.push(file);
        self.sel_files = self.files.len();
        self.sel_space = self.space;
    }

    pub fn file_count(&self) -> usize {
        self.files.len() - if self.flags.join { self.sel_files } else { 0 }
    }

    pub fn selected(&self) -> &[FileInfo] {
        &self.files[..self.sel_files]
    }

    /// The real files a schedulable entry stands for.
    pub fn members(&self, index: usize) -> &[FileInfo] {
        match self.files[index].join {
            Some(r) => &self.files[r.start..r.start + r.count],
            None => std::slice::from_ref(&self.files[index]),
        }
    }

    pub fn members_mut(&mut self, index: usize) -> &mut [FileInfo] {
        match self.files[index].join {
            Some(r) => &mut self.files[r.start..r.start + r.count],
            None => std::slice::from_mut(&mut self.files[index]),
        }
    }

    /// The real file with insertion number `seq`; join entries are skipped.
    pub fn file_mut(&mut self, seq: u64) -> Option<&mut FileInfo> {
        let skip = if self.flags.join { self.sel_files } else { 0 };
        self.files[skip..].iter_mut().find(|f| f.seq == seq)
    }

    /// Real files assigned to copy instance `cpi`, in archive order. The
    /// flag is set on the first member of an entry that opens an archive
    /// file.
    pub fn copy_files(&self, cpi: usize) -> Vec<(bool, &FileInfo)> {
        let slot = CpiSlot::Assigned(cpi as u16);
        (0..self.sel_files)
            .filter(|&i| self.files[i].cpi == slot)
            .flat_map(move |i| {
                let first = self.files[i].first;
                self.members(i)
                    .iter()
                    .enumerate()
                    .map(move |(k, f)| (first && k == 0, f))
            })
            .filter(|(_, f)| !f.is_finished())
            .collect()
    }

    /// Mark a notification sent; false if it already was.
    pub fn mark_sent(&mut self, key: impl Into<String>) -> bool {
        self.sent.insert(key.into())
    }

    pub fn active_copies(&self) -> usize {
        self.cpi.iter().filter(|c| c.is_active()).count()
    }

    pub fn reset_copy_instances(&mut self) {
        for ci in self.cpi.iter_mut() {
            *ci = CopyInstance::empty();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_file_tracks_aggregates() {
        let mut ar = ArchReq::new("samfs1", "home.1", 7, 2);
        assert_eq!(ar.name(), "samfs1.home.1.7");
        assert!(ar.flags.first);
        ar.add_file(FileInfo::new("a/x", 100, Utc::now()).with_priority(3.0));
        ar.add_file(FileInfo::new("a/y", 2000, Utc::now()).with_offline("li", "V1", 5, 0));
        assert_eq!(ar.files[1].seq, 1);
        assert_eq!(ar.space, 1024 + 2560);
        assert_eq!(ar.min_space, 1024);
        assert_eq!(ar.priority, 3.0);
        assert!(ar.flags.offline);
        assert!(!ar.flags.segment);
        assert_eq!(ar.sel_files, 2);
        assert_eq!(ar.cpi.len(), 2);
        assert_eq!(ar.file_count(), 2);
    }

    #[test]
    fn test_members_of_plain_entry() {
        let mut ar = ArchReq::new("fs", "s.1", 1, 1);
        ar.add_file(FileInfo::new("f", 1, Utc::now()));
        assert_eq!(ar.members(0).len(), 1);
        assert!(ar.mark_sent("novol"));
        assert!(!ar.mark_sent("novol"));
    }

    #[test]
    fn test_copy_files_expand_joins() {
        let mut ar = ArchReq::new("fs", "s.1", 1, 1);
        ar.add_file(FileInfo::new("d/a", 1, Utc::now()));
        ar.add_file(FileInfo::new("d/b", 1, Utc::now()));
        let mut entry = FileInfo::new("d", 2, Utc::now());
        entry.join = Some(JoinRange { start: 1, count: 2 });
        entry.cpi = CpiSlot::Assigned(0);
        ar.files.insert(0, entry);
        ar.sel_files = 1;
        ar.flags.join = true;
        ar.files[0].first = true;
        let files: Vec<_> = ar.copy_files(0).iter().map(|(first, f)| (*first, f.path.as_str())).collect();
        assert_eq!(files, [(true, "d/a"), (false, "d/b")]);
        assert_eq!(ar.file_mut(1).map(|f| f.path.clone()), Some("d/b".to_string()));
    }

    #[test]
    fn test_file_dir() {
        let f = FileInfo::new("a/b/c", 1, Utc::now());
        assert_eq!(f.dir(), Some("a/b"));
        assert_eq!(FileInfo::new("c", 1, Utc::now()).dir(), None);
    }
}
