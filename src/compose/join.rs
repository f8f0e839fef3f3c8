//! Joining files of one directory into a single archive entry
//!
//! After joining, the first `sel_files` entries of the request are join
//! entries. Each refers to a contiguous range of member files that follows
//! them in the same vector.

use super::order::{by_path, sort_by_method};
use crate::archreq::{ArchReq, FileInfo, JoinRange, PR_MIN};
use crate::config::{ArchiveSet, JoinMethod};
use tracing::debug;

fn join_key(fi: &FileInfo) -> &str {
    fi.dir().unwrap_or(".")
}

/// Join the selected files of `ar` by directory. Members of each join are
/// ordered by the set's sort method.
pub fn join_files(ar: &mut ArchReq, set: &ArchiveSet) {
    if set.join != JoinMethod::Path || ar.flags.join || ar.sel_files == 0 {
        return;
    }
    let rest = ar.files.split_off(ar.sel_files);
    let mut members = std::mem::take(&mut ar.files);
    members.sort_by(|a, b| join_key(a).cmp(join_key(b)).then_with(|| by_path(a, b)));

    let mut ranges: Vec<(usize, usize)> = Vec::new();
    let mut start = 0;
    for i in 1..=members.len() {
        if i == members.len() || join_key(&members[i]) != join_key(&members[start]) {
            ranges.push((start, i));
            start = i;
        }
    }

    let joins = ranges.len();
    let mut entries = Vec::with_capacity(joins);
    for (n, &(start, end)) in ranges.iter().enumerate() {
        let group = &mut members[start..end];
        sort_by_method(group, set.sort);
        for fi in group.iter_mut() {
            fi.first = false;
        }
        if start != 0 {
            group[0].first = true;
        }
        entries.push(join_entry(group, n as u64, joins + start));
    }

    ar.files = entries;
    ar.files.extend(members);
    ar.files.extend(rest);
    ar.sel_files = joins;
    ar.flags.join = true;
    debug!("{} joined by path into {} entries", ar.name(), joins);
}

fn join_entry(group: &[FileInfo], seq: u64, start: usize) -> FileInfo {
    let head = &group[0];
    let mut entry = FileInfo::new(join_key(head).to_string(), 0, head.modtime);
    entry.seq = seq;
    entry.space = 0;
    entry.priority = PR_MIN;
    entry.uid = head.uid;
    entry.gid = head.gid;
    for fi in group {
        entry.file_size += fi.file_size;
        entry.space += fi.space;
        entry.priority = entry.priority.max(fi.priority);
        if entry.offline.is_none() {
            entry.offline = fi.offline.clone();
        }
    }
    entry.join = Some(JoinRange {
        start,
        count: group.len(),
    });
    entry
}
