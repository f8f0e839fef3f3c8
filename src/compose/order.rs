//! File orderings used by compose
//!
//! Every ordering is total: ties fall back to insertion order (`seq`) so
//! repeated passes over the same request produce the same layout.

use crate::archreq::FileInfo;
use crate::config::SortMethod;
use std::cmp::Ordering;

/// Comparator for a sort method, `None` for [`SortMethod::None`].
pub fn sort_key(method: SortMethod) -> Option<fn(&FileInfo, &FileInfo) -> Ordering> {
    let cmp: fn(&FileInfo, &FileInfo) -> Ordering = match method {
        SortMethod::None => return None,
        SortMethod::Age => |a, b| a.modtime.cmp(&b.modtime),
        SortMethod::ReverseAge => |a, b| b.modtime.cmp(&a.modtime),
        SortMethod::Path => |a, b| a.path.cmp(&b.path),
        SortMethod::ReversePath => |a, b| b.path.cmp(&a.path),
        // Higher priority first.
        SortMethod::Priority => |a, b| b.priority.total_cmp(&a.priority),
        SortMethod::ReversePriority => |a, b| a.priority.total_cmp(&b.priority),
        SortMethod::Size => |a, b| a.file_size.cmp(&b.file_size),
        SortMethod::ReverseSize => |a, b| b.file_size.cmp(&a.file_size),
    };
    Some(cmp)
}

/// Sort by a method with insertion-order tie-break.
pub fn sort_by_method(files: &mut [FileInfo], method: SortMethod) {
    match sort_key(method) {
        Some(cmp) => files.sort_by(|a, b| cmp(a, b).then(a.seq.cmp(&b.seq))),
        None => files.sort_by_key(|f| f.seq),
    }
}

pub fn by_segment(a: &FileInfo, b: &FileInfo) -> Ordering {
    a.segment
        .unwrap_or(0)
        .cmp(&b.segment.unwrap_or(0))
        .then(a.seq.cmp(&b.seq))
}

/// Online files first in original order, then offline files by stage
/// volume and position on it.
pub fn by_stage_volume(a: &FileInfo, b: &FileInfo) -> Ordering {
    match (&a.offline, &b.offline) {
        (None, None) => a.seq.cmp(&b.seq),
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(oa), Some(ob)) => oa
            .vsn
            .cmp(&ob.vsn)
            .then(oa.position.cmp(&ob.position))
            .then(oa.offset.cmp(&ob.offset))
            .then(a.seq.cmp(&b.seq)),
    }
}

/// Path order used to bring files of one directory together.
pub fn by_path(a: &FileInfo, b: &FileInfo) -> Ordering {
    a.path.cmp(&b.path).then(a.seq.cmp(&b.seq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn files() -> Vec<FileInfo> {
        let now = Utc::now();
        let mut v = vec![
            FileInfo::new("b", 300, now - Duration::seconds(10)).with_priority(1.0),
            FileInfo::new("a", 100, now).with_priority(5.0),
            FileInfo::new("c", 100, now - Duration::seconds(20)).with_priority(5.0),
        ];
        for (i, f) in v.iter_mut().enumerate() {
            f.seq = i as u64;
        }
        v
    }

    fn paths(v: &[FileInfo]) -> Vec<&str> {
        v.iter().map(|f| f.path.as_str()).collect()
    }

    #[test]
    fn test_sort_methods() {
        let mut v = files();
        sort_by_method(&mut v, SortMethod::Age);
        assert_eq!(paths(&v), ["c", "b", "a"]);
        sort_by_method(&mut v, SortMethod::ReversePath);
        assert_eq!(paths(&v), ["c", "b", "a"]);
        sort_by_method(&mut v, SortMethod::Priority);
        assert_eq!(paths(&v), ["a", "c", "b"]);
        sort_by_method(&mut v, SortMethod::Size);
        // a and c tie on size; insertion order decides.
        assert_eq!(paths(&v), ["a", "c", "b"]);
        sort_by_method(&mut v, SortMethod::None);
        assert_eq!(paths(&v), ["b", "a", "c"]);
    }

    #[test]
    fn test_stage_volume_order() {
        let now = Utc::now();
        let mut v = vec![
            FileInfo::new("x", 1, now).with_offline("li", "B", 1, 0),
            FileInfo::new("y", 1, now),
            FileInfo::new("z", 1, now).with_offline("li", "A", 9, 0),
            FileInfo::new("w", 1, now).with_offline("li", "A", 2, 0),
        ];
        for (i, f) in v.iter_mut().enumerate() {
            f.seq = i as u64;
        }
        v.sort_by(by_stage_volume);
        assert_eq!(paths(&v), ["y", "w", "z", "x"]);
    }
}
