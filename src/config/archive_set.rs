//! Archive set policy model
//!
//! An [`ArchiveSet`] is the resolved, immutable policy for one copy of a
//! collection of files. Unset fields are inherited from `allsets.<copy>`,
//! then `allsets`, then built-in defaults.

use super::media::MediaKind;
use super::vsn::VsnDesc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const ALLSETS: &str = "allsets";
pub const MAX_COPIES: u8 = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinMethod {
    #[default]
    None,
    Path,
}

impl JoinMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(JoinMethod::None),
            "path" => Some(JoinMethod::Path),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMethod {
    #[default]
    None,
    Age,
    Path,
    Priority,
    Size,
    ReverseAge,
    ReversePath,
    ReversePriority,
    ReverseSize,
}

impl SortMethod {
    /// Accepts `age`, `path`, `priority`, `size` and the `r`-prefixed reverse forms.
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => SortMethod::None,
            "age" => SortMethod::Age,
            "path" => SortMethod::Path,
            "priority" => SortMethod::Priority,
            "size" => SortMethod::Size,
            "rage" => SortMethod::ReverseAge,
            "rpath" => SortMethod::ReversePath,
            "rpriority" => SortMethod::ReversePriority,
            "rsize" => SortMethod::ReverseSize,
            _ => return None,
        })
    }

    pub fn is_reverse(self) -> bool {
        matches!(
            self,
            SortMethod::ReverseAge
                | SortMethod::ReversePath
                | SortMethod::ReversePriority
                | SortMethod::ReverseSize
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OfflineCopy {
    #[default]
    None,
    Direct,
    StageAhead,
    StageAll,
}

impl OfflineCopy {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "none" => OfflineCopy::None,
            "direct" => OfflineCopy::Direct,
            "stageahead" => OfflineCopy::StageAhead,
            "stageall" => OfflineCopy::StageAll,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OwnerKind {
    Dir,
    User,
    Group,
}

/// Volume reservation policy. A reserved volume records the
/// `{set, owner, filesystem}` triple it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ReserveMethod {
    pub set: bool,
    pub owner: Option<OwnerKind>,
    pub fs: bool,
}

impl ReserveMethod {
    pub fn is_none(&self) -> bool {
        !self.set && self.owner.is_none() && !self.fs
    }

    /// Fold one keyword into the method.
    pub fn add(&mut self, keyword: &str) -> std::result::Result<(), String> {
        let owner = match keyword {
            "set" => {
                self.set = true;
                return Ok(());
            }
            "fs" => {
                self.fs = true;
                return Ok(());
            }
            "dir" => OwnerKind::Dir,
            "user" => OwnerKind::User,
            "group" => OwnerKind::Group,
            other => return Err(format!("unknown reserve method '{}'", other)),
        };
        if self.owner.is_some_and(|o| o != owner) {
            return Err("only one of dir, user or group may be reserved".to_string());
        }
        self.owner = Some(owner);
        Ok(())
    }
}

/// Weights combined into file and scheduling priorities.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriorityWeights {
    pub age: f64,
    pub size: f64,
    pub copy: [f64; MAX_COPIES as usize],
    pub copies: f64,
    pub rearchive: f64,
    pub immediate: f64,
    pub release: f64,
    pub loaded: f64,
    pub offline: f64,
    pub overflow: f64,
    pub queue_wait: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RecycleParams {
    pub hwm: Option<u8>,
    pub mingain: Option<u8>,
    pub vsncount: Option<u32>,
    pub dataquantity: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct ArchiveSet {
    /// Full name, e.g. `home.1`.
    pub name: String,
    /// Copy number 1..=4, `None` for `allsets` and uncopied sets.
    pub copy: Option<u8>,
    pub mtype: Option<String>,
    pub archmax: Option<u64>,
    pub drives: usize,
    pub drivemax: Option<u64>,
    pub drivemin: Option<u64>,
    pub ovflmin: Option<u64>,
    pub join: JoinMethod,
    pub sort: SortMethod,
    pub offline_copy: OfflineCopy,
    pub reserve: ReserveMethod,
    pub vsns: Vec<VsnDesc>,
    pub priorities: PriorityWeights,
    pub fillvsns: bool,
    pub fillvsns_min: u64,
    pub queue_time: Duration,
    pub recycle: RecycleParams,
}

impl ArchiveSet {
    pub fn media_kind(&self) -> Option<MediaKind> {
        self.mtype.as_deref().map(MediaKind::from_mtype)
    }

    pub fn is_disk(&self) -> bool {
        self.media_kind() == Some(MediaKind::Disk)
    }

    pub fn is_honeycomb(&self) -> bool {
        self.media_kind() == Some(MediaKind::Honeycomb)
    }

    /// Archive set base name without the copy suffix.
    pub fn base_name(&self) -> &str {
        match self.name.rsplit_once('.') {
            Some((base, copy)) if copy.parse::<u8>().is_ok() => base,
            _ => &self.name,
        }
    }
}

/// Split `home.2` into (`home`, Some(2)).
pub fn split_copy(name: &str) -> (&str, Option<u8>) {
    match name.rsplit_once('.') {
        Some((base, copy)) => match copy.parse::<u8>() {
            Ok(n) => (base, Some(n)),
            Err(_) => (name, None),
        },
        None => (name, None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sort_method_parse() {
        assert_eq!(SortMethod::parse("rsize"), Some(SortMethod::ReverseSize));
        assert!(SortMethod::parse("rsize").unwrap().is_reverse());
        assert!(!SortMethod::Age.is_reverse());
        assert_eq!(SortMethod::parse("bogus"), None);
    }

    #[test]
    fn test_reserve_method_keywords() {
        let mut rm = ReserveMethod::default();
        assert!(rm.is_none());
        rm.add("set").unwrap();
        rm.add("user").unwrap();
        assert!(rm.set);
        assert_eq!(rm.owner, Some(OwnerKind::User));
        assert!(rm.add("group").is_err());
        assert!(rm.add("owner-ish").is_err());
    }

    #[test]
    fn test_split_copy() {
        assert_eq!(split_copy("home.2"), ("home", Some(2)));
        assert_eq!(split_copy("allsets"), ("allsets", None));
        assert_eq!(split_copy("a.b"), ("a.b", None));
    }
}
