//! Owner name resolution for owner-divided requests.

use nix::unistd::{Gid, Group, Uid, User};
use parking_lot::Mutex;
use std::collections::HashMap;
use tracing::debug;

pub trait OwnerNames: Send + Sync {
    fn user_name(&self, uid: u32) -> Option<String>;
    fn group_name(&self, gid: u32) -> Option<String>;
}

/// Names from the system user and group databases, so NSS sources such
/// as LDAP are honored. Each id is looked up once; misses are cached too.
#[derive(Debug, Default)]
pub struct SystemOwnerNames {
    users: Mutex<HashMap<u32, Option<String>>>,
    groups: Mutex<HashMap<u32, Option<String>>>,
}

impl SystemOwnerNames {
    pub fn new() -> Self {
        Self::default()
    }
}

impl OwnerNames for SystemOwnerNames {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.users
            .lock()
            .entry(uid)
            .or_insert_with(|| match User::from_uid(Uid::from_raw(uid)) {
                Ok(user) => user.map(|u| u.name),
                Err(e) => {
                    debug!("Cannot look up uid {}: {}", uid, e);
                    None
                }
            })
            .clone()
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.groups
            .lock()
            .entry(gid)
            .or_insert_with(|| match Group::from_gid(Gid::from_raw(gid)) {
                Ok(group) => group.map(|g| g.name),
                Err(e) => {
                    debug!("Cannot look up gid {}: {}", gid, e);
                    None
                }
            })
            .clone()
    }
}

/// Fixed id to name tables.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct FixedOwnerNames {
    users: HashMap<u32, String>,
    groups: HashMap<u32, String>,
}

#[cfg(test)]
impl FixedOwnerNames {
    pub(crate) fn new(users: &[(u32, &str)], groups: &[(u32, &str)]) -> Self {
        let table = |pairs: &[(u32, &str)]| pairs.iter().map(|(id, n)| (*id, n.to_string())).collect();
        Self {
            users: table(users),
            groups: table(groups),
        }
    }
}

#[cfg(test)]
impl OwnerNames for FixedOwnerNames {
    fn user_name(&self, uid: u32) -> Option<String> {
        self.users.get(&uid).cloned()
    }

    fn group_name(&self, gid: u32) -> Option<String> {
        self.groups.get(&gid).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_lookup_resolves_root() {
        let names = SystemOwnerNames::new();
        assert_eq!(names.user_name(0).as_deref(), Some("root"));
        assert_eq!(names.users.lock().len(), 1);
        // second lookup is served from the cache
        assert_eq!(names.user_name(0).as_deref(), Some("root"));
        assert_eq!(names.users.lock().len(), 1);
    }

    #[test]
    fn test_unknown_ids_have_no_name() {
        let names = SystemOwnerNames::new();
        assert_eq!(names.user_name(3_999_999_999), None);
        assert_eq!(names.group_name(3_999_999_999), None);
        assert!(names.groups.lock().contains_key(&3_999_999_999));
    }

    #[test]
    fn test_fixed_tables() {
        let names = FixedOwnerNames::new(&[(1001, "ann")], &[(100, "staff")]);
        assert_eq!(names.user_name(1001).as_deref(), Some("ann"));
        assert_eq!(names.user_name(7), None);
        assert_eq!(names.group_name(100).as_deref(), Some("staff"));
    }
}
