//! Credentials and Capabilities
//!
//! Resolves the `user`/`group` properties to numeric ids, answers
//! permission questions for RPC callers, and performs the privilege drop
//! inside the forked task. The drop order is fixed: capability bounding
//! set first, then supplementary groups, then gid, then uid. Setresuid
//! goes last because it takes most of the others with it.

use std::str::FromStr;

use caps::{CapSet, Capability, CapsHashSet};
use nix::unistd::{setgroups, setresgid, setresuid, Gid, Group, Uid, User};

use crate::error::{Error, ErrorKind};

/// Numeric identity of a client or a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cred {
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
}

impl Cred {
    pub fn new(uid: u32, gid: u32) -> Self {
        Self {
            uid,
            gid,
            groups: Vec::new(),
        }
    }

    pub fn root() -> Self {
        Self::new(0, 0)
    }

    pub fn is_privileged(&self) -> bool {
        self.uid == 0
    }

    /// May this credential act on a container owned by `owner`?
    pub fn can_control(&self, owner: &Cred) -> bool {
        self.is_privileged() || self.uid == owner.uid
    }

    /// Resolve a user name (or numeric uid) to uid + primary gid +
    /// supplementary groups.
    pub fn from_user(user: &str) -> Result<Cred, Error> {
        let looked_up = if let Ok(uid) = user.parse::<u32>() {
            User::from_uid(Uid::from_raw(uid))?
        } else {
            User::from_name(user)?
        };

        let user_ent = looked_up
            .ok_or_else(|| Error::invalid_value(format!("invalid user {}", user)))?;

        Ok(Cred {
            uid: user_ent.uid.as_raw(),
            gid: user_ent.gid.as_raw(),
            groups: Vec::new(),
        })
    }

    /// Override the primary group from the `group` property.
    pub fn with_group(mut self, group: &str) -> Result<Cred, Error> {
        let looked_up = if let Ok(gid) = group.parse::<u32>() {
            Group::from_gid(Gid::from_raw(gid))?
        } else {
            Group::from_name(group)?
        };

        let group_ent = looked_up
            .ok_or_else(|| Error::invalid_value(format!("invalid group {}", group)))?;

        self.gid = group_ent.gid.as_raw();
        Ok(self)
    }

    /// Apply this credential to the calling process. Task-side only.
    pub fn apply(&self) -> Result<(), Error> {
        let gids: Vec<Gid> = self.groups.iter().map(|g| Gid::from_raw(*g)).collect();
        setgroups(&gids)?;

        let gid = Gid::from_raw(self.gid);
        setresgid(gid, gid, gid)?;

        let uid = Uid::from_raw(self.uid);
        setresuid(uid, uid, uid)?;
        Ok(())
    }
}

/// True if a user name or numeric uid resolves.
pub fn user_exists(user: &str) -> bool {
    Cred::from_user(user).is_ok()
}

/// True if a group name or numeric gid resolves.
pub fn group_exists(group: &str) -> bool {
    Cred::new(0, 0).with_group(group).is_ok()
}

// ============================================================================
// Capabilities
// ============================================================================

/// Parse the `capabilities` property: a list of `CAP_*` names.
pub fn parse_cap_mask(names: &[String]) -> Result<CapsHashSet, Error> {
    let mut set = CapsHashSet::new();
    for name in names {
        let cap = Capability::from_str(name).map_err(|_| {
            Error::new(
                ErrorKind::InvalidValue,
                format!("unknown capability {}", name),
            )
        })?;
        set.insert(cap);
    }
    Ok(set)
}

/// Default capability mask for os-mode containers: enough to boot a
/// distribution init, nothing that escapes the container.
pub fn os_mode_caps() -> CapsHashSet {
    let mut set = CapsHashSet::new();
    for cap in [
        Capability::CAP_CHOWN,
        Capability::CAP_DAC_OVERRIDE,
        Capability::CAP_FOWNER,
        Capability::CAP_FSETID,
        Capability::CAP_KILL,
        Capability::CAP_SETGID,
        Capability::CAP_SETUID,
        Capability::CAP_SETPCAP,
        Capability::CAP_NET_BIND_SERVICE,
        Capability::CAP_NET_RAW,
        Capability::CAP_SYS_CHROOT,
        Capability::CAP_MKNOD,
        Capability::CAP_AUDIT_WRITE,
    ] {
        set.insert(cap);
    }
    set
}

/// Restrict the bounding set to `keep`. Everything outside it becomes
/// unobtainable for the task and all its descendants.
pub fn drop_bounding_caps(keep: &CapsHashSet) -> Result<(), Error> {
    let current = caps::read(None, CapSet::Bounding)
        .map_err(|e| Error::new(ErrorKind::Unknown, format!("read bounding caps: {}", e)))?;

    for cap in current {
        if !keep.contains(&cap) {
            caps::drop(None, CapSet::Bounding, cap).map_err(|e| {
                Error::new(ErrorKind::Unknown, format!("drop {}: {}", cap, e))
            })?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_privilege() {
        assert!(Cred::root().is_privileged());
        assert!(!Cred::new(1000, 1000).is_privileged());
    }

    #[test]
    fn test_can_control() {
        let owner = Cred::new(1000, 1000);
        assert!(Cred::root().can_control(&owner));
        assert!(Cred::new(1000, 2000).can_control(&owner));
        assert!(!Cred::new(1001, 1000).can_control(&owner));
    }

    #[test]
    fn test_from_user_root() {
        let cred = Cred::from_user("root").unwrap();
        assert_eq!(cred.uid, 0);
        assert_eq!(cred.gid, 0);

        let cred = Cred::from_user("0").unwrap();
        assert_eq!(cred.uid, 0);
    }

    #[test]
    fn test_unknown_user_rejected() {
        assert!(Cred::from_user("no-such-user-warden-test").is_err());
        assert!(!user_exists("no-such-user-warden-test"));
        assert!(user_exists("root"));
    }

    #[test]
    fn test_parse_cap_mask() {
        let mask =
            parse_cap_mask(&["CAP_NET_ADMIN".to_string(), "CAP_KILL".to_string()]).unwrap();
        assert!(mask.contains(&Capability::CAP_NET_ADMIN));
        assert!(mask.contains(&Capability::CAP_KILL));
        assert_eq!(mask.len(), 2);

        assert!(parse_cap_mask(&["CAP_BOGUS".to_string()]).is_err());
    }

    #[test]
    fn test_os_mode_caps_are_bounded() {
        let mask = os_mode_caps();
        assert!(mask.contains(&Capability::CAP_KILL));
        assert!(!mask.contains(&Capability::CAP_SYS_ADMIN));
        assert!(!mask.contains(&Capability::CAP_SYS_MODULE));
    }
}
