//! Linux Namespace Isolation
//!
//! Composes the unshare mask a container task runs under and enters
//! existing namespaces when a child shares its parent's set.
//!
//! | Namespace | Flag | Isolates |
//! |-----------|------|----------|
//! | Mount | `CLONE_NEWNS` | Mount points |
//! | PID | `CLONE_NEWPID` | Process IDs |
//! | Network | `CLONE_NEWNET` | Network stack |
//! | UTS | `CLONE_NEWUTS` | Hostname |
//! | IPC | `CLONE_NEWIPC` | IPC primitives |

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use bitflags::bitflags;
use nix::sched::{setns, unshare, CloneFlags};
use nix::unistd::sethostname;

use crate::error::Error;

bitflags! {
    /// Namespaces a task may be isolated in.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NsFlags: i32 {
        const MOUNT = libc::CLONE_NEWNS;
        const PID = libc::CLONE_NEWPID;
        const NET = libc::CLONE_NEWNET;
        const UTS = libc::CLONE_NEWUTS;
        const IPC = libc::CLONE_NEWIPC;
    }
}

impl NsFlags {
    /// The set an `isolate=true` container always unshares.
    pub const ISOLATE: NsFlags = NsFlags::MOUNT
        .union(NsFlags::PID)
        .union(NsFlags::UTS)
        .union(NsFlags::IPC);

    /// Build the unshare mask from container configuration.
    ///
    /// `isolate=false` leaves the mask empty, so the task joins its
    /// parent's namespaces instead. Hostname, a private root, and a non-inherited
    /// network each force the corresponding namespace even then.
    pub fn compose(isolate: bool, hostname_set: bool, private_net: bool, private_root: bool) -> NsFlags {
        let mut flags = NsFlags::empty();
        if isolate {
            flags |= NsFlags::ISOLATE;
        }
        if hostname_set {
            flags |= NsFlags::UTS;
        }
        if private_net {
            flags |= NsFlags::NET;
        }
        if private_root {
            flags |= NsFlags::MOUNT;
        }
        flags
    }

    fn to_clone_flags(self) -> CloneFlags {
        CloneFlags::from_bits_truncate(self.bits())
    }
}

/// Unshare the given namespaces in the calling process.
pub fn unshare_namespaces(flags: NsFlags) -> Result<(), Error> {
    if flags.is_empty() {
        return Ok(());
    }
    unshare(flags.to_clone_flags())?;
    Ok(())
}

/// Set the hostname inside an unshared UTS namespace.
pub fn set_hostname(hostname: &str) -> Result<(), Error> {
    sethostname(hostname)?;
    Ok(())
}

// ============================================================================
// Entering Another Task's Namespaces
// ============================================================================

/// Paths to one process's namespace files, snapshot at open time.
///
/// Used when `isolate=false`: the child enters the parent container
/// task's namespaces before exec. Holding open files (not paths) keeps
/// the namespaces alive even if the owning task dies mid-start.
#[derive(Debug)]
pub struct NsSet {
    files: Vec<(NsFlags, File)>,
}

impl NsSet {
    /// Open the namespace files of `pid` for the given set.
    pub fn open(pid: i32, flags: NsFlags) -> Result<NsSet, Error> {
        let mut files = Vec::new();
        for (flag, name) in [
            (NsFlags::IPC, "ipc"),
            (NsFlags::UTS, "uts"),
            (NsFlags::NET, "net"),
            (NsFlags::PID, "pid"),
            (NsFlags::MOUNT, "mnt"),
        ] {
            if flags.contains(flag) {
                let path = PathBuf::from(format!("/proc/{}/ns/{}", pid, name));
                files.push((flag, File::open(path)?));
            }
        }
        Ok(NsSet { files })
    }

    /// Enter every captured namespace.
    ///
    /// Order matters: pid and mount go last, since entering mnt can hide
    /// /proc and entering pid only affects children of the caller.
    pub fn enter(&self) -> Result<(), Error> {
        for (flag, file) in &self.files {
            setns(file, flag.to_clone_flags())?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn fds(&self) -> Vec<i32> {
        self.files.iter().map(|(_, f)| f.as_raw_fd()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolate_set() {
        let flags = NsFlags::compose(true, false, false, false);
        assert!(flags.contains(NsFlags::MOUNT));
        assert!(flags.contains(NsFlags::PID));
        assert!(flags.contains(NsFlags::UTS));
        assert!(flags.contains(NsFlags::IPC));
        assert!(!flags.contains(NsFlags::NET));
    }

    #[test]
    fn test_shared_set_is_empty() {
        assert!(NsFlags::compose(false, false, false, false).is_empty());
    }

    #[test]
    fn test_hostname_forces_uts() {
        let flags = NsFlags::compose(false, true, false, false);
        assert_eq!(flags, NsFlags::UTS);
    }

    #[test]
    fn test_private_net_and_root() {
        let flags = NsFlags::compose(false, false, true, true);
        assert!(flags.contains(NsFlags::NET));
        assert!(flags.contains(NsFlags::MOUNT));
        assert!(!flags.contains(NsFlags::PID));
    }

    #[test]
    fn test_open_own_namespaces() {
        let set = NsSet::open(std::process::id() as i32, NsFlags::UTS | NsFlags::IPC).unwrap();
        assert_eq!(set.fds().len(), 2);
        assert!(!set.is_empty());
    }
}
