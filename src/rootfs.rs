//! Root Filesystem Construction
//!
//! Runs inside the forked task, after the mount namespace is unshared and
//! before credentials are dropped. Builds the container's view of the
//! filesystem: bind mounts, pivot_root into the configured root, a
//! restricted /proc, /sys, a minimal /dev, and /etc/hostname.
//!
//! The ordering is load-bearing: unshare before mounting, mount before
//! pivot_root, pivot_root before dropping capabilities. The /proc mask
//! below is only tamper-proof if nothing privileged runs after it.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::mount::{mount, umount2, MntFlags, MsFlags};
use nix::sys::stat::{mknod, Mode, SFlag};
use nix::unistd::{chdir, pivot_root};

use crate::error::{Error, ErrorKind};

/// One entry of the `bind` property: `src dst [ro|rw]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub target: PathBuf,
    pub read_only: bool,
}

impl BindMount {
    /// Parse a single `bind` entry.
    pub fn parse(entry: &str) -> Result<BindMount, Error> {
        let fields: Vec<&str> = entry.split_whitespace().collect();
        match fields.as_slice() {
            [src, dst] => Ok(BindMount {
                source: PathBuf::from(src),
                target: PathBuf::from(dst),
                read_only: false,
            }),
            [src, dst, mode] => {
                let read_only = match *mode {
                    "ro" => true,
                    "rw" => false,
                    _ => {
                        return Err(Error::invalid_value(format!(
                            "invalid bind mode {}",
                            mode
                        )))
                    }
                };
                Ok(BindMount {
                    source: PathBuf::from(src),
                    target: PathBuf::from(dst),
                    read_only,
                })
            }
            _ => Err(Error::invalid_value(format!(
                "invalid bind entry {}",
                entry
            ))),
        }
    }

    /// Parse the whole property (already split on `;`).
    pub fn parse_all(entries: &[String]) -> Result<Vec<BindMount>, Error> {
        entries.iter().map(|e| BindMount::parse(e)).collect()
    }
}

/// /proc entries masked read-only so an in-container root cannot poke
/// hardware or dump kernel memory.
const PROC_MASKED: [&str; 5] = [
    "/proc/sysrq-trigger",
    "/proc/irq",
    "/proc/bus",
    "/proc/sys",
    "/proc/kcore",
];

/// The minimal device node set: (name, kind, major, minor, mode).
const DEV_NODES: [(&str, SFlag, u32, u32, u32); 7] = [
    ("null", SFlag::S_IFCHR, 1, 3, 0o666),
    ("zero", SFlag::S_IFCHR, 1, 5, 0o666),
    ("full", SFlag::S_IFCHR, 1, 7, 0o666),
    ("random", SFlag::S_IFCHR, 1, 8, 0o666),
    ("urandom", SFlag::S_IFCHR, 1, 9, 0o666),
    ("tty", SFlag::S_IFCHR, 5, 0, 0o666),
    ("console", SFlag::S_IFCHR, 5, 1, 0o600),
];

/// Composes the task's filesystem view. All methods run in the child.
#[derive(Debug)]
pub struct RootFs {
    root: PathBuf,
    binds: Vec<BindMount>,
}

impl RootFs {
    /// `root = "/"` means no pivot: the task keeps the host root and only
    /// applies bind mounts.
    pub fn new(root: impl Into<PathBuf>, binds: Vec<BindMount>) -> Self {
        Self {
            root: root.into(),
            binds,
        }
    }

    pub fn is_host_root(&self) -> bool {
        self.root == Path::new("/")
    }

    /// Full setup sequence for an isolated task.
    pub fn compose(&self, hostname: Option<&str>, root_readonly: bool) -> Result<(), Error> {
        // Stop mount events from leaking back to the host.
        mount(
            None::<&str>,
            "/",
            None::<&str>,
            MsFlags::MS_REC | MsFlags::MS_SLAVE,
            None::<&str>,
        )?;

        self.apply_binds()?;

        if !self.is_host_root() {
            self.pivot()?;
            self.mount_proc()?;
            self.mask_proc()?;
            self.mount_sys()?;
            self.mount_dev()?;
            if root_readonly {
                mount(
                    None::<&str>,
                    "/",
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )?;
            }
        }

        // Only a pivoted root owns its /etc.
        if !self.is_host_root() {
            if let Some(hostname) = hostname {
                self.write_hostname(hostname)?;
            }
        }

        Ok(())
    }

    fn apply_binds(&self) -> Result<(), Error> {
        for bind in &self.binds {
            if !bind.source.exists() {
                return Err(Error::new(
                    ErrorKind::InvalidPath,
                    format!("bind source {} does not exist", bind.source.display()),
                ));
            }

            let target = if self.is_host_root() {
                bind.target.clone()
            } else {
                // Targets are container-relative before the pivot.
                self.root
                    .join(bind.target.strip_prefix("/").unwrap_or(&bind.target))
            };

            if bind.source.is_dir() {
                fs::create_dir_all(&target)?;
            } else {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                if !target.exists() {
                    File::create(&target)?;
                }
            }

            mount(
                Some(&bind.source),
                &target,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REC,
                None::<&str>,
            )?;

            if bind.read_only {
                mount(
                    None::<&str>,
                    &target,
                    None::<&str>,
                    MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                    None::<&str>,
                )?;
            }
        }
        Ok(())
    }

    fn pivot(&self) -> Result<(), Error> {
        if !self.root.is_dir() {
            return Err(Error::new(
                ErrorKind::InvalidPath,
                format!("root {} is not a directory", self.root.display()),
            ));
        }

        // pivot_root requires the new root to be a mount point.
        mount(
            Some(&self.root),
            &self.root,
            None::<&str>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&str>,
        )?;

        let old = self.root.join(".old_root");
        fs::create_dir_all(&old)?;

        pivot_root(&self.root, &old)?;
        chdir("/")?;

        umount2("/.old_root", MntFlags::MNT_DETACH)?;
        fs::remove_dir("/.old_root")?;
        Ok(())
    }

    fn mount_proc(&self) -> Result<(), Error> {
        fs::create_dir_all("/proc")?;
        mount(
            Some("proc"),
            "/proc",
            Some("proc"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            None::<&str>,
        )?;
        Ok(())
    }

    /// Bind the masked /proc entries over themselves read-only.
    fn mask_proc(&self) -> Result<(), Error> {
        for path in PROC_MASKED {
            if !Path::new(path).exists() {
                continue;
            }
            mount(
                Some(path),
                path,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
            mount(
                None::<&str>,
                path,
                None::<&str>,
                MsFlags::MS_BIND | MsFlags::MS_REMOUNT | MsFlags::MS_RDONLY,
                None::<&str>,
            )?;
        }
        Ok(())
    }

    fn mount_sys(&self) -> Result<(), Error> {
        fs::create_dir_all("/sys")?;
        mount(
            Some("sysfs"),
            "/sys",
            Some("sysfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_RDONLY,
            None::<&str>,
        )?;
        Ok(())
    }

    fn mount_dev(&self) -> Result<(), Error> {
        fs::create_dir_all("/dev")?;
        mount(
            Some("tmpfs"),
            "/dev",
            Some("tmpfs"),
            MsFlags::MS_NOSUID,
            Some("mode=755,size=4m"),
        )?;

        for (name, kind, major, minor, mode) in DEV_NODES {
            let path = Path::new("/dev").join(name);
            mknod(
                &path,
                kind,
                Mode::from_bits_truncate(mode),
                libc::makedev(major, minor),
            )?;
        }

        fs::create_dir_all("/dev/pts")?;
        mount(
            Some("devpts"),
            "/dev/pts",
            Some("devpts"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID,
            Some("newinstance,ptmxmode=0666,mode=620"),
        )?;
        symlink("/dev/pts/ptmx", "/dev/ptmx")?;

        fs::create_dir_all("/dev/shm")?;
        mount(
            Some("tmpfs"),
            "/dev/shm",
            Some("tmpfs"),
            MsFlags::MS_NOEXEC | MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some("mode=1777"),
        )?;
        fs::set_permissions("/dev/shm", fs::Permissions::from_mode(0o1777))?;

        symlink("/proc/self/fd", "/dev/fd")?;
        symlink("/proc/self/fd/0", "/dev/stdin")?;
        symlink("/proc/self/fd/1", "/dev/stdout")?;
        symlink("/proc/self/fd/2", "/dev/stderr")?;

        Ok(())
    }

    fn write_hostname(&self, hostname: &str) -> Result<(), Error> {
        if Path::new("/etc").is_dir() {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open("/etc/hostname")?;
            writeln!(file, "{}", hostname)?;
        }
        Ok(())
    }
}

fn symlink(original: &str, link: &str) -> Result<(), Error> {
    match std::os::unix::fs::symlink(original, link) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bind() {
        let bind = BindMount::parse("/src /dst").unwrap();
        assert_eq!(bind.source, PathBuf::from("/src"));
        assert_eq!(bind.target, PathBuf::from("/dst"));
        assert!(!bind.read_only);

        let bind = BindMount::parse("/src /dst ro").unwrap();
        assert!(bind.read_only);

        let bind = BindMount::parse("/src /dst rw").unwrap();
        assert!(!bind.read_only);
    }

    #[test]
    fn test_parse_bind_rejects() {
        assert!(BindMount::parse("/src").is_err());
        assert!(BindMount::parse("/src /dst bogus").is_err());
        assert!(BindMount::parse("/a /b ro extra").is_err());
    }

    #[test]
    fn test_parse_all() {
        let entries = vec!["/a /b".to_string(), "/c /d ro".to_string()];
        let binds = BindMount::parse_all(&entries).unwrap();
        assert_eq!(binds.len(), 2);
        assert!(binds[1].read_only);
    }

    #[test]
    fn test_host_root() {
        let rootfs = RootFs::new("/", Vec::new());
        assert!(rootfs.is_host_root());
        let rootfs = RootFs::new("/var/lib/warden/a/root", Vec::new());
        assert!(!rootfs.is_host_root());
    }
}
