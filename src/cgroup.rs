//! Direct Cgroup Control
//!
//! Manipulates the split v1 hierarchies under `/sys/fs/cgroup/<controller>`
//! without systemd or other intermediaries. Every container at hierarchy
//! path `/a/b/c` owns, in each enabled controller, the cgroup
//! `<controller>/warden/a/b/c`. Cgroups outside the warden subtree are
//! never created, written, or removed.
//!
//! ## Knob Mapping
//!
//! | Property | Knob |
//! |---------------------|-----------------------------------------------|
//! | `memory_limit` | `memory.limit_in_bytes` |
//! | `memory_guarantee` | `memory.low_limit_in_bytes` |
//! | `cpu_limit` | `cpu.cfs_quota_us`/`cpu.cfs_period_us`, or `cpu.smart` |
//! | `cpu_guarantee` | `cpu.shares` or `cpu.cfs_reserve_us` |
//! | `io_limit` | `memory.fs_bps_limit` |
//! | `io_ops_limit` | `memory.fs_iops_limit` |
//! | `allowed_devices` | `devices.allow` / `devices.deny` |
//! | `recharge_on_pgfault` | `memory.recharge_on_pgfault` |

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;

use crate::error::{Error, ErrorKind};

/// Mount root of the split hierarchies.
pub const CGROUP_FS: &str = "/sys/fs/cgroup";

/// Safety margin added on top of `memory_limit` so kernel accounting
/// overhead does not OOM a task sitting exactly at its limit.
pub const MEMORY_LIMIT_MARGIN: u64 = 4 << 20;

/// Lowest memory limit the kernel accepts without rejecting the write.
pub const MEMORY_LIMIT_MIN: u64 = 1 << 20;

// ============================================================================
// Controllers
// ============================================================================

/// The v1 controllers the runtime places containers into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Controller {
    Memory,
    Cpu,
    Cpuacct,
    Blkio,
    Devices,
    Freezer,
    NetCls,
    Pids,
}

impl Controller {
    pub const ALL: [Controller; 8] = [
        Controller::Memory,
        Controller::Cpu,
        Controller::Cpuacct,
        Controller::Blkio,
        Controller::Devices,
        Controller::Freezer,
        Controller::NetCls,
        Controller::Pids,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Controller::Memory => "memory",
            Controller::Cpu => "cpu",
            Controller::Cpuacct => "cpuacct",
            Controller::Blkio => "blkio",
            Controller::Devices => "devices",
            Controller::Freezer => "freezer",
            Controller::NetCls => "net_cls",
            Controller::Pids => "pids",
        }
    }
}

/// Kernel capabilities probed once at startup from the controller roots.
#[derive(Debug, Clone, Copy, Default)]
pub struct CgroupCaps {
    /// `memory.low_limit_in_bytes` (guarantee support).
    pub low_limit: bool,
    /// `cpu.smart` (realtime-ish scheduling knob).
    pub cpu_smart: bool,
    /// `cpu.cfs_reserve_us` (guarantee as reserved bandwidth).
    pub cfs_reserve: bool,
    /// `memory.fs_bps_limit` / `memory.fs_iops_limit`.
    pub fs_limits: bool,
    /// `memory.recharge_on_pgfault`.
    pub recharge: bool,
}

static CAPS: OnceCell<CgroupCaps> = OnceCell::new();

#[cfg(test)]
thread_local! {
    static TEST_CAPS: std::cell::Cell<Option<CgroupCaps>> =
        const { std::cell::Cell::new(None) };
}

/// Probe (once) which optional knobs this kernel exposes.
pub fn caps() -> CgroupCaps {
    #[cfg(test)]
    if let Some(forced) = TEST_CAPS.with(|t| t.get()) {
        return forced;
    }

    *CAPS.get_or_init(|| {
        let memory = Path::new(CGROUP_FS).join("memory");
        let cpu = Path::new(CGROUP_FS).join("cpu");
        CgroupCaps {
            low_limit: memory.join("memory.low_limit_in_bytes").exists(),
            cpu_smart: cpu.join("cpu.smart").exists(),
            cfs_reserve: cpu.join("cpu.cfs_reserve_us").exists(),
            fs_limits: memory.join("memory.fs_bps_limit").exists(),
            recharge: memory.join("memory.recharge_on_pgfault").exists(),
        }
    })
}

/// Tests pin the capability set per thread; every test runs in its own.
#[cfg(test)]
pub fn override_caps_for_tests(caps: CgroupCaps) {
    TEST_CAPS.with(|t| t.set(Some(caps)));
}

// ============================================================================
// Freezer
// ============================================================================

/// Freezer cgroup state as reported by `freezer.state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreezerState {
    Thawed,
    Freezing,
    Frozen,
}

impl FreezerState {
    fn parse(s: &str) -> FreezerState {
        match s.trim() {
            "FROZEN" => FreezerState::Frozen,
            "FREEZING" => FreezerState::Freezing,
            _ => FreezerState::Thawed,
        }
    }
}

// ============================================================================
// Cgroup
// ============================================================================

/// One cgroup directory in one controller.
#[derive(Debug, Clone)]
pub struct Cgroup {
    controller: Controller,
    path: PathBuf,
}

impl Cgroup {
    pub fn controller(&self) -> Controller {
        self.controller
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn has_knob(&self, knob: &str) -> bool {
        self.path.join(knob).exists()
    }

    /// Write a control knob.
    pub fn set_knob(&self, knob: &str, value: &str) -> Result<(), Error> {
        write_file(&self.path.join(knob), value)
    }

    /// Read a control knob, trimmed.
    pub fn knob(&self, knob: &str) -> Result<String, Error> {
        read_file(&self.path.join(knob)).map(|s| s.trim().to_string())
    }

    pub fn knob_u64(&self, knob: &str) -> Result<u64, Error> {
        let raw = self.knob(knob)?;
        raw.parse::<u64>().map_err(|_| {
            Error::new(
                ErrorKind::Unknown,
                format!("unparsable knob {}: {}", knob, raw),
            )
        })
    }

    /// Move a process into this cgroup.
    pub fn attach(&self, pid: i32) -> Result<(), Error> {
        self.set_knob("cgroup.procs", &pid.to_string())
    }

    /// Pids of all member processes.
    pub fn procs(&self) -> Result<Vec<i32>, Error> {
        let raw = read_file(&self.path.join("cgroup.procs"))?;
        Ok(raw.lines().filter_map(|l| l.trim().parse().ok()).collect())
    }

    pub fn is_empty(&self) -> Result<bool, Error> {
        Ok(self.procs()?.is_empty())
    }

    /// Freezer state; only meaningful on the freezer controller.
    pub fn freezer_state(&self) -> Result<FreezerState, Error> {
        Ok(FreezerState::parse(&self.knob("freezer.state")?))
    }

    /// Freeze and wait until the kernel reports FROZEN.
    pub fn freeze(&self, timeout: Duration) -> Result<(), Error> {
        self.set_knob("freezer.state", "FROZEN")?;
        let deadline = Instant::now() + timeout;
        loop {
            match self.freezer_state()? {
                FreezerState::Frozen => return Ok(()),
                _ if Instant::now() >= deadline => {
                    return Err(Error::new(
                        ErrorKind::Unknown,
                        format!("freezer stuck FREEZING at {}", self.path.display()),
                    ))
                }
                _ => thread::sleep(Duration::from_millis(10)),
            }
        }
    }

    pub fn thaw(&self) -> Result<(), Error> {
        self.set_knob("freezer.state", "THAWED")
    }

    /// SIGKILL every member process. The freezer sibling should be frozen
    /// first so nothing can fork between the read and the kill.
    pub fn kill_all(&self) -> Result<(), Error> {
        for pid in self.procs()? {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGKILL) {
                if e != nix::Error::ESRCH {
                    warn!("kill {} in {}: {}", pid, self.path.display(), e);
                }
            }
        }
        Ok(())
    }

    /// Remove this cgroup directory and any descendants, leaf-first.
    pub fn remove(&self) -> Result<(), Error> {
        remove_dir_recursive(&self.path)
    }
}

// ============================================================================
// Manager
// ============================================================================

/// Owns the warden subtree across all controllers.
#[derive(Debug)]
pub struct CgroupMgr {
    fs_root: PathBuf,
    subtree: String,
}

impl CgroupMgr {
    pub fn new(subtree: impl Into<String>) -> Self {
        Self {
            fs_root: PathBuf::from(CGROUP_FS),
            subtree: subtree.into(),
        }
    }

    /// Manager over a non-standard mount root; tests point this at a
    /// scratch directory.
    pub fn with_fs_root(fs_root: impl Into<PathBuf>, subtree: impl Into<String>) -> Self {
        Self {
            fs_root: fs_root.into(),
            subtree: subtree.into(),
        }
    }

    pub fn supported(&self, controller: Controller) -> bool {
        self.fs_root.join(controller.name()).exists()
    }

    /// The warden root inside one controller.
    pub fn subtree_root(&self, controller: Controller) -> Cgroup {
        Cgroup {
            controller,
            path: self.fs_root.join(controller.name()).join(&self.subtree),
        }
    }

    /// The cgroup for a container hierarchy path (`/a/b` → `warden/a/b`).
    pub fn container_cgroup(&self, controller: Controller, name: &str) -> Cgroup {
        let mut path = self.subtree_root(controller).path;
        for segment in name.split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        Cgroup { controller, path }
    }

    /// Create the warden roots and enable hierarchical memory accounting.
    pub fn prepare_roots(&self) -> Result<(), Error> {
        for controller in Controller::ALL {
            if !self.supported(controller) {
                debug!("controller {} not mounted, skipping", controller.name());
                continue;
            }
            let root = self.subtree_root(controller);
            fs::create_dir_all(root.path())?;
            if controller == Controller::Memory && root.has_knob("memory.use_hierarchy") {
                // EINVAL once tasks have joined; inherited 1 is also fine.
                if let Err(e) = root.set_knob("memory.use_hierarchy", "1") {
                    debug!("memory.use_hierarchy: {}", e);
                }
            }
        }
        Ok(())
    }

    /// Create (idempotently) a container's cgroup in one controller.
    pub fn create(&self, controller: Controller, name: &str) -> Result<Cgroup, Error> {
        let cgroup = self.container_cgroup(controller, name);
        fs::create_dir_all(cgroup.path())?;
        Ok(cgroup)
    }

    /// All existing cgroups of a container, across supported controllers.
    pub fn existing(&self, name: &str) -> Vec<Cgroup> {
        Controller::ALL
            .into_iter()
            .filter(|c| self.supported(*c))
            .map(|c| self.container_cgroup(c, name))
            .filter(|cg| cg.exists())
            .collect()
    }

    /// Remove every cgroup of a container. Paths outside the warden
    /// subtree are rejected outright.
    pub fn remove_all(&self, name: &str) -> Result<(), Error> {
        for controller in Controller::ALL {
            if !self.supported(controller) {
                continue;
            }
            let cgroup = self.container_cgroup(controller, name);
            if !cgroup
                .path()
                .starts_with(self.subtree_root(controller).path())
            {
                return Err(Error::permission(format!(
                    "refusing to remove non-warden cgroup {}",
                    cgroup.path().display()
                )));
            }
            if cgroup.exists() {
                cgroup.remove()?;
            }
        }
        Ok(())
    }
}

// ============================================================================
// OOM Monitor
// ============================================================================

/// An eventfd armed on a memory cgroup's `memory.oom_control`.
///
/// The event-loop thread polls the fd; the counter going up means the
/// kernel OOM-killed inside the cgroup.
#[derive(Debug)]
pub struct OomMonitor {
    event_fd: OwnedFd,
}

impl OomMonitor {
    pub fn install(memory_cgroup: &Cgroup) -> Result<OomMonitor, Error> {
        // SAFETY: eventfd(2) with valid flags either returns a fresh fd or -1.
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(std::io::Error::last_os_error().into());
        }
        // SAFETY: raw is a live fd owned exclusively since the call above.
        let event_fd = unsafe { OwnedFd::from_raw_fd(raw) };

        let oom_control = File::open(memory_cgroup.path().join("memory.oom_control"))?;
        let spec = format!("{} {}", event_fd.as_raw_fd(), oom_control.as_raw_fd());
        memory_cgroup.set_knob("cgroup.event_control", &spec)?;

        Ok(OomMonitor { event_fd })
    }

    pub fn fd(&self) -> RawFd {
        self.event_fd.as_raw_fd()
    }

    /// Drain the counter; true if at least one OOM event fired.
    pub fn consume(&self) -> bool {
        let mut buf = [0u8; 8];
        // SAFETY: buf is 8 writable bytes, the exact read size eventfd requires.
        let n = unsafe {
            libc::read(
                self.event_fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                8,
            )
        };
        n == 8 && u64::from_ne_bytes(buf) > 0
    }
}

// ============================================================================
// Knob Formatting
// ============================================================================

/// Parse a `cpu_limit`/`cpu_guarantee` value: `"2c"` is cores, `"150%"`
/// or a bare number is percent of one core. Returns thousandths of a core.
pub fn parse_cpu_value(s: &str, ncpus: u64) -> Result<u64, Error> {
    let s = s.trim();
    if let Some(cores) = s.strip_suffix('c') {
        let cores: f64 = cores
            .trim()
            .parse()
            .map_err(|_| Error::invalid_value(format!("invalid cpu value {}", s)))?;
        if cores < 0.0 || cores > ncpus as f64 {
            return Err(Error::invalid_value(format!(
                "cpu value {} out of range",
                s
            )));
        }
        return Ok((cores * 1000.0) as u64);
    }

    let pct = s.strip_suffix('%').unwrap_or(s);
    let pct: f64 = pct
        .trim()
        .parse()
        .map_err(|_| Error::invalid_value(format!("invalid cpu value {}", s)))?;
    if pct < 0.0 || pct > ncpus as f64 * 100.0 {
        return Err(Error::invalid_value(format!(
            "cpu value {} out of range",
            s
        )));
    }
    Ok((pct * 10.0) as u64)
}

/// CFS quota in microseconds for a limit in milli-cores, 100ms period.
pub fn cpu_quota_us(millicores: u64) -> i64 {
    if millicores == 0 {
        return -1;
    }
    (millicores as i64) * 100
}

/// Number of online cpus.
pub fn num_cpus() -> u64 {
    // SAFETY: sysconf(2) with a valid name has no preconditions.
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n <= 0 {
        1
    } else {
        n as u64
    }
}

fn remove_dir_recursive(path: &Path) -> Result<(), Error> {
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                remove_dir_recursive(&entry.path())?;
            }
        }
        // Knob files vanish with the directory; only rmdir is permitted.
        fs::remove_dir(path)?;
    }
    Ok(())
}

fn write_file(path: &Path, content: &str) -> Result<(), Error> {
    let mut file = OpenOptions::new().write(true).open(path).map_err(|e| {
        Error::with_errno(
            match e.kind() {
                std::io::ErrorKind::PermissionDenied => ErrorKind::Permission,
                std::io::ErrorKind::NotFound => ErrorKind::NotSupported,
                _ => ErrorKind::Unknown,
            },
            e.raw_os_error().unwrap_or(0),
            format!("open {}: {}", path.display(), e),
        )
    })?;

    file.write_all(content.as_bytes()).map_err(|e| {
        Error::with_errno(
            ErrorKind::InvalidValue,
            e.raw_os_error().unwrap_or(0),
            format!("write {} to {}: {}", content, path.display(), e),
        )
    })
}

fn read_file(path: &Path) -> Result<String, Error> {
    let mut content = String::new();
    File::open(path)?.read_to_string(&mut content)?;
    Ok(content)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_container_cgroup_path() {
        let mgr = CgroupMgr::with_fs_root("/sys/fs/cgroup", "warden");
        let cg = mgr.container_cgroup(Controller::Memory, "/a/b");
        assert_eq!(cg.path(), Path::new("/sys/fs/cgroup/memory/warden/a/b"));

        let root = mgr.container_cgroup(Controller::Freezer, "/");
        assert_eq!(root.path(), Path::new("/sys/fs/cgroup/freezer/warden"));
    }

    #[test]
    fn test_create_and_remove_under_fake_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("memory")).unwrap();
        let mgr = CgroupMgr::with_fs_root(dir.path(), "warden");

        let cg = mgr.create(Controller::Memory, "/x/y").unwrap();
        assert!(cg.exists());

        mgr.remove_all("/x/y").unwrap();
        assert!(!mgr.container_cgroup(Controller::Memory, "/x/y").exists());
    }

    #[test]
    fn test_remove_is_leaf_first() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("freezer")).unwrap();
        let mgr = CgroupMgr::with_fs_root(dir.path(), "warden");

        mgr.create(Controller::Freezer, "/p/c/g").unwrap();
        mgr.container_cgroup(Controller::Freezer, "/p")
            .remove()
            .unwrap();
        assert!(!mgr.container_cgroup(Controller::Freezer, "/p").exists());
    }

    #[test]
    fn test_freezer_state_parse() {
        assert_eq!(FreezerState::parse("FROZEN\n"), FreezerState::Frozen);
        assert_eq!(FreezerState::parse("FREEZING"), FreezerState::Freezing);
        assert_eq!(FreezerState::parse("THAWED"), FreezerState::Thawed);
    }

    #[test]
    fn test_parse_cpu_value() {
        assert_eq!(parse_cpu_value("2c", 8).unwrap(), 2000);
        assert_eq!(parse_cpu_value("0.5c", 8).unwrap(), 500);
        assert_eq!(parse_cpu_value("150%", 8).unwrap(), 1500);
        assert_eq!(parse_cpu_value("50", 8).unwrap(), 500);
        assert!(parse_cpu_value("9c", 8).is_err());
        assert!(parse_cpu_value("abc", 8).is_err());
        assert!(parse_cpu_value("-1", 8).is_err());
    }

    #[test]
    fn test_cpu_quota() {
        assert_eq!(cpu_quota_us(0), -1);
        assert_eq!(cpu_quota_us(1000), 100_000);
        assert_eq!(cpu_quota_us(500), 50_000);
    }

    #[test]
    fn test_knob_io() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("cpu")).unwrap();
        let mgr = CgroupMgr::with_fs_root(dir.path(), "warden");
        let cg = mgr.create(Controller::Cpu, "/k").unwrap();

        fs::write(cg.path().join("cpu.shares"), "").unwrap();
        cg.set_knob("cpu.shares", "1024").unwrap();
        assert_eq!(cg.knob_u64("cpu.shares").unwrap(), 1024);
        assert!(cg.has_knob("cpu.shares"));
        assert!(!cg.has_knob("cpu.smart"));
    }
}
