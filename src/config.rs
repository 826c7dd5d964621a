//! Daemon Configuration
//!
//! All tunables and well-known paths live in one `WardenConfig` built at
//! process start. Components never read globals; the daemon threads a
//! `WardenContext` (config plus shared collaborators) into everything it
//! constructs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cgroup::CgroupMgr;
use crate::events::EventHandle;
use crate::kv::KvStore;
use crate::netclass::NetClassMgr;

/// Tunables and filesystem layout.
#[derive(Debug, Clone)]
pub struct WardenConfig {
    /// RPC socket path.
    pub socket_path: PathBuf,
    /// Tmpfs mountpoint backing the key-value store.
    pub kv_root: PathBuf,
    /// Size option for the key-value tmpfs mount.
    pub kv_tmpfs_size: String,
    /// Master (reaper) pidfile.
    pub master_pidfile: PathBuf,
    /// Slave pidfile.
    pub slave_pidfile: PathBuf,
    /// Daemon log file.
    pub log_file: PathBuf,
    /// Per-container home prefix.
    pub place_dir: PathBuf,
    /// Name of the runtime-owned cgroup subtree in every controller.
    pub cgroup_subtree: String,
    /// Hard cap on live containers; also the id pool size.
    pub max_containers: u16,
    /// RPC worker threads.
    pub rpc_workers: usize,
    /// Grace period between SIGTERM and SIGKILL on stop, in milliseconds.
    pub stop_timeout_ms: u64,
    /// Dead containers are removed this many seconds after death.
    pub aging_time_s: u64,
    /// Delay before an automatic respawn, in milliseconds.
    pub respawn_delay_ms: u64,
    /// Memory withheld from the guarantee budget, in bytes.
    pub guarantee_reserve: u64,
    /// Default cap on retained stdout/stderr bytes.
    pub stdout_limit: u64,
    /// Pause between master respawns of a crashing slave, in milliseconds.
    pub slave_respawn_delay_ms: u64,
}

impl Default for WardenConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/warden.socket"),
            kv_root: PathBuf::from("/run/warden/kv"),
            kv_tmpfs_size: "size=32m".to_string(),
            master_pidfile: PathBuf::from("/run/wardenloop.pid"),
            slave_pidfile: PathBuf::from("/run/wardend.pid"),
            log_file: PathBuf::from("/var/log/wardend.log"),
            place_dir: PathBuf::from("/var/lib/warden"),
            cgroup_subtree: "warden".to_string(),
            max_containers: 4096,
            rpc_workers: 8,
            stop_timeout_ms: 5000,
            aging_time_s: 60 * 60 * 24,
            respawn_delay_ms: 1000,
            guarantee_reserve: 2 << 30,
            stdout_limit: 8 << 20,
            slave_respawn_delay_ms: 1000,
        }
    }
}

impl WardenConfig {
    /// Defaults with `WARDEN_*` environment overrides applied.
    ///
    /// Only the knobs useful for tests and packaging are overridable;
    /// anything else would just be a second config file.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("WARDEN_SOCKET") {
            cfg.socket_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WARDEN_KV_ROOT") {
            cfg.kv_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WARDEN_PLACE") {
            cfg.place_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WARDEN_LOG") {
            cfg.log_file = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("WARDEN_MAX_CONTAINERS") {
            if let Ok(n) = v.parse() {
                cfg.max_containers = n;
            }
        }
        if let Ok(v) = std::env::var("WARDEN_RPC_WORKERS") {
            if let Ok(n) = v.parse() {
                cfg.rpc_workers = n;
            }
        }
        if let Ok(v) = std::env::var("WARDEN_STOP_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                cfg.stop_timeout_ms = n;
            }
        }

        cfg
    }

    /// Home directory of a container's task.
    pub fn container_home(&self, name: &str) -> PathBuf {
        self.place_dir.join(name.trim_start_matches('/'))
    }
}

/// Shared collaborators threaded into every component at construction.
///
/// Built once in the slave's main; nothing in the crate reads globals.
#[derive(Debug)]
pub struct WardenContext {
    pub config: WardenConfig,
    pub kv: KvStore,
    pub cgroups: CgroupMgr,
    pub netclass: NetClassMgr,
    pub stat: DaemonStat,
    pub events: EventHandle,
}

/// Process-wide daemon counters, surfaced as hidden root data.
///
/// Plain relaxed atomics: the counters are monotonic and only read for
/// reporting.
#[derive(Debug, Default)]
pub struct DaemonStat {
    pub spawned: AtomicU64,
    pub errors: AtomicU64,
    pub warns: AtomicU64,
    pub master_started: AtomicU64,
    pub slave_started: AtomicU64,
    pub queued_statuses: AtomicU64,
    pub created: AtomicU64,
    pub removed_dead: AtomicU64,
    pub restore_failed: AtomicU64,
}

impl DaemonStat {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = WardenConfig::default();
        assert_eq!(cfg.cgroup_subtree, "warden");
        assert!(cfg.max_containers > 0);
        assert!(cfg.stop_timeout_ms > 0);
    }

    #[test]
    fn test_container_home() {
        let cfg = WardenConfig::default();
        assert_eq!(
            cfg.container_home("/a/b"),
            PathBuf::from("/var/lib/warden/a/b")
        );
        assert_eq!(cfg.container_home("a"), PathBuf::from("/var/lib/warden/a"));
    }

    #[test]
    fn test_stat_counters() {
        let stat = DaemonStat::default();
        DaemonStat::bump(&stat.created);
        DaemonStat::bump(&stat.created);
        assert_eq!(DaemonStat::get(&stat.created), 2);
        assert_eq!(DaemonStat::get(&stat.errors), 0);
    }
}
