//! # ALICE-Warden
//!
//! **Hierarchical Container Runtime Daemon with Direct Kernel Control**
//!
//! A privileged daemon managing a tree of containers: supervised
//! processes placed into cgroups and namespaces with resource limits,
//! network classes, persistent state and crash recovery. Unprivileged
//! clients drive it over a local socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        ALICE-Warden                          │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                              │
//! │   clients ──RPC──►  Router ──► Holder (registry, hierarchy)  │
//! │                                   │                          │
//! │                  ┌────────────────┼──────────────┐           │
//! │                  ▼                ▼              ▼           │
//! │             Container        PropertyMap     WaiterSet       │
//! │             state-machine    (typed kv)      (notify)        │
//! │                  │                                           │
//! │                  ▼                                           │
//! │       ┌───── Composer ─────┬───────────┬──────────┐          │
//! │       ▼                    ▼           ▼          ▼          │
//! │   CgroupMgr          NamespaceMgr  NetClassMgr  Rlimits      │
//! │       │                                                      │
//! │       ▼                                                      │
//! │   Supervised task  ◄── exit events ── Reaper (outer process) │
//! │       │                                                      │
//! │       ▼                                                      │
//! │   KvStore (tmpfs persistence)                                │
//! │                                                              │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Process Model
//!
//! | Process | Role |
//! |---------|------|
//! | `wardend` (master) | subreaper, sole `wait` caller, slave babysitter |
//! | `wardend --slave` | control plane: RPC, state machine, persistence |
//! | container tasks | forked by the slave, reaped by the master |
//!
//! The master buffers every exit until the slave acknowledges it after
//! persisting, so a slave crash never loses an exit and a restarted
//! slave recovers the full tree from the kv store plus kernel state.
//!
//! ## Requirements
//!
//! - Linux with the split cgroup v1 hierarchies under `/sys/fs/cgroup`
//! - Root privileges (CAP_SYS_ADMIN and friends)

pub mod cgroup;
pub mod client;
pub mod config;
pub mod container;
pub mod cred;
pub mod daemon;
pub mod data;
pub mod error;
pub mod events;
pub mod holder;
pub mod idmap;
pub mod kv;
pub mod namespace;
pub mod netclass;
pub mod netlink;
pub mod property;
pub mod reaper;
pub mod rlimit;
pub mod rootfs;
pub mod rpc;
pub mod task;
pub mod value;
pub mod waiter;

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::client::WardenClient;
    pub use crate::config::{WardenConfig, WardenContext};
    pub use crate::container::{Container, ContainerState};
    pub use crate::error::{Error, ErrorKind};
    pub use crate::holder::Holder;
    pub use crate::kv::{KvStore, Record};
    pub use crate::property::{PropFlags, PropertyMap};
    pub use crate::rpc::{Request, Response};
    pub use crate::value::{Value, ValueType};
}

/// Result type for runtime operations
pub type Result<T> = core::result::Result<T, error::Error>;

// ============================================================================
// Constants
// ============================================================================

/// Name of the root container
pub const ROOT_CONTAINER: &str = container::ROOT_NAME;

/// Runtime-owned subtree name inside every cgroup controller
pub const WARDEN_CGROUP: &str = "warden";

/// Default RPC socket path
pub const DEFAULT_SOCKET: &str = "/run/warden.socket";

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constants() {
        assert_eq!(ROOT_CONTAINER, "/");
        assert_eq!(WARDEN_CGROUP, "warden");
        assert!(DEFAULT_SOCKET.starts_with("/run/"));
    }

    #[test]
    fn test_default_config_matches_constants() {
        let config = config::WardenConfig::default();
        assert_eq!(config.cgroup_subtree, WARDEN_CGROUP);
        assert_eq!(config.socket_path.to_str().unwrap(), DEFAULT_SOCKET);
    }
}
