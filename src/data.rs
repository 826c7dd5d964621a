//! Runtime Data
//!
//! Read-only observations about a container, each gated on the states in
//! which it is meaningful: `exit_status` only exists for a dead
//! container, `root_pid` only for a live one. Like properties, data
//! entries are rows in a static table dispatching through plain function
//! pointers.

use std::path::PathBuf;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::cgroup::Controller;
use crate::config::DaemonStat;
use crate::container::{Container, ContainerState};
use crate::error::{Error, ErrorKind};
use crate::property::StateMask;
use crate::task;

const ANY: StateMask = StateMask::of(&[
    ContainerState::Stopped,
    ContainerState::Dead,
    ContainerState::Running,
    ContainerState::Paused,
    ContainerState::Meta,
]);
const DEAD: StateMask = StateMask::of(&[ContainerState::Dead]);
const RUNNING_DEAD: StateMask =
    StateMask::of(&[ContainerState::Running, ContainerState::Dead]);
const RUNNING_PAUSED: StateMask =
    StateMask::of(&[ContainerState::Running, ContainerState::Paused]);
const RUNNING_PAUSED_DEAD: StateMask = StateMask::of(&[
    ContainerState::Running,
    ContainerState::Paused,
    ContainerState::Dead,
]);
const LIVE: StateMask = StateMask::of(&[
    ContainerState::Running,
    ContainerState::Paused,
    ContainerState::Dead,
    ContainerState::Meta,
]);
const STOPPED: StateMask = StateMask::of(&[ContainerState::Stopped]);

/// One row of the data table.
#[derive(Debug)]
pub struct DataDescriptor {
    pub name: &'static str,
    pub desc: &'static str,
    pub readable_in: StateMask,
    pub hidden: bool,
    pub get: fn(&Arc<Container>) -> Result<String, Error>,
}

macro_rules! data {
    ($name:literal, $desc:literal, $states:expr, $get:expr) => {
        DataDescriptor {
            name: $name,
            desc: $desc,
            readable_in: $states,
            hidden: false,
            get: $get,
        }
    };
    (hidden $name:literal, $desc:literal, $states:expr, $get:expr) => {
        DataDescriptor {
            name: $name,
            desc: $desc,
            readable_in: $states,
            hidden: true,
            get: $get,
        }
    };
}

pub static DATA: Lazy<Vec<DataDescriptor>> = Lazy::new(|| {
    vec![
        data!("state", "container state", ANY, |c| Ok(c.state().to_string())),
        data!("parent", "container parent", ANY, |c| {
            Ok(c.parent().map(|p| p.name().to_string()).unwrap_or_default())
        }),
        data!("oom_killed", "whether the container was killed by OOM", DEAD, |c| {
            Ok(c.oom_killed().to_string())
        }),
        data!("respawn_count", "how many times the container was respawned",
              RUNNING_DEAD, |c| Ok(c.respawn_count().to_string())),
        data!("root_pid", "root process id", RUNNING_PAUSED, |c| {
            Ok(c.root_pid().unwrap_or(-1).to_string())
        }),
        data!("exit_status", "raw task exit status", DEAD, |c| {
            Ok(c.exit_status().unwrap_or(-1).to_string())
        }),
        data!("start_errno", "errno of the last failed start", STOPPED, |c| {
            Ok(c.start_errno().unwrap_or(-1).to_string())
        }),
        data!("stdout", "task stdout tail", RUNNING_PAUSED_DEAD, |c| {
            let limit = c.effective_uint("stdout_limit");
            task::read_tail(&stdio_path(c, "stdout_path")?, limit)
        }),
        data!("stderr", "task stderr tail", RUNNING_PAUSED_DEAD, |c| {
            let limit = c.effective_uint("stdout_limit");
            task::read_tail(&stdio_path(c, "stderr_path")?, limit)
        }),
        data!("cpu_usage", "consumed CPU time in nanoseconds", LIVE, |c| {
            let cg = c.cgroup(Controller::Cpuacct);
            Ok(cg.knob_u64("cpuacct.usage").map(|v| v.to_string()).unwrap_or_else(|_| "-1".into()))
        }),
        data!("memory_usage", "consumed memory in bytes", LIVE, |c| {
            let cg = c.cgroup(Controller::Memory);
            Ok(cg.knob_u64("memory.usage_in_bytes").map(|v| v.to_string()).unwrap_or_else(|_| "-1".into()))
        }),
        data!("minor_faults", "minor page faults of the memory cgroup", LIVE, |c| {
            Ok(memory_stat(c, "total_pgfault"))
        }),
        data!("major_faults", "major page faults of the memory cgroup", LIVE, |c| {
            Ok(memory_stat(c, "total_pgmajfault"))
        }),
        data!("uptime", "seconds since the container started", LIVE, |c| {
            Ok(c.uptime().map(|d| d.as_secs().to_string()).unwrap_or_else(|| "0".into()))
        }),
        data!("net_bytes", "transmitted bytes per link", LIVE, |c| {
            Ok(net_stat(c, |s| s.bytes))
        }),
        data!("net_packets", "transmitted packets per link", LIVE, |c| {
            Ok(net_stat(c, |s| s.packets as u64))
        }),
        data!("net_drops", "dropped packets per link", LIVE, |c| {
            Ok(net_stat(c, |s| s.drops as u64))
        }),
        data!("net_overlimits", "overlimit events per link", LIVE, |c| {
            Ok(net_stat(c, |s| s.overlimits as u64))
        }),
        data!(hidden "_stat", "daemon counters", ANY, |c| {
            let stat = &c.context().stat;
            Ok(format!(
                "spawned: {}; errors: {}; warns: {}; master_started: {}; \
                 slave_started: {}; queued_statuses: {}; created: {}; \
                 removed_dead: {}; restore_failed: {}",
                DaemonStat::get(&stat.spawned),
                DaemonStat::get(&stat.errors),
                DaemonStat::get(&stat.warns),
                DaemonStat::get(&stat.master_started),
                DaemonStat::get(&stat.slave_started),
                DaemonStat::get(&stat.queued_statuses),
                DaemonStat::get(&stat.created),
                DaemonStat::get(&stat.removed_dead),
                DaemonStat::get(&stat.restore_failed),
            ))
        }),
    ]
});

/// Look up a descriptor; unknown keys are InvalidData.
pub fn descriptor(name: &str) -> Result<&'static DataDescriptor, Error> {
    DATA.iter().find(|d| d.name == name).ok_or_else(|| {
        Error::new(ErrorKind::InvalidData, format!("unknown data {}", name))
    })
}

/// Non-hidden data names with descriptions.
pub fn list() -> Vec<(&'static str, &'static str)> {
    DATA.iter()
        .filter(|d| !d.hidden)
        .map(|d| (d.name, d.desc))
        .collect()
}

/// State-gated data read.
pub fn get(container: &Arc<Container>, name: &str) -> Result<String, Error> {
    let desc = descriptor(name)?;
    let state = container.state();
    if !desc.readable_in.contains(state) {
        return Err(Error::invalid_state(format!(
            "{} is not available while {}",
            name, state
        )));
    }
    (desc.get)(container)
}

fn stdio_path(container: &Arc<Container>, prop: &str) -> Result<PathBuf, Error> {
    let explicit = container.get_property(prop)?;
    if !explicit.is_empty() {
        return Ok(PathBuf::from(explicit));
    }

    let cwd = container.get_property("cwd")?;
    let cwd = if cwd.is_empty() {
        container
            .context()
            .config
            .container_home(container.name())
    } else {
        PathBuf::from(cwd)
    };
    Ok(cwd.join(prop.trim_end_matches("_path")))
}

fn memory_stat(container: &Arc<Container>, field: &str) -> String {
    let cg = container.cgroup(Controller::Memory);
    let Ok(raw) = cg.knob("memory.stat") else {
        return "-1".into();
    };
    for line in raw.lines() {
        if let Some(value) = line.strip_prefix(field) {
            return value.trim().to_string();
        }
    }
    "-1".into()
}

fn net_stat(
    container: &Arc<Container>,
    pick: fn(&crate::netlink::ClassStats) -> u64,
) -> String {
    let stats = container.context().netclass.stats(container.id());
    let mut entries: Vec<String> = stats
        .iter()
        .map(|(link, s)| format!("{}: {}", link, pick(s)))
        .collect();
    entries.sort();
    entries.join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_lookup() {
        assert!(descriptor("state").is_ok());
        assert!(descriptor("uptime").is_ok());
        let err = descriptor("bogus").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidData);
    }

    #[test]
    fn test_state_gating_masks() {
        let exit = descriptor("exit_status").unwrap();
        assert!(exit.readable_in.contains(ContainerState::Dead));
        assert!(!exit.readable_in.contains(ContainerState::Running));

        let pid = descriptor("root_pid").unwrap();
        assert!(pid.readable_in.contains(ContainerState::Running));
        assert!(!pid.readable_in.contains(ContainerState::Dead));

        let errno = descriptor("start_errno").unwrap();
        assert!(errno.readable_in.contains(ContainerState::Stopped));
        assert!(!errno.readable_in.contains(ContainerState::Meta));
    }

    #[test]
    fn test_uptime_is_not_minor_faults() {
        // The uptime datum reports uptime; fault counters live with the
        // memory statistics.
        let uptime = descriptor("uptime").unwrap();
        assert!(uptime.desc.contains("seconds"));
        assert!(descriptor("minor_faults").is_ok());
    }

    #[test]
    fn test_list_hides_hidden() {
        let names: Vec<&str> = list().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"state"));
        assert!(!names.contains(&"_stat"));
    }
}
