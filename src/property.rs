//! Container Properties
//!
//! Configuration is a typed, validated key-value map driven by a static
//! descriptor table: one entry per property fixing its type, default,
//! flags, the states it may be written in, and a validator. Getters and
//! setters dispatch through the table, not through trait objects.
//!
//! ## Flags
//!
//! | Flag | Effect |
//! |------|--------|
//! | `HIDDEN` | not listed by `propertylist` |
//! | `PERSISTENT` | every set is written through to the kv store |
//! | `SUPERUSER` | only privileged callers may set |
//! | `PARENT_DEFAULT` | unset values read through to the nearest ancestor |
//! | `PARENT_RO` | locked on a child sharing its parent's namespaces |
//! | `OS_MODE_RESET` | reverts to default when `virt_mode=os` |
//! | `UNIT_SUFFIX` | uint accepts K/M/G/T |

use std::collections::HashMap;

use bitflags::bitflags;
use once_cell::sync::Lazy;

use crate::cgroup;
use crate::container::ContainerState;
use crate::cred;
use crate::error::{Error, ErrorKind};
use crate::kv::Record;
use crate::rlimit;
use crate::rootfs::BindMount;
use crate::value::{parse_env_list, Value, ValueType};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PropFlags: u32 {
        const HIDDEN = 1 << 0;
        const PERSISTENT = 1 << 1;
        const SUPERUSER = 1 << 2;
        const PARENT_DEFAULT = 1 << 3;
        const PARENT_RO = 1 << 4;
        const OS_MODE_RESET = 1 << 5;
        const UNIT_SUFFIX = 1 << 6;
    }
}

/// Set of container states encoded as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateMask(u8);

impl StateMask {
    pub const fn of(states: &[ContainerState]) -> StateMask {
        let mut bits = 0u8;
        let mut i = 0;
        while i < states.len() {
            bits |= 1 << states[i] as u8;
            i += 1;
        }
        StateMask(bits)
    }

    pub fn contains(self, state: ContainerState) -> bool {
        self.0 & (1 << state as u8) != 0
    }
}

/// Only while the container is stopped.
pub const STOPPED_ONLY: StateMask = StateMask::of(&[ContainerState::Stopped]);
/// Stopped plus live states: the property is dynamic.
pub const DYNAMIC: StateMask = StateMask::of(&[
    ContainerState::Stopped,
    ContainerState::Running,
    ContainerState::Paused,
    ContainerState::Meta,
    ContainerState::Dead,
]);

/// One row of the property table.
#[derive(Debug)]
pub struct PropDescriptor {
    pub name: &'static str,
    pub ty: ValueType,
    pub desc: &'static str,
    pub flags: PropFlags,
    pub writable_in: StateMask,
    pub default: fn() -> Value,
    pub validator: Option<fn(&Value) -> Result<(), Error>>,
}

impl PropDescriptor {
    pub fn has_flag(&self, flag: PropFlags) -> bool {
        self.flags.contains(flag)
    }
}

// ============================================================================
// Validators
// ============================================================================

fn valid_user(v: &Value) -> Result<(), Error> {
    let user = v.as_str().unwrap_or("");
    if cred::user_exists(user) {
        Ok(())
    } else {
        Err(Error::invalid_value(format!("invalid user {}", user)))
    }
}

fn valid_group(v: &Value) -> Result<(), Error> {
    let group = v.as_str().unwrap_or("");
    if cred::group_exists(group) {
        Ok(())
    } else {
        Err(Error::invalid_value(format!("invalid group {}", group)))
    }
}

fn valid_env(v: &Value) -> Result<(), Error> {
    for entry in v.as_list().unwrap_or(&[]) {
        if !entry.contains('=') {
            return Err(Error::invalid_value(format!(
                "invalid environment entry {}",
                entry
            )));
        }
    }
    Ok(())
}

fn valid_memory_guarantee(v: &Value) -> Result<(), Error> {
    if !cgroup::caps().low_limit {
        return Err(Error::not_supported("kernel lacks memory guarantees"));
    }
    let _ = v.as_uint();
    Ok(())
}

fn valid_memory_limit(v: &Value) -> Result<(), Error> {
    let limit = v.as_uint().unwrap_or(0);
    if limit != 0 && limit < cgroup::MEMORY_LIMIT_MIN {
        return Err(Error::invalid_value(format!(
            "memory limit below kernel minimum {}",
            cgroup::MEMORY_LIMIT_MIN
        )));
    }
    Ok(())
}

/// `rt` and `idle` are valid names but capability-gated: without the
/// scheduler knob the kernel cannot honour them, which is NotSupported,
/// never InvalidValue.
fn valid_cpu_policy(v: &Value) -> Result<(), Error> {
    match v.as_str().unwrap_or("") {
        "normal" => Ok(()),
        "rt" | "idle" => {
            if cgroup::caps().cpu_smart {
                Ok(())
            } else {
                Err(Error::not_supported("kernel lacks cpu.smart"))
            }
        }
        other => Err(Error::invalid_value(format!("invalid policy {}", other))),
    }
}

fn valid_cpu_value(v: &Value) -> Result<(), Error> {
    cgroup::parse_cpu_value(v.as_str().unwrap_or(""), cgroup::num_cpus()).map(|_| ())
}

fn valid_io_limit(v: &Value) -> Result<(), Error> {
    if !cgroup::caps().fs_limits {
        return Err(Error::not_supported("kernel lacks fs limits"));
    }
    let _ = v.as_uint();
    Ok(())
}

fn valid_recharge(v: &Value) -> Result<(), Error> {
    if !cgroup::caps().recharge {
        return Err(Error::not_supported("kernel lacks recharge_on_pgfault"));
    }
    let _ = v.as_bool();
    Ok(())
}

fn valid_net_priority(v: &Value) -> Result<(), Error> {
    match v.as_uint() {
        Some(p) if p <= 7 => Ok(()),
        _ => Err(Error::invalid_value("net priority must be 0-7")),
    }
}

fn valid_net_mode(v: &Value) -> Result<(), Error> {
    match v.as_str().unwrap_or("") {
        "inherited" | "host" | "none" => Ok(()),
        other => Err(Error::invalid_value(format!("invalid net mode {}", other))),
    }
}

fn valid_virt_mode(v: &Value) -> Result<(), Error> {
    match v.as_str().unwrap_or("") {
        "app" | "os" => Ok(()),
        other => Err(Error::invalid_value(format!(
            "invalid virt mode {}",
            other
        ))),
    }
}

fn valid_ulimit(v: &Value) -> Result<(), Error> {
    for entry in v.as_list().unwrap_or(&[]) {
        rlimit::parse_ulimit(entry)?;
    }
    Ok(())
}

fn valid_bind(v: &Value) -> Result<(), Error> {
    for entry in v.as_list().unwrap_or(&[]) {
        BindMount::parse(entry)?;
    }
    Ok(())
}

fn valid_capabilities(v: &Value) -> Result<(), Error> {
    cred::parse_cap_mask(v.as_list().unwrap_or(&[])).map(|_| ())
}

fn valid_root(v: &Value) -> Result<(), Error> {
    let path = v.as_str().unwrap_or("");
    if path.is_empty() || !path.starts_with('/') {
        return Err(Error::new(
            ErrorKind::InvalidPath,
            format!("root must be absolute: {}", path),
        ));
    }
    Ok(())
}

// ============================================================================
// Property Table
// ============================================================================

macro_rules! prop {
    ($name:literal, $ty:ident, $desc:literal, $flags:expr, $writable:expr,
     $default:expr, $validator:expr) => {
        PropDescriptor {
            name: $name,
            ty: ValueType::$ty,
            desc: $desc,
            flags: $flags,
            writable_in: $writable,
            default: $default,
            validator: $validator,
        }
    };
}

pub static PROPERTIES: Lazy<Vec<PropDescriptor>> = Lazy::new(|| {
    use PropFlags as F;
    vec![
        prop!("command", Str, "command executed upon container start",
              F::PERSISTENT, STOPPED_ONLY, || Value::Str(String::new()), None),
        prop!("user", Str, "start command with given user",
              F::PERSISTENT.union(F::SUPERUSER), STOPPED_ONLY,
              || Value::Str("nobody".into()), Some(valid_user)),
        prop!("group", Str, "start command with given group",
              F::PERSISTENT.union(F::SUPERUSER), STOPPED_ONLY,
              || Value::Str("nogroup".into()), Some(valid_group)),
        prop!("env", List, "container environment variables",
              F::PERSISTENT.union(F::OS_MODE_RESET), STOPPED_ONLY,
              || Value::List(Vec::new()), Some(valid_env)),
        prop!("root", Str, "container root directory",
              F::PERSISTENT.union(F::PARENT_RO), STOPPED_ONLY,
              || Value::Str("/".into()), Some(valid_root)),
        prop!("root_readonly", Bool, "remount root read-only",
              F::PERSISTENT, STOPPED_ONLY, || Value::Bool(false), None),
        prop!("cwd", Str, "container working directory",
              F::PERSISTENT.union(F::OS_MODE_RESET), STOPPED_ONLY,
              || Value::Str(String::new()), None),
        prop!("stdin_path", Str, "container stdin path",
              F::PERSISTENT, STOPPED_ONLY, || Value::Str("/dev/null".into()), None),
        prop!("stdout_path", Str, "container stdout path",
              F::PERSISTENT, STOPPED_ONLY, || Value::Str(String::new()), None),
        prop!("stderr_path", Str, "container stderr path",
              F::PERSISTENT, STOPPED_ONLY, || Value::Str(String::new()), None),
        prop!("stdout_limit", Uint, "bytes of stdout/stderr kept on disk",
              F::PERSISTENT.union(F::UNIT_SUFFIX), DYNAMIC,
              || Value::Uint(8 << 20), None),
        prop!("memory_guarantee", Uint, "guaranteed amount of memory",
              F::PERSISTENT.union(F::UNIT_SUFFIX).union(F::PARENT_DEFAULT), DYNAMIC,
              || Value::Uint(0), Some(valid_memory_guarantee)),
        prop!("memory_limit", Uint, "memory hard limit",
              F::PERSISTENT.union(F::UNIT_SUFFIX), DYNAMIC,
              || Value::Uint(0), Some(valid_memory_limit)),
        prop!("recharge_on_pgfault", Bool, "recharge pages to the fault origin",
              F::PERSISTENT, DYNAMIC, || Value::Bool(false), Some(valid_recharge)),
        prop!("cpu_policy", Str, "CPU policy: normal, rt, idle",
              F::PERSISTENT, STOPPED_ONLY,
              || Value::Str("normal".into()), Some(valid_cpu_policy)),
        prop!("cpu_limit", Str, "CPU limit: Nc cores or N%",
              F::PERSISTENT, DYNAMIC, || Value::Str("0".into()), Some(valid_cpu_value)),
        prop!("cpu_guarantee", Str, "guaranteed CPU share: Nc cores or N%",
              F::PERSISTENT, DYNAMIC, || Value::Str("0".into()), Some(valid_cpu_value)),
        prop!("io_limit", Uint, "filesystem bandwidth limit, bytes per second",
              F::PERSISTENT.union(F::UNIT_SUFFIX), DYNAMIC,
              || Value::Uint(0), Some(valid_io_limit)),
        prop!("io_ops_limit", Uint, "filesystem iops limit",
              F::PERSISTENT, DYNAMIC, || Value::Uint(0), Some(valid_io_limit)),
        prop!("net_guarantee", Uint, "guaranteed network bandwidth, bytes per second",
              F::PERSISTENT.union(F::UNIT_SUFFIX), DYNAMIC, || Value::Uint(0), None),
        prop!("net_limit", Uint, "network bandwidth limit, bytes per second",
              F::PERSISTENT.union(F::UNIT_SUFFIX), DYNAMIC, || Value::Uint(0), None),
        prop!("net_priority", Uint, "network priority: 0-7",
              F::PERSISTENT, DYNAMIC, || Value::Uint(3), Some(valid_net_priority)),
        prop!("net", Str, "network mode: inherited, host, none",
              F::PERSISTENT.union(F::PARENT_RO), STOPPED_ONLY,
              || Value::Str("inherited".into()), Some(valid_net_mode)),
        prop!("respawn", Bool, "restart the task when it exits",
              F::PERSISTENT, DYNAMIC, || Value::Bool(false), None),
        prop!("max_respawns", Int, "respawn at most this many times, -1 is unlimited",
              F::PERSISTENT, DYNAMIC, || Value::Int(-1), None),
        prop!("isolate", Bool, "use separate pid/mount/uts/ipc namespaces",
              F::PERSISTENT.union(F::PARENT_RO).union(F::PARENT_DEFAULT), STOPPED_ONLY,
              || Value::Bool(true), None),
        prop!("private", Str, "free-form user annotation",
              F::PERSISTENT, DYNAMIC, || Value::Str(String::new()), None),
        prop!("ulimit", List, "resource limits: name: soft hard; ...",
              F::PERSISTENT, STOPPED_ONLY, || Value::List(Vec::new()), Some(valid_ulimit)),
        prop!("hostname", Str, "hostname inside the container",
              F::PERSISTENT.union(F::PARENT_RO), STOPPED_ONLY,
              || Value::Str(String::new()), None),
        prop!("bind_dns", Bool, "bind resolv.conf and hosts into the root",
              F::PERSISTENT, STOPPED_ONLY, || Value::Bool(false), None),
        prop!("bind", List, "bind mounts: src dst [ro|rw]; ...",
              F::PERSISTENT.union(F::PARENT_RO), STOPPED_ONLY,
              || Value::List(Vec::new()), Some(valid_bind)),
        prop!("allowed_devices", List, "device whitelist rules",
              F::PERSISTENT.union(F::SUPERUSER), STOPPED_ONLY,
              || Value::List(vec!["a *:* rwm".to_string()]), None),
        prop!("capabilities", List, "capability bounding set",
              F::PERSISTENT.union(F::SUPERUSER), STOPPED_ONLY,
              || Value::List(Vec::new()), Some(valid_capabilities)),
        prop!("virt_mode", Str, "virtualization mode: app or os",
              F::PERSISTENT, STOPPED_ONLY,
              || Value::Str("app".into()), Some(valid_virt_mode)),
        prop!("aging_time", Uint, "seconds before a dead container is removed",
              F::PERSISTENT, DYNAMIC, || Value::Uint(60 * 60 * 24), None),
        prop!("namespace", Str, "name prefix the container's clients see",
              F::PERSISTENT.union(F::SUPERUSER), STOPPED_ONLY,
              || Value::Str(String::new()), None),
    ]
});

static BY_NAME: Lazy<HashMap<&'static str, &'static PropDescriptor>> =
    Lazy::new(|| PROPERTIES.iter().map(|d| (d.name, d)).collect());

/// Look up a descriptor; unknown keys are InvalidProperty.
pub fn descriptor(name: &str) -> Result<&'static PropDescriptor, Error> {
    BY_NAME.get(name).copied().ok_or_else(|| {
        Error::new(
            ErrorKind::InvalidProperty,
            format!("unknown property {}", name),
        )
    })
}

/// Non-hidden property names, table order.
pub fn list() -> Vec<(&'static str, &'static str)> {
    PROPERTIES
        .iter()
        .filter(|d| !d.has_flag(PropFlags::HIDDEN))
        .map(|d| (d.name, d.desc))
        .collect()
}

/// Legacy aliases accepted at the RPC boundary.
///
/// Returns the canonical property and whether the alias dialect writes
/// booleans as 0/1.
pub fn resolve_alias(name: &str) -> (&str, bool) {
    match name {
        "memory.limit_in_bytes" => ("memory_limit", false),
        "memory.low_limit_in_bytes" => ("memory_guarantee", false),
        "memory.recharge_on_pgfault" => ("recharge_on_pgfault", true),
        _ => (name, false),
    }
}

/// Translate an alias-dialect value into the canonical form.
pub fn alias_value(bool_dialect: bool, value: &str) -> &str {
    if bool_dialect {
        match value.trim() {
            "0" => "false",
            "1" => "true",
            other => other,
        }
    } else {
        value
    }
}

// ============================================================================
// Property Map
// ============================================================================

/// Per-container storage behind the descriptor table.
///
/// The map holds only explicitly set values; reads fall back to the
/// descriptor default. Parent inheritance and persistence are layered on
/// by the container, which owns the kv id and the hierarchy.
#[derive(Debug, Default)]
pub struct PropertyMap {
    values: HashMap<&'static str, Value>,
}

impl PropertyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_value(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Effective value: explicit or default. Unknown keys error.
    pub fn get(&self, name: &str) -> Result<Value, Error> {
        let desc = descriptor(name)?;
        Ok(self
            .values
            .get(desc.name)
            .cloned()
            .unwrap_or_else(desc.default))
    }

    /// Effective value as its canonical string.
    pub fn get_string(&self, name: &str) -> Result<String, Error> {
        Ok(self.get(name)?.format())
    }

    /// Parse, validate and store. Returns the parsed value so the caller
    /// can persist its canonical form.
    pub fn set_from_string(&mut self, name: &str, raw: &str) -> Result<Value, Error> {
        let desc = descriptor(name)?;
        let value = Value::parse(desc.ty, raw, desc.has_flag(PropFlags::UNIT_SUFFIX))?;

        if let Some(validator) = desc.validator {
            validator(&value)?;
        }

        // env entries get one more shot of structure checking
        if desc.name == "env" {
            parse_env_list(raw)?;
        }

        self.values.insert(desc.name, value.clone());
        Ok(value)
    }

    /// Store a pre-validated value.
    pub fn set(&mut self, name: &str, value: Value) -> Result<(), Error> {
        let desc = descriptor(name)?;
        if value.value_type() != desc.ty {
            return Err(Error::new(
                ErrorKind::Unknown,
                format!("type mismatch for {}", name),
            ));
        }
        self.values.insert(desc.name, value);
        Ok(())
    }

    pub fn is_default(&self, name: &str) -> bool {
        !self.values.contains_key(name)
    }

    pub fn reset(&mut self, name: &str) {
        self.values.remove(name);
    }

    /// Revert every OS_MODE_RESET property to its default.
    pub fn apply_os_mode_resets(&mut self) {
        for desc in PROPERTIES.iter() {
            if desc.has_flag(PropFlags::OS_MODE_RESET) {
                self.values.remove(desc.name);
            }
        }
    }

    /// All persistent explicit values, for a full kv save.
    pub fn persistent_pairs(&self) -> Vec<(String, String)> {
        PROPERTIES
            .iter()
            .filter(|d| d.has_flag(PropFlags::PERSISTENT))
            .filter_map(|d| {
                self.values
                    .get(d.name)
                    .map(|v| (d.name.to_string(), v.format()))
            })
            .collect()
    }

    /// Rebuild explicit values from a kv record. Unknown or unparsable
    /// keys are skipped, not fatal: the record may come from a newer or
    /// older daemon.
    pub fn restore(&mut self, record: &Record) -> Vec<String> {
        let mut skipped = Vec::new();
        for (key, raw) in record.pairs() {
            if key.starts_with('_') {
                continue; // runtime keys, restored by the container
            }
            let Ok(desc) = descriptor(key) else {
                skipped.push(key.clone());
                continue;
            };
            match Value::parse(desc.ty, raw, desc.has_flag(PropFlags::UNIT_SUFFIX)) {
                Ok(value) => {
                    self.values.insert(desc.name, value);
                }
                Err(_) => skipped.push(key.clone()),
            }
        }
        skipped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unsupported_caps() {
        cgroup::override_caps_for_tests(cgroup::CgroupCaps {
            low_limit: false,
            cpu_smart: false,
            cfs_reserve: false,
            fs_limits: false,
            recharge: false,
        });
    }

    #[test]
    fn test_descriptor_lookup() {
        assert!(descriptor("command").is_ok());
        let err = descriptor("no_such_property").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidProperty);
    }

    #[test]
    fn test_defaults() {
        let map = PropertyMap::new();
        assert_eq!(map.get("isolate").unwrap(), Value::Bool(true));
        assert_eq!(map.get("user").unwrap(), Value::Str("nobody".into()));
        assert_eq!(map.get("max_respawns").unwrap(), Value::Int(-1));
        assert!(map.is_default("command"));
    }

    #[test]
    fn test_set_get_round_trip() {
        let mut map = PropertyMap::new();
        map.set_from_string("command", "sleep 1000").unwrap();
        assert_eq!(map.get_string("command").unwrap(), "sleep 1000");

        map.set_from_string("memory_limit", "32M").unwrap();
        assert_eq!(map.get("memory_limit").unwrap(), Value::Uint(32 << 20));
        assert_eq!(map.get_string("memory_limit").unwrap(), (32u64 << 20).to_string());
    }

    #[test]
    fn test_validator_rejects() {
        let mut map = PropertyMap::new();
        let err = map.set_from_string("net_priority", "9").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        let err = map.set_from_string("virt_mode", "vm").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        let err = map.set_from_string("memory_limit", "1000").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_capability_gated_is_not_supported() {
        unsupported_caps();
        let mut map = PropertyMap::new();

        let err = map.set_from_string("cpu_policy", "rt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);

        // A plainly bad name is still InvalidValue, not NotSupported.
        let err = map.set_from_string("cpu_policy", "turbo").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        let err = map.set_from_string("memory_guarantee", "1G").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotSupported);
    }

    #[test]
    fn test_state_masks() {
        let cmd = descriptor("command").unwrap();
        assert!(cmd.writable_in.contains(ContainerState::Stopped));
        assert!(!cmd.writable_in.contains(ContainerState::Running));

        let lim = descriptor("memory_limit").unwrap();
        assert!(lim.writable_in.contains(ContainerState::Running));
    }

    #[test]
    fn test_os_mode_resets() {
        let mut map = PropertyMap::new();
        map.set_from_string("env", "A=1").unwrap();
        map.set_from_string("hostname", "box").unwrap();
        map.apply_os_mode_resets();
        assert!(map.is_default("env"));
        assert!(!map.is_default("hostname"));
    }

    #[test]
    fn test_persistent_pairs_and_restore() {
        let mut map = PropertyMap::new();
        map.set_from_string("command", "true").unwrap();
        map.set_from_string("respawn", "true").unwrap();

        let mut record = Record::new();
        for (k, v) in map.persistent_pairs() {
            record.push(k, v);
        }
        record.push("_id", "42");
        record.push("bogus_key", "x");

        let mut restored = PropertyMap::new();
        let skipped = restored.restore(&record);
        assert_eq!(restored.get_string("command").unwrap(), "true");
        assert_eq!(restored.get("respawn").unwrap(), Value::Bool(true));
        assert_eq!(skipped, vec!["bogus_key".to_string()]);
    }

    #[test]
    fn test_alias_resolution() {
        assert_eq!(resolve_alias("memory.limit_in_bytes"), ("memory_limit", false));
        assert_eq!(
            resolve_alias("memory.recharge_on_pgfault"),
            ("recharge_on_pgfault", true)
        );
        assert_eq!(resolve_alias("command"), ("command", false));

        assert_eq!(alias_value(true, "1"), "true");
        assert_eq!(alias_value(true, "0"), "false");
        assert_eq!(alias_value(false, "1"), "1");
    }

    #[test]
    fn test_list_hides_hidden() {
        let names: Vec<&str> = list().into_iter().map(|(n, _)| n).collect();
        assert!(names.contains(&"command"));
        assert!(names.contains(&"memory_limit"));
    }
}
