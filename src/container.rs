//! Container State Machine
//!
//! A container is a named node in the hierarchy owning its property map,
//! its cgroups, its network class and, when started, a supervised task.
//!
//! ## Lifecycle
//!
//! ```text
//!            create              start
//!  (none) ─────────► Stopped ─────────► Running ──► Dead ─► Stopped
//!                      ▲  ▲               │  ▲        │
//!                stop  │  └─── resume ────│──┘        │ aging / respawn
//!                      │       pause      ▼           │
//!                      │                Paused ───────┘
//!                      └──── children running ──► Meta
//! ```
//!
//! | Op | Valid from |
//! |---------|-----------------------------|
//! | `start` | Stopped |
//! | `stop` | Running, Dead, Meta, Paused |
//! | `pause` | Running, Meta |
//! | `resume`| Paused |
//! | `kill` | Running |
//!
//! Mutating operations are serialised by the holder; the per-container
//! mutex below protects against concurrent readers (data getters, waiter
//! sweeps) and is always taken parent before child.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use caps::CapsHashSet;
use log::{info, warn};
use nix::sys::signal::Signal;

use crate::cgroup::{self, Cgroup, Controller, OomMonitor};
use crate::config::{DaemonStat, WardenContext};
use crate::cred::{self, Cred};
use crate::error::{Error, ErrorKind};
use crate::events::Event;
use crate::kv::Record;
use crate::namespace::{NsFlags, NsSet};
use crate::netclass::{NetClassCfg, NetClassMgr};
use crate::property::{self, PropFlags, PropertyMap};
use crate::rlimit::Rlimit;
use crate::rootfs::{BindMount, RootFs};
use crate::task::{self, Task, TaskEnv};
use crate::value::parse_env_list;
use crate::waiter::{Waiter, WaiterSet};

/// The root container's name.
pub const ROOT_NAME: &str = "/";
/// The root container's fixed id.
pub const ROOT_ID: u16 = 1;

pub const MAX_NAME_SEGMENT: usize = 128;
pub const MAX_NAME_PATH: usize = 200;

// Runtime keys in the kv record, alongside persistent properties.
const K_NAME: &str = "_name";
const K_STATE: &str = "_state";
const K_ROOT_PID: &str = "_root_pid";
const K_EXIT_STATUS: &str = "_exit_status";
const K_OOM_KILLED: &str = "_oom_killed";
const K_RESPAWN_COUNT: &str = "_respawn_count";
const K_OWNER_UID: &str = "_owner_uid";
const K_OWNER_GID: &str = "_owner_gid";
const K_START_TIME: &str = "_start_time";

// ============================================================================
// State
// ============================================================================

/// Container states. The discriminants feed property `StateMask`s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ContainerState {
    Stopped = 0,
    Dead = 1,
    Running = 2,
    Paused = 3,
    Meta = 4,
    Unknown = 5,
}

impl ContainerState {
    pub fn name(self) -> &'static str {
        match self {
            ContainerState::Stopped => "stopped",
            ContainerState::Dead => "dead",
            ContainerState::Running => "running",
            ContainerState::Paused => "paused",
            ContainerState::Meta => "meta",
            ContainerState::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> ContainerState {
        match s {
            "stopped" => ContainerState::Stopped,
            "dead" => ContainerState::Dead,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "meta" => ContainerState::Meta,
            _ => ContainerState::Unknown,
        }
    }
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Names
// ============================================================================

fn valid_segment_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '@' | ':' | '.')
}

/// Normalize a client-supplied name to absolute form (`a/b` → `/a/b`)
/// and validate it.
pub fn normalize_name(raw: &str) -> Result<String, Error> {
    if raw == ROOT_NAME {
        return Ok(ROOT_NAME.to_string());
    }

    let relative = raw.strip_prefix('/').unwrap_or(raw);
    if relative.is_empty() {
        return Err(Error::invalid_value("empty container name"));
    }
    if relative.len() > MAX_NAME_PATH {
        return Err(Error::invalid_value(format!(
            "container path longer than {} characters",
            MAX_NAME_PATH
        )));
    }

    for segment in relative.split('/') {
        if segment.is_empty() {
            return Err(Error::invalid_value("empty name segment"));
        }
        if segment.len() > MAX_NAME_SEGMENT {
            return Err(Error::invalid_value(format!(
                "name segment longer than {} characters",
                MAX_NAME_SEGMENT
            )));
        }
        if !segment.chars().all(valid_segment_char) {
            return Err(Error::invalid_value(format!(
                "invalid character in name segment {}",
                segment
            )));
        }
    }

    Ok(format!("/{}", relative))
}

/// Parent of an absolute name; `/a` → `/`, `/` → None.
pub fn parent_of(name: &str) -> Option<String> {
    if name == ROOT_NAME {
        return None;
    }
    match name.rfind('/') {
        Some(0) => Some(ROOT_NAME.to_string()),
        Some(pos) => Some(name[..pos].to_string()),
        None => None,
    }
}

/// Last segment of an absolute name.
pub fn base_name(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

// ============================================================================
// Container
// ============================================================================

struct Inner {
    state: ContainerState,
    owner: Cred,
    props: PropertyMap,
    children: Vec<Weak<Container>>,
    waiters: WaiterSet,
    task: Option<Task>,
    oom_monitor: Option<OomMonitor>,
    start_errno: Option<i32>,
    exit_status: Option<i32>,
    oom_killed: bool,
    respawn_count: u64,
    lost_restored: bool,
    start_time: Option<Instant>,
    death_time: Option<Instant>,
}

pub struct Container {
    name: String,
    id: u16,
    parent: Weak<Container>,
    ctx: Arc<WardenContext>,
    inner: Mutex<Inner>,
}

impl Container {
    pub fn new(
        ctx: Arc<WardenContext>,
        name: String,
        id: u16,
        parent: Option<&Arc<Container>>,
        owner: Cred,
    ) -> Arc<Container> {
        let container = Arc::new(Container {
            name,
            id,
            parent: parent.map(Arc::downgrade).unwrap_or_default(),
            ctx,
            inner: Mutex::new(Inner {
                state: ContainerState::Stopped,
                owner,
                props: PropertyMap::new(),
                children: Vec::new(),
                waiters: WaiterSet::new(),
                task: None,
                oom_monitor: None,
                start_errno: None,
                exit_status: None,
                oom_killed: false,
                respawn_count: 0,
                lost_restored: false,
                start_time: None,
                death_time: None,
            }),
        });

        if let Some(parent) = parent {
            parent
                .inner
                .lock()
                .unwrap()
                .children
                .push(Arc::downgrade(&container));
        }
        container
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn is_root(&self) -> bool {
        self.name == ROOT_NAME
    }

    pub fn parent(&self) -> Option<Arc<Container>> {
        self.parent.upgrade()
    }

    pub fn state(&self) -> ContainerState {
        self.inner.lock().unwrap().state
    }

    pub fn owner(&self) -> Cred {
        self.inner.lock().unwrap().owner.clone()
    }

    /// Children in creation order, pruning dead weak refs.
    pub fn children(&self) -> Vec<Arc<Container>> {
        let mut inner = self.inner.lock().unwrap();
        inner.children.retain(|w| w.upgrade().is_some());
        inner.children.iter().filter_map(|w| w.upgrade()).collect()
    }

    pub fn remove_child(&self, child: &Arc<Container>) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .children
            .retain(|w| w.upgrade().is_some_and(|c| !Arc::ptr_eq(&c, child)));
    }

    pub fn check_permission(&self, cred: &Cred) -> Result<(), Error> {
        let owner = self.owner();
        if cred.can_control(&owner) {
            Ok(())
        } else {
            Err(Error::permission(format!(
                "uid {} may not control {}",
                cred.uid, self.name
            )))
        }
    }

    // ------------------------------------------------------------------
    // Runtime accessors used by the data table
    // ------------------------------------------------------------------

    pub fn root_pid(&self) -> Option<i32> {
        self.inner.lock().unwrap().task.as_ref().map(|t| t.pid())
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.inner.lock().unwrap().exit_status
    }

    pub fn start_errno(&self) -> Option<i32> {
        self.inner.lock().unwrap().start_errno
    }

    pub fn oom_killed(&self) -> bool {
        self.inner.lock().unwrap().oom_killed
    }

    pub fn respawn_count(&self) -> u64 {
        self.inner.lock().unwrap().respawn_count
    }

    pub fn is_lost_restored(&self) -> bool {
        self.inner.lock().unwrap().lost_restored
    }

    pub fn uptime(&self) -> Option<Duration> {
        self.inner.lock().unwrap().start_time.map(|t| t.elapsed())
    }

    pub fn context(&self) -> &Arc<WardenContext> {
        &self.ctx
    }

    pub fn cgroup(&self, controller: Controller) -> Cgroup {
        self.ctx.cgroups.container_cgroup(controller, &self.name)
    }

    // ------------------------------------------------------------------
    // Properties
    // ------------------------------------------------------------------

    /// Effective string value with ParentDefault fall-through.
    pub fn get_property(&self, prop_name: &str) -> Result<String, Error> {
        let desc = property::descriptor(prop_name)?;

        if desc.has_flag(PropFlags::PARENT_DEFAULT) {
            let mut node = self.parent();
            let is_default = self.inner.lock().unwrap().props.is_default(prop_name);
            if is_default {
                while let Some(current) = node {
                    let inner = current.inner.lock().unwrap();
                    if !inner.props.is_default(prop_name) {
                        return inner.props.get_string(prop_name);
                    }
                    drop(inner);
                    node = current.parent();
                }
            }
        }

        self.inner.lock().unwrap().props.get_string(prop_name)
    }

    /// Effective uint value with ParentDefault fall-through.
    pub fn effective_uint(&self, prop_name: &str) -> u64 {
        self.get_property(prop_name)
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }

    /// Validated, state-gated, flag-checked property write.
    pub fn set_property(
        self: &Arc<Self>,
        prop_name: &str,
        raw: &str,
        cred: &Cred,
    ) -> Result<(), Error> {
        if self.is_root() {
            return Err(Error::invalid_state("cannot set properties on /"));
        }
        self.check_permission(cred)?;

        let desc = property::descriptor(prop_name)?;
        if desc.has_flag(PropFlags::SUPERUSER) && !cred.is_privileged() {
            return Err(Error::permission(format!(
                "{} requires privileged caller",
                prop_name
            )));
        }

        let state = self.state();
        if !desc.writable_in.contains(state) {
            return Err(Error::invalid_state(format!(
                "{} is not writable while {}",
                prop_name, state
            )));
        }

        // A child sharing its parent's namespaces cannot change the
        // properties that describe the shared set.
        if desc.has_flag(PropFlags::PARENT_RO) && self.shares_parent_namespace() {
            if let Some(parent) = self.parent() {
                if parent.state() == ContainerState::Running
                    || parent.state() == ContainerState::Meta
                {
                    return Err(Error::invalid_state(format!(
                        "{} is locked while sharing namespaces with {}",
                        prop_name,
                        parent.name()
                    )));
                }
            }
        }

        self.validate_hierarchy(prop_name, raw)?;

        // Parse and validate without committing yet.
        let value = crate::value::Value::parse(
            desc.ty,
            raw,
            desc.has_flag(PropFlags::UNIT_SUFFIX),
        )?;
        if let Some(validator) = desc.validator {
            validator(&value)?;
        }

        // Persist first: if the daemon dies here, recovery must surface
        // the value the client was told about, never a half-applied one.
        if desc.has_flag(PropFlags::PERSISTENT) {
            self.ctx.kv.append(self.id, prop_name, &value.format())?;
        }

        {
            let mut inner = self.inner.lock().unwrap();
            inner.props.set_from_string(prop_name, raw)?;
        }

        if state == ContainerState::Running || state == ContainerState::Meta {
            self.apply_dynamic_property(prop_name)?;
        }

        Ok(())
    }

    /// `isolate` reads through to the parent, so an unset child under an
    /// `isolate=false` parent shares namespaces too.
    fn shares_parent_namespace(&self) -> bool {
        self.get_property("isolate")
            .map(|v| v == "false")
            .unwrap_or(false)
    }

    /// Child limits must not exceed the parent's; sibling guarantees must
    /// fit inside the parent's guarantee; the system guarantee budget is
    /// physical memory minus the configured reserve.
    fn validate_hierarchy(&self, prop_name: &str, raw: &str) -> Result<(), Error> {
        let limit_props = ["memory_limit", "io_limit", "io_ops_limit", "net_limit"];
        if limit_props.contains(&prop_name) {
            let value: u64 = crate::value::parse_unit_uint(raw).unwrap_or(0);
            if let Some(parent) = self.parent() {
                if !parent.is_root() {
                    let parent_limit = parent.effective_uint(prop_name);
                    if parent_limit != 0 && (value == 0 || value > parent_limit) {
                        return Err(Error::invalid_value(format!(
                            "{} {} exceeds parent limit {}",
                            prop_name, raw, parent_limit
                        )));
                    }
                }
            }
        }

        if prop_name == "memory_guarantee" {
            let value: u64 = crate::value::parse_unit_uint(raw).unwrap_or(0);
            let siblings_sum: u64 = match self.parent() {
                Some(parent) => parent
                    .children()
                    .iter()
                    .filter(|c| c.name() != self.name)
                    .map(|c| c.effective_uint("memory_guarantee"))
                    .sum(),
                None => 0,
            };

            if let Some(parent) = self.parent() {
                if !parent.is_root() {
                    let parent_guarantee = parent.effective_uint("memory_guarantee");
                    if parent_guarantee != 0 && siblings_sum + value > parent_guarantee {
                        return Err(Error::new(
                            ErrorKind::ResourceNotAvailable,
                            "sibling guarantees exceed parent guarantee",
                        ));
                    }
                } else {
                    let budget = physical_memory()
                        .saturating_sub(self.ctx.config.guarantee_reserve);
                    if siblings_sum + value > budget {
                        return Err(Error::new(
                            ErrorKind::ResourceNotAvailable,
                            format!("memory guarantee budget {} exceeded", budget),
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    /// Re-apply a single property to live resources.
    fn apply_dynamic_property(self: &Arc<Self>, prop_name: &str) -> Result<(), Error> {
        match prop_name {
            "memory_limit" | "memory_guarantee" | "recharge_on_pgfault" | "io_limit"
            | "io_ops_limit" => {
                let memory = self.cgroup(Controller::Memory);
                if memory.exists() {
                    self.apply_memory_knobs(&memory)?;
                }
            }
            "cpu_limit" | "cpu_guarantee" => {
                let cpu = self.cgroup(Controller::Cpu);
                if cpu.exists() {
                    self.apply_cpu_knobs(&cpu)?;
                }
            }
            "net_guarantee" | "net_limit" | "net_priority" => {
                self.apply_net_class()?;
            }
            _ => {}
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Start
    // ------------------------------------------------------------------

    pub fn start(self: &Arc<Self>) -> Result<(), Error> {
        if self.is_root() {
            return Err(Error::invalid_state("/ cannot be started"));
        }

        // Parents go first. A stopped parent is started implicitly when
        // it is a meta parent (no command) or when this child shares its
        // namespaces and cannot exist without it.
        if let Some(parent) = self.parent() {
            match parent.state() {
                ContainerState::Running | ContainerState::Meta => {}
                ContainerState::Stopped => {
                    let parent_is_meta = parent.get_property("command")?.is_empty();
                    if parent_is_meta || self.shares_parent_namespace() {
                        parent.start()?;
                    } else {
                        return Err(Error::invalid_state(format!(
                            "parent {} is not running",
                            parent.name()
                        )));
                    }
                }
                other => {
                    return Err(Error::invalid_state(format!(
                        "parent {} is {}",
                        parent.name(),
                        other
                    )));
                }
            }
        }

        if self.state() != ContainerState::Stopped {
            return Err(Error::invalid_state(format!(
                "cannot start while {}",
                self.state()
            )));
        }

        {
            let mut inner = self.inner.lock().unwrap();
            if inner.props.get_string("virt_mode")? == "os" {
                inner.props.apply_os_mode_resets();
            }
        }

        // Inherited reads walk the parent chain, so resolve them before
        // the property snapshot takes our own lock.
        let isolate = !self.shares_parent_namespace();

        let plan = self.build_plan(isolate)?;
        self.check_start_budget(&plan)?;

        match self.compose_and_run(&plan) {
            Ok(()) => {
                DaemonStat::bump(&self.ctx.stat.spawned);
                info!("started {} as {}", self.name, if plan.is_meta { "meta" } else { "task" });
                Ok(())
            }
            Err(e) => {
                warn!("start {} failed: {}", self.name, e);
                self.free_resources();
                let mut inner = self.inner.lock().unwrap();
                inner.start_errno = e.errno;
                Err(e)
            }
        }
    }

    /// Hierarchy-wide guarantee check at start time (invariant 4).
    fn check_start_budget(&self, plan: &StartPlan) -> Result<(), Error> {
        if plan.memory_guarantee == 0 {
            return Ok(());
        }
        let budget = physical_memory().saturating_sub(self.ctx.config.guarantee_reserve);
        let mut total = plan.memory_guarantee;
        if let Some(parent) = self.parent() {
            let root = {
                let mut node = parent;
                while let Some(up) = node.parent() {
                    node = up;
                }
                node
            };
            total += sum_guarantees(&root, &self.name);
        }
        if total > budget {
            return Err(Error::new(
                ErrorKind::ResourceNotAvailable,
                format!("memory guarantee budget {} exceeded", budget),
            ));
        }
        Ok(())
    }

    fn compose_and_run(self: &Arc<Self>, plan: &StartPlan) -> Result<(), Error> {
        let cgroups = self.prepare_cgroups(plan)?;
        self.apply_net_class()?;

        // Assembled before taking our own lock: the namespace lookup
        // reads ancestors, and ancestor locks always come first.
        let task_env = if plan.is_meta {
            None
        } else {
            Some(self.build_task_env(plan, &cgroups)?)
        };

        let mut inner = self.inner.lock().unwrap();
        inner.exit_status = None;
        inner.oom_killed = false;
        inner.start_errno = None;
        inner.death_time = None;

        let Some(task_env) = task_env else {
            inner.state = ContainerState::Meta;
            inner.start_time = Some(Instant::now());
            drop(inner);
            self.persist_runtime(&[(K_STATE, "meta".to_string())]);
            return Ok(());
        };

        let task = Task::start(task_env)?;
        let pid = task.pid();
        inner.task = Some(task);
        inner.state = ContainerState::Running;
        inner.start_time = Some(Instant::now());

        // The OOM eventfd outlives this scope inside inner; the event
        // loop watches its raw fd until stop unregisters it.
        let memory = self.cgroup(Controller::Memory);
        if memory.exists() {
            match OomMonitor::install(&memory) {
                Ok(monitor) => {
                    self.ctx.events.register_oom(self.name.clone(), monitor.fd());
                    inner.oom_monitor = Some(monitor);
                }
                Err(e) => warn!("oom monitor for {}: {}", self.name, e),
            }
        }
        drop(inner);

        self.persist_runtime(&[
            (K_STATE, "running".to_string()),
            (K_ROOT_PID, pid.to_string()),
            (K_START_TIME, unix_now().to_string()),
        ]);
        Ok(())
    }

    fn prepare_cgroups(&self, plan: &StartPlan) -> Result<HashMap<Controller, Cgroup>, Error> {
        let mut cgroups = HashMap::new();
        for controller in Controller::ALL {
            if !self.ctx.cgroups.supported(controller) {
                continue;
            }
            let cgroup = self.ctx.cgroups.create(controller, &self.name)?;
            cgroups.insert(controller, cgroup);
        }

        if let Some(memory) = cgroups.get(&Controller::Memory) {
            if memory.has_knob("memory.use_hierarchy") {
                // Must be set before any task joins.
                let _ = memory.set_knob("memory.use_hierarchy", "1");
            }
            self.apply_memory_knobs(memory)?;
        }
        if let Some(cpu) = cgroups.get(&Controller::Cpu) {
            self.apply_cpu_knobs(cpu)?;
        }
        if let Some(devices) = cgroups.get(&Controller::Devices) {
            self.apply_device_rules(devices, plan)?;
        }
        if let Some(net_cls) = cgroups.get(&Controller::NetCls) {
            net_cls.set_knob("net_cls.classid", &NetClassMgr::classid(self.id).to_string())?;
        }

        Ok(cgroups)
    }

    fn apply_memory_knobs(&self, memory: &Cgroup) -> Result<(), Error> {
        let limit = self.effective_uint("memory_limit");
        if limit != 0 {
            memory.set_knob(
                "memory.limit_in_bytes",
                &(limit + cgroup::MEMORY_LIMIT_MARGIN).to_string(),
            )?;
        }

        let guarantee = self.effective_uint("memory_guarantee");
        if guarantee != 0 && memory.has_knob("memory.low_limit_in_bytes") {
            memory.set_knob("memory.low_limit_in_bytes", &guarantee.to_string())?;
        }

        if memory.has_knob("memory.recharge_on_pgfault") {
            let recharge = self.get_property("recharge_on_pgfault")? == "true";
            memory.set_knob(
                "memory.recharge_on_pgfault",
                if recharge { "1" } else { "0" },
            )?;
        }

        if cgroup::caps().fs_limits {
            let io_limit = self.effective_uint("io_limit");
            if io_limit != 0 {
                memory.set_knob("memory.fs_bps_limit", &io_limit.to_string())?;
            }
            let io_ops = self.effective_uint("io_ops_limit");
            if io_ops != 0 {
                memory.set_knob("memory.fs_iops_limit", &io_ops.to_string())?;
            }
        }

        Ok(())
    }

    fn apply_cpu_knobs(&self, cpu: &Cgroup) -> Result<(), Error> {
        let ncpus = cgroup::num_cpus();
        let policy = self.get_property("cpu_policy")?;

        if policy != "normal" && cpu.has_knob("cpu.smart") {
            cpu.set_knob("cpu.smart", if policy == "rt" { "1" } else { "0" })?;
        }

        let limit = cgroup::parse_cpu_value(&self.get_property("cpu_limit")?, ncpus)?;
        if cpu.has_knob("cpu.cfs_quota_us") {
            cpu.set_knob("cpu.cfs_period_us", "100000")?;
            cpu.set_knob("cpu.cfs_quota_us", &cgroup::cpu_quota_us(limit).to_string())?;
        }

        let guarantee = cgroup::parse_cpu_value(&self.get_property("cpu_guarantee")?, ncpus)?;
        if cpu.has_knob("cpu.cfs_reserve_us") {
            cpu.set_knob("cpu.cfs_reserve_us", &(guarantee * 100).to_string())?;
        } else if cpu.has_knob("cpu.shares") {
            // 1024 shares per guaranteed core, floor at the default.
            let shares = (guarantee * 1024 / 1000).max(1024);
            cpu.set_knob("cpu.shares", &shares.to_string())?;
        }

        Ok(())
    }

    fn apply_device_rules(&self, devices: &Cgroup, plan: &StartPlan) -> Result<(), Error> {
        if plan.device_rules.is_empty() {
            return Ok(());
        }
        devices.set_knob("devices.deny", "a")?;
        for rule in &plan.device_rules {
            devices.set_knob("devices.allow", rule)?;
        }
        Ok(())
    }

    fn apply_net_class(self: &Arc<Self>) -> Result<(), Error> {
        let cfg = NetClassCfg {
            guarantee_bps: self.effective_uint("net_guarantee"),
            limit_bps: self.effective_uint("net_limit"),
            priority: self.effective_uint("net_priority") as u32,
        };
        self.ctx.netclass.apply(self.id, cfg)
    }

    fn build_plan(&self, isolate: bool) -> Result<StartPlan, Error> {
        let inner = self.inner.lock().unwrap();
        let props = &inner.props;

        let command = props.get_string("command")?;
        let virt_os = props.get_string("virt_mode")? == "os";

        let argv = if virt_os && command.is_empty() {
            vec!["/sbin/init".to_string()]
        } else {
            task::split_command(&command)?
        };

        let user = props.get_string("user")?;
        let group = props.get_string("group")?;
        let cred = Cred::from_user(&user)?.with_group(&group)?;

        let root = props.get_string("root")?;
        let cwd_prop = props.get_string("cwd")?;
        let cwd = if !cwd_prop.is_empty() {
            PathBuf::from(cwd_prop)
        } else if virt_os || root != "/" {
            PathBuf::from("/")
        } else {
            self.ctx.config.container_home(&self.name)
        };

        let stdin_path = PathBuf::from(props.get_string("stdin_path")?);
        let stdout_prop = props.get_string("stdout_path")?;
        let stderr_prop = props.get_string("stderr_path")?;
        let stdout_path = if stdout_prop.is_empty() {
            cwd.join("stdout")
        } else {
            PathBuf::from(stdout_prop)
        };
        let stderr_path = if stderr_prop.is_empty() {
            cwd.join("stderr")
        } else {
            PathBuf::from(stderr_prop)
        };

        let hostname_prop = props.get_string("hostname")?;
        let hostname = if hostname_prop.is_empty() {
            None
        } else {
            Some(hostname_prop)
        };

        let mut env = vec![
            (
                "PATH".to_string(),
                "/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
            ),
            (
                "HOME".to_string(),
                self.ctx
                    .config
                    .container_home(&self.name)
                    .to_string_lossy()
                    .to_string(),
            ),
            ("USER".to_string(), user.clone()),
            ("container".to_string(), "lxc".to_string()),
            ("WARDEN_NAME".to_string(), self.name.clone()),
            ("WARDEN_HOST".to_string(), host_name()),
            ("WARDEN_USER".to_string(), user),
        ];
        for entry in props.get("env")?.as_list().unwrap_or(&[]) {
            env.extend(parse_env_list(entry)?);
        }

        let net_mode = props.get_string("net")?;
        let mut binds = BindMount::parse_all(props.get("bind")?.as_list().unwrap_or(&[]))?;
        if props.get("bind_dns")?.as_bool().unwrap_or(false) && root != "/" {
            for path in ["/etc/resolv.conf", "/etc/hosts"] {
                binds.push(BindMount {
                    source: path.into(),
                    target: path.into(),
                    read_only: true,
                });
            }
        }

        let mut rlimits = Vec::new();
        for entry in props.get("ulimit")?.as_list().unwrap_or(&[]) {
            rlimits.extend(crate::rlimit::parse_ulimit(entry)?);
        }

        let cap_names = props.get("capabilities")?;
        let cap_list = cap_names.as_list().unwrap_or(&[]).to_vec();
        let keep_caps = if !cap_list.is_empty() {
            Some(cred::parse_cap_mask(&cap_list)?)
        } else if virt_os {
            Some(cred::os_mode_caps())
        } else if cred.is_privileged() {
            None
        } else {
            Some(CapsHashSet::new())
        };

        let device_rules = props
            .get("allowed_devices")?
            .as_list()
            .unwrap_or(&[])
            .to_vec();
        // The catch-all default means the controller stays open.
        let device_rules = if device_rules == ["a *:* rwm".to_string()] {
            Vec::new()
        } else {
            device_rules
        };

        Ok(StartPlan {
            is_meta: argv.is_empty(),
            argv,
            virt_os,
            isolate,
            root,
            root_readonly: props.get("root_readonly")?.as_bool().unwrap_or(false),
            cwd,
            env,
            stdin_path,
            stdout_path,
            stderr_path,
            hostname,
            net_mode,
            binds,
            rlimits,
            keep_caps,
            device_rules,
            cred,
            memory_guarantee: self.parse_uint_prop(props, "memory_guarantee"),
        })
    }

    fn parse_uint_prop(&self, props: &PropertyMap, name: &str) -> u64 {
        props
            .get(name)
            .ok()
            .and_then(|v| v.as_uint())
            .unwrap_or(0)
    }

    fn build_task_env(
        &self,
        plan: &StartPlan,
        cgroups: &HashMap<Controller, Cgroup>,
    ) -> Result<TaskEnv, Error> {
        let private_net = plan.net_mode == "none";
        // Binds force a mount namespace even on the host root: they must
        // never leak into the parent's view.
        let private_mount = plan.root != "/" || !plan.binds.is_empty();
        let ns_flags = NsFlags::compose(
            plan.isolate,
            plan.hostname.is_some(),
            private_net,
            private_mount,
        );

        // A shared child enters the namespaces of the nearest running
        // ancestor with a live task.
        let parent_ns = if !plan.isolate {
            let mut node = self.parent();
            let mut ns = None;
            while let Some(current) = node {
                if let Some(pid) = current.root_pid() {
                    ns = Some(NsSet::open(pid, NsFlags::ISOLATE | NsFlags::NET)?);
                    break;
                }
                node = current.parent();
            }
            ns
        } else {
            None
        };

        let mut ordered: Vec<Cgroup> = Vec::new();
        // Freezer first: the task must be freezable before anything else.
        if let Some(freezer) = cgroups.get(&Controller::Freezer) {
            ordered.push(freezer.clone());
        }
        for (controller, cgroup) in cgroups {
            if *controller != Controller::Freezer {
                ordered.push(cgroup.clone());
            }
        }

        Ok(TaskEnv {
            argv: plan.argv.clone(),
            cwd: plan.cwd.clone(),
            env: plan.env.clone(),
            stdin_path: plan.stdin_path.clone(),
            stdout_path: plan.stdout_path.clone(),
            stderr_path: plan.stderr_path.clone(),
            rootfs: RootFs::new(plan.root.clone(), plan.binds.clone()),
            ns_flags,
            parent_ns,
            cgroups: ordered,
            cred: plan.cred.clone(),
            keep_caps: plan.keep_caps.clone(),
            rlimits: plan.rlimits.clone(),
            hostname: plan.hostname.clone(),
            root_readonly: plan.root_readonly,
        })
    }

    // ------------------------------------------------------------------
    // Stop
    // ------------------------------------------------------------------

    pub fn stop(self: &Arc<Self>) -> Result<(), Error> {
        if self.is_root() {
            return Err(Error::invalid_state("/ cannot be stopped"));
        }

        match self.state() {
            ContainerState::Running
            | ContainerState::Dead
            | ContainerState::Meta
            | ContainerState::Paused => {}
            state => {
                return Err(Error::invalid_state(format!(
                    "cannot stop while {}",
                    state
                )))
            }
        }

        // Children first, newest first, best effort.
        let mut children = self.children();
        children.reverse();
        for child in children {
            if child.state() != ContainerState::Stopped {
                if let Err(e) = child.stop() {
                    warn!("stop child {}: {}", child.name(), e);
                }
            }
        }

        self.kill_task_tree();
        self.free_resources();

        let mut inner = self.inner.lock().unwrap();
        inner.task = None;
        inner.state = ContainerState::Stopped;
        inner.start_time = None;
        drop(inner);

        self.persist_runtime(&[(K_STATE, "stopped".to_string())]);
        info!("stopped {}", self.name);
        Ok(())
    }

    /// SIGTERM, grace period, then freeze-kill-thaw the whole cgroup.
    fn kill_task_tree(&self) {
        let pid = self.root_pid();

        if let Some(pid) = pid {
            let task = Task::from_pid(pid);
            if task.is_alive() {
                let _ = task.kill(Signal::SIGTERM);
                let deadline =
                    Instant::now() + Duration::from_millis(self.ctx.config.stop_timeout_ms);
                while task.is_alive() && Instant::now() < deadline {
                    std::thread::sleep(Duration::from_millis(20));
                }
            }
        }

        let freezer = self.cgroup(Controller::Freezer);
        if freezer.exists() {
            // Freeze so survivors cannot outrace their SIGKILL by forking.
            if let Err(e) = freezer.freeze(Duration::from_secs(5)) {
                warn!("freeze {}: {}", self.name, e);
            }
            let _ = freezer.kill_all();
            let _ = freezer.thaw();

            let deadline = Instant::now() + Duration::from_secs(5);
            while !freezer.is_empty().unwrap_or(true) && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(20));
            }
        }
    }

    fn free_resources(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.oom_monitor.take().is_some() {
                // Deregister before the fd closes with the monitor.
                self.ctx.events.unregister_oom(&self.name);
            }
        }

        if let Err(e) = self.ctx.netclass.remove(self.id) {
            warn!("remove net class of {}: {}", self.name, e);
        }
        if let Err(e) = self.ctx.cgroups.remove_all(&self.name) {
            warn!("remove cgroups of {}: {}", self.name, e);
        }
    }

    // ------------------------------------------------------------------
    // Pause / Resume
    // ------------------------------------------------------------------

    pub fn pause(self: &Arc<Self>) -> Result<(), Error> {
        match self.state() {
            ContainerState::Running | ContainerState::Meta => {}
            state => {
                return Err(Error::invalid_state(format!(
                    "cannot pause while {}",
                    state
                )))
            }
        }

        let freezer = self.cgroup(Controller::Freezer);
        if freezer.exists() {
            freezer.freeze(Duration::from_secs(5))?;
        }

        // The kernel froze the whole subtree atomically; now mirror it.
        self.cascade_pause();
        self.persist_runtime(&[(K_STATE, "paused".to_string())]);
        Ok(())
    }

    fn cascade_pause(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(
                inner.state,
                ContainerState::Running | ContainerState::Meta
            ) {
                inner.state = ContainerState::Paused;
            }
        }
        for child in self.children() {
            child.cascade_pause();
        }
    }

    pub fn resume(self: &Arc<Self>) -> Result<(), Error> {
        if self.state() != ContainerState::Paused {
            return Err(Error::invalid_state(format!(
                "cannot resume while {}",
                self.state()
            )));
        }

        let freezer = self.cgroup(Controller::Freezer);
        if freezer.exists() {
            freezer.thaw()?;
        }

        self.cascade_resume();
        self.persist_runtime(&[(K_STATE, "running".to_string())]);
        Ok(())
    }

    fn cascade_resume(self: &Arc<Self>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state == ContainerState::Paused {
                inner.state = if inner.task.is_some() {
                    ContainerState::Running
                } else {
                    ContainerState::Meta
                };
            }
        }
        for child in self.children() {
            child.cascade_resume();
        }
    }

    // ------------------------------------------------------------------
    // Kill
    // ------------------------------------------------------------------

    /// Send a signal to the main task. For isolated os-mode containers
    /// the task is pid 1 of its namespace, so the kernel drops any signal
    /// it has no handler for, except SIGKILL.
    pub fn kill(&self, signal: Signal) -> Result<(), Error> {
        let inner = self.inner.lock().unwrap();
        if inner.state != ContainerState::Running {
            return Err(Error::invalid_state(format!(
                "cannot kill while {}",
                inner.state
            )));
        }
        let task = inner
            .task
            .as_ref()
            .ok_or_else(|| Error::invalid_state("no task"))?;
        task.kill(signal)
    }

    // ------------------------------------------------------------------
    // Exit and OOM delivery
    // ------------------------------------------------------------------

    /// Match an exit event against this container's task. Returns true
    /// when consumed; state moves Running → Dead, waiters fire, and
    /// respawn or aging is scheduled.
    pub fn deliver_exit(self: &Arc<Self>, pid: i32, status: i32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let matches = inner
            .task
            .as_ref()
            .is_some_and(|task| task.pid() == pid && inner.state == ContainerState::Running);
        if !matches {
            return false;
        }

        inner.exit_status = Some(status);
        inner.state = ContainerState::Dead;
        inner.death_time = Some(Instant::now());
        let oom = inner.oom_killed;
        let respawn_wanted = inner
            .props
            .get("respawn")
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);
        let max_respawns = inner
            .props
            .get("max_respawns")
            .map(|v| v.as_int().unwrap_or(-1))
            .unwrap_or(-1);
        let respawn_count = inner.respawn_count;
        let aging = inner
            .props
            .get("aging_time")
            .ok()
            .and_then(|v| v.as_uint())
            .unwrap_or(self.ctx.config.aging_time_s);
        drop(inner);

        info!(
            "{} died: status {} oom {} (respawn count {})",
            self.name, status, oom, respawn_count
        );

        // Persist before the caller acks the exit to the reaper.
        self.persist_runtime(&[
            (K_STATE, "dead".to_string()),
            (K_EXIT_STATUS, status.to_string()),
            (K_OOM_KILLED, oom.to_string()),
        ]);

        self.notify_waiters();

        if respawn_wanted && (max_respawns < 0 || respawn_count < max_respawns as u64) {
            self.ctx.events.schedule(
                Duration::from_millis(self.ctx.config.respawn_delay_ms),
                Event::Respawn {
                    name: self.name.clone(),
                },
            );
        } else {
            self.ctx.events.schedule(
                Duration::from_secs(aging),
                Event::AgeOut {
                    name: self.name.clone(),
                },
            );
        }

        true
    }

    /// The kernel OOM-killed inside this container's memory cgroup.
    pub fn deliver_oom(self: &Arc<Self>) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(monitor) = &inner.oom_monitor {
            if !monitor.consume() {
                return;
            }
        }
        if inner.state == ContainerState::Running {
            inner.oom_killed = true;
            drop(inner);
            self.persist_runtime(&[(K_OOM_KILLED, "true".to_string())]);
        }
    }

    /// Scheduled respawn: Dead → Stopped → Running with the counter
    /// incremented and persisted.
    pub fn respawn(self: &Arc<Self>) -> Result<(), Error> {
        if self.state() != ContainerState::Dead {
            return Ok(()); // raced with stop/destroy; nothing to do
        }

        let enabled = self.get_property("respawn")? == "true";
        if !enabled {
            return Ok(());
        }

        self.kill_task_tree();
        self.free_resources();
        {
            let mut inner = self.inner.lock().unwrap();
            inner.task = None;
            inner.state = ContainerState::Stopped;
            inner.respawn_count += 1;
        }
        let count = self.respawn_count();
        self.persist_runtime(&[(K_RESPAWN_COUNT, count.to_string())]);
        DaemonStat::bump(&self.ctx.stat.spawned);

        info!("respawning {} (count {})", self.name, count);
        self.start()
    }

    /// Dead containers age out after `aging_time`.
    pub fn should_age_out(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == ContainerState::Dead && inner.death_time.is_some()
    }

    /// Force Meta state; only for `/` and recovery inference.
    pub fn mark_meta(&self) {
        self.inner.lock().unwrap().state = ContainerState::Meta;
    }

    /// Post-recovery inference: an empty-command container with an
    /// active descendant is Meta even if its record says Stopped.
    pub fn infer_meta(self: &Arc<Self>) {
        if self.is_root() {
            return;
        }
        let command_empty = self
            .get_property("command")
            .map(|c| c.is_empty())
            .unwrap_or(false);
        if !command_empty || self.state() != ContainerState::Stopped {
            return;
        }
        let active_child = self.children().iter().any(|c| {
            matches!(
                c.state(),
                ContainerState::Running | ContainerState::Meta | ContainerState::Paused
            )
        });
        if active_child {
            self.mark_meta();
        }
    }

    // ------------------------------------------------------------------
    // Waiters
    // ------------------------------------------------------------------

    pub fn add_waiter(&self, waiter: &Arc<Waiter>) {
        self.inner.lock().unwrap().waiters.add(waiter);
    }

    pub fn notify_waiters(&self) {
        let mut inner = self.inner.lock().unwrap();
        let name = self.name.clone();
        inner.waiters.notify(&name);
    }

    // ------------------------------------------------------------------
    // Persistence and recovery
    // ------------------------------------------------------------------

    /// Append runtime keys; persistence failures are logged and surfaced
    /// through the daemon counters, never unwound.
    fn persist_runtime(&self, pairs: &[(&str, String)]) {
        for (key, value) in pairs {
            if let Err(e) = self.ctx.kv.append(self.id, key, value) {
                warn!("persist {} of {}: {}", key, self.name, e);
                DaemonStat::bump(&self.ctx.stat.errors);
            }
        }
    }

    /// Write the initial skeleton record for a fresh container.
    pub fn persist_skeleton(&self) -> Result<(), Error> {
        let owner = self.owner();
        let mut record = Record::new();
        record.push(K_NAME, self.name.clone());
        record.push(K_STATE, "stopped");
        record.push(K_OWNER_UID, owner.uid.to_string());
        record.push(K_OWNER_GID, owner.gid.to_string());
        self.ctx.kv.save(self.id, &record)
    }

    /// Rebuild this container from its kv record and the kernel state
    /// left behind by the previous daemon. Never kills anything.
    pub fn restore(self: &Arc<Self>, record: &Record) {
        {
            let mut inner = self.inner.lock().unwrap();

            let skipped = inner.props.restore(record);
            for key in skipped {
                warn!("restore {}: skipped bad key {}", self.name, key);
            }

            if let (Some(uid), Some(gid)) = (
                record.get(K_OWNER_UID).and_then(|v| v.parse().ok()),
                record.get(K_OWNER_GID).and_then(|v| v.parse().ok()),
            ) {
                inner.owner = Cred::new(uid, gid);
            }
            inner.respawn_count = record
                .get(K_RESPAWN_COUNT)
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
        }

        let recorded_state = ContainerState::parse(record.get(K_STATE).unwrap_or("stopped"));
        let recorded_pid: Option<i32> = record.get(K_ROOT_PID).and_then(|v| v.parse().ok());

        let freezer = self.cgroup(Controller::Freezer);
        let live_pids = if freezer.exists() {
            freezer.procs().unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut inner = self.inner.lock().unwrap();
        if !live_pids.is_empty() {
            // Prefer the recorded root pid when it is still in there.
            let pid = recorded_pid
                .filter(|p| live_pids.contains(p))
                .unwrap_or(live_pids[0]);
            inner.task = Some(Task::from_pid(pid));
            inner.lost_restored = true;
            inner.state = match freezer.freezer_state() {
                Ok(crate::cgroup::FreezerState::Frozen) => ContainerState::Paused,
                _ => ContainerState::Running,
            };
            if let Some(unix) = record.get(K_START_TIME).and_then(|v| v.parse::<u64>().ok()) {
                let elapsed = unix_now().saturating_sub(unix);
                inner.start_time = Instant::now().checked_sub(Duration::from_secs(elapsed));
            } else {
                inner.start_time = Some(Instant::now());
            }

            if inner.state == ContainerState::Running {
                let memory = self.ctx.cgroups.container_cgroup(Controller::Memory, &self.name);
                if memory.exists() {
                    if let Ok(monitor) = OomMonitor::install(&memory) {
                        self.ctx.events.register_oom(self.name.clone(), monitor.fd());
                        inner.oom_monitor = Some(monitor);
                    }
                }
            }
            info!(
                "restored {} as {} (pid {})",
                self.name,
                inner.state,
                inner.task.as_ref().map(|t| t.pid()).unwrap_or(-1)
            );
        } else if freezer.exists() && recorded_state == ContainerState::Running {
            // The task vanished while the daemon was down.
            inner.state = ContainerState::Dead;
            inner.exit_status = Some(-1);
            inner.death_time = Some(Instant::now());
            info!("restored {} as lost-dead", self.name);
        } else if recorded_state == ContainerState::Meta {
            inner.state = ContainerState::Meta;
        } else {
            inner.state = ContainerState::Stopped;
        }
    }

    /// Release everything on destroy. The holder has already removed the
    /// registry entries and stopped the subtree.
    pub fn release(self: &Arc<Self>) {
        self.notify_waiters();
        self.free_resources();
        if let Err(e) = self.ctx.kv.remove(self.id) {
            warn!("remove kv node {}: {}", self.id, e);
        }
        if let Some(parent) = self.parent() {
            parent.remove_child(self);
        }
    }
}

/// One start's worth of parsed configuration.
struct StartPlan {
    argv: Vec<String>,
    is_meta: bool,
    virt_os: bool,
    isolate: bool,
    root: String,
    root_readonly: bool,
    cwd: PathBuf,
    env: Vec<(String, String)>,
    stdin_path: PathBuf,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    hostname: Option<String>,
    net_mode: String,
    binds: Vec<BindMount>,
    rlimits: Vec<Rlimit>,
    keep_caps: Option<CapsHashSet>,
    device_rules: Vec<String>,
    cred: Cred,
    memory_guarantee: u64,
}

fn sum_guarantees(node: &Arc<Container>, except: &str) -> u64 {
    let mut total = 0;
    if node.name() != except && node.name() != ROOT_NAME {
        let inner = node.inner.lock().unwrap();
        total += inner
            .props
            .get("memory_guarantee")
            .ok()
            .and_then(|v| v.as_uint())
            .unwrap_or(0);
    }
    for child in node.children() {
        total += sum_guarantees(&child, except);
    }
    total
}

/// Total physical memory in bytes.
pub fn physical_memory() -> u64 {
    // SAFETY: sysconf(2) with valid names has no preconditions.
    let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGE_SIZE) };
    if pages <= 0 || page_size <= 0 {
        return u64::MAX;
    }
    pages as u64 * page_size as u64
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn host_name() -> String {
    nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("a").unwrap(), "/a");
        assert_eq!(normalize_name("/a/b").unwrap(), "/a/b");
        assert_eq!(normalize_name("/").unwrap(), "/");
        assert_eq!(normalize_name("w-1.2@x:y").unwrap(), "/w-1.2@x:y");
    }

    #[test]
    fn test_name_rejects() {
        assert!(normalize_name("").is_err());
        assert!(normalize_name("a//b").is_err());
        assert!(normalize_name("a/").is_err());
        assert!(normalize_name("a b").is_err());
        assert!(normalize_name("a#b").is_err());
    }

    #[test]
    fn test_name_boundaries() {
        let ok = "x".repeat(MAX_NAME_SEGMENT);
        assert!(normalize_name(&ok).is_ok());
        let too_long = "x".repeat(MAX_NAME_SEGMENT + 1);
        assert!(normalize_name(&too_long).is_err());

        // Path length counts the relative path.
        let a = "a".repeat(99);
        let b = "b".repeat(100);
        let path = format!("{}/{}", a, b); // 200 chars total
        assert!(normalize_name(&path).is_ok());
        let path = format!("{}/{}c", a, b); // 201 chars
        assert!(normalize_name(&path).is_err());
    }

    #[test]
    fn test_parent_of() {
        assert_eq!(parent_of("/a/b/c").unwrap(), "/a/b");
        assert_eq!(parent_of("/a").unwrap(), "/");
        assert_eq!(parent_of("/"), None);
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/a/b/c"), "c");
        assert_eq!(base_name("/a"), "a");
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            ContainerState::Stopped,
            ContainerState::Dead,
            ContainerState::Running,
            ContainerState::Paused,
            ContainerState::Meta,
        ] {
            assert_eq!(ContainerState::parse(state.name()), state);
        }
        assert_eq!(ContainerState::parse("bogus"), ContainerState::Unknown);
    }
}
