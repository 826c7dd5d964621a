//! Container Registry
//!
//! The holder owns every container: the name and id indexes, the id
//! pool, and the hierarchy rules (a child needs its parent, destroy runs
//! bottom-up, `/` is indestructible). Mutating operations serialise on
//! one operation lock; lookups take a short registry lock so readers
//! never wait behind a slow `start`.

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex};

use crossbeam_channel::Receiver;
use log::{info, warn};
use nix::sys::signal::Signal;

use crate::config::{DaemonStat, WardenContext};
use crate::container::{
    normalize_name, parent_of, Container, ContainerState, ROOT_ID, ROOT_NAME,
};
use crate::cred::Cred;
use crate::data;
use crate::error::{Error, ErrorKind};
use crate::events::Event;
use crate::idmap::IdMap;
use crate::kv::Record;
use crate::waiter::{glob_match, WaitResult, Waiter};

struct Registry {
    by_name: HashMap<String, Arc<Container>>,
    by_id: HashMap<u16, Arc<Container>>,
    idmap: IdMap,
}

pub struct Holder {
    ctx: Arc<WardenContext>,
    registry: Mutex<Registry>,
    /// Serialises create/destroy/start/stop/property writes and exit
    /// delivery. Always taken before the registry lock.
    op_lock: Mutex<()>,
}

impl Holder {
    /// Build the holder with the root container pre-registered.
    pub fn new(ctx: Arc<WardenContext>) -> Arc<Holder> {
        let mut idmap = IdMap::new(ctx.config.max_containers);
        idmap.claim(ROOT_ID).expect("fresh id map");

        let root = Container::new(
            ctx.clone(),
            ROOT_NAME.to_string(),
            ROOT_ID,
            None,
            Cred::root(),
        );
        root.mark_meta();

        let mut by_name = HashMap::new();
        let mut by_id = HashMap::new();
        by_name.insert(ROOT_NAME.to_string(), root.clone());
        by_id.insert(ROOT_ID, root);

        Arc::new(Holder {
            ctx,
            registry: Mutex::new(Registry {
                by_name,
                by_id,
                idmap,
            }),
            op_lock: Mutex::new(()),
        })
    }

    pub fn context(&self) -> &Arc<WardenContext> {
        &self.ctx
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn find(&self, name: &str) -> Result<Arc<Container>, Error> {
        self.registry
            .lock()
            .unwrap()
            .by_name
            .get(name)
            .cloned()
            .ok_or_else(|| Error::no_container(name))
    }

    pub fn find_by_id(&self, id: u16) -> Result<Arc<Container>, Error> {
        self.registry
            .lock()
            .unwrap()
            .by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::no_container(format!("id {}", id)))
    }

    /// All container names except `/`, sorted, optionally filtered by a
    /// glob pattern.
    pub fn list(&self, filter: Option<&str>) -> Vec<String> {
        let registry = self.registry.lock().unwrap();
        let mut names: Vec<String> = registry
            .by_name
            .keys()
            .filter(|n| n.as_str() != ROOT_NAME)
            .filter(|n| filter.map_or(true, |f| glob_match(f, n)))
            .cloned()
            .collect();
        names.sort();
        names
    }

    pub fn container_count(&self) -> usize {
        self.registry.lock().unwrap().by_name.len() - 1
    }

    // ------------------------------------------------------------------
    // Create / Destroy
    // ------------------------------------------------------------------

    pub fn create(&self, raw_name: &str, cred: &Cred) -> Result<String, Error> {
        let _op = self.op_lock.lock().unwrap();

        let name = normalize_name(raw_name)?;
        if name == ROOT_NAME {
            return Err(Error::permission("/ already exists"));
        }

        let parent_name = parent_of(&name).ok_or_else(|| Error::invalid_value("bad name"))?;
        let parent = self.find(&parent_name).map_err(|_| {
            Error::invalid_value(format!("parent {} does not exist", parent_name))
        })?;
        if !parent.is_root() {
            parent.check_permission(cred)?;
        }

        let container = {
            let mut registry = self.registry.lock().unwrap();
            if registry.by_name.contains_key(&name) {
                return Err(Error::new(
                    ErrorKind::ContainerAlreadyExists,
                    format!("container {} already exists", name),
                ));
            }
            if registry.by_name.len() - 1 >= self.ctx.config.max_containers as usize {
                return Err(Error::new(
                    ErrorKind::ResourceNotAvailable,
                    "too many containers",
                ));
            }

            let id = registry.idmap.allocate()?;
            let container =
                Container::new(self.ctx.clone(), name.clone(), id, Some(&parent), cred.clone());
            registry.by_name.insert(name.clone(), container.clone());
            registry.by_id.insert(id, container.clone());
            container
        };

        if let Err(e) = container.persist_skeleton() {
            warn!("persist skeleton of {}: {}", name, e);
            let mut registry = self.registry.lock().unwrap();
            registry.by_name.remove(&name);
            registry.by_id.remove(&container.id());
            registry.idmap.release(container.id());
            parent.remove_child(&container);
            return Err(e);
        }

        DaemonStat::bump(&self.ctx.stat.created);
        info!("created {} (id {}) for uid {}", name, container.id(), cred.uid);
        Ok(name)
    }

    pub fn destroy(&self, name: &str, cred: &Cred) -> Result<(), Error> {
        let _op = self.op_lock.lock().unwrap();
        self.destroy_locked(name, cred)
    }

    fn destroy_locked(&self, name: &str, cred: &Cred) -> Result<(), Error> {
        if name == ROOT_NAME {
            return Err(Error::permission("/ cannot be destroyed"));
        }
        let container = self.find(name)?;
        container.check_permission(cred)?;

        // A paused subtree must be resumed first: killing frozen tasks
        // would leave the freezer wedged.
        if subtree_has_paused(&container) {
            return Err(Error::invalid_state(format!(
                "{} has paused descendants",
                name
            )));
        }

        self.destroy_subtree(&container, cred)
    }

    fn destroy_subtree(&self, container: &Arc<Container>, cred: &Cred) -> Result<(), Error> {
        let mut children = container.children();
        children.reverse();
        for child in children {
            self.destroy_subtree(&child, cred)?;
        }

        if container.state() != ContainerState::Stopped {
            if let Err(e) = container.stop() {
                warn!("stop {} on destroy: {}", container.name(), e);
            }
        }

        container.release();

        let mut registry = self.registry.lock().unwrap();
        registry.by_name.remove(container.name());
        registry.by_id.remove(&container.id());
        registry.idmap.release(container.id());
        info!("destroyed {}", container.name());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lifecycle wrappers
    // ------------------------------------------------------------------

    pub fn start(&self, name: &str, cred: &Cred) -> Result<(), Error> {
        let _op = self.op_lock.lock().unwrap();
        let container = self.find(name)?;
        container.check_permission(cred)?;
        container.start()
    }

    pub fn stop(&self, name: &str, cred: &Cred) -> Result<(), Error> {
        let _op = self.op_lock.lock().unwrap();
        let container = self.find(name)?;
        container.check_permission(cred)?;
        container.stop()
    }

    pub fn pause(&self, name: &str, cred: &Cred) -> Result<(), Error> {
        let _op = self.op_lock.lock().unwrap();
        let container = self.find(name)?;
        container.check_permission(cred)?;
        container.pause()
    }

    pub fn resume(&self, name: &str, cred: &Cred) -> Result<(), Error> {
        let _op = self.op_lock.lock().unwrap();
        let container = self.find(name)?;
        container.check_permission(cred)?;
        container.resume()
    }

    pub fn kill(&self, name: &str, signal: i32, cred: &Cred) -> Result<(), Error> {
        let _op = self.op_lock.lock().unwrap();
        let container = self.find(name)?;
        container.check_permission(cred)?;
        let signal = Signal::try_from(signal)
            .map_err(|_| Error::invalid_value(format!("invalid signal {}", signal)))?;
        container.kill(signal)
    }

    pub fn set_property(
        &self,
        name: &str,
        prop: &str,
        value: &str,
        cred: &Cred,
    ) -> Result<(), Error> {
        let _op = self.op_lock.lock().unwrap();
        let container = self.find(name)?;
        let (prop, bool_dialect) = crate::property::resolve_alias(prop);
        let value = crate::property::alias_value(bool_dialect, value);
        container.set_property(prop, value, cred)
    }

    pub fn get_property(&self, name: &str, prop: &str) -> Result<String, Error> {
        let container = self.find(name)?;
        let (prop, _) = crate::property::resolve_alias(prop);
        container.get_property(prop)
    }

    pub fn get_data(&self, name: &str, key: &str) -> Result<String, Error> {
        let container = self.find(name)?;
        data::get(&container, key)
    }

    /// Batch read: per-container, per-variable results; a missing
    /// container fills its variables with errors instead of failing the
    /// whole request.
    pub fn get_batch(
        &self,
        names: &[String],
        variables: &[String],
    ) -> Vec<(String, Vec<(String, Result<String, Error>)>)> {
        let mut result = Vec::with_capacity(names.len());
        for name in names {
            let container = self.find(name);
            let mut entries = Vec::with_capacity(variables.len());
            for var in variables {
                let value = match &container {
                    Ok(c) => {
                        let (prop, _) = crate::property::resolve_alias(var);
                        c.get_property(prop).or_else(|e| {
                            if e.kind() == ErrorKind::InvalidProperty {
                                data::get(c, var)
                            } else {
                                Err(e)
                            }
                        })
                    }
                    Err(e) => Err(e.clone()),
                };
                entries.push((var.clone(), value));
            }
            result.push((name.clone(), entries));
        }
        result
    }

    // ------------------------------------------------------------------
    // Client namespaces
    // ------------------------------------------------------------------

    /// The name prefix a client sees, derived from the container its
    /// pid lives in (via the freezer cgroup) and the `namespace`
    /// properties down that chain.
    pub fn client_prefix(&self, client_pid: i32) -> String {
        let Some(name) = self.container_of_pid(client_pid) else {
            return String::new();
        };
        let Ok(container) = self.find(&name) else {
            return String::new();
        };

        let mut prefix = String::new();
        let mut chain = Vec::new();
        let mut node = Some(container);
        while let Some(current) = node {
            chain.push(current.clone());
            node = current.parent();
        }
        for container in chain.iter().rev() {
            if let Ok(ns) = container.get_property("namespace") {
                if !ns.is_empty() {
                    prefix.push_str(&ns);
                }
            }
        }
        prefix
    }

    /// Resolve a client-relative name against its prefix.
    pub fn resolve_name(&self, client_pid: i32, raw: &str) -> Result<String, Error> {
        let prefix = self.client_prefix(client_pid);
        if prefix.is_empty() {
            return normalize_name(raw);
        }
        normalize_name(&format!("{}{}", prefix, raw.trim_start_matches('/')))
    }

    /// Map an absolute name back to what the client may call it.
    pub fn relative_name(&self, client_pid: i32, absolute: &str) -> String {
        let prefix = self.client_prefix(client_pid);
        if prefix.is_empty() {
            return absolute.trim_start_matches('/').to_string();
        }
        let stripped = absolute.trim_start_matches('/');
        stripped
            .strip_prefix(&prefix)
            .unwrap_or(stripped)
            .to_string()
    }

    fn container_of_pid(&self, pid: i32) -> Option<String> {
        let raw = fs::read_to_string(format!("/proc/{}/cgroup", pid)).ok()?;
        let subtree = &self.ctx.config.cgroup_subtree;
        for line in raw.lines() {
            let mut fields = line.splitn(3, ':');
            let (_, controllers, path) = (fields.next()?, fields.next()?, fields.next()?);
            if !controllers.split(',').any(|c| c == "freezer") {
                continue;
            }
            let path = path.strip_prefix('/')?;
            if let Some(rest) = path.strip_prefix(subtree.as_str()) {
                if rest.is_empty() {
                    return Some(ROOT_NAME.to_string());
                }
                // `warden-other` is somebody else's cgroup.
                if rest.starts_with('/') {
                    return Some(rest.to_string());
                }
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Waiters
    // ------------------------------------------------------------------

    /// Register a waiter for the given absolute patterns. If any target
    /// is already Dead the waiter fires immediately.
    pub fn wait_register(
        &self,
        patterns: Vec<String>,
    ) -> Result<(Arc<Waiter>, Receiver<WaitResult>), Error> {
        let _op = self.op_lock.lock().unwrap();

        let (waiter, rx) = Waiter::new(patterns);

        let containers: Vec<Arc<Container>> = {
            let registry = self.registry.lock().unwrap();
            registry
                .by_name
                .values()
                .filter(|c| !c.is_root() && waiter.matches(c.name()))
                .cloned()
                .collect()
        };

        for container in &containers {
            if container.state() == ContainerState::Dead {
                waiter.fire(container.name());
                return Ok((waiter, rx));
            }
            container.add_waiter(&waiter);
        }

        Ok((waiter, rx))
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    /// Route a reaper exit to its container. Returns true if a container
    /// consumed it. The caller acks either way: an unknown pid is some
    /// reparented grandchild the runtime does not track.
    pub fn deliver_exit(&self, pid: i32, status: i32) -> bool {
        let _op = self.op_lock.lock().unwrap();

        let containers: Vec<Arc<Container>> = {
            let registry = self.registry.lock().unwrap();
            registry.by_name.values().cloned().collect()
        };

        for container in containers {
            if container.deliver_exit(pid, status) {
                return true;
            }
        }
        false
    }

    /// Handle a non-exit event from the loop.
    pub fn handle_event(&self, event: Event) {
        match event {
            Event::Oom { name } => {
                if let Ok(container) = self.find(&name) {
                    let _op = self.op_lock.lock().unwrap();
                    container.deliver_oom();
                }
            }
            Event::Respawn { name } => {
                let _op = self.op_lock.lock().unwrap();
                if let Ok(container) = self.find(&name) {
                    if let Err(e) = container.respawn() {
                        warn!("respawn {}: {}", name, e);
                    }
                }
            }
            Event::AgeOut { name } => {
                let should = self
                    .find(&name)
                    .map(|c| c.should_age_out())
                    .unwrap_or(false);
                if should {
                    info!("aging out {}", name);
                    DaemonStat::bump(&self.ctx.stat.removed_dead);
                    if let Err(e) = self.destroy(&name, &Cred::root()) {
                        warn!("age out {}: {}", name, e);
                    }
                }
            }
            Event::RefreshLinks => {
                if let Err(e) = self.ctx.netclass.refresh_links() {
                    warn!("refresh links: {}", e);
                }
                // Periodic: the handler re-arms its own timer.
                self.ctx.events.schedule(
                    std::time::Duration::from_secs(60),
                    Event::RefreshLinks,
                );
            }
            Event::Exit { .. } | Event::Shutdown => {}
        }
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    /// Rebuild the tree from the kv store and live kernel state. Never
    /// kills or restarts anything; it only reads.
    pub fn recover(&self) {
        let ids = match self.ctx.kv.list() {
            Ok(ids) => ids,
            Err(e) => {
                warn!("kv list: {}", e);
                return;
            }
        };

        // Load records and order parents before children.
        let mut records: Vec<(u16, String, Record)> = Vec::new();
        for id in ids {
            if id == ROOT_ID {
                continue;
            }
            match self.ctx.kv.load(id) {
                Ok(record) => match record.get("_name") {
                    Some(name) => records.push((id, name.to_string(), record)),
                    None => {
                        warn!("kv node {} has no name, dropping", id);
                        DaemonStat::bump(&self.ctx.stat.restore_failed);
                        let _ = self.ctx.kv.remove(id);
                    }
                },
                Err(e) => {
                    warn!("kv load {}: {}", id, e);
                    DaemonStat::bump(&self.ctx.stat.restore_failed);
                }
            }
        }
        records.sort_by_key(|(_, name, _)| name.matches('/').count());

        let _op = self.op_lock.lock().unwrap();
        for (id, name, record) in records {
            let Some(parent_name) = parent_of(&name) else {
                warn!("restore {}: bad name", name);
                DaemonStat::bump(&self.ctx.stat.restore_failed);
                continue;
            };
            let Ok(parent) = self.find(&parent_name) else {
                warn!("restore {}: parent {} missing", name, parent_name);
                DaemonStat::bump(&self.ctx.stat.restore_failed);
                let _ = self.ctx.kv.remove(id);
                continue;
            };

            let container = {
                let mut registry = self.registry.lock().unwrap();
                if registry.by_name.contains_key(&name) {
                    warn!("restore {}: duplicate record", name);
                    DaemonStat::bump(&self.ctx.stat.restore_failed);
                    continue;
                }
                if registry.idmap.claim(id).is_err() {
                    warn!("restore {}: id {} already claimed", name, id);
                    DaemonStat::bump(&self.ctx.stat.restore_failed);
                    continue;
                }
                let container = Container::new(
                    self.ctx.clone(),
                    name.clone(),
                    id,
                    Some(&parent),
                    Cred::root(),
                );
                registry.by_name.insert(name.clone(), container.clone());
                registry.by_id.insert(id, container.clone());
                container
            };

            container.restore(&record);
        }

        // Meta is derived: an empty-command container with an active
        // descendant is Meta even if its record says otherwise.
        let containers: Vec<Arc<Container>> = {
            let registry = self.registry.lock().unwrap();
            registry.by_name.values().cloned().collect()
        };
        for container in &containers {
            container.infer_meta();
        }

        // Dead containers found at recovery re-enter the aging pipeline.
        for container in &containers {
            if container.state() == ContainerState::Dead {
                let aging = container.effective_uint("aging_time");
                let aging = if aging == 0 {
                    self.ctx.config.aging_time_s
                } else {
                    aging
                };
                self.ctx.events.schedule(
                    std::time::Duration::from_secs(aging),
                    Event::AgeOut {
                        name: container.name().to_string(),
                    },
                );
            }
        }

        info!("recovered {} containers", self.container_count());
    }
}

fn subtree_has_paused(container: &Arc<Container>) -> bool {
    if container.state() == ContainerState::Paused {
        return true;
    }
    container.children().iter().any(subtree_has_paused)
}

/// Check the structural invariants of the whole tree; used by tests and
/// the selftest harness hook.
pub fn check_invariants(holder: &Holder) -> Result<(), String> {
    let root = holder.find(ROOT_NAME).map_err(|e| e.to_string())?;

    fn walk(node: &Arc<Container>, holder: &Holder) -> Result<(), String> {
        for child in node.children() {
            let expected = parent_of(child.name()).unwrap_or_default();
            if expected != node.name() {
                return Err(format!(
                    "{} is a child of {} but names say {}",
                    child.name(),
                    node.name(),
                    expected
                ));
            }
            if holder.find_by_id(child.id()).is_err() {
                return Err(format!("{} missing from id index", child.name()));
            }
            walk(&child, holder)?;
        }
        Ok(())
    }

    walk(&root, holder)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cgroup::CgroupMgr;
    use crate::config::{DaemonStat, WardenConfig};
    use crate::events::EventLoop;
    use crate::kv::KvStore;
    use crate::netclass::NetClassMgr;
    use std::os::fd::IntoRawFd;
    use tempfile::TempDir;

    fn test_holder() -> (TempDir, Arc<Holder>) {
        let dir = TempDir::new().unwrap();
        let kv_dir = dir.path().join("kv");
        std::fs::create_dir_all(&kv_dir).unwrap();

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        std::mem::forget(write_end);
        let (delivery_tx, _delivery_rx) = crossbeam_channel::unbounded();
        let (work_tx, _work_rx) = crossbeam_channel::unbounded();
        let (event_loop, handle) =
            EventLoop::new(read_end.into_raw_fd(), delivery_tx, work_tx).unwrap();
        // The loop itself is not needed for registry tests.
        std::mem::forget(event_loop);

        let mut config = WardenConfig::default();
        config.max_containers = 16;
        let cgroup_root = dir.path().join("cgroup");
        std::fs::create_dir_all(&cgroup_root).unwrap();

        let ctx = Arc::new(crate::config::WardenContext {
            config,
            kv: KvStore::new(&kv_dir, "size=1m"),
            cgroups: CgroupMgr::with_fs_root(&cgroup_root, "warden"),
            netclass: NetClassMgr::new(),
            stat: DaemonStat::default(),
            events: handle,
        });
        (dir, Holder::new(ctx))
    }

    fn cred() -> Cred {
        Cred::new(1000, 1000)
    }

    #[test]
    fn test_create_find_destroy() {
        let (_dir, holder) = test_holder();

        let name = holder.create("a", &cred()).unwrap();
        assert_eq!(name, "/a");
        assert_eq!(holder.find("/a").unwrap().state(), ContainerState::Stopped);
        assert_eq!(holder.container_count(), 1);

        // kv skeleton exists
        let id = holder.find("/a").unwrap().id();
        assert_eq!(holder.context().kv.load(id).unwrap().get("_name"), Some("/a"));

        holder.destroy("/a", &cred()).unwrap();
        assert!(holder.find("/a").is_err());
        assert!(holder.context().kv.load(id).is_err());
        assert_eq!(holder.container_count(), 0);
    }

    #[test]
    fn test_create_duplicate() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();
        let err = holder.create("a", &cred()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ContainerAlreadyExists);
    }

    #[test]
    fn test_create_requires_parent() {
        let (_dir, holder) = test_holder();
        let err = holder.create("a/b", &cred()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);

        holder.create("a", &cred()).unwrap();
        holder.create("a/b", &cred()).unwrap();
        assert_eq!(holder.list(None), vec!["/a", "/a/b"]);
    }

    #[test]
    fn test_parent_permission() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();

        let stranger = Cred::new(2000, 2000);
        let err = holder.create("a/b", &stranger).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);

        // root may always
        holder.create("a/c", &Cred::root()).unwrap();
    }

    #[test]
    fn test_destroy_is_recursive_bottom_up() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();
        holder.create("a/b", &cred()).unwrap();
        holder.create("a/b/c", &cred()).unwrap();

        holder.destroy("/a", &cred()).unwrap();
        assert!(holder.list(None).is_empty());
        assert_eq!(holder.container_count(), 0);
    }

    #[test]
    fn test_id_reuse_smallest_first() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();
        holder.create("b", &cred()).unwrap();
        let id_a = holder.find("/a").unwrap().id();

        holder.destroy("/a", &cred()).unwrap();
        holder.create("c", &cred()).unwrap();
        assert_eq!(holder.find("/c").unwrap().id(), id_a);
    }

    #[test]
    fn test_max_containers() {
        let (_dir, holder) = test_holder();
        for i in 0..15 {
            holder.create(&format!("c{}", i), &cred()).unwrap();
        }
        // id pool: 16 ids, one taken by root
        let err = holder.create("overflow", &cred()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotAvailable);
    }

    #[test]
    fn test_set_get_property_through_holder() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();

        holder
            .set_property("/a", "command", "sleep 1", &cred())
            .unwrap();
        assert_eq!(holder.get_property("/a", "command").unwrap(), "sleep 1");

        // alias resolves
        holder
            .set_property("/a", "memory.limit_in_bytes", "32M", &cred())
            .unwrap();
        assert_eq!(
            holder.get_property("/a", "memory_limit").unwrap(),
            (32u64 << 20).to_string()
        );
    }

    #[test]
    fn test_property_permission() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();

        let stranger = Cred::new(2000, 2000);
        let err = holder
            .set_property("/a", "command", "x", &stranger)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);

        // superuser-only property from an unprivileged owner
        let err = holder
            .set_property("/a", "capabilities", "CAP_KILL", &cred())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Permission);
    }

    #[test]
    fn test_parent_default_inheritance() {
        let (_dir, holder) = test_holder();
        crate::cgroup::override_caps_for_tests(crate::cgroup::CgroupCaps {
            low_limit: true,
            cpu_smart: false,
            cfs_reserve: false,
            fs_limits: true,
            recharge: true,
        });

        holder.create("p", &cred()).unwrap();
        holder.create("p/c", &cred()).unwrap();

        holder
            .set_property("/p", "memory_guarantee", "1G", &cred())
            .unwrap();
        // unset on the child: falls through to the parent value
        assert_eq!(
            holder.get_property("/p/c", "memory_guarantee").unwrap(),
            (1u64 << 30).to_string()
        );

        holder
            .set_property("/p/c", "memory_guarantee", "256M", &cred())
            .unwrap();
        assert_eq!(
            holder.get_property("/p/c", "memory_guarantee").unwrap(),
            (256u64 << 20).to_string()
        );
    }

    #[test]
    fn test_get_batch_partial_failure() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();
        holder
            .set_property("/a", "command", "true", &cred())
            .unwrap();

        let batch = holder.get_batch(
            &["/a".to_string(), "/ghost".to_string()],
            &["command".to_string(), "state".to_string()],
        );

        let (name, entries) = &batch[0];
        assert_eq!(name, "/a");
        assert_eq!(entries[0].1.as_ref().unwrap(), "true");
        assert_eq!(entries[1].1.as_ref().unwrap(), "stopped");

        let (name, entries) = &batch[1];
        assert_eq!(name, "/ghost");
        for (_, value) in entries {
            assert_eq!(
                value.as_ref().unwrap_err().kind(),
                ErrorKind::ContainerDoesNotExist
            );
        }
    }

    #[test]
    fn test_recover_round_trip() {
        let (dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();
        holder.create("a/b", &cred()).unwrap();
        holder
            .set_property("/a/b", "command", "sleep 5", &cred())
            .unwrap();
        let id_b = holder.find("/a/b").unwrap().id();

        // A second holder over the same kv store: the crashed-daemon case.
        let (_dir2, fresh) = {
            let (read_end, write_end) = nix::unistd::pipe().unwrap();
            std::mem::forget(write_end);
            let (delivery_tx, _d) = crossbeam_channel::unbounded();
            let (work_tx, _w) = crossbeam_channel::unbounded();
            let (event_loop, handle) =
                EventLoop::new(read_end.into_raw_fd(), delivery_tx, work_tx).unwrap();
            std::mem::forget(event_loop);

            let cgroup_root = dir.path().join("cgroup");
            let ctx = Arc::new(crate::config::WardenContext {
                config: WardenConfig {
                    max_containers: 16,
                    ..WardenConfig::default()
                },
                kv: KvStore::new(dir.path().join("kv"), "size=1m"),
                cgroups: CgroupMgr::with_fs_root(&cgroup_root, "warden"),
                netclass: NetClassMgr::new(),
                stat: DaemonStat::default(),
                events: handle,
            });
            (dir.path().to_path_buf(), Holder::new(ctx))
        };

        fresh.recover();
        assert_eq!(fresh.list(None), vec!["/a", "/a/b"]);
        assert_eq!(fresh.find("/a/b").unwrap().id(), id_b);
        assert_eq!(fresh.find("/a/b").unwrap().state(), ContainerState::Stopped);
        assert_eq!(
            fresh.get_property("/a/b", "command").unwrap(),
            "sleep 5"
        );
        check_invariants(&fresh).unwrap();
    }

    #[test]
    fn test_wait_fires_on_destroy() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();

        let (_waiter, rx) = holder.wait_register(vec!["/a".to_string()]).unwrap();
        assert!(rx.try_recv().is_err());

        holder.destroy("/a", &cred()).unwrap();
        assert_eq!(rx.recv().unwrap().name, "/a");
    }

    #[test]
    fn test_wait_wildcard() {
        let (_dir, holder) = test_holder();
        holder.create("x", &cred()).unwrap();
        holder.create("y", &cred()).unwrap();

        let (_waiter, rx) = holder.wait_register(vec!["*".to_string()]).unwrap();
        holder.destroy("/y", &cred()).unwrap();
        assert_eq!(rx.recv().unwrap().name, "/y");
    }

    #[test]
    fn test_property_state_gating() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();

        // Force a live state; `command` is only writable while stopped.
        holder.find("/a").unwrap().mark_meta();
        let err = holder
            .set_property("/a", "command", "true", &cred())
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);

        // Dynamic properties stay writable; the knob apply is a no-op
        // since no cgroup exists in the fake root.
        holder
            .set_property("/a", "respawn", "true", &cred())
            .unwrap();
    }

    #[test]
    fn test_lifecycle_preconditions() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();

        // Stopped: stop, kill, pause, resume are all invalid.
        for result in [
            holder.stop("/a", &cred()),
            holder.kill("/a", 9, &cred()),
            holder.resume("/a", &cred()),
        ] {
            assert_eq!(result.unwrap_err().kind(), ErrorKind::InvalidState);
        }

        // Bad signal numbers are rejected before the state check.
        let err = holder.kill("/a", 4096, &cred()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidValue);
    }

    #[test]
    fn test_root_is_protected() {
        let (_dir, holder) = test_holder();
        assert_eq!(
            holder.destroy("/", &Cred::root()).unwrap_err().kind(),
            ErrorKind::Permission
        );
        assert_eq!(
            holder.start("/", &Cred::root()).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            holder.stop("/", &Cred::root()).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        assert_eq!(
            holder
                .set_property("/", "command", "x", &Cred::root())
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidState
        );
    }

    #[test]
    fn test_meta_inference_after_recovery() {
        let (_dir, holder) = test_holder();
        holder.create("p", &cred()).unwrap();
        holder.create("p/c", &cred()).unwrap();

        // Child active, parent command empty and stopped → Meta.
        holder.find("/p/c").unwrap().mark_meta();
        holder.find("/p").unwrap().infer_meta();
        assert_eq!(holder.find("/p").unwrap().state(), ContainerState::Meta);

        // A parent with a command is never inferred Meta.
        holder.create("q", &cred()).unwrap();
        holder
            .set_property("/q", "command", "sleep 1", &cred())
            .unwrap();
        holder.find("/q").unwrap().infer_meta();
        assert_eq!(holder.find("/q").unwrap().state(), ContainerState::Stopped);
    }

    #[test]
    fn test_invariants_on_fresh_tree() {
        let (_dir, holder) = test_holder();
        holder.create("a", &cred()).unwrap();
        holder.create("a/b", &cred()).unwrap();
        check_invariants(&holder).unwrap();
    }
}
