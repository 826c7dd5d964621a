//! Network Classes
//!
//! Gives every container an htb class under a per-link root qdisc and a
//! net_cls classid that a cgroup filter maps onto that class. One handle
//! space `1:<id>` is shared by all links: container id N owns class
//! `1:N` on every link, so adding a link means re-applying every known
//! class to it.
//!
//! | Property | Effect |
//! |-----------------|------------------------------------------|
//! | `net_guarantee` | htb `rate` per link |
//! | `net_limit` | htb `ceil` per link (0 = ceil at link root) |
//! | `net_priority` | htb `prio` |

use std::collections::HashMap;
use std::sync::Mutex;

use log::{debug, info, warn};

use crate::error::Error;
use crate::netlink::{
    htb_glob, htb_opt, rate_table, ClassStats, NetlinkSocket, NlRequest, TcHandle, NLM_F_ACK,
    NLM_F_CREATE, NLM_F_REPLACE, RTM_DELTCLASS, RTM_NEWQDISC, RTM_NEWTCLASS, RTM_NEWTFILTER,
    TCA_HTB_CTAB, TCA_HTB_INIT, TCA_HTB_PARMS, TCA_HTB_RTAB, TCA_KIND, TCA_OPTIONS, TC_H_ROOT,
};

/// Effectively unlimited ceiling used when no limit is set.
const CEIL_UNLIMITED: u64 = 10 << 30;

/// Traffic shape of one container, applied per link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetClassCfg {
    pub guarantee_bps: u64,
    pub limit_bps: u64,
    pub priority: u32,
}

/// Programs qdiscs, classes and filters; remembers what it programmed so
/// link changes can be replayed.
#[derive(Debug)]
pub struct NetClassMgr {
    inner: Mutex<NetClassInner>,
}

#[derive(Debug)]
struct NetClassInner {
    socket: Option<NetlinkSocket>,
    links: Vec<(i32, String)>,
    classes: HashMap<u16, NetClassCfg>,
}

impl NetClassMgr {
    /// A disconnected manager; becomes active on [`connect`](Self::connect).
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(NetClassInner {
                socket: None,
                links: Vec::new(),
                classes: HashMap::new(),
            }),
        }
    }

    /// Open the netlink socket, enumerate links, install root qdiscs.
    pub fn connect(&self) -> Result<(), Error> {
        let mut inner = self.inner.lock().unwrap();

        let mut socket = NetlinkSocket::connect()?;
        let links: Vec<(i32, String)> = socket
            .links()?
            .into_iter()
            .filter(|(_, name)| name != "lo")
            .collect();
        info!(
            "netclass: managing links {:?}",
            links.iter().map(|(_, n)| n.as_str()).collect::<Vec<_>>()
        );

        for (ifindex, name) in &links {
            if let Err(e) = install_root_qdisc(&mut socket, *ifindex) {
                warn!("netclass: root qdisc on {}: {}", name, e);
            }
        }

        inner.socket = Some(socket);
        inner.links = links;
        Ok(())
    }

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.socket = None;
        inner.links.clear();
    }

    /// The net_cls classid of a container id.
    pub fn classid(id: u16) -> u32 {
        TcHandle::new(1, id).raw()
    }

    /// Create or update the class of container `id` on every link.
    pub fn apply(&self, id: u16, cfg: NetClassCfg) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        let Some(socket) = inner.socket.as_mut() else {
            debug!("netclass: not connected, skipping class 1:{}", id);
            return Ok(());
        };

        for (ifindex, name) in &inner.links {
            program_class(socket, *ifindex, id, cfg).map_err(|e| {
                Error::new(
                    e.kind,
                    format!("class 1:{:x} on {}: {}", id, name, e.message),
                )
            })?;
        }

        inner.classes.insert(id, cfg);
        Ok(())
    }

    /// Remove the class of container `id` from every link.
    pub fn remove(&self, id: u16) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;

        if let Some(socket) = inner.socket.as_mut() {
            for (ifindex, name) in &inner.links {
                if let Err(e) = delete_class(socket, *ifindex, id) {
                    debug!("netclass: delete 1:{:x} on {}: {}", id, name, e);
                }
            }
        }
        inner.classes.remove(&id);
        Ok(())
    }

    /// Re-read the link set and re-apply every known class.
    ///
    /// Must be called when a link appears or disappears at runtime; a new
    /// link starts with no classes at all otherwise.
    pub fn refresh_links(&self) -> Result<(), Error> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let Some(socket) = inner.socket.as_mut() else {
            return Ok(());
        };

        let links: Vec<(i32, String)> = socket
            .links()?
            .into_iter()
            .filter(|(_, name)| name != "lo")
            .collect();

        let known: Vec<i32> = inner.links.iter().map(|(i, _)| *i).collect();
        let fresh: Vec<(i32, String)> = links
            .iter()
            .filter(|(i, _)| !known.contains(i))
            .cloned()
            .collect();

        for (ifindex, name) in &fresh {
            info!(
                "netclass: new link {}, replaying {} classes",
                name,
                inner.classes.len()
            );
            if let Err(e) = install_root_qdisc(socket, *ifindex) {
                warn!("netclass: root qdisc on {}: {}", name, e);
                continue;
            }
            for (id, cfg) in &inner.classes {
                if let Err(e) = program_class(socket, *ifindex, *id, *cfg) {
                    warn!("netclass: replay 1:{:x} on {}: {}", id, name, e);
                }
            }
        }

        inner.links = links;
        Ok(())
    }

    /// Number of classes currently programmed.
    pub fn class_count(&self) -> usize {
        self.inner.lock().unwrap().classes.len()
    }

    /// Per-link traffic counters of a container's class, keyed by link
    /// name. Empty when disconnected or the class is not programmed.
    pub fn stats(&self, id: u16) -> HashMap<String, ClassStats> {
        let mut guard = self.inner.lock().unwrap();
        let inner = &mut *guard;
        let mut result = HashMap::new();

        let Some(socket) = inner.socket.as_mut() else {
            return result;
        };
        let handle = TcHandle::new(1, id).raw();
        for (ifindex, name) in &inner.links {
            match socket.class_stats(*ifindex, handle) {
                Ok(Some(stats)) => {
                    result.insert(name.clone(), stats);
                }
                Ok(None) => {}
                Err(e) => debug!("netclass: stats 1:{:x} on {}: {}", id, name, e),
            }
        }
        result
    }
}

impl Default for NetClassMgr {
    fn default() -> Self {
        Self::new()
    }
}

fn install_root_qdisc(socket: &mut NetlinkSocket, ifindex: i32) -> Result<(), Error> {
    let seq = socket.next_seq();
    let request = NlRequest::new(RTM_NEWQDISC, NLM_F_CREATE | NLM_F_REPLACE | NLM_F_ACK, seq)
        .tcmsg(ifindex, TcHandle::new(1, 0).raw(), TC_H_ROOT)
        .attr_str(TCA_KIND, "htb")
        .nested(TCA_OPTIONS, |req| {
            // Unclassified traffic falls into 1:0 (no shaping).
            req.attr(TCA_HTB_INIT, &htb_glob(0))
        })
        .finish();
    socket.execute(request)
}

fn program_class(
    socket: &mut NetlinkSocket,
    ifindex: i32,
    id: u16,
    cfg: NetClassCfg,
) -> Result<(), Error> {
    let rate = cfg.guarantee_bps.max(1);
    let ceil = if cfg.limit_bps == 0 {
        CEIL_UNLIMITED
    } else {
        cfg.limit_bps
    };

    let seq = socket.next_seq();
    let request = NlRequest::new(RTM_NEWTCLASS, NLM_F_CREATE | NLM_F_REPLACE | NLM_F_ACK, seq)
        .tcmsg(ifindex, TcHandle::new(1, id).raw(), TcHandle::new(1, 0).raw())
        .attr_str(TCA_KIND, "htb")
        .nested(TCA_OPTIONS, |req| {
            req.attr(TCA_HTB_PARMS, &htb_opt(rate, ceil, cfg.priority))
                .attr(TCA_HTB_RTAB, &rate_table(rate))
                .attr(TCA_HTB_CTAB, &rate_table(ceil))
        })
        .finish();
    socket.execute(request)?;

    // The cgroup filter maps net_cls classids onto classes; idempotent.
    let seq = socket.next_seq();
    let filter = NlRequest::new(RTM_NEWTFILTER, NLM_F_CREATE | NLM_F_ACK, seq)
        .tcmsg(ifindex, 0, TcHandle::new(1, 0).raw())
        .attr_str(TCA_KIND, "cgroup")
        .finish();
    if let Err(e) = socket.execute(filter) {
        // EEXIST from a previous container is fine.
        if e.errno != Some(libc::EEXIST) {
            return Err(e);
        }
    }

    Ok(())
}

fn delete_class(socket: &mut NetlinkSocket, ifindex: i32, id: u16) -> Result<(), Error> {
    let seq = socket.next_seq();
    let request = NlRequest::new(RTM_DELTCLASS, NLM_F_ACK, seq)
        .tcmsg(ifindex, TcHandle::new(1, id).raw(), TcHandle::new(1, 0).raw())
        .finish();
    socket.execute(request)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classid_matches_handle_space() {
        assert_eq!(NetClassMgr::classid(5), 0x0001_0005);
        assert_eq!(NetClassMgr::classid(0xFFFF), 0x0001_FFFF);
    }

    #[test]
    fn test_disconnected_apply_is_noop() {
        let mgr = NetClassMgr::new();
        mgr.apply(
            3,
            NetClassCfg {
                guarantee_bps: 1000,
                limit_bps: 0,
                priority: 3,
            },
        )
        .unwrap();
        // Not connected: nothing recorded, nothing programmed.
        assert_eq!(mgr.class_count(), 0);

        mgr.remove(3).unwrap();
        mgr.refresh_links().unwrap();
    }
}
