//! Slave Bootstrap
//!
//! Builds the context, recovers the tree, and runs the serving threads:
//!
//! - the epoll event loop (exit pipe, OOM fds, timers)
//! - one delivery thread applying exits in order and acking the master
//! - one worker for timer events (respawn, aging, link refresh)
//! - the RPC worker pool and the accept loop
//!
//! A SIGINT/SIGTERM watcher thread tears everything down; the master
//! decides whether that was a shutdown or a crash to respawn from.

use std::fs;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use nix::sys::signal::{SigSet, Signal};

use crate::cgroup::CgroupMgr;
use crate::config::{DaemonStat, WardenConfig, WardenContext};
use crate::events::{Event, EventLoop};
use crate::holder::Holder;
use crate::kv::KvStore;
use crate::netclass::NetClassMgr;
use crate::reaper::{REAP_ACK_FD, REAP_EVT_FD};
use crate::rpc::{run_event_worker, run_exit_delivery, RpcServer};

/// How often the link set is re-checked for netclass replay.
const LINK_REFRESH: Duration = Duration::from_secs(60);

/// Entry point of the slave. Returns the process exit code.
pub fn run_slave(config: WardenConfig) -> i32 {
    info!("slave started (pid {})", std::process::id());

    if let Err(e) = fs::write(&config.slave_pidfile, std::process::id().to_string()) {
        warn!("write pidfile: {}", e);
    }
    if let Err(e) = fs::create_dir_all(&config.place_dir) {
        warn!("create {}: {}", config.place_dir.display(), e);
    }

    // Keep SIGINT/SIGTERM out of every worker; one thread sigwaits.
    let mut shutdown_set = SigSet::empty();
    shutdown_set.add(Signal::SIGINT);
    shutdown_set.add(Signal::SIGTERM);
    if let Err(e) = shutdown_set.thread_set_mask() {
        warn!("mask signals: {}", e);
    }

    let kv = KvStore::new(&config.kv_root, &config.kv_tmpfs_size);
    if let Err(e) = kv.mount_tmpfs() {
        // Keep going on a plain directory: state then survives neither
        // crash nor reboot, but the daemon stays usable.
        warn!("kv tmpfs: {}", e);
    }

    let cgroups = CgroupMgr::new(&config.cgroup_subtree);
    if let Err(e) = cgroups.prepare_roots() {
        warn!("cgroup roots: {}", e);
    }

    let netclass = NetClassMgr::new();
    if let Err(e) = netclass.connect() {
        warn!("netlink: {}", e);
    }

    let (delivery_tx, delivery_rx) = crossbeam_channel::unbounded();
    let (work_tx, work_rx) = crossbeam_channel::unbounded();
    let (event_loop, events) = match EventLoop::new(REAP_EVT_FD, delivery_tx, work_tx) {
        Ok(pair) => pair,
        Err(e) => {
            log::error!("event loop: {}", e);
            return 1;
        }
    };

    let ctx = Arc::new(WardenContext {
        config,
        kv,
        cgroups,
        netclass,
        stat: DaemonStat::default(),
        events: events.clone(),
    });
    DaemonStat::bump(&ctx.stat.slave_started);

    let holder = Holder::new(ctx.clone());
    holder.recover();

    let event_thread = std::thread::Builder::new()
        .name("events".into())
        .spawn(move || event_loop.run())
        .expect("spawn event loop");

    let delivery_holder = holder.clone();
    let delivery_thread = std::thread::Builder::new()
        .name("exit-delivery".into())
        .spawn(move || run_exit_delivery(delivery_holder, delivery_rx, REAP_ACK_FD))
        .expect("spawn delivery");

    let worker_holder = holder.clone();
    let timer_thread = std::thread::Builder::new()
        .name("timer-worker".into())
        .spawn(move || run_event_worker(worker_holder, work_rx))
        .expect("spawn timer worker");

    events.schedule(LINK_REFRESH, Event::RefreshLinks);

    let server = match RpcServer::bind(holder.clone()) {
        Ok(server) => server,
        Err(e) => {
            log::error!("bind socket: {}", e);
            return 1;
        }
    };
    let rpc_workers = server.spawn_workers(ctx.config.rpc_workers);

    // The shutdown watcher unblocks its own signals and waits.
    let shutdown_ctx = ctx.clone();
    std::thread::Builder::new()
        .name("shutdown".into())
        .spawn(move || {
            let signal = shutdown_set.wait();
            info!("shutting down on {:?}", signal);
            shutdown_ctx.events.quit();
            let _ = fs::remove_file(&shutdown_ctx.config.socket_path);
            let _ = fs::remove_file(&shutdown_ctx.config.slave_pidfile);
            // Containers keep running; the next slave recovers them.
            std::process::exit(0);
        })
        .expect("spawn shutdown watcher");

    server.accept_loop();

    // Reached only when the listener fails; shut the loops down and let
    // the master respawn us.
    ctx.events.quit();
    let _ = event_thread.join();
    let _ = delivery_thread.join();
    let _ = timer_thread.join();
    for worker in rpc_workers {
        let _ = worker.join();
    }
    let _ = fs::remove_file(&ctx.config.slave_pidfile);

    if ctx.stat.errors.load(Ordering::Relaxed) > 0 {
        warn!(
            "slave exiting with {} logged errors",
            ctx.stat.errors.load(Ordering::Relaxed)
        );
    }
    1
}
