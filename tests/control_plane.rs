//! Control-plane tests through the request router: the same path an RPC
//! frame takes after decoding, minus the socket. Kernel-facing pieces
//! (cgroup writes, netlink) are pointed at scratch directories, so these
//! run unprivileged.

use std::os::fd::IntoRawFd;
use std::sync::Arc;

use tempfile::TempDir;

use alice_warden::cgroup::CgroupMgr;
use alice_warden::config::{DaemonStat, WardenConfig, WardenContext};
use alice_warden::cred::Cred;
use alice_warden::error::ErrorKind;
use alice_warden::events::EventLoop;
use alice_warden::holder::{check_invariants, Holder};
use alice_warden::kv::KvStore;
use alice_warden::netclass::NetClassMgr;
use alice_warden::rpc::{handle_request, Request, Response};

struct TestDaemon {
    _dir: TempDir,
    holder: Arc<Holder>,
}

impl TestDaemon {
    fn new() -> TestDaemon {
        let dir = TempDir::new().unwrap();
        let kv_dir = dir.path().join("kv");
        let cgroup_root = dir.path().join("cgroup");
        std::fs::create_dir_all(&kv_dir).unwrap();
        std::fs::create_dir_all(&cgroup_root).unwrap();

        let (read_end, write_end) = nix::unistd::pipe().unwrap();
        std::mem::forget(write_end);
        let (delivery_tx, _delivery_rx) = crossbeam_channel::unbounded();
        let (work_tx, _work_rx) = crossbeam_channel::unbounded();
        let (event_loop, events) =
            EventLoop::new(read_end.into_raw_fd(), delivery_tx, work_tx).unwrap();
        std::mem::forget(event_loop);

        let ctx = Arc::new(WardenContext {
            config: WardenConfig {
                max_containers: 64,
                ..WardenConfig::default()
            },
            kv: KvStore::new(&kv_dir, "size=1m"),
            cgroups: CgroupMgr::with_fs_root(&cgroup_root, "warden"),
            netclass: NetClassMgr::new(),
            stat: DaemonStat::default(),
            events,
        });

        TestDaemon {
            _dir: dir,
            holder: Holder::new(ctx),
        }
    }

    fn call(&self, request: Request) -> Response {
        handle_request(
            &self.holder,
            request,
            &Cred::root(),
            std::process::id() as i32,
        )
    }

    fn call_as(&self, request: Request, cred: &Cred) -> Response {
        handle_request(&self.holder, request, cred, std::process::id() as i32)
    }
}

#[test]
fn create_configure_destroy() {
    let daemon = TestDaemon::new();

    let response = daemon.call(Request::Create { name: "a".into() });
    assert_eq!(response.error, 0);

    let response = daemon.call(Request::SetProperty {
        name: "a".into(),
        property: "command".into(),
        value: "sleep 1000".into(),
    });
    assert_eq!(response.error, 0);

    let response = daemon.call(Request::GetProperty {
        name: "a".into(),
        property: "command".into(),
    });
    assert_eq!(response.value.as_deref(), Some("sleep 1000"));

    let response = daemon.call(Request::List { filter: None });
    assert_eq!(response.list.unwrap(), vec!["a"]);

    let response = daemon.call(Request::Destroy { name: "a".into() });
    assert_eq!(response.error, 0);
    assert!(daemon
        .call(Request::List { filter: None })
        .list
        .unwrap()
        .is_empty());
}

#[test]
fn unknown_container_and_property_codes() {
    let daemon = TestDaemon::new();

    let response = daemon.call(Request::Start { name: "ghost".into() });
    assert_eq!(response.kind(), ErrorKind::ContainerDoesNotExist);

    daemon.call(Request::Create { name: "a".into() });
    let response = daemon.call(Request::GetProperty {
        name: "a".into(),
        property: "no_such".into(),
    });
    assert_eq!(response.kind(), ErrorKind::InvalidProperty);

    let response = daemon.call(Request::GetData {
        name: "a".into(),
        data: "no_such".into(),
    });
    assert_eq!(response.kind(), ErrorKind::InvalidData);

    // state-gated datum while stopped
    let response = daemon.call(Request::GetData {
        name: "a".into(),
        data: "exit_status".into(),
    });
    assert_eq!(response.kind(), ErrorKind::InvalidState);
}

#[test]
fn name_validation_boundaries() {
    let daemon = TestDaemon::new();

    let ok = "x".repeat(128);
    assert_eq!(daemon.call(Request::Create { name: ok }).error, 0);

    let too_long = "x".repeat(129);
    let response = daemon.call(Request::Create { name: too_long });
    assert_eq!(response.kind(), ErrorKind::InvalidValue);

    let response = daemon.call(Request::Create { name: "bad name".into() });
    assert_eq!(response.kind(), ErrorKind::InvalidValue);
}

#[test]
fn batch_get_is_partial_failure_tolerant() {
    let daemon = TestDaemon::new();
    daemon.call(Request::Create { name: "a".into() });
    daemon.call(Request::SetProperty {
        name: "a".into(),
        property: "command".into(),
        value: "true".into(),
    });

    let response = daemon.call(Request::Get {
        names: vec!["a".into(), "ghost".into()],
        variables: vec!["command".into(), "state".into()],
    });
    assert_eq!(response.error, 0);

    let batch = response.batch.unwrap();
    assert_eq!(batch[0].name, "a");
    assert_eq!(batch[0].values[0].value.as_deref(), Some("true"));
    assert_eq!(batch[0].values[1].value.as_deref(), Some("stopped"));

    assert_eq!(batch[1].name, "ghost");
    for value in &batch[1].values {
        assert_eq!(
            ErrorKind::from_code(value.error),
            ErrorKind::ContainerDoesNotExist
        );
    }
}

#[test]
fn canonical_value_round_trip() {
    let daemon = TestDaemon::new();
    daemon.call(Request::Create { name: "a".into() });

    // Unit suffixes canonicalise to plain bytes.
    let response = daemon.call(Request::SetProperty {
        name: "a".into(),
        property: "memory_limit".into(),
        value: "32M".into(),
    });
    assert_eq!(response.error, 0);

    let response = daemon.call(Request::GetProperty {
        name: "a".into(),
        property: "memory_limit".into(),
    });
    assert_eq!(response.value.unwrap(), (32u64 << 20).to_string());
}

#[test]
fn permissions_follow_ownership() {
    let daemon = TestDaemon::new();
    let owner = Cred::new(1000, 1000);
    let stranger = Cred::new(2000, 2000);

    assert_eq!(
        daemon
            .call_as(Request::Create { name: "mine".into() }, &owner)
            .error,
        0
    );

    let response = daemon.call_as(
        Request::SetProperty {
            name: "mine".into(),
            property: "command".into(),
            value: "true".into(),
        },
        &stranger,
    );
    assert_eq!(response.kind(), ErrorKind::Permission);

    let response = daemon.call_as(Request::Destroy { name: "mine".into() }, &stranger);
    assert_eq!(response.kind(), ErrorKind::Permission);

    // reads are not ownership-gated
    let response = daemon.call_as(
        Request::GetProperty {
            name: "mine".into(),
            property: "command".into(),
        },
        &stranger,
    );
    assert_eq!(response.error, 0);

    assert_eq!(
        daemon
            .call_as(Request::Destroy { name: "mine".into() }, &owner)
            .error,
        0
    );
}

#[test]
fn wait_poll_and_fire_on_destroy() {
    let daemon = TestDaemon::new();
    daemon.call(Request::Create { name: "w".into() });

    // 0 timeout polls: nothing has died.
    let response = daemon.call(Request::Wait {
        names: vec!["w".into()],
        timeout_ms: 0,
    });
    assert_eq!(response.error, 0);
    assert_eq!(response.name.as_deref(), Some(""));

    // Destroy from another thread fires a blocked wait.
    let holder = daemon.holder.clone();
    let destroyer = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(50));
        holder.destroy("/w", &Cred::root()).unwrap();
    });

    let response = daemon.call(Request::Wait {
        names: vec!["w".into()],
        timeout_ms: 5000,
    });
    destroyer.join().unwrap();
    assert_eq!(response.error, 0);
    assert_eq!(response.name.as_deref(), Some("w"));
}

#[test]
fn subtree_rules_and_invariants() {
    let daemon = TestDaemon::new();
    daemon.call(Request::Create { name: "a".into() });
    daemon.call(Request::Create { name: "a/b".into() });
    daemon.call(Request::Create { name: "a/b/c".into() });

    // Stopping a name that does not exist under a real parent errors.
    let response = daemon.call(Request::Stop {
        name: "a/b/ghost".into(),
    });
    assert_eq!(response.kind(), ErrorKind::ContainerDoesNotExist);

    check_invariants(&daemon.holder).unwrap();

    // Destroying the top removes the whole subtree.
    assert_eq!(daemon.call(Request::Destroy { name: "a".into() }).error, 0);
    assert!(daemon
        .call(Request::List { filter: None })
        .list
        .unwrap()
        .is_empty());
    check_invariants(&daemon.holder).unwrap();
}

#[test]
fn version_and_lists() {
    let daemon = TestDaemon::new();

    let response = daemon.call(Request::Version);
    assert_eq!(response.value.as_deref(), Some(env!("CARGO_PKG_VERSION")));

    let properties = daemon.call(Request::PropertyList).described.unwrap();
    assert!(properties.iter().any(|(n, _)| n == "command"));
    assert!(properties.iter().any(|(n, _)| n == "memory_limit"));

    let data = daemon.call(Request::DataList).described.unwrap();
    assert!(data.iter().any(|(n, _)| n == "state"));
    assert!(data.iter().any(|(n, _)| n == "exit_status"));
}
