//! Master Process
//!
//! The long-lived outer process. It is the `PR_SET_CHILD_SUBREAPER` of
//! every container task and the only caller of `wait` for them; the
//! restartable slave process does everything else. The two talk over a
//! pair of pipes pinned at fixed descriptors in the slave:
//!
//! - event fd (**128**, master → slave): `(pid, status)` tuples for every
//!   reaped child
//! - ack fd (**129**, slave → master): `pid` written back once the exit
//!   has been applied and persisted
//!
//! Every exit stays in `pid_to_status` until acked, and is replayed to a
//! freshly spawned slave, so a slave crash can never lose an exit.
//! SIGHUP re-execs the slave (binary upgrade); SIGINT shuts down.

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{error, info, warn};
use nix::fcntl::OFlag;
use nix::sys::signal::{kill, sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd::{pipe, pipe2, Pid};

use crate::config::WardenConfig;
use crate::error::Error;

/// Event pipe read end, as the slave sees it.
pub const REAP_EVT_FD: RawFd = 128;
/// Ack pipe write end, as the slave sees it.
pub const REAP_ACK_FD: RawFd = 129;

static DONE: AtomicBool = AtomicBool::new(false);
static UPDATE: AtomicBool = AtomicBool::new(false);

extern "C" fn on_shutdown(_: libc::c_int) {
    DONE.store(true, Ordering::SeqCst);
}

extern "C" fn on_update(_: libc::c_int) {
    UPDATE.store(true, Ordering::SeqCst);
}

extern "C" fn on_alarm(_: libc::c_int) {
    // Only here to interrupt the blocking wait.
}

fn install_handlers() -> Result<(), Error> {
    let shutdown = SigAction::new(
        SigHandler::Handler(on_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let update = SigAction::new(
        SigHandler::Handler(on_update),
        SaFlags::empty(),
        SigSet::empty(),
    );
    let alarm = SigAction::new(
        SigHandler::Handler(on_alarm),
        SaFlags::empty(),
        SigSet::empty(),
    );

    // SAFETY: the handlers only touch atomics, which is async-signal-safe.
    unsafe {
        sigaction(Signal::SIGINT, &shutdown)?;
        sigaction(Signal::SIGTERM, &shutdown)?;
        sigaction(Signal::SIGHUP, &update)?;
        sigaction(Signal::SIGALRM, &alarm)?;
        // The slave may die while the master writes the event pipe.
        sigaction(
            Signal::SIGPIPE,
            &SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty()),
        )?;
    }
    Ok(())
}

/// Outcome of one slave generation.
enum SlaveExit {
    /// The slave exited; raw status.
    Exited(i32),
    /// Shutdown was requested while it ran.
    Shutdown,
    /// SIGHUP: the master should re-exec itself.
    Update,
}

/// Entry point of the master. Returns the process exit code.
pub fn run_master(config: &WardenConfig) -> i32 {
    if let Err(e) = install_handlers() {
        error!("signal setup: {}", e);
        return 1;
    }

    // SAFETY: prctl(2) with PR_SET_CHILD_SUBREAPER takes no pointers.
    if unsafe { libc::prctl(libc::PR_SET_CHILD_SUBREAPER, 1, 0, 0, 0) } < 0 {
        error!("cannot become a subreaper");
        return 1;
    }

    if let Err(e) = fs::write(&config.master_pidfile, std::process::id().to_string()) {
        warn!("write pidfile: {}", e);
    }

    info!("master started (pid {})", std::process::id());
    let mut pid_to_status: HashMap<i32, i32> = HashMap::new();
    let mut code = 0;

    while !DONE.load(Ordering::SeqCst) {
        match spawn_slave(config, &mut pid_to_status) {
            Ok(SlaveExit::Shutdown) => break,
            Ok(SlaveExit::Update) => {
                info!("re-executing master for update");
                let _ = fs::remove_file(&config.master_pidfile);
                let err = Command::new("/proc/self/exe").exec();
                error!("re-exec failed: {}", err);
                code = 1;
                break;
            }
            Ok(SlaveExit::Exited(status)) => {
                warn!("slave exited with status {}, respawning", status);
                std::thread::sleep(Duration::from_millis(config.slave_respawn_delay_ms));
            }
            Err(e) => {
                error!("spawn slave: {}", e);
                std::thread::sleep(Duration::from_millis(config.slave_respawn_delay_ms));
            }
        }
    }

    let _ = fs::remove_file(&config.master_pidfile);
    info!("master stopped");
    code
}

/// Fork and exec one slave, then pump exits to it until it dies or the
/// master is told to stop.
fn spawn_slave(
    config: &WardenConfig,
    pid_to_status: &mut HashMap<i32, i32>,
) -> Result<SlaveExit, Error> {
    let (evt_read, evt_write) = pipe()?;
    let (ack_read, ack_write) = pipe2(OFlag::O_NONBLOCK)?;

    let evt_read_fd = evt_read.as_raw_fd();
    let ack_write_fd = ack_write.as_raw_fd();

    let mut command = Command::new("/proc/self/exe");
    command.arg("--slave");
    // SAFETY: dup2 is async-signal-safe; the target descriptors are fixed
    // numbers above the stdio range, and dup2 clears O_CLOEXEC so the
    // slave inherits them across exec.
    unsafe {
        command.pre_exec(move || {
            if libc::dup2(evt_read_fd, REAP_EVT_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::dup2(ack_write_fd, REAP_ACK_FD) < 0 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let child = command
        .spawn()
        .map_err(|e| Error::new(crate::error::ErrorKind::Unknown, format!("spawn: {}", e)))?;
    let slave_pid = child.id() as i32;
    // The reaper waits for everything by hand; Child::drop must not.
    std::mem::forget(child);

    drop(evt_read);
    drop(ack_write);
    info!("spawned slave {}", slave_pid);

    // A fresh slave first sees every un-acked exit, oldest knowledge
    // first, before anything new.
    for (pid, status) in pid_to_status.iter() {
        send_exit(&evt_write, *pid, *status, pid_to_status.len());
    }

    loop {
        receive_acks(&ack_read, pid_to_status);

        if DONE.load(Ordering::SeqCst) || UPDATE.load(Ordering::SeqCst) {
            let _ = kill(Pid::from_raw(slave_pid), Signal::SIGINT);
            let mut status = 0i32;
            // SAFETY: status is a local out-parameter; slave_pid is our child.
            unsafe { libc::waitpid(slave_pid, &mut status, 0) };
            receive_acks(&ack_read, pid_to_status);
            return Ok(if UPDATE.swap(false, Ordering::SeqCst) {
                SlaveExit::Update
            } else {
                SlaveExit::Shutdown
            });
        }

        // Interrupt the blocking wait once a second to drain acks and
        // notice shutdown requests.
        // SAFETY: alarm(2) takes no pointers.
        unsafe { libc::alarm(1) };

        let mut status = 0i32;
        // SAFETY: status is a local out-parameter; -1 waits for any child.
        let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
        // SAFETY: cancel the pending alarm.
        unsafe { libc::alarm(0) };

        if pid < 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            if errno == libc::EINTR || errno == libc::ECHILD {
                continue;
            }
            return Err(std::io::Error::last_os_error().into());
        }

        if pid == slave_pid {
            return Ok(SlaveExit::Exited(status));
        }

        pid_to_status.insert(pid, status);
        send_exit(&evt_write, pid, status, pid_to_status.len());
    }
}

fn send_exit(evt_write: &OwnedFd, pid: i32, status: i32, queued: usize) {
    info!("deliver exit of {} status {} ({} queued)", pid, status, queued);
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&pid.to_ne_bytes());
    buf[4..8].copy_from_slice(&status.to_ne_bytes());
    // SAFETY: buf lives across the call; a dead slave yields EPIPE which
    // is ignored (SIGPIPE is masked) and the tuple stays buffered.
    let n = unsafe {
        libc::write(
            evt_write.as_raw_fd(),
            buf.as_ptr() as *const libc::c_void,
            buf.len(),
        )
    };
    if n != 8 {
        warn!("short write to event pipe for pid {}", pid);
    }
}

fn receive_acks(ack_read: &OwnedFd, pid_to_status: &mut HashMap<i32, i32>) {
    loop {
        let mut buf = [0u8; 4];
        // SAFETY: buf is 4 writable bytes; the fd is non-blocking.
        let n = unsafe {
            libc::read(
                ack_read.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n != 4 {
            return;
        }
        let pid = i32::from_ne_bytes(buf);
        if pid_to_status.remove(&pid).is_some() {
            info!("ack for {}", pid);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_fds_are_out_of_stdio_range() {
        assert!(REAP_EVT_FD > 2);
        assert!(REAP_ACK_FD > 2);
        assert_ne!(REAP_EVT_FD, REAP_ACK_FD);
    }

    #[test]
    fn test_ack_removes_buffered_exit() {
        let (ack_read, ack_write) = pipe2(OFlag::O_NONBLOCK).unwrap();
        let mut pid_to_status = HashMap::from([(42, 0), (43, 9)]);

        nix::unistd::write(&ack_write, &42i32.to_ne_bytes()).unwrap();
        receive_acks(&ack_read, &mut pid_to_status);

        assert!(!pid_to_status.contains_key(&42));
        assert!(pid_to_status.contains_key(&43));
    }

    #[test]
    fn test_exit_tuple_encoding() {
        let (evt_read, evt_write) = pipe().unwrap();
        send_exit(&evt_write, 7, 256, 1);

        let mut buf = [0u8; 8];
        nix::unistd::read(evt_read.as_raw_fd(), &mut buf).unwrap();
        assert_eq!(i32::from_ne_bytes(buf[0..4].try_into().unwrap()), 7);
        assert_eq!(i32::from_ne_bytes(buf[4..8].try_into().unwrap()), 256);
    }
}
