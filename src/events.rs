//! Slave Event Loop
//!
//! One dedicated thread owns every kernel event source: the exit pipe
//! inherited from the reaper and the per-container OOM eventfds. It
//! never takes a container lock; each firing becomes an
//! [`Event`] pushed onto a channel. Exit and OOM events are consumed by a
//! single delivery thread so container state updates stay linearisable
//! with respect to exit order; everything else can go to the worker pool.
//!
//! The loop also keeps the timer heap: respawn delays, dead-container
//! aging, periodic link refresh.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::os::fd::{BorrowedFd, RawFd};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info, warn};
use nix::sys::epoll::{Epoll, EpollCreateFlags, EpollEvent, EpollFlags, EpollTimeout};

use crate::error::Error;

/// Work generated by the event loop, consumed under container locks
/// elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// A task exit forwarded by the reaper; must be acked after handling.
    Exit { pid: i32, status: i32 },
    /// The kernel OOM-killed inside a container's memory cgroup.
    Oom { name: String },
    /// A respawn delay elapsed.
    Respawn { name: String },
    /// A dead container's aging time elapsed.
    AgeOut { name: String },
    /// Re-scan network links and replay classes.
    RefreshLinks,
    /// The daemon should exit its loops.
    Shutdown,
}

/// Requests into the event loop.
#[derive(Debug)]
pub enum Control {
    /// Fire `event` after `delay`.
    Schedule { delay: Duration, event: Event },
    /// Watch an OOM eventfd for a container.
    RegisterOom { name: String, fd: RawFd },
    /// Stop watching a container's OOM eventfd.
    UnregisterOom { name: String },
    /// Tear the loop down.
    Quit,
}

/// Cloneable handle used by containers and the RPC layer.
#[derive(Debug, Clone)]
pub struct EventHandle {
    control_tx: Sender<Control>,
}

impl EventHandle {
    pub fn schedule(&self, delay: Duration, event: Event) {
        let _ = self.control_tx.send(Control::Schedule { delay, event });
    }

    pub fn register_oom(&self, name: String, fd: RawFd) {
        let _ = self.control_tx.send(Control::RegisterOom { name, fd });
    }

    pub fn unregister_oom(&self, name: &str) {
        let _ = self.control_tx.send(Control::UnregisterOom {
            name: name.to_string(),
        });
    }

    pub fn quit(&self) {
        let _ = self.control_tx.send(Control::Quit);
    }
}

/// Timer entries ordered soonest-first.
#[derive(Debug, PartialEq, Eq)]
struct Timer {
    fire_at: Instant,
    event: Event,
}

impl Ord for Timer {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fire_at.cmp(&other.fire_at)
    }
}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// The epoll-driven loop.
pub struct EventLoop {
    epoll: Epoll,
    /// Pipe from the reaper carrying (pid, status) tuples.
    exit_fd: RawFd,
    exit_buf: Vec<u8>,
    /// fd → container name for armed OOM monitors.
    oom_fds: HashMap<u64, String>,
    timers: BinaryHeap<Reverse<Timer>>,
    control_rx: Receiver<Control>,
    /// Exit and OOM events: single consumer, FIFO.
    delivery_tx: Sender<Event>,
    /// Everything else: the worker pool.
    work_tx: Sender<Event>,
}

const EXIT_FD_TOKEN: u64 = u64::MAX;

impl EventLoop {
    /// Build the loop and its handle. `exit_fd` is the inherited event
    /// pipe read end.
    pub fn new(
        exit_fd: RawFd,
        delivery_tx: Sender<Event>,
        work_tx: Sender<Event>,
    ) -> Result<(EventLoop, EventHandle), Error> {
        let epoll = Epoll::new(EpollCreateFlags::EPOLL_CLOEXEC)?;

        // SAFETY: exit_fd is the inherited reaper pipe, open for the
        // daemon's lifetime.
        let borrowed = unsafe { BorrowedFd::borrow_raw(exit_fd) };
        epoll.add(
            borrowed,
            EpollEvent::new(EpollFlags::EPOLLIN, EXIT_FD_TOKEN),
        )?;

        let (control_tx, control_rx) = crossbeam_channel::unbounded();

        Ok((
            EventLoop {
                epoll,
                exit_fd,
                exit_buf: Vec::new(),
                oom_fds: HashMap::new(),
                timers: BinaryHeap::new(),
                control_rx,
                delivery_tx,
                work_tx,
            },
            EventHandle { control_tx },
        ))
    }

    /// Run until [`Control::Quit`]. Never touches container state.
    pub fn run(mut self) {
        info!("event loop started");
        let mut events = [EpollEvent::empty(); 16];

        loop {
            if !self.drain_control() {
                break;
            }
            self.fire_timers();

            let timeout = self.next_timeout();
            let n = match self.epoll.wait(&mut events, timeout) {
                Ok(n) => n,
                Err(nix::Error::EINTR) => continue,
                Err(e) => {
                    warn!("epoll wait: {}", e);
                    break;
                }
            };

            for event in events.iter().take(n) {
                match event.data() {
                    EXIT_FD_TOKEN => self.read_exits(),
                    token => {
                        if let Some(name) = self.oom_fds.get(&token) {
                            debug!("oom event for {}", name);
                            let _ = self.delivery_tx.send(Event::Oom { name: name.clone() });
                        }
                    }
                }
            }
        }
        info!("event loop stopped");
    }

    /// Apply queued control messages; false means quit.
    fn drain_control(&mut self) -> bool {
        while let Ok(control) = self.control_rx.try_recv() {
            match control {
                Control::Schedule { delay, event } => {
                    self.timers.push(Reverse(Timer {
                        fire_at: Instant::now() + delay,
                        event,
                    }));
                }
                Control::RegisterOom { name, fd } => {
                    // SAFETY: the fd belongs to a live OomMonitor owned by
                    // the container; UnregisterOom precedes its close.
                    let borrowed = unsafe { BorrowedFd::borrow_raw(fd) };
                    let flags = EpollFlags::EPOLLIN | EpollFlags::EPOLLET;
                    match self.epoll.add(borrowed, EpollEvent::new(flags, fd as u64)) {
                        Ok(()) => {
                            self.oom_fds.insert(fd as u64, name);
                        }
                        Err(e) => warn!("register oom fd for {}: {}", name, e),
                    }
                }
                Control::UnregisterOom { name } => {
                    let token = self
                        .oom_fds
                        .iter()
                        .find(|(_, n)| **n == name)
                        .map(|(t, _)| *t);
                    if let Some(token) = token {
                        self.oom_fds.remove(&token);
                        // SAFETY: the fd was valid at registration; EBADF
                        // on an already-closed fd is harmless here.
                        let borrowed = unsafe { BorrowedFd::borrow_raw(token as RawFd) };
                        let _ = self.epoll.delete(borrowed);
                    }
                }
                Control::Quit => {
                    let _ = self.delivery_tx.send(Event::Shutdown);
                    let _ = self.work_tx.send(Event::Shutdown);
                    return false;
                }
            }
        }
        true
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse(timer)) = self.timers.peek() {
            if timer.fire_at > now {
                break;
            }
            let Reverse(timer) = self.timers.pop().unwrap();
            debug!("timer fired: {:?}", timer.event);
            let _ = self.work_tx.send(timer.event);
        }
    }

    fn next_timeout(&self) -> EpollTimeout {
        let cap = Duration::from_millis(100);
        let until = match self.timers.peek() {
            Some(Reverse(timer)) => timer
                .fire_at
                .saturating_duration_since(Instant::now())
                .min(cap),
            None => cap,
        };
        EpollTimeout::from(until.as_millis().min(u16::MAX as u128) as u16)
    }

    /// Read the exit pipe once; each tuple is two native-endian i32
    /// writes. Level-triggered epoll re-fires if more bytes remain.
    fn read_exits(&mut self) {
        let mut buf = [0u8; 512];
        // SAFETY: buf is writable for its full length; exit_fd stays
        // open for the daemon's lifetime.
        let n = unsafe {
            libc::read(
                self.exit_fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            )
        };
        if n > 0 {
            self.exit_buf.extend_from_slice(&buf[..n as usize]);
        }

        while self.exit_buf.len() >= 8 {
            let pid = i32::from_ne_bytes(self.exit_buf[0..4].try_into().unwrap());
            let status = i32::from_ne_bytes(self.exit_buf[4..8].try_into().unwrap());
            self.exit_buf.drain(0..8);
            let _ = self.delivery_tx.send(Event::Exit { pid, status });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;
    use std::os::fd::IntoRawFd;

    #[test]
    fn test_exit_tuples_are_forwarded_in_order() {
        let (read_end, write_end) = pipe().unwrap();
        let (delivery_tx, delivery_rx) = crossbeam_channel::unbounded();
        let (work_tx, _work_rx) = crossbeam_channel::unbounded();

        let (event_loop, handle) =
            EventLoop::new(read_end.into_raw_fd(), delivery_tx, work_tx).unwrap();

        let mut payload = Vec::new();
        for (pid, status) in [(101i32, 0i32), (102, 9), (103, 256)] {
            payload.extend_from_slice(&pid.to_ne_bytes());
            payload.extend_from_slice(&status.to_ne_bytes());
        }
        nix::unistd::write(&write_end, &payload).unwrap();

        let worker = std::thread::spawn(move || event_loop.run());

        for (pid, status) in [(101i32, 0i32), (102, 9), (103, 256)] {
            let event = delivery_rx
                .recv_timeout(Duration::from_secs(2))
                .expect("exit event");
            assert_eq!(event, Event::Exit { pid, status });
        }

        handle.quit();
        assert_eq!(
            delivery_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
            Event::Shutdown
        );
        worker.join().unwrap();
    }

    #[test]
    fn test_timers_fire_through_work_channel() {
        let (read_end, _write_end) = pipe().unwrap();
        let (delivery_tx, _delivery_rx) = crossbeam_channel::unbounded();
        let (work_tx, work_rx) = crossbeam_channel::unbounded();

        let (event_loop, handle) =
            EventLoop::new(read_end.into_raw_fd(), delivery_tx, work_tx).unwrap();
        let worker = std::thread::spawn(move || event_loop.run());

        handle.schedule(
            Duration::from_millis(20),
            Event::Respawn { name: "/r".into() },
        );
        let event = work_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(event, Event::Respawn { name: "/r".into() });

        handle.quit();
        worker.join().unwrap();
    }
}
