//! Wait Subscriptions
//!
//! A client's `wait` call registers one waiter against every container it
//! names (or that its wildcard matched at registration time). The waiter
//! fires once, on the first matching container that dies or is
//! destroyed, and is then dead for every other container holding it.
//! Containers hold waiters weakly: a disconnected client drops the only
//! strong reference and the weak entries fall out on the next sweep.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use crossbeam_channel::{bounded, Receiver, Sender};

/// What a fired waiter tells the blocked client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaitResult {
    /// Container that died or was destroyed, client-visible name.
    pub name: String,
}

/// One pending `wait` call.
#[derive(Debug)]
pub struct Waiter {
    patterns: Vec<String>,
    fired: AtomicBool,
    tx: Sender<WaitResult>,
}

impl Waiter {
    /// Build a waiter and the receiver its client blocks on.
    pub fn new(patterns: Vec<String>) -> (Arc<Waiter>, Receiver<WaitResult>) {
        let (tx, rx) = bounded(1);
        (
            Arc::new(Waiter {
                patterns,
                fired: AtomicBool::new(false),
                tx,
            }),
            rx,
        )
    }

    /// Does this waiter target the given container?
    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| glob_match(p, name))
    }

    /// Fire once; later calls are no-ops.
    pub fn fire(&self, name: &str) {
        if !self.fired.swap(true, Ordering::AcqRel) {
            let _ = self.tx.send(WaitResult {
                name: name.to_string(),
            });
        }
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}

/// Per-container list of weak waiter handles.
#[derive(Debug, Default)]
pub struct WaiterSet {
    waiters: Vec<Weak<Waiter>>,
}

impl WaiterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, waiter: &Arc<Waiter>) {
        self.waiters.push(Arc::downgrade(waiter));
    }

    /// Fire every live, matching waiter for `name`; prune the rest.
    pub fn notify(&mut self, name: &str) {
        self.waiters.retain(|weak| {
            let Some(waiter) = weak.upgrade() else {
                return false;
            };
            if waiter.is_fired() {
                return false;
            }
            if waiter.matches(name) {
                waiter.fire(name);
                return false;
            }
            true
        });
    }

    /// Drop dead and fired entries.
    pub fn cleanup(&mut self) {
        self.waiters
            .retain(|weak| weak.upgrade().is_some_and(|w| !w.is_fired()));
    }

    pub fn len(&self) -> usize {
        self.waiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

/// `*` matches any run of characters, everything else is literal.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let name: Vec<char> = name.chars().collect();

    // Iterative star matching with backtracking.
    let (mut p, mut n) = (0usize, 0usize);
    let mut star: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && (pattern[p] == name[n]) {
            p += 1;
            n += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "/a/b"));
        assert!(glob_match("/a/*", "/a/b"));
        assert!(glob_match("/a/*", "/a/b/c"));
        assert!(glob_match("/a", "/a"));
        assert!(!glob_match("/a", "/b"));
        assert!(!glob_match("/a/*", "/b/c"));
        assert!(glob_match("*/worker-*", "/prod/worker-3"));
    }

    #[test]
    fn test_fire_once() {
        let (waiter, rx) = Waiter::new(vec!["/a".into()]);
        waiter.fire("/a");
        waiter.fire("/a");
        assert_eq!(rx.recv().unwrap().name, "/a");
        assert!(rx.try_recv().is_err());
        assert!(waiter.is_fired());
    }

    #[test]
    fn test_notify_fires_matching_only() {
        let (waiter, rx) = Waiter::new(vec!["/a".into(), "/b".into()]);
        let mut set = WaiterSet::new();
        set.add(&waiter);

        set.notify("/c");
        assert!(rx.try_recv().is_err());
        assert_eq!(set.len(), 1);

        set.notify("/b");
        assert_eq!(rx.recv().unwrap().name, "/b");
        assert!(set.is_empty());
    }

    #[test]
    fn test_fired_waiter_leaves_other_sets() {
        let (waiter, rx) = Waiter::new(vec!["*".into()]);
        let mut set_a = WaiterSet::new();
        let mut set_b = WaiterSet::new();
        set_a.add(&waiter);
        set_b.add(&waiter);

        set_a.notify("/a");
        assert_eq!(rx.recv().unwrap().name, "/a");

        // The other set drops it on its next pass.
        set_b.notify("/b");
        assert!(set_b.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_dropped_client_is_pruned() {
        let (waiter, _rx) = Waiter::new(vec!["*".into()]);
        let mut set = WaiterSet::new();
        set.add(&waiter);
        drop(waiter);

        set.cleanup();
        assert!(set.is_empty());
    }

    #[test]
    fn test_poll_receiver_timeout() {
        let (_waiter, rx) = Waiter::new(vec!["/x".into()]);
        assert!(rx.recv_timeout(Duration::from_millis(10)).is_err());
    }
}
