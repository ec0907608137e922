// This file is part of Moonfire NVR, a security camera network video recorder.
// Copyright (C) 2021 The Moonfire NVR Authors; see AUTHORS and LICENSE.txt.
// SPDX-License-Identifier: GPL-v3.0-or-later WITH GPL-3.0-linking-exception.

//! Tools for propagating a graceful shutdown signal through the program,
//! and for a process-wide coordinator to know when every registered
//! component has actually finished tearing down.
//!
//! The `Receiver` half can be cloned, checked, and blocked on from
//! synchronous code without going through an async runtime, since most of
//! the core's workers are plain OS threads.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use slab::Slab;

#[derive(Debug)]
pub struct ShutdownError;

impl std::fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("shutdown requested")
    }
}

impl std::error::Error for ShutdownError {}

struct Inner {
    /// `None` iff shutdown has already happened.
    wakers: Mutex<Option<Slab<()>>>,
    condvar: Condvar,
}

/// Dropping this requests shutdown of every clone of the paired `Receiver`.
pub struct Sender(Arc<Inner>);

impl Drop for Sender {
    fn drop(&mut self) {
        let mut wakers = self
            .0
            .wakers
            .lock()
            .unwrap()
            .take()
            .expect("only the single Sender takes the slab");
        wakers.clear();
        self.0.condvar.notify_all();
    }
}

#[derive(Clone)]
pub struct Receiver(Arc<Inner>);

impl Receiver {
    pub fn check(&self) -> Result<(), ShutdownError> {
        if self.0.wakers.lock().unwrap().is_none() {
            Err(ShutdownError)
        } else {
            Ok(())
        }
    }

    /// Blocks the current thread for up to `timeout`, waking immediately
    /// (with `Err(ShutdownError)`) if shutdown is requested in the
    /// meantime. This is the cancellable-wait primitive the reconnect
    /// backoff and the recording engine's post-roll wait use instead of a
    /// bare `sleep`.
    pub fn wait_for(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let guard = self.0.wakers.lock().unwrap();
        if guard.is_none() {
            return Err(ShutdownError);
        }
        let (guard, timeout_result) = self
            .0
            .condvar
            .wait_timeout_while(guard, timeout, |wakers| wakers.is_some())
            .unwrap();
        if guard.is_none() {
            Err(ShutdownError)
        } else {
            debug_assert!(timeout_result.timed_out());
            Ok(())
        }
    }
}

/// Returns a sender and receiver pair for graceful shutdown.
///
/// Dropping the sender requests shutdown of every clone of the receiver.
pub fn channel() -> (Sender, Receiver) {
    let inner = Arc::new(Inner {
        wakers: Mutex::new(Some(Slab::new())),
        condvar: Condvar::new(),
    });
    (Sender(inner.clone()), Receiver(inner))
}

/// Lifecycle state of a component registered with the [`Coordinator`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ComponentState {
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Tracks the lifecycle state of every registered component (one per
/// stream supervisor, plus the watchdog) so that a global shutdown can
/// block until everything has actually finished tearing down, or until a
/// deadline passes.
///
/// This is the "process-wide shutdown coordinator" of the stream
/// supervisor design: each supervisor registers on start and updates its
/// state on every FSM transition; `shutdown` blocks until every registered
/// component reaches `Stopped` or the deadline passes. While
/// `shutdown_initiated()` is true, no supervisor may begin a new
/// `Connecting` transition.
pub struct Coordinator {
    states: Mutex<HashMap<String, ComponentState>>,
    shutdown_initiated: std::sync::atomic::AtomicBool,
    condvar: Condvar,
}

impl Default for Coordinator {
    fn default() -> Self {
        Coordinator {
            states: Mutex::new(HashMap::new()),
            shutdown_initiated: std::sync::atomic::AtomicBool::new(false),
            condvar: Condvar::new(),
        }
    }
}

impl Coordinator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, component_id: &str) {
        self.states
            .lock()
            .unwrap()
            .insert(component_id.to_string(), ComponentState::Starting);
    }

    pub fn set_state(&self, component_id: &str, state: ComponentState) {
        let mut states = self.states.lock().unwrap();
        states.insert(component_id.to_string(), state);
        if state == ComponentState::Stopped {
            drop(states);
            self.condvar.notify_all();
        }
    }

    pub fn unregister(&self, component_id: &str) {
        let mut states = self.states.lock().unwrap();
        states.remove(component_id);
        drop(states);
        self.condvar.notify_all();
    }

    pub fn shutdown_initiated(&self) -> bool {
        self.shutdown_initiated
            .load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Marks shutdown as initiated. No supervisor may start a new
    /// `Connecting` transition once this returns.
    pub fn begin_shutdown(&self) {
        self.shutdown_initiated
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Blocks until every registered component reaches `Stopped`, or
    /// `deadline` elapses, whichever comes first. Returns the set of
    /// component ids still not `Stopped`, which is empty on a clean
    /// shutdown.
    pub fn wait_all_stopped(&self, deadline: Duration) -> Vec<String> {
        self.begin_shutdown();
        let start = std::time::Instant::now();
        loop {
            let states = self.states.lock().unwrap();
            let remaining: Vec<String> = states
                .iter()
                .filter(|(_, s)| **s != ComponentState::Stopped)
                .map(|(id, _)| id.clone())
                .collect();
            if remaining.is_empty() || start.elapsed() >= deadline {
                return remaining;
            }
            let wait_for = deadline.saturating_sub(start.elapsed());
            drop(states);
            std::thread::sleep(wait_for.min(Duration::from_millis(100)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_check() {
        let (tx, rx) = channel();
        rx.check().unwrap();
        drop(tx);
        rx.check().unwrap_err();
    }

    #[test]
    fn blocking_wait_returns_on_drop() {
        let (tx, rx) = channel();
        let h = std::thread::spawn(move || rx.wait_for(Duration::from_secs(1000)));
        std::thread::sleep(Duration::from_millis(20));
        drop(tx);
        h.join().unwrap().unwrap_err();
    }

    #[test]
    fn coordinator_waits_for_all_stopped() {
        let c = Coordinator::new();
        c.register("cam1");
        c.register("cam2");
        let c2 = c.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            c2.set_state("cam1", ComponentState::Stopped);
            std::thread::sleep(Duration::from_millis(20));
            c2.set_state("cam2", ComponentState::Stopped);
        });
        let remaining = c.wait_all_stopped(Duration::from_secs(2));
        h.join().unwrap();
        assert!(remaining.is_empty());
        assert!(c.shutdown_initiated());
    }
}
