//! Synchronization wrappers exposed to hosts and used for engine
//! bookkeeping.
//!
//! A poisoned lock means a host callback panicked while holding engine
//! state; that state can no longer be trusted, so poisoning is fatal.

use super::fatal;
use std::sync::{Condvar, MutexGuard};
use std::time::Instant;

#[derive(Debug, Default)]
pub struct Mutex<T> {
    inner: std::sync::Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(value: T) -> Self {
        Self {
            inner: std::sync::Mutex::new(value),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(_) => fatal("mutex poisoned"),
        }
    }

    pub fn into_inner(self) -> T {
        match self.inner.into_inner() {
            Ok(value) => value,
            Err(_) => fatal("mutex poisoned"),
        }
    }
}

/// An auto-reset event: `signal` wakes one pending or future `wait`.
#[derive(Debug, Default)]
pub struct Event {
    signalled: std::sync::Mutex<bool>,
    cond: Condvar,
}

impl Event {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        let mut signalled = self.lock();
        *signalled = true;
        self.cond.notify_one();
    }

    /// Block until signalled or until `deadline` passes. Returns whether the
    /// event was signalled; a successful wait resets it.
    pub fn wait(&self, deadline: Option<Instant>) -> bool {
        let mut signalled = self.lock();
        while !*signalled {
            match deadline {
                None => {
                    signalled = match self.cond.wait(signalled) {
                        Ok(guard) => guard,
                        Err(_) => fatal("event mutex poisoned"),
                    };
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    signalled = match self.cond.wait_timeout(signalled, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(_) => fatal("event mutex poisoned"),
                    };
                }
            }
        }
        *signalled = false;
        true
    }

    fn lock(&self) -> MutexGuard<'_, bool> {
        match self.signalled.lock() {
            Ok(guard) => guard,
            Err(_) => fatal("event mutex poisoned"),
        }
    }
}
