//! One-shot latched signal shared between a single writer and many readers.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// A value that is set at most once and can be awaited from any thread.
///
/// Waiters that start waiting before `fire` still observe the value because
/// the check and the wait happen under the same lock.
#[derive(Debug)]
pub struct Latch<T> {
    value: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T: Clone> Latch<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// Set the value. Returns false if the latch already fired; the stored
    /// value is left untouched in that case.
    pub fn fire(&self, value: T) -> bool {
        let mut slot = self.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(value);
        self.cond.notify_all();
        true
    }

    pub fn is_fired(&self) -> bool {
        self.lock().is_some()
    }

    pub fn peek(&self) -> Option<T> {
        self.lock().clone()
    }

    /// Block until the latch fires.
    pub fn wait(&self) -> T {
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return value.clone();
            }
            slot = self.cond.wait(slot).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block until the latch fires or `timeout` elapses.
    /// A timeout too large to represent waits without bound.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let Some(until) = Instant::now().checked_add(timeout) else {
            return Some(self.wait());
        };
        let mut slot = self.lock();
        loop {
            if let Some(value) = slot.as_ref() {
                return Some(value.clone());
            }
            let now = Instant::now();
            if now >= until {
                return None;
            }
            let (guard, _) = self
                .cond
                .wait_timeout(slot, until - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Default for Latch<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fires_only_once() {
        let latch = Latch::new();
        assert!(latch.fire(1));
        assert!(!latch.fire(2));
        assert_eq!(latch.wait(), 1);
        assert_eq!(latch.peek(), Some(1));
    }

    #[test]
    fn waiter_blocked_before_fire_wakes_up() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait())
        };
        thread::sleep(Duration::from_millis(50));
        latch.fire("armed");
        assert_eq!(waiter.join().unwrap(), "armed");
    }

    #[test]
    fn wait_timeout_expires_without_fire() {
        let latch: Latch<()> = Latch::new();
        let start = Instant::now();
        assert!(latch.wait_timeout(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
        assert!(!latch.is_fired());
    }

    #[test]
    fn unbounded_timeout_returns_fired_value() {
        let latch = Latch::new();
        latch.fire(7);
        assert_eq!(latch.wait_timeout(Duration::from_secs(u64::MAX)), Some(7));
    }

    #[test]
    fn unbounded_timeout_waits_for_fire() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || latch.wait_timeout(Duration::MAX))
        };
        thread::sleep(Duration::from_millis(50));
        latch.fire("done");
        assert_eq!(waiter.join().unwrap(), Some("done"));
    }

    #[test]
    fn many_readers_observe_same_value() {
        let latch = Arc::new(Latch::new());
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.wait_timeout(Duration::from_secs(5)))
            })
            .collect();
        latch.fire(7u32);
        for reader in readers {
            assert_eq!(reader.join().unwrap(), Some(7));
        }
    }
}
