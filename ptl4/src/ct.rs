//! Counting events and triggered operations.
//!
//! A counting event is a `{success, failure}` pair. Armed triggered
//! operations live on the counter, ordered by threshold; every bump
//! detaches the operations whose threshold has been reached and hands
//! them back to the caller for dispatch, which keeps the counter lock
//! innermost in the lock order.

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::handle::CtHandle;
use crate::xfer::OpArgs;

/// Counter value pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CtEvent {
    pub success: u64,
    pub failure: u64,
}

impl CtEvent {
    pub const fn new(success: u64, failure: u64) -> Self {
        Self { success, failure }
    }

    #[inline]
    fn sum(self) -> u64 {
        self.success + self.failure
    }
}

/// A deferred operation armed on a counting event.
pub struct Triggered {
    pub threshold: u64,
    pub action: TriggeredAction,
}

/// What fires when the threshold is reached.
pub enum TriggeredAction {
    /// A full data-movement operation, dispatched through the normal
    /// initiator path.
    Op(Box<OpArgs>),
    /// Increment another counter.
    CtInc { ct: CtHandle, incr: CtEvent },
    /// Overwrite another counter.
    CtSet { ct: CtHandle, value: CtEvent },
}

struct CtInner {
    event: CtEvent,
    /// Armed operations, ascending by threshold.
    triggered: Vec<Triggered>,
    interrupted: bool,
}

/// A counting event.
pub struct Ct {
    inner: Mutex<CtInner>,
    cv: Condvar,
}

impl Ct {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(CtInner {
                event: CtEvent::default(),
                triggered: Vec::new(),
                interrupted: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Current counter value.
    pub fn get(&self) -> CtEvent {
        self.inner.lock().unwrap().event
    }

    /// Add to the counters; returns the triggered operations that fired.
    pub fn inc(&self, incr: CtEvent) -> Vec<Triggered> {
        let mut inner = self.inner.lock().unwrap();
        inner.event.success += incr.success;
        inner.event.failure += incr.failure;
        let fired = Self::detach_fired(&mut inner);
        drop(inner);
        self.cv.notify_all();
        fired
    }

    /// Overwrite the counters. The monotonicity invariant is the
    /// caller's to respect; triggered operations still fire against the
    /// new value.
    pub fn set(&self, value: CtEvent) -> Vec<Triggered> {
        let mut inner = self.inner.lock().unwrap();
        inner.event = value;
        let fired = Self::detach_fired(&mut inner);
        drop(inner);
        self.cv.notify_all();
        fired
    }

    /// Arm a triggered operation. If the threshold is already reached
    /// the operation is returned for immediate dispatch instead of
    /// being queued, preserving fire-exactly-once.
    pub fn arm(&self, trig: Triggered) -> Option<Triggered> {
        let mut inner = self.inner.lock().unwrap();
        if inner.event.sum() >= trig.threshold {
            return Some(trig);
        }
        let pos = inner
            .triggered
            .partition_point(|t| t.threshold <= trig.threshold);
        inner.triggered.insert(pos, trig);
        None
    }

    fn detach_fired(inner: &mut CtInner) -> Vec<Triggered> {
        let reached = inner.event.sum();
        let split = inner.triggered.partition_point(|t| t.threshold <= reached);
        inner.triggered.drain(..split).collect()
    }

    /// Drop all armed operations (teardown, explicit cancel).
    pub fn cancel_triggered(&self) {
        self.inner.lock().unwrap().triggered.clear();
    }

    /// Number of operations still armed.
    pub fn armed(&self) -> usize {
        self.inner.lock().unwrap().triggered.len()
    }

    /// Block until `success + failure >= threshold`.
    pub fn wait(&self, threshold: u64) -> Result<CtEvent> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.event.sum() >= threshold {
                return Ok(inner.event);
            }
            if inner.interrupted {
                return Err(Error::Interrupted);
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Bounded wait; `CtNoneReached` on expiry.
    pub fn wait_timeout(&self, threshold: u64, timeout: Duration) -> Result<CtEvent> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.event.sum() >= threshold {
                return Ok(inner.event);
            }
            if inner.interrupted {
                return Err(Error::Interrupted);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::CtNoneReached);
            }
            let (guard, _) = self.cv.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Wake all waiters with `Interrupted` (interface teardown).
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.interrupted = true;
        drop(inner);
        self.cv.notify_all();
    }
}

impl Default for Ct {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trig(threshold: u64) -> Triggered {
        Triggered {
            threshold,
            action: TriggeredAction::CtInc {
                ct: CtHandle(crate::handle::Handle::NONE),
                incr: CtEvent::new(1, 0),
            },
        }
    }

    #[test]
    fn inc_and_get() {
        let ct = Ct::new();
        ct.inc(CtEvent::new(3, 0));
        ct.inc(CtEvent::new(0, 2));
        assert_eq!(ct.get(), CtEvent::new(3, 2));
    }

    #[test]
    fn triggered_fires_once_at_threshold() {
        let ct = Ct::new();
        assert!(ct.arm(trig(3)).is_none());
        assert!(ct.inc(CtEvent::new(1, 0)).is_empty());
        assert!(ct.inc(CtEvent::new(1, 0)).is_empty());
        let fired = ct.inc(CtEvent::new(1, 0));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].threshold, 3);
        // Does not fire again.
        assert!(ct.inc(CtEvent::new(1, 0)).is_empty());
        assert_eq!(ct.armed(), 0);
    }

    #[test]
    fn failure_counts_toward_threshold() {
        let ct = Ct::new();
        assert!(ct.arm(trig(2)).is_none());
        assert!(ct.inc(CtEvent::new(1, 0)).is_empty());
        assert_eq!(ct.inc(CtEvent::new(0, 1)).len(), 1);
    }

    #[test]
    fn arm_past_threshold_fires_immediately() {
        let ct = Ct::new();
        ct.inc(CtEvent::new(5, 0));
        assert!(ct.arm(trig(3)).is_some());
        assert_eq!(ct.armed(), 0);
    }

    #[test]
    fn fires_in_threshold_order() {
        let ct = Ct::new();
        assert!(ct.arm(trig(5)).is_none());
        assert!(ct.arm(trig(2)).is_none());
        assert!(ct.arm(trig(4)).is_none());
        let fired = ct.inc(CtEvent::new(5, 0));
        let order: Vec<u64> = fired.iter().map(|t| t.threshold).collect();
        assert_eq!(order, vec![2, 4, 5]);
    }

    #[test]
    fn wait_unblocks_on_inc() {
        let ct = std::sync::Arc::new(Ct::new());
        let ct2 = ct.clone();
        let t = std::thread::spawn(move || ct2.wait(2).unwrap());
        std::thread::sleep(Duration::from_millis(20));
        ct.inc(CtEvent::new(2, 0));
        assert_eq!(t.join().unwrap().success, 2);
    }

    #[test]
    fn wait_timeout_expires() {
        let ct = Ct::new();
        assert!(matches!(
            ct.wait_timeout(1, Duration::from_millis(10)),
            Err(Error::CtNoneReached)
        ));
    }
}
