//! Bounded event queues.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::Duration;

use crate::error::{Error, Result};
use crate::types::Event;

struct EqInner {
    ring: VecDeque<Event>,
    capacity: usize,
    /// Monotonic sequence number of the next event posted.
    seq: u64,
    /// Set when an event had to be discarded; reported on the next read.
    dropped: bool,
    interrupted: bool,
}

/// An event queue: a bounded ring with overflow detection.
pub struct Eq {
    inner: Mutex<EqInner>,
    cv: Condvar,
}

impl Eq {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(EqInner {
                ring: VecDeque::with_capacity(capacity),
                capacity,
                seq: 0,
                dropped: false,
                interrupted: false,
            }),
            cv: Condvar::new(),
        }
    }

    /// Post an event. A full ring records the loss instead of blocking
    /// the progress thread.
    pub fn post(&self, event: Event) {
        let mut inner = self.inner.lock().unwrap();
        inner.seq += 1;
        if inner.ring.len() >= inner.capacity {
            inner.dropped = true;
        } else {
            inner.ring.push_back(event);
        }
        drop(inner);
        self.cv.notify_all();
    }

    /// Non-blocking read. A recorded overflow is reported (once) before
    /// any further events are handed out.
    pub fn get(&self) -> Result<Event> {
        let mut inner = self.inner.lock().unwrap();
        if inner.dropped {
            inner.dropped = false;
            return Err(Error::EqDropped);
        }
        inner.ring.pop_front().ok_or(Error::EqEmpty)
    }

    /// Blocking read.
    pub fn wait(&self) -> Result<Event> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.dropped {
                inner.dropped = false;
                return Err(Error::EqDropped);
            }
            if let Some(ev) = inner.ring.pop_front() {
                return Ok(ev);
            }
            if inner.interrupted {
                return Err(Error::Interrupted);
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// Blocking read with a timeout; `EqEmpty` on expiry.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<Event> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.dropped {
                inner.dropped = false;
                return Err(Error::EqDropped);
            }
            if let Some(ev) = inner.ring.pop_front() {
                return Ok(ev);
            }
            if inner.interrupted {
                return Err(Error::Interrupted);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Error::EqEmpty);
            }
            let (guard, _) = self.cv.wait_timeout(inner, deadline - now).unwrap();
            inner = guard;
        }
    }

    /// Events currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wake all waiters with `Interrupted` (interface teardown).
    pub fn interrupt(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.interrupted = true;
        drop(inner);
        self.cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventKind;

    #[test]
    fn post_get_fifo() {
        let eq = Eq::new(8);
        assert!(matches!(eq.get(), Err(Error::EqEmpty)));

        let mut a = Event::new(EventKind::Put);
        a.hdr_data = 1;
        let mut b = Event::new(EventKind::Ack);
        b.hdr_data = 2;
        eq.post(a);
        eq.post(b);

        assert_eq!(eq.get().unwrap().hdr_data, 1);
        assert_eq!(eq.get().unwrap().hdr_data, 2);
        assert!(matches!(eq.get(), Err(Error::EqEmpty)));
    }

    #[test]
    fn overflow_reported_once() {
        let eq = Eq::new(2);
        for i in 0..3 {
            let mut ev = Event::new(EventKind::Put);
            ev.hdr_data = i;
            eq.post(ev);
        }
        // The drop is reported before the surviving events.
        assert!(matches!(eq.get(), Err(Error::EqDropped)));
        assert_eq!(eq.get().unwrap().hdr_data, 0);
        assert_eq!(eq.get().unwrap().hdr_data, 1);
        assert!(matches!(eq.get(), Err(Error::EqEmpty)));
    }

    #[test]
    fn wait_wakes_on_post() {
        let eq = std::sync::Arc::new(Eq::new(4));
        let eq2 = eq.clone();
        let t = std::thread::spawn(move || eq2.wait().unwrap());
        std::thread::sleep(Duration::from_millis(20));
        eq.post(Event::new(EventKind::Send));
        assert_eq!(t.join().unwrap().kind, EventKind::Send);
    }

    #[test]
    fn interrupt_unblocks() {
        let eq = std::sync::Arc::new(Eq::new(4));
        let eq2 = eq.clone();
        let t = std::thread::spawn(move || eq2.wait());
        std::thread::sleep(Duration::from_millis(20));
        eq.interrupt();
        assert!(matches!(t.join().unwrap(), Err(Error::Interrupted)));
    }
}
