//! Ordered Nemesis queue: every entry carries a ticket.
//!
//! Links are `(offset, ticket)` pairs manipulated with 128-bit atomics,
//! so concurrent enqueues stay totally ordered by ticket: an enqueue
//! whose ticket is older than the current tail's refuses to swap and
//! reports failure instead of reordering the chain. Dequeue takes an
//! upper bound and will not hand out an entry whose ticket exceeds it,
//! which is how the target side respects sequence-number barriers.
//!
//! Single consumer only, like the plain queue.

use portable_atomic::{AtomicU128, Ordering};

use crate::common::CachePadded;
use crate::nemesis::NULL_OFF;

#[inline]
const fn pack(off: u64, ticket: u64) -> u128 {
    ((ticket as u128) << 64) | off as u128
}

#[inline]
const fn unpack_off(v: u128) -> u64 {
    v as u64
}

#[inline]
const fn unpack_ticket(v: u128) -> u64 {
    (v >> 64) as u64
}

/// Intrusive link header for ordered entries.
#[repr(C, align(16))]
pub struct OrderedEntry {
    next: AtomicU128,
}

impl OrderedEntry {
    /// # Safety
    /// `off` must be a valid ordered-entry offset within the segment.
    #[inline]
    unsafe fn at<'a>(base: *mut u8, off: u64) -> &'a OrderedEntry {
        unsafe { &*(base.add(off as usize) as *const OrderedEntry) }
    }

    /// Reset the link before first use.
    #[inline]
    pub fn reset(&self) {
        self.next.store(0, Ordering::Relaxed);
    }
}

/// Both link ends; ticket checks touch head and tail together.
#[repr(C)]
struct OrderedEnds {
    head: AtomicU128,
    tail: AtomicU128,
}

/// MPSC queue whose entries are totally ordered by ticket.
#[repr(C)]
pub struct OrderedQueue {
    ends: CachePadded<OrderedEnds>,
}

impl OrderedQueue {
    /// Initialise a queue in place.
    pub fn init(&self) {
        self.ends.head.store(0, Ordering::Relaxed);
        self.ends.tail.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        unpack_off(self.ends.head.load(Ordering::Acquire)) == NULL_OFF
            && unpack_off(self.ends.tail.load(Ordering::Acquire)) == NULL_OFF
    }

    /// Append the entry at `off` with the given ticket.
    ///
    /// Returns `false` if an entry with a newer ticket already holds the
    /// tail; the caller owns the entry again and may retry with a fresh
    /// ticket.
    ///
    /// # Safety
    /// `off` must point at an [`OrderedEntry`]-prefixed fragment inside
    /// the segment at `base`, not currently queued. Tickets must be
    /// unique and non-zero per queue lifetime.
    pub unsafe fn enqueue(&self, base: *mut u8, off: u64, ticket: u64) -> bool {
        debug_assert_ne!(off, NULL_OFF);
        let entry = unsafe { OrderedEntry::at(base, off) };
        debug_assert_eq!(entry.next.load(Ordering::Relaxed), 0);

        let f = pack(off, ticket);
        let mut cur = self.ends.tail.load(Ordering::Acquire);
        let prev = loop {
            if unpack_off(cur) != NULL_OFF && unpack_ticket(cur) > ticket {
                return false;
            }
            match self
                .ends
                .tail
                .compare_exchange(cur, f, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(prev) => break prev,
                Err(now) => cur = now,
            }
        };

        if unpack_off(prev) == NULL_OFF {
            self.ends.head.store(f, Ordering::Release);
        } else {
            unsafe { OrderedEntry::at(base, unpack_off(prev)) }
                .next
                .store(f, Ordering::Release);
        }
        true
    }

    /// Remove the oldest entry whose ticket is ≤ `upper_bound`.
    ///
    /// # Safety
    /// Single consumer, segment base as for enqueue.
    pub unsafe fn dequeue(&self, base: *mut u8, upper_bound: u64) -> Option<(u64, u64)> {
        let retval = self.ends.head.load(Ordering::Acquire);
        let off = unpack_off(retval);
        if off == NULL_OFF {
            return None;
        }
        let ticket = unpack_ticket(retval);
        if ticket > upper_bound {
            return None;
        }

        let entry = unsafe { OrderedEntry::at(base, off) };
        let next = entry.next.load(Ordering::Acquire);
        if unpack_off(next) != NULL_OFF {
            self.ends.head.store(next, Ordering::Relaxed);
        } else {
            self.ends.head.store(0, Ordering::Relaxed);
            if self
                .ends
                .tail
                .compare_exchange(retval, 0, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                let mut n = entry.next.load(Ordering::Acquire);
                while unpack_off(n) == NULL_OFF {
                    std::hint::spin_loop();
                    n = entry.next.load(Ordering::Acquire);
                }
                self.ends.head.store(n, Ordering::Relaxed);
            }
        }

        entry.next.store(0, Ordering::Relaxed);
        Some((off, ticket))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedSegment;
    use std::sync::Arc;

    const ENTRY_SIZE: usize = 64;
    const ENTRY_BASE: u64 = 64;

    fn entry_off(i: u64) -> u64 {
        ENTRY_BASE + i * ENTRY_SIZE as u64
    }

    fn queue_at(seg: &SharedSegment, off: usize) -> &OrderedQueue {
        unsafe { &*(seg.as_ptr().add(off) as *const OrderedQueue) }
    }

    #[test]
    fn tickets_in_order() {
        let seg = SharedSegment::anon(64 * 1024).unwrap();
        let base = seg.as_ptr();
        let q = queue_at(&seg, 4096);
        q.init();

        unsafe {
            for i in 0..8u64 {
                assert!(q.enqueue(base, entry_off(i), i + 1));
            }
            let mut prev = 0;
            for _ in 0..8 {
                let (_, t) = q.dequeue(base, u64::MAX).unwrap();
                assert!(t > prev);
                prev = t;
            }
            assert!(q.dequeue(base, u64::MAX).is_none());
        }
    }

    #[test]
    fn upper_bound_barrier() {
        let seg = SharedSegment::anon(64 * 1024).unwrap();
        let base = seg.as_ptr();
        let q = queue_at(&seg, 4096);
        q.init();

        unsafe {
            assert!(q.enqueue(base, entry_off(0), 5));
            assert!(q.enqueue(base, entry_off(1), 9));

            // Barrier below the head ticket: nothing comes out.
            assert!(q.dequeue(base, 4).is_none());
            // Barrier admits the first entry only.
            assert_eq!(q.dequeue(base, 5), Some((entry_off(0), 5)));
            assert!(q.dequeue(base, 8).is_none());
            assert_eq!(q.dequeue(base, 9), Some((entry_off(1), 9)));
        }
    }

    #[test]
    fn stale_ticket_refused() {
        let seg = SharedSegment::anon(64 * 1024).unwrap();
        let base = seg.as_ptr();
        let q = queue_at(&seg, 4096);
        q.init();

        unsafe {
            assert!(q.enqueue(base, entry_off(0), 10));
            // Ticket 7 is older than the tail's ticket 10.
            assert!(!q.enqueue(base, entry_off(1), 7));
            assert_eq!(q.dequeue(base, u64::MAX), Some((entry_off(0), 10)));
        }
    }

    #[test]
    fn concurrent_enqueuers_monotonic_dequeue() {
        let seg = Arc::new(SharedSegment::anon(1 << 20).unwrap());
        let q = queue_at(&seg, 4096);
        q.init();

        const PER_PRODUCER: u64 = 500;
        let ticket_src = Arc::new(portable_atomic::AtomicU64::new(1));
        let mut handles = Vec::new();
        for p in 0..2u64 {
            let seg = seg.clone();
            let ticket_src = ticket_src.clone();
            handles.push(std::thread::spawn(move || {
                let base = seg.as_ptr();
                let q = queue_at(&seg, 4096);
                for i in 0..PER_PRODUCER {
                    let idx = p * PER_PRODUCER + i;
                    loop {
                        let t = ticket_src.fetch_add(1, Ordering::Relaxed);
                        if unsafe { q.enqueue(base, entry_off(idx), t) } {
                            break;
                        }
                        // Lost the ticket race; take a fresh ticket.
                    }
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        let base = seg.as_ptr();
        let mut prev = 0u64;
        for _ in 0..2 * PER_PRODUCER {
            let (_, t) = unsafe { q.dequeue(base, u64::MAX) }.unwrap();
            assert!(t > prev, "tickets must strictly increase");
            prev = t;
        }
        assert!(unsafe { q.dequeue(base, u64::MAX) }.is_none());
    }
}
