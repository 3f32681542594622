//! Nemesis-protocol MPSC queue over segment offsets.
//!
//! Fragment queueing uses the NEMESIS lock-free queue protocol
//! (Buntinas et al., CCGrid'06). Entries are intrusive: every fragment
//! placed on a queue must begin with a [`FragHeader`]. Links are byte
//! offsets from the segment base, never pointers, so producers mapped at
//! different addresses agree on the chain. Offset 0 is the null link,
//! which is why segment layouts never place a fragment at offset 0.
//!
//! The consumer owns a `shadow_head` so the common dequeue path does not
//! touch the cache line producers are contending on.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::common::CachePadded;

/// The null offset. No fragment may live at segment offset 0.
pub const NULL_OFF: u64 = 0;

/// Spins the consumer tolerates before entering the blocking slow path.
const FRUSTRATION_LIMIT: u32 = 1000;

/// Intrusive link header; the first bytes of every queued fragment.
#[repr(C, align(8))]
pub struct FragHeader {
    next: AtomicU64,
}

impl FragHeader {
    /// # Safety
    /// `off` must be a valid fragment offset within the segment at `base`.
    #[inline]
    unsafe fn at<'a>(base: *mut u8, off: u64) -> &'a FragHeader {
        unsafe { &*(base.add(off as usize) as *const FragHeader) }
    }

    /// Reset the link before first use.
    #[inline]
    pub fn reset(&self) {
        self.next.store(NULL_OFF, Ordering::Relaxed);
    }
}

/// Head and tail links, shared with producers.
#[repr(C)]
struct ProducerSide {
    head: AtomicU64,
    tail: AtomicU64,
}

/// Multi-producer single-consumer offset queue.
///
/// Head and tail live on one cache line (producers touch both), the
/// consumer-private shadow head on the next.
#[repr(C)]
pub struct NemesisQueue {
    shared: CachePadded<ProducerSide>,
    shadow_head: CachePadded<AtomicU64>,
}

impl NemesisQueue {
    /// Initialise a queue in place (e.g. freshly mapped segment memory).
    pub fn init(&self) {
        self.shared.head.store(NULL_OFF, Ordering::Relaxed);
        self.shared.tail.store(NULL_OFF, Ordering::Relaxed);
        self.shadow_head.store(NULL_OFF, Ordering::Release);
    }

    /// True when no entry is visible to the consumer.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.shadow_head.load(Ordering::Relaxed) == NULL_OFF
            && self.shared.head.load(Ordering::Acquire) == NULL_OFF
    }

    /// Append the fragment at `off` to the queue.
    ///
    /// Safe to call from any number of producers concurrently.
    ///
    /// # Safety
    /// `off` must point at a [`FragHeader`]-prefixed fragment inside the
    /// segment at `base`, and that fragment must not already be queued.
    pub unsafe fn enqueue(&self, base: *mut u8, off: u64) {
        debug_assert_ne!(off, NULL_OFF);
        let entry = unsafe { FragHeader::at(base, off) };
        debug_assert_eq!(entry.next.load(Ordering::Relaxed), NULL_OFF);

        let prev = self.shared.tail.swap(off, Ordering::AcqRel);
        if prev == NULL_OFF {
            self.shared.head.store(off, Ordering::Release);
        } else {
            unsafe { FragHeader::at(base, prev) }
                .next
                .store(off, Ordering::Release);
        }
    }

    /// Remove and return the oldest fragment offset, or `None` if empty.
    ///
    /// # Safety
    /// Must only be called by the single consumer, with the `base` the
    /// queue's fragments live in.
    pub unsafe fn dequeue(&self, base: *mut u8) -> Option<u64> {
        let mut sh = self.shadow_head.load(Ordering::Relaxed);
        if sh == NULL_OFF {
            let h = self.shared.head.load(Ordering::Acquire);
            if h == NULL_OFF {
                return None;
            }
            self.shared.head.store(NULL_OFF, Ordering::Relaxed);
            sh = h;
        }

        let entry = unsafe { FragHeader::at(base, sh) };
        let next = entry.next.load(Ordering::Acquire);
        if next != NULL_OFF {
            self.shadow_head.store(next, Ordering::Relaxed);
        } else {
            self.shadow_head.store(NULL_OFF, Ordering::Relaxed);
            if self
                .shared
                .tail
                .compare_exchange(sh, NULL_OFF, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // A producer swapped the tail but has not linked us yet;
                // its store to `next` is imminent.
                let mut n = entry.next.load(Ordering::Acquire);
                while n == NULL_OFF {
                    std::hint::spin_loop();
                    n = entry.next.load(Ordering::Acquire);
                }
                self.shadow_head.store(n, Ordering::Relaxed);
            }
        }

        entry.next.store(NULL_OFF, Ordering::Relaxed);
        Some(sh)
    }
}

/// Blocking flavour of [`NemesisQueue`].
///
/// A frustration counter plus a process-shared condition variable let
/// the consumer sleep once polling stops paying off; producers only pay
/// for the wakeup when a consumer has registered frustration.
#[repr(C)]
pub struct BlockingQueue {
    q: NemesisQueue,
    frustration: CachePadded<AtomicU32>,
    mutex: UnsafeCell<libc::pthread_mutex_t>,
    cond: UnsafeCell<libc::pthread_cond_t>,
}

unsafe impl Send for BlockingQueue {}
unsafe impl Sync for BlockingQueue {}

impl BlockingQueue {
    /// Initialise in place. The mutex and condvar are created
    /// process-shared so producers in other processes can signal.
    ///
    /// # Safety
    /// Must be called exactly once per queue, before any other use.
    pub unsafe fn init(&self) {
        self.q.init();
        self.frustration.store(0, Ordering::Relaxed);
        unsafe {
            let mut ma: libc::pthread_mutexattr_t = std::mem::zeroed();
            libc::pthread_mutexattr_init(&mut ma);
            libc::pthread_mutexattr_setpshared(&mut ma, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_mutex_init(self.mutex.get(), &ma);
            libc::pthread_mutexattr_destroy(&mut ma);

            let mut ca: libc::pthread_condattr_t = std::mem::zeroed();
            libc::pthread_condattr_init(&mut ca);
            libc::pthread_condattr_setpshared(&mut ca, libc::PTHREAD_PROCESS_SHARED);
            libc::pthread_cond_init(self.cond.get(), &ca);
            libc::pthread_condattr_destroy(&mut ca);
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.q.is_empty()
    }

    /// Enqueue and wake the consumer if it registered frustration.
    ///
    /// # Safety
    /// Same contract as [`NemesisQueue::enqueue`].
    pub unsafe fn enqueue(&self, base: *mut u8, off: u64) {
        unsafe { self.q.enqueue(base, off) };
        if self.frustration.load(Ordering::Acquire) > 0 {
            unsafe {
                libc::pthread_mutex_lock(self.mutex.get());
                if self.frustration.load(Ordering::Relaxed) > 0 {
                    self.frustration.store(0, Ordering::Relaxed);
                    libc::pthread_cond_signal(self.cond.get());
                }
                libc::pthread_mutex_unlock(self.mutex.get());
            }
        }
    }

    /// Non-blocking dequeue.
    ///
    /// # Safety
    /// Same contract as [`NemesisQueue::dequeue`].
    pub unsafe fn dequeue(&self, base: *mut u8) -> Option<u64> {
        unsafe { self.q.dequeue(base) }
    }

    /// Dequeue, sleeping on the condvar once `FRUSTRATION_LIMIT` polls
    /// come up empty. With `hard_polling` the slow path is replaced by a
    /// pause instruction and the queue never sleeps.
    ///
    /// # Safety
    /// Same contract as [`NemesisQueue::dequeue`].
    pub unsafe fn dequeue_blocking(&self, base: *mut u8, hard_polling: bool) -> u64 {
        loop {
            if let Some(off) = unsafe { self.q.dequeue(base) } {
                return off;
            }
            while self.q.is_empty() {
                if hard_polling {
                    std::hint::spin_loop();
                } else if self.frustration.fetch_add(1, Ordering::AcqRel) + 1 > FRUSTRATION_LIMIT {
                    unsafe {
                        libc::pthread_mutex_lock(self.mutex.get());
                        if self.frustration.load(Ordering::Relaxed) > FRUSTRATION_LIMIT {
                            libc::pthread_cond_wait(self.cond.get(), self.mutex.get());
                        }
                        libc::pthread_mutex_unlock(self.mutex.get());
                    }
                }
            }
        }
    }

    /// Wake a consumer parked in [`Self::dequeue_blocking`] (shutdown).
    pub fn wake(&self) {
        unsafe {
            libc::pthread_mutex_lock(self.mutex.get());
            self.frustration.store(0, Ordering::Relaxed);
            libc::pthread_cond_broadcast(self.cond.get());
            libc::pthread_mutex_unlock(self.mutex.get());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shm::SharedSegment;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    // Fragment layout used by the tests: FragHeader followed by a value.
    const FRAG_SIZE: usize = 64;
    const FRAG_BASE: u64 = 64; // leave offset 0 unused

    unsafe fn frag_off(i: u64) -> u64 {
        FRAG_BASE + i * FRAG_SIZE as u64
    }

    unsafe fn write_val(base: *mut u8, off: u64, v: u64) {
        let p = base.add(off as usize + 8) as *mut u64;
        std::ptr::write_volatile(p, v);
    }

    unsafe fn read_val(base: *mut u8, off: u64) -> u64 {
        let p = base.add(off as usize + 8) as *const u64;
        std::ptr::read_volatile(p)
    }

    fn queue_at(seg: &SharedSegment, off: usize) -> &NemesisQueue {
        unsafe { &*(seg.as_ptr().add(off) as *const NemesisQueue) }
    }

    #[test]
    fn fifo_single_thread() {
        let seg = SharedSegment::anon(64 * 1024).unwrap();
        let base = seg.as_ptr();
        let q = queue_at(&seg, 4096);
        q.init();

        unsafe {
            assert!(q.dequeue(base).is_none());
            for i in 0..16u64 {
                let off = frag_off(i);
                write_val(base, off, i * 10);
                q.enqueue(base, off);
            }
            for i in 0..16u64 {
                let off = q.dequeue(base).unwrap();
                assert_eq!(read_val(base, off), i * 10);
            }
            assert!(q.dequeue(base).is_none());
            assert!(q.is_empty());
        }
    }

    #[test]
    fn reuse_after_dequeue() {
        let seg = SharedSegment::anon(16 * 1024).unwrap();
        let base = seg.as_ptr();
        let q = queue_at(&seg, 4096);
        q.init();

        unsafe {
            for round in 0..100u64 {
                let off = frag_off(round % 4);
                write_val(base, off, round);
                q.enqueue(base, off);
                assert_eq!(q.dequeue(base), Some(off));
            }
        }
    }

    #[test]
    fn mpsc_two_producers() {
        let seg = Arc::new(SharedSegment::anon(1 << 20).unwrap());
        let q = queue_at(&seg, 4096);
        q.init();

        const PER_PRODUCER: u64 = 2000;
        let mut handles = Vec::new();
        for p in 0..2u64 {
            let seg = seg.clone();
            handles.push(std::thread::spawn(move || {
                let base = seg.as_ptr();
                let q = queue_at(&seg, 4096);
                for i in 0..PER_PRODUCER {
                    let idx = p * PER_PRODUCER + i;
                    let off = unsafe { frag_off(idx) };
                    unsafe {
                        write_val(base, off, p << 32 | i);
                        q.enqueue(base, off);
                    }
                }
            }));
        }

        let base = seg.as_ptr();
        let mut last = [u64::MAX, u64::MAX];
        let mut seen = 0u64;
        while seen < 2 * PER_PRODUCER {
            if let Some(off) = unsafe { q.dequeue(base) } {
                let v = unsafe { read_val(base, off) };
                let p = (v >> 32) as usize;
                let i = v & 0xffff_ffff;
                // Per-producer FIFO must hold.
                assert_eq!(i, last[p].wrapping_add(1));
                last[p] = i;
                seen += 1;
            }
        }
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn blocking_wakes_consumer() {
        let seg = Arc::new(SharedSegment::anon(1 << 16).unwrap());
        let q: &BlockingQueue = unsafe { &*(seg.as_ptr().add(4096) as *const BlockingQueue) };
        unsafe { q.init() };

        let got = Arc::new(AtomicU64::new(0));
        let consumer = {
            let seg = seg.clone();
            let got = got.clone();
            std::thread::spawn(move || {
                let q: &BlockingQueue =
                    unsafe { &*(seg.as_ptr().add(4096) as *const BlockingQueue) };
                let off = unsafe { q.dequeue_blocking(seg.as_ptr(), false) };
                got.store(off, Ordering::SeqCst);
            })
        };

        // Give the consumer time to reach the frustrated slow path.
        std::thread::sleep(std::time::Duration::from_millis(50));
        let off = unsafe { frag_off(3) };
        unsafe { q.enqueue(seg.as_ptr(), off) };

        consumer.join().unwrap();
        assert_eq!(got.load(Ordering::SeqCst), off);
    }
}
