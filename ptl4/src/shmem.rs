//! Shared-memory job segment: per-rank fragment queues and buffers.
//!
//! Layout of the segment:
//!
//! ```text
//! [ header | rank 0 recv queue | rank 0 free queue | rank 1 ... | fragments ]
//! ```
//!
//! Every fragment starts with the intrusive queue link, followed by a
//! small meta block (owner rank, kind, length) and the payload area.
//! Fragments are allocated from the owner's free queue, delivered by
//! enqueueing onto the destination rank's receive queue, and travel
//! back to their owner tagged as returns, so any peer can route a
//! borrowed buffer home.

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use fragq::{align_up, BlockingQueue, NemesisQueue, SharedSegment, CACHE_LINE_SIZE};

use crate::buffer::BUF_SIZE;
use crate::error::{Error, Result};

const SHMEM_MAGIC: u64 = 0x5054_4c34_4652_4147; // "PTL4FRAG"
const SHMEM_VERSION: u32 = 1;

const HEADER_SIZE: usize = 64;
/// Space reserved for one rank's receive (blocking) queue header.
const RECV_Q_SPACE: usize = align_up(std::mem::size_of::<BlockingQueue>(), CACHE_LINE_SIZE);
/// Space reserved for one rank's free queue header.
const FREE_Q_SPACE: usize = align_up(std::mem::size_of::<NemesisQueue>(), CACHE_LINE_SIZE);
/// Space reserved for the two queue headers of one rank.
const QUEUES_SIZE: usize = RECV_Q_SPACE + FREE_Q_SPACE;
/// Link (8) + meta (16), padded to a cache line.
const FRAG_HDR_SIZE: usize = 64;
const FRAG_SIZE: usize = FRAG_HDR_SIZE + BUF_SIZE;

/// Fragment kind: a wire message or a buffer travelling home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragKind {
    Send,
    Return,
}

#[repr(C)]
#[allow(dead_code)]
struct SegHeader {
    magic: u64,
    version: u32,
    nranks: u32,
    bufs_per_rank: u32,
    frag_size: u32,
}

/// The shared segment one co-located job communicates through.
pub struct ShmemJob {
    seg: SharedSegment,
    nranks: u32,
    bufs_per_rank: u32,
    /// pid of the process attached at each rank (u32::MAX = empty).
    pids: Vec<AtomicU32>,
    /// The free queues are single-consumer; user threads and the
    /// progress thread both allocate, so serialise them per rank.
    alloc_locks: Vec<Mutex<()>>,
}

unsafe impl Send for ShmemJob {}
unsafe impl Sync for ShmemJob {}

impl ShmemJob {
    fn layout_size(nranks: u32, bufs_per_rank: u32) -> usize {
        HEADER_SIZE
            + nranks as usize * QUEUES_SIZE
            + nranks as usize * bufs_per_rank as usize * FRAG_SIZE
    }

    /// Create an anonymous job segment (single-process or forked jobs).
    pub fn new_anon(nranks: u32, bufs_per_rank: u32) -> io::Result<Self> {
        let size = align_up(Self::layout_size(nranks, bufs_per_rank), 4096);
        let seg = SharedSegment::anon(size)?;
        Ok(Self::init(seg, nranks, bufs_per_rank))
    }

    /// Create a named job segment under `/dev/shm`.
    ///
    /// # Safety
    /// The name must not be in use by another job.
    pub unsafe fn create_named(name: &str, nranks: u32, bufs_per_rank: u32) -> io::Result<Self> {
        let size = align_up(Self::layout_size(nranks, bufs_per_rank), 4096);
        let seg = unsafe { SharedSegment::create(name, size)? };
        Ok(Self::init(seg, nranks, bufs_per_rank))
    }

    fn init(seg: SharedSegment, nranks: u32, bufs_per_rank: u32) -> Self {
        let base = seg.as_ptr();
        unsafe {
            let hdr = base as *mut SegHeader;
            (*hdr).magic = SHMEM_MAGIC;
            (*hdr).version = SHMEM_VERSION;
            (*hdr).nranks = nranks;
            (*hdr).bufs_per_rank = bufs_per_rank;
            (*hdr).frag_size = FRAG_SIZE as u32;
        }

        let job = Self {
            seg,
            nranks,
            bufs_per_rank,
            pids: (0..nranks).map(|_| AtomicU32::new(u32::MAX)).collect(),
            alloc_locks: (0..nranks).map(|_| Mutex::new(())).collect(),
        };

        for r in 0..nranks {
            unsafe { job.recv_queue(r).init() };
            job.free_queue(r).init();
            for i in 0..bufs_per_rank {
                let off = job.frag_off(r, i);
                unsafe {
                    job.set_frag_meta(off, r, FragKind::Send, 0);
                    job.free_queue(r).enqueue(job.base(), off);
                }
            }
        }
        job
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        self.seg.as_ptr()
    }

    pub fn nranks(&self) -> u32 {
        self.nranks
    }

    fn recv_queue(&self, rank: u32) -> &BlockingQueue {
        let off = HEADER_SIZE + rank as usize * QUEUES_SIZE;
        unsafe { &*(self.base().add(off) as *const BlockingQueue) }
    }

    fn free_queue(&self, rank: u32) -> &NemesisQueue {
        let off = HEADER_SIZE + rank as usize * QUEUES_SIZE + RECV_Q_SPACE;
        unsafe { &*(self.base().add(off) as *const NemesisQueue) }
    }

    fn frag_off(&self, rank: u32, i: u32) -> u64 {
        (HEADER_SIZE
            + self.nranks as usize * QUEUES_SIZE
            + (rank as usize * self.bufs_per_rank as usize + i as usize) * FRAG_SIZE) as u64
    }

    unsafe fn set_frag_meta(&self, off: u64, owner: u32, kind: FragKind, len: u32) {
        let p = unsafe { self.base().add(off as usize + 8) };
        unsafe {
            (p as *mut u32).write_volatile(owner);
            (p.add(4) as *mut u32).write_volatile(kind as u32);
            (p.add(8) as *mut u32).write_volatile(len);
        }
    }

    /// Fragment metadata: (owner rank, kind, payload length).
    pub fn frag_meta(&self, off: u64) -> (u32, FragKind, u32) {
        let p = unsafe { self.base().add(off as usize + 8) };
        let owner = unsafe { (p as *const u32).read_volatile() };
        let kind = match unsafe { (p.add(4) as *const u32).read_volatile() } {
            1 => FragKind::Return,
            _ => FragKind::Send,
        };
        let len = unsafe { (p.add(8) as *const u32).read_volatile() };
        (owner, kind, len)
    }

    /// Payload area of a fragment.
    pub fn frag_payload(&self, off: u64) -> *mut u8 {
        unsafe { self.base().add(off as usize + FRAG_HDR_SIZE) }
    }

    /// Attach a process to a rank slot.
    pub fn attach(&self, rank: u32, pid: u32) -> Result<()> {
        if rank >= self.nranks {
            return Err(Error::ArgInvalid);
        }
        let prev = self.pids[rank as usize].swap(pid, Ordering::AcqRel);
        if prev != u32::MAX && prev != pid {
            self.pids[rank as usize].store(prev, Ordering::Release);
            return Err(Error::PidInUse);
        }
        Ok(())
    }

    pub fn detach(&self, rank: u32) {
        if rank < self.nranks {
            self.pids[rank as usize].store(u32::MAX, Ordering::Release);
        }
    }

    /// Rank a pid is attached at, if any.
    pub fn rank_of_pid(&self, pid: u32) -> Option<u32> {
        (0..self.nranks).find(|&r| self.pids[r as usize].load(Ordering::Acquire) == pid)
    }

    /// Take a fragment from `rank`'s free pool. Callers must belong to
    /// the owning process; the per-rank lock provides the queue's
    /// single-consumer guarantee across its threads.
    pub fn alloc_frag(&self, rank: u32) -> Result<u64> {
        let _guard = self.alloc_locks[rank as usize].lock().unwrap();
        unsafe { self.free_queue(rank).dequeue(self.base()) }.ok_or(Error::NoSpace)
    }

    /// Send a message fragment to `dest`: stamp the meta and enqueue
    /// on the destination's receive queue.
    pub fn send_frag(&self, owner: u32, dest: u32, off: u64, bytes: &[u8]) -> Result<()> {
        if bytes.len() > BUF_SIZE || dest >= self.nranks {
            return Err(Error::ArgInvalid);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), self.frag_payload(off), bytes.len());
            self.set_frag_meta(off, owner, FragKind::Send, bytes.len() as u32);
            self.recv_queue(dest).enqueue(self.base(), off);
        }
        Ok(())
    }

    /// Non-blocking dequeue of `rank`'s receive queue. Single consumer.
    pub fn try_dequeue(&self, rank: u32) -> Option<u64> {
        unsafe { self.recv_queue(rank).dequeue(self.base()) }
    }

    /// Whether `rank`'s receive queue has nothing visible.
    pub fn recv_queue_empty(&self, rank: u32) -> bool {
        self.recv_queue(rank).is_empty()
    }

    /// Route a borrowed fragment back to its owner.
    pub fn return_frag(&self, off: u64) {
        let (owner, _, _) = self.frag_meta(off);
        unsafe {
            self.set_frag_meta(off, owner, FragKind::Return, 0);
            self.recv_queue(owner).enqueue(self.base(), off);
        }
    }

    /// Put one of our own fragments back on our free pool.
    pub fn free_frag(&self, rank: u32, off: u64) {
        unsafe {
            self.set_frag_meta(off, rank, FragKind::Send, 0);
            self.free_queue(rank).enqueue(self.base(), off);
        }
    }

    /// Count the free fragments of a rank by draining and refilling the
    /// pool. Only safe for the owner while quiescent (leak checks).
    pub fn free_count(&self, rank: u32) -> usize {
        let mut held = Vec::new();
        while let Ok(off) = self.alloc_frag(rank) {
            held.push(off);
        }
        let n = held.len();
        for off in held {
            self.free_frag(rank, off);
        }
        n
    }

    /// Total fragments each rank owns.
    pub fn bufs_per_rank(&self) -> u32 {
        self.bufs_per_rank
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_send_receive_return() {
        let job = ShmemJob::new_anon(2, 4).unwrap();
        job.attach(0, 100).unwrap();
        job.attach(1, 101).unwrap();
        assert_eq!(job.rank_of_pid(101), Some(1));
        assert_eq!(job.rank_of_pid(999), None);

        // Rank 0 sends to rank 1.
        let off = job.alloc_frag(0).unwrap();
        job.send_frag(0, 1, off, b"hello").unwrap();

        let got = job.try_dequeue(1).unwrap();
        assert_eq!(got, off);
        let (owner, kind, len) = job.frag_meta(got);
        assert_eq!((owner, kind, len), (0, FragKind::Send, 5));
        let payload =
            unsafe { std::slice::from_raw_parts(job.frag_payload(got), len as usize) };
        assert_eq!(payload, b"hello");

        // Rank 1 routes the fragment home; rank 0 frees it.
        job.return_frag(got);
        let back = job.try_dequeue(0).unwrap();
        let (owner, kind, _) = job.frag_meta(back);
        assert_eq!((owner, kind), (0, FragKind::Return));
        job.free_frag(0, back);
        assert_eq!(job.free_count(0), 4);
    }

    #[test]
    fn free_pool_exhaustion() {
        let job = ShmemJob::new_anon(1, 2).unwrap();
        let a = job.alloc_frag(0).unwrap();
        let b = job.alloc_frag(0).unwrap();
        assert!(matches!(job.alloc_frag(0), Err(Error::NoSpace)));
        job.free_frag(0, a);
        job.free_frag(0, b);
        assert_eq!(job.free_count(0), 2);
    }

    #[test]
    fn attach_conflicts() {
        let job = ShmemJob::new_anon(1, 1).unwrap();
        job.attach(0, 7).unwrap();
        assert!(matches!(job.attach(0, 8), Err(Error::PidInUse)));
        assert!(job.attach(0, 7).is_ok());
        assert!(matches!(job.attach(5, 9), Err(Error::ArgInvalid)));
    }
}
