//! Shared-memory fragment queues.
//!
//! This crate provides the inter-process queueing layer used by the
//! shared-memory transport: a multi-producer / single-consumer queue
//! following the Nemesis protocol, a blocking flavour built on a
//! process-shared condition variable with a frustration counter, and an
//! ordered flavour that tags every entry with a ticket so dequeues can
//! honour a sequence-number barrier.
//!
//! All queues live *inside* a shared segment and link entries by byte
//! **offsets** relative to the segment base, so every attached process
//! sees consistent links regardless of where the segment is mapped.
//!
//! It is NOT safe to use these queues with multiple de-queuers; they are
//! only safe with multiple enqueuers and a single de-queuer.

pub mod common;
pub mod nemesis;
pub mod ordered;
pub mod shm;

pub use common::CachePadded;
pub use nemesis::{BlockingQueue, FragHeader, NemesisQueue, NULL_OFF};
pub use ordered::{OrderedEntry, OrderedQueue};
pub use shm::SharedSegment;

/// Cache line size assumed throughout the shared segment layout.
pub const CACHE_LINE_SIZE: usize = 64;

/// Round `n` up to a multiple of `align` (power of two).
#[inline]
pub const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}
