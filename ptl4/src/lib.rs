//! # ptl4 - one-sided messaging engine
//!
//! A Portals-style network transport runtime: remote Put / Get /
//! Atomic / FetchAtomic / Swap between ranks of a job, over an
//! RDMA-style provider or a shared-memory fragment path between
//! co-located peers.
//!
//! ## Architecture
//!
//! ```text
//! user thread                     progress thread (one per NI)
//!   put()/get()/atomic()            poll CM events -> connection manager
//!     |                             poll CQ        -> classify completions
//!     v                             drain fragment queue
//!   initiator machine  <----------  reply path
//!     |                               |
//!     v                               v
//!   transport (RDMA | shmem) ----> target machine -> matching engine
//! ```
//!
//! - [`ni`]: interface lifecycle, pools, portal table, operation surface
//! - [`pool`] / [`handle`]: generation-checked object handles
//! - [`pt`] / [`le`]: matching engine (priority + overflow lists)
//! - [`md`] / [`eq`] / [`ct`]: descriptors, event queues, counters and
//!   triggered operations
//! - [`wire`]: header and descriptor formats
//! - [`transport`] / [`soft`] / [`shmem`]: the two transports and the
//!   in-process verbs provider
//! - The state machines live in `initiator`, `target` and `recv`.

pub mod atomics;
pub mod buffer;
pub mod config;
pub mod conn;
pub mod ct;
pub mod eq;
pub mod error;
pub mod handle;
pub mod le;
pub mod md;
pub mod ni;
pub mod pool;
pub mod pt;
pub mod shmem;
pub mod soft;
pub mod transport;
pub mod types;
pub mod wire;
pub mod xfer;

mod initiator;
mod recv;
mod target;

pub use atomics::{AtomOp, AtomType};
pub use config::{NiConfig, NiLimits, Param};
pub use ct::CtEvent;
pub use error::{Error, Result};
pub use handle::{CtHandle, EqHandle, LeHandle, MdHandle};
pub use le::{LeOptions, MatchSpec};
pub use md::MdOptions;
pub use ni::Ni;
pub use pt::PtOptions;
pub use shmem::ShmemJob;
pub use soft::{RejectReason, SoftFabric};
pub use types::{
    AckReq, Event, EventKind, ListKind, NiFail, NiOptions, NiStatus, Position, ProcessId,
    SearchOp, TargetId,
};
pub use wire::Sge;
