//! Core identifier, option and event types.

use bitflags::bitflags;

/// Physical process identity: node id + process id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId {
    pub nid: u32,
    pub pid: u32,
}

impl ProcessId {
    pub const fn new(nid: u32, pid: u32) -> Self {
        Self { nid, pid }
    }
}

/// Destination of a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetId {
    /// Rank in the logical map (logical interfaces).
    Rank(u32),
    /// Physical identity (physical interfaces).
    Phys(ProcessId),
}

bitflags! {
    /// Interface flavour flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct NiOptions: u32 {
        /// List entries carry match bits.
        const MATCHING = 1 << 0;
        /// Peers are addressed by rank through a map.
        const LOGICAL  = 1 << 1;
    }
}

impl NiOptions {
    /// 2-bit wire encoding of the interface flavour.
    pub fn ni_type(self) -> u8 {
        (self.bits() & 0x3) as u8
    }

    pub fn from_ni_type(t: u8) -> Self {
        NiOptions::from_bits_truncate(t as u32)
    }
}

/// Acknowledgement policy requested by the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckReq {
    /// Full acknowledgement event.
    Ack = 0,
    /// No acknowledgement.
    NoAck = 1,
    /// Counting acknowledgement.
    CtAck = 2,
    /// Operation-completed counting acknowledgement.
    OcAck = 3,
}

impl AckReq {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(AckReq::Ack),
            1 => Some(AckReq::NoAck),
            2 => Some(AckReq::CtAck),
            3 => Some(AckReq::OcAck),
            _ => None,
        }
    }

    /// Does the target owe us any response at all?
    #[inline]
    pub fn wants_response(self) -> bool {
        !matches!(self, AckReq::NoAck)
    }
}

/// List selector at a portal table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListKind {
    Priority,
    Overflow,
}

/// Append position within a list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    Append,
    Prepend,
}

/// Search mode for unexpected-message binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOp {
    /// Report the match, leave it recorded.
    SearchOnly,
    /// Report the match and consume the record.
    SearchDelete,
}

/// Failure classification carried by events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NiFail {
    #[default]
    Ok,
    Undeliverable,
    Dropped,
    PermViolation,
    OpViolation,
    Segv,
    NoMatch,
}

impl NiFail {
    pub fn to_u8(self) -> u8 {
        match self {
            NiFail::Ok => 0,
            NiFail::Undeliverable => 1,
            NiFail::Dropped => 2,
            NiFail::PermViolation => 3,
            NiFail::OpViolation => 4,
            NiFail::Segv => 5,
            NiFail::NoMatch => 6,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(NiFail::Ok),
            1 => Some(NiFail::Undeliverable),
            2 => Some(NiFail::Dropped),
            3 => Some(NiFail::PermViolation),
            4 => Some(NiFail::OpViolation),
            5 => Some(NiFail::Segv),
            6 => Some(NiFail::NoMatch),
            _ => None,
        }
    }
}

/// Event kinds delivered to event queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Send,
    Ack,
    Reply,
    Put,
    PutOverflow,
    Get,
    GetOverflow,
    Atomic,
    AtomicOverflow,
    FetchAtomic,
    FetchAtomicOverflow,
    Search,
    Link,
    AutoUnlink,
    AutoFree,
    PtDisabled,
    Dropped,
}

/// A full event record.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub initiator: ProcessId,
    pub pt_index: u32,
    pub uid: u32,
    pub match_bits: u64,
    pub rlength: u64,
    pub mlength: u64,
    pub remote_offset: u64,
    /// Address the payload landed at (target-side events).
    pub start: u64,
    pub user_ptr: u64,
    pub hdr_data: u64,
    pub ni_fail: NiFail,
    pub atom_op: Option<crate::atomics::AtomOp>,
    pub atom_type: Option<crate::atomics::AtomType>,
}

impl Event {
    pub fn new(kind: EventKind) -> Self {
        Self {
            kind,
            initiator: ProcessId::new(0, 0),
            pt_index: 0,
            uid: 0,
            match_bits: 0,
            rlength: 0,
            mlength: 0,
            remote_offset: 0,
            start: 0,
            user_ptr: 0,
            hdr_data: 0,
            ni_fail: NiFail::Ok,
            atom_op: None,
            atom_type: None,
        }
    }
}

/// Interface status registers.
#[derive(Debug, Clone, Copy, Default)]
pub struct NiStatus {
    /// Receives dropped for protocol or matching reasons.
    pub recv_drops: u64,
    /// Receives completed in error by the transport.
    pub recv_errs: u64,
    /// Disconnect headers received from peers.
    pub disc_recv: u64,
}
