//! List entries: memory regions exposed to incoming operations.

use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;

use crate::handle::CtHandle;
use crate::types::{ListKind, NiFail, ProcessId};
use crate::wire::{Op, Sge};

bitflags! {
    /// List entry options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LeOptions: u32 {
        /// Incoming puts and atomics may consume this entry.
        const OP_PUT = 1 << 0;
        /// Incoming gets (and the fetch half) may consume this entry.
        const OP_GET = 1 << 1;
        /// Unlink after the first successful match.
        const USE_ONCE = 1 << 2;
        /// The entry manages its own offset; unlink once residual free
        /// space drops below `min_free`.
        const MANAGE_LOCAL = 1 << 3;
        /// Never send an acknowledgement for operations on this entry.
        const ACK_DISABLE = 1 << 4;
        /// Suppress full comm events on this entry.
        const EVENT_COMM_DISABLE = 1 << 5;
        /// Count communication on the attached counter.
        const EVENT_CT_COMM = 1 << 6;
        /// Count manipulated bytes instead of operations.
        const EVENT_CT_BYTES = 1 << 7;
        /// Suppress the link event.
        const EVENT_LINK_DISABLE = 1 << 8;
        /// Suppress the auto-unlink event.
        const EVENT_UNLINK_DISABLE = 1 << 9;
    }
}

/// Matching criteria carried by matching-interface entries.
#[derive(Debug, Clone, Copy)]
pub struct MatchSpec {
    pub match_bits: u64,
    pub ignore_bits: u64,
    pub min_free: u64,
    /// Exact peer filter; `None` is the wildcard.
    pub id: Option<ProcessId>,
}

/// Mutable matching state, guarded by the entry lock. The same lock
/// serialises atomic-op application on the entry's memory.
#[derive(Debug)]
pub struct LeDyn {
    /// Local managed offset (`MANAGE_LOCAL`).
    pub local_offset: u64,
    pub linked: bool,
    pub pt_index: u32,
    pub list: ListKind,
    /// Unexpected-list records still referencing this entry.
    pub unexpected_refs: usize,
}

/// Outcome of testing an entry against an incoming request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchResult {
    /// Keep walking.
    NoMatch,
    /// Entry matched but refuses the operation; stop the walk.
    Deny(NiFail),
    /// Entry matched and permits the operation.
    Match,
}

/// A list entry. Matching entries additionally carry a [`MatchSpec`].
pub struct ListEntry {
    /// Exposed memory window.
    pub region: Sge,
    pub options: LeOptions,
    /// Required requester uid; `None` admits any.
    pub uid: Option<u32>,
    pub ct: Option<CtHandle>,
    pub user_ptr: u64,
    pub match_: Option<MatchSpec>,
    dyn_: Mutex<LeDyn>,
}

impl ListEntry {
    pub fn new(
        region: Sge,
        options: LeOptions,
        uid: Option<u32>,
        ct: Option<CtHandle>,
        user_ptr: u64,
        match_: Option<MatchSpec>,
    ) -> Self {
        Self {
            region,
            options,
            uid,
            ct,
            user_ptr,
            match_,
            dyn_: Mutex::new(LeDyn {
                local_offset: 0,
                linked: false,
                pt_index: 0,
                list: ListKind::Priority,
                unexpected_refs: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, LeDyn> {
        self.dyn_.lock().unwrap()
    }

    /// Test this entry against a request. The walk stops on `Deny`.
    pub fn check(&self, op: Op, match_bits: u64, initiator: ProcessId, uid: u32) -> MatchResult {
        if let Some(ms) = &self.match_ {
            if (match_bits ^ ms.match_bits) & !ms.ignore_bits != 0 {
                return MatchResult::NoMatch;
            }
            if let Some(id) = ms.id {
                if id != initiator {
                    return MatchResult::NoMatch;
                }
            }
        }

        if let Some(want) = self.uid {
            if want != uid {
                return MatchResult::Deny(NiFail::PermViolation);
            }
        }

        let permitted = match op {
            Op::Put | Op::Atomic => self.options.contains(LeOptions::OP_PUT),
            Op::Get => self.options.contains(LeOptions::OP_GET),
            Op::Fetch | Op::Swap => self
                .options
                .contains(LeOptions::OP_PUT | LeOptions::OP_GET),
            _ => false,
        };
        if !permitted {
            return MatchResult::Deny(NiFail::OpViolation);
        }

        MatchResult::Match
    }
}
