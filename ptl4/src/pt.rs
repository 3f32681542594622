//! Portal table entries.
//!
//! A PT entry holds the priority and overflow lists plus the record of
//! unexpected messages captured by the overflow list. All list mutation
//! (append, unlink, search, match walks) happens under the per-entry
//! mutex.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use bitflags::bitflags;

use crate::handle::{EqHandle, Handle};
use crate::types::ProcessId;
use crate::wire::Op;

bitflags! {
    /// Portal table entry options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PtOptions: u32 {
        /// Disable the entry instead of dropping when resources run out.
        const FLOWCTRL = 1 << 0;
    }
}

/// Record of a message that matched only the overflow list.
#[derive(Debug, Clone)]
pub struct Unexpected {
    pub operation: Op,
    pub initiator: ProcessId,
    pub uid: u32,
    pub match_bits: u64,
    pub hdr_data: u64,
    pub rlength: u64,
    pub mlength: u64,
    pub roffset: u64,
    /// Overflow entry that captured the payload.
    pub le: Handle,
    /// Address the payload landed at inside the overflow buffer.
    pub start: u64,
}

/// Mutable portal-table-entry state.
pub struct PtState {
    pub allocated: bool,
    pub enabled: bool,
    pub options: PtOptions,
    pub eq: Option<EqHandle>,
    pub priority: VecDeque<Handle>,
    pub overflow: VecDeque<Handle>,
    pub unexpected: VecDeque<Unexpected>,
}

/// One slot of the portal table.
pub struct PtEntry {
    pub index: u32,
    state: Mutex<PtState>,
}

impl PtEntry {
    pub fn new(index: u32) -> Self {
        Self {
            index,
            state: Mutex::new(PtState {
                allocated: false,
                enabled: false,
                options: PtOptions::empty(),
                eq: None,
                priority: VecDeque::new(),
                overflow: VecDeque::new(),
                unexpected: VecDeque::new(),
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, PtState> {
        self.state.lock().unwrap()
    }
}

impl PtState {
    /// Remove a list-entry handle from whichever list holds it.
    pub fn remove_entry(&mut self, h: Handle) -> bool {
        if let Some(pos) = self.priority.iter().position(|&x| x == h) {
            self.priority.remove(pos);
            return true;
        }
        if let Some(pos) = self.overflow.iter().position(|&x| x == h) {
            self.overflow.remove(pos);
            return true;
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::HandleType;

    fn handle(i: u32) -> Handle {
        Handle::new(HandleType::Le, 0, 1, i)
    }

    #[test]
    fn remove_from_either_list() {
        let pt = PtEntry::new(0);
        let mut st = pt.lock();
        st.priority.push_back(handle(1));
        st.overflow.push_back(handle(2));

        assert!(st.remove_entry(handle(1)));
        assert!(st.remove_entry(handle(2)));
        assert!(!st.remove_entry(handle(3)));
        assert!(st.priority.is_empty());
        assert!(st.overflow.is_empty());
    }
}
