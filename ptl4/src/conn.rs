//! Per-peer connection records.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::handle::Handle;
use crate::soft::SoftQp;
use crate::types::ProcessId;

/// Transport selected for a connection. The tag stays on the record for
/// diagnostics and match-based dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Rdma,
    Shmem,
}

/// Connection lifecycle. The state never regresses except through the
/// disconnect path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Disconnected,
    ResolvingAddr,
    ResolvingRoute,
    Connecting,
    Connected,
    XrcConnected,
    Disconnecting,
}

/// Retries allowed per resolve / connect step.
pub const CONN_RETRIES: u8 = 3;

/// Mutable connection state, guarded by the connection mutex.
pub struct ConnInner {
    pub state: ConnState,
    pub qp: Option<SoftQp>,
    /// Transactions parked until the connection is usable.
    pub wait_list: VecDeque<Handle>,
    /// Local disconnect progress: 1 after sending the header, 2 after
    /// its send completion.
    pub local_disc: u8,
    /// Remote disconnect progress: 1 once the peer's header arrived.
    pub remote_disc: u8,
    pub retry_resolve_addr: u8,
    pub retry_resolve_route: u8,
    pub retry_connect: u8,
    /// Request a send completion every n sends (0 = every send).
    pub completion_threshold: u32,
    unsignalled: u32,
}

/// A connection to one peer.
pub struct Conn {
    pub id: ProcessId,
    pub kind: TransportKind,
    inner: Mutex<ConnInner>,
}

impl Conn {
    pub fn new(id: ProcessId, kind: TransportKind) -> Self {
        // Shared-memory peers need no wire handshake.
        let state = match kind {
            TransportKind::Shmem => ConnState::Connected,
            TransportKind::Rdma => ConnState::Disconnected,
        };
        Self {
            id,
            kind,
            inner: Mutex::new(ConnInner {
                state,
                qp: None,
                wait_list: VecDeque::new(),
                local_disc: 0,
                remote_disc: 0,
                retry_resolve_addr: CONN_RETRIES,
                retry_resolve_route: CONN_RETRIES,
                retry_connect: CONN_RETRIES,
                completion_threshold: 0,
                unsignalled: 0,
            }),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, ConnInner> {
        self.inner.lock().unwrap()
    }
}

impl ConnInner {
    /// Decide whether the next send requests a completion, amortising
    /// signalling cost over `completion_threshold` sends.
    pub fn next_signalled(&mut self) -> bool {
        if self.completion_threshold <= 1 {
            return true;
        }
        self.unsignalled += 1;
        if self.unsignalled >= self.completion_threshold {
            self.unsignalled = 0;
            true
        } else {
            false
        }
    }

    /// Reset the retry budgets for a fresh connect attempt.
    pub fn reset_retries(&mut self) {
        self.retry_resolve_addr = CONN_RETRIES;
        self.retry_resolve_route = CONN_RETRIES;
        self.retry_connect = CONN_RETRIES;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shmem_starts_connected() {
        let c = Conn::new(ProcessId::new(1, 1), TransportKind::Shmem);
        assert_eq!(c.lock().state, ConnState::Connected);
        let c = Conn::new(ProcessId::new(1, 1), TransportKind::Rdma);
        assert_eq!(c.lock().state, ConnState::Disconnected);
    }

    #[test]
    fn completion_threshold() {
        let c = Conn::new(ProcessId::new(1, 1), TransportKind::Rdma);
        let mut inner = c.lock();
        // Threshold 0/1: every send signalled.
        assert!(inner.next_signalled());
        assert!(inner.next_signalled());
        inner.completion_threshold = 3;
        assert!(!inner.next_signalled());
        assert!(!inner.next_signalled());
        assert!(inner.next_signalled());
        assert!(!inner.next_signalled());
    }
}
