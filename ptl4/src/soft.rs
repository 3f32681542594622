//! Soft verbs fabric: the provider seam behind the RDMA transport.
//!
//! The real provider (queue pairs, completion queues, a shared receive
//! queue, a connection manager with private payloads) is out of scope
//! for the engine; this module supplies the same surface in-process so
//! loopback jobs and multi-interface single-process jobs run with no
//! hardware. Data transfers act directly on registered regions, and
//! connection management delivers the same event sequence a CM channel
//! would: resolve address, resolve route, connect request with private
//! data, accept / reject with a reason code.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use slab::Slab;

use crate::buffer::{Buf, BufType};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::types::ProcessId;
use crate::wire::Sge;

/// A registered memory window.
#[derive(Debug, Clone, Copy)]
pub struct MrRegion {
    base: *mut u8,
    len: usize,
}

unsafe impl Send for MrRegion {}
unsafe impl Sync for MrRegion {}

impl MrRegion {
    /// Copy out of the region. Bounds-checked against the registration.
    pub fn read(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let off = off as usize;
        if off + dst.len() > self.len {
            return Err(Error::ArgInvalid);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(off), dst.as_mut_ptr(), dst.len());
        }
        Ok(())
    }

    /// Copy into the region. Bounds-checked against the registration.
    pub fn write(&self, off: u64, src: &[u8]) -> Result<()> {
        let off = off as usize;
        if off + src.len() > self.len {
            return Err(Error::ArgInvalid);
        }
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(off), src.len());
        }
        Ok(())
    }

    /// Base address of the window.
    pub fn addr(&self) -> u64 {
        self.base as u64
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    Error,
}

/// What completed.
pub enum WcKind {
    Send { buf: Buf },
    Recv { buf: Buf },
    Rdma { xfer: Handle },
}

/// A work completion.
pub struct Wc {
    pub status: WcStatus,
    pub kind: WcKind,
}

/// Reject reason carried in the private payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    NoNi,
    GoodSrq,
    BadParam,
    Connected,
    Connecting,
    Error,
}

/// Connection-manager events delivered to a node.
pub enum CmEvent {
    AddrResolved { peer: ProcessId },
    AddrError { peer: ProcessId },
    RouteResolved { peer: ProcessId },
    RouteError { peer: ProcessId },
    ConnectRequest { from: ProcessId, ni_type: u8, token: u64 },
    Established { peer: ProcessId, qp: SoftQp },
    Rejected { peer: ProcessId, reason: RejectReason },
    ConnectError { peer: ProcessId },
}

struct PendingConnect {
    from: ProcessId,
    to: ProcessId,
}

/// The in-process fabric shared by every interface of a job.
pub struct SoftFabric {
    nodes: Mutex<HashMap<ProcessId, Arc<SoftNode>>>,
    pending: Mutex<HashMap<u64, PendingConnect>>,
    next_token: AtomicU64,
    rejects: Mutex<Vec<RejectReason>>,
}

impl SoftFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            nodes: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            next_token: AtomicU64::new(1),
            rejects: Mutex::new(Vec::new()),
        })
    }

    /// Register a node; fails with `PidInUse` on identity collision.
    pub(crate) fn add_node(self: &Arc<Self>, id: ProcessId, ni_type: u8) -> Result<Arc<SoftNode>> {
        let mut nodes = self.nodes.lock().unwrap();
        if nodes.contains_key(&id) {
            return Err(Error::PidInUse);
        }
        let node = Arc::new(SoftNode {
            id,
            ni_type,
            fabric: Arc::downgrade(self),
            cm: Mutex::new(VecDeque::new()),
            cq: Mutex::new(VecDeque::new()),
            rx: Mutex::new(RxState {
                srq: VecDeque::new(),
                backlog: VecDeque::new(),
            }),
            mrs: Mutex::new(Slab::new()),
        });
        nodes.insert(id, node.clone());
        Ok(node)
    }

    pub(crate) fn remove_node(&self, id: ProcessId) {
        self.nodes.lock().unwrap().remove(&id);
    }

    pub(crate) fn node(&self, id: ProcessId) -> Option<Arc<SoftNode>> {
        self.nodes.lock().unwrap().get(&id).cloned()
    }

    /// Rejects issued on this fabric, in order (diagnostics).
    pub fn rejects(&self) -> Vec<RejectReason> {
        self.rejects.lock().unwrap().clone()
    }
}

/// Receive state: posted buffers plus the backlog of messages that
/// arrived while none was free. One lock covers both so deliveries
/// stay in arrival order.
struct RxState {
    srq: VecDeque<Buf>,
    backlog: VecDeque<(ProcessId, Vec<u8>)>,
}

/// One interface's endpoint on the fabric.
pub struct SoftNode {
    pub id: ProcessId,
    ni_type: u8,
    fabric: Weak<SoftFabric>,
    cm: Mutex<VecDeque<CmEvent>>,
    cq: Mutex<VecDeque<Wc>>,
    rx: Mutex<RxState>,
    mrs: Mutex<Slab<MrRegion>>,
}

impl SoftNode {
    /// Register a memory window, yielding its cookie.
    ///
    /// # Safety
    /// The memory must stay valid and writable until deregistered.
    pub unsafe fn register(&self, base: *mut u8, len: usize) -> u32 {
        self.mrs.lock().unwrap().insert(MrRegion { base, len }) as u32
    }

    pub fn deregister(&self, cookie: u32) {
        let mut mrs = self.mrs.lock().unwrap();
        if mrs.contains(cookie as usize) {
            mrs.remove(cookie as usize);
        }
    }

    /// Resolve a cookie to its registered window.
    pub fn mr(&self, cookie: u32) -> Option<MrRegion> {
        self.mrs.lock().unwrap().get(cookie as usize).copied()
    }

    fn push_cm(&self, ev: CmEvent) {
        self.cm.lock().unwrap().push_back(ev);
    }

    fn push_wc(&self, wc: Wc) {
        self.cq.lock().unwrap().push_back(wc);
    }

    /// Pop one connection-manager event.
    pub fn poll_cm(&self) -> Option<CmEvent> {
        self.cm.lock().unwrap().pop_front()
    }

    /// Drain up to `max` work completions into `out`.
    pub fn poll_cq(&self, max: usize, out: &mut Vec<Wc>) -> usize {
        let mut cq = self.cq.lock().unwrap();
        let n = max.min(cq.len());
        for _ in 0..n {
            out.push(cq.pop_front().unwrap());
        }
        n
    }

    /// Post a receive buffer, then satisfy any backlogged deliveries.
    pub fn post_recv(&self, buf: Buf) {
        let mut rx = self.rx.lock().unwrap();
        rx.srq.push_back(buf);
        while !rx.backlog.is_empty() && !rx.srq.is_empty() {
            let (src, bytes) = rx.backlog.pop_front().unwrap();
            let buf = rx.srq.pop_front().unwrap();
            self.fill_and_complete(buf, src, &bytes);
        }
    }

    /// Receive buffers currently posted.
    pub fn srq_count(&self) -> usize {
        self.rx.lock().unwrap().srq.len()
    }

    /// Take back every posted receive buffer (teardown).
    pub(crate) fn drain_srq(&self) -> Vec<Buf> {
        self.rx.lock().unwrap().srq.drain(..).collect()
    }

    fn fill_and_complete(&self, mut buf: Buf, src: ProcessId, bytes: &[u8]) {
        let n = bytes.len().min(buf.data.len());
        buf.data[..n].copy_from_slice(&bytes[..n]);
        buf.len = n;
        buf.typ = BufType::Recv;
        buf.src = src;
        self.push_wc(Wc {
            status: WcStatus::Success,
            kind: WcKind::Recv { buf },
        });
    }

    /// Deliver in arrival order: straight into a posted buffer when the
    /// backlog is clear, behind it otherwise.
    fn deliver_or_backlog(&self, src: ProcessId, bytes: &[u8]) {
        let mut rx = self.rx.lock().unwrap();
        if rx.backlog.is_empty() {
            if let Some(buf) = rx.srq.pop_front() {
                self.fill_and_complete(buf, src, bytes);
                return;
            }
        }
        rx.backlog.push_back((src, bytes.to_vec()));
    }

    /// Begin address resolution toward `peer`.
    pub fn resolve_addr(&self, peer: ProcessId) {
        let found = self
            .fabric
            .upgrade()
            .and_then(|f| f.node(peer))
            .is_some();
        self.push_cm(if found {
            CmEvent::AddrResolved { peer }
        } else {
            CmEvent::AddrError { peer }
        });
    }

    /// Begin route resolution toward `peer`.
    pub fn resolve_route(&self, peer: ProcessId) {
        let found = self
            .fabric
            .upgrade()
            .and_then(|f| f.node(peer))
            .is_some();
        self.push_cm(if found {
            CmEvent::RouteResolved { peer }
        } else {
            CmEvent::RouteError { peer }
        });
    }

    /// Send a connect request carrying our identity and flavour.
    pub fn connect(&self, peer: ProcessId) {
        let Some(fabric) = self.fabric.upgrade() else {
            self.push_cm(CmEvent::ConnectError { peer });
            return;
        };
        let Some(remote) = fabric.node(peer) else {
            self.push_cm(CmEvent::ConnectError { peer });
            return;
        };
        let token = fabric.next_token.fetch_add(1, Ordering::Relaxed);
        fabric.pending.lock().unwrap().insert(
            token,
            PendingConnect {
                from: self.id,
                to: peer,
            },
        );
        remote.push_cm(CmEvent::ConnectRequest {
            from: self.id,
            ni_type: self.ni_type,
            token,
        });
    }

    /// Accept a pending connect request; both sides get `Established`.
    pub fn accept(self: &Arc<Self>, token: u64) -> Result<()> {
        let fabric = self.fabric.upgrade().ok_or(Error::NoInit)?;
        let pending = fabric
            .pending
            .lock()
            .unwrap()
            .remove(&token)
            .ok_or(Error::ArgInvalid)?;
        if pending.to != self.id {
            return Err(Error::ArgInvalid);
        }
        let requester = fabric.node(pending.from).ok_or(Error::Fail)?;

        requester.push_cm(CmEvent::Established {
            peer: self.id,
            qp: SoftQp {
                local: requester.clone(),
                peer: self.clone(),
            },
        });
        self.push_cm(CmEvent::Established {
            peer: requester.id,
            qp: SoftQp {
                local: self.clone(),
                peer: requester,
            },
        });
        Ok(())
    }

    /// Accept a connect request from self (loopback).
    pub fn accept_self(self: &Arc<Self>, token: u64) -> Result<()> {
        let fabric = self.fabric.upgrade().ok_or(Error::NoInit)?;
        let pending = fabric
            .pending
            .lock()
            .unwrap()
            .remove(&token)
            .ok_or(Error::ArgInvalid)?;
        if pending.from != self.id || pending.to != self.id {
            return Err(Error::ArgInvalid);
        }
        self.push_cm(CmEvent::Established {
            peer: self.id,
            qp: SoftQp {
                local: self.clone(),
                peer: self.clone(),
            },
        });
        Ok(())
    }

    /// Reject a pending connect request with a reason.
    pub fn reject(&self, token: u64, reason: RejectReason) {
        let Some(fabric) = self.fabric.upgrade() else {
            return;
        };
        let Some(pending) = fabric.pending.lock().unwrap().remove(&token) else {
            return;
        };
        fabric.rejects.lock().unwrap().push(reason);
        if let Some(requester) = fabric.node(pending.from) {
            requester.push_cm(CmEvent::Rejected {
                peer: pending.to,
                reason,
            });
        }
    }
}

/// A connected queue pair.
pub struct SoftQp {
    local: Arc<SoftNode>,
    peer: Arc<SoftNode>,
}

impl SoftQp {
    pub fn peer_id(&self) -> ProcessId {
        self.peer.id
    }

    fn peer_alive(&self) -> bool {
        self.local
            .fabric
            .upgrade()
            .and_then(|f| f.node(self.peer.id))
            .is_some()
    }

    /// Post a send. A completion is always generated; `buf.signalled`
    /// records whether the caller asked for one.
    pub fn post_send(&self, buf: Buf) {
        if !self.peer_alive() {
            self.local.push_wc(Wc {
                status: WcStatus::Error,
                kind: WcKind::Send { buf },
            });
            return;
        }
        self.peer.deliver_or_backlog(self.local.id, buf.bytes());
        self.local.push_wc(Wc {
            status: WcStatus::Success,
            kind: WcKind::Send { buf },
        });
    }

    fn finish_rdma(&self, xfer: Handle, res: Result<()>) {
        self.local.push_wc(Wc {
            status: if res.is_ok() {
                WcStatus::Success
            } else {
                WcStatus::Error
            },
            kind: WcKind::Rdma { xfer },
        });
    }

    /// Read `remote` (a window on the peer) into `local`.
    pub fn post_rdma_read(&self, xfer: Handle, local: Sge, remote: Sge) {
        let res = (|| {
            if local.len != remote.len || !self.peer_alive() {
                return Err(Error::ArgInvalid);
            }
            let src = self.peer.mr(remote.cookie).ok_or(Error::ArgInvalid)?;
            let dst = self.local.mr(local.cookie).ok_or(Error::ArgInvalid)?;
            let mut tmp = vec![0u8; local.len as usize];
            src.read(remote.offset, &mut tmp)?;
            dst.write(local.offset, &tmp)
        })();
        self.finish_rdma(xfer, res);
    }

    /// Write `local` into `remote` (a window on the peer).
    pub fn post_rdma_write(&self, xfer: Handle, local: Sge, remote: Sge) {
        let res = (|| {
            if local.len != remote.len || !self.peer_alive() {
                return Err(Error::ArgInvalid);
            }
            let src = self.local.mr(local.cookie).ok_or(Error::ArgInvalid)?;
            let dst = self.peer.mr(remote.cookie).ok_or(Error::ArgInvalid)?;
            let mut tmp = vec![0u8; local.len as usize];
            src.read(local.offset, &mut tmp)?;
            dst.write(remote.offset, &tmp)
        })();
        self.finish_rdma(xfer, res);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ProcessId = ProcessId { nid: 1, pid: 1 };
    const B: ProcessId = ProcessId { nid: 1, pid: 2 };

    fn pair() -> (Arc<SoftFabric>, Arc<SoftNode>, Arc<SoftNode>) {
        let fabric = SoftFabric::new();
        let a = fabric.add_node(A, 0).unwrap();
        let b = fabric.add_node(B, 0).unwrap();
        (fabric, a, b)
    }

    fn establish(a: &Arc<SoftNode>, b: &Arc<SoftNode>) -> (SoftQp, SoftQp) {
        a.connect(b.id);
        let token = match b.poll_cm() {
            Some(CmEvent::ConnectRequest { token, .. }) => token,
            _ => panic!("expected connect request"),
        };
        b.accept(token).unwrap();
        let qp_a = match a.poll_cm() {
            Some(CmEvent::Established { qp, .. }) => qp,
            _ => panic!("expected established"),
        };
        let qp_b = match b.poll_cm() {
            Some(CmEvent::Established { qp, .. }) => qp,
            _ => panic!("expected established"),
        };
        (qp_a, qp_b)
    }

    #[test]
    fn duplicate_pid_rejected() {
        let fabric = SoftFabric::new();
        fabric.add_node(A, 0).unwrap();
        assert!(matches!(fabric.add_node(A, 0), Err(Error::PidInUse)));
    }

    #[test]
    fn send_recv_through_srq() {
        let (_f, a, b) = pair();
        let (qp_a, _qp_b) = establish(&a, &b);

        b.post_recv(Buf::new());

        let mut buf = Buf::new();
        buf.data[..4].copy_from_slice(b"ping");
        buf.len = 4;
        buf.signalled = true;
        qp_a.post_send(buf);

        let mut wcs = Vec::new();
        assert_eq!(a.poll_cq(16, &mut wcs), 1);
        assert!(matches!(
            &wcs[0],
            Wc {
                status: WcStatus::Success,
                kind: WcKind::Send { .. }
            }
        ));

        let mut wcs = Vec::new();
        assert_eq!(b.poll_cq(16, &mut wcs), 1);
        match &wcs[0].kind {
            WcKind::Recv { buf } => {
                assert_eq!(buf.bytes(), b"ping");
                assert_eq!(buf.src, A);
            }
            _ => panic!("expected recv"),
        }
    }

    #[test]
    fn backlog_when_srq_empty() {
        let (_f, a, b) = pair();
        let (qp_a, _qp_b) = establish(&a, &b);

        let mut buf = Buf::new();
        buf.data[..2].copy_from_slice(b"hi");
        buf.len = 2;
        qp_a.post_send(buf);

        let mut wcs = Vec::new();
        assert_eq!(b.poll_cq(16, &mut wcs), 0);

        b.post_recv(Buf::new());
        let mut wcs = Vec::new();
        assert_eq!(b.poll_cq(16, &mut wcs), 1);
    }

    #[test]
    fn rdma_read_write() {
        let (_f, a, b) = pair();
        let (qp_a, _qp_b) = establish(&a, &b);

        let mut mem_a = vec![0u8; 64].into_boxed_slice();
        mem_a[..4].copy_from_slice(b"abcd");
        let mut mem_b = vec![0u8; 64].into_boxed_slice();
        let ck_a = unsafe { a.register(mem_a.as_mut_ptr(), 64) };
        let ck_b = unsafe { b.register(mem_b.as_mut_ptr(), 64) };

        // a writes its bytes into b's region.
        qp_a.post_rdma_write(
            Handle::NONE,
            Sge { cookie: ck_a, offset: 0, len: 4 },
            Sge { cookie: ck_b, offset: 8, len: 4 },
        );
        let mut wcs = Vec::new();
        assert_eq!(a.poll_cq(16, &mut wcs), 1);
        assert!(matches!(wcs[0].status, WcStatus::Success));
        assert_eq!(&mem_b[8..12], b"abcd");

        // a reads them back elsewhere in its own region.
        qp_a.post_rdma_read(
            Handle::NONE,
            Sge { cookie: ck_a, offset: 32, len: 4 },
            Sge { cookie: ck_b, offset: 8, len: 4 },
        );
        let mut wcs = Vec::new();
        assert_eq!(a.poll_cq(16, &mut wcs), 1);
        assert_eq!(&mem_a[32..36], b"abcd");
    }

    #[test]
    fn reject_reaches_requester() {
        let (fabric, a, b) = pair();
        a.connect(b.id);
        let token = match b.poll_cm() {
            Some(CmEvent::ConnectRequest { token, .. }) => token,
            _ => panic!(),
        };
        b.reject(token, RejectReason::Connecting);
        match a.poll_cm() {
            Some(CmEvent::Rejected { peer, reason }) => {
                assert_eq!(peer, B);
                assert_eq!(reason, RejectReason::Connecting);
            }
            _ => panic!("expected rejection"),
        }
        assert_eq!(fabric.rejects(), vec![RejectReason::Connecting]);
    }

    #[test]
    fn loopback_self_accept() {
        let fabric = SoftFabric::new();
        let a = fabric.add_node(A, 0).unwrap();
        a.connect(a.id);
        let token = match a.poll_cm() {
            Some(CmEvent::ConnectRequest { from, token, .. }) => {
                assert_eq!(from, A);
                token
            }
            _ => panic!(),
        };
        a.accept_self(token).unwrap();
        let qp = match a.poll_cm() {
            Some(CmEvent::Established { peer, qp }) => {
                assert_eq!(peer, A);
                qp
            }
            _ => panic!(),
        };

        a.post_recv(Buf::new());
        let mut buf = Buf::new();
        buf.data[..3].copy_from_slice(b"own");
        buf.len = 3;
        qp.post_send(buf);
        let mut wcs = Vec::new();
        // Send completion plus the loopback receive.
        assert_eq!(a.poll_cq(16, &mut wcs), 2);
    }
}
