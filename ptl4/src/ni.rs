//! Network interface: object pools, portal table, connection set,
//! transport state and the public operation surface.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::atomics::{self, AtomOp, AtomType};
use crate::buffer::BufPool;
use crate::config::{log_level_filter, NiConfig, NiLimits, Param, ShmemAttach};
use crate::conn::{Conn, ConnState, TransportKind};
use crate::ct::{Ct, CtEvent, Triggered, TriggeredAction};
use crate::eq::Eq;
use crate::error::{Error, Result};
use crate::handle::{CtHandle, EqHandle, Handle, HandleType, LeHandle, MdHandle};
use crate::le::{LeOptions, ListEntry, MatchSpec};
use crate::md::{Md, MdOptions};
use crate::pool::Pool;
use crate::pt::{PtEntry, PtOptions};
use crate::soft::{SoftFabric, SoftNode};
use crate::transport::{RdmaTransport, ShmemTransport, Transport};
use crate::types::{
    AckReq, Event, EventKind, ListKind, NiOptions, NiStatus, Position, ProcessId, SearchOp,
    TargetId,
};
use crate::wire::{Op, Sge};
use crate::xfer::{OpArgs, Xfer};

static NEXT_NI_INDEX: AtomicU8 = AtomicU8::new(0);

/// Typed object pools owned by one interface.
pub(crate) struct Pools {
    pub les: Pool<ListEntry>,
    pub mds: Pool<Md>,
    pub cts: Pool<Ct>,
    pub eqs: Pool<Eq>,
    pub xfers: Pool<Xfer>,
}

/// Connection set: dense rank table for logical interfaces, an ordered
/// tree keyed by `(nid, pid)` for physical ones.
pub(crate) enum ConnTable {
    Logical(RwLock<Vec<Arc<Conn>>>),
    Physical(Mutex<BTreeMap<ProcessId, Arc<Conn>>>),
}

pub(crate) struct ShmemNi {
    pub attach: ShmemAttach,
}

/// Interface internals, shared with the progress thread.
pub(crate) struct NiInner {
    pub index: u8,
    pub options: NiOptions,
    pub id: ProcessId,
    pub uid: u32,
    pub limits: NiLimits,
    pub hard_polling: bool,
    pub wc_count: usize,
    pub srq_repost_size: usize,
    pub max_inline: usize,
    pub srq_depth: usize,

    pub fabric: Arc<SoftFabric>,
    pub node: Arc<SoftNode>,
    pub shmem: Option<ShmemNi>,
    pub rdma_transport: RdmaTransport,
    pub shmem_transport: Option<ShmemTransport>,

    pub pools: Pools,
    pub pts: Box<[PtEntry]>,
    pub conns: ConnTable,
    pub rank_map: RwLock<Vec<ProcessId>>,
    pub my_rank: RwLock<Option<u32>>,
    pub bufs: BufPool,

    pub catcher_stop: AtomicBool,
    pub finished: AtomicBool,
    pub progress: Mutex<Option<std::thread::JoinHandle<()>>>,
    /// Live initiator transactions (drained before teardown).
    pub pending: AtomicU64,
    pub num_recv_drops: AtomicU64,
    pub num_recv_errs: AtomicU64,
    pub num_disc_recv: AtomicU64,
}

/// A network interface.
#[derive(Clone)]
pub struct Ni {
    pub(crate) inner: Arc<NiInner>,
}

impl Ni {
    /// Bring up an interface: pools, portal table, transport endpoint
    /// and the progress thread.
    pub fn init(config: NiConfig) -> Result<Ni> {
        // Honour PTL_LOG_LEVEL without silencing an installed logger.
        let wanted = log_level_filter();
        if wanted > log::max_level() {
            log::set_max_level(wanted);
        }

        let index = NEXT_NI_INDEX.fetch_add(1, Ordering::Relaxed);
        let node = config.fabric.add_node(config.id, config.options.ni_type())?;

        if let Some(attach) = &config.shmem {
            attach.job.attach(attach.local_rank, config.id.pid)?;
        }

        let limits = config.limits;
        let pts = (0..=limits.max_pt_index)
            .map(PtEntry::new)
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let conns = if config.options.contains(NiOptions::LOGICAL) {
            ConnTable::Logical(RwLock::new(Vec::new()))
        } else {
            ConnTable::Physical(Mutex::new(BTreeMap::new()))
        };

        let shmem_transport = config.shmem.as_ref().map(|attach| ShmemTransport {
            job: attach.job.clone(),
            my_rank: attach.local_rank,
            node: node.clone(),
            fabric: config.fabric.clone(),
        });

        let bufs = BufPool::new(config.num_buffers);
        // Keep receives posted with the transport from the start.
        for _ in 0..config.srq_depth {
            node.post_recv(bufs.alloc()?);
        }

        let inner = Arc::new(NiInner {
            index,
            options: config.options,
            id: config.id,
            uid: config.uid,
            limits,
            hard_polling: config.hard_polling,
            wc_count: Param::WcCount.get() as usize,
            srq_repost_size: Param::SrqRepostSize.get() as usize,
            max_inline: Param::MaxInline.get() as usize,
            srq_depth: config.srq_depth,
            fabric: config.fabric.clone(),
            node,
            shmem: config.shmem.clone().map(|attach| ShmemNi { attach }),
            rdma_transport: RdmaTransport,
            shmem_transport,
            pools: Pools {
                les: Pool::new(HandleType::Le, index, limits.max_entries),
                mds: Pool::new(HandleType::Md, index, limits.max_mds),
                cts: Pool::new(HandleType::Ct, index, limits.max_cts),
                eqs: Pool::new(HandleType::Eq, index, limits.max_eqs),
                xfers: Pool::new(HandleType::Xfer, index, limits.max_entries * 4),
            },
            pts,
            conns,
            rank_map: RwLock::new(Vec::new()),
            my_rank: RwLock::new(None),
            bufs,
            catcher_stop: AtomicBool::new(false),
            finished: AtomicBool::new(false),
            progress: Mutex::new(None),
            pending: AtomicU64::new(0),
            num_recv_drops: AtomicU64::new(0),
            num_recv_errs: AtomicU64::new(0),
            num_disc_recv: AtomicU64::new(0),
        });

        let thread_inner = inner.clone();
        let handle = std::thread::Builder::new()
            .name(format!("ptl4-progress-{}", index))
            .spawn(move || thread_inner.progress_loop())
            .map_err(Error::Io)?;
        *inner.progress.lock().unwrap() = Some(handle);

        log::debug!(
            "ni {} up: id={:?} options={:?}",
            index,
            config.id,
            config.options
        );
        Ok(Ni { inner })
    }

    pub fn id(&self) -> ProcessId {
        self.inner.id
    }

    pub fn options(&self) -> NiOptions {
        self.inner.options
    }

    pub fn status(&self) -> NiStatus {
        NiStatus {
            recv_drops: self.inner.num_recv_drops.load(Ordering::Relaxed),
            recv_errs: self.inner.num_recv_errs.load(Ordering::Relaxed),
            disc_recv: self.inner.num_disc_recv.load(Ordering::Relaxed),
        }
    }

    /// Message buffers currently free (leak accounting).
    pub fn buf_available(&self) -> usize {
        self.inner.bufs.available()
    }

    pub fn buf_total(&self) -> usize {
        self.inner.bufs.total()
    }

    /// Install the dense rank map of a logical interface. Creates one
    /// connection record per rank.
    pub fn set_map(&self, map: Vec<ProcessId>) -> Result<()> {
        let inner = &self.inner;
        if !inner.options.contains(NiOptions::LOGICAL) {
            return Err(Error::ArgInvalid);
        }
        let ConnTable::Logical(table) = &inner.conns else {
            return Err(Error::ArgInvalid);
        };
        let conns = map
            .iter()
            .map(|&peer| Arc::new(Conn::new(peer, inner.transport_kind_for(peer))))
            .collect::<Vec<_>>();
        let my_rank = map.iter().position(|&p| p == inner.id).map(|r| r as u32);
        *table.write().unwrap() = conns;
        *inner.rank_map.write().unwrap() = map;
        *inner.my_rank.write().unwrap() = my_rank;
        Ok(())
    }

    /// Register a memory window with the transport.
    ///
    /// # Safety
    /// The memory must stay valid until the interface is torn down or
    /// the cookie deregistered.
    pub unsafe fn register_region(&self, base: *mut u8, len: usize) -> u32 {
        unsafe { self.inner.node.register(base, len) }
    }

    pub fn deregister_region(&self, cookie: u32) {
        self.inner.node.deregister(cookie);
    }

    // ----- portal table -------------------------------------------------

    /// Allocate a portal table entry; `desired` pins the index.
    pub fn pt_alloc(
        &self,
        options: PtOptions,
        eq: Option<EqHandle>,
        desired: Option<u32>,
    ) -> Result<u32> {
        if let Some(eq) = eq {
            self.inner.pools.eqs.lookup(eq.0)?;
        }
        let pick = |pt: &PtEntry| -> bool {
            let mut st = pt.lock();
            if st.allocated {
                return false;
            }
            st.allocated = true;
            st.enabled = true;
            st.options = options;
            st.eq = eq;
            true
        };
        match desired {
            Some(i) => {
                let pt = self.inner.pt(i)?;
                if pick(pt) {
                    Ok(i)
                } else {
                    Err(Error::InUse)
                }
            }
            None => self
                .inner
                .pts
                .iter()
                .find(|pt| pick(pt))
                .map(|pt| pt.index)
                .ok_or(Error::NoSpace),
        }
    }

    pub fn pt_free(&self, pt_index: u32) -> Result<()> {
        let pt = self.inner.pt(pt_index)?;
        let mut st = pt.lock();
        if !st.allocated {
            return Err(Error::ArgInvalid);
        }
        if !st.priority.is_empty() || !st.overflow.is_empty() {
            return Err(Error::InUse);
        }
        st.allocated = false;
        st.enabled = false;
        st.eq = None;
        st.unexpected.clear();
        Ok(())
    }

    pub fn pt_enable(&self, pt_index: u32) -> Result<()> {
        let pt = self.inner.pt(pt_index)?;
        let mut st = pt.lock();
        if !st.allocated {
            return Err(Error::ArgInvalid);
        }
        st.enabled = true;
        Ok(())
    }

    pub fn pt_disable(&self, pt_index: u32) -> Result<()> {
        let pt = self.inner.pt(pt_index)?;
        let mut st = pt.lock();
        if !st.allocated {
            return Err(Error::ArgInvalid);
        }
        st.enabled = false;
        Ok(())
    }

    // ----- event queues -------------------------------------------------

    pub fn eq_alloc(&self, count: usize) -> Result<EqHandle> {
        if count == 0 {
            return Err(Error::ArgInvalid);
        }
        let (h, _) = self.inner.pools.eqs.alloc(Eq::new(count))?;
        Ok(EqHandle(h))
    }

    pub fn eq_get(&self, eq: EqHandle) -> Result<Event> {
        self.inner.pools.eqs.lookup(eq.0)?.get()
    }

    pub fn eq_wait(&self, eq: EqHandle) -> Result<Event> {
        self.inner.pools.eqs.lookup(eq.0)?.wait()
    }

    pub fn eq_wait_timeout(&self, eq: EqHandle, timeout: Duration) -> Result<Event> {
        self.inner.pools.eqs.lookup(eq.0)?.wait_timeout(timeout)
    }

    pub fn eq_free(&self, eq: EqHandle) -> Result<()> {
        let q = self.inner.pools.eqs.release(eq.0)?;
        q.interrupt();
        Ok(())
    }

    // ----- counting events ----------------------------------------------

    pub fn ct_alloc(&self) -> Result<CtHandle> {
        let (h, _) = self.inner.pools.cts.alloc(Ct::new())?;
        Ok(CtHandle(h))
    }

    pub fn ct_get(&self, ct: CtHandle) -> Result<CtEvent> {
        Ok(self.inner.pools.cts.lookup(ct.0)?.get())
    }

    pub fn ct_set(&self, ct: CtHandle, value: CtEvent) -> Result<()> {
        let fired = self.inner.pools.cts.lookup(ct.0)?.set(value);
        self.inner.dispatch_triggered(fired);
        Ok(())
    }

    pub fn ct_inc(&self, ct: CtHandle, incr: CtEvent) -> Result<()> {
        let fired = self.inner.pools.cts.lookup(ct.0)?.inc(incr);
        self.inner.dispatch_triggered(fired);
        Ok(())
    }

    pub fn ct_wait(&self, ct: CtHandle, threshold: u64) -> Result<CtEvent> {
        self.inner.pools.cts.lookup(ct.0)?.wait(threshold)
    }

    pub fn ct_wait_timeout(
        &self,
        ct: CtHandle,
        threshold: u64,
        timeout: Duration,
    ) -> Result<CtEvent> {
        self.inner
            .pools
            .cts
            .lookup(ct.0)?
            .wait_timeout(threshold, timeout)
    }

    /// Wait until any counter of the set reaches its threshold.
    pub fn ct_poll(
        &self,
        cts: &[CtHandle],
        thresholds: &[u64],
        timeout: Duration,
    ) -> Result<(usize, CtEvent)> {
        if cts.len() != thresholds.len() || cts.is_empty() {
            return Err(Error::ArgInvalid);
        }
        let deadline = Instant::now() + timeout;
        loop {
            for (i, (&ct, &thr)) in cts.iter().zip(thresholds).enumerate() {
                let c = self.inner.pools.cts.lookup(ct.0)?;
                let ev = c.get();
                if ev.success + ev.failure >= thr {
                    return Ok((i, ev));
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::CtNoneReached);
            }
            std::thread::sleep(Duration::from_micros(50));
        }
    }

    pub fn ct_cancel_triggered(&self, ct: CtHandle) -> Result<()> {
        self.inner.pools.cts.lookup(ct.0)?.cancel_triggered();
        Ok(())
    }

    pub fn ct_free(&self, ct: CtHandle) -> Result<()> {
        let c = self.inner.pools.cts.release(ct.0)?;
        c.cancel_triggered();
        c.interrupt();
        Ok(())
    }

    // ----- memory descriptors -------------------------------------------

    pub fn md_bind(
        &self,
        region: Sge,
        eq: Option<EqHandle>,
        ct: Option<CtHandle>,
        options: MdOptions,
    ) -> Result<MdHandle> {
        self.md_bind_iovec(vec![region], eq, ct, options)
    }

    pub fn md_bind_iovec(
        &self,
        segments: Vec<Sge>,
        eq: Option<EqHandle>,
        ct: Option<CtHandle>,
        options: MdOptions,
    ) -> Result<MdHandle> {
        if segments.is_empty() {
            return Err(Error::ArgInvalid);
        }
        if let Some(eq) = eq {
            self.inner.pools.eqs.lookup(eq.0)?;
        }
        if let Some(ct) = ct {
            self.inner.pools.cts.lookup(ct.0)?;
        }
        let (h, _) = self
            .inner
            .pools
            .mds
            .alloc(Md::new(segments, eq, ct, options))?;
        Ok(MdHandle(h))
    }

    pub fn md_release(&self, md: MdHandle) -> Result<()> {
        self.inner.pools.mds.release(md.0)?;
        Ok(())
    }

    // ----- list entries -------------------------------------------------

    /// Append a non-matching entry.
    #[allow(clippy::too_many_arguments)]
    pub fn le_append(
        &self,
        pt_index: u32,
        region: Sge,
        options: LeOptions,
        uid: Option<u32>,
        ct: Option<CtHandle>,
        user_ptr: u64,
        list: ListKind,
        pos: Position,
    ) -> Result<LeHandle> {
        if self.inner.options.contains(NiOptions::MATCHING) {
            return Err(Error::ArgInvalid);
        }
        self.inner
            .append_entry(pt_index, region, options, uid, ct, user_ptr, None, list, pos)
    }

    /// Append a matching entry.
    #[allow(clippy::too_many_arguments)]
    pub fn me_append(
        &self,
        pt_index: u32,
        region: Sge,
        options: LeOptions,
        uid: Option<u32>,
        ct: Option<CtHandle>,
        user_ptr: u64,
        spec: MatchSpec,
        list: ListKind,
        pos: Position,
    ) -> Result<LeHandle> {
        if !self.inner.options.contains(NiOptions::MATCHING) {
            return Err(Error::ArgInvalid);
        }
        self.inner.append_entry(
            pt_index,
            region,
            options,
            uid,
            ct,
            user_ptr,
            Some(spec),
            list,
            pos,
        )
    }

    /// Unlink an entry from its list. The handle becomes invalid once
    /// no unexpected-message record references the entry.
    pub fn le_unlink(&self, le: LeHandle) -> Result<()> {
        self.inner.unlink_entry(le.0, false)
    }

    /// Search the unexpected list of a matching interface.
    pub fn me_search(
        &self,
        pt_index: u32,
        match_bits: u64,
        ignore_bits: u64,
        op: SearchOp,
        user_ptr: u64,
    ) -> Result<()> {
        self.inner
            .search_unexpected(pt_index, Some((match_bits, ignore_bits)), op, user_ptr)
    }

    /// Search the unexpected list of a non-matching interface.
    pub fn le_search(&self, pt_index: u32, op: SearchOp, user_ptr: u64) -> Result<()> {
        self.inner.search_unexpected(pt_index, None, op, user_ptr)
    }

    // ----- data movement ------------------------------------------------

    #[allow(clippy::too_many_arguments)]
    pub fn put(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
    ) -> Result<()> {
        self.inner.start_op(OpArgs {
            op: Op::Put,
            target,
            pt_index,
            match_bits,
            remote_offset,
            ack_req,
            hdr_data,
            user_ptr,
            put_md: Some(md),
            put_offset: local_offset,
            get_md: None,
            get_offset: 0,
            length,
            atom_op: None,
            atom_type: None,
            operand: [0; 16],
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn get(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
    ) -> Result<()> {
        self.inner.start_op(OpArgs {
            op: Op::Get,
            target,
            pt_index,
            match_bits,
            remote_offset,
            ack_req: AckReq::NoAck,
            hdr_data: 0,
            user_ptr,
            put_md: None,
            put_offset: 0,
            get_md: Some(md),
            get_offset: local_offset,
            length,
            atom_op: None,
            atom_type: None,
            operand: [0; 16],
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn atomic(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        atom_op: AtomOp,
        atom_type: AtomType,
    ) -> Result<()> {
        self.inner.start_op(OpArgs {
            op: Op::Atomic,
            target,
            pt_index,
            match_bits,
            remote_offset,
            ack_req,
            hdr_data,
            user_ptr,
            put_md: Some(md),
            put_offset: local_offset,
            get_md: None,
            get_offset: 0,
            length,
            atom_op: Some(atom_op),
            atom_type: Some(atom_type),
            operand: [0; 16],
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn fetch_atomic(
        &self,
        get_md: MdHandle,
        local_get_offset: u64,
        put_md: MdHandle,
        local_put_offset: u64,
        length: u64,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        atom_op: AtomOp,
        atom_type: AtomType,
    ) -> Result<()> {
        self.inner.start_op(OpArgs {
            op: Op::Fetch,
            target,
            pt_index,
            match_bits,
            remote_offset,
            ack_req: AckReq::NoAck,
            hdr_data,
            user_ptr,
            put_md: Some(put_md),
            put_offset: local_put_offset,
            get_md: Some(get_md),
            get_offset: local_get_offset,
            length,
            atom_op: Some(atom_op),
            atom_type: Some(atom_type),
            operand: [0; 16],
        })
    }

    #[allow(clippy::too_many_arguments)]
    pub fn swap(
        &self,
        get_md: MdHandle,
        local_get_offset: u64,
        put_md: MdHandle,
        local_put_offset: u64,
        length: u64,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        operand: &[u8],
        atom_op: AtomOp,
        atom_type: AtomType,
    ) -> Result<()> {
        let mut op16 = [0u8; 16];
        let n = operand.len().min(16);
        op16[..n].copy_from_slice(&operand[..n]);
        self.inner.start_op(OpArgs {
            op: Op::Swap,
            target,
            pt_index,
            match_bits,
            remote_offset,
            ack_req: AckReq::NoAck,
            hdr_data,
            user_ptr,
            put_md: Some(put_md),
            put_offset: local_put_offset,
            get_md: Some(get_md),
            get_offset: local_get_offset,
            length,
            atom_op: Some(atom_op),
            atom_type: Some(atom_type),
            operand: op16,
        })
    }

    // ----- triggered operations -----------------------------------------

    fn arm(&self, ct: CtHandle, threshold: u64, args: OpArgs) -> Result<()> {
        self.inner.validate_op(&args)?;
        let c = self.inner.pools.cts.lookup(ct.0)?;
        if let Some(t) = c.arm(Triggered {
            threshold,
            action: TriggeredAction::Op(Box::new(args)),
        }) {
            self.inner.dispatch_triggered(vec![t]);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_put(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        ct: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        self.arm(
            ct,
            threshold,
            OpArgs {
                op: Op::Put,
                target,
                pt_index,
                match_bits,
                remote_offset,
                ack_req,
                hdr_data,
                user_ptr,
                put_md: Some(md),
                put_offset: local_offset,
                get_md: None,
                get_offset: 0,
                length,
                atom_op: None,
                atom_type: None,
                operand: [0; 16],
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_get(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        ct: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        self.arm(
            ct,
            threshold,
            OpArgs {
                op: Op::Get,
                target,
                pt_index,
                match_bits,
                remote_offset,
                ack_req: AckReq::NoAck,
                hdr_data: 0,
                user_ptr,
                put_md: None,
                put_offset: 0,
                get_md: Some(md),
                get_offset: local_offset,
                length,
                atom_op: None,
                atom_type: None,
                operand: [0; 16],
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_atomic(
        &self,
        md: MdHandle,
        local_offset: u64,
        length: u64,
        ack_req: AckReq,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        atom_op: AtomOp,
        atom_type: AtomType,
        ct: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        self.arm(
            ct,
            threshold,
            OpArgs {
                op: Op::Atomic,
                target,
                pt_index,
                match_bits,
                remote_offset,
                ack_req,
                hdr_data,
                user_ptr,
                put_md: Some(md),
                put_offset: local_offset,
                get_md: None,
                get_offset: 0,
                length,
                atom_op: Some(atom_op),
                atom_type: Some(atom_type),
                operand: [0; 16],
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_fetch_atomic(
        &self,
        get_md: MdHandle,
        local_get_offset: u64,
        put_md: MdHandle,
        local_put_offset: u64,
        length: u64,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        atom_op: AtomOp,
        atom_type: AtomType,
        ct: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        self.arm(
            ct,
            threshold,
            OpArgs {
                op: Op::Fetch,
                target,
                pt_index,
                match_bits,
                remote_offset,
                ack_req: AckReq::NoAck,
                hdr_data,
                user_ptr,
                put_md: Some(put_md),
                put_offset: local_put_offset,
                get_md: Some(get_md),
                get_offset: local_get_offset,
                length,
                atom_op: Some(atom_op),
                atom_type: Some(atom_type),
                operand: [0; 16],
            },
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn triggered_swap(
        &self,
        get_md: MdHandle,
        local_get_offset: u64,
        put_md: MdHandle,
        local_put_offset: u64,
        length: u64,
        target: TargetId,
        pt_index: u32,
        match_bits: u64,
        remote_offset: u64,
        user_ptr: u64,
        hdr_data: u64,
        operand: &[u8],
        atom_op: AtomOp,
        atom_type: AtomType,
        ct: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        let mut op16 = [0u8; 16];
        let n = operand.len().min(16);
        op16[..n].copy_from_slice(&operand[..n]);
        self.arm(
            ct,
            threshold,
            OpArgs {
                op: Op::Swap,
                target,
                pt_index,
                match_bits,
                remote_offset,
                ack_req: AckReq::NoAck,
                hdr_data,
                user_ptr,
                put_md: Some(put_md),
                put_offset: local_put_offset,
                get_md: Some(get_md),
                get_offset: local_get_offset,
                length,
                atom_op: Some(atom_op),
                atom_type: Some(atom_type),
                operand: op16,
            },
        )
    }

    /// Arm a counter increment on another counter.
    pub fn triggered_ct_inc(
        &self,
        ct: CtHandle,
        incr: CtEvent,
        trig_ct: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        self.inner.pools.cts.lookup(ct.0)?;
        let c = self.inner.pools.cts.lookup(trig_ct.0)?;
        if let Some(t) = c.arm(Triggered {
            threshold,
            action: TriggeredAction::CtInc { ct, incr },
        }) {
            self.inner.dispatch_triggered(vec![t]);
        }
        Ok(())
    }

    /// Arm a counter overwrite on another counter.
    pub fn triggered_ct_set(
        &self,
        ct: CtHandle,
        value: CtEvent,
        trig_ct: CtHandle,
        threshold: u64,
    ) -> Result<()> {
        self.inner.pools.cts.lookup(ct.0)?;
        let c = self.inner.pools.cts.lookup(trig_ct.0)?;
        if let Some(t) = c.arm(Triggered {
            threshold,
            action: TriggeredAction::CtSet { ct, value },
        }) {
            self.inner.dispatch_triggered(vec![t]);
        }
        Ok(())
    }

    // ----- bundles ------------------------------------------------------

    /// Accepted and currently a no-op.
    pub fn start_bundle(&self) -> Result<()> {
        Ok(())
    }

    /// Accepted and currently a no-op.
    pub fn end_bundle(&self) -> Result<()> {
        Ok(())
    }

    // ----- teardown -----------------------------------------------------

    /// Tear the interface down: drain in-flight operations, disconnect
    /// peers, stop the progress thread and reclaim buffers.
    pub fn fini(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.finished.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let timeout = Duration::from_millis(Param::RdmaTimeout.get());

        // Drain in-flight transactions; fail the stragglers.
        let deadline = Instant::now() + timeout;
        while inner.pending.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_micros(100));
        }
        if inner.pending.load(Ordering::Acquire) > 0 {
            inner.force_fail_pending();
        }

        // Tell every connected peer we are going away.
        inner.initiate_disconnect_all();
        let deadline = Instant::now() + timeout;
        while inner.connected_count() > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_micros(100));
        }
        inner.force_disconnect_all();

        // Let the progress thread drain fragments still travelling home.
        if let Some(sh) = &inner.shmem {
            let deadline = Instant::now() + timeout;
            while !sh.attach.job.recv_queue_empty(sh.attach.local_rank)
                && Instant::now() < deadline
            {
                std::thread::sleep(Duration::from_micros(100));
            }
        }

        inner.catcher_stop.store(true, Ordering::Release);
        if let Some(handle) = inner.progress.lock().unwrap().take() {
            let _ = handle.join();
        }

        // We are the queue's consumer now; route leftovers home.
        if let Some(sh) = &inner.shmem {
            let job = &sh.attach.job;
            let rank = sh.attach.local_rank;
            while let Some(frag) = job.try_dequeue(rank) {
                let (owner, _, _) = job.frag_meta(frag);
                if owner == rank {
                    job.free_frag(rank, frag);
                } else {
                    job.return_frag(frag);
                }
            }
        }

        // Unblock waiters and cancel armed triggered operations.
        for h in inner.pools.eqs.handles() {
            if let Ok(eq) = inner.pools.eqs.lookup(h) {
                eq.interrupt();
            }
        }
        for h in inner.pools.cts.handles() {
            if let Ok(ct) = inner.pools.cts.lookup(h) {
                ct.cancel_triggered();
                ct.interrupt();
            }
        }

        inner.reclaim_transport_buffers();
        inner.fabric.remove_node(inner.id);
        if let Some(sh) = &inner.shmem {
            sh.attach.job.detach(sh.attach.local_rank);
        }
        log::debug!("ni {} down", inner.index);
        Ok(())
    }
}

impl NiInner {
    pub(crate) fn pt(&self, pt_index: u32) -> Result<&PtEntry> {
        self.pts.get(pt_index as usize).ok_or(Error::ArgInvalid)
    }

    /// Transport flavour toward a peer: shared memory for co-located
    /// ranks attached to the same job segment.
    pub(crate) fn transport_kind_for(&self, peer: ProcessId) -> TransportKind {
        match &self.shmem {
            Some(sh) if peer.nid == self.id.nid && sh.attach.job.rank_of_pid(peer.pid).is_some() => {
                TransportKind::Shmem
            }
            _ => TransportKind::Rdma,
        }
    }

    pub(crate) fn transport_for(&self, conn: &Conn) -> &dyn Transport {
        match conn.kind {
            TransportKind::Shmem => self
                .shmem_transport
                .as_ref()
                .map(|t| t as &dyn Transport)
                .unwrap_or(&self.rdma_transport),
            TransportKind::Rdma => &self.rdma_transport,
        }
    }

    /// Resolve an operation target to its identity and connection.
    pub(crate) fn resolve_target(&self, target: TargetId) -> Result<(ProcessId, Arc<Conn>)> {
        match (target, &self.conns) {
            (TargetId::Rank(r), ConnTable::Logical(table)) => {
                let table = table.read().unwrap();
                let conn = table.get(r as usize).cloned().ok_or(Error::ArgInvalid)?;
                Ok((conn.id, conn))
            }
            (TargetId::Phys(id), ConnTable::Physical(tree)) => {
                Ok((id, self.conn_phys(tree, id)))
            }
            _ => Err(Error::ArgInvalid),
        }
    }

    fn conn_phys(
        &self,
        tree: &Mutex<BTreeMap<ProcessId, Arc<Conn>>>,
        id: ProcessId,
    ) -> Arc<Conn> {
        let mut tree = tree.lock().unwrap();
        tree.entry(id)
            .or_insert_with(|| Arc::new(Conn::new(id, self.transport_kind_for(id))))
            .clone()
    }

    /// Connection to use when responding to `initiator`.
    pub(crate) fn reply_conn(&self, initiator: ProcessId, src_rank: u32) -> Result<Arc<Conn>> {
        match &self.conns {
            ConnTable::Logical(table) => table
                .read()
                .unwrap()
                .get(src_rank as usize)
                .cloned()
                .ok_or(Error::Fail),
            ConnTable::Physical(tree) => Ok(self.conn_phys(tree, initiator)),
        }
    }

    /// Find the connection record for a peer, if one exists.
    pub(crate) fn find_conn(&self, peer: ProcessId) -> Option<Arc<Conn>> {
        match &self.conns {
            ConnTable::Logical(table) => {
                table.read().unwrap().iter().find(|c| c.id == peer).cloned()
            }
            ConnTable::Physical(tree) => tree.lock().unwrap().get(&peer).cloned(),
        }
    }

    /// Connection record for an incoming request's peer, creating a
    /// physical-table record on first contact.
    pub(crate) fn conn_for_peer(&self, peer: ProcessId) -> Option<Arc<Conn>> {
        match &self.conns {
            ConnTable::Logical(_) => self.find_conn(peer),
            ConnTable::Physical(tree) => Some(self.conn_phys(tree, peer)),
        }
    }

    pub(crate) fn all_conns(&self) -> Vec<Arc<Conn>> {
        match &self.conns {
            ConnTable::Logical(table) => table.read().unwrap().clone(),
            ConnTable::Physical(tree) => tree.lock().unwrap().values().cloned().collect(),
        }
    }

    /// Connections still owing their half of the disconnect handshake.
    /// Once our header's send completed (`local_disc == 2`) the peer
    /// has the notification and we may tear down unilaterally.
    fn connected_count(&self) -> usize {
        self.all_conns()
            .iter()
            .filter(|c| {
                if c.kind != TransportKind::Rdma {
                    return false;
                }
                let ci = c.lock();
                !matches!(ci.state, ConnState::Disconnected) && ci.local_disc < 2
            })
            .count()
    }

    /// Post an event to a portal table entry's queue.
    pub(crate) fn post_pt_event(&self, pt_index: u32, event: Event) {
        let Ok(pt) = self.pt(pt_index) else { return };
        let eq = pt.lock().eq;
        if let Some(eq) = eq {
            if let Ok(q) = self.pools.eqs.lookup(eq.0) {
                q.post(event);
            }
        }
    }

    /// Post an event to a memory descriptor's queue.
    pub(crate) fn post_md_event(&self, md: &Md, event: Event) {
        if md.options.contains(MdOptions::EVENT_SUCCESS_DISABLE)
            && event.ni_fail == crate::types::NiFail::Ok
        {
            return;
        }
        if let Some(eq) = md.eq {
            if let Ok(q) = self.pools.eqs.lookup(eq.0) {
                q.post(event);
            }
        }
    }

    /// Bump a counter and dispatch whatever fires.
    pub(crate) fn ct_add(&self, ct: CtHandle, incr: CtEvent) {
        if let Ok(c) = self.pools.cts.lookup(ct.0) {
            let fired = c.inc(incr);
            self.dispatch_triggered(fired);
        }
    }

    /// Dispatch fired triggered operations, breadth-first so chained
    /// counters cannot recurse unboundedly.
    pub(crate) fn dispatch_triggered(&self, fired: Vec<Triggered>) {
        let mut queue: VecDeque<Triggered> = fired.into();
        while let Some(t) = queue.pop_front() {
            match t.action {
                TriggeredAction::Op(args) => {
                    if let Err(e) = self.start_op(*args) {
                        log::warn!("triggered operation failed to start: {}", e);
                    }
                }
                TriggeredAction::CtInc { ct, incr } => {
                    if let Ok(c) = self.pools.cts.lookup(ct.0) {
                        queue.extend(c.inc(incr));
                    }
                }
                TriggeredAction::CtSet { ct, value } => {
                    if let Ok(c) = self.pools.cts.lookup(ct.0) {
                        queue.extend(c.set(value));
                    }
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn append_entry(
        &self,
        pt_index: u32,
        region: Sge,
        options: LeOptions,
        uid: Option<u32>,
        ct: Option<CtHandle>,
        user_ptr: u64,
        spec: Option<MatchSpec>,
        list: ListKind,
        pos: Position,
    ) -> Result<LeHandle> {
        if let Some(ct) = ct {
            self.pools.cts.lookup(ct.0)?;
        }
        let pt = self.pt(pt_index)?;
        {
            let st = pt.lock();
            if !st.allocated {
                return Err(Error::ArgInvalid);
            }
        }

        let (h, le) = self
            .pools
            .les
            .alloc(ListEntry::new(region, options, uid, ct, user_ptr, spec))?;

        {
            let mut st = pt.lock();
            let dst = match list {
                ListKind::Priority => &mut st.priority,
                ListKind::Overflow => &mut st.overflow,
            };
            match pos {
                Position::Append => dst.push_back(h),
                Position::Prepend => dst.push_front(h),
            }
        }
        {
            let mut d = le.lock();
            d.linked = true;
            d.pt_index = pt_index;
            d.list = list;
        }

        if !options.contains(LeOptions::EVENT_LINK_DISABLE) {
            let mut ev = Event::new(EventKind::Link);
            ev.pt_index = pt_index;
            ev.user_ptr = user_ptr;
            self.post_pt_event(pt_index, ev);
        }
        Ok(LeHandle(h))
    }

    /// Unlink an entry. `auto` marks engine-driven unlinks, which emit
    /// the auto-unlink event.
    pub(crate) fn unlink_entry(&self, h: Handle, auto: bool) -> Result<()> {
        let le = self.pools.les.lookup(h)?;
        let (pt_index, refs) = {
            let mut d = le.lock();
            if !d.linked {
                return Err(Error::InUse);
            }
            d.linked = false;
            (d.pt_index, d.unexpected_refs)
        };
        {
            let pt = self.pt(pt_index)?;
            pt.lock().remove_entry(h);
        }
        if auto && !le.options.contains(LeOptions::EVENT_UNLINK_DISABLE) {
            let mut ev = Event::new(EventKind::AutoUnlink);
            ev.pt_index = pt_index;
            ev.user_ptr = le.user_ptr;
            self.post_pt_event(pt_index, ev);
        }
        if refs == 0 {
            self.release_entry(h, pt_index, auto);
        }
        Ok(())
    }

    fn release_entry(&self, h: Handle, pt_index: u32, auto: bool) {
        if let Ok(le) = self.pools.les.release(h) {
            if auto && !le.options.contains(LeOptions::EVENT_UNLINK_DISABLE) {
                let mut ev = Event::new(EventKind::AutoFree);
                ev.pt_index = pt_index;
                ev.user_ptr = le.user_ptr;
                self.post_pt_event(pt_index, ev);
            }
        }
    }

    /// Drop one unexpected-list reference on an overflow entry,
    /// releasing the entry once it is unlinked and unreferenced.
    pub(crate) fn consume_unexpected_ref(&self, h: Handle, pt_index: u32) {
        let Ok(le) = self.pools.les.lookup(h) else { return };
        let release = {
            let mut d = le.lock();
            d.unexpected_refs = d.unexpected_refs.saturating_sub(1);
            !d.linked && d.unexpected_refs == 0
        };
        if release {
            self.release_entry(h, pt_index, true);
        }
    }

    fn search_unexpected(
        &self,
        pt_index: u32,
        bits: Option<(u64, u64)>,
        op: SearchOp,
        user_ptr: u64,
    ) -> Result<()> {
        let pt = self.pt(pt_index)?;
        let mut st = pt.lock();
        if !st.allocated {
            return Err(Error::ArgInvalid);
        }
        let pos = st.unexpected.iter().position(|u| match bits {
            Some((mb, ib)) => (u.match_bits ^ mb) & !ib == 0,
            None => true,
        });

        let mut ev = Event::new(EventKind::Search);
        ev.pt_index = pt_index;
        ev.user_ptr = user_ptr;
        let mut consumed = None;
        match pos {
            Some(i) => {
                let u = if op == SearchOp::SearchDelete {
                    let u = st.unexpected.remove(i).unwrap();
                    consumed = Some(u.le);
                    u
                } else {
                    st.unexpected[i].clone()
                };
                ev.initiator = u.initiator;
                ev.uid = u.uid;
                ev.match_bits = u.match_bits;
                ev.rlength = u.rlength;
                ev.mlength = u.mlength;
                ev.remote_offset = u.roffset;
                ev.hdr_data = u.hdr_data;
                ev.start = u.start;
            }
            None => ev.ni_fail = crate::types::NiFail::NoMatch,
        }
        let eq = st.eq;
        drop(st);

        if let Some(le) = consumed {
            self.consume_unexpected_ref(le, pt_index);
        }
        if let Some(eq) = eq {
            if let Ok(q) = self.pools.eqs.lookup(eq.0) {
                q.post(ev);
            }
        }
        Ok(())
    }

    // ----- operation validation ----------------------------------------

    pub(crate) fn validate_op(&self, args: &OpArgs) -> Result<()> {
        match args.op {
            Op::Put => {
                let md = self.md_for(args.put_md)?;
                self.check_bounds(&md, args.put_offset, args.length)?;
                self.check_ack(&md, args.ack_req)?;
                self.check_msg_size(args.length)
            }
            Op::Get => {
                let md = self.md_for(args.get_md)?;
                self.check_bounds(&md, args.get_offset, args.length)?;
                self.check_msg_size(args.length)
            }
            Op::Atomic => {
                let md = self.md_for(args.put_md)?;
                self.check_bounds(&md, args.put_offset, args.length)?;
                self.check_ack(&md, args.ack_req)?;
                self.check_atomic_size(args.length)?;
                let (op, ty) = self.atom_args(args)?;
                atomics::check_atomic(op, ty)
            }
            Op::Fetch => {
                let get_md = self.md_for(args.get_md)?;
                self.check_bounds(&get_md, args.get_offset, args.length)?;
                let put_md = self.md_for(args.put_md)?;
                self.check_bounds(&put_md, args.put_offset, args.length)?;
                self.check_atomic_size(args.length)?;
                let (op, ty) = self.atom_args(args)?;
                atomics::check_atomic(op, ty)
            }
            Op::Swap => {
                let get_md = self.md_for(args.get_md)?;
                self.check_bounds(&get_md, args.get_offset, args.length)?;
                let put_md = self.md_for(args.put_md)?;
                self.check_bounds(&put_md, args.put_offset, args.length)?;
                self.check_atomic_size(args.length)?;
                let (op, ty) = self.atom_args(args)?;
                atomics::check_swap(op, ty, args.length)
            }
            _ => Err(Error::ArgInvalid),
        }
    }

    fn md_for(&self, md: Option<MdHandle>) -> Result<Arc<Md>> {
        self.pools.mds.lookup(md.ok_or(Error::ArgInvalid)?.0)
    }

    fn check_bounds(&self, md: &Md, offset: u64, length: u64) -> Result<()> {
        if offset + length > md.length {
            return Err(Error::ArgInvalid);
        }
        Ok(())
    }

    fn check_ack(&self, md: &Md, ack_req: AckReq) -> Result<()> {
        if ack_req == AckReq::Ack && md.eq.is_none() {
            return Err(Error::ArgInvalid);
        }
        if ack_req == AckReq::CtAck && md.ct.is_none() {
            return Err(Error::ArgInvalid);
        }
        Ok(())
    }

    fn check_msg_size(&self, length: u64) -> Result<()> {
        if length > self.limits.max_msg_size {
            return Err(Error::ArgInvalid);
        }
        Ok(())
    }

    fn check_atomic_size(&self, length: u64) -> Result<()> {
        if length > self.limits.max_atomic_size {
            return Err(Error::ArgInvalid);
        }
        Ok(())
    }

    fn atom_args(&self, args: &OpArgs) -> Result<(AtomOp, AtomType)> {
        match (args.atom_op, args.atom_type) {
            (Some(op), Some(ty)) => Ok((op, ty)),
            _ => Err(Error::ArgInvalid),
        }
    }
}
