//! Target state machine: drives an incoming request to completion.
//!
//! The walk order is priority list first, then overflow list, strict
//! FIFO within each. A match computes the manipulated length, moves the
//! data (in-band copy, DMA against the initiator's descriptor, or an
//! indirect-list fetch first), applies atomics under the entry lock,
//! responds, and finally delivers the target-side event and counting
//! update.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::BufType;
use crate::conn::{ConnState, TransportKind};
use crate::ct::CtEvent;
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::le::{LeOptions, ListEntry, MatchResult};
use crate::ni::NiInner;
use crate::pt::Unexpected;
use crate::transport::{DmaDir, DmaOutcome, SendFailed, SendOutcome, Transport};
use crate::types::{AckReq, Event, EventKind, ListKind, NiFail, ProcessId};
use crate::wire::{
    decode_sge_list, AckHdr, Data, HdrCommon, Op, PktFmt, ReqHdr, Sge, ACK_HDR_SIZE,
};
use crate::xfer::{Role, TgtState, Xfer, XferState};

impl NiInner {
    /// Build a target transaction from a decoded request and run it.
    pub(crate) fn process_request(
        &self,
        common: &HdrCommon,
        hdr: &ReqHdr,
        data_out: Option<Data>,
        data_in: Option<Data>,
    ) {
        let initiator = ProcessId::new(hdr.src_nid, hdr.src_pid);
        let ack_req = AckReq::from_u8(common.ack_req).unwrap_or(AckReq::NoAck);
        let alloc = self.pools.xfers.alloc_with(|h| {
            Xfer::new(
                h,
                Role::Target,
                XferState::new_target(
                    common.operation,
                    initiator,
                    hdr.src_rank,
                    common.length,
                    hdr,
                    data_out,
                    data_in,
                    ack_req,
                ),
            )
        });
        let Ok((_, xfer)) = alloc else {
            self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
            return;
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.drive_tgt(&xfer);
    }

    /// Advance the target machine as far as it can go.
    pub(crate) fn drive_tgt(&self, xfer: &Arc<Xfer>) {
        let mut st = xfer.lock();
        loop {
            log::trace!("xt {:?}: state {:?}", xfer.handle, st.tgt_state);
            match st.tgt_state {
                TgtState::Start => st.tgt_state = TgtState::GetMatch,

                TgtState::GetMatch => st.tgt_state = self.tgt_get_match(&mut st),

                TgtState::Drop => {
                    self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                    let mut ev = Event::new(EventKind::Dropped);
                    self.fill_tgt_event(&st, &mut ev);
                    self.post_pt_event(st.pt_index, ev);
                    st.mlength = 0;
                    st.tgt_state = if self.tgt_wants_response(&st) {
                        TgtState::WaitConn
                    } else {
                        TgtState::Cleanup
                    };
                }

                TgtState::GetLength => st.tgt_state = self.tgt_get_length(&mut st),

                TgtState::WaitConn => {
                    let Ok(conn) = self.reply_conn(st.initiator, st.src_rank) else {
                        st.ni_fail = NiFail::Undeliverable;
                        st.tgt_state = TgtState::Cleanup;
                        continue;
                    };
                    let parked = {
                        let mut ci = conn.lock();
                        match ci.state {
                            ConnState::Connected => false,
                            ConnState::Disconnected if conn.kind == TransportKind::Rdma => {
                                ci.wait_list.push_back(xfer.handle);
                                ci.state = ConnState::ResolvingAddr;
                                ci.reset_retries();
                                self.node.resolve_addr(conn.id);
                                true
                            }
                            _ => {
                                ci.wait_list.push_back(xfer.handle);
                                true
                            }
                        }
                    };
                    if parked {
                        return;
                    }
                    st.tgt_state = if st.ni_fail == NiFail::Ok && st.le.is_some() {
                        TgtState::Data
                    } else if st.operation == Op::Put || st.operation == Op::Atomic {
                        TgtState::SendAck
                    } else {
                        TgtState::SendReply
                    };
                }

                TgtState::Data => st.tgt_state = self.tgt_data(xfer, &mut st),

                TgtState::DataIn => st.tgt_state = self.tgt_data_in(&mut st),

                TgtState::DataOut => st.tgt_state = self.tgt_data_out(xfer, &mut st),

                TgtState::WaitRdmaDesc => {
                    if st.rdma_comp > 0 {
                        return;
                    }
                    st.tgt_state = self.tgt_indirect_ready(xfer, &mut st);
                }

                TgtState::Rdma => {
                    if st.rdma_comp > 0 {
                        return;
                    }
                    st.tgt_state = match st.operation {
                        Op::Put => TgtState::SendAck,
                        Op::Get => TgtState::SendReply,
                        _ => TgtState::SendAck,
                    };
                }

                TgtState::AtomicDataIn => {
                    if st.rdma_comp > 0 {
                        return;
                    }
                    st.tgt_state = self.tgt_apply_atomic(&mut st, false);
                }

                TgtState::SwapDataIn => {
                    if st.rdma_comp > 0 {
                        return;
                    }
                    st.tgt_state = self.tgt_apply_atomic(&mut st, true);
                }

                TgtState::SendAck => {
                    if st.ack_req == AckReq::NoAck {
                        st.tgt_state = TgtState::CommEvent;
                        continue;
                    }
                    let op = self.ack_op(&st);
                    let _ = self.tgt_respond(&st, op, None);
                    st.tgt_state = TgtState::CommEvent;
                }

                TgtState::SendReply => {
                    let data = st.bounce_reply_bytes();
                    let _ = self.tgt_respond(&st, Op::Reply, data);
                    st.tgt_state = TgtState::CommEvent;
                }

                TgtState::CommEvent => {
                    if st.matched_list == ListKind::Overflow {
                        st.tgt_state = TgtState::OverflowEvent;
                        continue;
                    }
                    self.tgt_comm_deliver(&st);
                    st.tgt_state = TgtState::Cleanup;
                }

                TgtState::OverflowEvent => {
                    // Record before the event becomes visible, so a
                    // search prompted by it always finds the message.
                    self.record_unexpected(&st);
                    self.tgt_comm_deliver(&st);
                    st.tgt_state = TgtState::Cleanup;
                }

                TgtState::Cleanup => {
                    if st.auto_unlink {
                        if let Some(h) = st.le {
                            let _ = self.unlink_entry(h, true);
                        }
                    }
                    for (cookie, _) in st.indirect_scratch.drain(..) {
                        self.node.deregister(cookie);
                    }
                    if let Some((cookie, _)) = st.bounce.take() {
                        self.node.deregister(cookie);
                    }
                    st.tgt_state = TgtState::Cleanup2;
                }

                TgtState::Cleanup2 => {
                    let _ = self.pools.xfers.release(xfer.handle);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    st.tgt_state = TgtState::Done;
                }

                TgtState::Done => return,
            }
        }
    }

    /// Resume a target transaction whose DMA completed.
    pub(crate) fn tgt_rdma_comp(&self, xfer: &Arc<Xfer>, ok: bool) {
        {
            let mut st = xfer.lock();
            st.rdma_comp = st.rdma_comp.saturating_sub(1);
            if !ok {
                st.ni_fail = NiFail::Undeliverable;
                self.num_recv_errs.fetch_add(1, Ordering::Relaxed);
            }
            if st.rdma_comp > 0 {
                return;
            }
        }
        self.drive_tgt(xfer);
    }

    /// Fail a parked transaction whose connection died.
    pub(crate) fn tgt_fail(&self, xfer: &Arc<Xfer>) {
        {
            let mut st = xfer.lock();
            if matches!(st.tgt_state, TgtState::Cleanup | TgtState::Cleanup2 | TgtState::Done) {
                return;
            }
            st.ni_fail = NiFail::Undeliverable;
            st.tgt_state = TgtState::Cleanup;
        }
        self.drive_tgt(xfer);
    }

    // ----- matching -----------------------------------------------------

    fn tgt_get_match(&self, st: &mut XferState) -> TgtState {
        let Ok(pt) = self.pt(st.pt_index) else {
            st.ni_fail = NiFail::Dropped;
            return TgtState::Drop;
        };
        let ps = pt.lock();
        if !ps.allocated || !ps.enabled {
            st.ni_fail = NiFail::Dropped;
            return TgtState::Drop;
        }

        for (list, kind) in [
            (&ps.priority, ListKind::Priority),
            (&ps.overflow, ListKind::Overflow),
        ] {
            for &h in list {
                let Ok(le) = self.pools.les.lookup(h) else {
                    continue;
                };
                match le.check(st.operation, st.match_bits, st.initiator, st.uid) {
                    MatchResult::NoMatch => continue,
                    MatchResult::Deny(fail) => {
                        st.ni_fail = fail;
                        return TgtState::Drop;
                    }
                    MatchResult::Match => {
                        st.le = Some(h);
                        st.matched_list = kind;
                        return TgtState::GetLength;
                    }
                }
            }
        }

        st.ni_fail = NiFail::Dropped;
        TgtState::Drop
    }

    fn tgt_get_length(&self, st: &mut XferState) -> TgtState {
        let Some(le) = st.le.and_then(|h| self.pools.les.lookup(h).ok()) else {
            st.ni_fail = NiFail::Dropped;
            return TgtState::Drop;
        };
        let manage_local = le.options.contains(LeOptions::MANAGE_LOCAL);
        let min_free = le.match_.map(|m| m.min_free).unwrap_or(0);

        let mut d = le.lock();
        let offset = if manage_local { d.local_offset } else { st.roffset };
        let avail = le.region.len.saturating_sub(offset);
        let mlength = st.rlength.min(avail);

        st.local_offset = offset;
        st.mlength = mlength;
        st.moffset = offset;
        if manage_local {
            d.local_offset += mlength;
        }
        st.auto_unlink = le.options.contains(LeOptions::USE_ONCE)
            || (manage_local && le.region.len - d.local_offset < min_free);
        drop(d);

        st.start_addr = self
            .node
            .mr(le.region.cookie)
            .map(|mr| mr.addr() + le.region.offset + offset)
            .unwrap_or(0);

        TgtState::WaitConn
    }

    // ----- data movement ------------------------------------------------

    /// Window of the matched entry the payload lands in.
    fn le_window(&self, st: &XferState) -> Result<(Arc<ListEntry>, Sge)> {
        let le = st
            .le
            .and_then(|h| self.pools.les.lookup(h).ok())
            .ok_or(Error::ArgInvalid)?;
        let sge = Sge {
            cookie: le.region.cookie,
            offset: le.region.offset + st.local_offset,
            len: st.mlength,
        };
        Ok((le, sge))
    }

    fn tgt_data(&self, xfer: &Arc<Xfer>, st: &mut XferState) -> TgtState {
        match st.operation {
            Op::Put => match &st.data_out {
                Some(Data::Inline(_)) => TgtState::DataIn,
                Some(Data::Rdma(remote)) => {
                    let remote = *remote;
                    self.tgt_pull(xfer, st, remote, TgtState::Rdma)
                }
                Some(Data::Indirect { list }) => {
                    let list = *list;
                    self.tgt_fetch_indirect(xfer, st, list)
                }
                None => {
                    st.ni_fail = NiFail::Dropped;
                    TgtState::SendAck
                }
            },
            Op::Get => TgtState::DataOut,
            Op::Atomic | Op::Fetch | Op::Swap => {
                let next = if st.operation == Op::Atomic {
                    TgtState::AtomicDataIn
                } else {
                    TgtState::SwapDataIn
                };
                let fail = if st.operation == Op::Atomic {
                    TgtState::SendAck
                } else {
                    TgtState::SendReply
                };
                match &st.data_out {
                    Some(Data::Inline(_)) => next,
                    Some(Data::Rdma(remote)) => {
                        // Pull the operand data into a bounce area first;
                        // the wait happens in the data-in state.
                        let remote = *remote;
                        match self.tgt_pull_bounce(xfer, st, remote) {
                            Ok(()) => next,
                            Err(_) => {
                                st.ni_fail = NiFail::Undeliverable;
                                fail
                            }
                        }
                    }
                    // Atomic operands are bounded by the atomic size and
                    // always fit a direct descriptor.
                    Some(Data::Indirect { .. }) | None => {
                        st.ni_fail = NiFail::Dropped;
                        fail
                    }
                }
            }
            _ => TgtState::Cleanup,
        }
    }

    /// In-band put payload: copy straight into the entry's window.
    fn tgt_data_in(&self, st: &mut XferState) -> TgtState {
        let res = (|| -> Result<()> {
            let (_, window) = self.le_window(st)?;
            let Some(Data::Inline(bytes)) = &st.data_out else {
                return Err(Error::ArgInvalid);
            };
            let n = st.mlength as usize;
            let mr = self.node.mr(window.cookie).ok_or(Error::ArgInvalid)?;
            mr.write(window.offset, &bytes[..n.min(bytes.len())])
        })();
        if res.is_err() {
            st.ni_fail = NiFail::Segv;
        }
        TgtState::SendAck
    }

    /// Get: produce entry data toward the initiator.
    fn tgt_data_out(&self, xfer: &Arc<Xfer>, st: &mut XferState) -> TgtState {
        if st.mlength as usize <= self.max_inline {
            // Short reply: read into the bounce and ship it in-band.
            let res = (|| -> Result<Vec<u8>> {
                let (_, window) = self.le_window(st)?;
                let mut bytes = vec![0u8; st.mlength as usize];
                let mr = self.node.mr(window.cookie).ok_or(Error::ArgInvalid)?;
                mr.read(window.offset, &mut bytes)?;
                Ok(bytes)
            })();
            match res {
                Ok(bytes) => {
                    st.data_out = Some(Data::Inline(bytes));
                    TgtState::SendReply
                }
                Err(_) => {
                    st.ni_fail = NiFail::Segv;
                    TgtState::SendReply
                }
            }
        } else {
            match st.data_in.take() {
                Some(Data::Rdma(remote)) => self.tgt_push(xfer, st, remote, TgtState::Rdma),
                Some(Data::Indirect { list }) => self.tgt_fetch_indirect(xfer, st, list),
                _ => {
                    st.ni_fail = NiFail::Dropped;
                    TgtState::SendReply
                }
            }
        }
    }

    /// Pull initiator data into the entry window.
    fn tgt_pull(&self, xfer: &Arc<Xfer>, st: &mut XferState, remote: Sge, next: TgtState) -> TgtState {
        let res = (|| -> Result<DmaOutcome> {
            let (_, window) = self.le_window(st)?;
            let remote = Sge {
                cookie: remote.cookie,
                offset: remote.offset,
                len: st.mlength,
            };
            let conn = self.reply_conn(st.initiator, st.src_rank)?;
            self.transport_for(&conn)
                .post_tgt_dma(&conn, xfer.handle, DmaDir::FromInitiator, window, remote)
        })();
        match res {
            Ok(DmaOutcome::Posted) => {
                st.rdma_comp += 1;
                next
            }
            Ok(DmaOutcome::Done) => next,
            Err(_) => {
                st.ni_fail = NiFail::Undeliverable;
                TgtState::SendAck
            }
        }
    }

    /// Push entry data into the initiator's window.
    fn tgt_push(&self, xfer: &Arc<Xfer>, st: &mut XferState, remote: Sge, next: TgtState) -> TgtState {
        let res = (|| -> Result<DmaOutcome> {
            let (_, window) = self.le_window(st)?;
            let remote = Sge {
                cookie: remote.cookie,
                offset: remote.offset,
                len: st.mlength,
            };
            let conn = self.reply_conn(st.initiator, st.src_rank)?;
            self.transport_for(&conn)
                .post_tgt_dma(&conn, xfer.handle, DmaDir::ToInitiator, window, remote)
        })();
        match res {
            Ok(DmaOutcome::Posted) => {
                st.rdma_comp += 1;
                next
            }
            Ok(DmaOutcome::Done) => next,
            Err(_) => {
                st.ni_fail = NiFail::Undeliverable;
                TgtState::SendReply
            }
        }
    }

    /// Pull operand bytes for an atomic into a registered bounce area.
    /// On a posted transfer `rdma_comp` goes up and the data-in state
    /// waits for it.
    fn tgt_pull_bounce(&self, xfer: &Arc<Xfer>, st: &mut XferState, remote: Sge) -> Result<()> {
        let len = st.mlength as usize;
        let mut backing = vec![0u8; len.max(1)].into_boxed_slice();
        let cookie = unsafe { self.node.register(backing.as_mut_ptr(), backing.len()) };
        st.bounce = Some((cookie, backing));
        let local = Sge {
            cookie,
            offset: 0,
            len: st.mlength,
        };
        let remote = Sge {
            cookie: remote.cookie,
            offset: remote.offset,
            len: st.mlength,
        };
        let conn = self.reply_conn(st.initiator, st.src_rank)?;
        if let DmaOutcome::Posted = self.transport_for(&conn).post_tgt_dma(
            &conn,
            xfer.handle,
            DmaDir::FromInitiator,
            local,
            remote,
        )? {
            st.rdma_comp += 1;
        }
        Ok(())
    }

    /// The indirect SGE list must be fetched before the real transfer.
    fn tgt_fetch_indirect(&self, xfer: &Arc<Xfer>, st: &mut XferState, list: Sge) -> TgtState {
        let len = list.len as usize;
        let mut backing = vec![0u8; len.max(1)].into_boxed_slice();
        let cookie = unsafe { self.node.register(backing.as_mut_ptr(), backing.len()) };
        st.bounce = Some((cookie, backing));
        let local = Sge {
            cookie,
            offset: 0,
            len: list.len,
        };
        let res = (|| -> Result<DmaOutcome> {
            let conn = self.reply_conn(st.initiator, st.src_rank)?;
            self.transport_for(&conn).post_tgt_dma(
                &conn,
                xfer.handle,
                DmaDir::FromInitiator,
                local,
                list,
            )
        })();
        match res {
            Ok(DmaOutcome::Posted) => {
                st.rdma_comp += 1;
                TgtState::WaitRdmaDesc
            }
            Ok(DmaOutcome::Done) => self.tgt_indirect_ready(xfer, st),
            Err(_) => {
                st.ni_fail = NiFail::Undeliverable;
                self.tgt_fail_state(st)
            }
        }
    }

    /// Response state to fall into when a data phase fails.
    fn tgt_fail_state(&self, st: &XferState) -> TgtState {
        match st.operation {
            Op::Get | Op::Fetch | Op::Swap => TgtState::SendReply,
            _ => TgtState::SendAck,
        }
    }

    /// The indirect list arrived: parse it and issue the real transfer.
    fn tgt_indirect_ready(&self, xfer: &Arc<Xfer>, st: &mut XferState) -> TgtState {
        if st.ni_fail != NiFail::Ok {
            return self.tgt_fail_state(st);
        }
        let sges = {
            let Some((_, backing)) = &st.bounce else {
                st.ni_fail = NiFail::Undeliverable;
                return self.tgt_fail_state(st);
            };
            match decode_sge_list(backing) {
                Ok(s) => s,
                Err(_) => {
                    st.ni_fail = NiFail::Dropped;
                    return self.tgt_fail_state(st);
                }
            }
        };
        if let Some((cookie, _)) = st.bounce.take() {
            self.node.deregister(cookie);
        }
        st.indirect_sges = Some(sges.clone());

        let dir = match st.operation {
            Op::Put | Op::Atomic | Op::Fetch | Op::Swap => DmaDir::FromInitiator,
            _ => DmaDir::ToInitiator,
        };
        let res = (|| -> Result<u32> {
            let (_, window) = self.le_window(st)?;
            let conn = self.reply_conn(st.initiator, st.src_rank)?;
            let transport = self.transport_for(&conn);
            let mut local_off = 0u64;
            let mut posted = 0u32;
            let mut remaining = st.mlength;
            for sge in &sges {
                if remaining == 0 {
                    break;
                }
                let take = sge.len.min(remaining);
                let local = Sge {
                    cookie: window.cookie,
                    offset: window.offset + local_off,
                    len: take,
                };
                let remote = Sge {
                    cookie: sge.cookie,
                    offset: sge.offset,
                    len: take,
                };
                if let DmaOutcome::Posted =
                    transport.post_tgt_dma(&conn, xfer.handle, dir, local, remote)?
                {
                    posted += 1;
                }
                local_off += take;
                remaining -= take;
            }
            Ok(posted)
        })();
        match res {
            Ok(posted) => {
                st.rdma_comp += posted;
                TgtState::Rdma
            }
            Err(_) => {
                st.ni_fail = NiFail::Undeliverable;
                self.tgt_fail_state(st)
            }
        }
    }

    /// Apply the atomic under the entry lock; `fetch` captures the
    /// original bytes for the reply.
    fn tgt_apply_atomic(&self, st: &mut XferState, fetch: bool) -> TgtState {
        if st.ni_fail != NiFail::Ok {
            return if fetch {
                TgtState::SendReply
            } else {
                TgtState::SendAck
            };
        }
        let res = (|| -> Result<Option<Vec<u8>>> {
            let (le, window) = self.le_window(st)?;
            let (op, ty) = match (st.atom_op, st.atom_type) {
                (Some(op), Some(ty)) => (op, ty),
                _ => return Err(Error::ArgInvalid),
            };
            let n = st.mlength as usize;
            let src: Vec<u8> = match &st.data_out {
                Some(Data::Inline(bytes)) => bytes[..n.min(bytes.len())].to_vec(),
                _ => match &st.bounce {
                    Some((_, backing)) => backing[..n.min(backing.len())].to_vec(),
                    None => return Err(Error::ArgInvalid),
                },
            };

            let mr = self.node.mr(window.cookie).ok_or(Error::ArgInvalid)?;
            // Entry lock serialises concurrent atomics on this region.
            let _guard = le.lock();
            let mut tgt = vec![0u8; n];
            mr.read(window.offset, &mut tgt)?;
            let mut fetched = if fetch { Some(vec![0u8; n]) } else { None };
            crate::atomics::apply(op, ty, &mut tgt, &src, &st.operand, fetched.as_deref_mut())?;
            mr.write(window.offset, &tgt)?;
            Ok(fetched)
        })();
        match res {
            Ok(fetched) => {
                if fetch {
                    st.data_out = fetched.map(Data::Inline);
                    TgtState::SendReply
                } else {
                    TgtState::SendAck
                }
            }
            Err(_) => {
                st.ni_fail = NiFail::OpViolation;
                if fetch {
                    TgtState::SendReply
                } else {
                    TgtState::SendAck
                }
            }
        }
    }

    // ----- responses ----------------------------------------------------

    fn tgt_wants_response(&self, st: &XferState) -> bool {
        match st.operation {
            Op::Get | Op::Fetch | Op::Swap => true,
            _ => st.ack_req.wants_response(),
        }
    }

    /// Response operation for a put-side acknowledgement.
    fn ack_op(&self, st: &XferState) -> Op {
        let suppressed = st
            .le
            .and_then(|h| self.pools.les.lookup(h).ok())
            .map(|le| le.options.contains(LeOptions::ACK_DISABLE))
            .unwrap_or(false);
        if suppressed {
            return Op::OcAck;
        }
        match st.ack_req {
            AckReq::Ack => Op::Ack,
            AckReq::CtAck => Op::CtAck,
            AckReq::OcAck | AckReq::NoAck => Op::OcAck,
        }
    }

    /// Send the acknowledgement or reply for this transaction.
    fn tgt_respond(&self, st: &XferState, op: Op, data: Option<Vec<u8>>) -> Result<()> {
        let conn = self.reply_conn(st.initiator, st.src_rank)?;
        let mut buf = self.bufs.alloc()?;

        let data_len = data.as_ref().map(|d| d.len()).unwrap_or(0) as u64;
        let mut common = HdrCommon::new(op, self.options.ni_type(), PktFmt::Short, data_len);
        common.has_data_out = data.is_some();
        common.encode(&mut buf.data);
        AckHdr {
            handle: st.req_handle,
            mlength: st.mlength,
            moffset: st.moffset,
            ni_fail: st.ni_fail,
        }
        .encode(&mut buf.data);
        let mut off = ACK_HDR_SIZE;
        if let Some(bytes) = data {
            off += Data::Inline(bytes).encode(&mut buf.data[off..]);
        }
        buf.len = off;
        buf.typ = BufType::Send;
        buf.xfer = Handle::NONE;
        buf.src = conn.id;

        match self.transport_for(&conn).send_message(&conn, buf) {
            Ok(SendOutcome::Posted) => Ok(()),
            Ok(SendOutcome::Completed(buf)) => {
                self.bufs.free(buf);
                Ok(())
            }
            Err(SendFailed { error, buf }) => {
                self.bufs.free(buf);
                Err(error)
            }
        }
    }

    // ----- events and unexpected messages -------------------------------

    /// Deliver the target-side comm event and counting update.
    fn tgt_comm_deliver(&self, st: &XferState) {
        let Some(le) = st.le.and_then(|h| self.pools.les.lookup(h).ok()) else {
            return;
        };
        if !le.options.contains(LeOptions::EVENT_COMM_DISABLE) {
            let mut ev = Event::new(self.comm_event_kind(st));
            self.fill_tgt_event(st, &mut ev);
            ev.user_ptr = le.user_ptr;
            self.post_pt_event(st.pt_index, ev);
        }
        if le.options.contains(LeOptions::EVENT_CT_COMM) {
            if let Some(ct) = le.ct {
                let n = if le.options.contains(LeOptions::EVENT_CT_BYTES) {
                    st.mlength
                } else {
                    1
                };
                self.ct_add(ct, CtEvent::new(n, 0));
            }
        }
    }

    fn fill_tgt_event(&self, st: &XferState, ev: &mut Event) {
        ev.initiator = st.initiator;
        ev.uid = st.uid;
        ev.pt_index = st.pt_index;
        ev.match_bits = st.match_bits;
        ev.rlength = st.rlength;
        ev.mlength = st.mlength;
        ev.remote_offset = st.roffset;
        ev.start = st.start_addr;
        ev.hdr_data = st.hdr_data;
        ev.ni_fail = st.ni_fail;
        ev.atom_op = st.atom_op;
        ev.atom_type = st.atom_type;
    }

    fn comm_event_kind(&self, st: &XferState) -> EventKind {
        let overflow = st.matched_list == ListKind::Overflow;
        match st.operation {
            Op::Put => {
                if overflow {
                    EventKind::PutOverflow
                } else {
                    EventKind::Put
                }
            }
            Op::Get => {
                if overflow {
                    EventKind::GetOverflow
                } else {
                    EventKind::Get
                }
            }
            Op::Atomic => {
                if overflow {
                    EventKind::AtomicOverflow
                } else {
                    EventKind::Atomic
                }
            }
            _ => {
                if overflow {
                    EventKind::FetchAtomicOverflow
                } else {
                    EventKind::FetchAtomic
                }
            }
        }
    }

    /// Record an unexpected message captured by the overflow list.
    fn record_unexpected(&self, st: &XferState) {
        let Some(le_handle) = st.le else { return };
        let Ok(pt) = self.pt(st.pt_index) else { return };
        {
            let mut ps = pt.lock();
            if ps.unexpected.len() >= self.limits.max_unexpected {
                self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                return;
            }
            ps.unexpected.push_back(Unexpected {
                operation: st.operation,
                initiator: st.initiator,
                uid: st.uid,
                match_bits: st.match_bits,
                hdr_data: st.hdr_data,
                rlength: st.rlength,
                mlength: st.mlength,
                roffset: st.roffset,
                le: le_handle,
                start: st.start_addr,
            });
        }
        if let Ok(le) = self.pools.les.lookup(le_handle) {
            le.lock().unexpected_refs += 1;
        }
    }
}

/// Reply-side helper on the transaction state.
impl XferState {
    /// Take the in-band reply payload prepared by the data phase.
    fn bounce_reply_bytes(&mut self) -> Option<Vec<u8>> {
        match self.data_out.take() {
            Some(Data::Inline(bytes)) if self.ni_fail == NiFail::Ok => Some(bytes),
            other => {
                self.data_out = other;
                None
            }
        }
    }
}
