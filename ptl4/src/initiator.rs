//! Initiator state machine: drives a user request to completion.
//!
//! The driver advances a transaction through its states under the
//! transaction lock, parking whenever it needs an external stimulus
//! (connection established, send completion, response received). The
//! progress thread re-enters the driver when the stimulus arrives.
//! Connection faults complete the transaction as undeliverable; the
//! connection is retried, the operation is not.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::{Buf, BufType};
use crate::conn::ConnState;
use crate::ct::CtEvent;
use crate::error::{Error, Result};
use crate::handle::MdHandle;
use crate::md::{Md, MdOptions};
use crate::ni::NiInner;
use crate::transport::{SendFailed, SendOutcome, Transport};
use crate::types::{Event, EventKind, NiFail};
use crate::wire::{
    encode_sge_list, Data, HdrCommon, Op, PktFmt, ReqHdr, Sge, REQ_HDR_SIZE,
};
use crate::xfer::{InitState, OpArgs, Role, Xfer, XferState};

impl NiInner {
    /// Validate, build and launch one operation.
    pub(crate) fn start_op(&self, args: OpArgs) -> Result<()> {
        if self.finished.load(Ordering::Acquire) {
            return Err(Error::NoInit);
        }
        self.validate_op(&args)?;
        let (peer, _conn) = self.resolve_target(args.target)?;

        let uid = self.uid;
        let (_, xfer) = self.pools.xfers.alloc_with(|h| {
            let mut st = XferState::new_initiator(&args, uid);
            st.peer = peer;
            Xfer::new(h, Role::Initiator, st)
        })?;
        self.pending.fetch_add(1, Ordering::AcqRel);
        log::trace!("xi {:?}: {:?} -> {:?}", xfer.handle, args.op, peer);
        self.drive_init(&xfer);
        Ok(())
    }

    /// Advance the initiator machine as far as it can go.
    pub(crate) fn drive_init(&self, xfer: &Arc<Xfer>) {
        let mut st = xfer.lock();
        loop {
            log::trace!("xi {:?}: state {:?}", xfer.handle, st.init_state);
            match st.init_state {
                InitState::Start => st.init_state = InitState::PrepReq,

                InitState::PrepReq => match self.build_request(xfer, &mut st) {
                    Ok(buf) => {
                        st.send_buf = Some(buf);
                        st.init_state = InitState::WaitConn;
                    }
                    Err(_) => {
                        st.ni_fail = NiFail::Undeliverable;
                        st.init_state = InitState::SendError;
                    }
                },

                InitState::WaitConn => {
                    let Ok((_, conn)) = self.resolve_target(st.target) else {
                        st.ni_fail = NiFail::Undeliverable;
                        st.init_state = InitState::SendError;
                        continue;
                    };
                    let parked = {
                        let mut ci = conn.lock();
                        match ci.state {
                            ConnState::Connected => false,
                            ConnState::Disconnected => {
                                ci.wait_list.push_back(xfer.handle);
                                ci.state = ConnState::ResolvingAddr;
                                ci.reset_retries();
                                self.node.resolve_addr(conn.id);
                                true
                            }
                            ConnState::Disconnecting => {
                                ci.wait_list.push_back(xfer.handle);
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
                    st.init_state = InitState::SendReq;
                }

                InitState::SendReq => {
                    let Ok((_, conn)) = self.resolve_target(st.target) else {
                        st.ni_fail = NiFail::Undeliverable;
                        st.init_state = InitState::SendError;
                        continue;
                    };
                    let mut buf = match st.send_buf.take() {
                        Some(b) => b,
                        None => {
                            st.ni_fail = NiFail::Undeliverable;
                            st.init_state = InitState::SendError;
                            continue;
                        }
                    };
                    buf.typ = BufType::Send;
                    buf.xfer = xfer.handle;
                    // Requests always want the completion so the machine
                    // can resume.
                    buf.signalled = true;
                    match self.transport_for(&conn).send_message(&conn, buf) {
                        Ok(SendOutcome::Posted) => {
                            st.init_state = InitState::WaitComp;
                        }
                        Ok(SendOutcome::Completed(buf)) => {
                            self.bufs.free(buf);
                            st.send_done = Some(true);
                            st.init_state = InitState::WaitComp;
                        }
                        Err(SendFailed { buf, .. }) => {
                            self.bufs.free(buf);
                            st.ni_fail = NiFail::Undeliverable;
                            st.init_state = InitState::SendError;
                        }
                    }
                }

                InitState::WaitComp => match st.send_done {
                    None => return,
                    Some(true) => {
                        if self.wants_response(&st) {
                            st.init_state = InitState::EarlySendEvent;
                        } else {
                            st.init_state = InitState::LateSendEvent;
                        }
                    }
                    Some(false) => {
                        st.ni_fail = NiFail::Undeliverable;
                        st.init_state = InitState::SendError;
                    }
                },

                InitState::EarlySendEvent => {
                    self.send_event(&st);
                    st.init_state = InitState::WaitRecv;
                }

                InitState::LateSendEvent => {
                    self.send_event(&st);
                    st.init_state = InitState::Cleanup;
                }

                InitState::WaitRecv => {
                    if st.reply.is_none() {
                        return;
                    }
                    st.init_state = InitState::DataIn;
                }

                InitState::DataIn => {
                    let (mlength, moffset, ni_fail, data) = {
                        let r = st.reply.as_ref().unwrap();
                        (r.mlength, r.moffset, r.ni_fail, r.data.clone())
                    };
                    st.mlength = mlength;
                    st.moffset = moffset;
                    st.ni_fail = ni_fail;
                    if let Some(bytes) = data {
                        let _ = self.copy_reply_into_md(&st, &bytes);
                    }
                    st.init_state = match st.operation {
                        Op::Put | Op::Atomic => InitState::AckEvent,
                        _ => InitState::ReplyEvent,
                    };
                }

                InitState::AckEvent => {
                    let reply_op = st.reply.as_ref().map(|r| r.op).unwrap_or(Op::Ack);
                    if let Some(md) = self.lookup_md(st.put_md) {
                        if reply_op != Op::OcAck {
                            let mut ev = Event::new(EventKind::Ack);
                            self.fill_init_event(&st, &mut ev);
                            self.post_md_event(&md, ev);
                        }
                        if md.options.contains(MdOptions::EVENT_CT_ACK) {
                            self.md_ct_bump(&md, &st);
                        }
                    }
                    st.init_state = InitState::Cleanup;
                }

                InitState::ReplyEvent => {
                    if let Some(md) = self.lookup_md(st.get_md) {
                        let mut ev = Event::new(EventKind::Reply);
                        self.fill_init_event(&st, &mut ev);
                        self.post_md_event(&md, ev);
                        if md.options.contains(MdOptions::EVENT_CT_REPLY) {
                            self.md_ct_bump(&md, &st);
                        }
                    }
                    st.init_state = InitState::Cleanup;
                }

                InitState::SendError => {
                    // Unreliable delivery: report and finish, never retry.
                    let md = self
                        .lookup_md(st.put_md)
                        .or_else(|| self.lookup_md(st.get_md));
                    if let Some(md) = md {
                        let kind = if st.put_md.is_some() {
                            EventKind::Send
                        } else {
                            EventKind::Reply
                        };
                        let mut ev = Event::new(kind);
                        self.fill_init_event(&st, &mut ev);
                        ev.ni_fail = st.ni_fail;
                        self.post_md_event(&md, ev);
                        if let Some(ct) = md.ct {
                            self.ct_add(ct, CtEvent::new(0, 1));
                        }
                    }
                    st.init_state = InitState::Cleanup;
                }

                InitState::Cleanup => {
                    if let Some(buf) = st.send_buf.take() {
                        self.bufs.free(buf);
                    }
                    for (cookie, _) in st.indirect_scratch.drain(..) {
                        self.node.deregister(cookie);
                    }
                    let _ = self.pools.xfers.release(xfer.handle);
                    self.pending.fetch_sub(1, Ordering::AcqRel);
                    st.init_state = InitState::Done;
                }

                InitState::Done => return,
            }
        }
    }

    /// Resume after the request's send completion.
    pub(crate) fn init_send_comp(&self, xfer: &Arc<Xfer>, ok: bool) {
        {
            let mut st = xfer.lock();
            if st.send_done.is_none() {
                st.send_done = Some(ok);
            }
        }
        self.drive_init(xfer);
    }

    /// Resume with a received response.
    pub(crate) fn init_recv_reply(&self, xfer: &Arc<Xfer>, reply: crate::xfer::ReplyInfo) {
        {
            let mut st = xfer.lock();
            if st.reply.is_none() {
                st.reply = Some(reply);
            }
        }
        self.drive_init(xfer);
    }

    /// Fail every transaction still in flight (teardown stragglers).
    pub(crate) fn force_fail_pending(&self) {
        for h in self.pools.xfers.handles() {
            let Ok(xfer) = self.pools.xfers.lookup(h) else {
                continue;
            };
            if xfer.role != Role::Initiator {
                continue;
            }
            {
                let mut st = xfer.lock();
                if matches!(st.init_state, InitState::Cleanup | InitState::Done) {
                    continue;
                }
                st.ni_fail = NiFail::Undeliverable;
                st.init_state = InitState::SendError;
            }
            self.drive_init(&xfer);
        }
    }

    fn wants_response(&self, st: &XferState) -> bool {
        match st.operation {
            Op::Get | Op::Fetch | Op::Swap => true,
            _ => st.ack_req.wants_response(),
        }
    }

    fn lookup_md(&self, md: Option<MdHandle>) -> Option<Arc<Md>> {
        md.and_then(|m| self.pools.mds.lookup(m.0).ok())
    }

    fn fill_init_event(&self, st: &XferState, ev: &mut Event) {
        ev.initiator = self.id;
        ev.pt_index = st.pt_index;
        ev.match_bits = st.match_bits;
        ev.rlength = st.rlength;
        ev.mlength = st.mlength;
        ev.remote_offset = st.roffset;
        ev.user_ptr = st.user_ptr;
        ev.hdr_data = st.hdr_data;
        ev.ni_fail = st.ni_fail;
        ev.atom_op = st.atom_op;
        ev.atom_type = st.atom_type;
    }

    /// Deliver the SEND event and its counting half.
    fn send_event(&self, st: &XferState) {
        let Some(md) = self.lookup_md(st.put_md) else {
            return;
        };
        let mut ev = Event::new(EventKind::Send);
        self.fill_init_event(st, &mut ev);
        // The send event reports only local delivery.
        ev.mlength = 0;
        self.post_md_event(&md, ev);
        if md.options.contains(MdOptions::EVENT_CT_SEND) {
            if let Some(ct) = md.ct {
                let n = if md.options.contains(MdOptions::EVENT_CT_BYTES) {
                    st.rlength
                } else {
                    1
                };
                self.ct_add(ct, CtEvent::new(n, 0));
            }
        }
    }

    fn md_ct_bump(&self, md: &Md, st: &XferState) {
        let Some(ct) = md.ct else { return };
        let n = if md.options.contains(MdOptions::EVENT_CT_BYTES) {
            st.mlength
        } else {
            1
        };
        if st.ni_fail == NiFail::Ok {
            self.ct_add(ct, CtEvent::new(n, 0));
        } else {
            self.ct_add(ct, CtEvent::new(0, 1));
        }
    }

    /// Copy a short in-band reply into the get descriptor.
    fn copy_reply_into_md(&self, st: &XferState, bytes: &[u8]) -> Result<()> {
        let md = self
            .lookup_md(st.get_md)
            .ok_or(Error::ArgInvalid)?;
        let sges = md.resolve(st.get_offset, bytes.len() as u64)?;
        let mut off = 0usize;
        for sge in sges {
            let mr = self.node.mr(sge.cookie).ok_or(Error::ArgInvalid)?;
            mr.write(sge.offset, &bytes[off..off + sge.len as usize])?;
            off += sge.len as usize;
        }
        Ok(())
    }

    /// Compose the wire request for a transaction.
    fn build_request(&self, xfer: &Arc<Xfer>, st: &mut XferState) -> Result<Buf> {
        let mut buf = self.bufs.alloc()?;

        let data_out = match st.operation {
            Op::Put | Op::Atomic | Op::Fetch | Op::Swap => {
                Some(self.out_descriptor(st)?)
            }
            _ => None,
        };
        let data_in = match st.operation {
            Op::Get | Op::Fetch | Op::Swap => Some(self.in_descriptor(st)?),
            _ => None,
        };

        let fmt = [&data_out, &data_in]
            .into_iter()
            .flatten()
            .map(Data::pkt_fmt)
            .max_by_key(|f| *f as u8)
            .unwrap_or(PktFmt::Short);

        let mut common = HdrCommon::new(st.operation, self.options.ni_type(), fmt, st.rlength);
        common.ack_req = st.ack_req as u8;
        common.has_data_out = data_out.is_some();
        common.has_data_in = data_in.is_some();
        common.encode(&mut buf.data);

        let src_rank = self.my_rank.read().unwrap().unwrap_or(0);
        let req = ReqHdr {
            src_nid: self.id.nid,
            src_pid: self.id.pid,
            src_rank,
            pt_index: st.pt_index,
            match_bits: st.match_bits,
            hdr_data: st.hdr_data,
            roffset: st.roffset,
            uid: st.uid,
            atom_op: st.atom_op.map(|o| o as u8).unwrap_or(0),
            atom_type: st.atom_type.map(|t| t as u8).unwrap_or(0),
            operand: st.operand,
            handle: xfer.handle.raw(),
        };
        req.encode(&mut buf.data);

        let mut off = REQ_HDR_SIZE;
        for d in [&data_out, &data_in].into_iter().flatten() {
            off += d.encode(&mut buf.data[off..]);
        }
        buf.len = off;
        Ok(buf)
    }

    /// Descriptor for the data the target will consume (put side).
    fn out_descriptor(&self, st: &mut XferState) -> Result<Data> {
        let md = self
            .lookup_md(st.put_md)
            .ok_or(Error::ArgInvalid)?;
        if st.rlength as usize <= self.max_inline {
            let mut bytes = vec![0u8; st.rlength as usize];
            let sges = md.resolve(st.put_offset, st.rlength)?;
            let mut off = 0usize;
            for sge in sges {
                let mr = self.node.mr(sge.cookie).ok_or(Error::ArgInvalid)?;
                mr.read(sge.offset, &mut bytes[off..off + sge.len as usize])?;
                off += sge.len as usize;
            }
            return Ok(Data::Inline(bytes));
        }
        let (offset, length) = (st.put_offset, st.rlength);
        self.dma_descriptor(st, &md, offset, length)
    }

    /// Descriptor for the window the target will produce into (get side).
    fn in_descriptor(&self, st: &mut XferState) -> Result<Data> {
        let md = self
            .lookup_md(st.get_md)
            .ok_or(Error::ArgInvalid)?;
        let (offset, length) = (st.get_offset, st.rlength);
        self.dma_descriptor(st, &md, offset, length)
    }

    fn dma_descriptor(
        &self,
        st: &mut XferState,
        md: &Md,
        offset: u64,
        length: u64,
    ) -> Result<Data> {
        let sges = md.resolve(offset, length)?;
        if sges.is_empty() {
            return Ok(Data::Rdma(Sge {
                cookie: 0,
                offset: 0,
                len: 0,
            }));
        }
        if sges.len() == 1 {
            return Ok(Data::Rdma(sges[0]));
        }
        // The scatter list outgrows a single descriptor: publish it as
        // an indirect list the target fetches first.
        let wire = encode_sge_list(&sges).into_boxed_slice();
        let len = wire.len() as u64;
        let mut wire = wire;
        let cookie = unsafe { self.node.register(wire.as_mut_ptr(), wire.len()) };
        st.indirect_scratch.push((cookie, wire));
        Ok(Data::Indirect {
            list: Sge {
                cookie,
                offset: 0,
                len,
            },
        })
    }
}
