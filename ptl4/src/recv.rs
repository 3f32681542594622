//! Receive-side dispatcher and the progress loop.
//!
//! One progress thread per interface polls the completion queue, the
//! connection-manager event queue and the shared-memory fragment queue,
//! classifies each completion and feeds the target machine, the
//! initiator's reply path, or the connection manager.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::buffer::{Buf, BufType};
use crate::conn::{Conn, ConnState, TransportKind};
use crate::handle::Handle;
use crate::ni::NiInner;
use crate::shmem::FragKind;
use crate::soft::{CmEvent, RejectReason, Wc, WcKind, WcStatus};
use crate::transport::{SendFailed, SendOutcome, Transport};
use crate::types::{NiFail, ProcessId};
use crate::wire::{AckHdr, Data, HdrCommon, Op, ReqHdr, ACK_HDR_SIZE, HDR_VER_1, REQ_HDR_SIZE};
use crate::xfer::{ReplyInfo, Role};

impl NiInner {
    /// The per-interface progress loop. Sole consumer of the completion
    /// queue and of our fragment queue.
    pub(crate) fn progress_loop(&self) {
        let mut wcs: Vec<Wc> = Vec::with_capacity(self.wc_count);
        loop {
            if self.catcher_stop.load(Ordering::Acquire) {
                break;
            }
            let mut worked = false;

            while let Some(ev) = self.node.poll_cm() {
                self.handle_cm_event(ev);
                worked = true;
            }

            wcs.clear();
            let n = self.node.poll_cq(self.wc_count, &mut wcs);
            for wc in wcs.drain(..) {
                self.process_wc(wc);
            }
            worked |= n > 0;
            self.repost_recvs();

            if let Some(sh) = &self.shmem {
                if let Some(frag) = sh.attach.job.try_dequeue(sh.attach.local_rank) {
                    self.process_shmem_frag(frag);
                    worked = true;
                }
            }

            if !worked {
                if self.hard_polling {
                    std::hint::spin_loop();
                } else {
                    std::thread::yield_now();
                }
            }
        }
    }

    /// Refill the receive queue in batches once it has drained enough,
    /// keeping doorbell cost amortised.
    fn repost_recvs(&self) {
        let posted = self.node.srq_count();
        if posted >= self.srq_depth {
            return;
        }
        let room = self.srq_depth - posted;
        if room < self.srq_repost_size {
            return;
        }
        for _ in 0..room {
            match self.bufs.alloc() {
                Ok(buf) => self.node.post_recv(buf),
                Err(_) => break,
            }
        }
    }

    /// Classify one work completion.
    fn process_wc(&self, wc: Wc) {
        let ok = wc.status == WcStatus::Success;
        match wc.kind {
            WcKind::Send { mut buf } => {
                if !ok {
                    buf.ni_fail = NiFail::Undeliverable;
                }
                self.recv_send_comp(buf, ok);
            }
            WcKind::Recv { buf } => {
                if ok {
                    self.recv_packet(buf);
                } else {
                    self.num_recv_errs.fetch_add(1, Ordering::Relaxed);
                    self.bufs.free(buf);
                }
            }
            WcKind::Rdma { xfer } => match self.pools.xfers.lookup(xfer) {
                Ok(x) => self.tgt_rdma_comp(&x, ok),
                Err(_) => {
                    if !ok {
                        self.num_recv_errs.fetch_add(1, Ordering::Relaxed);
                    }
                }
            },
        }
    }

    /// A send finished. Unrequested successful completions only return
    /// the buffer; requested or failed ones feed the state machines.
    fn recv_send_comp(&self, buf: Buf, ok: bool) {
        let op = HdrCommon::decode(buf.bytes()).ok().map(|h| h.operation);
        match op {
            Some(op) if op.is_request() => {
                if buf.signalled || !ok {
                    if let Ok(xfer) = self.pools.xfers.lookup(buf.xfer) {
                        let handle = buf.xfer;
                        self.bufs.free(buf);
                        log::trace!("send completion for {:?} ok={}", handle, ok);
                        self.init_send_comp(&xfer, ok);
                        return;
                    }
                }
                self.bufs.free(buf);
            }
            Some(Op::Disc) => {
                let peer = buf.src;
                self.bufs.free(buf);
                self.disc_send_done(peer);
            }
            _ => self.bufs.free(buf),
        }
    }

    /// A packet arrived: sanity-check and route it.
    fn recv_packet(&self, buf: Buf) {
        let Ok(common) = HdrCommon::decode(buf.bytes()) else {
            return self.drop_buf(buf);
        };
        if common.version != HDR_VER_1 {
            return self.drop_buf(buf);
        }

        if common.operation.is_request() {
            if buf.len < REQ_HDR_SIZE {
                return self.drop_buf(buf);
            }
            let Ok(hdr) = ReqHdr::decode(buf.bytes()) else {
                return self.drop_buf(buf);
            };
            let (data_out, data_in) = match self.decode_request_data(&common, buf.bytes()) {
                Ok(d) => d,
                Err(_) => return self.drop_buf(buf),
            };
            self.bufs.free(buf);
            self.process_request(&common, &hdr, data_out, data_in);
        } else if common.operation.is_response() {
            if buf.len < ACK_HDR_SIZE {
                return self.drop_buf(buf);
            }
            let Ok(ack) = AckHdr::decode(buf.bytes()) else {
                return self.drop_buf(buf);
            };
            let data = if common.has_data_out {
                match Data::decode(&buf.bytes()[ACK_HDR_SIZE..]) {
                    Ok((Data::Inline(bytes), _)) => Some(bytes),
                    _ => return self.drop_buf(buf),
                }
            } else {
                None
            };
            // Copy everything out of the buffer before re-entering the
            // initiator machine; the buffer goes straight back.
            let reply = ReplyInfo {
                op: common.operation,
                mlength: ack.mlength,
                moffset: ack.moffset,
                ni_fail: ack.ni_fail,
                data,
            };
            let handle = Handle::from_raw(ack.handle);
            self.bufs.free(buf);
            match self.pools.xfers.lookup(handle) {
                Ok(xfer) if xfer.role == Role::Initiator => {
                    self.init_recv_reply(&xfer, reply);
                }
                _ => {
                    self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                }
            }
        } else {
            // Disconnect notification.
            let peer = ReqHdr::decode(buf.bytes())
                .map(|h| ProcessId::new(h.src_nid, h.src_pid))
                .unwrap_or(buf.src);
            self.bufs.free(buf);
            self.num_disc_recv.fetch_add(1, Ordering::Relaxed);
            self.disc_received(peer);
        }
    }

    fn decode_request_data(
        &self,
        common: &HdrCommon,
        bytes: &[u8],
    ) -> crate::error::Result<(Option<Data>, Option<Data>)> {
        let mut off = REQ_HDR_SIZE;
        let data_out = if common.has_data_out {
            let (d, n) = Data::decode(&bytes[off..])?;
            off += n;
            Some(d)
        } else {
            None
        };
        let data_in = if common.has_data_in {
            let (d, _) = Data::decode(&bytes[off..])?;
            Some(d)
        } else {
            None
        };
        Ok((data_out, data_in))
    }

    fn drop_buf(&self, buf: Buf) {
        self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
        self.bufs.free(buf);
    }

    /// Drain one shared-memory fragment.
    fn process_shmem_frag(&self, frag: u64) {
        let Some(sh) = &self.shmem else { return };
        let job = &sh.attach.job;
        let my_rank = sh.attach.local_rank;
        let (owner, kind, len) = job.frag_meta(frag);
        match kind {
            FragKind::Return => {
                job.free_frag(my_rank, frag);
            }
            FragKind::Send => {
                match self.bufs.alloc() {
                    Ok(mut buf) => {
                        let n = (len as usize).min(buf.data.len());
                        unsafe {
                            std::ptr::copy_nonoverlapping(
                                job.frag_payload(frag),
                                buf.data.as_mut_ptr(),
                                n,
                            );
                        }
                        buf.len = n;
                        buf.typ = BufType::Recv;
                        // Route the fragment home before processing.
                        if owner == my_rank {
                            job.free_frag(my_rank, frag);
                        } else {
                            job.return_frag(frag);
                        }
                        self.recv_packet(buf);
                    }
                    Err(_) => {
                        self.num_recv_drops.fetch_add(1, Ordering::Relaxed);
                        if owner == my_rank {
                            job.free_frag(my_rank, frag);
                        } else {
                            job.return_frag(frag);
                        }
                    }
                }
            }
        }
    }

    // ----- connection management ---------------------------------------

    pub(crate) fn handle_cm_event(&self, ev: CmEvent) {
        match ev {
            CmEvent::AddrResolved { peer } => {
                if let Some(conn) = self.find_conn(peer) {
                    let mut ci = conn.lock();
                    if ci.state == ConnState::ResolvingAddr {
                        ci.state = ConnState::ResolvingRoute;
                        drop(ci);
                        self.node.resolve_route(peer);
                    }
                }
            }
            CmEvent::AddrError { peer } => {
                if let Some(conn) = self.find_conn(peer) {
                    let retry = {
                        let mut ci = conn.lock();
                        if ci.retry_resolve_addr > 0 {
                            ci.retry_resolve_addr -= 1;
                            true
                        } else {
                            false
                        }
                    };
                    if retry {
                        self.node.resolve_addr(peer);
                    } else {
                        self.fail_conn(&conn);
                    }
                }
            }
            CmEvent::RouteResolved { peer } => {
                if let Some(conn) = self.find_conn(peer) {
                    let mut ci = conn.lock();
                    if ci.state == ConnState::ResolvingRoute {
                        ci.state = ConnState::Connecting;
                        drop(ci);
                        self.node.connect(peer);
                    }
                }
            }
            CmEvent::RouteError { peer } => {
                if let Some(conn) = self.find_conn(peer) {
                    let retry = {
                        let mut ci = conn.lock();
                        if ci.retry_resolve_route > 0 {
                            ci.retry_resolve_route -= 1;
                            true
                        } else {
                            false
                        }
                    };
                    if retry {
                        self.node.resolve_route(peer);
                    } else {
                        self.fail_conn(&conn);
                    }
                }
            }
            CmEvent::ConnectRequest {
                from,
                ni_type,
                token,
            } => self.handle_connect_request(from, ni_type, token),
            CmEvent::Established { peer, qp } => {
                if let Some(conn) = self.conn_for_peer(peer) {
                    let waiters = {
                        let mut ci = conn.lock();
                        ci.state = ConnState::Connected;
                        ci.qp = Some(qp);
                        std::mem::take(&mut ci.wait_list)
                    };
                    log::debug!("conn {:?}: connected", peer);
                    self.flush_waiters(waiters);
                }
            }
            CmEvent::Rejected { peer, reason } => self.handle_rejected(peer, reason),
            CmEvent::ConnectError { peer } => {
                if let Some(conn) = self.find_conn(peer) {
                    let retry = {
                        let mut ci = conn.lock();
                        if ci.retry_connect > 0 {
                            ci.retry_connect -= 1;
                            true
                        } else {
                            false
                        }
                    };
                    if retry {
                        self.node.connect(peer);
                    } else {
                        self.fail_conn(&conn);
                    }
                }
            }
        }
    }

    /// Arbitrate an incoming connect request.
    fn handle_connect_request(&self, from: ProcessId, ni_type: u8, token: u64) {
        if ni_type != self.options.ni_type() {
            self.node.reject(token, RejectReason::NoNi);
            return;
        }
        let Some(conn) = self.conn_for_peer(from) else {
            self.node.reject(token, RejectReason::Error);
            return;
        };

        enum Action {
            Accept,
            AcceptSelf,
            Reject(RejectReason),
        }
        let action = {
            let mut ci = conn.lock();
            match ci.state {
                ConnState::Connected | ConnState::XrcConnected => {
                    Action::Reject(RejectReason::Connected)
                }
                ConnState::Disconnected => {
                    ci.state = ConnState::Connecting;
                    Action::Accept
                }
                ConnState::Disconnecting => Action::Reject(RejectReason::Error),
                _ => {
                    // Both sides are trying: the higher identity wins
                    // the accept, loopback accepts itself.
                    if from > self.id {
                        Action::Accept
                    } else if from < self.id {
                        Action::Reject(RejectReason::Connecting)
                    } else {
                        Action::AcceptSelf
                    }
                }
            }
        };
        match action {
            Action::Accept => {
                if self.node.accept(token).is_err() {
                    self.fail_conn(&conn);
                }
            }
            Action::AcceptSelf => {
                if self.node.accept_self(token).is_err() {
                    self.fail_conn(&conn);
                }
            }
            Action::Reject(reason) => {
                log::debug!("conn {:?}: rejecting connect, {:?}", from, reason);
                self.node.reject(token, reason);
            }
        }
    }

    fn handle_rejected(&self, peer: ProcessId, reason: RejectReason) {
        match reason {
            // Crossed connects: the surviving request will establish us.
            RejectReason::Connected | RejectReason::Connecting | RejectReason::GoodSrq => {}
            _ => {
                if let Some(conn) = self.find_conn(peer) {
                    let retry = {
                        let mut ci = conn.lock();
                        if ci.retry_connect > 0 {
                            ci.retry_connect -= 1;
                            true
                        } else {
                            false
                        }
                    };
                    if retry {
                        self.node.connect(peer);
                    } else {
                        self.fail_conn(&conn);
                    }
                }
            }
        }
    }

    /// Connection establishment failed: park it back in disconnected
    /// and fail everything that was waiting.
    pub(crate) fn fail_conn(&self, conn: &Arc<Conn>) {
        let waiters = {
            let mut ci = conn.lock();
            ci.state = ConnState::Disconnected;
            ci.qp = None;
            std::mem::take(&mut ci.wait_list)
        };
        log::warn!("conn {:?}: failed", conn.id);
        for h in waiters {
            let Ok(xfer) = self.pools.xfers.lookup(h) else {
                continue;
            };
            match xfer.role {
                Role::Initiator => {
                    {
                        let mut st = xfer.lock();
                        st.ni_fail = NiFail::Undeliverable;
                        st.init_state = crate::xfer::InitState::SendError;
                    }
                    self.drive_init(&xfer);
                }
                Role::Target => self.tgt_fail(&xfer),
            }
        }
    }

    fn flush_waiters(&self, waiters: std::collections::VecDeque<Handle>) {
        for h in waiters {
            let Ok(xfer) = self.pools.xfers.lookup(h) else {
                continue;
            };
            match xfer.role {
                Role::Initiator => self.drive_init(&xfer),
                Role::Target => self.drive_tgt(&xfer),
            }
        }
    }

    // ----- graceful disconnect -----------------------------------------

    /// Tell every connected peer we are going away.
    pub(crate) fn initiate_disconnect_all(&self) {
        for conn in self.all_conns() {
            if conn.kind != TransportKind::Rdma {
                continue;
            }
            let send = {
                let mut ci = conn.lock();
                if ci.state == ConnState::Connected && ci.local_disc == 0 {
                    ci.local_disc = 1;
                    true
                } else {
                    false
                }
            };
            if send {
                self.send_disc(&conn);
            }
        }
    }

    fn send_disc(&self, conn: &Arc<Conn>) {
        let Ok(mut buf) = self.bufs.alloc() else {
            return;
        };
        let common = HdrCommon::new(Op::Disc, self.options.ni_type(), crate::wire::PktFmt::Short, 0);
        common.encode(&mut buf.data);
        let req = ReqHdr {
            src_nid: self.id.nid,
            src_pid: self.id.pid,
            src_rank: self.my_rank.read().unwrap().unwrap_or(0),
            pt_index: 0,
            match_bits: 0,
            hdr_data: 0,
            roffset: 0,
            uid: self.uid,
            atom_op: 0,
            atom_type: 0,
            operand: [0; 16],
            handle: 0,
        };
        req.encode(&mut buf.data);
        buf.len = REQ_HDR_SIZE;
        buf.typ = BufType::Send;
        buf.xfer = Handle::NONE;
        buf.signalled = true;
        buf.src = conn.id;

        match self.rdma_transport.send_message(conn, buf) {
            Ok(SendOutcome::Posted) => {}
            Ok(SendOutcome::Completed(buf)) => {
                self.bufs.free(buf);
                self.disc_send_done(conn.id);
            }
            Err(SendFailed { buf, .. }) => {
                self.bufs.free(buf);
                // Peer is already gone; treat the notification as done.
                self.disc_send_done(conn.id);
            }
        }
    }

    /// The disconnect header's send completed.
    fn disc_send_done(&self, peer: ProcessId) {
        let Some(conn) = self.find_conn(peer) else { return };
        let teardown = {
            let mut ci = conn.lock();
            debug_assert!(ci.local_disc >= 1);
            ci.local_disc = 2;
            ci.remote_disc >= 1
        };
        if teardown {
            self.teardown_conn(&conn);
        }
    }

    /// The peer announced its disconnect.
    fn disc_received(&self, peer: ProcessId) {
        let Some(conn) = self.find_conn(peer) else { return };
        let teardown = {
            let mut ci = conn.lock();
            ci.remote_disc = 1;
            ci.local_disc == 2
        };
        if teardown {
            self.teardown_conn(&conn);
        }
    }

    /// Drop transport resources once both sides agreed to part.
    pub(crate) fn teardown_conn(&self, conn: &Arc<Conn>) {
        let waiters = {
            let mut ci = conn.lock();
            ci.state = ConnState::Disconnected;
            ci.qp = None;
            std::mem::take(&mut ci.wait_list)
        };
        log::debug!("conn {:?}: disconnected", conn.id);
        for h in waiters {
            let Ok(xfer) = self.pools.xfers.lookup(h) else {
                continue;
            };
            match xfer.role {
                Role::Initiator => {
                    {
                        let mut st = xfer.lock();
                        st.ni_fail = NiFail::Undeliverable;
                        st.init_state = crate::xfer::InitState::SendError;
                    }
                    self.drive_init(&xfer);
                }
                Role::Target => self.tgt_fail(&xfer),
            }
        }
    }

    /// Force every remaining connection down (teardown deadline).
    pub(crate) fn force_disconnect_all(&self) {
        for conn in self.all_conns() {
            let connected = !matches!(conn.lock().state, ConnState::Disconnected);
            if connected {
                self.teardown_conn(&conn);
            }
        }
    }

    /// Pull every buffer back out of the transport (after the progress
    /// thread stopped).
    pub(crate) fn reclaim_transport_buffers(&self) {
        for buf in self.node.drain_srq() {
            self.bufs.free(buf);
        }
        let mut wcs = Vec::new();
        loop {
            wcs.clear();
            if self.node.poll_cq(64, &mut wcs) == 0 {
                break;
            }
            for wc in wcs.drain(..) {
                match wc.kind {
                    WcKind::Send { buf } | WcKind::Recv { buf } => self.bufs.free(buf),
                    WcKind::Rdma { .. } => {}
                }
            }
        }
    }
}
