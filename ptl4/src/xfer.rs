//! Transaction objects: one record per in-flight operation.
//!
//! The initiator side drives a user request to completion on the wire;
//! the target side drives an incoming request to completion locally.
//! Both are represented by [`Xfer`], whose mutable half lives behind a
//! mutex so user threads and the progress thread can hand a transaction
//! back and forth.

use std::sync::{Mutex, MutexGuard};

use crate::atomics::{AtomOp, AtomType};
use crate::handle::{Handle, MdHandle};
use crate::types::{AckReq, ListKind, NiFail, ProcessId, TargetId};
use crate::wire::{Data, Op, Sge};

/// Arguments of a data-movement operation; shared between the public
/// entry points and triggered-operation dispatch.
#[derive(Debug, Clone)]
pub struct OpArgs {
    pub op: Op,
    pub target: TargetId,
    pub pt_index: u32,
    pub match_bits: u64,
    pub remote_offset: u64,
    pub ack_req: AckReq,
    pub hdr_data: u64,
    pub user_ptr: u64,
    pub put_md: Option<MdHandle>,
    pub put_offset: u64,
    pub get_md: Option<MdHandle>,
    pub get_offset: u64,
    pub length: u64,
    pub atom_op: Option<AtomOp>,
    pub atom_type: Option<AtomType>,
    pub operand: [u8; 16],
}

/// Which half of the protocol owns this transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Target,
}

/// Initiator state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitState {
    Start,
    PrepReq,
    WaitConn,
    SendReq,
    WaitComp,
    EarlySendEvent,
    SendError,
    WaitRecv,
    DataIn,
    LateSendEvent,
    AckEvent,
    ReplyEvent,
    Cleanup,
    Done,
}

/// Target state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TgtState {
    Start,
    Drop,
    GetMatch,
    GetLength,
    WaitConn,
    Data,
    DataIn,
    DataOut,
    Rdma,
    AtomicDataIn,
    SwapDataIn,
    WaitRdmaDesc,
    SendAck,
    SendReply,
    CommEvent,
    OverflowEvent,
    Cleanup,
    Cleanup2,
    Done,
}

/// Response contents captured off the wire before the receive buffer is
/// reposted. Copying here keeps the initiator resume path independent
/// of the buffer's lifetime.
#[derive(Debug, Clone)]
pub struct ReplyInfo {
    pub op: Op,
    pub mlength: u64,
    pub moffset: u64,
    pub ni_fail: NiFail,
    pub data: Option<Vec<u8>>,
}

/// Mutable transaction state.
pub struct XferState {
    pub operation: Op,
    pub rlength: u64,
    pub roffset: u64,
    pub mlength: u64,
    pub moffset: u64,
    pub pt_index: u32,
    pub match_bits: u64,
    pub hdr_data: u64,
    pub uid: u32,
    pub ack_req: AckReq,
    pub user_ptr: u64,
    pub atom_op: Option<AtomOp>,
    pub atom_type: Option<AtomType>,
    pub operand: [u8; 16],
    pub ni_fail: NiFail,

    // Initiator half.
    pub init_state: InitState,
    pub target: TargetId,
    pub peer: ProcessId,
    pub put_md: Option<MdHandle>,
    pub get_md: Option<MdHandle>,
    pub put_offset: u64,
    pub get_offset: u64,
    pub put_resid: u64,
    pub get_resid: u64,
    /// Prepared request, parked between composition and posting.
    pub send_buf: Option<crate::buffer::Buf>,
    /// Send completion outcome, once it arrives.
    pub send_done: Option<bool>,
    pub reply: Option<ReplyInfo>,
    /// Scratch registrations backing indirect SGE lists, freed at
    /// cleanup: (cookie, backing storage).
    pub indirect_scratch: Vec<(u32, Box<[u8]>)>,

    // Target half.
    pub tgt_state: TgtState,
    pub initiator: ProcessId,
    pub src_rank: u32,
    pub le: Option<Handle>,
    pub matched_list: ListKind,
    pub start_addr: u64,
    /// Where in the entry's region the payload goes.
    pub local_offset: u64,
    pub auto_unlink: bool,
    pub data_out: Option<Data>,
    pub data_in: Option<Data>,
    /// Outstanding DMA work requests owned by this transaction.
    pub rdma_comp: u32,
    /// Bounce area for atomics and indirect-list fetches:
    /// (cookie, backing storage).
    pub bounce: Option<(u32, Box<[u8]>)>,
    /// Parsed indirect SGE list, once fetched.
    pub indirect_sges: Option<Vec<Sge>>,
    /// Initiator-side handle echoed back in responses.
    pub req_handle: u64,
}

impl XferState {
    fn blank(op: Op) -> Self {
        Self {
            operation: op,
            rlength: 0,
            roffset: 0,
            mlength: 0,
            moffset: 0,
            pt_index: 0,
            match_bits: 0,
            hdr_data: 0,
            uid: 0,
            ack_req: AckReq::NoAck,
            user_ptr: 0,
            atom_op: None,
            atom_type: None,
            operand: [0; 16],
            ni_fail: NiFail::Ok,
            init_state: InitState::Start,
            target: TargetId::Phys(ProcessId::new(0, 0)),
            peer: ProcessId::new(0, 0),
            put_md: None,
            get_md: None,
            put_offset: 0,
            get_offset: 0,
            put_resid: 0,
            get_resid: 0,
            send_buf: None,
            send_done: None,
            reply: None,
            indirect_scratch: Vec::new(),
            tgt_state: TgtState::Start,
            initiator: ProcessId::new(0, 0),
            src_rank: 0,
            le: None,
            matched_list: ListKind::Priority,
            start_addr: 0,
            local_offset: 0,
            auto_unlink: false,
            data_out: None,
            data_in: None,
            rdma_comp: 0,
            bounce: None,
            indirect_sges: None,
            req_handle: 0,
        }
    }

    /// Build initiator state from validated operation arguments.
    pub fn new_initiator(args: &OpArgs, uid: u32) -> Self {
        let mut st = Self::blank(args.op);
        st.target = args.target;
        st.pt_index = args.pt_index;
        st.match_bits = args.match_bits;
        st.roffset = args.remote_offset;
        st.ack_req = args.ack_req;
        st.hdr_data = args.hdr_data;
        st.user_ptr = args.user_ptr;
        st.uid = uid;
        st.put_md = args.put_md;
        st.get_md = args.get_md;
        st.put_offset = args.put_offset;
        st.get_offset = args.get_offset;
        st.rlength = args.length;
        st.put_resid = args.length;
        st.get_resid = args.length;
        st.atom_op = args.atom_op;
        st.atom_type = args.atom_type;
        st.operand = args.operand;
        st.init_state = InitState::Start;
        st
    }

    /// Build target state from a decoded request.
    #[allow(clippy::too_many_arguments)]
    pub fn new_target(
        op: Op,
        initiator: ProcessId,
        src_rank: u32,
        rlength: u64,
        hdr: &crate::wire::ReqHdr,
        data_out: Option<Data>,
        data_in: Option<Data>,
        ack_req: AckReq,
    ) -> Self {
        let mut st = Self::blank(op);
        st.initiator = initiator;
        st.src_rank = src_rank;
        st.rlength = rlength;
        st.roffset = hdr.roffset;
        st.pt_index = hdr.pt_index;
        st.match_bits = hdr.match_bits;
        st.hdr_data = hdr.hdr_data;
        st.uid = hdr.uid;
        st.ack_req = ack_req;
        st.atom_op = AtomOp::from_u8(hdr.atom_op);
        st.atom_type = AtomType::from_u8(hdr.atom_type);
        st.operand = hdr.operand;
        st.req_handle = hdr.handle;
        st.data_out = data_out;
        st.data_in = data_in;
        st.tgt_state = TgtState::Start;
        st
    }
}

/// One in-flight transaction.
pub struct Xfer {
    pub handle: Handle,
    pub role: Role,
    state: Mutex<XferState>,
}

impl Xfer {
    pub fn new(handle: Handle, role: Role, state: XferState) -> Self {
        Self {
            handle,
            role,
            state: Mutex::new(state),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, XferState> {
        self.state.lock().unwrap()
    }
}
