//! Wire formats: common header, request/acknowledgement tails, and the
//! tagged data descriptors that follow them.
//!
//! The common header is fixed-size with the payload length big-endian;
//! all other integers are little-endian. Layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       1     version (4 bits) | ni_type (2 bits) | pkt_fmt (2 bits)
//! 1       1     operation
//! 2       1     data flags (bit0: data_out present, bit1: data_in)
//! 3       1     ack_req
//! 4       4     reserved
//! 8       8     length (big-endian)
//! ```

use crate::error::{Error, Result};
use crate::types::NiFail;

/// Header format version understood by this engine.
pub const HDR_VER_1: u8 = 1;

/// Size of the common header.
pub const HDR_COMMON_SIZE: usize = 16;

/// Size of the request tail (including the common header).
pub const REQ_HDR_SIZE: usize = HDR_COMMON_SIZE + 72;

/// Size of the acknowledgement/reply tail (including the common header).
pub const ACK_HDR_SIZE: usize = HDR_COMMON_SIZE + 32;

/// Wire size of one scatter-gather element.
pub const SGE_WIRE_SIZE: usize = 20;

/// Wire operation codes.
///
/// Requests sort below `Disc`, responses above it; the receive
/// dispatcher relies on that ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Op {
    Put = 0,
    Get = 1,
    Atomic = 2,
    Fetch = 3,
    Swap = 4,
    Disc = 5,
    Reply = 6,
    Ack = 7,
    CtAck = 8,
    OcAck = 9,
}

impl Op {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Op::Put),
            1 => Some(Op::Get),
            2 => Some(Op::Atomic),
            3 => Some(Op::Fetch),
            4 => Some(Op::Swap),
            5 => Some(Op::Disc),
            6 => Some(Op::Reply),
            7 => Some(Op::Ack),
            8 => Some(Op::CtAck),
            9 => Some(Op::OcAck),
            _ => None,
        }
    }

    /// Target-bound request operation.
    #[inline]
    pub fn is_request(self) -> bool {
        self <= Op::Swap
    }

    /// Initiator-bound response operation.
    #[inline]
    pub fn is_response(self) -> bool {
        self >= Op::Reply
    }
}

/// Payload carriage format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PktFmt {
    /// Payload rides in-band behind the header.
    Short = 0,
    /// Header carries an RDMA descriptor the target drives.
    Rdma = 1,
    /// Header carries a descriptor of an SGE list to fetch first.
    Indirect = 2,
}

impl PktFmt {
    fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(PktFmt::Short),
            1 => Some(PktFmt::Rdma),
            2 => Some(PktFmt::Indirect),
            _ => None,
        }
    }
}

/// Decoded common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HdrCommon {
    pub version: u8,
    pub operation: Op,
    pub ni_type: u8,
    pub pkt_fmt: PktFmt,
    pub has_data_out: bool,
    pub has_data_in: bool,
    pub ack_req: u8,
    /// Requested length for requests, manipulated length for responses.
    pub length: u64,
}

impl HdrCommon {
    pub fn new(operation: Op, ni_type: u8, pkt_fmt: PktFmt, length: u64) -> Self {
        Self {
            version: HDR_VER_1,
            operation,
            ni_type,
            pkt_fmt,
            has_data_out: false,
            has_data_in: false,
            ack_req: 0,
            length,
        }
    }

    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HDR_COMMON_SIZE);
        buf[0] = (self.version & 0x0f) | ((self.ni_type & 0x3) << 4) | ((self.pkt_fmt as u8) << 6);
        buf[1] = self.operation as u8;
        buf[2] = (self.has_data_out as u8) | ((self.has_data_in as u8) << 1);
        buf[3] = self.ack_req;
        buf[4..8].fill(0);
        buf[8..16].copy_from_slice(&self.length.to_be_bytes());
    }

    /// Decode a common header. The version is returned as-is so callers
    /// can decide to drop rather than fail.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < HDR_COMMON_SIZE {
            return Err(Error::ArgInvalid);
        }
        let operation = Op::from_u8(buf[1]).ok_or(Error::ArgInvalid)?;
        let pkt_fmt = PktFmt::from_u8((buf[0] >> 6) & 0x3).ok_or(Error::ArgInvalid)?;
        Ok(Self {
            version: buf[0] & 0x0f,
            operation,
            ni_type: (buf[0] >> 4) & 0x3,
            pkt_fmt,
            has_data_out: buf[2] & 1 != 0,
            has_data_in: buf[2] & 2 != 0,
            ack_req: buf[3],
            length: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Request tail: everything the target needs to match and move data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqHdr {
    pub src_nid: u32,
    pub src_pid: u32,
    pub src_rank: u32,
    pub pt_index: u32,
    pub match_bits: u64,
    pub hdr_data: u64,
    pub roffset: u64,
    pub uid: u32,
    pub atom_op: u8,
    pub atom_type: u8,
    pub operand: [u8; 16],
    /// Initiator-side transaction handle, echoed back in responses.
    pub handle: u64,
}

impl ReqHdr {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= REQ_HDR_SIZE);
        let b = &mut buf[HDR_COMMON_SIZE..];
        b[0..4].copy_from_slice(&self.src_nid.to_le_bytes());
        b[4..8].copy_from_slice(&self.src_pid.to_le_bytes());
        b[8..12].copy_from_slice(&self.src_rank.to_le_bytes());
        b[12..16].copy_from_slice(&self.pt_index.to_le_bytes());
        b[16..24].copy_from_slice(&self.match_bits.to_le_bytes());
        b[24..32].copy_from_slice(&self.hdr_data.to_le_bytes());
        b[32..40].copy_from_slice(&self.roffset.to_le_bytes());
        b[40..44].copy_from_slice(&self.uid.to_le_bytes());
        b[44] = self.atom_op;
        b[45] = self.atom_type;
        b[46..48].fill(0);
        b[48..64].copy_from_slice(&self.operand);
        b[64..72].copy_from_slice(&self.handle.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < REQ_HDR_SIZE {
            return Err(Error::ArgInvalid);
        }
        let b = &buf[HDR_COMMON_SIZE..];
        let mut operand = [0u8; 16];
        operand.copy_from_slice(&b[48..64]);
        Ok(Self {
            src_nid: u32::from_le_bytes(b[0..4].try_into().unwrap()),
            src_pid: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            src_rank: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            pt_index: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            match_bits: u64::from_le_bytes(b[16..24].try_into().unwrap()),
            hdr_data: u64::from_le_bytes(b[24..32].try_into().unwrap()),
            roffset: u64::from_le_bytes(b[32..40].try_into().unwrap()),
            uid: u32::from_le_bytes(b[40..44].try_into().unwrap()),
            atom_op: b[44],
            atom_type: b[45],
            operand,
            handle: u64::from_le_bytes(b[64..72].try_into().unwrap()),
        })
    }
}

/// Acknowledgement / reply tail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckHdr {
    /// Initiator-side transaction handle echoed from the request.
    pub handle: u64,
    pub mlength: u64,
    pub moffset: u64,
    pub ni_fail: NiFail,
}

impl AckHdr {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= ACK_HDR_SIZE);
        let b = &mut buf[HDR_COMMON_SIZE..];
        b[0..8].copy_from_slice(&self.handle.to_le_bytes());
        b[8..16].copy_from_slice(&self.mlength.to_le_bytes());
        b[16..24].copy_from_slice(&self.moffset.to_le_bytes());
        b[24] = self.ni_fail.to_u8();
        b[25..32].fill(0);
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < ACK_HDR_SIZE {
            return Err(Error::ArgInvalid);
        }
        let b = &buf[HDR_COMMON_SIZE..];
        Ok(Self {
            handle: u64::from_le_bytes(b[0..8].try_into().unwrap()),
            mlength: u64::from_le_bytes(b[8..16].try_into().unwrap()),
            moffset: u64::from_le_bytes(b[16..24].try_into().unwrap()),
            ni_fail: NiFail::from_u8(b[24]).ok_or(Error::ArgInvalid)?,
        })
    }
}

/// One scatter-gather element: a registered-region cookie plus a window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub cookie: u32,
    pub offset: u64,
    pub len: u64,
}

impl Sge {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= SGE_WIRE_SIZE);
        buf[0..4].copy_from_slice(&self.cookie.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12..20].copy_from_slice(&self.len.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < SGE_WIRE_SIZE {
            return Err(Error::ArgInvalid);
        }
        Ok(Self {
            cookie: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            len: u64::from_le_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

/// A data descriptor attached to a request or reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Data {
    /// Payload bytes carried in the message itself.
    Inline(Vec<u8>),
    /// A single remote window the target drives DMA against.
    Rdma(Sge),
    /// Descriptor of a wire-encoded SGE list to fetch before the
    /// real transfer; `list.len` is the byte length of the list.
    Indirect { list: Sge },
}

const DATA_TAG_INLINE: u8 = 0;
const DATA_TAG_RDMA: u8 = 1;
const DATA_TAG_INDIRECT: u8 = 2;

impl Data {
    /// Packet format this descriptor implies.
    pub fn pkt_fmt(&self) -> PktFmt {
        match self {
            Data::Inline(_) => PktFmt::Short,
            Data::Rdma(_) => PktFmt::Rdma,
            Data::Indirect { .. } => PktFmt::Indirect,
        }
    }

    /// Encoded size in bytes.
    pub fn wire_size(&self) -> usize {
        match self {
            Data::Inline(bytes) => 8 + bytes.len(),
            Data::Rdma(_) | Data::Indirect { .. } => 24,
        }
    }

    /// Encode at the start of `buf`; returns bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        match self {
            Data::Inline(bytes) => {
                buf[0] = DATA_TAG_INLINE;
                buf[1..4].fill(0);
                buf[4..8].copy_from_slice(&(bytes.len() as u32).to_le_bytes());
                buf[8..8 + bytes.len()].copy_from_slice(bytes);
                8 + bytes.len()
            }
            Data::Rdma(sge) => {
                buf[0] = DATA_TAG_RDMA;
                buf[1..4].fill(0);
                sge.encode(&mut buf[4..]);
                24
            }
            Data::Indirect { list } => {
                buf[0] = DATA_TAG_INDIRECT;
                buf[1..4].fill(0);
                list.encode(&mut buf[4..]);
                24
            }
        }
    }

    /// Decode from the start of `buf`; returns the descriptor and the
    /// number of bytes consumed.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize)> {
        if buf.len() < 8 {
            return Err(Error::ArgInvalid);
        }
        match buf[0] {
            DATA_TAG_INLINE => {
                let len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
                if buf.len() < 8 + len {
                    return Err(Error::ArgInvalid);
                }
                Ok((Data::Inline(buf[8..8 + len].to_vec()), 8 + len))
            }
            DATA_TAG_RDMA => {
                if buf.len() < 24 {
                    return Err(Error::ArgInvalid);
                }
                Ok((Data::Rdma(Sge::decode(&buf[4..])?), 24))
            }
            DATA_TAG_INDIRECT => {
                if buf.len() < 24 {
                    return Err(Error::ArgInvalid);
                }
                Ok((
                    Data::Indirect {
                        list: Sge::decode(&buf[4..])?,
                    },
                    24,
                ))
            }
            _ => Err(Error::ArgInvalid),
        }
    }
}

/// Encode a list of SGEs for an indirect transfer.
pub fn encode_sge_list(sges: &[Sge]) -> Vec<u8> {
    let mut out = vec![0u8; sges.len() * SGE_WIRE_SIZE];
    for (i, sge) in sges.iter().enumerate() {
        sge.encode(&mut out[i * SGE_WIRE_SIZE..]);
    }
    out
}

/// Decode a wire-encoded SGE list.
pub fn decode_sge_list(buf: &[u8]) -> Result<Vec<Sge>> {
    if buf.len() % SGE_WIRE_SIZE != 0 {
        return Err(Error::ArgInvalid);
    }
    buf.chunks_exact(SGE_WIRE_SIZE).map(Sge::decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn common_hdr_round_trip() {
        let ops = [
            Op::Put,
            Op::Get,
            Op::Atomic,
            Op::Fetch,
            Op::Swap,
            Op::Disc,
            Op::Reply,
            Op::Ack,
            Op::CtAck,
            Op::OcAck,
        ];
        let fmts = [PktFmt::Short, PktFmt::Rdma, PktFmt::Indirect];
        for op in ops {
            for ni_type in 0..4u8 {
                for fmt in fmts {
                    for length in [0u64, 1, 7, 8, 4096, 1 << 40] {
                        let mut hdr = HdrCommon::new(op, ni_type, fmt, length);
                        hdr.has_data_out = length % 2 == 0;
                        hdr.has_data_in = length % 3 == 0;
                        hdr.ack_req = 2;
                        let mut buf = [0u8; HDR_COMMON_SIZE];
                        hdr.encode(&mut buf);
                        assert_eq!(HdrCommon::decode(&buf).unwrap(), hdr);
                    }
                }
            }
        }
    }

    #[test]
    fn op_classification() {
        assert!(Op::Put.is_request());
        assert!(Op::Swap.is_request());
        assert!(!Op::Disc.is_request());
        assert!(!Op::Disc.is_response());
        assert!(Op::Reply.is_response());
        assert!(Op::OcAck.is_response());
    }

    #[test]
    fn req_hdr_round_trip() {
        let hdr = ReqHdr {
            src_nid: 7,
            src_pid: 9,
            src_rank: 3,
            pt_index: 12,
            match_bits: 0xAABB_CCDD_EEFF_0011,
            hdr_data: 0xBEEF,
            roffset: 1 << 33,
            uid: 42,
            atom_op: 2,
            atom_type: 7,
            operand: [0x5a; 16],
            handle: 0xDEAD_BEEF_CAFE,
        };
        let mut buf = [0u8; REQ_HDR_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(ReqHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn ack_hdr_round_trip() {
        let hdr = AckHdr {
            handle: 0x1234,
            mlength: 100,
            moffset: 64,
            ni_fail: NiFail::PermViolation,
        };
        let mut buf = [0u8; ACK_HDR_SIZE];
        hdr.encode(&mut buf);
        assert_eq!(AckHdr::decode(&buf).unwrap(), hdr);
    }

    #[test]
    fn data_descriptors_round_trip() {
        let cases = vec![
            Data::Inline(vec![1, 2, 3, 4, 5]),
            Data::Inline(vec![]),
            Data::Rdma(Sge {
                cookie: 5,
                offset: 4096,
                len: 1 << 20,
            }),
            Data::Indirect {
                list: Sge {
                    cookie: 9,
                    offset: 0,
                    len: 3 * SGE_WIRE_SIZE as u64,
                },
            },
        ];
        for d in cases {
            let mut buf = vec![0u8; d.wire_size()];
            let n = d.encode(&mut buf);
            assert_eq!(n, d.wire_size());
            let (decoded, consumed) = Data::decode(&buf).unwrap();
            assert_eq!(decoded, d);
            assert_eq!(consumed, n);
        }
    }

    #[test]
    fn sge_list_round_trip() {
        let sges = vec![
            Sge {
                cookie: 1,
                offset: 0,
                len: 10,
            },
            Sge {
                cookie: 2,
                offset: 100,
                len: 20,
            },
        ];
        let wire = encode_sge_list(&sges);
        assert_eq!(decode_sge_list(&wire).unwrap(), sges);
    }

    #[test]
    fn bad_version_detectable() {
        let mut buf = [0u8; HDR_COMMON_SIZE];
        HdrCommon::new(Op::Put, 0, PktFmt::Short, 8).encode(&mut buf);
        buf[0] = (buf[0] & !0x0f) | 2; // version 2
        let hdr = HdrCommon::decode(&buf).unwrap();
        assert_ne!(hdr.version, HDR_VER_1);
    }
}
