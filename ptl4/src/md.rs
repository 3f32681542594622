//! Initiator-side memory descriptors.

use bitflags::bitflags;

use crate::error::{Error, Result};
use crate::handle::{CtHandle, EqHandle};
use crate::wire::Sge;

bitflags! {
    /// Memory descriptor options.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MdOptions: u32 {
        /// Count send completions on the attached counter.
        const EVENT_CT_SEND    = 1 << 0;
        /// Count replies on the attached counter.
        const EVENT_CT_REPLY   = 1 << 1;
        /// Count acknowledgements on the attached counter.
        const EVENT_CT_ACK     = 1 << 2;
        /// Count bytes instead of operations.
        const EVENT_CT_BYTES   = 1 << 3;
        /// Suppress full events for successful operations.
        const EVENT_SUCCESS_DISABLE = 1 << 4;
    }
}

/// A memory descriptor: one or more registered-memory windows exposed
/// to outgoing operations.
pub struct Md {
    /// Scatter list; a single element for contiguous descriptors.
    pub segments: Vec<Sge>,
    /// Total length across all segments.
    pub length: u64,
    pub eq: Option<EqHandle>,
    pub ct: Option<CtHandle>,
    pub options: MdOptions,
}

impl Md {
    pub fn new(
        segments: Vec<Sge>,
        eq: Option<EqHandle>,
        ct: Option<CtHandle>,
        options: MdOptions,
    ) -> Self {
        let length = segments.iter().map(|s| s.len).sum();
        Self {
            segments,
            length,
            eq,
            ct,
            options,
        }
    }

    /// Resolve `(offset, len)` within the descriptor into concrete
    /// scatter-gather elements.
    pub fn resolve(&self, offset: u64, len: u64) -> Result<Vec<Sge>> {
        if offset + len > self.length {
            return Err(Error::ArgInvalid);
        }
        let mut out = Vec::new();
        let mut skip = offset;
        let mut remaining = len;
        for seg in &self.segments {
            if remaining == 0 {
                break;
            }
            if skip >= seg.len {
                skip -= seg.len;
                continue;
            }
            let take = (seg.len - skip).min(remaining);
            out.push(Sge {
                cookie: seg.cookie,
                offset: seg.offset + skip,
                len: take,
            });
            skip = 0;
            remaining -= take;
        }
        if remaining != 0 {
            return Err(Error::ArgInvalid);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn md(segs: &[(u32, u64, u64)]) -> Md {
        Md::new(
            segs.iter()
                .map(|&(cookie, offset, len)| Sge {
                    cookie,
                    offset,
                    len,
                })
                .collect(),
            None,
            None,
            MdOptions::empty(),
        )
    }

    #[test]
    fn resolve_contiguous() {
        let m = md(&[(1, 0, 100)]);
        let sges = m.resolve(10, 50).unwrap();
        assert_eq!(sges, vec![Sge { cookie: 1, offset: 10, len: 50 }]);
    }

    #[test]
    fn resolve_spanning_iovec() {
        let m = md(&[(1, 0, 10), (2, 100, 10), (3, 200, 10)]);
        let sges = m.resolve(5, 20).unwrap();
        assert_eq!(
            sges,
            vec![
                Sge { cookie: 1, offset: 5, len: 5 },
                Sge { cookie: 2, offset: 100, len: 10 },
                Sge { cookie: 3, offset: 200, len: 5 },
            ]
        );
    }

    #[test]
    fn resolve_out_of_range() {
        let m = md(&[(1, 0, 10)]);
        assert!(m.resolve(5, 10).is_err());
    }

    #[test]
    fn resolve_zero_len() {
        let m = md(&[(1, 0, 10)]);
        assert!(m.resolve(10, 0).unwrap().is_empty());
    }
}
