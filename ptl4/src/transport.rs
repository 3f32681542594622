//! Transport abstraction: one interface over RDMA-style queue pairs and
//! the shared-memory fragment path.

use std::sync::Arc;

use crate::buffer::Buf;
use crate::conn::{Conn, ConnState};
use crate::error::{Error, Result};
use crate::handle::Handle;
use crate::shmem::ShmemJob;
use crate::soft::{SoftFabric, SoftNode};
use crate::wire::Sge;

/// How a posted send completes.
pub enum SendOutcome {
    /// A work completion will arrive on the completion queue and return
    /// the buffer there.
    Posted,
    /// The message was delivered synchronously; the buffer is handed
    /// back for reuse.
    Completed(Buf),
}

/// A failed send, carrying the buffer back so nothing leaks.
pub struct SendFailed {
    pub error: Error,
    pub buf: Buf,
}

/// Direction of target-driven DMA, from the target's point of view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaDir {
    /// Pull from the initiator's memory (puts, atomics).
    FromInitiator,
    /// Push into the initiator's memory (gets, replies with data).
    ToInitiator,
}

/// How a DMA request completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaOutcome {
    /// A work completion will arrive; count it in `rdma_comp`.
    Posted,
    /// The copy happened synchronously.
    Done,
}

/// Uniform transport interface used by the state machines.
pub trait Transport: Send + Sync {
    /// Post `buf` toward `conn`'s peer. If `buf.signalled` is not
    /// already set, the per-connection completion threshold decides
    /// whether this send requests a completion.
    fn send_message(&self, conn: &Conn, buf: Buf) -> std::result::Result<SendOutcome, SendFailed>;

    /// Move `local` (a window registered on this interface) against
    /// `remote` (a window on the initiator) on behalf of `xfer`.
    fn post_tgt_dma(
        &self,
        conn: &Conn,
        xfer: Handle,
        dir: DmaDir,
        local: Sge,
        remote: Sge,
    ) -> Result<DmaOutcome>;

    /// Request a send completion only every `n` sends on `conn`.
    fn set_send_completion_threshold(&self, conn: &Conn, n: u32);
}

/// RDMA transport over the verbs provider.
pub struct RdmaTransport;

impl Transport for RdmaTransport {
    fn send_message(&self, conn: &Conn, mut buf: Buf) -> std::result::Result<SendOutcome, SendFailed> {
        let mut inner = conn.lock();
        if inner.state != ConnState::Connected || inner.qp.is_none() {
            return Err(SendFailed {
                error: Error::Fail,
                buf,
            });
        }
        if !buf.signalled {
            buf.signalled = inner.next_signalled();
        }
        inner.qp.as_ref().unwrap().post_send(buf);
        Ok(SendOutcome::Posted)
    }

    fn post_tgt_dma(
        &self,
        conn: &Conn,
        xfer: Handle,
        dir: DmaDir,
        local: Sge,
        remote: Sge,
    ) -> Result<DmaOutcome> {
        let inner = conn.lock();
        let qp = inner.qp.as_ref().ok_or(Error::Fail)?;
        match dir {
            DmaDir::FromInitiator => qp.post_rdma_read(xfer, local, remote),
            DmaDir::ToInitiator => qp.post_rdma_write(xfer, local, remote),
        }
        Ok(DmaOutcome::Posted)
    }

    fn set_send_completion_threshold(&self, conn: &Conn, n: u32) {
        conn.lock().completion_threshold = n;
    }
}

/// Shared-memory transport: fragment-queue delivery plus a synchronous
/// cross-process copy facade for bulk data.
pub struct ShmemTransport {
    pub job: Arc<ShmemJob>,
    pub my_rank: u32,
    pub node: Arc<SoftNode>,
    pub fabric: Arc<SoftFabric>,
}

impl ShmemTransport {
    fn dest_rank(&self, conn: &Conn) -> Result<u32> {
        self.job.rank_of_pid(conn.id.pid).ok_or(Error::Fail)
    }
}

impl Transport for ShmemTransport {
    fn send_message(&self, conn: &Conn, buf: Buf) -> std::result::Result<SendOutcome, SendFailed> {
        let dest = match self.dest_rank(conn) {
            Ok(d) => d,
            Err(error) => return Err(SendFailed { error, buf }),
        };
        let frag = match self.job.alloc_frag(self.my_rank) {
            Ok(f) => f,
            Err(error) => return Err(SendFailed { error, buf }),
        };
        if let Err(error) = self.job.send_frag(self.my_rank, dest, frag, buf.bytes()) {
            self.job.free_frag(self.my_rank, frag);
            return Err(SendFailed { error, buf });
        }
        Ok(SendOutcome::Completed(buf))
    }

    fn post_tgt_dma(
        &self,
        conn: &Conn,
        _xfer: Handle,
        dir: DmaDir,
        local: Sge,
        remote: Sge,
    ) -> Result<DmaOutcome> {
        if local.len != remote.len {
            return Err(Error::ArgInvalid);
        }
        let peer = self.fabric.node(conn.id).ok_or(Error::Fail)?;
        let theirs = peer.mr(remote.cookie).ok_or(Error::ArgInvalid)?;
        let ours = self.node.mr(local.cookie).ok_or(Error::ArgInvalid)?;
        let mut tmp = vec![0u8; local.len as usize];
        match dir {
            DmaDir::FromInitiator => {
                theirs.read(remote.offset, &mut tmp)?;
                ours.write(local.offset, &tmp)?;
            }
            DmaDir::ToInitiator => {
                ours.read(local.offset, &mut tmp)?;
                theirs.write(remote.offset, &tmp)?;
            }
        }
        Ok(DmaOutcome::Done)
    }

    fn set_send_completion_threshold(&self, conn: &Conn, n: u32) {
        conn.lock().completion_threshold = n;
    }
}
