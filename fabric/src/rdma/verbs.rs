//! Verbs resources and work-request plumbing
//!
//! Per-connection protection domain, completion channel/queue, memory
//! registration and the small set of post operations the fabric needs: a
//! single control-message SEND, a single control-message receive, and a
//! chained batch of one-sided READs.

use super::ffi;
use anyhow::{anyhow, bail, Result};
use log::debug;
use std::os::raw::c_void;
use std::ptr;

/// Protection domain owned by one connection.
pub struct ProtectionDomain {
    pd: *mut ffi::ibv_pd,
}

unsafe impl Send for ProtectionDomain {}
unsafe impl Sync for ProtectionDomain {}

impl ProtectionDomain {
    pub fn alloc(ctx: *mut ffi::ibv_context) -> Result<Self> {
        let pd = unsafe { ffi::ibv_alloc_pd(ctx) };
        if pd.is_null() {
            return Err(anyhow!("Failed to allocate protection domain"));
        }
        Ok(Self { pd })
    }

    pub(crate) fn raw(&self) -> *mut ffi::ibv_pd {
        self.pd
    }
}

impl Drop for ProtectionDomain {
    fn drop(&mut self) {
        if !self.pd.is_null() {
            unsafe { ffi::ibv_dealloc_pd(self.pd) };
        }
    }
}

/// Completion event channel feeding one poller thread.
pub struct CompletionChannel {
    ch: *mut ffi::ibv_comp_channel,
}

unsafe impl Send for CompletionChannel {}
unsafe impl Sync for CompletionChannel {}

impl CompletionChannel {
    pub fn new(ctx: *mut ffi::ibv_context) -> Result<Self> {
        let ch = unsafe { ffi::ibv_create_comp_channel(ctx) };
        if ch.is_null() {
            return Err(anyhow!("Failed to create completion channel"));
        }
        Ok(Self { ch })
    }

    pub fn handle(&self) -> CompChannelHandle {
        CompChannelHandle(self.ch)
    }
}

impl Drop for CompletionChannel {
    fn drop(&mut self) {
        if !self.ch.is_null() {
            unsafe { ffi::ibv_destroy_comp_channel(self.ch) };
        }
    }
}

/// Completion queue with notification armed.
pub struct CompletionQueue {
    cq: *mut ffi::ibv_cq,
}

unsafe impl Send for CompletionQueue {}
unsafe impl Sync for CompletionQueue {}

impl CompletionQueue {
    /// Create a CQ of `depth` entries delivering events on `channel`, with
    /// the first notification already requested.
    pub fn create(
        ctx: *mut ffi::ibv_context,
        depth: i32,
        channel: &CompletionChannel,
    ) -> Result<Self> {
        let cq = unsafe { ffi::ibv_create_cq(ctx, depth, ptr::null_mut(), channel.ch, 0) };
        if cq.is_null() {
            return Err(anyhow!("Failed to create completion queue (depth {})", depth));
        }
        let cq = Self { cq };
        cq.handle().rearm()?;
        Ok(cq)
    }

    pub(crate) fn raw(&self) -> *mut ffi::ibv_cq {
        self.cq
    }

    pub fn handle(&self) -> CqHandle {
        CqHandle(self.cq)
    }
}

impl Drop for CompletionQueue {
    fn drop(&mut self) {
        if !self.cq.is_null() {
            unsafe { ffi::ibv_destroy_cq(self.cq) };
        }
    }
}

/// Copyable completion-channel reference for the poller thread. The owning
/// connection must outlive the poller; teardown joins the poller before
/// dropping the channel.
#[derive(Clone, Copy)]
pub struct CompChannelHandle(pub(crate) *mut ffi::ibv_comp_channel);

unsafe impl Send for CompChannelHandle {}

impl CompChannelHandle {
    /// Block until the next completion event, acknowledging it. The caller
    /// re-arms notification on the returned queue before draining it.
    pub fn wait(&self) -> Result<CqHandle> {
        let mut cq: *mut ffi::ibv_cq = ptr::null_mut();
        let mut cq_ctx: *mut c_void = ptr::null_mut();
        let ret = unsafe { ffi::ibv_get_cq_event(self.0, &mut cq, &mut cq_ctx) };
        if ret != 0 {
            bail!("completion channel closed");
        }
        unsafe { ffi::ibv_ack_cq_events(cq, 1) };
        Ok(CqHandle(cq))
    }
}

/// Copyable completion-queue reference.
#[derive(Clone, Copy)]
pub struct CqHandle(pub(crate) *mut ffi::ibv_cq);

unsafe impl Send for CqHandle {}

impl CqHandle {
    /// Request notification for the next completion event.
    pub fn rearm(&self) -> Result<()> {
        let ret = unsafe { ffi::ibv_req_notify_cq(self.0, 0) };
        if ret != 0 {
            bail!("Failed to request CQ notification");
        }
        Ok(())
    }

    /// Non-blocking poll for a single completion.
    pub fn poll_one(&self) -> Result<Option<WorkCompletion>> {
        let mut wc: ffi::ibv_wc = unsafe { std::mem::zeroed() };
        let n = unsafe { ffi::ibv_poll_cq(self.0, 1, &mut wc) };
        if n < 0 {
            bail!("CQ polling failed");
        }
        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(WorkCompletion(wc)))
        }
    }
}

/// One polled work completion.
pub struct WorkCompletion(ffi::ibv_wc);

impl WorkCompletion {
    pub fn wr_id(&self) -> u64 {
        self.0.wr_id
    }

    pub fn is_success(&self) -> bool {
        self.0.status == ffi::ibv_wc_status::IBV_WC_SUCCESS
    }

    pub fn status(&self) -> u32 {
        self.0.status
    }

    /// Whether this completion reports a posted receive (as opposed to a
    /// SEND or one-sided READ we issued).
    pub fn is_recv(&self) -> bool {
        self.0.opcode & ffi::ibv_wc_opcode::IBV_WC_RECV != 0
    }

    pub fn byte_len(&self) -> u32 {
        self.0.byte_len
    }
}

/// Registered memory region.
///
/// Non-owning: the caller keeps the underlying buffer alive for at least as
/// long as the region. Deregistered on drop.
pub struct MemoryRegion {
    mr: *mut ffi::ibv_mr,
    pub addr: *mut u8,
    pub length: usize,
    pub lkey: u32,
    pub rkey: u32,
}

unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Register `length` bytes at `addr` under `pd`.
    ///
    /// # Arguments
    /// * `access` - verbs access flags (0 for send-only buffers)
    pub fn register(
        pd: &ProtectionDomain,
        addr: *mut u8,
        length: usize,
        access: i32,
    ) -> Result<Self> {
        let mr = unsafe { ffi::ibv_reg_mr(pd.raw(), addr as *mut c_void, length, access) };
        if mr.is_null() {
            return Err(anyhow!("Failed to register memory region ({} bytes)", length));
        }

        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };
        debug!("Registered MR: lkey=0x{:x}, rkey=0x{:x}, len={}", lkey, rkey, length);

        Ok(Self {
            mr,
            addr,
            length,
            lkey,
            rkey,
        })
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if !self.mr.is_null() {
            unsafe { ffi::ibv_dereg_mr(self.mr) };
        }
    }
}

/// Local landing slot for one READ in a batch.
#[derive(Debug, Clone, Copy)]
pub struct ReadTarget {
    pub addr: u64,
    pub lkey: u32,
}

/// Copyable queue-pair reference for posting work requests.
#[derive(Clone, Copy)]
pub struct QpHandle(pub(crate) *mut ffi::ibv_qp);

unsafe impl Send for QpHandle {}

impl QpHandle {
    /// Post a single receive for a control message.
    pub fn post_recv(&self, wr_id: u64, addr: u64, length: u32, lkey: u32) -> Result<()> {
        let mut sge = ffi::ibv_sge { addr, length, lkey };
        let mut wr: ffi::ibv_recv_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;

        let mut bad_wr: *mut ffi::ibv_recv_wr = ptr::null_mut();
        let ret = unsafe { ffi::ibv_post_recv(self.0, &mut wr, &mut bad_wr) };
        if ret != 0 {
            bail!("Failed to post receive");
        }
        Ok(())
    }

    /// Post a signaled SEND of a control message.
    pub fn post_send(&self, wr_id: u64, addr: u64, length: u32, lkey: u32) -> Result<()> {
        let mut sge = ffi::ibv_sge { addr, length, lkey };
        let mut wr: ffi::ibv_send_wr = unsafe { std::mem::zeroed() };
        wr.wr_id = wr_id;
        wr.sg_list = &mut sge;
        wr.num_sge = 1;
        wr.opcode = ffi::ibv_wr_opcode::IBV_WR_SEND;
        wr.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED;

        let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();
        let ret = unsafe { ffi::ibv_post_send(self.0, &mut wr, &mut bad_wr) };
        if ret != 0 {
            bail!("Failed to post SEND");
        }
        Ok(())
    }

    /// Post one chained batch of signaled READs, all from the same remote
    /// region, each landing in its own local target.
    pub fn post_read_batch(
        &self,
        wr_id: u64,
        remote_addr: u64,
        remote_rkey: u32,
        targets: &[ReadTarget],
        length: u32,
    ) -> Result<()> {
        if targets.is_empty() {
            bail!("READ batch must contain at least one work request");
        }

        let n = targets.len();
        let mut sges: Vec<ffi::ibv_sge> = Vec::with_capacity(n);
        for t in targets {
            sges.push(ffi::ibv_sge {
                addr: t.addr,
                length,
                lkey: t.lkey,
            });
        }

        let mut wrs: Vec<ffi::ibv_send_wr> = Vec::with_capacity(n);
        for sge in sges.iter_mut() {
            let mut wr: ffi::ibv_send_wr = unsafe { std::mem::zeroed() };
            wr.wr_id = wr_id;
            wr.sg_list = sge;
            wr.num_sge = 1;
            wr.opcode = ffi::ibv_wr_opcode::IBV_WR_RDMA_READ;
            wr.send_flags = ffi::ibv_send_flags::IBV_SEND_SIGNALED;
            unsafe {
                wr.wr.rdma.remote_addr = remote_addr;
                wr.wr.rdma.rkey = remote_rkey;
            }
            wrs.push(wr);
        }

        // Link the chain after every element is in place; the vector no
        // longer reallocates.
        let base = wrs.as_mut_ptr();
        for k in 0..n - 1 {
            unsafe { (*base.add(k)).next = base.add(k + 1) };
        }

        let mut bad_wr: *mut ffi::ibv_send_wr = ptr::null_mut();
        let ret = unsafe { ffi::ibv_post_send(self.0, base, &mut bad_wr) };
        if ret != 0 {
            bail!("Failed to post READ batch ({} work requests)", n);
        }
        Ok(())
    }
}

/// Access constants re-exported for connection builders.
pub mod access {
    use super::ffi;

    pub const NONE: i32 = 0;
    pub const LOCAL_WRITE: i32 = ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE as i32;
    pub const REMOTE_READ: i32 = ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ as i32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "stub-rdma")]
    fn stub_mode_fails_registration() {
        // No protection domain can exist in stub mode, so exercise the null
        // paths directly.
        let pd = ProtectionDomain::alloc(std::ptr::null_mut());
        assert!(pd.is_err());
    }

    #[test]
    fn recv_opcode_flag() {
        let mut wc: ffi::ibv_wc = unsafe { std::mem::zeroed() };
        wc.opcode = ffi::ibv_wc_opcode::IBV_WC_RECV;
        assert!(WorkCompletion(wc).is_recv());

        wc.opcode = ffi::ibv_wc_opcode::IBV_WC_RDMA_READ;
        assert!(!WorkCompletion(wc).is_recv());
    }
}
