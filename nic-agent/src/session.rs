//! NIC-side session manager
//!
//! Builds the per-connection verbs resources when a host agent connects:
//! a protection domain, completion channel and queue, the RC queue pair,
//! and one landing buffer per READ in a batch. The connection identifier
//! carries only the logical-id key; the typed record lives in the session
//! manager's table until teardown.

use crate::scheduler::{self, PollerCtx, Scheduler, CTRL_WR_ID};
use anyhow::{Error, Result};
use fabric::proto::CTRL_MSG_SIZE;
use fabric::rdma::cm::{CmHandle, CmId};
use fabric::rdma::verbs::{
    access, CompletionChannel, CompletionQueue, MemoryRegion, ProtectionDomain, ReadTarget,
};
use fabric::CQ_HEADROOM;
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

pub struct NicConfig {
    pub listen_port: u16,
    pub sampling_interval: Duration,
    pub block_size: usize,
    pub num_blocks: usize,
}

/// One accepted host connection and everything registered under it.
///
/// Field order matters: regions deregister before the buffers they cover
/// are freed, the completion queue goes before its channel, and the
/// identifier is destroyed last.
pub struct NicConnection {
    logical_id: usize,
    poller: Option<JoinHandle<()>>,
    // Regions deregister in reverse of registration order.
    _landing_mrs: Vec<MemoryRegion>,
    _recv_mr: MemoryRegion,
    _cq: CompletionQueue,
    _channel: CompletionChannel,
    _pd: ProtectionDomain,
    _recv_buf: Box<[u8; CTRL_MSG_SIZE]>,
    _landing_bufs: Vec<Box<[u8]>>,
    id: CmId,
}

impl NicConnection {
    /// Admit the connection request carried by `handle`: allocate a logical
    /// id, build resources, spawn the poller and accept.
    pub fn build(shared: &Arc<Scheduler>, handle: CmHandle, cfg: &NicConfig) -> Result<Self> {
        let logical_id = shared.slots.lock().acquire().map_err(Error::new)?;

        let result = Self::build_inner(shared, logical_id, handle, cfg);
        if result.is_err() {
            // The poller (if it ever started) has been joined by now, so
            // the slot can go straight back to the pool.
            shared.slots.lock().release(logical_id);
        }
        result
    }

    fn build_inner(
        shared: &Arc<Scheduler>,
        logical_id: usize,
        handle: CmHandle,
        cfg: &NicConfig,
    ) -> Result<Self> {
        let mut id = CmId::from_incoming(handle);
        id.set_context_key(logical_id);

        let verbs = id.verbs_context()?;
        let pd = ProtectionDomain::alloc(verbs)?;
        let channel = CompletionChannel::new(verbs)?;
        let depth = cfg.num_blocks + CQ_HEADROOM;
        let cq = CompletionQueue::create(verbs, depth as i32, &channel)?;

        let mut recv_buf = Box::new([0u8; CTRL_MSG_SIZE]);
        let mut landing_bufs: Vec<Box<[u8]>> = (0..cfg.num_blocks)
            .map(|_| vec![0u8; cfg.block_size].into_boxed_slice())
            .collect();

        let recv_mr = MemoryRegion::register(
            &pd,
            recv_buf.as_mut_ptr(),
            CTRL_MSG_SIZE,
            access::LOCAL_WRITE,
        )?;
        let mut landing_mrs = Vec::with_capacity(cfg.num_blocks);
        for buf in landing_bufs.iter_mut() {
            landing_mrs.push(MemoryRegion::register(
                &pd,
                buf.as_mut_ptr(),
                cfg.block_size,
                access::LOCAL_WRITE,
            )?);
        }

        id.create_qp(&pd, &cq, depth as u32)?;
        let qp = id.qp()?;
        qp.post_recv(
            CTRL_WR_ID,
            recv_buf.as_ptr() as u64,
            CTRL_MSG_SIZE as u32,
            recv_mr.lkey,
        )?;

        let targets: Vec<ReadTarget> = landing_mrs
            .iter()
            .map(|mr| ReadTarget {
                addr: mr.addr as u64,
                lkey: mr.lkey,
            })
            .collect();

        let poller = scheduler::spawn_poller(
            Arc::clone(shared),
            PollerCtx {
                logical_id,
                channel: channel.handle(),
                qp,
                cm: id.handle(),
                recv_addr: recv_buf.as_ptr() as u64,
                recv_lkey: recv_mr.lkey,
                landing: targets,
                block_size: cfg.block_size as u32,
            },
        )?;
        shared.connection_up();

        let mut conn = Self {
            logical_id,
            poller: Some(poller),
            _landing_mrs: landing_mrs,
            _recv_mr: recv_mr,
            _cq: cq,
            _channel: channel,
            _pd: pd,
            _recv_buf: recv_buf,
            _landing_bufs: landing_bufs,
            id,
        };

        if let Err(e) = conn.id.accept() {
            conn.shutdown(shared);
            return Err(e);
        }

        info!(
            "accepted connection {} ({} landing buffers of {} bytes)",
            logical_id, cfg.num_blocks, cfg.block_size
        );
        Ok(conn)
    }

    pub fn logical_id(&self) -> usize {
        self.logical_id
    }

    /// Stop the poller: request termination (unblocks a poller waiting at
    /// the batch-issue gate), destroy the queue pair (its flush wakes a
    /// poller blocked on the completion channel) and join the thread.
    pub fn shutdown(&mut self, shared: &Scheduler) {
        shared.request_terminate(self.logical_id);
        self.id.destroy_qp();
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
    }
}

/// Unwind a disconnected peer. Repeated disconnects for the same logical
/// id find the table entry already gone and are no-ops.
pub fn teardown(
    shared: &Arc<Scheduler>,
    conns: &mut HashMap<usize, NicConnection>,
    handle: CmHandle,
) {
    let key = handle.context_key();
    let Some(mut conn) = conns.remove(&key) else {
        debug!("disconnect for unknown connection {}, ignoring", key);
        return;
    };

    info!("peer disconnected, tearing down connection {}", key);
    conn.shutdown(shared);
    drop(conn);
    shared.slots.lock().release(key);
    info!(
        "connection {} destroyed, {} still live",
        key,
        shared.live_connections()
    );
}
