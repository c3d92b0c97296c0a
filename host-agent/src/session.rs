//! Host-side RDMA session, one per admitted pod
//!
//! Each session runs on its own thread with its own CM event channel. The
//! event machine mirrors what the connection manager expects from an active
//! endpoint: resolve the DPU address, resolve the route, connect, and on
//! ESTABLISHED advertise the registered segment with the MR control
//! message. DISCONNECTED (raised by the liveness watcher or the peer)
//! unwinds the connection and the session thread with it.

use crate::control_plane::ControlPlane;
use crate::registry::AdmittedPod;
use anyhow::{bail, Context, Result};
use fabric::proto::{
    ControlMessage, RecvEvent, RecvState, RegionDescriptor, SendEvent, SendState, CTRL_MSG_SIZE,
};
use fabric::rdma::cm::{CmEventType, CmHandle, CmId, EventChannel, RESOLVE_TIMEOUT_MS};
use fabric::rdma::verbs::{
    access, CompChannelHandle, CompletionChannel, CompletionQueue, MemoryRegion, ProtectionDomain,
    QpHandle,
};
use fabric::shm::SharedSegment;
use log::{debug, error, info, warn};
use std::net::ToSocketAddrs;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

pub struct HostConfig {
    pub dpu_addr: String,
    pub dpu_port: u16,
    pub block_size: usize,
    pub num_blocks: usize,
}

const CTRL_WR_ID: u64 = 1;
/// Control traffic only on the host side: the MR send, the DONE receive
/// and a little slack.
const HOST_CQ_DEPTH: i32 = 10;

/// Run the pod's session on a dedicated thread. The thread owns the
/// segment from here on and removes the control-plane entry when it ends.
pub fn spawn(
    cfg: Arc<HostConfig>,
    pod: AdmittedPod,
    cp: Arc<ControlPlane>,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("pod-{}", pod.pid))
        .spawn(move || {
            let pid = pod.pid;
            if let Err(e) = run_session(&cfg, pod, &cp) {
                error!("session for pod {} failed: {:#}", pid, e);
            }
            cp.remove(pid);
        })
        .context("failed to spawn pod session thread")
}

fn run_session(cfg: &HostConfig, pod: AdmittedPod, cp: &ControlPlane) -> Result<()> {
    let AdmittedPod { pid, segment } = pod;

    let channel = EventChannel::new()?;
    let mut id = CmId::create(&channel)?;
    cp.register(pid, segment.name().to_string(), id.handle());

    let dst = (cfg.dpu_addr.as_str(), cfg.dpu_port)
        .to_socket_addrs()
        .context("failed to resolve DPU address")?
        .next()
        .context("DPU address resolved to nothing")?;
    id.resolve_addr(&dst, RESOLVE_TIMEOUT_MS)?;

    let mut conn: Option<HostConnection> = None;
    let result = drive_events(&channel, &mut id, segment, &mut conn);

    if let Some(c) = conn.take() {
        c.shutdown(&mut id);
    }
    result
}

fn drive_events(
    channel: &EventChannel,
    id: &mut CmId,
    segment: SharedSegment,
    conn: &mut Option<HostConnection>,
) -> Result<()> {
    let mut segment = Some(segment);

    loop {
        let event = channel.get_event()?;
        match event.kind {
            CmEventType::AddrResolved => {
                debug!("address resolved");
                let seg = segment.take().context("duplicate address resolution")?;
                *conn = Some(HostConnection::build(id, seg)?);
                id.resolve_route(RESOLVE_TIMEOUT_MS)?;
            }
            CmEventType::RouteResolved => {
                debug!("route resolved");
                id.connect()?;
            }
            CmEventType::Established => {
                let c = conn.as_mut().context("ESTABLISHED before connection build")?;
                c.advertise_region()?;
                info!(
                    "connected to DPU, advertised region rkey=0x{:x}",
                    c.descriptor.rkey
                );
            }
            CmEventType::Disconnected => {
                info!("disconnected");
                return Ok(());
            }
            other => bail!("unexpected CM event {:?} (status {})", other, event.status),
        }
    }
}

/// Verbs resources for one pod connection.
///
/// Field order matters: regions deregister before the buffers and segment
/// they cover are released.
struct HostConnection {
    qp: QpHandle,
    poller: Option<JoinHandle<()>>,
    // Regions deregister in reverse of registration order.
    _region_mr: MemoryRegion,
    _recv_mr: MemoryRegion,
    send_mr: MemoryRegion,
    _cq: CompletionQueue,
    _channel: CompletionChannel,
    _pd: ProtectionDomain,
    send_buf: Box<[u8; CTRL_MSG_SIZE]>,
    _recv_buf: Box<[u8; CTRL_MSG_SIZE]>,
    segment: SharedSegment,
    descriptor: RegionDescriptor,
}

impl HostConnection {
    /// Build the per-connection resources once the address is resolved:
    /// control buffers, the segment registered for remote read, one posted
    /// receive for the eventual DONE, and the completion poller.
    fn build(id: &mut CmId, segment: SharedSegment) -> Result<Self> {
        let verbs = id.verbs_context()?;
        let pd = ProtectionDomain::alloc(verbs)?;
        let channel = CompletionChannel::new(verbs)?;
        let cq = CompletionQueue::create(verbs, HOST_CQ_DEPTH, &channel)?;

        let mut send_buf = Box::new([0u8; CTRL_MSG_SIZE]);
        let mut recv_buf = Box::new([0u8; CTRL_MSG_SIZE]);

        let send_mr = MemoryRegion::register(&pd, send_buf.as_mut_ptr(), CTRL_MSG_SIZE, access::NONE)?;
        let recv_mr = MemoryRegion::register(
            &pd,
            recv_buf.as_mut_ptr(),
            CTRL_MSG_SIZE,
            access::LOCAL_WRITE,
        )?;
        // The pod writes the segment; this side only ever exposes it for
        // one-sided reads.
        let region_mr = MemoryRegion::register(
            &pd,
            segment.as_mut_ptr(),
            segment.len(),
            access::REMOTE_READ,
        )?;

        let descriptor = RegionDescriptor {
            addr: region_mr.addr as u64,
            length: region_mr.length as u64,
            rkey: region_mr.rkey,
            lkey: region_mr.lkey,
        };

        id.create_qp(&pd, &cq, HOST_CQ_DEPTH as u32)?;
        let qp = id.qp()?;
        qp.post_recv(
            CTRL_WR_ID,
            recv_buf.as_ptr() as u64,
            CTRL_MSG_SIZE as u32,
            recv_mr.lkey,
        )?;

        let poller = spawn_poller(HostPollerCtx {
            channel: channel.handle(),
            qp,
            cm: id.handle(),
            recv_addr: recv_buf.as_ptr() as u64,
            recv_lkey: recv_mr.lkey,
        })?;

        Ok(Self {
            qp,
            poller: Some(poller),
            _region_mr: region_mr,
            _recv_mr: recv_mr,
            send_mr,
            _cq: cq,
            _channel: channel,
            _pd: pd,
            send_buf,
            _recv_buf: recv_buf,
            segment,
            descriptor,
        })
    }

    /// Post the MR advertisement. Called from the event-loop thread on the
    /// ESTABLISHED transition, so the queue pair is connected by the time
    /// the send is issued.
    fn advertise_region(&mut self) -> Result<()> {
        ControlMessage::Mr(self.descriptor).encode_into(&mut self.send_buf[..])?;
        self.qp.post_send(
            CTRL_WR_ID,
            self.send_buf.as_ptr() as u64,
            CTRL_MSG_SIZE as u32,
            self.send_mr.lkey,
        )
    }

    /// Unwind after DISCONNECTED: destroy the queue pair (the flush wakes
    /// the poller), join the poller, unlink the segment, then let the
    /// regions and buffers drop in registration-reverse order.
    fn shutdown(mut self, id: &mut CmId) {
        id.destroy_qp();
        if let Some(handle) = self.poller.take() {
            let _ = handle.join();
        }
        if let Err(e) = self.segment.unlink() {
            warn!("segment cleanup failed: {:#}", e);
        }
        info!("connection destroyed");
    }
}

struct HostPollerCtx {
    channel: CompChannelHandle,
    qp: QpHandle,
    cm: CmHandle,
    recv_addr: u64,
    recv_lkey: u32,
}

fn spawn_poller(ctx: HostPollerCtx) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("host-cq-poll".into())
        .spawn(move || {
            if let Err(e) = poll_loop(&ctx) {
                debug!("host poller stopped: {:#}", e);
            }
        })
        .context("failed to spawn host completion poller")
}

fn poll_loop(ctx: &HostPollerCtx) -> Result<()> {
    let mut send_state = SendState::Init;
    let mut recv_state = RecvState::Init;

    loop {
        let cq = ctx.channel.wait()?;
        cq.rearm()?;

        while let Some(wc) = cq.poll_one()? {
            if !wc.is_success() {
                bail!("work completion failed with status {}", wc.status());
            }

            if wc.is_recv() {
                let buf =
                    unsafe { std::slice::from_raw_parts(ctx.recv_addr as *const u8, CTRL_MSG_SIZE) };
                let done = ControlMessage::decode(buf)
                    .map_err(anyhow::Error::from)
                    .and_then(|m| m.expect_done().map_err(Into::into));
                match done {
                    Ok(()) => {
                        recv_state = recv_state.advance(RecvEvent::DoneReceived)?;
                        info!("received DONE from NIC agent");
                        // Rearm the receive queue; nothing further is
                        // expected before DISCONNECTED, but the queue pair
                        // stays legal until teardown.
                        ctx.qp.post_recv(
                            CTRL_WR_ID,
                            ctx.recv_addr,
                            CTRL_MSG_SIZE as u32,
                            ctx.recv_lkey,
                        )?;
                    }
                    Err(e) => {
                        warn!("protocol violation from NIC agent: {:#}", e);
                        let _ = ctx.cm.disconnect();
                        return Err(e);
                    }
                }
            } else {
                send_state = send_state.advance(SendEvent::MrSendCompleted)?;
                debug!("MR advertisement delivered");
            }
        }
    }
}
