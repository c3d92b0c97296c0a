//! Connection-manager layer
//!
//! Wraps the librdmacm event channel and connection identifier. Both agents
//! drive the same pattern the RDMA CM expects: create an identifier on an
//! event channel, kick off an asynchronous step (resolve, connect, listen)
//! and react to the events the channel delivers.

use super::ffi;
use super::verbs::{CompletionQueue, ProtectionDomain, QpHandle};
use anyhow::{anyhow, bail, Result};
use log::debug;
use nix::sys::socket::{SockaddrLike, SockaddrStorage};
use std::net::SocketAddr;
use std::ptr;

/// Address/route resolution timeout handed to librdmacm.
pub const RESOLVE_TIMEOUT_MS: i32 = 500;

/// Asynchronous event channel, one per CM event loop.
pub struct EventChannel {
    ec: *mut ffi::rdma_event_channel,
}

unsafe impl Send for EventChannel {}

impl EventChannel {
    pub fn new() -> Result<Self> {
        let ec = unsafe { ffi::rdma_create_event_channel() };
        if ec.is_null() {
            return Err(anyhow!("Failed to create CM event channel (RDMA not available)"));
        }
        Ok(Self { ec })
    }

    /// Block for the next CM event. The raw event is copied out and
    /// acknowledged before this returns, so the caller never holds a
    /// reference into librdmacm's event storage.
    pub fn get_event(&self) -> Result<CmEvent> {
        let mut raw: *mut ffi::rdma_cm_event = ptr::null_mut();
        let ret = unsafe { ffi::rdma_get_cm_event(self.ec, &mut raw) };
        if ret != 0 {
            bail!("CM event channel closed");
        }

        let (kind, id, status) = unsafe { ((*raw).event, (*raw).id, (*raw).status) };
        unsafe { ffi::rdma_ack_cm_event(raw) };

        Ok(CmEvent {
            kind: CmEventType::from(kind),
            id: CmHandle(id),
            status,
        })
    }

    pub(crate) fn raw(&self) -> *mut ffi::rdma_event_channel {
        self.ec
    }
}

impl Drop for EventChannel {
    fn drop(&mut self) {
        if !self.ec.is_null() {
            unsafe { ffi::rdma_destroy_event_channel(self.ec) };
        }
    }
}

/// CM event kinds the agents react to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmEventType {
    AddrResolved,
    AddrError,
    RouteResolved,
    RouteError,
    ConnectRequest,
    ConnectError,
    Unreachable,
    Rejected,
    Established,
    Disconnected,
    Other(u32),
}

impl From<u32> for CmEventType {
    fn from(ev: u32) -> Self {
        use super::ffi::rdma_cm_event_type as t;
        match ev {
            t::RDMA_CM_EVENT_ADDR_RESOLVED => Self::AddrResolved,
            t::RDMA_CM_EVENT_ADDR_ERROR => Self::AddrError,
            t::RDMA_CM_EVENT_ROUTE_RESOLVED => Self::RouteResolved,
            t::RDMA_CM_EVENT_ROUTE_ERROR => Self::RouteError,
            t::RDMA_CM_EVENT_CONNECT_REQUEST => Self::ConnectRequest,
            t::RDMA_CM_EVENT_CONNECT_ERROR => Self::ConnectError,
            t::RDMA_CM_EVENT_UNREACHABLE => Self::Unreachable,
            t::RDMA_CM_EVENT_REJECTED => Self::Rejected,
            t::RDMA_CM_EVENT_ESTABLISHED => Self::Established,
            t::RDMA_CM_EVENT_DISCONNECTED => Self::Disconnected,
            other => Self::Other(other),
        }
    }
}

/// One delivered (and already acknowledged) CM event.
pub struct CmEvent {
    pub kind: CmEventType,
    pub id: CmHandle,
    pub status: i32,
}

/// Non-owning copy of a connection identifier.
///
/// Safe to hand across threads: the only operations exposed are the ones
/// librdmacm documents as thread-safe (`rdma_disconnect`) and reading the
/// context key stashed by the owning session manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CmHandle(pub(crate) *mut ffi::rdma_cm_id);

unsafe impl Send for CmHandle {}
unsafe impl Sync for CmHandle {}

impl CmHandle {
    /// Placeholder for entries whose identifier does not exist (yet).
    pub const fn dangling() -> Self {
        Self(ptr::null_mut())
    }

    /// Initiate a disconnect; the owning event loop observes DISCONNECTED.
    pub fn disconnect(&self) -> Result<()> {
        if self.0.is_null() {
            bail!("connection has no identifier");
        }
        let ret = unsafe { ffi::rdma_disconnect(self.0) };
        if ret != 0 {
            bail!("rdma_disconnect failed");
        }
        Ok(())
    }

    /// Logical-id key stored on the identifier by the session manager.
    pub fn context_key(&self) -> usize {
        if self.0.is_null() {
            return usize::MAX;
        }
        unsafe { (*self.0).context as usize }
    }
}

/// Owning wrapper around a connection identifier.
pub struct CmId {
    id: *mut ffi::rdma_cm_id,
}

unsafe impl Send for CmId {}

impl CmId {
    /// Create a fresh identifier bound to `channel` (RC service type).
    pub fn create(channel: &EventChannel) -> Result<Self> {
        let mut id: *mut ffi::rdma_cm_id = ptr::null_mut();
        let ret = unsafe {
            ffi::rdma_create_id(
                channel.raw(),
                &mut id,
                ptr::null_mut(),
                ffi::rdma_port_space::RDMA_PS_TCP,
            )
        };
        if ret != 0 {
            return Err(anyhow!("Failed to create CM identifier (RDMA not available)"));
        }
        Ok(Self { id })
    }

    /// Adopt the identifier delivered with a CONNECT_REQUEST event.
    pub fn from_incoming(handle: CmHandle) -> Self {
        Self { id: handle.0 }
    }

    pub fn handle(&self) -> CmHandle {
        CmHandle(self.id)
    }

    /// Store the session manager's logical-id key on the identifier. Only
    /// the key crosses the FFI boundary, never a pointer.
    pub fn set_context_key(&mut self, key: usize) {
        unsafe { (*self.id).context = key as *mut std::os::raw::c_void };
    }

    pub fn bind(&mut self, addr: &SocketAddr) -> Result<()> {
        let ss = sockaddr_storage(addr);
        let ret = unsafe { ffi::rdma_bind_addr(self.id, ss.as_ptr() as *mut ffi::sockaddr) };
        if ret != 0 {
            bail!("Failed to bind CM identifier to {}", addr);
        }
        Ok(())
    }

    pub fn listen(&mut self, backlog: i32) -> Result<()> {
        let ret = unsafe { ffi::rdma_listen(self.id, backlog) };
        if ret != 0 {
            bail!("rdma_listen failed");
        }
        Ok(())
    }

    pub fn resolve_addr(&mut self, dst: &SocketAddr, timeout_ms: i32) -> Result<()> {
        let ss = sockaddr_storage(dst);
        let ret = unsafe {
            ffi::rdma_resolve_addr(
                self.id,
                ptr::null_mut(),
                ss.as_ptr() as *mut ffi::sockaddr,
                timeout_ms,
            )
        };
        if ret != 0 {
            bail!("Failed to start address resolution for {}", dst);
        }
        Ok(())
    }

    pub fn resolve_route(&mut self, timeout_ms: i32) -> Result<()> {
        let ret = unsafe { ffi::rdma_resolve_route(self.id, timeout_ms) };
        if ret != 0 {
            bail!("Failed to start route resolution");
        }
        Ok(())
    }

    pub fn connect(&mut self) -> Result<()> {
        let mut params = conn_param();
        let ret = unsafe { ffi::rdma_connect(self.id, &mut params) };
        if ret != 0 {
            bail!("rdma_connect failed");
        }
        Ok(())
    }

    pub fn accept(&mut self) -> Result<()> {
        let mut params = conn_param();
        let ret = unsafe { ffi::rdma_accept(self.id, &mut params) };
        if ret != 0 {
            bail!("rdma_accept failed");
        }
        Ok(())
    }

    /// Create the RC queue pair for this identifier on `pd`, with `max_wr`
    /// outstanding work requests in each direction and single-element
    /// scatter/gather lists.
    pub fn create_qp(
        &mut self,
        pd: &ProtectionDomain,
        cq: &CompletionQueue,
        max_wr: u32,
    ) -> Result<()> {
        let mut attr: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        attr.send_cq = cq.raw();
        attr.recv_cq = cq.raw();
        attr.qp_type = ffi::ibv_qp_type::IBV_QPT_RC;
        attr.cap.max_send_wr = max_wr;
        attr.cap.max_recv_wr = max_wr;
        attr.cap.max_send_sge = 1;
        attr.cap.max_recv_sge = 1;

        let ret = unsafe { ffi::rdma_create_qp(self.id, pd.raw(), &mut attr) };
        if ret != 0 {
            bail!("Failed to create queue pair");
        }
        Ok(())
    }

    /// Destroy the queue pair, flushing any outstanding work requests.
    pub fn destroy_qp(&mut self) {
        let qp = unsafe { (*self.id).qp };
        if !qp.is_null() {
            unsafe { ffi::rdma_destroy_qp(self.id) };
        }
    }

    pub fn qp(&self) -> Result<QpHandle> {
        let qp = unsafe { (*self.id).qp };
        if qp.is_null() {
            bail!("queue pair not created");
        }
        Ok(QpHandle(qp))
    }

    /// Verbs context the identifier is bound to (valid once the address is
    /// resolved on the active side, or from the connect request on the
    /// passive side).
    pub fn verbs_context(&self) -> Result<*mut ffi::ibv_context> {
        let verbs = unsafe { (*self.id).verbs };
        if verbs.is_null() {
            bail!("identifier has no verbs context yet");
        }
        Ok(verbs)
    }
}

impl Drop for CmId {
    fn drop(&mut self) {
        if self.id.is_null() {
            return;
        }
        self.destroy_qp();
        unsafe { ffi::rdma_destroy_id(self.id) };
        debug!("CM identifier destroyed");
    }
}

fn conn_param() -> ffi::rdma_conn_param {
    let mut params: ffi::rdma_conn_param = unsafe { std::mem::zeroed() };
    params.initiator_depth = 1;
    params.responder_resources = 1;
    params.rnr_retry_count = 7; // infinite retry
    params
}

fn sockaddr_storage(addr: &SocketAddr) -> SockaddrStorage {
    match addr {
        SocketAddr::V4(v4) => SockaddrStorage::from(*v4),
        SocketAddr::V6(v6) => SockaddrStorage::from(*v6),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(feature = "stub-rdma")]
    fn stub_mode_reports_unavailable() {
        let channel = EventChannel::new();
        assert!(channel.is_err());
    }

    #[test]
    fn event_type_mapping() {
        assert_eq!(CmEventType::from(9), CmEventType::Established);
        assert_eq!(CmEventType::from(10), CmEventType::Disconnected);
        assert_eq!(CmEventType::from(4), CmEventType::ConnectRequest);
        assert_eq!(CmEventType::from(42), CmEventType::Other(42));
    }
}
