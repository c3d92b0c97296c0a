//! MicroView telemetry fabric
//!
//! Shared building blocks for the host and NIC agents of a DPU-offloaded
//! telemetry collector: pods on the host publish metric samples into named
//! shared-memory segments, the host agent registers each segment as a
//! remote-readable RDMA region, and the NIC agent harvests every pod with
//! periodic batches of one-sided READs that bypass the host CPU entirely.
//!
//! The crate compiles in two modes:
//!
//! - **stub-rdma** (default): no RDMA libraries required. The connection
//!   manager and verbs wrappers fail at runtime; everything else (the
//!   control protocol, state machines, latency meters, slot pool and
//!   shared-memory segments) works and is unit tested.
//! - real mode (`--no-default-features`): bindgen-generated FFI over
//!   librdmacm/libibverbs, for hosts and DPUs with RDMA-capable NICs.

pub mod meter;
pub mod proto;
pub mod rdma;
pub mod shm;
pub mod slots;

/// Upper bound on concurrent pod connections; the NIC's per-index
/// synchronization tables are sized to this.
pub const MAX_CONNECTIONS: usize = 1024;

/// Headroom added to a connection's READ batch size when sizing its
/// completion queue and queue-pair capacities: outstanding READs plus the
/// posted control-message receive and slack for completions not yet reaped.
pub const CQ_HEADROOM: usize = 16;

pub use meter::LatencyMeter;
pub use proto::{ControlMessage, RegionDescriptor, CTRL_MSG_SIZE};
pub use rdma::{CmEvent, CmEventType, CmHandle, CmId, EventChannel};
pub use shm::{SharedSegment, SEGMENT_NAME_LEN};
pub use slots::SlotPool;
