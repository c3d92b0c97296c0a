//! Liveness watcher
//!
//! Walks the control-plane table every two seconds and probes each valid
//! pod with a zero-signal delivery. A pod whose process is gone gets its
//! RDMA connection disconnected; the session event loop then observes
//! DISCONNECTED and unwinds. The watcher terminates with the process.

use crate::control_plane::ControlPlane;
use log::{debug, warn};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

pub const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Zero-signal probe: delivery failure means the process is gone.
pub fn pod_alive(pid: u32) -> bool {
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

pub fn spawn(cp: Arc<ControlPlane>) -> JoinHandle<()> {
    thread::spawn(move || loop {
        thread::sleep(SWEEP_INTERVAL);
        let reaped = cp.reap_dead(pod_alive, |entry| {
            if let Err(e) = entry.cm.disconnect() {
                warn!("disconnect for pod {} failed: {:#}", entry.pid, e);
            }
        });
        if reaped > 0 {
            debug!("reaped {} pods, {} entries tracked", reaped, cp.len());
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_sees_this_process_alive() {
        assert!(pod_alive(std::process::id()));
    }

    #[test]
    fn probe_sees_bogus_pid_dead() {
        // Far beyond any real pid_max.
        assert!(!pod_alive(0x3fff_ffff));
    }
}
