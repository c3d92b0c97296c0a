//! Control-plane table
//!
//! One entry per admitted pod, keyed by process id. The registry worker
//! inserts, the liveness watcher marks dead pods invalid, and the session
//! thread removes its entry once the disconnect has unwound. Everything
//! happens under a single mutex.

use fabric::rdma::cm::CmHandle;
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;

pub struct PodEntry {
    pub pid: u32,
    pub segment_name: String,
    pub cm: CmHandle,
    pub valid: bool,
}

#[derive(Default)]
pub struct ControlPlane {
    entries: Mutex<HashMap<u32, PodEntry>>,
}

impl ControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, pid: u32, segment_name: String, cm: CmHandle) {
        let entry = PodEntry {
            pid,
            segment_name,
            cm,
            valid: true,
        };
        self.entries.lock().insert(pid, entry);
    }

    pub fn remove(&self, pid: u32) -> Option<PodEntry> {
        self.entries.lock().remove(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// One liveness sweep: probe every valid entry, and for each pod that
    /// is gone run `disconnect` and mark the entry invalid. Returns how
    /// many pods were reaped. Invalid entries are never probed again, so
    /// the sweep is idempotent.
    pub fn reap_dead<P, D>(&self, mut alive: P, mut disconnect: D) -> usize
    where
        P: FnMut(u32) -> bool,
        D: FnMut(&PodEntry),
    {
        let mut entries = self.entries.lock();
        let mut reaped = 0;

        for entry in entries.values_mut() {
            if entry.valid && !alive(entry.pid) {
                info!(
                    "Pod {} is not active anymore, closing RDMA connection",
                    entry.pid
                );
                disconnect(entry);
                entry.valid = false;
                reaped += 1;
            }
        }
        reaped
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid(cp: &ControlPlane, pid: u32) -> bool {
        cp.entries.lock().get(&pid).map_or(false, |e| e.valid)
    }

    #[test]
    fn reap_marks_dead_pods_invalid_once() {
        let cp = ControlPlane::new();
        cp.register(100, "shm-100".into(), CmHandle::dangling());
        cp.register(200, "shm-200".into(), CmHandle::dangling());

        let mut disconnected = Vec::new();
        let reaped = cp.reap_dead(|pid| pid == 100, |e| disconnected.push(e.pid));

        assert_eq!(reaped, 1);
        assert_eq!(disconnected, vec![200]);
        assert!(valid(&cp, 100));
        assert!(!valid(&cp, 200));

        // A second sweep finds nothing new even though pod 200 is still dead.
        let reaped = cp.reap_dead(|pid| pid == 100, |e| disconnected.push(e.pid));
        assert_eq!(reaped, 0);
        assert_eq!(disconnected, vec![200]);
    }

    #[test]
    fn remove_unwinds_the_entry() {
        let cp = ControlPlane::new();
        cp.register(7, "shm-7".into(), CmHandle::dangling());
        assert_eq!(cp.len(), 1);

        let entry = cp.remove(7).unwrap();
        assert_eq!(entry.segment_name, "shm-7");
        assert_eq!(cp.len(), 0);
        assert!(cp.remove(7).is_none());
    }
}
