//! Pause/resume/stop signalling between the control API and a running
//! scheduler, plus the process-wide registry enforcing one active
//! scheduler per queue.

use dashmap::DashMap;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tokio_util::sync::CancellationToken;

/// Shared control block for one scheduler instance.
#[derive(Debug, Default)]
pub struct SchedulerControl {
    paused: AtomicBool,
    stop: CancellationToken,
}

impl SchedulerControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Request termination: running dispatches are cancelled and no
    /// further tasks dispatch.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Token cancelled when the scheduler stops; dispatches derive their
    /// per-task tokens from it.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }
}

/// Registry of active schedulers keyed by queue id.
#[derive(Debug, Default)]
pub struct SchedulerRegistry {
    active: DashMap<String, Arc<SchedulerControl>>,
}

impl SchedulerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the queue for a new scheduler. Fails when one is already
    /// active; at most one scheduler drives a queue at a time.
    pub fn try_register(&self, queue_id: &str, control: Arc<SchedulerControl>) -> bool {
        match self.active.entry(queue_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(control);
                true
            }
        }
    }

    pub fn unregister(&self, queue_id: &str) {
        self.active.remove(queue_id);
    }

    pub fn get(&self, queue_id: &str) -> Option<Arc<SchedulerControl>> {
        self.active.get(queue_id).map(|entry| entry.value().clone())
    }

    pub fn is_active(&self, queue_id: &str) -> bool {
        self.active.contains_key(queue_id)
    }

    /// Signal pause; true when an active scheduler existed.
    pub fn pause(&self, queue_id: &str) -> bool {
        match self.get(queue_id) {
            Some(control) => {
                control.pause();
                true
            }
            None => false,
        }
    }

    /// Signal resume; true when an active scheduler existed.
    pub fn resume(&self, queue_id: &str) -> bool {
        match self.get(queue_id) {
            Some(control) => {
                control.resume();
                true
            }
            None => false,
        }
    }

    /// Signal stop; true when an active scheduler existed.
    pub fn stop(&self, queue_id: &str) -> bool {
        match self.get(queue_id) {
            Some(control) => {
                control.stop();
                true
            }
            None => false,
        }
    }

    /// Stop every active scheduler (process shutdown).
    pub fn stop_all(&self) {
        for entry in self.active.iter() {
            entry.value().stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_enforces_single_scheduler_per_queue() {
        let registry = SchedulerRegistry::new();
        let first = SchedulerControl::new();
        let second = SchedulerControl::new();

        assert!(registry.try_register("q-1", first));
        assert!(!registry.try_register("q-1", second));

        registry.unregister("q-1");
        assert!(registry.try_register("q-1", SchedulerControl::new()));
    }

    #[test]
    fn signals_reach_registered_control() {
        let registry = SchedulerRegistry::new();
        let control = SchedulerControl::new();
        registry.try_register("q-1", control.clone());

        assert!(registry.pause("q-1"));
        assert!(control.is_paused());

        assert!(registry.resume("q-1"));
        assert!(!control.is_paused());

        assert!(registry.stop("q-1"));
        assert!(control.is_stopped());

        assert!(!registry.pause("missing"));
    }
}
