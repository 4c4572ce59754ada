use std::sync::{
    atomic::{
        AtomicBool,
        Ordering,
    },
    Arc,
};

/// At-most-one-cycle entry for the collection, downstream sync and upload
/// components. Entry is a compare-and-swap, so an "already running" reply can
/// never be missed; the returned guard restores `Idle` on drop, on every exit
/// path.
#[derive(Clone, Debug)]
pub struct CycleGate {
    running: Arc<AtomicBool>,
}

impl CycleGate {
    pub fn new() -> Self {
        Self {
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Returns `None` while another cycle holds the gate.
    pub fn try_enter(&self) -> Option<CycleGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                running: self.running.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }
}

pub struct CycleGuard {
    running: Arc<AtomicBool>,
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_entry_is_rejected_until_guard_drops() {
        let gate = CycleGate::new();
        let guard = gate.try_enter().unwrap();
        assert!(gate.is_running());
        assert!(gate.try_enter().is_none());
        drop(guard);
        assert!(!gate.is_running());
        assert!(gate.try_enter().is_some());
    }

    #[test]
    fn guard_releases_on_panic_unwind() {
        let gate = CycleGate::new();
        let gate2 = gate.clone();
        let _ = std::panic::catch_unwind(move || {
            let _guard = gate2.try_enter().unwrap();
            panic!("cycle died");
        });
        assert!(!gate.is_running());
    }
}
