use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Start flag and ramp-up counter shared by `main` and the workers.
pub struct StartupBarrier {
    started: AtomicBool,
    ramped_up: AtomicUsize,
    /// Connections expected to ramp up.
    total: usize,
}

impl StartupBarrier {
    pub fn new(total: usize) -> StartupBarrier {
        StartupBarrier {
            started: AtomicBool::new(false),
            ramped_up: AtomicUsize::new(0),
            total,
        }
    }

    pub fn start(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Spins until `start` is called.
    pub fn wait_until_started(&self) {
        while !self.started() {
            std::hint::spin_loop();
        }
    }

    /// Called exactly once per connection, when it reaches its target rate.
    pub fn mark_ramped_up(&self) {
        self.ramped_up.fetch_add(1, Ordering::AcqRel);
    }

    pub fn ramped_up(&self) -> usize {
        self.ramped_up.load(Ordering::Acquire)
    }

    pub fn all_ramped_up(&self) -> bool {
        self.ramped_up() == self.total
    }
}
