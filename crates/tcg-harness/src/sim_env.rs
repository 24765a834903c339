//! Simulated environment.
//!
//! Records every sleep the engine asks for instead of sleeping, so a retry
//! budget of ten 50 ms delays costs nothing and can be asserted on.

use std::{cell::RefCell, time::Duration};

use tcg_core::env::Environment;

/// Environment that records sleeps.
#[derive(Debug, Default)]
pub struct SimEnv {
    sleeps: RefCell<Vec<Duration>>,
}

impl SimEnv {
    /// Create an environment with no recorded sleeps.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every requested sleep, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.borrow().clone()
    }

    /// Number of sleeps requested.
    pub fn sleep_count(&self) -> usize {
        self.sleeps.borrow().len()
    }

    /// Sum of all requested sleeps.
    pub fn total_slept(&self) -> Duration {
        self.sleeps.borrow().iter().sum()
    }
}

impl Environment for SimEnv {
    fn sleep(&self, duration: Duration) {
        self.sleeps.borrow_mut().push(duration);
    }
}
