//! Environment abstraction for deterministic testing.
//!
//! The only side effect the engine has besides transport I/O is the delay
//! between receive attempts while the device reports "pending". Routing it
//! through [`Environment`] lets tests replay long retry sequences without
//! wall-clock time.

use std::{thread, time::Duration};

/// Side effects the engine needs from its host.
pub trait Environment {
    /// Block the calling thread for `duration`.
    fn sleep(&self, duration: Duration);
}

/// Real environment backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

impl<E: Environment + ?Sized> Environment for &E {
    fn sleep(&self, duration: Duration) {
        (**self).sleep(duration);
    }
}
