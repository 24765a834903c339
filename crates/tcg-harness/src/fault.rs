//! Seeded "pending" fault injection.
//!
//! A real TPer may answer a receive with an empty ComPacket while it is still
//! working on the call. [`PendingInjector`] decides, per scripted reply, how
//! many such empty answers the fake transport delivers first. The same seed
//! always yields the same sequence.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Decides how many pending answers precede each reply.
#[derive(Debug, Clone)]
pub struct PendingInjector {
    rng: ChaCha8Rng,
    probability: f64,
    max_run: u32,
    injected: u32,
}

impl PendingInjector {
    /// Injector delaying a reply with `probability`, by 1 to `max_run`
    /// pending answers.
    ///
    /// Keep `max_run` within the engine's retry budget unless the test wants
    /// retry exhaustion.
    pub fn new(seed: u64, probability: f64, max_run: u32) -> Self {
        Self { rng: ChaCha8Rng::seed_from_u64(seed), probability: probability.clamp(0.0, 1.0), max_run, injected: 0 }
    }

    /// Pending answers to deliver before the next reply.
    pub fn next_run(&mut self) -> u32 {
        if self.max_run == 0 || !self.rng.gen_bool(self.probability) {
            return 0;
        }
        let run = self.rng.gen_range(1..=self.max_run);
        self.injected += run;
        run
    }

    /// Pending answers decided so far.
    pub fn injected(&self) -> u32 {
        self.injected
    }
}
