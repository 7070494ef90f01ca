//! Deterministic shared random source.
//!
//! Server and clients run the same linear congruential generator,
//! reseed its state to the current tick at every logic tick, and
//! therefore draw identical sequences without ever sending random
//! values over the wire.

/// Seeded linear congruential generator with a 32-bit state.
#[derive(Clone, Debug)]
pub struct SeededRng {
    seed: u32,
    state: u32,
}

impl SeededRng {
    #[must_use]
    pub fn new(seed: u32) -> Self {
        Self { seed, state: 0 }
    }

    /// The session seed mixed into every step.
    #[must_use]
    pub const fn seed(&self) -> u32 {
        self.seed
    }

    /// Resets the generator state, typically to the current tick so
    /// that every peer draws the same sequence during that tick.
    pub fn reseed(&mut self, state: u32) {
        self.state = state;
    }

    /// Resets the generator state to the low 32 bits of a tick.
    pub fn reseed_from_tick(&mut self, tick: u64) {
        self.state = (tick & 0xFFFF_FFFF) as u32;
    }

    fn step(&mut self) -> u32 {
        let mixed = u64::from(self.state) + u64::from(self.seed);
        let next = (1_103_515_245u64 * mixed + 12_345) & 0xFFFF_FFFF;
        self.state = next as u32;
        self.state
    }

    /// The next value in `[0, 1)`.
    pub fn next_f64(&mut self) -> f64 {
        f64::from(self.step()) / 4_294_967_296.0
    }

    /// The next raw 32-bit value.
    pub fn next_u32(&mut self) -> u32 {
        self.step()
    }
}
