//! The binary roll behind every detection.
//!
//! Draws come straight from the operating system CSPRNG. There is no seed
//! and no shared generator state, so neither callers nor administrators
//! can predict or bias an outcome, and concurrent rolls need no locking.

use rand::rngs::OsRng;
use rand::{CryptoRng, Rng, RngCore};

/// Resolution of a draw: results have four decimal places.
pub const ROLL_SCALE: u32 = 10_000;

#[derive(Debug, Clone, Copy, Default)]
pub struct Roller;

impl Roller {
    pub fn new() -> Self {
        Self
    }

    /// Uniform draw in `[0, ROLL_SCALE]`.
    pub fn draw(&self) -> u32 {
        draw_from(&mut OsRng)
    }

    /// `true` with probability `p`.
    ///
    /// `p <= 0` and `p >= 1` are decided without drawing so that forced
    /// probabilities are deterministic.
    pub fn roll(&self, probability: f64) -> bool {
        if probability.is_nan() || probability <= 0.0 {
            return false;
        }
        if probability >= 1.0 {
            return true;
        }
        let r = self.draw() as f64 / ROLL_SCALE as f64;
        r <= probability
    }
}

fn draw_from<R: RngCore + CryptoRng>(rng: &mut R) -> u32 {
    rng.gen_range(0..=ROLL_SCALE)
}
