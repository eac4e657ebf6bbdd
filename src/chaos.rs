//! Probabilistic fault injection.
//!
//! Every error checkpoint in every stage routes its outcome through an
//! injector, which with a small independent probability replaces a success
//! with a synthetic failure. Real failures are never altered. Run with
//! probability 0 in production.

use rand::Rng;
use thiserror::Error;

/// The synthetic failure produced by the injector.
#[derive(Debug, Clone, Copy, Error)]
#[error("synthetic fault injected")]
pub struct SyntheticFault;

#[derive(Debug, Clone)]
pub struct ChaosInjector {
    probability: f64,
}

impl ChaosInjector {
    /// Probability is clamped to [0, 1]. Reference range 0.001 to 0.05.
    pub fn new(probability: f64) -> Self {
        Self {
            probability: probability.clamp(0.0, 1.0),
        }
    }

    pub fn disabled() -> Self {
        Self::new(0.0)
    }

    pub fn probability(&self) -> f64 {
        self.probability
    }

    /// Replace `Ok` with a synthetic fault with the configured probability.
    pub fn inject<T, E: From<SyntheticFault>>(&self, result: Result<T, E>) -> Result<T, E> {
        if result.is_err() {
            return result;
        }
        if self.probability > 0.0 && rand::thread_rng().gen_bool(self.probability) {
            return Err(SyntheticFault.into());
        }
        result
    }
}
