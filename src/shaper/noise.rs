// Differential-privacy noise for the shaping decision
//
// Perturbs the observed backlog with zero-mean Gaussian noise and clamps the
// result, so the number of bytes released per interval reveals little about
// the real traffic volume.

use crate::error::ConfigError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Parameters of the noise mechanism
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NoiseParams {
    /// Privacy/overhead knob; scales the standard deviation
    pub noise_multiplier: f64,
    /// Sensitivity of the backlog query in bytes
    pub sensitivity: f64,
    /// Smallest decision ever returned
    pub min_decision: u64,
    /// Largest decision ever returned
    pub max_decision: u64,
}

impl NoiseParams {
    /// Reject parameters that would make `decide` meaningless
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.noise_multiplier.is_finite() || self.noise_multiplier < 0.0 {
            return Err(ConfigError::InvalidNoise(format!(
                "noise_multiplier must be a finite non-negative number, got {}",
                self.noise_multiplier
            )));
        }
        if !self.sensitivity.is_finite() || self.sensitivity < 0.0 {
            return Err(ConfigError::InvalidNoise(format!(
                "sensitivity must be a finite non-negative number, got {}",
                self.sensitivity
            )));
        }
        if self.min_decision > self.max_decision {
            return Err(ConfigError::InvalidNoise(format!(
                "min_decision ({}) exceeds max_decision ({})",
                self.min_decision, self.max_decision
            )));
        }
        Ok(())
    }

    /// Standard deviation of the added noise
    pub fn sigma(&self) -> f64 {
        self.sensitivity * self.noise_multiplier
    }
}

impl Default for NoiseParams {
    fn default() -> Self {
        Self {
            noise_multiplier: 1.0,
            sensitivity: 1500.0,
            min_decision: 0,
            max_decision: 1_000_000,
        }
    }
}

struct GaussianState {
    rng: StdRng,
    /// Second value of the last polar Box-Muller draw
    spare: Option<f64>,
}

/// Produces noisy, clamped send decisions from a backlog
pub struct NoiseGenerator {
    params: NoiseParams,
    state: Mutex<GaussianState>,
}

impl NoiseGenerator {
    /// Create a generator seeded from the operating system
    ///
    /// # Arguments
    ///
    /// * `params` - Validated noise parameters
    pub fn configure(params: NoiseParams) -> Result<Self, ConfigError> {
        Self::build(params, StdRng::from_entropy())
    }

    /// Create a generator with a fixed seed (reproducible decisions)
    pub fn with_seed(params: NoiseParams, seed: u64) -> Result<Self, ConfigError> {
        Self::build(params, StdRng::seed_from_u64(seed))
    }

    fn build(params: NoiseParams, rng: StdRng) -> Result<Self, ConfigError> {
        params.validate()?;
        Ok(Self {
            params,
            state: Mutex::new(GaussianState { rng, spare: None }),
        })
    }

    pub fn params(&self) -> &NoiseParams {
        &self.params
    }

    /// Bytes that may be released for an interval with `backlog` bytes queued
    ///
    /// Always within `[min_decision, max_decision]`.
    pub fn decide(&self, backlog: usize) -> usize {
        let noise = self.params.sigma() * self.standard_normal();
        let noisy = backlog as f64 + noise;
        let clamped = noisy.clamp(self.params.min_decision as f64, self.params.max_decision as f64);
        clamped.floor() as usize
    }

    /// One N(0, 1) sample via the polar Box-Muller method
    fn standard_normal(&self) -> f64 {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(spare) = state.spare.take() {
            return spare;
        }
        loop {
            let u: f64 = state.rng.gen_range(-1.0..1.0);
            let v: f64 = state.rng.gen_range(-1.0..1.0);
            let s = u * u + v * v;
            if s > 0.0 && s < 1.0 {
                let factor = (-2.0 * s.ln() / s).sqrt();
                state.spare = Some(v * factor);
                return u * factor;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(multiplier: f64, min: u64, max: u64) -> NoiseParams {
        NoiseParams {
            noise_multiplier: multiplier,
            sensitivity: 1000.0,
            min_decision: min,
            max_decision: max,
        }
    }

    #[test]
    fn test_rejects_invalid_parameters() {
        assert!(NoiseGenerator::configure(params(-1.0, 0, 10)).is_err());
        assert!(NoiseGenerator::configure(params(f64::NAN, 0, 10)).is_err());
        assert!(NoiseGenerator::configure(params(1.0, 10, 0)).is_err());
        let mut bad = params(1.0, 0, 10);
        bad.sensitivity = f64::INFINITY;
        assert!(matches!(bad.validate(), Err(ConfigError::InvalidNoise(_))));
    }

    #[test]
    fn test_decisions_stay_within_clamp() {
        let generator = NoiseGenerator::with_seed(params(50.0, 100, 5000), 7).unwrap();
        for backlog in [0usize, 50, 2500, 10_000, usize::MAX / 2] {
            for _ in 0..500 {
                let decision = generator.decide(backlog);
                assert!((100..=5000).contains(&decision), "{decision} out of range");
            }
        }
    }

    #[test]
    fn test_zero_multiplier_returns_clamped_backlog() {
        let generator = NoiseGenerator::with_seed(params(0.0, 10, 1000), 1).unwrap();
        assert_eq!(generator.decide(500), 500);
        assert_eq!(generator.decide(0), 10);
        assert_eq!(generator.decide(5000), 1000);
    }

    #[test]
    fn test_small_multiplier_converges_to_backlog() {
        let generator = NoiseGenerator::with_seed(params(1e-9, 0, 1_000_000), 3).unwrap();
        for _ in 0..100 {
            let decision = generator.decide(4096) as i64;
            assert!((decision - 4096).abs() <= 1);
        }
    }

    #[test]
    fn test_same_seed_same_decisions() {
        let a = NoiseGenerator::with_seed(params(2.0, 0, 100_000), 99).unwrap();
        let b = NoiseGenerator::with_seed(params(2.0, 0, 100_000), 99).unwrap();
        let left: Vec<usize> = (0..32).map(|_| a.decide(20_000)).collect();
        let right: Vec<usize> = (0..32).map(|_| b.decide(20_000)).collect();
        assert_eq!(left, right);
    }

    #[test]
    fn test_noise_is_roughly_standard() {
        let generator = NoiseGenerator::with_seed(params(1.0, 0, 1), 11).unwrap();
        let n = 20_000;
        let samples: Vec<f64> = (0..n).map(|_| generator.standard_normal()).collect();
        let mean = samples.iter().sum::<f64>() / n as f64;
        let variance = samples.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((variance - 1.0).abs() < 0.1, "variance {variance}");
    }
}
