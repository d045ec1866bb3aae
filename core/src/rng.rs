//! Seeded randomness for the analytical stages.
//!
//! RULE: No stage touches a platform RNG. The Monte Carlo draws (and
//! anything random added later) come from a StageRng handed out by the
//! run's RngBank, keyed on the master seed stored with the run.
//!
//! Stream seed = master_seed XOR (slot * golden-ratio constant), so a
//! stage's draws depend only on the seed and its own slot. Appending a
//! slot leaves every existing stream untouched.

use rand::SeedableRng;
use rand_pcg::Pcg64Mcg;

/// A named, deterministic RNG for a single stage.
pub struct StageRng {
    pub name: &'static str,
    inner: Pcg64Mcg,
}

impl StageRng {
    /// Create a stage RNG from the master seed and a stable
    /// stage index. The index must never change once assigned.
    pub fn new(master_seed: u64, stage_index: u64) -> Self {
        let derived_seed = master_seed ^ (stage_index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        Self {
            name: "unnamed",
            inner: Pcg64Mcg::seed_from_u64(derived_seed),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Roll a float in [0.0, 1.0).
    pub fn next_f64(&mut self) -> f64 {
        use rand::RngCore;
        let bits = self.inner.next_u64();
        (bits >> 11) as f64 * (1.0 / (1u64 << 53) as f64)
    }

    /// Roll an index in [0, n).
    pub fn index_below(&mut self, n: usize) -> usize {
        use rand::RngCore;
        assert!(n > 0, "n must be > 0");
        (self.inner.next_u64() % n as u64) as usize
    }

    /// Bernoulli trial: returns true with probability p.
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    /// Gaussian sample via Box-Muller. Consumes exactly two draws,
    /// so stream positions stay aligned whatever the parameters.
    pub fn normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = self.next_f64().max(1e-300);
        let u2 = self.next_f64();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        mean + std_dev * z
    }
}

/// All stage RNGs for a single run, indexed by stable slot.
pub struct RngBank {
    master_seed: u64,
}

impl RngBank {
    pub fn new(master_seed: u64) -> Self {
        Self { master_seed }
    }

    pub fn master_seed(&self) -> u64 {
        self.master_seed
    }

    pub fn for_stage(&self, slot: StageSlot) -> StageRng {
        StageRng::new(self.master_seed, slot as u64).with_name(slot.name())
    }
}

/// Stable stage slot assignments.
/// NEVER reorder or remove entries. Append only.
/// Reordering changes every stage's seed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum StageSlot {
    MonteCarlo = 0,
    FactorAnalysis = 1,
    // Add new stages here, append only.
}

impl StageSlot {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MonteCarlo => "monte_carlo",
            Self::FactorAnalysis => "factor_analysis",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let bank = RngBank::new(42);
        let mut a = bank.for_stage(StageSlot::MonteCarlo);
        let mut b = bank.for_stage(StageSlot::MonteCarlo);
        for _ in 0..100 {
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
        }
    }

    #[test]
    fn slots_get_distinct_streams() {
        let bank = RngBank::new(42);
        let mut mc = bank.for_stage(StageSlot::MonteCarlo);
        let mut fa = bank.for_stage(StageSlot::FactorAnalysis);
        let mc_draws: Vec<u64> = (0..8).map(|_| mc.next_f64().to_bits()).collect();
        let fa_draws: Vec<u64> = (0..8).map(|_| fa.next_f64().to_bits()).collect();
        assert_ne!(mc_draws, fa_draws);
    }

    #[test]
    fn unit_draws_stay_in_range() {
        let mut rng = StageRng::new(7, 0);
        for _ in 0..1_000 {
            let x = rng.next_f64();
            assert!((0.0..1.0).contains(&x));
            assert!(rng.index_below(5) < 5);
        }
    }

    #[test]
    fn normal_with_zero_spread_returns_mean() {
        let mut rng = StageRng::new(7, 0);
        for _ in 0..50 {
            assert_eq!(rng.normal(3.5, 0.0), 3.5);
        }
    }
}
