use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use statrs::distribution::Normal;

/// Per-trial source of randomness. Stages only ever see this trait.
pub trait RandomSource {
    /// Draw from U(0, 1).
    fn uniform(&mut self) -> f64;
    fn normal(&mut self, mean: f64, sd: f64) -> f64;
}

pub struct SimRng {
    inner: StdRng,
}

impl SimRng {
    pub fn seeded(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            inner: StdRng::from_entropy(),
        }
    }
}

impl RandomSource for SimRng {
    fn uniform(&mut self) -> f64 {
        self.inner.gen_range(0.0..1.0)
    }

    fn normal(&mut self, mean: f64, sd: f64) -> f64 {
        if sd.is_nan() || sd <= 0.0 {
            return mean;
        }
        match Normal::new(mean, sd) {
            Ok(dist) => self.inner.sample(dist),
            Err(_) => mean,
        }
    }
}

/// How each trial obtains its generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RngFactory {
    Seeded(u64),
    Entropy,
}

impl RngFactory {
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map_or(RngFactory::Entropy, RngFactory::Seeded)
    }

    pub fn for_trial(self, trial_index: u32) -> SimRng {
        match self {
            RngFactory::Seeded(base) => SimRng::seeded(derive_seed(base, trial_index)),
            RngFactory::Entropy => SimRng::from_entropy(),
        }
    }
}

pub(crate) fn derive_seed(base_seed: u64, trial_index: u32) -> u64 {
    splitmix64(base_seed ^ ((trial_index as u64) << 17) ^ trial_index as u64)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E3779B97F4A7C15);
    let mut z = x;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
    z ^ (z >> 31)
}

/// Deterministic source for tests: replays a fixed list of uniforms and
/// answers every normal draw with its mean.
#[cfg(test)]
pub(crate) struct ScriptedRng {
    pub uniforms: Vec<f64>,
    pub cursor: usize,
}

#[cfg(test)]
impl ScriptedRng {
    pub fn new(uniforms: Vec<f64>) -> Self {
        Self {
            uniforms,
            cursor: 0,
        }
    }
}

#[cfg(test)]
impl RandomSource for ScriptedRng {
    fn uniform(&mut self) -> f64 {
        if self.uniforms.is_empty() {
            return 0.5;
        }
        let v = self.uniforms[self.cursor % self.uniforms.len()];
        self.cursor += 1;
        v
    }

    fn normal(&mut self, mean: f64, _sd: f64) -> f64 {
        mean
    }
}
