use serde::{Deserialize, Serialize};

use super::random::RandomSource;

/// Scalar distribution used for returns, inflation, start years, durations
/// and annual changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum Distribution {
    Fixed {
        value: f64,
    },
    Normal {
        mean: f64,
        #[serde(alias = "std_dev", alias = "sd")]
        std_dev: f64,
    },
    Uniform {
        lower: f64,
        upper: f64,
    },
    /// Any tag this build does not understand. Sampling it yields nothing.
    #[serde(other)]
    Unknown,
}

impl Distribution {
    pub fn fixed(value: f64) -> Self {
        Distribution::Fixed { value }
    }

    /// `None` only for [`Distribution::Unknown`]; callers decide the fallback.
    pub fn sample(&self, rng: &mut dyn RandomSource) -> Option<f64> {
        match *self {
            Distribution::Fixed { value } => Some(value),
            Distribution::Normal { mean, std_dev } => Some(rng.normal(mean, std_dev)),
            Distribution::Uniform { lower, upper } => {
                if upper <= lower {
                    Some(lower)
                } else {
                    Some(lower + (upper - lower) * rng.uniform())
                }
            }
            Distribution::Unknown => None,
        }
    }

    pub fn is_deterministic(&self) -> bool {
        match *self {
            Distribution::Fixed { .. } => true,
            Distribution::Normal { std_dev, .. } => std_dev <= 0.0,
            Distribution::Uniform { lower, upper } => upper <= lower,
            Distribution::Unknown => true,
        }
    }
}

/// Whether a sampled change is an absolute amount or a fractional rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum ChangeMode {
    Amount,
    #[default]
    Percent,
}

/// A distribution tagged with how its sample composes with a base value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeSpec {
    #[serde(default)]
    pub mode: ChangeMode,
    pub distribution: Distribution,
}

impl ChangeSpec {
    pub fn percent(distribution: Distribution) -> Self {
        Self {
            mode: ChangeMode::Percent,
            distribution,
        }
    }

    pub fn amount(distribution: Distribution) -> Self {
        Self {
            mode: ChangeMode::Amount,
            distribution,
        }
    }

    pub fn none() -> Self {
        Self::amount(Distribution::fixed(0.0))
    }

    /// Percent compounds multiplicatively, amount adds absolutely.
    pub fn apply(&self, base: f64, sample: f64) -> f64 {
        match self.mode {
            ChangeMode::Amount => base + sample,
            ChangeMode::Percent => base * (1.0 + sample),
        }
    }

    /// The increment a sample produces on `base`, used for income yields.
    pub fn increment(&self, base: f64, sample: f64) -> f64 {
        self.apply(base, sample) - base
    }
}
