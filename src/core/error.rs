use thiserror::Error;

/// Problems that make a whole run meaningless. Detected before any trial starts.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum SimulationError {
    #[error("cash holding `{0}` is not present in the scenario")]
    MissingCashHolding(String),

    #[error("event `{event}` references unknown event `{reference}`")]
    UnknownEvent { event: String, reference: String },

    #[error("relative start years form a cycle: {}", .0.join(" -> "))]
    ScheduleCycle(Vec<String>),

    #[error("invalid scenario field `{field}`: {reason}")]
    InvalidScenario { field: String, reason: String },

    #[error("invalid tax table: {0}")]
    InvalidTaxTable(String),
}

impl SimulationError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        SimulationError::InvalidScenario {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Why a single trial was excluded from the statistics.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TrialError {
    #[error("allocation for `{event}` has no positive weight to normalise")]
    EmptyAllocation { event: String },

    #[error("non-finite value in holding `{holding}` during year {year}")]
    NonFinite { holding: String, year: i32 },
}

/// Recoverable anomaly: the trial kept going with a corrected value.
#[derive(Debug, Clone, PartialEq)]
pub enum TrialFlag {
    AllocationNormalized { event: String, total_pct: f64 },
    UnknownDistribution { context: String },
}
