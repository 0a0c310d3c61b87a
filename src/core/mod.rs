pub mod distribution;
pub mod engine;
pub mod error;
pub mod exploration;
pub mod random;
pub mod schedule;
pub mod stages;
pub mod state;
pub mod tax;
pub mod trial;
pub mod types;

#[cfg(test)]
mod fixtures;

pub use distribution::{ChangeMode, ChangeSpec, Distribution};
pub use engine::{RunOptions, RunOutput, run_trials, simulate};
pub use error::{SimulationError, TrialError, TrialFlag};
pub use exploration::{ExplorationPoint, ExplorationResult, ExploreParameter, explore};
pub use random::{RandomSource, RngFactory, SimRng};
pub use state::{YearFlows, YearState};
pub use tax::{TaxTable, TaxYear};
pub use trial::{TrialOutcome, TrialResult, run_trial, run_year};
pub use types::{
    AggregateReport, Allocation, AllocationMode, EventKind, EventSeries, Holding, RelativeStart,
    Scenario, StartSpec, TaxStatus, YearPercentiles,
};
