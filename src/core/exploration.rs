use serde::{Deserialize, Serialize};
use tracing::info;

use super::distribution::Distribution;
use super::engine::{RunOptions, run_trials};
use super::error::SimulationError;
use super::tax::TaxTable;
use super::types::{AggregateReport, EventKind, Scenario, StartSpec};

/// The one scenario input an exploration varies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExploreParameter {
    /// Any non-zero value turns the optimizer on.
    RothOptimizer,
    StartYear { event: String },
    Duration { event: String },
    /// Income and expense events only.
    InitialAmount { event: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorationPoint {
    pub value: f64,
    pub report: AggregateReport,
    pub success_ci_half_width: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExplorationResult {
    pub parameter: ExploreParameter,
    pub points: Vec<ExplorationPoint>,
}

/// Re-run the whole Monte Carlo once per value. Every point uses the same
/// seed so they differ only in the varied input.
pub fn explore(
    scenario: &Scenario,
    table: &TaxTable,
    parameter: &ExploreParameter,
    values: &[f64],
    num_trials: u32,
    num_years: u32,
    options: &RunOptions,
) -> Result<ExplorationResult, SimulationError> {
    validate_parameter(scenario, parameter, values)?;
    info!(parameter = ?parameter, points = values.len(), "starting exploration");

    let mut points = Vec::with_capacity(values.len());
    for &value in values {
        let candidate = with_parameter(scenario, parameter, value);
        let report = run_trials(&candidate, table, num_trials, num_years, options)?;
        let half_width = binomial_ci_half_width(report.success_rate, report.completed_trials);
        points.push(ExplorationPoint {
            value,
            report,
            success_ci_half_width: half_width,
        });
    }

    Ok(ExplorationResult {
        parameter: parameter.clone(),
        points,
    })
}

fn with_parameter(base: &Scenario, parameter: &ExploreParameter, value: f64) -> Scenario {
    let mut scenario = base.clone();
    match parameter {
        ExploreParameter::RothOptimizer => scenario.roth_optimizer.enabled = value != 0.0,
        ExploreParameter::StartYear { event } => {
            if let Some(series) = scenario.events.iter_mut().find(|e| &e.name == event) {
                series.start = StartSpec::Sampled(Distribution::fixed(value.round()));
            }
        }
        ExploreParameter::Duration { event } => {
            if let Some(series) = scenario.events.iter_mut().find(|e| &e.name == event) {
                series.duration = Distribution::fixed(value.round().max(0.0));
            }
        }
        ExploreParameter::InitialAmount { event } => {
            if let Some(series) = scenario.events.iter_mut().find(|e| &e.name == event) {
                match &mut series.kind {
                    EventKind::Income(income) => income.flow.initial_amount = value,
                    EventKind::Expense(expense) => expense.flow.initial_amount = value,
                    EventKind::Invest(_) | EventKind::Rebalance(_) => {}
                }
            }
        }
    }
    scenario
}

fn binomial_ci_half_width(p: f64, n: u32) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    1.96 * (p * (1.0 - p) / n as f64).sqrt()
}

fn validate_parameter(
    scenario: &Scenario,
    parameter: &ExploreParameter,
    values: &[f64],
) -> Result<(), SimulationError> {
    if values.is_empty() {
        return Err(SimulationError::invalid("values", "at least one value is required"));
    }
    if values.iter().any(|v| !v.is_finite()) {
        return Err(SimulationError::invalid("values", "values must be finite"));
    }
    let event = match parameter {
        ExploreParameter::RothOptimizer => return Ok(()),
        ExploreParameter::StartYear { event }
        | ExploreParameter::Duration { event }
        | ExploreParameter::InitialAmount { event } => event,
    };
    let Some(series) = scenario.event(event) else {
        return Err(SimulationError::invalid(
            "parameter.event",
            format!("unknown event `{event}`"),
        ));
    };
    if matches!(parameter, ExploreParameter::InitialAmount { .. })
        && !matches!(series.kind, EventKind::Income(_) | EventKind::Expense(_))
    {
        return Err(SimulationError::invalid(
            "parameter.event",
            format!("event `{event}` has no initial amount"),
        ));
    }
    if matches!(parameter, ExploreParameter::Duration { .. }) && values.iter().any(|v| *v < 0.0) {
        return Err(SimulationError::invalid("values", "durations must be >= 0"));
    }
    Ok(())
}
