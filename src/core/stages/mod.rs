//! The yearly pipeline. Each stage consumes the year's state and hands back
//! the transformed state; the trial driver decides the order.

pub mod expenses;
pub mod growth;
pub mod income;
pub mod invest;
pub mod preliminaries;
pub mod rebalance;
pub mod rmd;
pub mod roth;

use std::collections::BTreeMap;

use super::error::{TrialError, TrialFlag};
use super::state::{TrialContext, TrialEnv, YearState};
use super::types::{Allocation, AllocationMode, CashFlowEvent};

const PCT_TOLERANCE: f64 = 0.01;
pub(crate) const EPS: f64 = 1e-6;

/// Advance an income/expense amount by one year and remember it.
pub(crate) fn evolve_flow(
    state: &mut YearState,
    event_name: &str,
    flow: &CashFlowEvent,
    ctx: &mut TrialContext<'_>,
) -> f64 {
    let amount = match state.event_amounts.get(event_name) {
        None => flow.initial_amount,
        Some(&previous) => {
            let context = format!("{event_name} annual change");
            let sample = ctx.sample(&flow.annual_change.distribution, &context);
            let mut next = flow.annual_change.apply(previous, sample);
            if flow.inflation_adjusted {
                next *= 1.0 + state.inflation_rate;
            }
            next.max(0.0)
        }
    };
    state.event_amounts.insert(event_name.to_string(), amount);
    amount
}

/// Portion of a household amount still flowing given who is alive.
pub(crate) fn survivor_share(state: &YearState, env: &TrialEnv<'_>, flow: &CashFlowEvent) -> f64 {
    if !env.scenario.is_couple() {
        return if state.owner_alive { 1.0 } else { 0.0 };
    }
    let owner_share = flow.user_fraction.map(|pct| (pct / 100.0).clamp(0.0, 1.0));
    match (state.owner_alive, state.spouse_alive) {
        (true, true) => 1.0,
        (true, false) => owner_share.unwrap_or(1.0),
        (false, true) => owner_share.map_or(1.0, |share| 1.0 - share),
        (false, false) => 0.0,
    }
}

/// Target percentages in force at `age`.
pub(crate) fn resolve_allocation(mode: &AllocationMode, age: u32) -> Allocation {
    match mode {
        AllocationMode::Fixed { allocation } => allocation.clone(),
        AllocationMode::GlidePath {
            start_age,
            end_age,
            initial,
            target,
        } => {
            let t = if end_age <= start_age {
                if age >= *start_age { 1.0 } else { 0.0 }
            } else {
                ((age as f64 - *start_age as f64) / (*end_age - *start_age) as f64).clamp(0.0, 1.0)
            };
            let mut blended = Allocation::new();
            for (bucket, weights) in initial.iter().chain(target.iter()) {
                let entry: &mut BTreeMap<String, f64> = blended.entry(*bucket).or_default();
                for name in weights.keys() {
                    let from = initial.get(bucket).and_then(|w| w.get(name)).copied();
                    let to = target.get(bucket).and_then(|w| w.get(name)).copied();
                    let pct = (1.0 - t) * from.unwrap_or(0.0) + t * to.unwrap_or(0.0);
                    entry.insert(name.clone(), pct);
                }
            }
            blended
        }
    }
}

/// Scale `weights` so they sum to 100, flagging the trial when they did not.
pub(crate) fn normalize_weights<'w>(
    weights: impl Iterator<Item = &'w mut f64>,
    event: &str,
    ctx: &mut TrialContext<'_>,
) -> Result<(), TrialError> {
    let mut weights: Vec<&mut f64> = weights.collect();
    for w in weights.iter_mut() {
        **w = (**w).max(0.0);
    }
    let total: f64 = weights.iter().map(|w| **w).sum();
    if total <= 0.0 {
        return Err(TrialError::EmptyAllocation {
            event: event.to_string(),
        });
    }
    if (total - 100.0).abs() > PCT_TOLERANCE {
        ctx.flag(TrialFlag::AllocationNormalized {
            event: event.to_string(),
            total_pct: total,
        });
    }
    let scale = 100.0 / total;
    for w in weights {
        *w *= scale;
    }
    Ok(())
}
