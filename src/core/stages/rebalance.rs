use super::{EPS, normalize_weights, resolve_allocation};
use crate::core::error::TrialError;
use crate::core::state::{TrialContext, TrialEnv, YearState};
use crate::core::types::{EventKind, Holding, RebalanceEvent, TaxStatus};

/// What one group rebalance did.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RebalanceOutcome {
    pub sold: f64,
    pub bought: f64,
    pub realized_gain: f64,
}

/// Bring `weights` (holding index, percent summing to 100) to target.
///
/// Every sale settles before any purchase so gains are measured against the
/// bases the group started with. Purchases are scaled to the proceeds, which
/// keeps the group total unchanged.
pub fn rebalance_group(
    holdings: &mut [Holding],
    weights: &[(usize, f64)],
    realizes_gains: impl Fn(&Holding) -> bool,
) -> RebalanceOutcome {
    let total: f64 = weights.iter().map(|(idx, _)| holdings[*idx].value).sum();
    let mut outcome = RebalanceOutcome::default();
    if total <= EPS {
        return outcome;
    }

    let mut deficits = Vec::new();
    for &(idx, pct) in weights {
        let target = total * pct / 100.0;
        let holding = &mut holdings[idx];
        let delta = holding.value - target;
        if delta > EPS {
            let sale = holding.sell(delta);
            outcome.sold += sale.proceeds;
            if realizes_gains(holding) {
                outcome.realized_gain += sale.gain();
            }
        } else if delta < -EPS {
            deficits.push((idx, -delta));
        }
    }

    let wanted: f64 = deficits.iter().map(|(_, d)| d).sum();
    if outcome.sold > 0.0 && wanted > 0.0 {
        let scale = outcome.sold / wanted;
        for (idx, deficit) in deficits {
            let amount = deficit * scale;
            holdings[idx].buy(amount);
            outcome.bought += amount;
        }
    }
    outcome
}

pub fn apply(
    mut state: YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
) -> Result<YearState, TrialError> {
    for (idx, series) in env.scenario.events.iter().enumerate() {
        let EventKind::Rebalance(event) = &series.kind else {
            continue;
        };
        if env.schedule.is_active(idx, state.year) {
            rebalance_event(&mut state, env, ctx, &series.name, event)?;
        }
    }
    Ok(state)
}

fn rebalance_event(
    state: &mut YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
    name: &str,
    event: &RebalanceEvent,
) -> Result<(), TrialError> {
    let allocation = resolve_allocation(&event.allocation, state.owner_age);
    let cash_idx = env.cash_index(state);

    for domain in &event.domains {
        let Some(targets) = allocation.get(domain) else {
            continue;
        };
        // Holdings in the bucket without a target are sold down to zero.
        let mut weights: Vec<(usize, f64)> = state
            .holdings
            .iter()
            .enumerate()
            .filter(|(idx, h)| h.tax_status == *domain && Some(*idx) != cash_idx)
            .map(|(idx, h)| (idx, targets.get(&h.name).copied().unwrap_or(0.0)))
            .collect();
        if weights.is_empty() {
            continue;
        }
        normalize_weights(weights.iter_mut().map(|(_, pct)| pct), name, ctx)?;

        let outcome = rebalance_group(&mut state.holdings, &weights, |h| {
            h.tax_status == TaxStatus::NonRetirement && env.is_taxable(h)
        });
        state.totals.capital_gains += outcome.realized_gain;
        state.flows.rebalance_turnover += outcome.sold;
    }
    Ok(())
}
