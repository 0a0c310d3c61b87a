use super::{EPS, normalize_weights, resolve_allocation};
use crate::core::error::TrialError;
use crate::core::state::{TrialContext, TrialEnv, YearState};
use crate::core::types::{EventKind, InvestEvent, TaxStatus};

struct Target {
    idx: usize,
    status: TaxStatus,
    pct: f64,
    amount: f64,
    /// Headroom under the holding's own cap for the rest of the year.
    room: f64,
}

/// Sweep cash above the ceiling into holdings per each active invest event.
pub fn apply(
    mut state: YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
) -> Result<YearState, TrialError> {
    let Some(cash_idx) = env.cash_index(&state) else {
        return Ok(state);
    };
    for (idx, series) in env.scenario.events.iter().enumerate() {
        let EventKind::Invest(event) = &series.kind else {
            continue;
        };
        if env.schedule.is_active(idx, state.year) {
            invest_excess(&mut state, env, ctx, cash_idx, &series.name, event)?;
        }
    }
    Ok(state)
}

fn invest_excess(
    state: &mut YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
    cash_idx: usize,
    name: &str,
    event: &InvestEvent,
) -> Result<(), TrialError> {
    let ceiling = event.max_cash.unwrap_or(env.scenario.max_cash);
    let excess = (state.holdings[cash_idx].value - ceiling).max(0.0);
    if excess <= EPS {
        return Ok(());
    }

    let allocation = resolve_allocation(&event.allocation, state.owner_age);
    let mut targets: Vec<Target> = Vec::new();
    for (bucket, weights) in &allocation {
        for (holding, pct) in weights {
            let Some(idx) = resolve_target(state, env, *bucket, holding) else {
                continue;
            };
            if idx == cash_idx {
                continue;
            }
            let target = &state.holdings[idx];
            let room = match target.contribution_cap {
                Some(cap) => {
                    let used = state.contributions.get(&target.name).copied().unwrap_or(0.0);
                    (cap - used).max(0.0)
                }
                None => f64::INFINITY,
            };
            targets.push(Target {
                idx,
                status: target.tax_status,
                pct: *pct,
                amount: 0.0,
                room,
            });
        }
    }
    normalize_weights(targets.iter_mut().map(|t| &mut t.pct), name, ctx)?;

    let mut overflow = 0.0;
    for target in targets.iter_mut() {
        let wanted = excess * target.pct / 100.0;
        target.amount = wanted.min(target.room);
        overflow += wanted - target.amount;
    }
    let pre_tax_room = (state.tax_year.pre_tax_limit - state.flows.pre_tax_contributions).max(0.0);
    let after_tax_room =
        (state.tax_year.after_tax_limit - state.flows.after_tax_contributions).max(0.0);
    overflow += cap_bucket(&mut targets, TaxStatus::PreTax, pre_tax_room);
    overflow += cap_bucket(&mut targets, TaxStatus::AfterTax, after_tax_room);
    spill(&mut targets, overflow);

    let mut used = 0.0;
    for target in &targets {
        if target.amount <= 0.0 {
            continue;
        }
        let holding = &mut state.holdings[target.idx];
        holding.buy(target.amount);
        *state.contributions.entry(holding.name.clone()).or_insert(0.0) += target.amount;
        used += target.amount;
        match target.status {
            TaxStatus::PreTax => state.flows.pre_tax_contributions += target.amount,
            TaxStatus::AfterTax => state.flows.after_tax_contributions += target.amount,
            _ => {}
        }
    }
    state.holdings[cash_idx].sell(used);
    state.flows.invested += used;
    Ok(())
}

/// A named holding, or the in-kind holding `"<type> (<bucket>)"` created on
/// first use.
fn resolve_target(
    state: &mut YearState,
    env: &TrialEnv<'_>,
    bucket: TaxStatus,
    name: &str,
) -> Option<usize> {
    if let Some(idx) = state.holding_index(name) {
        return Some(idx);
    }
    let kind = env
        .scenario
        .investment_types
        .iter()
        .find(|t| name == format!("{} ({})", t.name, bucket.label()))?;
    Some(state.find_or_create(&kind.name, bucket))
}

/// Scale a bucket down to `room`, returning the amount cut.
fn cap_bucket(targets: &mut [Target], status: TaxStatus, room: f64) -> f64 {
    let assigned: f64 = targets
        .iter()
        .filter(|t| t.status == status)
        .map(|t| t.amount)
        .sum();
    if assigned <= room {
        return 0.0;
    }
    let scale = room / assigned;
    for target in targets.iter_mut().filter(|t| t.status == status) {
        target.amount *= scale;
    }
    assigned - room
}

/// Hand `overflow` to non-retirement targets with cap room left, by weight.
/// Whatever no target can take stays in cash.
fn spill(targets: &mut [Target], mut overflow: f64) {
    // Each pass either places everything or fills at least one target.
    for _ in 0..=targets.len() {
        if overflow <= EPS {
            return;
        }
        let open_pct: f64 = targets.iter().filter(|t| has_room(t)).map(|t| t.pct).sum();
        if open_pct <= 0.0 {
            return;
        }
        let mut placed = 0.0;
        for target in targets.iter_mut().filter(|t| has_room(t)) {
            let share = (overflow * target.pct / open_pct).min(target.room - target.amount);
            target.amount += share;
            placed += share;
        }
        overflow -= placed;
    }
}

fn has_room(target: &Target) -> bool {
    target.status == TaxStatus::NonRetirement && target.room - target.amount > EPS
}
