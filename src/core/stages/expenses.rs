use super::{EPS, evolve_flow, survivor_share};
use crate::core::state::{TrialContext, TrialEnv, YearState};
use crate::core::types::EventKind;

/// Pay non-discretionary expenses plus last year's tax bill. Whatever cannot be
/// funded is recorded as a shortfall; the year goes on.
pub fn pay_mandatory(
    mut state: YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
) -> YearState {
    let expenses = active_expenses(&mut state, env, ctx, false);
    let required = expenses + state.flows.tax_due;
    state.flows.mandatory_expenses = expenses;

    let paid = match env.cash_index(&state) {
        Some(cash_idx) => spend(&mut state, env, cash_idx, required),
        None => 0.0,
    };
    let shortfall = required - paid;
    state.flows.mandatory_shortfall = if shortfall > EPS { shortfall } else { 0.0 };
    state
}

/// Pay discretionary expenses as far as the financial goal allows.
pub fn pay_discretionary(
    mut state: YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
) -> YearState {
    let requested = active_expenses(&mut state, env, ctx, true);
    state.flows.discretionary_requested = requested;

    let budget = (state.total_assets() - env.scenario.financial_goal).max(0.0);
    let target = requested.min(budget);
    if target <= 0.0 {
        return state;
    }
    if let Some(cash_idx) = env.cash_index(&state) {
        state.flows.discretionary_paid = spend(&mut state, env, cash_idx, target);
    }
    state
}

fn active_expenses(
    state: &mut YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
    discretionary: bool,
) -> f64 {
    let mut total = 0.0;
    for (idx, event) in env.scenario.events.iter().enumerate() {
        let EventKind::Expense(expense) = &event.kind else {
            continue;
        };
        if expense.discretionary != discretionary || !env.schedule.is_active(idx, state.year) {
            continue;
        }
        let household = evolve_flow(state, &event.name, &expense.flow, ctx);
        total += household * survivor_share(state, env, &expense.flow);
    }
    total
}

/// Take `amount` out of cash, topping cash up first by liquidating holdings
/// in withdrawal-strategy order. Returns what was actually paid.
fn spend(state: &mut YearState, env: &TrialEnv<'_>, cash_idx: usize, amount: f64) -> f64 {
    if amount <= 0.0 {
        return 0.0;
    }
    let mut missing = amount - state.holdings[cash_idx].value;
    if missing > EPS {
        let cash_name = env.scenario.cash_holding.as_str();
        let sources = env
            .scenario
            .expense_withdrawal_strategy
            .order(&state.holdings, |h| h.name != cash_name && h.value > 0.0);
        for idx in sources {
            if missing <= EPS {
                break;
            }
            missing -= state.liquidate(idx, cash_idx, missing, env);
        }
    }
    let paid = amount.min(state.holdings[cash_idx].value);
    state.holdings[cash_idx].sell(paid);
    paid
}
