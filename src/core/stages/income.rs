use super::{evolve_flow, survivor_share};
use crate::core::state::{TrialContext, TrialEnv, YearState};
use crate::core::types::EventKind;

/// Pay every active income event into cash and book it on the running totals.
pub fn apply(mut state: YearState, env: &TrialEnv<'_>, ctx: &mut TrialContext<'_>) -> YearState {
    let Some(cash_idx) = env.cash_index(&state) else {
        return state;
    };

    for (idx, event) in env.scenario.events.iter().enumerate() {
        let EventKind::Income(income) = &event.kind else {
            continue;
        };
        if !env.schedule.is_active(idx, state.year) {
            continue;
        }

        // The household amount keeps evolving even when nobody is left to receive it.
        let household = evolve_flow(&mut state, &event.name, &income.flow, ctx);
        let amount = household * survivor_share(&state, env, &income.flow);
        if amount <= 0.0 {
            continue;
        }

        let cash = &mut state.holdings[cash_idx];
        cash.value += amount;
        cash.cost_basis += amount;
        state.flows.income += amount;
        if !income.employer_pre_tax {
            state.totals.ordinary_income += amount;
        }
        if income.social_security {
            state.totals.social_security_income += amount;
        }
    }
    state
}
