use super::EPS;
use crate::core::state::{TrialContext, TrialEnv, YearState};
use crate::core::types::TaxStatus;

/// Required minimum distribution due this year, before clamping to what is left.
pub fn required_amount(state: &YearState, env: &TrialEnv<'_>) -> f64 {
    if state.owner_age < env.table.rmd_start_age || state.prior_pre_tax_value <= 0.0 {
        return 0.0;
    }
    state.prior_pre_tax_value / env.table.rmd_period(state.owner_age)
}

/// Move the year's RMD out of pre-tax holdings in kind, into same-type
/// non-retirement holdings, and tax it as ordinary income.
pub fn apply(mut state: YearState, env: &TrialEnv<'_>, _ctx: &mut TrialContext<'_>) -> YearState {
    let mut remaining = required_amount(&state, env);
    if remaining <= 0.0 {
        return state;
    }

    let sources = env.scenario.rmd_strategy.order(&state.holdings, |h| {
        h.tax_status == TaxStatus::PreTax && h.value > 0.0
    });

    let mut withdrawn = 0.0;
    for idx in sources {
        if remaining <= EPS {
            break;
        }
        let investment_type = state.holdings[idx].investment_type.clone();
        let sale = state.holdings[idx].sell(remaining);
        let dest = state.find_or_create(&investment_type, TaxStatus::NonRetirement);
        state.holdings[dest].buy(sale.proceeds);
        remaining -= sale.proceeds;
        withdrawn += sale.proceeds;
    }

    state.totals.ordinary_income += withdrawn;
    state.flows.rmd = withdrawn;
    state
}
