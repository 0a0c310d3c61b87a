use super::EPS;
use crate::core::state::{TrialContext, TrialEnv, YearState};
use crate::core::types::TaxStatus;

/// Room left in the current federal bracket. Zero in the open top bracket
/// or when the optimizer is off for this year.
pub fn conversion_headroom(state: &YearState, env: &TrialEnv<'_>) -> f64 {
    if !env.scenario.roth_optimizer.active_in(state.year) {
        return 0.0;
    }
    let taxable = state
        .totals
        .taxable_income(env.table.social_security_taxable_share)
        .max(0.0);
    match state.tax_year.federal.locate(taxable).and_then(|b| b.upper) {
        Some(upper) => (upper - taxable).max(0.0),
        None => 0.0,
    }
}

/// Fill the current bracket by converting pre-tax holdings to after-tax.
pub fn apply(mut state: YearState, env: &TrialEnv<'_>, _ctx: &mut TrialContext<'_>) -> YearState {
    let mut remaining = conversion_headroom(&state, env);
    if remaining <= EPS {
        return state;
    }

    let sources = env.scenario.roth_conversion_strategy.order(&state.holdings, |h| {
        h.tax_status == TaxStatus::PreTax && h.value > 0.0
    });

    let mut converted = 0.0;
    for idx in sources {
        if remaining <= EPS {
            break;
        }
        let investment_type = state.holdings[idx].investment_type.clone();
        let sale = state.holdings[idx].sell(remaining);
        let dest = state.find_or_create(&investment_type, TaxStatus::AfterTax);
        state.holdings[dest].buy(sale.proceeds);
        remaining -= sale.proceeds;
        converted += sale.proceeds;
    }

    state.totals.ordinary_income += converted;
    if state.is_early(env.table) {
        state.totals.early_withdrawals += converted;
    }
    state.flows.roth_converted = converted;
    state
}
