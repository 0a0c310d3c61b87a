use crate::core::state::{TrialContext, TrialEnv, YearState};

/// Sample this year's inflation and index last year's tax rules by it.
pub fn apply(mut state: YearState, env: &TrialEnv<'_>, ctx: &mut TrialContext<'_>) -> YearState {
    let rate = ctx.sample(&env.scenario.inflation, "inflation");
    state.inflation_rate = rate;
    state.tax_year = state.tax_year.indexed(rate);
    state
}
