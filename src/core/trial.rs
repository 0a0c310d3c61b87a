use serde::Serialize;

use super::error::{TrialError, TrialFlag};
use super::random::RandomSource;
use super::schedule::EventGraph;
use super::stages::{self, EPS};
use super::state::{Lifespans, TrialContext, TrialEnv, YearState};
use super::tax::TaxTable;
use super::types::Scenario;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialResult {
    pub index: u32,
    pub years: Vec<YearState>,
    pub final_net_worth: f64,
    pub success: bool,
    #[serde(skip)]
    pub flags: Vec<TrialFlag>,
}

/// How a single trial ended.
#[derive(Debug)]
pub enum TrialOutcome {
    Completed(TrialResult),
    Errored(TrialError),
    /// Stopped between years; nothing from it may be aggregated.
    Abandoned,
}

/// Run one trial to the horizon. `should_stop` is polled before every year.
pub fn run_trial(
    scenario: &Scenario,
    table: &TaxTable,
    graph: &EventGraph,
    num_years: u32,
    index: u32,
    rng: &mut dyn RandomSource,
    should_stop: &dyn Fn() -> bool,
) -> TrialOutcome {
    let mut ctx = TrialContext::new(rng);
    let lifespans = Lifespans {
        owner: ctx.sample(&scenario.life_expectancy, "life expectancy"),
        spouse: scenario
            .spouse_life_expectancy
            .as_ref()
            .map(|d| ctx.sample(d, "spouse life expectancy")),
    };
    let schedule = graph.sample(scenario, &mut ctx);
    let env = TrialEnv {
        scenario,
        table,
        schedule: &schedule,
        lifespans,
    };

    let baseline = YearState::baseline(&env);
    let mut years: Vec<YearState> = Vec::with_capacity(num_years as usize);
    for _ in 0..num_years {
        if should_stop() {
            return TrialOutcome::Abandoned;
        }
        let previous = years.last().unwrap_or(&baseline);
        let next = previous.roll_forward(&env);
        match run_year(next, &env, &mut ctx) {
            Ok(closed) => years.push(closed),
            Err(err) => return TrialOutcome::Errored(err),
        }
    }

    let (final_net_worth, success) = judge(&baseline, &years);
    TrialOutcome::Completed(TrialResult {
        index,
        years,
        final_net_worth,
        success,
        flags: ctx.flags,
    })
}

/// The nine stages, in order, followed by closing the year.
pub fn run_year(
    state: YearState,
    env: &TrialEnv<'_>,
    ctx: &mut TrialContext<'_>,
) -> Result<YearState, TrialError> {
    let state = stages::preliminaries::apply(state, env, ctx);
    let state = stages::income::apply(state, env, ctx);
    let state = stages::rmd::apply(state, env, ctx);
    let state = stages::growth::apply(state, env, ctx);
    let state = stages::roth::apply(state, env, ctx);
    let state = stages::expenses::pay_mandatory(state, env, ctx);
    let state = stages::expenses::pay_discretionary(state, env, ctx);
    let state = stages::invest::apply(state, env, ctx)?;
    let state = stages::rebalance::apply(state, env, ctx)?;
    close_year(state, env)
}

fn close_year(mut state: YearState, env: &TrialEnv<'_>) -> Result<YearState, TrialError> {
    if let Some(bad) = state
        .holdings
        .iter()
        .find(|h| !h.value.is_finite() || !h.cost_basis.is_finite())
    {
        return Err(TrialError::NonFinite {
            holding: bad.name.clone(),
            year: state.year,
        });
    }
    state.goal_met = state.total_assets() >= env.scenario.financial_goal
        && state.flows.mandatory_shortfall <= EPS;
    Ok(state)
}

/// Net worth and success as of the last year anyone was alive.
fn judge(baseline: &YearState, years: &[YearState]) -> (f64, bool) {
    let Some(last) = years.len().checked_sub(1) else {
        return (baseline.total_assets(), baseline.goal_met);
    };
    let terminal = years.iter().rposition(YearState::anyone_alive).unwrap_or(last);
    let lived = &years[..=terminal];
    let solvent = lived.iter().all(|y| y.flows.mandatory_shortfall <= EPS);
    let end = &years[terminal];
    (end.total_assets(), solvent && end.goal_met)
}
