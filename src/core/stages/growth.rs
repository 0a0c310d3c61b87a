use crate::core::state::{TrialContext, TrialEnv, YearState};
use crate::core::types::TaxStatus;

/// Apply each holding's yield, expense drag and market return.
///
/// Yield is measured on the value at the start of the stage. Retirement
/// accounts keep their yield; everything else pays it out to cash.
pub fn apply(mut state: YearState, env: &TrialEnv<'_>, ctx: &mut TrialContext<'_>) -> YearState {
    let cash_idx = env.cash_index(&state);
    let before = state.total_assets();
    let mut paid_out = 0.0;

    for idx in 0..state.holdings.len() {
        let Some(kind) = env.investment_type(&state.holdings[idx]) else {
            continue;
        };
        let taxable = env.is_taxable(&state.holdings[idx]);
        let name = state.holdings[idx].name.clone();

        let yield_sample = ctx.sample(&kind.income.distribution, &format!("{name} income"));
        let return_sample = ctx.sample(&kind.annual_return.distribution, &format!("{name} return"));

        let holding = &mut state.holdings[idx];
        let start = holding.value;
        let income = kind.income.increment(start, yield_sample).max(0.0);

        let mut value = start * (1.0 - kind.expense_ratio).max(0.0);
        value = kind.annual_return.apply(value, return_sample).max(0.0);
        holding.value = value;

        let reinvest = Some(idx) == cash_idx || holding.tax_status.is_retirement();
        if reinvest {
            holding.buy(income);
        } else {
            paid_out += income;
        }

        if taxable && holding.tax_status == TaxStatus::NonRetirement {
            state.totals.ordinary_income += income;
        }
    }

    if let Some(cash_idx) = cash_idx {
        state.holdings[cash_idx].buy(paid_out);
    }
    state.flows.growth = state.total_assets() - before;
    state
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::distribution::{ChangeSpec, Distribution};
    use crate::core::fixtures::{Fixture, assert_approx, holding, scenario};
    use crate::core::random::ScriptedRng;
    use crate::core::types::Taxability;

    fn fixture_with(holdings: Vec<crate::core::types::Holding>) -> Fixture {
        let mut s = scenario();
        for kind in s.investment_types.iter_mut() {
            if kind.name == "S&P" {
                kind.annual_return = ChangeSpec::percent(Distribution::fixed(0.10));
                kind.income = ChangeSpec::percent(Distribution::fixed(0.02));
                kind.expense_ratio = 0.01;
            }
            if kind.name == "cash" {
                kind.income = ChangeSpec::percent(Distribution::fixed(0.03));
            }
        }
        s.holdings.extend(holdings);
        Fixture::new(s)
    }

    #[test]
    fn taxable_brokerage_pays_yield_to_cash_as_ordinary_income() {
        let fx = fixture_with(vec![holding("b", "S&P", 1_000.0, 800.0, TaxStatus::NonRetirement)]);
        let mut rng = ScriptedRng::new(vec![]);
        let mut ctx = TrialContext::new(&mut rng);

        let year = apply(fx.first_year(), &fx.env(), &mut ctx);
        assert_approx(year.holdings[1].value, 1_000.0 * 0.99 * 1.10);
        assert_approx(year.holdings[1].cost_basis, 800.0);
        assert_approx(year.holdings[0].value, 20.0);
        assert_approx(year.totals.ordinary_income, 20.0);
    }

    #[test]
    fn retirement_accounts_reinvest_yield_untaxed() {
        let fx = fixture_with(vec![holding("ira", "S&P", 1_000.0, 0.0, TaxStatus::PreTax)]);
        let mut rng = ScriptedRng::new(vec![]);
        let mut ctx = TrialContext::new(&mut rng);

        let year = apply(fx.first_year(), &fx.env(), &mut ctx);
        assert_approx(year.holdings[1].value, 1_000.0 * 0.99 * 1.10 + 20.0);
        assert_approx(year.holdings[1].cost_basis, 20.0);
        assert_approx(year.holdings[0].value, 0.0);
        assert_approx(year.totals.ordinary_income, 0.0);
    }

    #[test]
    fn cash_compounds_its_own_interest() {
        let mut fx = fixture_with(vec![]);
        fx.scenario.holdings[0].value = 1_000.0;
        let mut rng = ScriptedRng::new(vec![]);
        let mut ctx = TrialContext::new(&mut rng);

        let year = apply(fx.first_year(), &fx.env(), &mut ctx);
        assert_approx(year.holdings[0].value, 1_030.0);
        assert_approx(year.totals.ordinary_income, 30.0);
    }

    #[test]
    fn tax_exempt_yield_reaches_cash_without_tax() {
        let mut fx = fixture_with(vec![holding(
            "muni",
            "S&P",
            1_000.0,
            1_000.0,
            TaxStatus::NonRetirement,
        )]);
        for kind in fx.scenario.investment_types.iter_mut() {
            if kind.name == "S&P" {
                kind.taxability = Taxability::TaxExempt;
            }
        }
        let mut rng = ScriptedRng::new(vec![]);
        let mut ctx = TrialContext::new(&mut rng);

        let year = apply(fx.first_year(), &fx.env(), &mut ctx);
        assert_approx(year.holdings[0].value, 20.0);
        assert_approx(year.totals.ordinary_income, 0.0);
    }

    #[test]
    fn losses_never_drive_value_negative() {
        let mut fx = fixture_with(vec![holding(
            "b",
            "S&P",
            1_000.0,
            1_000.0,
            TaxStatus::NonRetirement,
        )]);
        for kind in fx.scenario.investment_types.iter_mut() {
            if kind.name == "S&P" {
                kind.annual_return = ChangeSpec::amount(Distribution::fixed(-5_000.0));
                kind.income = ChangeSpec::amount(Distribution::fixed(-10.0));
            }
        }
        let mut rng = ScriptedRng::new(vec![]);
        let mut ctx = TrialContext::new(&mut rng);

        let year = apply(fx.first_year(), &fx.env(), &mut ctx);
        assert_approx(year.holdings[1].value, 0.0);
        assert_approx(year.holdings[0].value, 0.0);
    }
}
