use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::error::SimulationError;
use super::types::ContributionLimits;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bracket {
    pub lower: f64,
    /// `None` for the open top bracket.
    #[serde(default)]
    pub upper: Option<f64>,
    pub rate: f64,
}

impl Bracket {
    pub fn upper_or_max(&self) -> f64 {
        self.upper.unwrap_or(f64::INFINITY)
    }

    fn contains(&self, income: f64) -> bool {
        income >= self.lower && income < self.upper_or_max()
    }
}

/// Ordered, non-overlapping brackets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BracketTable(pub Vec<Bracket>);

impl BracketTable {
    pub fn validate(&self, label: &str) -> Result<(), SimulationError> {
        let mut previous_upper = None;
        for bracket in &self.0 {
            if let Some(upper) = bracket.upper {
                if upper <= bracket.lower {
                    return Err(SimulationError::InvalidTaxTable(format!(
                        "{label}: bracket upper {upper} must exceed lower {}",
                        bracket.lower
                    )));
                }
            }
            if let Some(prev) = previous_upper {
                if bracket.lower < prev {
                    return Err(SimulationError::InvalidTaxTable(format!(
                        "{label}: brackets overlap at {}",
                        bracket.lower
                    )));
                }
            }
            previous_upper = Some(bracket.upper_or_max());
        }
        Ok(())
    }

    /// Bracket containing `income`; incomes past the table land in the last one.
    pub fn locate(&self, income: f64) -> Option<&Bracket> {
        let income = income.max(0.0);
        self.0
            .iter()
            .find(|b| b.contains(income))
            .or_else(|| self.0.last())
    }

    pub fn tax(&self, income: f64) -> f64 {
        let income = income.max(0.0);
        self.0
            .iter()
            .map(|b| {
                let span = (income.min(b.upper_or_max()) - b.lower).max(0.0);
                span * b.rate
            })
            .sum()
    }

    pub fn indexed(&self, factor: f64) -> Self {
        BracketTable(
            self.0
                .iter()
                .map(|b| Bracket {
                    lower: b.lower * factor,
                    upper: b.upper.map(|u| u * factor),
                    rate: b.rate,
                })
                .collect(),
        )
    }
}

/// Reference snapshot of the tax rules the simulation understands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxTable {
    pub federal: BracketTable,
    #[serde(default)]
    pub state: BTreeMap<String, BracketTable>,
    pub standard_deduction: f64,
    pub capital_gains: BracketTable,
    #[serde(default = "default_ss_share")]
    pub social_security_taxable_share: f64,
    #[serde(default)]
    pub rmd_periods: BTreeMap<u32, f64>,
    #[serde(default = "default_rmd_age")]
    pub rmd_start_age: u32,
    #[serde(default = "default_early_rate")]
    pub early_withdrawal_rate: f64,
    #[serde(default = "default_early_age")]
    pub early_withdrawal_age: u32,
    pub contribution_limits: ContributionLimits,
}

fn default_ss_share() -> f64 {
    0.85
}

fn default_rmd_age() -> u32 {
    74
}

fn default_early_rate() -> f64 {
    0.10
}

fn default_early_age() -> u32 {
    59
}

impl TaxTable {
    pub fn validate(&self) -> Result<(), SimulationError> {
        self.federal.validate("federal")?;
        self.capital_gains.validate("capitalGains")?;
        for (state, table) in &self.state {
            table.validate(state)?;
        }
        if self.federal.0.is_empty() {
            return Err(SimulationError::InvalidTaxTable(
                "federal brackets are empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.social_security_taxable_share) {
            return Err(SimulationError::InvalidTaxTable(
                "socialSecurityTaxableShare must be between 0 and 1".to_string(),
            ));
        }
        if self.rmd_periods.values().any(|p| *p <= 0.0) {
            return Err(SimulationError::InvalidTaxTable(
                "rmd distribution periods must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Distribution period for `age`, linear fallback when the table has no row.
    pub fn rmd_period(&self, age: u32) -> f64 {
        self.rmd_periods
            .get(&age)
            .copied()
            .unwrap_or_else(|| (90.0 - age as f64).max(10.0))
    }

    /// 2024 single-filer federal brackets, NY state brackets and the
    /// uniform lifetime RMD table.
    pub fn reference() -> Self {
        let federal = brackets(&[
            (0.0, Some(11_600.0), 0.10),
            (11_600.0, Some(47_150.0), 0.12),
            (47_150.0, Some(100_525.0), 0.22),
            (100_525.0, Some(191_950.0), 0.24),
            (191_950.0, Some(243_725.0), 0.32),
            (243_725.0, Some(609_350.0), 0.35),
            (609_350.0, None, 0.37),
        ]);
        let capital_gains = brackets(&[
            (0.0, Some(47_025.0), 0.0),
            (47_025.0, Some(518_900.0), 0.15),
            (518_900.0, None, 0.20),
        ]);
        let ny = brackets(&[
            (0.0, Some(8_500.0), 0.04),
            (8_500.0, Some(11_700.0), 0.045),
            (11_700.0, Some(13_900.0), 0.0525),
            (13_900.0, Some(80_650.0), 0.055),
            (80_650.0, Some(215_400.0), 0.06),
            (215_400.0, Some(1_077_550.0), 0.0685),
            (1_077_550.0, Some(5_000_000.0), 0.0965),
            (5_000_000.0, Some(25_000_000.0), 0.103),
            (25_000_000.0, None, 0.109),
        ]);

        const PERIODS: [f64; 46] = [
            27.4, 26.5, 25.6, 24.7, 23.8, 22.9, 22.0, 21.2, 20.3, 19.5, 18.7, 17.9, 17.1, 16.3,
            15.5, 14.8, 14.1, 13.4, 12.7, 12.0, 11.4, 10.8, 10.2, 9.6, 9.1, 8.6, 8.1, 7.6, 7.1,
            6.7, 6.3, 5.9, 5.5, 5.2, 4.9, 4.5, 4.2, 3.9, 3.7, 3.4, 3.1, 2.9, 2.6, 2.4, 2.1, 1.9,
        ];
        let rmd_periods = PERIODS
            .iter()
            .enumerate()
            .map(|(offset, period)| (70 + offset as u32, *period))
            .collect();

        Self {
            federal,
            state: BTreeMap::from([("NY".to_string(), ny)]),
            standard_deduction: 14_600.0,
            capital_gains,
            social_security_taxable_share: default_ss_share(),
            rmd_periods,
            rmd_start_age: default_rmd_age(),
            early_withdrawal_rate: default_early_rate(),
            early_withdrawal_age: default_early_age(),
            contribution_limits: ContributionLimits {
                pre_tax: 23_000.0,
                after_tax: 7_000.0,
            },
        }
    }
}

fn brackets(rows: &[(f64, Option<f64>, f64)]) -> BracketTable {
    BracketTable(
        rows.iter()
            .map(|&(lower, upper, rate)| Bracket { lower, upper, rate })
            .collect(),
    )
}

/// Inflation-indexed rules in force for one simulated year.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxYear {
    pub federal: BracketTable,
    pub state: Option<BracketTable>,
    pub standard_deduction: f64,
    pub capital_gains: BracketTable,
    pub pre_tax_limit: f64,
    pub after_tax_limit: f64,
}

impl TaxYear {
    pub fn baseline(
        table: &TaxTable,
        state: Option<&str>,
        overrides: Option<ContributionLimits>,
    ) -> Self {
        let limits = overrides.unwrap_or(table.contribution_limits);
        Self {
            federal: table.federal.clone(),
            state: state.and_then(|s| table.state.get(s).cloned()),
            standard_deduction: table.standard_deduction,
            capital_gains: table.capital_gains.clone(),
            pre_tax_limit: limits.pre_tax,
            after_tax_limit: limits.after_tax,
        }
    }

    pub fn indexed(&self, inflation_rate: f64) -> Self {
        let factor = 1.0 + inflation_rate;
        Self {
            federal: self.federal.indexed(factor),
            state: self.state.as_ref().map(|s| s.indexed(factor)),
            standard_deduction: self.standard_deduction * factor,
            capital_gains: self.capital_gains.indexed(factor),
            pre_tax_limit: (self.pre_tax_limit * factor).round(),
            after_tax_limit: (self.after_tax_limit * factor).round(),
        }
    }
}

/// Running totals a year's tax bill is computed from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeTotals {
    pub ordinary_income: f64,
    pub social_security_income: f64,
    pub capital_gains: f64,
    pub early_withdrawals: f64,
}

impl IncomeTotals {
    /// Ordinary income with the untaxed share of social security removed.
    pub fn taxable_income(&self, ss_taxable_share: f64) -> f64 {
        self.ordinary_income - (1.0 - ss_taxable_share) * self.social_security_income
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaxBill {
    pub federal: f64,
    pub state: f64,
    pub capital_gains: f64,
    pub early_withdrawal: f64,
}

impl TaxBill {
    pub fn total(&self) -> f64 {
        self.federal + self.state + self.capital_gains + self.early_withdrawal
    }
}

pub fn tax_liability(totals: &IncomeTotals, rules: &TaxYear, table: &TaxTable) -> TaxBill {
    let income = totals.taxable_income(table.social_security_taxable_share);
    let federal_taxable = (income - rules.standard_deduction).max(0.0);
    let federal = rules.federal.tax(federal_taxable);
    let state = rules
        .state
        .as_ref()
        .map_or(0.0, |s| s.tax(income.max(0.0)));

    let gains = totals.capital_gains.max(0.0);
    let gains_rate = rules
        .capital_gains
        .locate(federal_taxable)
        .map_or(0.0, |b| b.rate);

    TaxBill {
        federal,
        state,
        capital_gains: gains * gains_rate,
        early_withdrawal: totals.early_withdrawals.max(0.0) * table.early_withdrawal_rate,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_approx(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() <= 1e-6,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn progressive_tax_sums_each_band() {
        let table = TaxTable::reference();
        // 11,600 at 10% + 8,400 at 12%
        assert_approx(table.federal.tax(20_000.0), 1_160.0 + 1_008.0);
        assert_approx(table.federal.tax(-5.0), 0.0);
    }

    #[test]
    fn locate_finds_bracket_and_clamps_to_top() {
        let table = TaxTable::reference();
        assert_approx(table.federal.locate(50_000.0).unwrap().rate, 0.22);
        assert_approx(table.federal.locate(47_150.0).unwrap().rate, 0.22);
        assert_approx(table.federal.locate(1e9).unwrap().rate, 0.37);
    }

    #[test]
    fn indexing_scales_bounds_and_rounds_limits() {
        let table = TaxTable::reference();
        let base = TaxYear::baseline(&table, Some("NY"), None);
        let next = base.indexed(0.031);
        assert_approx(next.federal.0[0].upper.unwrap(), 11_600.0 * 1.031);
        assert_eq!(next.federal.0.last().unwrap().upper, None);
        assert_approx(next.standard_deduction, 14_600.0 * 1.031);
        assert_approx(next.pre_tax_limit, 23_713.0);
        assert_approx(next.after_tax_limit, 7_217.0);
        assert!(next.state.is_some());
    }

    #[test]
    fn unknown_state_pays_no_state_tax() {
        let table = TaxTable::reference();
        let rules = TaxYear::baseline(&table, Some("ZZ"), None);
        let bill = tax_liability(
            &IncomeTotals {
                ordinary_income: 80_000.0,
                ..IncomeTotals::default()
            },
            &rules,
            &table,
        );
        assert_approx(bill.state, 0.0);
        assert!(bill.federal > 0.0);
    }

    #[test]
    fn liability_combines_all_components() {
        let table = TaxTable::reference();
        let rules = TaxYear::baseline(&table, None, None);
        let totals = IncomeTotals {
            ordinary_income: 74_600.0,
            social_security_income: 0.0,
            capital_gains: 10_000.0,
            early_withdrawals: 5_000.0,
        };
        let bill = tax_liability(&totals, &rules, &table);
        // 60,000 taxable after deduction
        assert_approx(bill.federal, table.federal.tax(60_000.0));
        assert_approx(bill.capital_gains, 1_500.0);
        assert_approx(bill.early_withdrawal, 500.0);
        assert_approx(
            bill.total(),
            bill.federal + bill.capital_gains + bill.early_withdrawal,
        );
    }

    #[test]
    fn social_security_is_only_partly_taxable() {
        let totals = IncomeTotals {
            ordinary_income: 40_000.0,
            social_security_income: 20_000.0,
            ..IncomeTotals::default()
        };
        assert_approx(totals.taxable_income(0.85), 37_000.0);
    }

    #[test]
    fn rmd_period_uses_table_then_fallback() {
        let table = TaxTable::reference();
        assert_approx(table.rmd_period(75), 22.9);
        assert_approx(table.rmd_period(60), 30.0);
        assert_approx(table.rmd_period(200), 10.0);
    }

    #[test]
    fn overlapping_brackets_are_rejected() {
        let bad = brackets(&[(0.0, Some(100.0), 0.1), (50.0, None, 0.2)]);
        assert!(bad.validate("federal").is_err());
        assert!(TaxTable::reference().validate().is_ok());
    }
}
