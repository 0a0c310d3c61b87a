use std::collections::BTreeMap;

use serde::Serialize;

use super::distribution::Distribution;
use super::error::TrialFlag;
use super::random::RandomSource;
use super::schedule::TrialSchedule;
use super::tax::{IncomeTotals, TaxTable, TaxYear, tax_liability};
use super::types::{Holding, InvestmentType, Scenario, TaxStatus, Taxability};

/// Result of a partial sale: cash raised and the basis that left with it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sale {
    pub proceeds: f64,
    pub basis_released: f64,
}

impl Sale {
    pub fn gain(&self) -> f64 {
        self.proceeds - self.basis_released
    }
}

impl Holding {
    /// Sell up to `amount`; basis leaves in proportion to value sold.
    pub fn sell(&mut self, amount: f64) -> Sale {
        if amount <= 0.0 || self.value <= 0.0 {
            return Sale {
                proceeds: 0.0,
                basis_released: 0.0,
            };
        }
        let proceeds = amount.min(self.value);
        let basis_released = self.cost_basis * (proceeds / self.value);
        self.value -= proceeds;
        self.cost_basis -= basis_released;
        if self.value <= 1e-9 {
            self.value = 0.0;
            self.cost_basis = 0.0;
        }
        Sale {
            proceeds,
            basis_released,
        }
    }

    pub fn buy(&mut self, amount: f64) {
        if amount > 0.0 {
            self.value += amount;
            self.cost_basis += amount;
        }
    }
}

/// Cash flows recorded while a year runs. Reported, never read back by later years.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearFlows {
    pub income: f64,
    pub tax_due: f64,
    pub mandatory_expenses: f64,
    pub mandatory_shortfall: f64,
    pub discretionary_requested: f64,
    pub discretionary_paid: f64,
    pub rmd: f64,
    pub roth_converted: f64,
    pub pre_tax_contributions: f64,
    pub after_tax_contributions: f64,
    pub invested: f64,
    pub rebalance_turnover: f64,
    /// Net change in total assets from the growth stage, yield included.
    pub growth: f64,
}

/// Snapshot of one trial at the end of one simulated year.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct YearState {
    pub year: i32,
    /// 0 for the pre-simulation baseline, 1 for the first simulated year.
    pub index: u32,
    pub owner_age: u32,
    pub spouse_age: Option<u32>,
    pub owner_alive: bool,
    pub spouse_alive: bool,
    pub holdings: Vec<Holding>,
    pub totals: IncomeTotals,
    pub inflation_rate: f64,
    pub tax_year: TaxYear,
    /// Carried income/expense amounts before survivor split, keyed by event.
    pub event_amounts: BTreeMap<String, f64>,
    pub prior_pre_tax_value: f64,
    /// Amount invested into each holding this year, keyed by holding name.
    pub contributions: BTreeMap<String, f64>,
    pub flows: YearFlows,
    pub goal_met: bool,
}

impl YearState {
    pub fn baseline(env: &TrialEnv<'_>) -> Self {
        let scenario = env.scenario;
        let year = scenario.start_year - 1;
        let mut state = Self {
            year,
            index: 0,
            owner_age: 0,
            spouse_age: None,
            owner_alive: true,
            spouse_alive: false,
            holdings: scenario.holdings.clone(),
            totals: IncomeTotals::default(),
            inflation_rate: 0.0,
            tax_year: TaxYear::baseline(
                env.table,
                scenario.state.as_deref(),
                scenario.contribution_limits,
            ),
            event_amounts: BTreeMap::new(),
            prior_pre_tax_value: 0.0,
            contributions: BTreeMap::new(),
            flows: YearFlows::default(),
            goal_met: false,
        };
        state.set_demographics(env);
        state.goal_met = state.total_assets() >= scenario.financial_goal;
        state
    }

    /// Fresh state for the following year. Holdings are deep copies; running
    /// totals restart at zero and last year's tax bill becomes due.
    pub fn roll_forward(&self, env: &TrialEnv<'_>) -> Self {
        let tax_due = tax_liability(&self.totals, &self.tax_year, env.table).total();
        let mut next = Self {
            year: self.year + 1,
            index: self.index + 1,
            owner_age: 0,
            spouse_age: None,
            owner_alive: true,
            spouse_alive: false,
            holdings: self.holdings.clone(),
            totals: IncomeTotals::default(),
            inflation_rate: 0.0,
            tax_year: self.tax_year.clone(),
            event_amounts: self.event_amounts.clone(),
            prior_pre_tax_value: self.bucket_value(TaxStatus::PreTax),
            contributions: BTreeMap::new(),
            flows: YearFlows {
                tax_due,
                ..YearFlows::default()
            },
            goal_met: false,
        };
        next.set_demographics(env);
        next
    }

    fn set_demographics(&mut self, env: &TrialEnv<'_>) {
        let scenario = env.scenario;
        self.owner_age = (self.year - scenario.birth_year).max(0) as u32;
        self.owner_alive = self.owner_age as f64 <= env.lifespans.owner;
        self.spouse_age = scenario
            .spouse_birth_year
            .map(|birth| (self.year - birth).max(0) as u32);
        self.spouse_alive = match (self.spouse_age, env.lifespans.spouse) {
            (Some(age), Some(limit)) => age as f64 <= limit,
            (Some(_), None) => true,
            _ => false,
        };
    }

    pub fn anyone_alive(&self) -> bool {
        self.owner_alive || self.spouse_alive
    }

    pub fn holding_index(&self, name: &str) -> Option<usize> {
        self.holdings.iter().position(|h| h.name == name)
    }

    pub fn total_assets(&self) -> f64 {
        self.holdings.iter().map(|h| h.value).sum()
    }

    pub fn bucket_value(&self, status: TaxStatus) -> f64 {
        self.holdings
            .iter()
            .filter(|h| h.tax_status == status)
            .map(|h| h.value)
            .sum()
    }

    pub fn is_early(&self, table: &TaxTable) -> bool {
        self.owner_age < table.early_withdrawal_age
    }

    /// Holding of `investment_type` in `status`, created empty when missing.
    pub fn find_or_create(&mut self, investment_type: &str, status: TaxStatus) -> usize {
        if let Some(idx) = self
            .holdings
            .iter()
            .position(|h| h.investment_type == investment_type && h.tax_status == status)
        {
            return idx;
        }
        self.holdings.push(Holding {
            name: format!("{investment_type} ({})", status.label()),
            investment_type: investment_type.to_string(),
            value: 0.0,
            cost_basis: 0.0,
            tax_status: status,
            contribution_cap: None,
        });
        self.holdings.len() - 1
    }

    /// Sell from holding `idx` into the cash holding, booking gains and
    /// retirement-account income on the year's totals.
    pub fn liquidate(
        &mut self,
        idx: usize,
        cash_idx: usize,
        amount: f64,
        env: &TrialEnv<'_>,
    ) -> f64 {
        if idx == cash_idx {
            return 0.0;
        }
        let early = self.is_early(env.table);
        let taxable = env.is_taxable(&self.holdings[idx]);
        let status = self.holdings[idx].tax_status;
        let sale = self.holdings[idx].sell(amount);
        match status {
            TaxStatus::NonRetirement if taxable => self.totals.capital_gains += sale.gain(),
            TaxStatus::PreTax => {
                self.totals.ordinary_income += sale.proceeds;
                if early {
                    self.totals.early_withdrawals += sale.proceeds;
                }
            }
            TaxStatus::AfterTax if early => self.totals.early_withdrawals += sale.proceeds,
            _ => {}
        }
        self.holdings[cash_idx].value += sale.proceeds;
        self.holdings[cash_idx].cost_basis += sale.proceeds;
        sale.proceeds
    }
}

/// Per-trial sampled lifespans, in years of age.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lifespans {
    pub owner: f64,
    pub spouse: Option<f64>,
}

/// Read-only inputs shared by every stage of one trial.
pub struct TrialEnv<'a> {
    pub scenario: &'a Scenario,
    pub table: &'a TaxTable,
    pub schedule: &'a TrialSchedule,
    pub lifespans: Lifespans,
}

impl TrialEnv<'_> {
    pub fn investment_type(&self, holding: &Holding) -> Option<&InvestmentType> {
        self.scenario.investment_type(&holding.investment_type)
    }

    pub fn is_taxable(&self, holding: &Holding) -> bool {
        self.investment_type(holding)
            .is_some_and(|t| t.taxability == Taxability::Taxable)
    }

    pub fn cash_index(&self, state: &YearState) -> Option<usize> {
        state.holding_index(&self.scenario.cash_holding)
    }
}

/// Mutable per-trial services: the random source and recovered anomalies.
pub struct TrialContext<'r> {
    pub rng: &'r mut dyn RandomSource,
    pub flags: Vec<TrialFlag>,
}

impl<'r> TrialContext<'r> {
    pub fn new(rng: &'r mut dyn RandomSource) -> Self {
        Self {
            rng,
            flags: Vec::new(),
        }
    }

    /// Sample, substituting a zero effect for distributions we cannot read.
    pub fn sample(&mut self, distribution: &Distribution, context: &str) -> f64 {
        match distribution.sample(&mut *self.rng) {
            Some(v) => v,
            None => {
                self.flag(TrialFlag::UnknownDistribution {
                    context: context.to_string(),
                });
                0.0
            }
        }
    }

    pub fn flag(&mut self, flag: TrialFlag) {
        if !self.flags.contains(&flag) {
            self.flags.push(flag);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn holding(value: f64, basis: f64) -> Holding {
        Holding {
            name: "S&P".to_string(),
            investment_type: "S&P".to_string(),
            value,
            cost_basis: basis,
            tax_status: TaxStatus::NonRetirement,
            contribution_cap: None,
        }
    }

    #[test]
    fn partial_sale_releases_proportional_basis() {
        let mut h = holding(1_000.0, 400.0);
        let sale = h.sell(250.0);
        assert!((sale.proceeds - 250.0).abs() < 1e-9);
        assert!((sale.basis_released - 100.0).abs() < 1e-9);
        assert!((sale.gain() - 150.0).abs() < 1e-9);
        assert!((h.value - 750.0).abs() < 1e-9);
        assert!((h.cost_basis - 300.0).abs() < 1e-9);
    }

    #[test]
    fn oversized_sale_is_clamped_and_clears_position() {
        let mut h = holding(100.0, 150.0);
        let sale = h.sell(500.0);
        assert!((sale.proceeds - 100.0).abs() < 1e-9);
        assert!(sale.gain() < 0.0);
        assert_eq!(h.value, 0.0);
        assert_eq!(h.cost_basis, 0.0);
    }

    #[test]
    fn buy_raises_value_and_basis() {
        let mut h = holding(100.0, 50.0);
        h.buy(25.0);
        h.buy(-10.0);
        assert!((h.value - 125.0).abs() < 1e-9);
        assert!((h.cost_basis - 75.0).abs() < 1e-9);
    }
}
