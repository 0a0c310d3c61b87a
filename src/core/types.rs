use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::distribution::{ChangeSpec, Distribution};
use super::error::SimulationError;

#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaxStatus {
    #[serde(alias = "nonRetirement", alias = "non_retirement")]
    NonRetirement,
    #[serde(alias = "preTax", alias = "pre_tax")]
    PreTax,
    #[serde(alias = "afterTax", alias = "after_tax")]
    AfterTax,
    #[serde(alias = "taxExempt", alias = "tax_exempt")]
    TaxExempt,
}

impl TaxStatus {
    pub fn label(self) -> &'static str {
        match self {
            TaxStatus::NonRetirement => "non-retirement",
            TaxStatus::PreTax => "pre-tax",
            TaxStatus::AfterTax => "after-tax",
            TaxStatus::TaxExempt => "tax-exempt",
        }
    }

    pub fn is_retirement(self) -> bool {
        matches!(self, TaxStatus::PreTax | TaxStatus::AfterTax)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum Taxability {
    #[default]
    Taxable,
    #[serde(alias = "taxExempt", alias = "tax_exempt")]
    TaxExempt,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestmentType {
    pub name: String,
    #[serde(default)]
    pub taxability: Taxability,
    #[serde(default)]
    pub expense_ratio: f64,
    #[serde(rename = "return")]
    pub annual_return: ChangeSpec,
    #[serde(default = "ChangeSpec::none")]
    pub income: ChangeSpec,
}

/// One position. `name` is unique within a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Holding {
    pub name: String,
    pub investment_type: String,
    pub value: f64,
    #[serde(alias = "purchasePrice")]
    pub cost_basis: f64,
    #[serde(default = "default_tax_status")]
    pub tax_status: TaxStatus,
    #[serde(default)]
    pub contribution_cap: Option<f64>,
}

fn default_tax_status() -> TaxStatus {
    TaxStatus::NonRetirement
}

/// Percent targets keyed by bucket, then holding name.
pub type Allocation = BTreeMap<TaxStatus, BTreeMap<String, f64>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum AllocationMode {
    Fixed {
        allocation: Allocation,
    },
    #[serde(rename_all = "camelCase")]
    GlidePath {
        start_age: u32,
        end_age: u32,
        initial: Allocation,
        target: Allocation,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CashFlowEvent {
    pub initial_amount: f64,
    #[serde(default = "ChangeSpec::none")]
    pub annual_change: ChangeSpec,
    #[serde(default)]
    pub inflation_adjusted: bool,
    /// Owner's share in percent; the spouse holds the rest.
    #[serde(default)]
    pub user_fraction: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomeEvent {
    #[serde(flatten)]
    pub flow: CashFlowEvent,
    #[serde(default)]
    pub social_security: bool,
    /// Employer money routed into a pre-tax plan: taxed on withdrawal, not receipt.
    #[serde(default)]
    pub employer_pre_tax: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpenseEvent {
    #[serde(flatten)]
    pub flow: CashFlowEvent,
    #[serde(default)]
    pub discretionary: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvestEvent {
    pub allocation: AllocationMode,
    #[serde(default)]
    pub max_cash: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RebalanceEvent {
    pub allocation: AllocationMode,
    #[serde(default = "default_domains")]
    pub domains: Vec<TaxStatus>,
}

fn default_domains() -> Vec<TaxStatus> {
    vec![TaxStatus::NonRetirement]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Income(IncomeEvent),
    Expense(ExpenseEvent),
    Invest(InvestEvent),
    Rebalance(RebalanceEvent),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelativeStart {
    SameYearAs { event: String },
    YearAfter { event: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartSpec {
    Relative(RelativeStart),
    Sampled(Distribution),
}

impl StartSpec {
    pub fn reference(&self) -> Option<&str> {
        match self {
            StartSpec::Relative(RelativeStart::SameYearAs { event })
            | StartSpec::Relative(RelativeStart::YearAfter { event }) => Some(event),
            StartSpec::Sampled(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSeries {
    pub name: String,
    pub start: StartSpec,
    pub duration: Distribution,
    pub kind: EventKind,
}

/// Ranked holding names. Missing holdings are appended in encounter order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderedStrategy(pub Vec<String>);

impl OrderedStrategy {
    /// Indices of `holdings` in strategy order, restricted to `eligible`.
    pub fn order(&self, holdings: &[Holding], eligible: impl Fn(&Holding) -> bool) -> Vec<usize> {
        let mut picked = Vec::with_capacity(holdings.len());
        for name in &self.0 {
            if let Some(idx) = holdings.iter().position(|h| &h.name == name) {
                if eligible(&holdings[idx]) && !picked.contains(&idx) {
                    picked.push(idx);
                }
            }
        }
        for (idx, holding) in holdings.iter().enumerate() {
            if eligible(holding) && !picked.contains(&idx) {
                picked.push(idx);
            }
        }
        picked
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RothOptimizer {
    pub enabled: bool,
    #[serde(default)]
    pub start_year: Option<i32>,
    #[serde(default)]
    pub end_year: Option<i32>,
}

impl RothOptimizer {
    pub fn active_in(&self, year: i32) -> bool {
        self.enabled
            && self.start_year.is_none_or(|start| year >= start)
            && self.end_year.is_none_or(|end| year <= end)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionLimits {
    pub pre_tax: f64,
    pub after_tax: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scenario {
    #[serde(default)]
    pub name: String,
    /// Calendar year of the first simulated year.
    pub start_year: i32,
    pub birth_year: i32,
    #[serde(default)]
    pub spouse_birth_year: Option<i32>,
    pub life_expectancy: Distribution,
    #[serde(default)]
    pub spouse_life_expectancy: Option<Distribution>,
    #[serde(default)]
    pub financial_goal: f64,
    #[serde(default)]
    pub max_cash: f64,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default = "zero_inflation")]
    pub inflation: Distribution,
    pub investment_types: Vec<InvestmentType>,
    pub holdings: Vec<Holding>,
    pub cash_holding: String,
    #[serde(default)]
    pub events: Vec<EventSeries>,
    #[serde(default)]
    pub expense_withdrawal_strategy: OrderedStrategy,
    #[serde(default)]
    pub rmd_strategy: OrderedStrategy,
    #[serde(default)]
    pub roth_conversion_strategy: OrderedStrategy,
    #[serde(default)]
    pub roth_optimizer: RothOptimizer,
    #[serde(default)]
    pub contribution_limits: Option<ContributionLimits>,
}

fn zero_inflation() -> Distribution {
    Distribution::fixed(0.0)
}

impl Scenario {
    pub fn is_couple(&self) -> bool {
        self.spouse_birth_year.is_some()
    }

    pub fn investment_type(&self, name: &str) -> Option<&InvestmentType> {
        self.investment_types.iter().find(|t| t.name == name)
    }

    pub fn event(&self, name: &str) -> Option<&EventSeries> {
        self.events.iter().find(|e| e.name == name)
    }

    /// Structural checks that make every trial meaningless when they fail.
    pub fn validate(&self) -> Result<(), SimulationError> {
        if !self.holdings.iter().any(|h| h.name == self.cash_holding) {
            return Err(SimulationError::MissingCashHolding(
                self.cash_holding.clone(),
            ));
        }

        let mut names = BTreeSet::new();
        for holding in &self.holdings {
            if !names.insert(holding.name.as_str()) {
                return Err(SimulationError::invalid(
                    "holdings",
                    format!("duplicate holding name `{}`", holding.name),
                ));
            }
            if self.investment_type(&holding.investment_type).is_none() {
                return Err(SimulationError::invalid(
                    "holdings",
                    format!(
                        "holding `{}` uses unknown investment type `{}`",
                        holding.name, holding.investment_type
                    ),
                ));
            }
            if !holding.value.is_finite() || holding.value < 0.0 {
                return Err(SimulationError::invalid(
                    "holdings",
                    format!("holding `{}` must have a finite value >= 0", holding.name),
                ));
            }
        }

        let mut event_names = BTreeSet::new();
        for event in &self.events {
            if !event_names.insert(event.name.as_str()) {
                return Err(SimulationError::invalid(
                    "events",
                    format!("duplicate event name `{}`", event.name),
                ));
            }
            // A misspelled relative start would otherwise parse as an unknown distribution.
            if matches!(event.start, StartSpec::Sampled(Distribution::Unknown)) {
                return Err(SimulationError::invalid(
                    "events",
                    format!("event `{}` has an unrecognised start", event.name),
                ));
            }
        }

        for (field, strategy) in [
            ("expenseWithdrawalStrategy", &self.expense_withdrawal_strategy),
            ("rmdStrategy", &self.rmd_strategy),
            ("rothConversionStrategy", &self.roth_conversion_strategy),
        ] {
            if let Some(unknown) = strategy.0.iter().find(|n| !names.contains(n.as_str())) {
                return Err(SimulationError::invalid(
                    field,
                    format!("unknown holding `{unknown}`"),
                ));
            }
        }

        for event in &self.events {
            let mode = match &event.kind {
                EventKind::Invest(invest) => &invest.allocation,
                EventKind::Rebalance(rebalance) => &rebalance.allocation,
                EventKind::Income(_) | EventKind::Expense(_) => continue,
            };
            let allocations = match mode {
                AllocationMode::Fixed { allocation } => vec![allocation],
                AllocationMode::GlidePath { initial, target, .. } => vec![initial, target],
            };
            for allocation in allocations {
                self.validate_allocation(&event.name, allocation)?;
            }
        }

        if self.spouse_life_expectancy.is_some() && self.spouse_birth_year.is_none() {
            return Err(SimulationError::invalid(
                "spouseLifeExpectancy",
                "requires spouseBirthYear",
            ));
        }

        Ok(())
    }

    /// Targets must name a holding, or one the simulation creates on demand
    /// for in-kind transfers.
    fn validate_allocation(
        &self,
        event: &str,
        allocation: &Allocation,
    ) -> Result<(), SimulationError> {
        for (status, targets) in allocation {
            for (name, pct) in targets {
                let derived = self
                    .investment_types
                    .iter()
                    .any(|t| *name == format!("{} ({})", t.name, status.label()));
                if let Some(holding) = self.holdings.iter().find(|h| h.name == *name) {
                    if holding.tax_status != *status {
                        return Err(SimulationError::invalid(
                            "events",
                            format!(
                                "event `{event}` lists `{name}` under {} but it is {}",
                                status.label(),
                                holding.tax_status.label()
                            ),
                        ));
                    }
                } else if !derived {
                    return Err(SimulationError::invalid(
                        "events",
                        format!("event `{event}` allocates to unknown holding `{name}`"),
                    ));
                }
                if !pct.is_finite() || *pct < 0.0 {
                    return Err(SimulationError::invalid(
                        "events",
                        format!("event `{event}` has a negative or non-finite weight for `{name}`"),
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Success rate and percentile spread for one year across trials.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct YearPercentiles {
    pub year: i32,
    pub success_probability: f64,
    pub min_total_assets: f64,
    pub p10_total_assets: f64,
    pub median_total_assets: f64,
    pub p90_total_assets: f64,
    pub max_total_assets: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AggregateReport {
    pub requested_trials: u32,
    pub completed_trials: u32,
    pub successful_trials: u32,
    pub success_rate: f64,
    pub flagged_trials: u32,
    pub errored_trials: u32,
    pub min_final_net_worth: f64,
    pub p10_final_net_worth: f64,
    pub median_final_net_worth: f64,
    pub p90_final_net_worth: f64,
    pub max_final_net_worth: f64,
    pub yearly: Vec<YearPercentiles>,
    pub cancelled: bool,
}
