//! Small in-memory scenarios shared by the unit tests.

use super::distribution::{ChangeSpec, Distribution};
use super::schedule::{EventWindow, TrialSchedule};
use super::state::{Lifespans, TrialEnv, YearState};
use super::tax::TaxTable;
use super::types::{EventKind, EventSeries, Holding, InvestmentType, Scenario, StartSpec, TaxStatus};

pub(crate) const EPS: f64 = 1e-6;

pub(crate) fn assert_approx(actual: f64, expected: f64) {
    assert!(
        (actual - expected).abs() <= EPS,
        "expected {expected}, got {actual}"
    );
}

pub(crate) fn flat_type(name: &str) -> InvestmentType {
    InvestmentType {
        name: name.to_string(),
        taxability: Default::default(),
        expense_ratio: 0.0,
        annual_return: ChangeSpec::percent(Distribution::fixed(0.0)),
        income: ChangeSpec::none(),
    }
}

pub(crate) fn holding(
    name: &str,
    kind: &str,
    value: f64,
    basis: f64,
    status: TaxStatus,
) -> Holding {
    Holding {
        name: name.to_string(),
        investment_type: kind.to_string(),
        value,
        cost_basis: basis,
        tax_status: status,
        contribution_cap: None,
    }
}

/// Single owner born 1980, starting in 2025, everything deterministic and flat.
pub(crate) fn scenario() -> Scenario {
    Scenario {
        name: "fixture".to_string(),
        start_year: 2025,
        birth_year: 1980,
        spouse_birth_year: None,
        life_expectancy: Distribution::fixed(90.0),
        spouse_life_expectancy: None,
        financial_goal: 0.0,
        max_cash: 0.0,
        state: None,
        inflation: Distribution::fixed(0.0),
        investment_types: vec![flat_type("cash"), flat_type("S&P"), flat_type("bonds")],
        holdings: vec![holding("cash", "cash", 0.0, 0.0, TaxStatus::NonRetirement)],
        cash_holding: "cash".to_string(),
        events: Vec::new(),
        expense_withdrawal_strategy: Default::default(),
        rmd_strategy: Default::default(),
        roth_conversion_strategy: Default::default(),
        roth_optimizer: Default::default(),
        contribution_limits: None,
    }
}

/// Event active for every year of the fixture horizon.
pub(crate) fn always(name: &str, kind: EventKind) -> EventSeries {
    EventSeries {
        name: name.to_string(),
        start: StartSpec::Sampled(Distribution::fixed(2025.0)),
        duration: Distribution::fixed(100.0),
        kind,
    }
}

/// Owned inputs a `TrialEnv` borrows from.
pub(crate) struct Fixture {
    pub scenario: Scenario,
    pub table: TaxTable,
    pub schedule: TrialSchedule,
    pub lifespans: Lifespans,
}

impl Fixture {
    pub fn new(scenario: Scenario) -> Self {
        let windows = scenario
            .events
            .iter()
            .map(|_| EventWindow {
                start: scenario.start_year,
                duration: 100,
            })
            .collect();
        Self {
            scenario,
            table: TaxTable::reference(),
            schedule: TrialSchedule::from_windows(windows),
            lifespans: Lifespans {
                owner: 90.0,
                spouse: Some(90.0),
            },
        }
    }

    pub fn env(&self) -> TrialEnv<'_> {
        TrialEnv {
            scenario: &self.scenario,
            table: &self.table,
            schedule: &self.schedule,
            lifespans: self.lifespans,
        }
    }

    /// State for the first simulated year, with last year's tax already settled.
    pub fn first_year(&self) -> YearState {
        let env = self.env();
        let mut state = YearState::baseline(&env).roll_forward(&env);
        state.flows.tax_due = 0.0;
        state
    }
}
