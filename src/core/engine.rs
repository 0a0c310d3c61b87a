use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use rayon::prelude::*;
use tracing::{debug, info, warn};

use super::error::SimulationError;
use super::random::RngFactory;
use super::schedule::EventGraph;
use super::tax::TaxTable;
use super::trial::{TrialOutcome, TrialResult, run_trial};
use super::types::{AggregateReport, Scenario, YearPercentiles};

/// Knobs for one Monte Carlo run.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Base seed; `None` draws every trial from OS entropy.
    pub seed: Option<u64>,
    /// Worker threads. Defaults to the available parallelism.
    pub workers: Option<usize>,
    /// Wall-clock budget. Trials still running when it expires are dropped.
    pub deadline: Option<Duration>,
    pub max_trials: Option<u32>,
    /// Keep every trial's year-by-year states in the output.
    pub keep_trials: bool,
    pub yearly_stats: bool,
    /// External stop signal, shared with whoever started the run.
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            seed: None,
            workers: None,
            deadline: None,
            max_trials: None,
            keep_trials: false,
            yearly_stats: true,
            cancel: None,
        }
    }
}

impl RunOptions {
    pub fn seeded(seed: u64) -> Self {
        Self {
            seed: Some(seed),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub report: AggregateReport,
    /// Empty unless `RunOptions::keep_trials` was set.
    pub trials: Vec<TrialResult>,
}

/// Run `num_trials` independent trials and aggregate them.
pub fn run_trials(
    scenario: &Scenario,
    table: &TaxTable,
    num_trials: u32,
    num_years: u32,
    options: &RunOptions,
) -> Result<AggregateReport, SimulationError> {
    simulate(scenario, table, num_trials, num_years, options).map(|out| out.report)
}

/// Like [`run_trials`], also handing back the trials themselves when asked.
pub fn simulate(
    scenario: &Scenario,
    table: &TaxTable,
    num_trials: u32,
    num_years: u32,
    options: &RunOptions,
) -> Result<RunOutput, SimulationError> {
    scenario.validate()?;
    table.validate()?;
    let graph = EventGraph::build(scenario)?;

    let requested = num_trials.min(options.max_trials.unwrap_or(u32::MAX));
    let factory = RngFactory::from_seed(options.seed);
    let workers = options.workers.unwrap_or_else(default_workers).max(1);
    info!(
        scenario = %scenario.name,
        trials = requested,
        years = num_years,
        workers,
        seeded = options.seed.is_some(),
        "starting monte carlo run"
    );

    let started = Instant::now();
    let stop = options.cancel.clone().unwrap_or_default();
    let deadline = options.deadline.map(|d| started + d);
    let should_stop = || {
        if stop.load(Ordering::Relaxed) {
            return true;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            stop.store(true, Ordering::Relaxed);
            return true;
        }
        false
    };

    let run_one = |index: u32| {
        if should_stop() {
            return TrialOutcome::Abandoned;
        }
        let mut rng = factory.for_trial(index);
        run_trial(scenario, table, &graph, num_years, index, &mut rng, &should_stop)
    };

    let outcomes: Vec<TrialOutcome> =
        match rayon::ThreadPoolBuilder::new().num_threads(workers).build() {
            Ok(pool) => pool.install(|| (0..requested).into_par_iter().map(run_one).collect()),
            Err(err) => {
                warn!(error = %err, "could not build worker pool, running trials sequentially");
                (0..requested).map(run_one).collect()
            }
        };

    let output = aggregate(requested, num_years, outcomes, options);
    info!(
        completed = output.report.completed_trials,
        success_rate = output.report.success_rate,
        errored = output.report.errored_trials,
        cancelled = output.report.cancelled,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "monte carlo run finished"
    );
    Ok(output)
}

fn default_workers() -> usize {
    std::thread::available_parallelism().map_or(1, |n| n.get())
}

fn aggregate(
    requested: u32,
    num_years: u32,
    outcomes: Vec<TrialOutcome>,
    options: &RunOptions,
) -> RunOutput {
    let mut completed: Vec<TrialResult> = Vec::with_capacity(outcomes.len());
    let mut errored = 0_u32;
    let mut abandoned = 0_u32;
    for (index, outcome) in outcomes.into_iter().enumerate() {
        match outcome {
            TrialOutcome::Completed(result) => {
                if !result.flags.is_empty() {
                    warn!(
                        trial = index,
                        flags = ?result.flags,
                        "trial completed with corrected inputs"
                    );
                }
                debug!(
                    trial = index,
                    success = result.success,
                    final_net_worth = result.final_net_worth,
                    "trial completed"
                );
                completed.push(result);
            }
            TrialOutcome::Errored(err) => {
                warn!(trial = index, error = %err, "trial excluded from statistics");
                errored += 1;
            }
            TrialOutcome::Abandoned => abandoned += 1,
        }
    }

    let successful = completed.iter().filter(|t| t.success).count() as u32;
    let flagged = completed.iter().filter(|t| !t.flags.is_empty()).count() as u32;
    let count = completed.len() as u32;

    let mut finals: Vec<(f64, u32)> = completed
        .iter()
        .map(|t| (t.final_net_worth, t.index))
        .collect();
    finals.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
    let finals: Vec<f64> = finals.into_iter().map(|(v, _)| v).collect();

    let yearly = if options.yearly_stats {
        yearly_percentiles(&completed, num_years)
    } else {
        Vec::new()
    };

    let report = AggregateReport {
        requested_trials: requested,
        completed_trials: count,
        successful_trials: successful,
        success_rate: if count == 0 {
            0.0
        } else {
            successful as f64 / count as f64
        },
        flagged_trials: flagged,
        errored_trials: errored,
        min_final_net_worth: finals.first().copied().unwrap_or(0.0),
        p10_final_net_worth: percentile(&finals, 10.0),
        median_final_net_worth: percentile(&finals, 50.0),
        p90_final_net_worth: percentile(&finals, 90.0),
        max_final_net_worth: finals.last().copied().unwrap_or(0.0),
        yearly,
        cancelled: abandoned > 0,
    };

    RunOutput {
        report,
        trials: if options.keep_trials {
            completed
        } else {
            Vec::new()
        },
    }
}

fn yearly_percentiles(trials: &[TrialResult], num_years: u32) -> Vec<YearPercentiles> {
    let Some(first) = trials.first() else {
        return Vec::new();
    };
    let mut out = Vec::with_capacity(num_years as usize);
    for (idx, template) in first.years.iter().enumerate() {
        let mut totals: Vec<f64> = Vec::with_capacity(trials.len());
        let mut met = 0_u32;
        for trial in trials {
            if let Some(year) = trial.years.get(idx) {
                totals.push(year.total_assets());
                if year.goal_met {
                    met += 1;
                }
            }
        }
        totals.sort_by(|a, b| a.total_cmp(b));
        out.push(YearPercentiles {
            year: template.year,
            success_probability: met as f64 / trials.len() as f64,
            min_total_assets: totals.first().copied().unwrap_or(0.0),
            p10_total_assets: percentile(&totals, 10.0),
            median_total_assets: percentile(&totals, 50.0),
            p90_total_assets: percentile(&totals, 90.0),
            max_total_assets: totals.last().copied().unwrap_or(0.0),
        });
    }
    out
}

/// Linear-interpolated percentile of already sorted values.
fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }

    let n = sorted.len();
    if n == 1 {
        return sorted[0];
    }

    let rank = (p / 100.0) * (n as f64 - 1.0);
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;

    if lower == upper {
        sorted[lower]
    } else {
        let w = rank - lower as f64;
        sorted[lower] * (1.0 - w) + sorted[upper] * w
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::distribution::{ChangeSpec, Distribution};
    use crate::core::fixtures::{always, assert_approx, holding, scenario};
    use crate::core::types::{
        Allocation, AllocationMode, CashFlowEvent, EventKind, ExpenseEvent, IncomeEvent,
        InvestEvent, RebalanceEvent, RelativeStart, StartSpec, TaxStatus,
    };
    use proptest::prelude::{prop_assert, proptest};

    fn volatile_scenario() -> Scenario {
        let mut s = scenario();
        s.inflation = Distribution::Normal {
            mean: 0.025,
            std_dev: 0.01,
        };
        s.holdings[0].value = 20_000.0;
        s.holdings
            .push(holding("b", "S&P", 500_000.0, 300_000.0, TaxStatus::NonRetirement));
        for kind in s.investment_types.iter_mut().filter(|k| k.name == "S&P") {
            kind.annual_return = ChangeSpec::percent(Distribution::Normal {
                mean: 0.06,
                std_dev: 0.18,
            });
        }
        s
    }

    #[test]
    fn percentile_interpolates_between_ranks() {
        let values = [1.0, 2.0, 3.0, 4.0];
        assert_approx(percentile(&values, 50.0), 2.5);
        assert_approx(percentile(&values, 0.0), 1.0);
        assert_approx(percentile(&values, 100.0), 4.0);
        assert_approx(percentile(&[7.0], 90.0), 7.0);
        assert_approx(percentile(&[], 50.0), 0.0);
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let s = volatile_scenario();
        let table = TaxTable::reference();
        let a = run_trials(&s, &table, 64, 30, &RunOptions::seeded(42)).unwrap();
        let b = run_trials(&s, &table, 64, 30, &RunOptions::seeded(42)).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.completed_trials, 64);
        assert_eq!(a.yearly.len(), 30);
        assert_eq!(a.yearly[0].year, 2025);
        assert!(a.min_final_net_worth <= a.median_final_net_worth);
        assert!(a.median_final_net_worth <= a.max_final_net_worth);
    }

    #[test]
    fn worker_count_does_not_change_seeded_results() {
        let s = volatile_scenario();
        let table = TaxTable::reference();
        let one = RunOptions {
            workers: Some(1),
            ..RunOptions::seeded(7)
        };
        let four = RunOptions {
            workers: Some(4),
            ..RunOptions::seeded(7)
        };
        assert_eq!(
            run_trials(&s, &table, 32, 10, &one).unwrap(),
            run_trials(&s, &table, 32, 10, &four).unwrap()
        );
    }

    #[test]
    fn missing_cash_holding_aborts_the_run() {
        let mut s = scenario();
        s.cash_holding = "nowhere".to_string();
        let err = run_trials(&s, &TaxTable::reference(), 10, 5, &RunOptions::seeded(1));
        assert_eq!(err, Err(SimulationError::MissingCashHolding("nowhere".into())));
    }

    #[test]
    fn circular_start_years_abort_the_run() {
        let mut s = scenario();
        let kind = EventKind::Invest(InvestEvent {
            allocation: AllocationMode::Fixed {
                allocation: Allocation::new(),
            },
            max_cash: None,
        });
        let mut a = always("a", kind.clone());
        a.start = StartSpec::Relative(RelativeStart::SameYearAs {
            event: "b".to_string(),
        });
        let mut b = always("b", kind);
        b.start = StartSpec::Relative(RelativeStart::SameYearAs {
            event: "a".to_string(),
        });
        s.events = vec![a, b];
        let err = run_trials(&s, &TaxTable::reference(), 10, 5, &RunOptions::seeded(1));
        assert!(matches!(err, Err(SimulationError::ScheduleCycle(_))));
    }

    #[test]
    fn errored_trials_are_counted_but_not_aggregated() {
        let mut s = scenario();
        s.holdings[0].value = 10_000.0;
        s.holdings
            .push(holding("b", "S&P", 0.0, 0.0, TaxStatus::NonRetirement));
        let mut allocation = Allocation::new();
        allocation
            .entry(TaxStatus::NonRetirement)
            .or_default()
            .insert("b".to_string(), 0.0);
        s.events.push(always(
            "invest",
            EventKind::Invest(InvestEvent {
                allocation: AllocationMode::Fixed { allocation },
                max_cash: None,
            }),
        ));
        let report = run_trials(&s, &TaxTable::reference(), 5, 3, &RunOptions::seeded(3)).unwrap();
        assert_eq!(report.errored_trials, 5);
        assert_eq!(report.completed_trials, 0);
        assert_eq!(report.success_rate, 0.0);
        assert!(report.yearly.is_empty());
    }

    #[test]
    fn cap_and_cancel_limit_the_work() {
        let s = volatile_scenario();
        let table = TaxTable::reference();
        let capped = RunOptions {
            max_trials: Some(3),
            keep_trials: true,
            ..RunOptions::seeded(5)
        };
        let out = simulate(&s, &table, 100, 4, &capped).unwrap();
        assert_eq!(out.report.requested_trials, 3);
        assert_eq!(out.trials.len(), 3);
        assert_eq!(out.trials[0].years.len(), 4);

        let cancelled = RunOptions {
            cancel: Some(Arc::new(AtomicBool::new(true))),
            ..RunOptions::seeded(5)
        };
        let report = run_trials(&s, &table, 10, 4, &cancelled).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.completed_trials, 0);
    }

    #[test]
    fn deterministic_plan_succeeds_every_time() {
        let mut s = scenario();
        s.holdings[0].value = 1_000.0;
        s.financial_goal = 500.0;
        let report =
            run_trials(&s, &TaxTable::reference(), 20, 10, &RunOptions::default()).unwrap();
        assert_eq!(report.success_rate, 1.0);
        assert!(report.yearly.iter().all(|y| y.success_probability == 1.0));
        assert_approx(report.median_final_net_worth, 1_000.0);
    }

    #[test]
    fn invest_into_a_not_yet_existing_in_kind_holding_completes() {
        let mut s = scenario();
        s.holdings[0].value = 50_000.0;
        s.max_cash = 5_000.0;
        let mut allocation = Allocation::new();
        allocation
            .entry(TaxStatus::AfterTax)
            .or_default()
            .insert("S&P (after-tax)".to_string(), 100.0);
        s.events.push(always(
            "invest",
            EventKind::Invest(InvestEvent {
                allocation: AllocationMode::Fixed { allocation },
                max_cash: None,
            }),
        ));
        let options = RunOptions {
            keep_trials: true,
            ..RunOptions::seeded(4)
        };
        let out = simulate(&s, &TaxTable::reference(), 10, 3, &options).unwrap();
        assert_eq!(out.report.errored_trials, 0);
        assert_eq!(out.report.completed_trials, 10);
        let first = &out.trials[0].years[0];
        assert_approx(first.flows.after_tax_contributions, 7_000.0);
        assert_approx(first.holdings[0].value, 43_000.0);
    }

    /// Every moving part at once: salary, rent, a discretionary trip, a
    /// pre-tax account with Roth conversions, capped invest and rebalance.
    fn busy_scenario() -> Scenario {
        let mut s = volatile_scenario();
        s.max_cash = 15_000.0;
        s.financial_goal = 100_000.0;
        s.holdings
            .push(holding("bonds", "bonds", 80_000.0, 70_000.0, TaxStatus::NonRetirement));
        s.holdings
            .push(holding("401k", "S&P", 200_000.0, 0.0, TaxStatus::PreTax));
        s.holdings[1].contribution_cap = Some(20_000.0);
        s.roth_optimizer.enabled = true;
        for kind in s.investment_types.iter_mut().filter(|k| k.name == "bonds") {
            kind.income = ChangeSpec::percent(Distribution::fixed(0.03));
            kind.expense_ratio = 0.002;
        }
        let flow = |amount: f64| CashFlowEvent {
            initial_amount: amount,
            annual_change: ChangeSpec::percent(Distribution::Uniform {
                lower: 0.0,
                upper: 0.05,
            }),
            inflation_adjusted: true,
            user_fraction: None,
        };
        s.events.push(always(
            "salary",
            EventKind::Income(IncomeEvent {
                flow: flow(90_000.0),
                social_security: false,
                employer_pre_tax: false,
            }),
        ));
        s.events.push(always(
            "rent",
            EventKind::Expense(ExpenseEvent {
                flow: flow(40_000.0),
                discretionary: false,
            }),
        ));
        s.events.push(always(
            "travel",
            EventKind::Expense(ExpenseEvent {
                flow: flow(15_000.0),
                discretionary: true,
            }),
        ));
        let mut invest = Allocation::new();
        invest.insert(
            TaxStatus::NonRetirement,
            [("b".to_string(), 50.0), ("bonds".to_string(), 30.0)].into(),
        );
        invest.insert(TaxStatus::PreTax, [("401k".to_string(), 20.0)].into());
        s.events.push(always(
            "invest",
            EventKind::Invest(InvestEvent {
                allocation: AllocationMode::Fixed { allocation: invest },
                max_cash: None,
            }),
        ));
        let mut rebalance = Allocation::new();
        rebalance.insert(
            TaxStatus::NonRetirement,
            [("b".to_string(), 60.0), ("bonds".to_string(), 40.0)].into(),
        );
        s.events.push(always(
            "rebalance",
            EventKind::Rebalance(RebalanceEvent {
                allocation: AllocationMode::Fixed {
                    allocation: rebalance,
                },
                domains: vec![TaxStatus::NonRetirement],
            }),
        ));
        s
    }

    proptest! {
        #[test]
        fn each_year_conserves_value(seed in 0u64..1_000) {
            let s = busy_scenario();
            let options = RunOptions {
                keep_trials: true,
                ..RunOptions::seeded(seed)
            };
            let out = simulate(&s, &TaxTable::reference(), 2, 15, &options).unwrap();
            let opening: f64 = s.holdings.iter().map(|h| h.value).sum();
            for trial in &out.trials {
                let mut start = opening;
                for year in &trial.years {
                    let f = &year.flows;
                    let mandatory_paid = f.mandatory_expenses + f.tax_due - f.mandatory_shortfall;
                    let expected =
                        start + f.income + f.growth - mandatory_paid - f.discretionary_paid;
                    let end = year.total_assets();
                    prop_assert!(
                        (end - expected).abs() <= 1e-6 * start.max(1.0),
                        "year {}: expected {expected}, got {end}",
                        year.year
                    );
                    prop_assert!(year.holdings.iter().all(|h| h.value >= 0.0));
                    if let Some(cap) = s.holdings[1].contribution_cap {
                        let into_b = year.contributions.get("b").copied().unwrap_or(0.0);
                        prop_assert!(into_b <= cap + 1e-6);
                    }
                    prop_assert!(f.pre_tax_contributions <= year.tax_year.pre_tax_limit + 1e-6);
                    start = end;
                }
            }
        }
    }
}
