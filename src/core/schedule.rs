use std::collections::BTreeMap;

use super::error::SimulationError;
use super::state::TrialContext;
use super::types::{RelativeStart, Scenario, StartSpec};

/// Longest duration a sampled event may have, in years.
pub const MAX_DURATION: u32 = 1_000;

/// Concrete years an event covers in one trial: `start <= year < start + duration`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventWindow {
    pub start: i32,
    pub duration: u32,
}

impl EventWindow {
    pub fn contains(&self, year: i32) -> bool {
        year >= self.start && year < self.end()
    }

    /// First year after the event stops.
    pub fn end(&self) -> i32 {
        self.start.saturating_add(self.duration.min(MAX_DURATION) as i32)
    }
}

/// Event windows for one trial, indexed like `Scenario::events`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrialSchedule {
    windows: Vec<EventWindow>,
}

impl TrialSchedule {
    pub fn from_windows(windows: Vec<EventWindow>) -> Self {
        Self { windows }
    }

    pub fn window(&self, event_index: usize) -> Option<EventWindow> {
        self.windows.get(event_index).copied()
    }

    pub fn is_active(&self, event_index: usize, year: i32) -> bool {
        self.window(event_index).is_some_and(|w| w.contains(year))
    }
}

/// Dependency order of relative start years, computed once per run.
#[derive(Debug, Clone, PartialEq)]
pub struct EventGraph {
    order: Vec<usize>,
    references: Vec<Option<usize>>,
}

#[derive(Clone, Copy, PartialEq)]
enum Mark {
    Unvisited,
    OnStack,
    Done,
}

impl EventGraph {
    pub fn build(scenario: &Scenario) -> Result<Self, SimulationError> {
        let index: BTreeMap<&str, usize> = scenario
            .events
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.as_str(), i))
            .collect();

        let mut references = Vec::with_capacity(scenario.events.len());
        for event in &scenario.events {
            let reference = match event.start.reference() {
                Some(name) => Some(*index.get(name).ok_or_else(|| {
                    SimulationError::UnknownEvent {
                        event: event.name.clone(),
                        reference: name.to_string(),
                    }
                })?),
                None => None,
            };
            references.push(reference);
        }

        // Every event has at most one reference, so each walk is a chain.
        let mut marks = vec![Mark::Unvisited; references.len()];
        let mut order = Vec::with_capacity(references.len());
        for root in 0..references.len() {
            let mut chain = Vec::new();
            let mut cursor = Some(root);
            while let Some(node) = cursor {
                match marks[node] {
                    Mark::Done => break,
                    Mark::OnStack => {
                        let from = chain.iter().position(|n| *n == node).unwrap_or(0);
                        let mut cycle: Vec<String> = chain[from..]
                            .iter()
                            .map(|n: &usize| scenario.events[*n].name.clone())
                            .collect();
                        cycle.push(scenario.events[node].name.clone());
                        return Err(SimulationError::ScheduleCycle(cycle));
                    }
                    Mark::Unvisited => {
                        marks[node] = Mark::OnStack;
                        chain.push(node);
                        cursor = references[node];
                    }
                }
            }
            for node in chain.into_iter().rev() {
                marks[node] = Mark::Done;
                order.push(node);
            }
        }

        Ok(Self { order, references })
    }

    /// Sample start years and durations in dependency order.
    pub fn sample(&self, scenario: &Scenario, ctx: &mut TrialContext<'_>) -> TrialSchedule {
        let mut windows = vec![
            EventWindow {
                start: scenario.start_year,
                duration: 0,
            };
            scenario.events.len()
        ];

        for &idx in &self.order {
            let event = &scenario.events[idx];
            let start = match (&event.start, self.references[idx]) {
                (StartSpec::Relative(RelativeStart::SameYearAs { .. }), Some(r)) => {
                    windows[r].start
                }
                (StartSpec::Relative(RelativeStart::YearAfter { .. }), Some(r)) => windows[r].end(),
                (StartSpec::Sampled(dist), _) => {
                    let context = format!("{} start", event.name);
                    ctx.sample(dist, &context).round() as i32
                }
                (StartSpec::Relative(_), None) => scenario.start_year,
            };
            let context = format!("{} duration", event.name);
            let duration = ctx
                .sample(&event.duration, &context)
                .round()
                .clamp(0.0, MAX_DURATION as f64) as u32;
            windows[idx] = EventWindow { start, duration };
        }

        TrialSchedule::from_windows(windows)
    }
}
