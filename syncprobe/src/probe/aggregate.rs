use std::collections::BTreeMap;

use super::iteration::RecordSnapshot;
use super::phase::PhaseKind;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IterationTiming {
    pub id: u64,
    pub from_start: f64,
    pub from_completion: f64,
}

impl IterationTiming {
    /// Seconds from action start and action completion to observation, or
    /// `None` while any of the three stamps is missing.
    pub fn from_record(record: &RecordSnapshot, phase: PhaseKind) -> Option<Self> {
        let stamps = phase.stamps();
        let started = record.get(stamps.started)?;
        let completed = record.get(stamps.completed)?;
        let observed = record.get(stamps.observed)?;
        Some(Self {
            id: record.id,
            from_start: (observed - started).as_seconds_f64(),
            from_completion: (observed - completed).as_seconds_f64(),
        })
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct PhaseTotals {
    from_start: f64,
    from_completion: f64,
}

#[derive(Debug, Default)]
pub struct Aggregator {
    totals: BTreeMap<PhaseKind, PhaseTotals>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, phase: PhaseKind, timing: &IterationTiming) {
        let totals = self.totals.entry(phase).or_default();
        totals.from_start += timing.from_start;
        totals.from_completion += timing.from_completion;
    }

    pub fn average_from_start(&self, phase: PhaseKind, iterations: usize) -> Option<f64> {
        self.average(phase, iterations, |totals| totals.from_start)
    }

    pub fn average_from_completion(&self, phase: PhaseKind, iterations: usize) -> Option<f64> {
        self.average(phase, iterations, |totals| totals.from_completion)
    }

    fn average(
        &self,
        phase: PhaseKind,
        iterations: usize,
        pick: impl Fn(&PhaseTotals) -> f64,
    ) -> Option<f64> {
        if iterations == 0 {
            return None;
        }
        let totals = self.totals.get(&phase)?;
        Some(round2(pick(totals) / iterations as f64))
    }

    /// Summary lines for every phase that recorded timings, in phase order.
    pub fn summary_lines(&self, iterations: usize) -> Vec<String> {
        let mut lines = Vec::new();
        for phase in self.totals.keys() {
            let (Some(start), Some(completion)) = (
                self.average_from_start(*phase, iterations),
                self.average_from_completion(*phase, iterations),
            ) else {
                continue;
            };
            lines.push(format!(
                "Average {} from start of {}: {start:.2}s",
                phase.summary_subject(),
                phase.action_noun()
            ));
            lines.push(format!(
                "Average {} from {} complete: {completion:.2}s",
                phase.summary_subject(),
                phase.action_noun()
            ));
        }
        lines
    }
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
