//! Token budget allocation.
//!
//! All budget arithmetic lives here. [`allocate`] is a pure function of its
//! arguments: integer math only, no clocks, no randomness, no I/O.
//!
//! # Algorithm
//!
//! 1. **Soft shares**: each source gets `ceiling × weight / Σweights`
//!    (rounded down), capped at what it actually has (`estimated_tokens`).
//! 2. **Redistribution**: the unused remainder is split among sources that
//!    still want more, proportionally to their weights, never beyond their
//!    own estimate. Rounding leftovers go one token at a time in priority
//!    order.
//!
//! The sum of grants never exceeds the ceiling. Sources then render
//! themselves within their grant, dropping whole entries (lowest relevance
//! or oldest turn) until they fit.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Weights are expressed in parts per thousand.
pub const WEIGHT_SCALE: u32 = 1000;

/// The five context sources, in priority and render order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSource {
    Setting,
    Facts,
    Backstory,
    Documents,
    History,
}

impl ContextSource {
    pub const ALL: [ContextSource; 5] = [
        ContextSource::Setting,
        ContextSource::Facts,
        ContextSource::Backstory,
        ContextSource::Documents,
        ContextSource::History,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContextSource::Setting => "setting",
            ContextSource::Facts => "facts",
            ContextSource::Backstory => "backstory",
            ContextSource::Documents => "documents",
            ContextSource::History => "history",
        }
    }

    /// Share of the ceiling in parts per thousand. History and documents
    /// carry the most situational signal.
    pub fn default_weight(&self) -> u32 {
        match self {
            ContextSource::Setting => 100,
            ContextSource::Facts => 150,
            ContextSource::Backstory => 150,
            ContextSource::History => 250,
            ContextSource::Documents => 350,
        }
    }
}

impl fmt::Display for ContextSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a source would like to spend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDemand {
    pub source: ContextSource,
    /// Relative weight, normally parts per thousand.
    pub weight: u32,
    /// Tokens the source needs to render everything it has.
    pub estimated_tokens: usize,
}

impl SourceDemand {
    /// A demand carrying the source's default weight.
    pub fn new(source: ContextSource, estimated_tokens: usize) -> Self {
        Self {
            source,
            weight: source.default_weight(),
            estimated_tokens,
        }
    }
}

/// Allocation outcome for one source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceBudget {
    pub source: ContextSource,
    /// Guaranteed by the first pass: the soft share, capped at `max`.
    pub min: usize,
    /// The most the source could use (its estimate).
    pub max: usize,
    /// Tokens granted after redistribution.
    pub granted: usize,
    /// Tokens the rendered section actually costs (≤ `granted`).
    pub actual: usize,
}

/// Per-request budget. Ephemeral, never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextBudget {
    pub ceiling: usize,
    /// Tokens set aside before allocation (wrapper frame, separators,
    /// current message).
    pub reserved: usize,
    pub sources: Vec<SourceBudget>,
}

impl ContextBudget {
    pub fn get(&self, source: ContextSource) -> Option<&SourceBudget> {
        self.sources.iter().find(|s| s.source == source)
    }

    /// Tokens granted to `source`; zero if it made no demand.
    pub fn granted(&self, source: ContextSource) -> usize {
        self.get(source).map_or(0, |s| s.granted)
    }

    pub fn total_granted(&self) -> usize {
        self.sources.iter().map(|s| s.granted).sum()
    }

    pub fn total_actual(&self) -> usize {
        self.sources.iter().map(|s| s.actual).sum()
    }

    /// Record what the rendered section of `source` really cost.
    pub fn record_actual(&mut self, source: ContextSource, tokens: usize) {
        if let Some(entry) = self.sources.iter_mut().find(|s| s.source == source) {
            entry.actual = tokens;
        }
    }
}

/// Partition `ceiling` tokens across `demands`.
///
/// Demands are taken in the order given, which is also the tie-break order
/// for rounding leftovers. Identical arguments always yield an identical
/// budget, and `total_granted() <= ceiling`.
pub fn allocate(ceiling: usize, demands: &[SourceDemand]) -> ContextBudget {
    let total_weight: u128 = demands.iter().map(|d| d.weight as u128).sum();

    // Pass 1: soft shares, capped at what each source has.
    let mins: Vec<usize> = demands
        .iter()
        .map(|d| {
            let soft = if total_weight == 0 {
                0
            } else {
                (ceiling as u128 * d.weight as u128 / total_weight) as usize
            };
            soft.min(d.estimated_tokens)
        })
        .collect();
    let mut grants = mins.clone();

    // Pass 2: hand the unused remainder to sources that still want more.
    let mut leftover = ceiling - grants.iter().sum::<usize>();
    loop {
        let wanting: Vec<usize> = (0..demands.len())
            .filter(|&i| grants[i] < demands[i].estimated_tokens)
            .collect();
        if leftover == 0 || wanting.is_empty() {
            break;
        }

        let weight_sum: u128 = wanting.iter().map(|&i| effective_weight(&demands[i])).sum();
        let mut handed = 0;
        for &i in &wanting {
            let share = (leftover as u128 * effective_weight(&demands[i]) / weight_sum) as usize;
            let add = share.min(demands[i].estimated_tokens - grants[i]);
            grants[i] += add;
            handed += add;
        }

        // Every share rounded down to zero: one token each, priority order.
        if handed == 0 {
            for &i in &wanting {
                if handed == leftover {
                    break;
                }
                grants[i] += 1;
                handed += 1;
            }
        }
        leftover -= handed;
    }

    ContextBudget {
        ceiling,
        reserved: 0,
        sources: demands
            .iter()
            .zip(mins.iter().zip(grants.iter()))
            .map(|(d, (&min, &granted))| SourceBudget {
                source: d.source,
                min,
                max: d.estimated_tokens,
                granted,
                actual: granted,
            })
            .collect(),
    }
}

fn effective_weight(demand: &SourceDemand) -> u128 {
    demand.weight.max(1) as u128
}

// ── Tests ─────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn demands(estimates: [usize; 5]) -> Vec<SourceDemand> {
        ContextSource::ALL
            .iter()
            .zip(estimates)
            .map(|(&source, est)| SourceDemand::new(source, est))
            .collect()
    }

    #[test]
    fn default_weights_sum_to_scale() {
        let sum: u32 = ContextSource::ALL.iter().map(|s| s.default_weight()).sum();
        assert_eq!(sum, WEIGHT_SCALE);
    }

    #[test]
    fn everything_fits_under_a_large_ceiling() {
        let budget = allocate(10_000, &demands([10, 20, 30, 40, 50]));
        for s in &budget.sources {
            assert_eq!(s.granted, s.max);
        }
        assert_eq!(budget.total_granted(), 150);
    }

    #[test]
    fn unused_share_is_redistributed_proportionally() {
        // setting uses 10 of its 100, facts nothing of its 150
        let budget = allocate(1000, &demands([10, 0, 500, 500, 500]));
        assert_eq!(budget.granted(ContextSource::Setting), 10);
        assert_eq!(budget.granted(ContextSource::Facts), 0);
        assert_eq!(budget.granted(ContextSource::Backstory), 198);
        assert_eq!(budget.granted(ContextSource::Documents), 462);
        assert_eq!(budget.granted(ContextSource::History), 330);
        assert_eq!(budget.total_granted(), 1000);
    }

    #[test]
    fn grants_never_exceed_estimates() {
        let budget = allocate(1000, &demands([5, 5, 5, 5, 2000]));
        assert_eq!(budget.granted(ContextSource::History), 980);
        for s in &budget.sources {
            assert!(s.granted <= s.max);
            assert!(s.min <= s.granted);
        }
    }

    #[test]
    fn sum_never_exceeds_ceiling() {
        for ceiling in [0, 1, 3, 7, 99, 101, 997, 4096] {
            let budget = allocate(ceiling, &demands([333, 777, 1234, 5678, 91]));
            assert!(budget.total_granted() <= ceiling, "ceiling {ceiling}");
        }
    }

    #[test]
    fn rounding_leftovers_are_spent_in_priority_order() {
        let budget = allocate(3, &demands([100, 100, 100, 100, 100]));
        assert_eq!(budget.total_granted(), 3);
        // documents earns one token from its soft share (3 × 350 / 1000);
        // the other two go to setting and facts in priority order
        let granted: Vec<usize> = budget.sources.iter().map(|s| s.granted).collect();
        assert_eq!(granted, vec![1, 1, 0, 1, 0]);
    }

    #[test]
    fn allocation_is_pure() {
        let input = demands([120, 45, 900, 2300, 610]);
        let a = allocate(2048, &input);
        let b = allocate(2048, &input);
        assert_eq!(a, b);
    }

    #[test]
    fn zero_ceiling_grants_nothing() {
        let budget = allocate(0, &demands([10, 10, 10, 10, 10]));
        assert_eq!(budget.total_granted(), 0);
    }

    #[test]
    fn zero_weights_still_share_leftover() {
        let input = vec![
            SourceDemand {
                source: ContextSource::Setting,
                weight: 0,
                estimated_tokens: 50,
            },
            SourceDemand {
                source: ContextSource::History,
                weight: 0,
                estimated_tokens: 50,
            },
        ];
        let budget = allocate(60, &input);
        assert_eq!(budget.total_granted(), 60);
        assert_eq!(budget.granted(ContextSource::Setting), 30);
        assert_eq!(budget.granted(ContextSource::History), 30);
    }

    #[test]
    fn record_actual_updates_one_source() {
        let mut budget = allocate(1000, &demands([10, 10, 10, 10, 10]));
        budget.record_actual(ContextSource::Facts, 4);
        assert_eq!(budget.get(ContextSource::Facts).map(|s| s.actual), Some(4));
        assert_eq!(budget.total_actual(), 44);
    }
}
