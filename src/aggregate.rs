//! Collapses the raw trials in the store into one leaderboard entry per
//! (implementation, game).
//!
//! Only the most recent run of each pair counts. Within that run every level gets a
//! single candidate trial, and the candidate of the game's last level is the entry.

use std::collections::{BTreeMap, btree_map::Entry};

use itertools::Itertools;
use serde::Serialize;

use crate::{
    core::domain::{Registry, Run, TrialResult},
    store::{Store, StoreError},
};

/// How a passing candidate reacts to a later failing trial of the same level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SelectionPolicy {
    /// A later failure replaces a passing candidate. Matches the leaderboards that
    /// were produced from historical data.
    #[default]
    Compatible,
    /// A passing candidate is only ever replaced by a faster passing trial.
    PreferPassing,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BestResult {
    pub run: Run,
    pub result: TrialResult,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Aggregates {
    pub by_impl: BTreeMap<String, Vec<BestResult>>,
    pub by_game: BTreeMap<String, Vec<BestResult>>,
}

#[derive(Debug)]
pub struct Aggregator<'a> {
    store: &'a Store,
    registry: &'a Registry,
    policy: SelectionPolicy,
}

impl<'a> Aggregator<'a> {
    pub fn new(store: &'a Store, registry: &'a Registry) -> Self {
        Self {
            store,
            registry,
            policy: SelectionPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: SelectionPolicy) -> Self {
        self.policy = policy;
        self
    }

    #[tracing::instrument(skip(self), fields(policy = ?self.policy))]
    pub fn aggregate(&self) -> Result<Aggregates, StoreError> {
        let mut aggregates = Aggregates::default();

        for run in latest_runs(self.store.runs()?) {
            let Some(game) = self.registry.game(&run.game) else {
                tracing::warn!(game = %run.game, run = %run.id, "Skipping run of unknown game");
                continue;
            };
            if self.registry.implementation(&run.implementation).is_none() {
                tracing::warn!(
                    implementation = %run.implementation,
                    run = %run.id,
                    "Skipping run of unknown implementation"
                );
                continue;
            }

            let mut best = best_per_level(self.store.level_results_desc(run.id)?, self.policy);
            let Some(result) = game.last_level().and_then(|level| best.remove(&level)) else {
                tracing::debug!(
                    implementation = %run.implementation,
                    game = %run.game,
                    "Latest run never reached the last level"
                );
                continue;
            };

            let entry = BestResult { run, result };
            aggregates
                .by_impl
                .entry(entry.run.implementation.clone())
                .or_default()
                .push(entry.clone());
            aggregates
                .by_game
                .entry(entry.run.game.clone())
                .or_default()
                .push(entry);
        }

        Ok(aggregates)
    }
}

/// Keeps the run with the latest `run_when` for each (implementation, game), the last
/// one seen on equal timestamps. Sorted by implementation, then game.
pub fn latest_runs(runs: impl IntoIterator<Item = Run>) -> Vec<Run> {
    runs.into_iter()
        .into_grouping_map_by(|run| (run.implementation.clone(), run.game.clone()))
        .max_by(|_, a, b| a.run_when.cmp(&b.run_when))
        .into_iter()
        .sorted_by(|(a, _), (b, _)| a.cmp(b))
        .map(|(_, run)| run)
        .collect()
}

/// Picks one candidate trial per level, visiting `results` in the given order.
///
/// The first trial of a level is taken as is. A failed candidate is final. A passing
/// candidate is replaced by a strictly faster passing trial, and under
/// [`SelectionPolicy::Compatible`] also by any failing one.
pub fn best_per_level(
    results: impl IntoIterator<Item = TrialResult>,
    policy: SelectionPolicy,
) -> BTreeMap<u32, TrialResult> {
    let mut best = BTreeMap::new();

    for result in results {
        let Some(level) = result.level else {
            continue;
        };

        match best.entry(level) {
            Entry::Vacant(entry) => {
                entry.insert(result);
            }
            Entry::Occupied(mut entry) => {
                let current = entry.get();
                if !current.passed {
                    continue;
                }

                let replace = if result.passed {
                    result.cpu_time < current.cpu_time
                } else {
                    policy == SelectionPolicy::Compatible
                };
                if replace {
                    entry.insert(result);
                }
            }
        }
    }

    best
}
