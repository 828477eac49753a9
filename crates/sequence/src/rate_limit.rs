//! Per-sequence daily send budget backed by DashMap.
//!
//! Counters are keyed by sequence and local calendar day (in the sequence's
//! schedule timezone). Check and increment happen under the map entry lock,
//! so concurrent workers can never overshoot the cap.

use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// One day of usage for one sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCounter {
    pub sequence_id: Uuid,
    pub day: NaiveDate,
    pub used: u32,
}

#[derive(Debug, Default)]
pub struct DailyRateLimiter {
    counters: DashMap<(Uuid, NaiveDate), u32>,
}

impl DailyRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve one touch. `max_per_day == 0` means unlimited; usage is still
    /// counted.
    pub fn try_reserve(&self, sequence_id: Uuid, day: NaiveDate, max_per_day: u32) -> bool {
        let mut used = self.counters.entry((sequence_id, day)).or_insert(0);
        if max_per_day != 0 && *used >= max_per_day {
            metrics::counter!("rate_limit.denied").increment(1);
            return false;
        }
        *used += 1;
        true
    }

    /// Give back a reservation whose send did not go out.
    pub fn release(&self, sequence_id: Uuid, day: NaiveDate) {
        if let Some(mut used) = self.counters.get_mut(&(sequence_id, day)) {
            *used = used.saturating_sub(1);
        }
    }

    pub fn usage(&self, sequence_id: Uuid, day: NaiveDate) -> u32 {
        self.counters
            .get(&(sequence_id, day))
            .map(|u| *u)
            .unwrap_or(0)
    }

    /// Drop counters for days before `cutoff`. Returns how many were removed.
    pub fn purge_before(&self, cutoff: NaiveDate) -> usize {
        let before = self.counters.len();
        self.counters.retain(|(_, day), _| *day >= cutoff);
        before - self.counters.len()
    }

    pub fn export(&self) -> Vec<BudgetCounter> {
        self.counters
            .iter()
            .map(|entry| BudgetCounter {
                sequence_id: entry.key().0,
                day: entry.key().1,
                used: *entry.value(),
            })
            .collect()
    }

    pub fn import(&self, counters: Vec<BudgetCounter>) {
        for counter in counters {
            self.counters
                .insert((counter.sequence_id, counter.day), counter.used);
        }
    }
}
