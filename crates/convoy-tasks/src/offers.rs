//! Short-lived pool of runner offers.

use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

/// One runner's capacity for one task of a given type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskOffer {
    pub offer_id: String,
    pub runner_id: String,
    pub task_type: String,
    pub valid_until: Instant,
}

impl TaskOffer {
    pub fn new(
        offer_id: impl Into<String>,
        runner_id: impl Into<String>,
        task_type: impl Into<String>,
        valid_for: Duration,
    ) -> Self {
        Self {
            offer_id: offer_id.into(),
            runner_id: runner_id.into(),
            task_type: task_type.into(),
            valid_until: Instant::now() + valid_for,
        }
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.valid_until
    }
}

/// Offers grouped by task type, oldest first.
///
/// Expired offers are purged lazily whenever a type is matched against.
#[derive(Debug, Default)]
pub struct OfferPool {
    by_type: HashMap<String, VecDeque<TaskOffer>>,
}

impl OfferPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an offer behind every earlier offer of the same type.
    ///
    /// A runner repeating an offer id replaces its earlier offer.
    pub fn add(&mut self, offer: TaskOffer) {
        let queue = self.by_type.entry(offer.task_type.clone()).or_default();
        queue.retain(|o| !(o.runner_id == offer.runner_id && o.offer_id == offer.offer_id));
        queue.push_back(offer);
    }

    /// Remove and return the oldest unexpired offer for `task_type`.
    pub fn take_oldest_valid(&mut self, task_type: &str, now: Instant) -> Option<TaskOffer> {
        let queue = self.by_type.get_mut(task_type)?;
        queue.retain(|o| !o.is_expired(now));
        let offer = queue.pop_front();
        if queue.is_empty() {
            self.by_type.remove(task_type);
        }
        offer
    }

    /// Drop every offer made by `runner_id`. Returns how many were dropped.
    pub fn remove_runner(&mut self, runner_id: &str) -> usize {
        let mut removed = 0;
        self.by_type.retain(|_, queue| {
            let before = queue.len();
            queue.retain(|o| o.runner_id != runner_id);
            removed += before - queue.len();
            !queue.is_empty()
        });
        removed
    }

    /// Number of unexpired offers across all types.
    pub fn valid_count(&self, now: Instant) -> usize {
        self.by_type
            .values()
            .flat_map(|q| q.iter())
            .filter(|o| !o.is_expired(now))
            .count()
    }
}
