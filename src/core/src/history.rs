use std::collections::VecDeque;

use crate::backend::PlannedStep;
use crate::cache::CacheKey;
use crate::request::{FilterRequest, FilterResult};

/// One applied step.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub request: FilterRequest,
    pub result: FilterResult,
    /// The layer's subset before this step was applied.
    pub subset_before: Option<String>,
    /// Cache entry pinned by this step, if the result was cached.
    pub cache_key: Option<CacheKey>,
    /// Every step of the chain up to and including this one.
    pub plan_steps: Vec<PlannedStep>,
}

/// Bounded per-layer history of applied steps.
///
/// Also remembers the subset the layer had before filtering began, which
/// survives eviction and chain restarts so a reset can always return to it.
#[derive(Debug)]
pub struct MultiStepHistory {
    depth: usize,
    entries: VecDeque<HistoryEntry>,
    origin: Option<Option<String>>,
}

impl MultiStepHistory {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.max(1),
            entries: VecDeque::new(),
            origin: None,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Appends an entry, returning whatever fell off the front.
    pub fn push(&mut self, entry: HistoryEntry) -> Vec<HistoryEntry> {
        if self.origin.is_none() {
            self.origin = Some(entry.subset_before.clone());
        }
        self.entries.push_back(entry);
        let mut evicted = Vec::new();
        while self.entries.len() > self.depth {
            if let Some(oldest) = self.entries.pop_front() {
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// Drops the current chain so the next step starts a new one.
    pub fn start_chain(&mut self) -> Vec<HistoryEntry> {
        self.entries.drain(..).collect()
    }

    pub fn pop_last(&mut self) -> Option<HistoryEntry> {
        self.entries.pop_back()
    }

    pub fn last(&self) -> Option<&HistoryEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryEntry> {
        self.entries.iter()
    }

    /// Subset before the first recorded step, if anything was recorded.
    pub fn origin(&self) -> Option<Option<&str>> {
        self.origin.as_ref().map(Option::as_deref)
    }

    /// Empties the history, returning the original subset and the entries.
    pub fn take_all(&mut self) -> (Option<Option<String>>, Vec<HistoryEntry>) {
        (self.origin.take(), self.entries.drain(..).collect())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::BackendKind;

    fn entry(n: u32, before: Option<&str>) -> HistoryEntry {
        HistoryEntry {
            request: FilterRequest::attribute(format!("n = {n}")).at_step(n),
            result: FilterResult {
                success: true,
                subset: format!("step {n}"),
                feature_count: Some(u64::from(n)),
                elapsed: Duration::ZERO,
                backend: BackendKind::Generic,
                materialization: None,
            },
            subset_before: before.map(ToOwned::to_owned),
            cache_key: None,
            plan_steps: Vec::new(),
        }
    }

    #[test]
    fn evicts_oldest_never_newest() {
        let mut history = MultiStepHistory::new(3);
        for n in 0..5 {
            let evicted = history.push(entry(n, None));
            if n < 3 {
                assert!(evicted.is_empty());
            } else {
                assert_eq!(evicted.len(), 1);
                assert_eq!(evicted[0].request.step_index, n - 3);
            }
        }
        assert_eq!(history.len(), 3);
        assert_eq!(history.last().unwrap().request.step_index, 4);
    }

    #[test]
    fn origin_survives_eviction_and_restart() {
        let mut history = MultiStepHistory::new(1);
        history.push(entry(0, Some("pristine")));
        history.push(entry(1, Some("step 0")));
        assert_eq!(history.origin(), Some(Some("pristine")));

        history.start_chain();
        assert!(history.is_empty());
        history.push(entry(0, Some("step 1")));
        assert_eq!(history.origin(), Some(Some("pristine")));

        let (origin, entries) = history.take_all();
        assert_eq!(origin, Some(Some("pristine".to_owned())));
        assert_eq!(entries.len(), 1);
        assert_eq!(history.origin(), None);
    }

    #[test]
    fn pop_returns_most_recent() {
        let mut history = MultiStepHistory::new(10);
        history.push(entry(0, None));
        history.push(entry(1, Some("step 0")));
        let popped = history.pop_last().unwrap();
        assert_eq!(popped.subset_before.as_deref(), Some("step 0"));
        assert_eq!(history.len(), 1);
    }
}
