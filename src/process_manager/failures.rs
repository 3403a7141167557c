use std::collections::HashMap;

use super::StreamKey;

/// Consecutive PTY start failures after which automatic attempts stop.
pub const FAILURE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct FailureRecord {
    consecutive: u32,
    ever_succeeded: bool,
    last_reason: Option<String>,
}

/// Per-stream PTY start bookkeeping. Lives as long as the runtime unless
/// cleared by a configuration reload.
#[derive(Debug, Clone, Default)]
pub struct FailureTracker {
    records: HashMap<StreamKey, FailureRecord>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_failure(&mut self, key: &StreamKey, reason: &str) -> u32 {
        let record = self.records.entry(key.clone()).or_default();
        record.consecutive = record.consecutive.saturating_add(1);
        record.last_reason = Some(reason.to_owned());
        record.consecutive
    }

    pub fn record_success(&mut self, key: &StreamKey) {
        let record = self.records.entry(key.clone()).or_default();
        record.consecutive = 0;
        record.ever_succeeded = true;
        record.last_reason = None;
    }

    pub fn count(&self, key: &StreamKey) -> u32 {
        self.records.get(key).map_or(0, |record| record.consecutive)
    }

    pub fn is_suspended(&self, key: &StreamKey) -> bool {
        self.count(key) >= FAILURE_THRESHOLD
    }

    pub fn ever_succeeded(&self, key: &StreamKey) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| record.ever_succeeded)
    }

    pub fn last_reason(&self, key: &StreamKey) -> Option<&str> {
        self.records
            .get(key)
            .and_then(|record| record.last_reason.as_deref())
    }

    pub fn forget(&mut self, key: &StreamKey) {
        self.records.remove(key);
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }
}
