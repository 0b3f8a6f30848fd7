use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(
    Debug,
    strum::EnumIter,
    strum::Display,
    Clone,
    Copy,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum RequestStatus {
    HIT = 0,
    MISS,
    /// A fetch arrived while a fill was outstanding.
    STALLED,
    FILL,
    PREFETCH,
    EVICTION,
    /// A miss merged into an outstanding fill of the same block.
    MSHR_HIT,
    /// A modified line sent back to memory.
    WRITEBACK,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cache {
    pub accesses: BTreeMap<RequestStatus, u64>,
}

impl Cache {
    pub fn inc(&mut self, status: RequestStatus) {
        *self.accesses.entry(status).or_insert(0) += 1;
    }

    #[must_use]
    pub fn count(&self, status: RequestStatus) -> u64 {
        self.accesses.get(&status).copied().unwrap_or(0)
    }

    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.count(RequestStatus::HIT);
        let total = hits + self.count(RequestStatus::MISS);
        if total == 0 {
            return 0.0;
        }
        hits as f64 / total as f64
    }

    #[must_use]
    pub fn flatten(&self) -> Vec<(RequestStatus, u64)> {
        use strum::IntoEnumIterator;
        RequestStatus::iter()
            .map(|status| (status, self.count(status)))
            .collect()
    }
}

impl std::ops::AddAssign for Cache {
    fn add_assign(&mut self, other: Self) {
        for (k, v) in other.accesses {
            *self.accesses.entry(k).or_insert(0) += v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::RequestStatus;

    #[test]
    fn hit_rate() {
        let mut cache = super::Cache::default();
        cache.inc(RequestStatus::MISS);
        cache.inc(RequestStatus::HIT);
        cache.inc(RequestStatus::HIT);
        cache.inc(RequestStatus::HIT);
        assert!((cache.hit_rate() - 0.75).abs() < f64::EPSILON);
        assert_eq!(cache.flatten().len(), 8);
    }
}
