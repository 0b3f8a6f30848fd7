use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Writeback {
    pub num_retired: u64,
    pub num_dropped: u64,
    /// Buffer heads held back because their register bank already retired this cycle.
    pub bank_conflicts: u64,
    /// Execute output latches left occupied because their buffer was full.
    pub buffer_full_stalls: u64,
    pub predicate_writes: u64,
    pub redirects: u64,
}

impl std::ops::AddAssign for Writeback {
    fn add_assign(&mut self, other: Self) {
        self.num_retired += other.num_retired;
        self.num_dropped += other.num_dropped;
        self.bank_conflicts += other.bank_conflicts;
        self.buffer_full_stalls += other.buffer_full_stalls;
        self.predicate_writes += other.predicate_writes;
        self.redirects += other.redirects;
    }
}
