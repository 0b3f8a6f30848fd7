use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    pub num_fetches: u64,
    pub icache_stall_cycles: u64,
    pub ibuffer_full_stall_cycles: u64,
    pub branch_pending_cycles: u64,
    /// Cycles where no warp-group could fetch.
    pub idle_cycles: u64,
    pub num_branches_taken: u64,
    pub num_end_of_packet: u64,
    pub num_halted: u64,
}

impl std::ops::AddAssign for Scheduler {
    fn add_assign(&mut self, other: Self) {
        self.num_fetches += other.num_fetches;
        self.icache_stall_cycles += other.icache_stall_cycles;
        self.ibuffer_full_stall_cycles += other.ibuffer_full_stall_cycles;
        self.branch_pending_cycles += other.branch_pending_cycles;
        self.idle_cycles += other.idle_cycles;
        self.num_branches_taken += other.num_branches_taken;
        self.num_end_of_packet += other.num_end_of_packet;
        self.num_halted += other.num_halted;
    }
}
