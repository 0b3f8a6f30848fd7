use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    pub cycles: u64,
    pub instructions_retired: u64,
    pub instructions_squashed: u64,
    /// Issue cycles lost to register or predicate hazards.
    pub issue_hazard_stalls: u64,
    /// Issue cycles lost because every matching sub-unit was busy.
    pub issue_unit_busy_stalls: u64,
}

impl Sim {
    /// Retired instructions per cycle.
    #[must_use]
    pub fn ipc(&self) -> f64 {
        if self.cycles == 0 {
            return 0.0;
        }
        self.instructions_retired as f64 / self.cycles as f64
    }
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles += other.cycles;
        self.instructions_retired += other.instructions_retired;
        self.instructions_squashed += other.instructions_squashed;
        self.issue_hazard_stalls += other.issue_hazard_stalls;
        self.issue_unit_busy_stalls += other.issue_unit_busy_stalls;
    }
}
