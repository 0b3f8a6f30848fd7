use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Counters of one functional sub-unit.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionalUnit {
    pub total_cycles: u64,
    /// Cycles where the output could not drain into the writeback latch.
    pub stall_cycles: u64,
    /// Cycles where every pipeline slot was occupied.
    pub pipeline_full_cycles: u64,
    /// Cycles without a new instruction.
    pub nop_cycles: u64,
    /// Cycles with at least one instruction in flight.
    pub utilization_cycles: u64,
    pub total_instructions: u64,
    pub instruction_types: BTreeMap<String, u64>,
    /// Lane results that overflowed or were otherwise clamped, keyed by operation.
    pub overflows: BTreeMap<String, u64>,
}

impl FunctionalUnit {
    pub fn record_instruction(&mut self, op: impl Into<String>) {
        self.total_instructions += 1;
        *self.instruction_types.entry(op.into()).or_insert(0) += 1;
    }

    pub fn increment_overflow(&mut self, op: impl Into<String>) {
        *self.overflows.entry(op.into()).or_insert(0) += 1;
    }

    #[must_use]
    pub fn num_overflows(&self) -> u64 {
        self.overflows.values().sum()
    }

    /// Fraction of cycles with work in flight.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.total_cycles == 0 {
            return 0.0;
        }
        self.utilization_cycles as f64 / self.total_cycles as f64
    }
}

impl std::ops::AddAssign for FunctionalUnit {
    fn add_assign(&mut self, other: Self) {
        self.total_cycles += other.total_cycles;
        self.stall_cycles += other.stall_cycles;
        self.pipeline_full_cycles += other.pipeline_full_cycles;
        self.nop_cycles += other.nop_cycles;
        self.utilization_cycles += other.utilization_cycles;
        self.total_instructions += other.total_instructions;
        for (op, count) in other.instruction_types {
            *self.instruction_types.entry(op).or_insert(0) += count;
        }
        for (op, count) in other.overflows {
            *self.overflows.entry(op).or_insert(0) += count;
        }
    }
}
