#![allow(non_camel_case_types, clippy::upper_case_acronyms)]

pub mod cache;
pub mod func_unit;
pub mod mem;
pub mod scheduler;
pub mod sim;
pub mod writeback;

pub use cache::Cache;
pub use func_unit::FunctionalUnit;
pub use mem::{Coalescer, Memory};
pub use scheduler::Scheduler;
pub use sim::Sim;
pub use writeback::Writeback;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// All performance counters of one simulation run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    pub scheduler: Scheduler,
    pub icache: Cache,
    pub dcache: Cache,
    pub coalescer: Coalescer,
    pub memory: Memory,
    pub writeback: Writeback,
    /// Per functional sub-unit counters, keyed by sub-unit name.
    pub functional_units: BTreeMap<String, FunctionalUnit>,
}

impl Stats {
    #[must_use]
    pub fn functional_unit(&self, name: &str) -> Option<&FunctionalUnit> {
        self.functional_units.get(name)
    }
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.sim += other.sim;
        self.scheduler += other.scheduler;
        self.icache += other.icache;
        self.dcache += other.dcache;
        self.coalescer += other.coalescer;
        self.memory += other.memory;
        self.writeback += other.writeback;
        for (name, unit) in other.functional_units {
            *self.functional_units.entry(name).or_default() += unit;
        }
    }
}
