use crate::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Simulator configuration.
///
/// Supplied at construction and fixed for the whole run.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub core: Core,
    pub functional_units: FunctionalUnits,
    pub icache: ICache,
    pub dcache: DCache,
    pub memory: Memory,
    pub ldst: LoadStore,
    pub writeback: Writeback,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Core {
    pub num_warps: usize,
    /// Warps sharing one program counter. Equals the number of register banks.
    pub warps_per_group: usize,
    pub regs_per_warp: usize,
    pub preds_per_warp: usize,
    pub start_pc: u32,
    /// Depth of each per-group instruction buffer.
    pub ibuffer_size: usize,
    /// Threads per block reported by the `BLOCK_DIM` CSR.
    pub block_dim: u32,
    pub arg_ptr: u32,
}

impl Default for Core {
    fn default() -> Self {
        Self {
            num_warps: 4,
            warps_per_group: 2,
            regs_per_warp: 64,
            preds_per_warp: 16,
            start_pc: 0,
            ibuffer_size: 4,
            block_dim: 128,
            arg_ptr: 0,
        }
    }
}

impl Core {
    #[must_use]
    pub fn num_groups(&self) -> usize {
        self.num_warps / self.warps_per_group
    }
}

/// Latency in cycles of each functional sub-unit kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Latencies {
    pub alu: usize,
    pub int_mul: usize,
    pub int_div: usize,
    pub fp_add_sub: usize,
    pub fp_mul: usize,
    pub fp_div: usize,
    pub sqrt: usize,
    pub trig: usize,
    pub inv_sqrt: usize,
    pub branch: usize,
}

impl Default for Latencies {
    fn default() -> Self {
        Self {
            alu: 1,
            int_mul: 2,
            int_div: 17,
            fp_add_sub: 1,
            fp_mul: 4,
            fp_div: 24,
            sqrt: 20,
            trig: 16,
            inv_sqrt: 12,
            branch: 1,
        }
    }
}

impl Latencies {
    fn all(&self) -> [(&'static str, usize); 10] {
        [
            ("alu", self.alu),
            ("int_mul", self.int_mul),
            ("int_div", self.int_div),
            ("fp_add_sub", self.fp_add_sub),
            ("fp_mul", self.fp_mul),
            ("fp_div", self.fp_div),
            ("sqrt", self.sqrt),
            ("trig", self.trig),
            ("inv_sqrt", self.inv_sqrt),
            ("branch", self.branch),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FunctionalUnits {
    pub int_units: usize,
    pub fp_units: usize,
    pub special_units: usize,
    pub branch_units: usize,
    pub latencies: Latencies,
}

impl Default for FunctionalUnits {
    fn default() -> Self {
        Self {
            int_units: 1,
            fp_units: 1,
            special_units: 1,
            branch_units: 1,
            latencies: Latencies::default(),
        }
    }
}

/// A cache replacement policy
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheReplacementPolicy {
    LRU,
    FIFO,
    /// Pseudo random victim, reproducible across runs.
    RANDOM,
}

/// What the instruction cache does on a miss.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheMissPolicy {
    /// One outstanding fill.
    BLOCKING,
    /// Demand fill followed by a next-line prefetch.
    PREFETCH,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ICache {
    /// Total size in bytes.
    pub size: usize,
    pub block_size: usize,
    pub associativity: usize,
    pub replacement_policy: CacheReplacementPolicy,
    pub miss_policy: CacheMissPolicy,
}

impl Default for ICache {
    fn default() -> Self {
        Self {
            size: 1024,
            block_size: 32,
            associativity: 2,
            replacement_policy: CacheReplacementPolicy::LRU,
            miss_policy: CacheMissPolicy::BLOCKING,
        }
    }
}

impl ICache {
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.size / (self.block_size * self.associativity)
    }
}

/// Banked write-back data cache between the load/store unit and memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DCache {
    /// Total size in bytes.
    pub size: usize,
    pub block_size: usize,
    pub associativity: usize,
    /// Consecutive blocks are interleaved over the banks.
    pub num_banks: usize,
    /// Miss entries per bank, counting the one whose fill is outstanding.
    pub mshr_size: usize,
    pub replacement_policy: CacheReplacementPolicy,
}

impl Default for DCache {
    fn default() -> Self {
        Self {
            size: 65536,
            block_size: 128,
            associativity: 8,
            num_banks: 32,
            mshr_size: 16,
            replacement_policy: CacheReplacementPolicy::LRU,
        }
    }
}

impl DCache {
    /// Sets of one bank.
    #[must_use]
    pub fn num_sets(&self) -> usize {
        self.size / (self.block_size * self.associativity * self.num_banks)
    }
}

/// How the memory controller picks between its request sources.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Arbitration {
    ROUND_ROBIN,
    ICACHE_PRIORITY,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Memory {
    /// Round trip latency in cycles.
    pub latency: u64,
    pub max_in_flight: usize,
    pub arbitration: Arbitration,
}

impl Default for Memory {
    fn default() -> Self {
        Self {
            latency: 50,
            max_in_flight: 4,
            arbitration: Arbitration::ROUND_ROBIN,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadStore {
    pub queue_size: usize,
}

impl Default for LoadStore {
    fn default() -> Self {
        Self { queue_size: 4 }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WritebackBufferCount {
    BUFFER_PER_FSU,
    BUFFER_PER_BANK,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WritebackBufferSize {
    FIXED,
    VARIABLE,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WritebackBufferStructure {
    STACK,
    QUEUE,
    CIRCULAR,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WritebackBufferPolicy {
    AGE,
    CAPACITY,
    FSU_PRIORITY,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Writeback {
    pub count: WritebackBufferCount,
    pub size: WritebackBufferSize,
    pub structure: WritebackBufferStructure,
    pub primary_policy: WritebackBufferPolicy,
    pub secondary_policy: WritebackBufferPolicy,
    /// Capacity of every buffer, or the fallback for buffers missing from `sizes`.
    pub capacity: usize,
    /// Per buffer capacities when `size` is `VARIABLE`.
    pub sizes: IndexMap<String, usize>,
    /// Buffer names from highest to lowest priority for `FSU_PRIORITY`.
    pub priority: Vec<String>,
}

impl Default for Writeback {
    fn default() -> Self {
        Self {
            count: WritebackBufferCount::BUFFER_PER_FSU,
            size: WritebackBufferSize::FIXED,
            structure: WritebackBufferStructure::QUEUE,
            primary_policy: WritebackBufferPolicy::AGE,
            secondary_policy: WritebackBufferPolicy::CAPACITY,
            capacity: 2,
            sizes: IndexMap::new(),
            priority: Vec::new(),
        }
    }
}

impl Writeback {
    #[must_use]
    pub fn capacity_of(&self, buffer: &str) -> usize {
        match self.size {
            WritebackBufferSize::FIXED => self.capacity,
            WritebackBufferSize::VARIABLE => {
                self.sizes.get(buffer).copied().unwrap_or(self.capacity)
            }
        }
    }
}

fn ensure(cond: bool, msg: impl FnOnce() -> String) -> Result<(), Error> {
    if cond {
        Ok(())
    } else {
        Err(Error::Config(msg()))
    }
}

impl Config {
    /// Loads a yaml (or json, which is valid yaml) configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let reader = utils::fs::open_readable(path)?;
        let config: Self = serde_yaml::from_reader(reader).map_err(|source| Error::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), Error> {
        let core = &self.core;
        ensure(core.warps_per_group > 0, || {
            "warps per group must be positive".to_string()
        })?;
        ensure(
            core.num_warps > 0 && core.num_warps % core.warps_per_group == 0,
            || {
                format!(
                    "{} warps cannot be split into groups of {}",
                    core.num_warps, core.warps_per_group
                )
            },
        )?;
        ensure(core.regs_per_warp > 1 && core.regs_per_warp <= 64, || {
            format!("{} registers per warp (must be 2..=64)", core.regs_per_warp)
        })?;
        ensure(core.preds_per_warp > 0 && core.preds_per_warp <= 32, || {
            format!("{} predicates per warp (must be 1..=32)", core.preds_per_warp)
        })?;
        ensure(core.start_pc % 4 == 0, || {
            format!("start pc {:#x} is not word aligned", core.start_pc)
        })?;
        ensure(core.ibuffer_size >= 2, || {
            "instruction buffers need at least two slots".to_string()
        })?;

        let fu = &self.functional_units;
        ensure(
            fu.int_units > 0 && fu.fp_units > 0 && fu.special_units > 0 && fu.branch_units > 0,
            || "every functional unit kind needs at least one instance".to_string(),
        )?;
        for (name, latency) in fu.latencies.all() {
            ensure(latency > 0, || format!("{name} latency must be positive"))?;
        }

        let icache = &self.icache;
        ensure(
            icache.block_size >= 4 && icache.block_size.is_power_of_two(),
            || format!("block size {} is not a power of two >= 4", icache.block_size),
        )?;
        ensure(icache.block_size <= 64, || {
            format!("block size {} exceeds 64 bytes", icache.block_size)
        })?;
        ensure(icache.associativity > 0, || {
            "associativity must be positive".to_string()
        })?;
        ensure(
            icache.num_sets() > 0
                && icache.num_sets().is_power_of_two()
                && icache.num_sets() * icache.block_size * icache.associativity == icache.size,
            || {
                format!(
                    "cache size {} is not a power of two number of {}-way sets of {} byte blocks",
                    icache.size, icache.associativity, icache.block_size
                )
            },
        )?;

        let dcache = &self.dcache;
        ensure(
            dcache.block_size >= 4 && dcache.block_size.is_power_of_two(),
            || format!("block size {} is not a power of two >= 4", dcache.block_size),
        )?;
        ensure(
            dcache.associativity > 0 && dcache.num_banks.is_power_of_two() && dcache.mshr_size > 0,
            || {
                format!(
                    "data cache needs ways, a power of two number of banks and mshrs (have {}, {}, {})",
                    dcache.associativity, dcache.num_banks, dcache.mshr_size
                )
            },
        )?;
        ensure(
            dcache.num_sets() > 0
                && dcache.num_sets().is_power_of_two()
                && dcache.num_sets() * dcache.block_size * dcache.associativity * dcache.num_banks
                    == dcache.size,
            || {
                format!(
                    "data cache size {} is not {} banks of a power of two number of {}-way sets of {} byte blocks",
                    dcache.size, dcache.num_banks, dcache.associativity, dcache.block_size
                )
            },
        )?;

        ensure(self.memory.latency > 0, || {
            "memory latency must be positive".to_string()
        })?;
        ensure(self.memory.max_in_flight > 0, || {
            "memory controller needs at least one in-flight slot".to_string()
        })?;
        ensure(self.ldst.queue_size > 0, || {
            "load/store queue needs at least one slot".to_string()
        })?;

        let wb = &self.writeback;
        ensure(wb.primary_policy != wb.secondary_policy, || {
            format!(
                "primary and secondary writeback policy are both {:?}",
                wb.primary_policy
            )
        })?;
        ensure(
            wb.capacity > 0 && wb.sizes.values().all(|size| *size > 0),
            || "writeback buffers need at least one slot".to_string(),
        )?;
        Ok(())
    }
}
