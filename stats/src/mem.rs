use serde::{Deserialize, Serialize};

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
pub enum AccessKind {
    INST_READ,
    DATA_READ,
    DATA_WRITE,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Memory {
    pub inst_reads: u64,
    pub data_reads: u64,
    pub data_writes: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    /// Completions deferred because the response latch was occupied.
    pub response_stall_cycles: u64,
    /// Requests left waiting because the in-flight table was full.
    pub in_flight_full_cycles: u64,
    pub max_in_flight: u64,
}

impl Memory {
    pub fn record(&mut self, kind: AccessKind, bytes: u64) {
        match kind {
            AccessKind::INST_READ => {
                self.inst_reads += 1;
                self.bytes_read += bytes;
            }
            AccessKind::DATA_READ => {
                self.data_reads += 1;
                self.bytes_read += bytes;
            }
            AccessKind::DATA_WRITE => {
                self.data_writes += 1;
                self.bytes_written += bytes;
            }
        }
    }

    #[must_use]
    pub fn num_accesses(&self) -> u64 {
        self.inst_reads + self.data_reads + self.data_writes
    }
}

impl std::ops::AddAssign for Memory {
    fn add_assign(&mut self, other: Self) {
        self.inst_reads += other.inst_reads;
        self.data_reads += other.data_reads;
        self.data_writes += other.data_writes;
        self.bytes_read += other.bytes_read;
        self.bytes_written += other.bytes_written;
        self.response_stall_cycles += other.response_stall_cycles;
        self.in_flight_full_cycles += other.in_flight_full_cycles;
        self.max_in_flight = self.max_in_flight.max(other.max_in_flight);
    }
}

/// Lane accesses of the load/store unit and the block requests they were merged into.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coalescer {
    pub lane_accesses: u64,
    pub requests: u64,
}

impl Coalescer {
    /// Average number of lanes served by one request.
    #[must_use]
    pub fn lanes_per_request(&self) -> f64 {
        if self.requests == 0 {
            return 0.0;
        }
        self.lane_accesses as f64 / self.requests as f64
    }
}

impl std::ops::AddAssign for Coalescer {
    fn add_assign(&mut self, other: Self) {
        self.lane_accesses += other.lane_accesses;
        self.requests += other.requests;
    }
}
