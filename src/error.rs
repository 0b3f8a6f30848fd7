use std::path::PathBuf;

/// Fatal simulation errors.
///
/// None of these are retried: backpressure is modelled by stalling and never
/// surfaces as an error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("cycle {cycle}: {stage} pushed into occupied latch {latch:?}")]
    LatchOccupied {
        stage: String,
        latch: String,
        cycle: u64,
    },
    #[error("cycle {cycle}: {stage} popped empty latch {latch:?}")]
    LatchEmpty {
        stage: String,
        latch: String,
        cycle: u64,
    },
    #[error("{buffer} overflow (capacity {capacity})")]
    Overflow { buffer: String, capacity: usize },
    #[error("cycle {cycle}: no functional sub-unit named {name:?}")]
    UnknownSubUnit { name: String, cycle: u64 },
    #[error("undefined opcode in word {raw:#010x} at pc {pc:#010x}")]
    UndefinedOpcode { raw: u32, pc: u32 },
    #[error("register r{reg} out of range at pc {pc:#010x}")]
    RegisterOutOfRange { reg: usize, pc: u32 },
    #[error("predicate p{pred} out of range at pc {pc:#010x}")]
    PredicateOutOfRange { pred: usize, pc: u32 },
    #[error("{unit} cannot execute {op}")]
    UnsupportedOperation { unit: String, op: String },
    #[error("unsupported memory payload: {0}")]
    UnsupportedPayload(String),
    #[error("csr {0:#x} is not mapped")]
    UnmappedCsr(u32),
    #[error("line {line}: {reason}")]
    MalformedProgram { line: usize, reason: String },
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cycle {cycle}: {message}")]
    Invariant { cycle: u64, message: String },
    #[error("exceeded maximum of {0} cycles before all warps halted")]
    Timeout(u64),

    #[error(transparent)]
    Fs(#[from] utils::fs::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("failed to parse yaml config {path:?}")]
    Yaml {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn invariant(cycle: u64, message: impl Into<String>) -> Self {
        Self::Invariant {
            cycle,
            message: message.into(),
        }
    }
}
