#![allow(
    clippy::upper_case_acronyms,
    non_camel_case_types,
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::cast_precision_loss,
    clippy::cast_sign_loss,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap
)]

pub mod config;
pub mod core;
pub mod dcache;
pub mod decode;
pub mod engine;
pub mod error;
pub mod execute;
pub mod fifo;
pub mod func_unit;
pub mod icache;
pub mod instruction;
pub mod issue;
pub mod latch;
pub mod mcu;
pub mod mem;
pub mod mem_fetch;
pub mod opcodes;
pub mod register_file;
pub mod scheduler;
pub mod scoreboard;
pub mod tag_array;
pub mod warp;
pub mod writeback;

#[cfg(test)]
pub mod testing;

pub use self::core::Simulator;
pub use error::Error;
pub use warp::WARP_SIZE;
