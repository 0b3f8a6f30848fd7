//! Memory requests exchanged between the memory controller and its clients.

use crate::{instruction::Instruction, Error};
use bitvec::{field::BitField, order::Lsb0, vec::BitVec};

/// Requesting client of the memory controller.
#[derive(Debug, strum::Display, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub enum Source {
    ICACHE,
    LDST,
}

#[derive(Debug, strum::Display, Clone, Copy, Hash, PartialEq, Eq)]
pub enum Kind {
    READ,
    WRITE,
}

/// Data carried by a write request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    Bits(BitVec<u8, Lsb0>),
    Bytes(Vec<u8>),
    /// Little-endian integer of `width` bytes. A width of zero means a full word.
    /// The value must fit in `width` bytes.
    Int { value: u64, width: u8 },
    Words(Vec<u32>),
}

impl Payload {
    /// Canonical little-endian byte sequence of the payload.
    pub fn normalize(&self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Bits(bits) => {
                if bits.len() % 8 != 0 {
                    return Err(Error::UnsupportedPayload(format!(
                        "bit vector of {} bits is not byte aligned",
                        bits.len()
                    )));
                }
                Ok(bits.chunks(8).map(|byte| byte.load_le::<u8>()).collect())
            }
            Self::Bytes(bytes) => Ok(bytes.clone()),
            Self::Int { value, width } => {
                let width = match *width {
                    0 => 4,
                    w @ 1..=8 => usize::from(w),
                    w => {
                        return Err(Error::UnsupportedPayload(format!(
                            "integer of {w} bytes"
                        )))
                    }
                };
                if width < 8 && *value >> (8 * width) != 0 {
                    return Err(Error::UnsupportedPayload(format!(
                        "integer {value:#x} does not fit in {width} bytes"
                    )));
                }
                Ok(value.to_le_bytes()[..width].to_vec())
            }
            Self::Words(words) => Ok(words.iter().flat_map(|w| w.to_le_bytes()).collect()),
        }
    }
}

/// A request travelling through the memory controller.
#[derive(Debug, Clone, PartialEq)]
pub struct MemRequest {
    pub id: u64,
    pub source: Source,
    pub kind: Kind,
    pub addr: u32,
    pub size: usize,
    pub payload: Option<Payload>,
    pub warp_id: usize,
    pub group_id: usize,
    pub pc: u32,
    /// Cycles left until the request can complete.
    pub remaining: u64,
    /// Instruction this request was issued for, handed back with the response.
    pub instr: Option<Box<Instruction>>,
    /// Lane of a per-lane data access.
    pub lane: Option<usize>,
}

impl MemRequest {
    #[must_use]
    pub fn read(source: Source, addr: u32, size: usize) -> Self {
        Self {
            id: 0,
            source,
            kind: Kind::READ,
            addr,
            size,
            payload: None,
            warp_id: 0,
            group_id: 0,
            pc: 0,
            remaining: 0,
            instr: None,
            lane: None,
        }
    }

    #[must_use]
    pub fn write(source: Source, addr: u32, payload: Payload) -> Self {
        Self {
            kind: Kind::WRITE,
            payload: Some(payload),
            ..Self::read(source, addr, 0)
        }
    }

    /// Threads `instr` through the request so the response can carry it back.
    #[must_use]
    pub fn with_instruction(mut self, instr: Instruction) -> Self {
        self.warp_id = instr.warp_id;
        self.group_id = instr.group_id;
        self.pc = instr.pc;
        self.instr = Some(Box::new(instr));
        self
    }

    #[must_use]
    pub fn with_lane(mut self, lane: usize) -> Self {
        self.lane = Some(lane);
        self
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        self.kind == Kind::WRITE
    }
}

impl std::fmt::Display for MemRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}({}@{:#010x}, id={}, remaining={})",
            self.kind, self.source, self.addr, self.id, self.remaining
        )
    }
}

/// A completed request.
#[derive(Debug, Clone, PartialEq)]
pub struct MemResponse {
    pub id: u64,
    pub source: Source,
    pub kind: Kind,
    pub addr: u32,
    /// Bytes read, empty for writes.
    pub data: Vec<u8>,
    pub instr: Instruction,
    pub lane: Option<usize>,
}

impl MemResponse {
    /// Completes `req`, rebuilding a minimal instruction if none was threaded through.
    #[must_use]
    pub fn new(req: MemRequest, data: Vec<u8>) -> Self {
        let instr = match req.instr {
            Some(instr) => *instr,
            None => Instruction::fetch(req.id, req.pc, req.warp_id, req.group_id),
        };
        Self {
            id: req.id,
            source: req.source,
            kind: req.kind,
            addr: req.addr,
            data,
            instr,
            lane: req.lane,
        }
    }
}

impl std::fmt::Display for MemResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Response({}@{:#010x}, id={}, {} bytes)",
            self.kind,
            self.source,
            self.addr,
            self.id,
            self.data.len()
        )
    }
}
