use crate::{
    opcodes::{ArchOp, InstrType, Op},
    warp::{self, ActiveMask, Lanes, WARP_SIZE},
    Error,
};
use bitvec::array::BitArray;
use indexmap::IndexMap;
use smallvec::SmallVec;

/// Raw bytes of an instruction cache block.
pub type Block = SmallVec<[u8; 64]>;

/// Bit positions of the instruction word fields.
pub mod fields {
    pub const OPCODE_MASK: u32 = 0x7F;
    pub const RD_SHIFT: u32 = 7;
    pub const RS1_SHIFT: u32 = 13;
    pub const RS2_SHIFT: u32 = 19;
    pub const REG_MASK: u32 = 0x3F;
    pub const PRED_SHIFT: u32 = 25;
    pub const PRED_MASK: u32 = 0x1F;
    pub const END_OF_STREAM_BIT: u32 = 30;
    pub const END_OF_PACKET_BIT: u32 = 31;
}

/// Time spent inside one functional sub-unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuEntry {
    pub unit: String,
    pub enter: u64,
    pub exit: Option<u64>,
}

/// Per-stage timestamps of an instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Timing {
    pub stage_enter: IndexMap<&'static str, u64>,
    pub stage_exit: IndexMap<&'static str, u64>,
    pub fu: Vec<FuEntry>,
    pub issue: Option<u64>,
    pub writeback: Option<u64>,
}

/// A warp instruction in flight.
///
/// Created by the scheduler with only its fetch coordinates, filled in by
/// decode and issue, and retired by writeback. It is moved from latch to
/// latch and never shared between two stages.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Fetch order id, unique for the whole run.
    pub uid: u64,
    pub pc: u32,
    pub warp_id: usize,
    pub group_id: usize,

    /// Cache block containing the instruction word.
    pub block: Option<(u32, Block)>,
    pub raw: Option<u32>,
    pub op: Op,
    pub rd: usize,
    pub rs1: usize,
    pub rs2: usize,
    pub src_pred: usize,
    pub imm: i32,
    pub end_of_packet: bool,
    pub end_of_stream: bool,

    /// Name of the functional sub-unit chosen at issue.
    pub intended_fsu: Option<String>,
    /// Lanes enabled by the source predicate.
    pub pred: ActiveMask,
    pub rdat1: Lanes,
    pub rdat2: Lanes,
    pub wdat: Lanes,
    /// Predicate lanes produced by compare operations.
    pub wpred: ActiveMask,
    /// Redirect target of a taken jump.
    pub branch_target: Option<u32>,

    pub timing: Timing,
}

impl Instruction {
    /// A fetch request for `pc` on behalf of one warp.
    #[must_use]
    pub fn fetch(uid: u64, pc: u32, warp_id: usize, group_id: usize) -> Self {
        Self {
            uid,
            pc,
            warp_id,
            group_id,
            block: None,
            raw: None,
            op: Op::default(),
            rd: 0,
            rs1: 0,
            rs2: 0,
            src_pred: 0,
            imm: 0,
            end_of_packet: false,
            end_of_stream: false,
            intended_fsu: None,
            pred: warp::full_mask(),
            rdat1: [0; WARP_SIZE],
            rdat2: [0; WARP_SIZE],
            wdat: [0; WARP_SIZE],
            wpred: BitArray::ZERO,
            branch_target: None,
            timing: Timing::default(),
        }
    }

    /// Builds an already decoded instruction, mostly useful for driving a stage directly.
    #[must_use]
    pub fn new(uid: u64, op: Op, warp_id: usize, group_id: usize) -> Self {
        Self {
            op,
            ..Self::fetch(uid, 0, warp_id, group_id)
        }
    }

    /// Extracts the instruction word at `pc` from the attached cache block.
    #[must_use]
    pub fn word_from_block(&self) -> Option<u32> {
        let (base, block) = self.block.as_ref()?;
        let offset = self.pc.checked_sub(*base)? as usize;
        let bytes = block.get(offset..offset + 4)?;
        Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    /// Fills the operation and operand fields from a raw instruction word.
    pub fn decode(&mut self, raw: u32) -> Result<(), Error> {
        use fields::*;
        let op = Op::decode((raw & OPCODE_MASK) as u8);
        let Some(ty) = op.instr_type() else {
            return Err(Error::UndefinedOpcode { raw, pc: self.pc });
        };
        let rd = (raw >> RD_SHIFT) & REG_MASK;
        let rs1 = (raw >> RS1_SHIFT) & REG_MASK;
        let rs2 = (raw >> RS2_SHIFT) & REG_MASK;

        self.raw = Some(raw);
        self.op = op;
        self.end_of_packet = (raw >> END_OF_PACKET_BIT) & 1 == 1;
        self.end_of_stream = (raw >> END_OF_STREAM_BIT) & 1 == 1;
        self.src_pred = ((raw >> PRED_SHIFT) & PRED_MASK) as usize;
        self.rd = 0;
        self.rs1 = 0;
        self.rs2 = 0;
        self.imm = 0;

        match ty {
            InstrType::R => {
                self.rd = rd as usize;
                self.rs1 = rs1 as usize;
                self.rs2 = rs2 as usize;
            }
            InstrType::I => {
                self.rd = rd as usize;
                self.rs1 = rs1 as usize;
                self.imm = sign_extend(rs2, 6);
            }
            InstrType::F => {
                self.rd = rd as usize;
                self.rs1 = rs1 as usize;
            }
            InstrType::S => {
                self.rs1 = rs1 as usize;
                self.rs2 = rs2 as usize;
                self.imm = sign_extend(rd, 6);
            }
            InstrType::B => {
                // destination predicate lives in the rd field
                self.rd = rd as usize;
                self.rs1 = rs1 as usize;
                self.rs2 = rs2 as usize;
            }
            InstrType::U => {
                self.rd = rd as usize;
                self.imm = ((raw >> RS1_SHIFT) & 0xFFF) as i32;
            }
            InstrType::C => {
                self.rd = rd as usize;
                self.imm = rs1 as i32;
            }
            InstrType::J => {
                self.rd = rd as usize;
                self.imm = sign_extend((raw >> RS1_SHIFT) & 0x1_FFFF, 17);
                // the offset overlaps the predicate field
                self.src_pred = 0;
            }
            InstrType::P => {
                self.rd = rd as usize;
                self.rs1 = rs1 as usize;
                self.imm = sign_extend(rs2, 6);
            }
            InstrType::H => {}
        }
        Ok(())
    }

    #[must_use]
    pub fn category(&self) -> Option<ArchOp> {
        self.op.category()
    }

    /// Registers read by this instruction.
    #[must_use]
    pub fn inputs(&self) -> SmallVec<[usize; 2]> {
        use crate::opcodes::U_Op;
        let mut regs = SmallVec::new();
        match self.op.instr_type() {
            Some(InstrType::R | InstrType::S | InstrType::B) => {
                regs.push(self.rs1);
                regs.push(self.rs2);
            }
            Some(InstrType::I | InstrType::F) => regs.push(self.rs1),
            Some(InstrType::P) if self.op.writes_predicate() => regs.push(self.rs1),
            // immediate builders merge into the old value of rd
            Some(InstrType::U) if self.op != Op::U(U_Op::AUIPC) => regs.push(self.rd),
            _ => {}
        }
        regs.retain(|reg| *reg != 0);
        regs
    }

    /// Registers written by this instruction.
    #[must_use]
    pub fn outputs(&self) -> Option<usize> {
        (self.op.writes_register() && self.rd != 0).then_some(self.rd)
    }

    /// Predicate slots read by this instruction.
    #[must_use]
    pub fn predicate_inputs(&self) -> SmallVec<[usize; 2]> {
        use crate::opcodes::P_Op;
        let mut preds = SmallVec::new();
        preds.push(self.src_pred);
        if matches!(self.op, Op::P(P_Op::JPNZ | P_Op::PRR)) {
            preds.push(self.rs1);
        }
        preds
    }

    /// Predicate slot written by this instruction.
    #[must_use]
    pub fn predicate_output(&self) -> Option<usize> {
        self.op.writes_predicate().then_some(self.rd)
    }

    #[must_use]
    pub fn active_lanes(&self) -> usize {
        self.pred.count_ones()
    }

    /// Records the first entry into `stage`.
    pub fn mark_stage_enter(&mut self, stage: &'static str, cycle: u64) {
        self.timing.stage_enter.entry(stage).or_insert(cycle);
    }

    pub fn mark_stage_exit(&mut self, stage: &'static str, cycle: u64) {
        self.timing.stage_exit.insert(stage, cycle);
    }

    pub fn mark_fu_enter(&mut self, unit: &str, cycle: u64) {
        self.timing.fu.push(FuEntry {
            unit: unit.to_string(),
            enter: cycle,
            exit: None,
        });
    }

    pub fn mark_fu_exit(&mut self, unit: &str, cycle: u64) {
        if let Some(entry) = self
            .timing
            .fu
            .iter_mut()
            .rev()
            .find(|entry| entry.unit == unit && entry.exit.is_none())
        {
            entry.exit = Some(cycle);
        }
    }

    pub fn mark_issue(&mut self, cycle: u64) {
        self.timing.issue = Some(cycle);
    }

    pub fn mark_writeback(&mut self, cycle: u64) {
        self.timing.writeback = Some(cycle);
    }
}

impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[uid={} pc={:#06x} w={}]",
            self.op, self.uid, self.pc, self.warp_id
        )
    }
}

/// Sign extends the low `bits` bits of `value`.
#[must_use]
pub fn sign_extend(value: u32, bits: u32) -> i32 {
    let shift = 32 - bits;
    ((value << shift) as i32) >> shift
}

/// Encodes an instruction word, the inverse of [`Instruction::decode`].
///
/// `rd`, `rs1` and `rs2` are placed in their raw field positions regardless of
/// the instruction type.
#[must_use]
pub fn encode(op: Op, rd: u32, rs1: u32, rs2: u32, src_pred: u32) -> u32 {
    use fields::*;
    u32::from(op.bits())
        | (rd & REG_MASK) << RD_SHIFT
        | (rs1 & REG_MASK) << RS1_SHIFT
        | (rs2 & REG_MASK) << RS2_SHIFT
        | (src_pred & PRED_MASK) << PRED_SHIFT
}
