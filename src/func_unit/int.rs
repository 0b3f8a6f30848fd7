//! Integer sub-units.

use super::{map_lanes, Semantics};
use crate::{
    instruction::Instruction,
    opcodes::{ArchOp, C_Op, I_Op, Op, P_Op, R_Op, U_Op},
};
use bitvec::array::BitArray;

/// Adder, logic, shifts, compares, immediate builders and register moves.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntAlu;

fn shift_amount(value: u32) -> u32 {
    value & 0x1F
}

impl IntAlu {
    fn binary(op: Op) -> Option<fn(u32, u32) -> (u32, bool)> {
        let f: fn(u32, u32) -> (u32, bool) = match op {
            Op::R(R_Op::ADD) | Op::I(I_Op::ADDI) => |a, b| {
                let (value, overflow) = (a as i32).overflowing_add(b as i32);
                (value as u32, overflow)
            },
            Op::R(R_Op::SUB) => |a, b| {
                let (value, overflow) = (a as i32).overflowing_sub(b as i32);
                (value as u32, overflow)
            },
            Op::R(R_Op::AND) => |a, b| (a & b, false),
            Op::R(R_Op::OR) | Op::I(I_Op::ORI) => |a, b| (a | b, false),
            Op::R(R_Op::XOR) | Op::I(I_Op::XORI) => |a, b| (a ^ b, false),
            Op::R(R_Op::SLT) | Op::I(I_Op::SLTI) => {
                |a, b| (u32::from((a as i32) < (b as i32)), false)
            }
            Op::R(R_Op::SLTU) | Op::I(I_Op::SLTIU) => |a, b| (u32::from(a < b), false),
            Op::R(R_Op::SGE) => |a, b| (u32::from((a as i32) >= (b as i32)), false),
            Op::R(R_Op::SGEU) => |a, b| (u32::from(a >= b), false),
            Op::R(R_Op::SLL) | Op::I(I_Op::SLLI) => |a, b| (a << shift_amount(b), false),
            Op::R(R_Op::SRL) => |a, b| (a >> shift_amount(b), false),
            Op::R(R_Op::SRA) | Op::I(I_Op::SRAI) => {
                |a, b| (((a as i32) >> shift_amount(b)) as u32, false)
            }
            _ => return None,
        };
        Some(f)
    }
}

impl Semantics for IntAlu {
    const PREFIX: &'static str = "alu_int";
    const CATEGORY: ArchOp = ArchOp::ALU_OP;

    fn supports(&self, op: Op) -> bool {
        Self::binary(op).is_some() || matches!(op, Op::U(_) | Op::C(C_Op::CSRR) | Op::P(P_Op::PRR | P_Op::PRW))
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        let imm = instr.imm as u32;
        let pc = instr.pc;
        match instr.op {
            // rdat1 holds the previous value of rd
            Op::U(U_Op::LLI) => map_lanes(instr, |_, old, _| (old & 0xFFFF_F000) | (imm & 0xFFF)),
            Op::U(U_Op::LMI) => {
                map_lanes(instr, |_, old, _| (old & !0x00FF_F000) | ((imm & 0xFFF) << 12));
            }
            Op::U(U_Op::LUI) => {
                map_lanes(instr, |_, old, _| (old & 0x00FF_FFFF) | ((imm & 0xFF) << 24));
            }
            Op::U(U_Op::AUIPC) => map_lanes(instr, |_, _, _| pc.wrapping_add(imm << 12)),
            // values are staged into rdat1 at issue
            Op::C(C_Op::CSRR) | Op::P(P_Op::PRR) => map_lanes(instr, |_, value, _| value),
            Op::P(P_Op::PRW) => {
                let mut wpred = BitArray::ZERO;
                for lane in instr.pred.iter_ones() {
                    wpred.set(lane, instr.rdat1[lane] != 0);
                }
                instr.wpred = wpred;
            }
            op => {
                let Some(f) = Self::binary(op) else {
                    return;
                };
                let mut overflowed = false;
                map_lanes(instr, |_, a, b| {
                    let (value, overflow) = f(a, b);
                    overflowed |= overflow;
                    value
                });
                if overflowed {
                    stats.increment_overflow(op.to_string());
                }
            }
        }
    }
}

/// 32-bit multiplier keeping the low word.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntMul;

impl Semantics for IntMul {
    const PREFIX: &'static str = "mul_int";
    const CATEGORY: ArchOp = ArchOp::INT_MUL_OP;

    fn supports(&self, op: Op) -> bool {
        op == Op::R(R_Op::MUL)
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        let mut overflowed = false;
        map_lanes(instr, |_, a, b| {
            let (value, overflow) = (a as i32).overflowing_mul(b as i32);
            overflowed |= overflow;
            value as u32
        });
        if overflowed {
            stats.increment_overflow(instr.op.to_string());
        }
    }
}

/// Signed divider. Division by zero yields zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntDiv;

impl Semantics for IntDiv {
    const PREFIX: &'static str = "div_int";
    const CATEGORY: ArchOp = ArchOp::INT_DIV_OP;

    fn supports(&self, op: Op) -> bool {
        op == Op::R(R_Op::DIV)
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        let mut overflowed = false;
        map_lanes(instr, |_, a, b| {
            if b == 0 {
                overflowed = true;
                return 0;
            }
            let (value, overflow) = (a as i32).overflowing_div(b as i32);
            overflowed |= overflow;
            value as u32
        });
        if overflowed {
            stats.increment_overflow(instr.op.to_string());
        }
    }
}
