//! Compare-to-predicate and jump sub-unit.

use super::{map_lanes, Semantics};
use crate::{
    instruction::Instruction,
    opcodes::{ArchOp, B_Op, I_Op, J_Op, Op, P_Op},
    warp,
};
use bitvec::array::BitArray;

#[derive(Debug, Default, Clone, Copy)]
pub struct Branch;

impl Branch {
    fn compare(op: B_Op, a: u32, b: u32) -> bool {
        match op {
            B_Op::BEQ => a == b,
            B_Op::BNE => a != b,
            B_Op::BGE => (a as i32) >= (b as i32),
            B_Op::BGEU => a >= b,
            B_Op::BLT => (a as i32) < (b as i32),
            B_Op::BLTU => a < b,
        }
    }

    /// Writes the return address for every active lane.
    fn link(instr: &mut Instruction) {
        let ret = instr.pc.wrapping_add(4);
        map_lanes(instr, |_, _, _| ret);
    }
}

impl Semantics for Branch {
    const PREFIX: &'static str = "branch_int";
    const CATEGORY: ArchOp = ArchOp::BRANCH_OP;

    fn supports(&self, op: Op) -> bool {
        matches!(
            op,
            Op::B(_) | Op::J(J_Op::JAL) | Op::I(I_Op::JALR) | Op::P(P_Op::JPNZ)
        )
    }

    fn execute(&self, instr: &mut Instruction, _stats: &mut stats::FunctionalUnit) {
        instr.branch_target = None;
        // a jump with every lane masked off falls through
        let any_active = instr.pred.any();
        match instr.op {
            Op::B(op) => {
                let mut wpred = BitArray::ZERO;
                for lane in instr.pred.iter_ones() {
                    wpred.set(lane, Self::compare(op, instr.rdat1[lane], instr.rdat2[lane]));
                }
                instr.wpred = wpred;
            }
            Op::J(J_Op::JAL) => {
                Self::link(instr);
                if any_active {
                    instr.branch_target = Some(instr.pc.wrapping_add(instr.imm as u32));
                }
            }
            Op::I(I_Op::JALR) => {
                let base = instr.pred.first_one().map(|lane| instr.rdat1[lane]);
                Self::link(instr);
                instr.branch_target =
                    base.map(|base| base.wrapping_add(instr.imm as u32) & !1);
            }
            Op::P(P_Op::JPNZ) => {
                // rdat1 carries the tested predicate as a lane mask
                let tested = instr.rdat1[0] & warp::mask_to_bits(&instr.pred);
                if tested != 0 {
                    let offset = (instr.imm << 2) as u32;
                    instr.branch_target = Some(instr.pc.wrapping_add(offset));
                }
            }
            _ => {}
        }
    }
}
