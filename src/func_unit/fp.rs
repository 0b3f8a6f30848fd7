//! Single precision floating point sub-units.
//!
//! Register words are reinterpreted as IEEE-754 `f32`.

use super::{map_lanes, Semantics};
use crate::{
    instruction::Instruction,
    opcodes::{ArchOp, F_Op, Op, R_Op},
};

fn float(bits: u32) -> f32 {
    f32::from_bits(bits)
}

/// Applies `f` per lane and counts results that became infinite from finite inputs.
fn map_float(
    instr: &mut Instruction,
    stats: &mut stats::FunctionalUnit,
    f: impl Fn(f32, f32) -> f32,
) {
    let mut overflowed = false;
    map_lanes(instr, |_, a, b| {
        let (a, b) = (float(a), float(b));
        let value = f(a, b);
        if value.is_infinite() && a.is_finite() && b.is_finite() {
            overflowed = true;
        }
        value.to_bits()
    });
    if overflowed {
        stats.increment_overflow(instr.op.to_string());
    }
}

/// Adder, compares and conversions.
#[derive(Debug, Default, Clone, Copy)]
pub struct FpAddSub;

impl Semantics for FpAddSub {
    const PREFIX: &'static str = "addsub_float";
    const CATEGORY: ArchOp = ArchOp::FP_OP;

    fn supports(&self, op: Op) -> bool {
        matches!(
            op,
            Op::R(R_Op::ADDF | R_Op::SUBF | R_Op::SLTF | R_Op::SGEF)
                | Op::F(F_Op::ITOF | F_Op::FTOI)
        )
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        match instr.op {
            Op::R(R_Op::ADDF) => map_float(instr, stats, |a, b| a + b),
            Op::R(R_Op::SUBF) => map_float(instr, stats, |a, b| a - b),
            Op::R(R_Op::SLTF) => {
                map_lanes(instr, |_, a, b| u32::from(float(a) < float(b)));
            }
            Op::R(R_Op::SGEF) => {
                map_lanes(instr, |_, a, b| u32::from(float(a) >= float(b)));
            }
            Op::F(F_Op::ITOF) => map_lanes(instr, |_, a, _| (a as i32 as f32).to_bits()),
            // saturating, NaN becomes zero
            Op::F(F_Op::FTOI) => map_lanes(instr, |_, a, _| float(a) as i32 as u32),
            _ => {}
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FpMul;

impl Semantics for FpMul {
    const PREFIX: &'static str = "mul_float";
    const CATEGORY: ArchOp = ArchOp::FP_MUL_OP;

    fn supports(&self, op: Op) -> bool {
        op == Op::R(R_Op::MULF)
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        map_float(instr, stats, |a, b| a * b);
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FpDiv;

impl Semantics for FpDiv {
    const PREFIX: &'static str = "div_float";
    const CATEGORY: ArchOp = ArchOp::FP_DIV_OP;

    fn supports(&self, op: Op) -> bool {
        op == Op::R(R_Op::DIVF)
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        map_float(instr, stats, |a, b| a / b);
    }
}

/// Square root. Negative inputs yield zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sqrt;

impl Semantics for Sqrt {
    const PREFIX: &'static str = "sqrt_float";
    const CATEGORY: ArchOp = ArchOp::SQRT_OP;

    fn supports(&self, op: Op) -> bool {
        op == Op::F(F_Op::SQRT)
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        let mut clamped = false;
        map_lanes(instr, |_, a, _| {
            let a = float(a);
            if a < 0.0 {
                clamped = true;
                return 0;
            }
            a.sqrt().to_bits()
        });
        if clamped {
            stats.increment_overflow(instr.op.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{FpAddSub, FpDiv, FpMul, Sqrt};
    use crate::{
        func_unit::Semantics,
        instruction::Instruction,
        opcodes::{F_Op, Op, R_Op},
        warp::WARP_SIZE,
    };

    fn run<S: Semantics>(unit: &S, op: Op, a: u32, b: u32) -> (u32, stats::FunctionalUnit) {
        let mut instr = Instruction::new(0, op, 0, 0);
        instr.rdat1 = [a; WARP_SIZE];
        instr.rdat2 = [b; WARP_SIZE];
        let mut stats = stats::FunctionalUnit::default();
        unit.execute(&mut instr, &mut stats);
        (instr.wdat[0], stats)
    }

    fn bits(value: f32) -> u32 {
        value.to_bits()
    }

    #[test]
    fn add_sub_and_compare() {
        let (sum, _) = run(&FpAddSub, Op::R(R_Op::ADDF), bits(1.5), bits(2.25));
        assert_eq!(f32::from_bits(sum), 3.75);
        let (lt, _) = run(&FpAddSub, Op::R(R_Op::SLTF), bits(-1.0), bits(0.5));
        assert_eq!(lt, 1);
        let (ge, _) = run(&FpAddSub, Op::R(R_Op::SGEF), bits(-1.0), bits(0.5));
        assert_eq!(ge, 0);
    }

    #[test]
    fn conversions() {
        let (f, _) = run(&FpAddSub, Op::F(F_Op::ITOF), (-3_i32) as u32, 0);
        assert_eq!(f32::from_bits(f), -3.0);
        let (i, _) = run(&FpAddSub, Op::F(F_Op::FTOI), bits(7.9), 0);
        assert_eq!(i, 7);
        let (nan, _) = run(&FpAddSub, Op::F(F_Op::FTOI), bits(f32::NAN), 0);
        assert_eq!(nan, 0);
    }

    #[test]
    fn mul_div_overflow() {
        let (product, stats) = run(&FpMul, Op::R(R_Op::MULF), bits(f32::MAX), bits(2.0));
        assert!(f32::from_bits(product).is_infinite());
        assert_eq!(stats.num_overflows(), 1);
        let (quotient, _) = run(&FpDiv, Op::R(R_Op::DIVF), bits(1.0), bits(4.0));
        assert_eq!(f32::from_bits(quotient), 0.25);
    }

    #[test]
    fn sqrt_of_negative_is_zero() {
        let (root, _) = run(&Sqrt, Op::F(F_Op::SQRT), bits(16.0), 0);
        assert_eq!(f32::from_bits(root), 4.0);
        let (neg, stats) = run(&Sqrt, Op::F(F_Op::SQRT), bits(-4.0), 0);
        assert_eq!(neg, 0);
        assert_eq!(stats.num_overflows(), 1);
    }
}
