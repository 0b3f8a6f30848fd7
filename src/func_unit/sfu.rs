//! Special function sub-units.

use super::{map_lanes, Semantics};
use crate::{
    instruction::Instruction,
    opcodes::{ArchOp, F_Op, Op},
};
use std::f32::consts::{FRAC_PI_2, PI};

/// Sine and cosine by CORDIC rotation, one iteration per pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct Trig {
    pub iterations: usize,
}

impl Trig {
    #[must_use]
    pub fn new(latency: usize) -> Self {
        Self {
            iterations: latency.max(1),
        }
    }

    /// Returns `(sin, cos)` of `angle` in radians.
    #[must_use]
    pub fn sin_cos(&self, angle: f32) -> (f32, f32) {
        if !angle.is_finite() {
            return (f32::NAN, f32::NAN);
        }
        // reduce into [-pi, pi]
        let mut theta = angle % (2.0 * PI);
        if theta > PI {
            theta -= 2.0 * PI;
        } else if theta < -PI {
            theta += 2.0 * PI;
        }
        // CORDIC converges on [-pi/2, pi/2], rotate by pi otherwise
        let mut sign = 1.0;
        if theta > FRAC_PI_2 {
            theta -= PI;
            sign = -1.0;
        } else if theta < -FRAC_PI_2 {
            theta += PI;
            sign = -1.0;
        }

        let mut gain = 1.0_f64;
        let (mut x, mut y, mut z) = (1.0_f64, 0.0_f64, f64::from(theta));
        let mut step = 1.0_f64;
        for _ in 0..self.iterations {
            let d = if z >= 0.0 { 1.0 } else { -1.0 };
            let (nx, ny) = (x - d * y * step, y + d * x * step);
            z -= d * step.atan();
            x = nx;
            y = ny;
            gain *= 1.0 / (1.0 + step * step).sqrt();
            step *= 0.5;
        }
        ((sign * y * gain) as f32, (sign * x * gain) as f32)
    }
}

impl Semantics for Trig {
    const PREFIX: &'static str = "trig_float";
    const CATEGORY: ArchOp = ArchOp::TRIG_OP;

    fn supports(&self, op: Op) -> bool {
        matches!(op, Op::F(F_Op::SIN | F_Op::COS))
    }

    fn execute(&self, instr: &mut Instruction, _stats: &mut stats::FunctionalUnit) {
        let cosine = instr.op == Op::F(F_Op::COS);
        map_lanes(instr, |_, a, _| {
            let (sin, cos) = self.sin_cos(f32::from_bits(a));
            if cosine { cos } else { sin }.to_bits()
        });
    }
}

/// Inverse square root from the `0x5f3759df` seed refined by Newton steps.
#[derive(Debug, Clone, Copy)]
pub struct InvSqrt {
    pub newton_steps: usize,
}

impl InvSqrt {
    pub const MAGIC: u32 = 0x5f37_59df;

    #[must_use]
    pub fn new(latency: usize) -> Self {
        Self {
            newton_steps: latency.saturating_sub(1).max(1),
        }
    }

    /// Non-positive inputs yield zero.
    #[must_use]
    pub fn inv_sqrt(&self, x: f32) -> f32 {
        if x.is_nan() || x <= 0.0 {
            return 0.0;
        }
        let half = 0.5 * x;
        let mut y = f32::from_bits(Self::MAGIC - (x.to_bits() >> 1));
        for _ in 0..self.newton_steps {
            y *= 1.5 - half * y * y;
        }
        y
    }
}

impl Semantics for InvSqrt {
    const PREFIX: &'static str = "invsqrt_float";
    const CATEGORY: ArchOp = ArchOp::INV_SQRT_OP;

    fn supports(&self, op: Op) -> bool {
        op == Op::F(F_Op::ISQRT)
    }

    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit) {
        let mut clamped = false;
        map_lanes(instr, |_, a, _| {
            let x = f32::from_bits(a);
            if x.is_nan() || x <= 0.0 {
                clamped = true;
            }
            self.inv_sqrt(x).to_bits()
        });
        if clamped {
            stats.increment_overflow(instr.op.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{InvSqrt, Trig};
    use crate::{
        func_unit::Semantics,
        instruction::Instruction,
        opcodes::{F_Op, Op},
        warp::WARP_SIZE,
    };

    #[test]
    fn cordic_matches_libm() {
        let trig = Trig::new(16);
        for angle in [-7.0_f32, -2.5, -1.0, 0.0, 0.3, 1.2, 2.0, 3.1, 10.0] {
            let (sin, cos) = trig.sin_cos(angle);
            assert!((sin - angle.sin()).abs() < 1e-3, "sin({angle}) = {sin}");
            assert!((cos - angle.cos()).abs() < 1e-3, "cos({angle}) = {cos}");
        }
    }

    #[test]
    fn cordic_precision_grows_with_iterations() {
        let coarse = Trig::new(4).sin_cos(0.7).0;
        let fine = Trig::new(20).sin_cos(0.7).0;
        assert!((fine - 0.7_f32.sin()).abs() < (coarse - 0.7_f32.sin()).abs());
    }

    #[test]
    fn inverse_sqrt() {
        let unit = InvSqrt::new(12);
        assert_eq!(unit.newton_steps, 11);
        assert!((unit.inv_sqrt(4.0) - 0.5).abs() < 1e-6);
        assert!((unit.inv_sqrt(0.01) - 10.0).abs() < 1e-4);
        assert_eq!(unit.inv_sqrt(0.0), 0.0);
        assert_eq!(unit.inv_sqrt(-9.0), 0.0);
        assert_eq!(InvSqrt::new(1).newton_steps, 1);
    }

    #[test]
    fn trig_unit_selects_function() {
        let mut instr = Instruction::new(0, Op::F(F_Op::COS), 0, 0);
        instr.rdat1 = [0.0_f32.to_bits(); WARP_SIZE];
        Trig::new(16).execute(&mut instr, &mut stats::FunctionalUnit::default());
        assert!((f32::from_bits(instr.wdat[0]) - 1.0).abs() < 1e-4);
    }
}
