pub mod arithmetic;
pub mod branch;
pub mod fp;
pub mod int;
pub mod load_store;
pub mod sfu;

pub use arithmetic::ArithmeticFunctionalUnit;
pub use load_store::LoadStoreUnit;

use crate::{
    fifo::CompactQueue,
    instruction::Instruction,
    opcodes::{ArchOp, Op},
    warp::{Lanes, WARP_SIZE},
    Error,
};

/// Per-lane behaviour of one kind of functional sub-unit.
pub trait Semantics: std::fmt::Debug {
    /// Name prefix, e.g. `alu_int`.
    const PREFIX: &'static str;
    const CATEGORY: ArchOp;

    #[must_use]
    fn supports(&self, op: Op) -> bool;

    /// Computes the results of `instr` for its active lanes.
    fn execute(&self, instr: &mut Instruction, stats: &mut stats::FunctionalUnit);
}

/// A latency-pipelined functional sub-unit.
pub trait FunctionalSubUnit: std::fmt::Display + std::fmt::Debug {
    #[must_use]
    fn name(&self) -> &str;

    /// Name of the latch this sub-unit drains into.
    #[must_use]
    fn output_interface(&self) -> String {
        format!("{}_ex_wb", self.name())
    }

    #[must_use]
    fn category(&self) -> ArchOp;

    #[must_use]
    fn latency(&self) -> usize;

    #[must_use]
    fn supports(&self, op: Op) -> bool;

    /// Evaluates every instruction in flight. Calling it again has no effect.
    fn compute(&mut self);

    /// Advances the latency pipeline by one cycle.
    ///
    /// Returns the instruction leaving the pipeline, if any. When the
    /// downstream latch is not ready the head is held and `input` must fit
    /// into the tail slot.
    fn tick(
        &mut self,
        input: Option<Instruction>,
        ahead_ready: bool,
        cycle: u64,
    ) -> Result<Option<Instruction>, Error>;

    /// Whether `input` can be taken this cycle given the downstream latch state.
    #[must_use]
    fn can_accept(&self, ahead_ready: bool) -> bool;

    /// Whether new work can be accepted next cycle.
    #[must_use]
    fn ready_out(&self) -> bool;

    #[must_use]
    fn occupancy(&self) -> usize;

    #[must_use]
    fn stats(&self) -> &stats::FunctionalUnit;
}

#[derive(Debug, Clone)]
struct Staged {
    instr: Instruction,
    evaluated: bool,
}

impl std::fmt::Display for Staged {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.instr)
    }
}

/// Generic sub-unit: a shift register of `latency` slots around a [`Semantics`].
#[derive(Debug)]
pub struct PipelinedSubUnit<S> {
    name: String,
    latency: usize,
    pipeline: CompactQueue<Staged>,
    /// Head could not drain on the last tick.
    stalled: bool,
    semantics: S,
    stats: stats::FunctionalUnit,
}

impl<S> PipelinedSubUnit<S>
where
    S: Semantics,
{
    #[must_use]
    pub fn new(index: usize, latency: usize, semantics: S) -> Self {
        let name = format!("{}_{}", S::PREFIX, index);
        Self {
            pipeline: CompactQueue::new(name.clone(), latency),
            name,
            latency,
            stalled: false,
            semantics,
            stats: stats::FunctionalUnit::default(),
        }
    }

    #[must_use]
    pub fn semantics(&self) -> &S {
        &self.semantics
    }
}

impl<S> std::fmt::Display for PipelinedSubUnit<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.pipeline)
    }
}

impl<S> FunctionalSubUnit for PipelinedSubUnit<S>
where
    S: Semantics,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> ArchOp {
        S::CATEGORY
    }

    fn latency(&self) -> usize {
        self.latency
    }

    fn supports(&self, op: Op) -> bool {
        self.semantics.supports(op)
    }

    fn compute(&mut self) {
        for staged in self.pipeline.iter_mut() {
            if !staged.evaluated {
                self.semantics.execute(&mut staged.instr, &mut self.stats);
                staged.evaluated = true;
            }
        }
    }

    fn tick(
        &mut self,
        input: Option<Instruction>,
        ahead_ready: bool,
        cycle: u64,
    ) -> Result<Option<Instruction>, Error> {
        self.compute();

        self.stats.total_cycles += 1;
        if self.pipeline.is_full() {
            self.stats.pipeline_full_cycles += 1;
        }
        if input.is_some() || !self.pipeline.is_empty() {
            self.stats.utilization_cycles += 1;
        }

        let staged = match input {
            Some(mut instr) => {
                if !self.supports(instr.op) {
                    return Err(Error::UnsupportedOperation {
                        unit: self.name.clone(),
                        op: instr.op.to_string(),
                    });
                }
                instr.mark_fu_enter(&self.name, cycle);
                self.stats.record_instruction(instr.op.to_string());
                Some(Staged {
                    instr,
                    evaluated: false,
                })
            }
            None => {
                self.stats.nop_cycles += 1;
                None
            }
        };

        if ahead_ready {
            self.stalled = false;
            let out = self.pipeline.advance(staged).map(|staged| {
                let mut instr = staged.instr;
                instr.mark_fu_exit(&self.name, cycle);
                instr
            });
            return Ok(out);
        }

        self.stalled = self.pipeline.snoop().is_some();
        if self.stalled {
            self.stats.stall_cycles += 1;
        }
        self.pipeline.advance_stalled(staged)?;
        Ok(None)
    }

    fn can_accept(&self, ahead_ready: bool) -> bool {
        ahead_ready || !self.pipeline.is_full()
    }

    fn ready_out(&self) -> bool {
        !self.pipeline.is_full() || !self.stalled
    }

    fn occupancy(&self) -> usize {
        self.pipeline.len()
    }

    fn stats(&self) -> &stats::FunctionalUnit {
        &self.stats
    }
}

/// Applies `f` to the operands of every active lane of `instr`.
///
/// The closure receives the lane index and the two operands and returns the
/// result word.
pub(crate) fn map_lanes(instr: &mut Instruction, mut f: impl FnMut(usize, u32, u32) -> u32) {
    let mut wdat: Lanes = [0; WARP_SIZE];
    for lane in instr.pred.iter_ones() {
        wdat[lane] = f(lane, instr.rdat1[lane], instr.rdat2[lane]);
    }
    instr.wdat = wdat;
}
