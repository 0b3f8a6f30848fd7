use super::{
    branch::Branch,
    fp::{FpAddSub, FpDiv, FpMul, Sqrt},
    int::{IntAlu, IntDiv, IntMul},
    sfu::{InvSqrt, Trig},
    FunctionalSubUnit, PipelinedSubUnit, Semantics,
};
use crate::{config, instruction::Instruction, Error};

fn boxed<S>(unit: PipelinedSubUnit<S>) -> Box<dyn FunctionalSubUnit>
where
    S: Semantics + 'static,
{
    Box::new(unit)
}

/// A group of sub-units sharing one dispatch port.
///
/// Each cycle at most one sub-unit receives the dispatched instruction: the
/// one its intended sub-unit names.
#[derive(Debug)]
pub struct ArithmeticFunctionalUnit {
    name: String,
    sub_units: Vec<Box<dyn FunctionalSubUnit>>,
}

impl ArithmeticFunctionalUnit {
    #[must_use]
    pub fn new(name: impl Into<String>, sub_units: Vec<Box<dyn FunctionalSubUnit>>) -> Self {
        Self {
            name: name.into(),
            sub_units,
        }
    }

    #[must_use]
    pub fn int(index: usize, latencies: &config::Latencies) -> Self {
        Self::new(
            format!("int_{index}"),
            vec![
                boxed(PipelinedSubUnit::new(index, latencies.alu, IntAlu)),
                boxed(PipelinedSubUnit::new(index, latencies.int_mul, IntMul)),
                boxed(PipelinedSubUnit::new(index, latencies.int_div, IntDiv)),
            ],
        )
    }

    #[must_use]
    pub fn fp(index: usize, latencies: &config::Latencies) -> Self {
        Self::new(
            format!("fp_{index}"),
            vec![
                boxed(PipelinedSubUnit::new(index, latencies.fp_add_sub, FpAddSub)),
                boxed(PipelinedSubUnit::new(index, latencies.fp_mul, FpMul)),
                boxed(PipelinedSubUnit::new(index, latencies.fp_div, FpDiv)),
                boxed(PipelinedSubUnit::new(index, latencies.sqrt, Sqrt)),
            ],
        )
    }

    #[must_use]
    pub fn special(index: usize, latencies: &config::Latencies) -> Self {
        Self::new(
            format!("special_{index}"),
            vec![
                boxed(PipelinedSubUnit::new(
                    index,
                    latencies.trig,
                    Trig::new(latencies.trig),
                )),
                boxed(PipelinedSubUnit::new(
                    index,
                    latencies.inv_sqrt,
                    InvSqrt::new(latencies.inv_sqrt),
                )),
            ],
        )
    }

    #[must_use]
    pub fn branch(index: usize, latencies: &config::Latencies) -> Self {
        Self::new(
            format!("branch_{index}"),
            vec![boxed(PipelinedSubUnit::new(
                index,
                latencies.branch,
                Branch,
            ))],
        )
    }

    /// Builds every functional unit named by the configuration.
    #[must_use]
    pub fn all(config: &config::FunctionalUnits) -> Vec<Self> {
        let latencies = &config.latencies;
        let int = (0..config.int_units).map(|i| Self::int(i, latencies));
        let fp = (0..config.fp_units).map(|i| Self::fp(i, latencies));
        let special = (0..config.special_units).map(|i| Self::special(i, latencies));
        let branch = (0..config.branch_units).map(|i| Self::branch(i, latencies));
        int.chain(fp).chain(special).chain(branch).collect()
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn sub_units(&self) -> &[Box<dyn FunctionalSubUnit>] {
        &self.sub_units
    }

    pub fn compute(&mut self) {
        for sub_unit in &mut self.sub_units {
            sub_unit.compute();
        }
    }

    /// Ticks every sub-unit once.
    ///
    /// `input` is taken by the sub-unit it names, if any. `ahead_ready` tells
    /// whether the output latch of a sub-unit can take a result this cycle.
    /// Returns the emitted instructions with the name of their output latch.
    pub fn tick(
        &mut self,
        input: &mut Option<Instruction>,
        ahead_ready: impl Fn(&str) -> bool,
        cycle: u64,
    ) -> Result<Vec<(String, Instruction)>, Error> {
        let mut emitted = Vec::new();
        for sub_unit in &mut self.sub_units {
            let iface = sub_unit.output_interface();
            let routed = input
                .as_ref()
                .is_some_and(|instr| instr.intended_fsu.as_deref() == Some(sub_unit.name()));
            let dispatched = if routed { input.take() } else { None };
            if let Some(out) = sub_unit.tick(dispatched, ahead_ready(&iface), cycle)? {
                emitted.push((iface, out));
            }
        }
        Ok(emitted)
    }
}

impl std::fmt::Display for ArithmeticFunctionalUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}[", self.name)?;
        for (idx, sub_unit) in self.sub_units.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{sub_unit}")?;
        }
        write!(f, "]")
    }
}
