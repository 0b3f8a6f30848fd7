use crate::{
    engine::cycle::Component,
    func_unit::{ArithmeticFunctionalUnit, FunctionalSubUnit},
    instruction::Instruction,
    latch::Latch,
    opcodes::ArchOp,
    Error,
};
use console::style;
use indexmap::IndexMap;

pub const STAGE: &str = "execute";

/// Execute stage.
///
/// Owns the issue-to-execute latch, every functional unit and one output
/// latch per sub-unit. The functional-unit-status table (FUST) marks a
/// sub-unit busy exactly when it reports it cannot take new work.
#[derive(Debug)]
pub struct ExecuteStage {
    behind: Latch<Instruction>,
    units: Vec<ArithmeticFunctionalUnit>,
    ahead: IndexMap<String, Latch<Instruction>>,
    fust: IndexMap<String, bool>,
    categories: IndexMap<String, ArchOp>,
    cycle: u64,
}

impl ExecuteStage {
    #[must_use]
    pub fn new(units: Vec<ArithmeticFunctionalUnit>) -> Self {
        let mut ahead = IndexMap::new();
        let mut fust = IndexMap::new();
        let mut categories = IndexMap::new();
        for sub_unit in units.iter().flat_map(ArithmeticFunctionalUnit::sub_units) {
            let iface = sub_unit.output_interface();
            ahead.insert(iface.clone(), Latch::new(iface));
            fust.insert(sub_unit.name().to_string(), !sub_unit.ready_out());
            categories.insert(sub_unit.name().to_string(), sub_unit.category());
        }
        Self {
            behind: Latch::new("IS_EX"),
            units,
            ahead,
            fust,
            categories,
            cycle: 0,
        }
    }

    #[must_use]
    pub fn behind(&self) -> &Latch<Instruction> {
        &self.behind
    }

    pub fn behind_mut(&mut self) -> &mut Latch<Instruction> {
        &mut self.behind
    }

    #[must_use]
    pub fn ahead_latches(&self) -> &IndexMap<String, Latch<Instruction>> {
        &self.ahead
    }

    pub fn ahead_latches_mut(&mut self) -> &mut IndexMap<String, Latch<Instruction>> {
        &mut self.ahead
    }

    /// Busy flag per sub-unit name.
    #[must_use]
    pub fn fust(&self) -> &IndexMap<String, bool> {
        &self.fust
    }

    /// First free sub-unit able to execute `category`, in configuration order.
    #[must_use]
    pub fn free_sub_unit(&self, category: ArchOp) -> Option<&str> {
        self.categories
            .iter()
            .filter(|(_, kind)| **kind == category)
            .map(|(name, _)| name.as_str())
            .find(|name| self.fust.get(*name).is_some_and(|busy| !busy))
    }

    pub fn sub_units(&self) -> impl Iterator<Item = &Box<dyn FunctionalSubUnit>> {
        self.units.iter().flat_map(ArithmeticFunctionalUnit::sub_units)
    }

    /// Whether no instruction is left anywhere in the stage.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.behind.is_valid()
            && self.sub_units().all(|sub_unit| sub_unit.occupancy() == 0)
            && self.ahead.values().all(|latch| !latch.is_valid())
    }

    /// Cycle the next clock edge will be.
    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    /// Looks up the sub-unit `instr` is routed to and whether it can take it now.
    fn target_ready(&self, instr: &Instruction, cycle: u64) -> Result<bool, Error> {
        let name = instr.intended_fsu.clone().unwrap_or_default();
        let sub_unit = self
            .sub_units()
            .find(|sub_unit| sub_unit.name() == name)
            .ok_or_else(|| Error::UnknownSubUnit {
                name: name.clone(),
                cycle,
            })?;
        let ahead_ready = self
            .ahead
            .get(&sub_unit.output_interface())
            .is_some_and(Latch::ready_for_push);
        Ok(sub_unit.can_accept(ahead_ready))
    }
}

impl Component for ExecuteStage {
    fn compute(&mut self) {
        for unit in &mut self.units {
            unit.compute();
        }
        for sub_unit in self.units.iter().flat_map(ArithmeticFunctionalUnit::sub_units) {
            if let Some(busy) = self.fust.get_mut(sub_unit.name()) {
                *busy = !sub_unit.ready_out();
            }
        }
    }

    #[tracing::instrument(name = "execute", skip_all)]
    fn cycle(&mut self, cycle: u64) -> Result<(), Error> {
        // a sub-unit that cannot take the dispatched instruction stalls the latch
        let ready = match self.behind.snoop() {
            Some(instr) => self.target_ready(instr, cycle)?,
            None => false,
        };
        let mut input = if ready { self.behind.pop() } else { None };
        if let Some(instr) = input.as_mut() {
            instr.mark_stage_enter(STAGE, cycle);
            log::debug!(
                "{}",
                style(format!(
                    "cycle {:03} execute: dispatch {} to {}",
                    cycle,
                    instr,
                    instr.intended_fsu.as_deref().unwrap_or("?")
                ))
                .blue()
            );
        }

        let Self { units, ahead, .. } = self;
        for unit in units.iter_mut() {
            let emitted = unit.tick(
                &mut input,
                |iface| ahead.get(iface).is_some_and(Latch::ready_for_push),
                cycle,
            )?;
            for (iface, mut instr) in emitted {
                instr.mark_stage_exit(STAGE, cycle);
                let latch = ahead.get_mut(&iface).ok_or_else(|| Error::UnknownSubUnit {
                    name: iface.clone(),
                    cycle,
                })?;
                log::debug!("cycle {:03} execute: {} -> {}", cycle, instr, iface);
                latch.push_or_fail(instr, STAGE, cycle)?;
            }
        }

        if let Some(instr) = input {
            return Err(Error::UnknownSubUnit {
                name: instr.intended_fsu.unwrap_or_default(),
                cycle,
            });
        }

        self.compute();
        self.cycle = cycle + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::ExecuteStage;
    use crate::{
        config,
        engine::cycle::Component,
        func_unit::ArithmeticFunctionalUnit,
        instruction::Instruction,
        opcodes::{ArchOp, Op, R_Op},
        testing,
    };
    use color_eyre::eyre;

    fn single_alu(latency: usize) -> ExecuteStage {
        let latencies = config::Latencies {
            alu: latency,
            ..config::Latencies::default()
        };
        ExecuteStage::new(vec![ArithmeticFunctionalUnit::int(0, &latencies)])
    }

    fn add(uid: u64, a: u32, b: u32) -> Instruction {
        let mut instr = Instruction::new(uid, Op::R(R_Op::ADD), 0, 0);
        instr.rd = 1;
        instr.rdat1 = [a; crate::WARP_SIZE];
        instr.rdat2 = [b; crate::WARP_SIZE];
        instr.intended_fsu = Some("alu_int_0".to_string());
        instr
    }

    #[test]
    fn single_add_completes_after_latency() -> eyre::Result<()> {
        let mut execute = single_alu(1);
        execute.behind_mut().push(add(0, 40, 2)).unwrap();
        execute.cycle(0)?;
        assert!(!execute.ahead_latches()["alu_int_0_ex_wb"].is_valid());
        execute.cycle(1)?;
        let done = execute.ahead_latches_mut()["alu_int_0_ex_wb"].pop().unwrap();
        assert_eq!(done.wdat[0], done.rdat1[0] + done.rdat2[0]);
        assert_eq!(done.wdat[0], 42);
        Ok(())
    }

    #[test]
    fn back_to_back_adds_keep_issue_order() -> eyre::Result<()> {
        let mut execute = single_alu(1);
        let mut completed = Vec::new();
        for cycle in 0..4 {
            if cycle < 3 {
                execute.behind_mut().push(add(cycle, 1, cycle as u32)).unwrap();
            }
            execute.cycle(cycle)?;
            if let Some(instr) = execute.ahead_latches_mut()["alu_int_0_ex_wb"].pop() {
                completed.push((cycle, instr.uid, instr.wdat[0]));
            }
        }
        utils::diff::assert_eq!(have: completed, want: vec![(1, 0, 1), (2, 1, 2), (3, 2, 3)]);
        Ok(())
    }

    #[test]
    fn unknown_sub_unit_is_fatal() {
        testing::init_logging();
        let mut execute = single_alu(1);
        let mut instr = add(0, 1, 1);
        instr.intended_fsu = Some("alu_int_7".to_string());
        execute.behind_mut().push(instr).unwrap();
        let err = execute.cycle(3).unwrap_err();
        assert!(err.to_string().contains("alu_int_7"), "{err}");
        assert!(err.to_string().contains("cycle 3"), "{err}");
    }

    #[test]
    fn full_ahead_latch_stalls_dispatch() -> eyre::Result<()> {
        testing::init_logging();
        let mut execute = single_alu(1);
        execute.behind_mut().push(add(0, 1, 1)).unwrap();
        execute.cycle(0)?;
        execute.behind_mut().push(add(1, 2, 2)).unwrap();
        execute.cycle(1)?;
        // nobody drains alu_int_0_ex_wb
        execute.behind_mut().push(add(2, 3, 3)).unwrap();
        execute.cycle(2)?;
        assert!(execute.behind().is_valid(), "third add must wait in IS_EX");
        assert!(execute.fust()["alu_int_0"]);
        assert_eq!(execute.free_sub_unit(ArchOp::ALU_OP), None);

        let first = execute.ahead_latches_mut()["alu_int_0_ex_wb"].pop().unwrap();
        assert_eq!(first.uid, 0);
        execute.cycle(3)?;
        let second = execute.ahead_latches_mut()["alu_int_0_ex_wb"].pop().unwrap();
        assert_eq!(second.uid, 1);
        assert_eq!(second.wdat[0], 4);
        Ok(())
    }

    #[test]
    fn fust_tracks_ready_out() -> eyre::Result<()> {
        let mut execute = single_alu(3);
        for cycle in 0..8 {
            if cycle < 2 {
                execute.behind_mut().push(add(cycle, 0, 0)).unwrap();
            }
            execute.cycle(cycle)?;
            for latch in execute.ahead_latches_mut().values_mut() {
                latch.pop();
            }
            for sub_unit in execute.sub_units() {
                assert_eq!(execute.fust()[sub_unit.name()], !sub_unit.ready_out());
            }
        }
        assert!(execute.is_idle());
        assert_eq!(execute.free_sub_unit(ArchOp::INT_MUL_OP), Some("mul_int_0"));
        Ok(())
    }
}
