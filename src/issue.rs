use crate::{
    config,
    execute::ExecuteStage,
    fifo::CompactQueue,
    func_unit::{load_store, LoadStoreUnit},
    instruction::Instruction,
    latch::{ForwardingIf, Latch},
    opcodes::{ArchOp, C_Op, InstrType, Op, P_Op, U_Op},
    register_file::{CsrFile, PredicateRegisterFile, RegisterFile},
    scheduler::ordering,
    scoreboard::{Access, Scoreboard},
    warp::{self, Drained, SquashView, WARP_SIZE},
    Error,
};
use console::style;

pub const STAGE: &str = "issue";

/// Architectural state read when an instruction leaves its buffer.
#[derive(Debug, Clone, Copy)]
pub struct Registers<'a> {
    pub regs: &'a RegisterFile,
    pub preds: &'a PredicateRegisterFile,
    pub csrs: &'a CsrFile,
}

/// Stages issue dispatches into.
#[derive(Debug)]
pub struct Targets<'a> {
    pub execute: &'a mut ExecuteStage,
    pub ldst: &'a mut LoadStoreUnit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    SubUnit(String),
    LoadStore,
}

/// Issue stage.
///
/// Buffers decoded instructions per warp-group and dispatches at most one
/// instruction per cycle, visiting the groups round robin. An instruction
/// leaves its buffer only when the scoreboard reports no hazard, no older jump
/// of its group is unresolved and a matching sub-unit is free.
#[derive(Debug)]
pub struct Issue {
    behind: Latch<Instruction>,
    ibuffers: Vec<CompactQueue<Instruction>>,
    next_group: usize,
    ibuffer_full: ForwardingIf<Vec<bool>>,
    num_issued: u64,
    hazard_stalls: u64,
    unit_busy_stalls: u64,
}

impl Issue {
    #[must_use]
    pub fn new(config: &config::Core) -> Self {
        Self {
            behind: Latch::new("ID_IS"),
            ibuffers: (0..config.num_groups())
                .map(|group_id| CompactQueue::new(format!("ibuffer_{group_id}"), config.ibuffer_size))
                .collect(),
            next_group: 0,
            ibuffer_full: ForwardingIf::new("ibuffer_full"),
            num_issued: 0,
            hazard_stalls: 0,
            unit_busy_stalls: 0,
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
    pub fn ibuffers(&self) -> &[CompactQueue<Instruction>] {
        &self.ibuffers
    }

    /// Per-group flag raised when fewer than two buffer slots are free.
    #[must_use]
    pub fn ibuffer_full(&self) -> &ForwardingIf<Vec<bool>> {
        &self.ibuffer_full
    }

    #[must_use]
    pub fn num_issued(&self) -> u64 {
        self.num_issued
    }

    #[must_use]
    pub fn hazard_stalls(&self) -> u64 {
        self.hazard_stalls
    }

    #[must_use]
    pub fn unit_busy_stalls(&self) -> u64 {
        self.unit_busy_stalls
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.behind.is_valid() && self.ibuffers.iter().all(CompactQueue::is_empty)
    }

    fn route(instr: &Instruction, targets: &Targets<'_>, cycle: u64) -> Result<Option<Route>, Error> {
        let category = instr.category().ok_or(Error::UndefinedOpcode {
            raw: instr.raw.unwrap_or_default(),
            pc: instr.pc,
        })?;
        if category == ArchOp::EXIT_OP {
            return Err(Error::invariant(cycle, format!("issue: {instr} must retire in decode")));
        }
        if category.is_memory() {
            return Ok(targets
                .ldst
                .behind()
                .ready_for_push()
                .then_some(Route::LoadStore));
        }
        if !targets.execute.behind().ready_for_push() {
            return Ok(None);
        }
        Ok(targets
            .execute
            .free_sub_unit(category)
            .map(|name| Route::SubUnit(name.to_string())))
    }

    /// Fills the per-lane operands from the register files.
    fn read_operands(instr: &mut Instruction, registers: &Registers<'_>) -> Result<(), Error> {
        let warp_id = instr.warp_id;
        instr.pred = registers
            .preds
            .read_predicate(true, warp_id, instr.src_pred, false)
            .unwrap_or_default();
        instr.rdat1 = match instr.op {
            Op::C(C_Op::CSRR) => registers.csrs.read(instr.imm as u32, warp_id)?,
            // the tested predicate travels as a lane mask
            Op::P(P_Op::JPNZ | P_Op::PRR) => {
                let mask = registers
                    .preds
                    .read_predicate(true, warp_id, instr.rs1, false)
                    .unwrap_or_default();
                [warp::mask_to_bits(&mask); WARP_SIZE]
            }
            Op::U(U_Op::AUIPC) => [0; WARP_SIZE],
            Op::U(_) => registers.regs.read_warp(warp_id, instr.rd),
            _ => registers.regs.read_warp(warp_id, instr.rs1),
        };
        instr.rdat2 = match instr.op.instr_type() {
            Some(InstrType::R | InstrType::S | InstrType::B) => {
                registers.regs.read_warp(warp_id, instr.rs2)
            }
            Some(InstrType::I) => [instr.imm as u32; WARP_SIZE],
            _ => [0; WARP_SIZE],
        };
        Ok(())
    }

    fn drop_stale_heads<S: SquashView + ?Sized>(
        &mut self,
        warps: &S,
        drain: &mut ForwardingIf<Vec<Drained>>,
        cycle: u64,
    ) {
        for ibuffer in &mut self.ibuffers {
            while ibuffer
                .snoop()
                .is_some_and(|instr| warps.is_stale(instr.group_id, instr.uid))
            {
                if let Some(instr) = ibuffer.pop() {
                    log::debug!("cycle {:03} issue: drop stale {}", cycle, instr);
                    drain.append(Drained {
                        group_id: instr.group_id,
                        uid: instr.uid,
                        retired: false,
                    });
                }
            }
        }
    }

    fn dispatch<S: SquashView + ?Sized>(
        &mut self,
        targets: &mut Targets<'_>,
        scoreboard: &mut Scoreboard,
        registers: &Registers<'_>,
        warps: &S,
        cycle: u64,
    ) -> Result<(), Error> {
        let mut hazard = false;
        let mut busy = false;
        for group_id in ordering::round_robin(self.next_group, self.ibuffers.len()) {
            let Some(head) = self.ibuffers[group_id].snoop() else {
                continue;
            };
            if warps.has_older_jump(head.group_id, head.uid)
                || scoreboard.has_collision(head.warp_id, head)
            {
                log::trace!("cycle {:03} issue: hazard on {}", cycle, head);
                hazard = true;
                continue;
            }
            let Some(route) = Self::route(head, targets, cycle)? else {
                busy = true;
                continue;
            };
            let Some(mut instr) = self.ibuffers[group_id].pop() else {
                continue;
            };
            Self::read_operands(&mut instr, registers)?;
            scoreboard.reserve_all(&instr, cycle)?;
            instr.mark_issue(cycle);
            instr.mark_stage_exit(STAGE, cycle);
            let latch = match route {
                Route::SubUnit(name) => {
                    instr.intended_fsu = Some(name);
                    targets.execute.behind_mut()
                }
                Route::LoadStore => {
                    instr.intended_fsu = Some(load_store::NAME.to_string());
                    targets.ldst.behind_mut()
                }
            };
            log::debug!(
                "{}",
                style(format!(
                    "cycle {:03} issue: {} to {}",
                    cycle,
                    instr,
                    instr.intended_fsu.as_deref().unwrap_or("?")
                ))
                .yellow()
            );
            latch.push_or_fail(instr, STAGE, cycle)?;
            self.num_issued += 1;
            self.next_group = group_id + 1;
            return Ok(());
        }
        if hazard {
            self.hazard_stalls += 1;
        } else if busy {
            self.unit_busy_stalls += 1;
        }
        Ok(())
    }

    fn accept<S: SquashView + ?Sized>(
        &mut self,
        warps: &S,
        drain: &mut ForwardingIf<Vec<Drained>>,
        cycle: u64,
    ) -> Result<(), Error> {
        let Some((group_id, uid)) = self
            .behind
            .snoop()
            .map(|instr| (instr.group_id, instr.uid))
        else {
            return Ok(());
        };
        if warps.is_stale(group_id, uid) {
            let instr = self.behind.pop_or_fail(STAGE, cycle)?;
            log::debug!("cycle {:03} issue: drop stale {}", cycle, instr);
            drain.append(Drained {
                group_id,
                uid,
                retired: false,
            });
            return Ok(());
        }
        let ibuffer = self
            .ibuffers
            .get_mut(group_id)
            .ok_or_else(|| Error::invariant(cycle, format!("issue: no buffer for group {group_id}")))?;
        if ibuffer.is_full() {
            return Ok(());
        }
        let mut instr = self.behind.pop_or_fail(STAGE, cycle)?;
        instr.mark_stage_enter(STAGE, cycle);
        ibuffer.push(instr)
    }

    #[tracing::instrument(name = "issue", skip_all)]
    pub fn cycle<S: SquashView + ?Sized>(
        &mut self,
        mut targets: Targets<'_>,
        scoreboard: &mut Scoreboard,
        registers: Registers<'_>,
        warps: &S,
        drain: &mut ForwardingIf<Vec<Drained>>,
        cycle: u64,
    ) -> Result<(), Error> {
        self.drop_stale_heads(warps, drain, cycle);
        self.dispatch(&mut targets, scoreboard, &registers, warps, cycle)?;
        self.accept(warps, drain, cycle)?;
        self.ibuffer_full.push(
            self.ibuffers
                .iter()
                .map(|ibuffer| ibuffer.free_slots() < 2)
                .collect(),
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Issue, Registers, Targets};
    use crate::{
        config,
        execute::ExecuteStage,
        func_unit::{ArithmeticFunctionalUnit, LoadStoreUnit},
        instruction::{encode, Instruction},
        latch::ForwardingIf,
        opcodes::{C_Op, I_Op, J_Op, Op, P_Op, R_Op},
        register_file::{CsrFile, PredicateRegisterFile, RegisterFile},
        scoreboard::{Access, Scoreboard, Slot},
        warp::{self, Drained, NoSquash, SquashView, WarpGroup, WARP_SIZE},
    };
    use color_eyre::eyre;

    #[derive(Debug)]
    struct Harness {
        issue: Issue,
        execute: ExecuteStage,
        ldst: LoadStoreUnit,
        scoreboard: Scoreboard,
        regs: RegisterFile,
        preds: PredicateRegisterFile,
        csrs: CsrFile,
        drain: ForwardingIf<Vec<Drained>>,
    }

    impl Harness {
        fn new() -> Self {
            let core = config::Core::default();
            Self {
                issue: Issue::new(&core),
                execute: ExecuteStage::new(vec![ArithmeticFunctionalUnit::int(
                    0,
                    &config::Latencies::default(),
                )]),
                ldst: LoadStoreUnit::new(2, 128),
                scoreboard: Scoreboard::new(core.num_warps),
                regs: RegisterFile::new(core.warps_per_group, core.num_warps, core.regs_per_warp),
                preds: PredicateRegisterFile::new(core.preds_per_warp, core.num_warps),
                csrs: CsrFile {
                    block_dim: 128,
                    ..CsrFile::default()
                },
                drain: ForwardingIf::new("drain"),
            }
        }

        fn step<S: SquashView + ?Sized>(&mut self, warps: &S, cycle: u64) -> eyre::Result<()> {
            let targets = Targets {
                execute: &mut self.execute,
                ldst: &mut self.ldst,
            };
            let registers = Registers {
                regs: &self.regs,
                preds: &self.preds,
                csrs: &self.csrs,
            };
            self.issue.cycle(
                targets,
                &mut self.scoreboard,
                registers,
                warps,
                &mut self.drain,
                cycle,
            )?;
            Ok(())
        }
    }

    fn decoded(uid: u64, warp_id: usize, raw: u32) -> Instruction {
        let mut instr = Instruction::fetch(uid, 0x20, warp_id, warp_id / 2);
        instr.decode(raw).unwrap();
        instr
    }

    #[test]
    fn reads_operands_and_reserves_destination() -> eyre::Result<()> {
        let mut h = Harness::new();
        for lane in 0..WARP_SIZE {
            h.regs.write_thread(1, 4, lane, lane as u32);
            h.regs.write_thread(1, 5, lane, 100);
        }
        h.preds.write_predicate(true, 1, 2, warp::mask_from_bits(0xF0));
        let add = decoded(0, 1, encode(Op::R(R_Op::ADD), 3, 4, 5, 2));
        h.issue.behind_mut().push(add).unwrap();

        h.step(&NoSquash, 0)?;
        assert!(!h.execute.behind().is_valid(), "buffered, not yet issued");
        h.step(&NoSquash, 1)?;

        let issued = h.execute.behind().snoop().unwrap();
        assert_eq!(issued.intended_fsu.as_deref(), Some("alu_int_0"));
        assert_eq!(issued.rdat1[7], 7);
        assert_eq!(issued.rdat2[7], 100);
        assert_eq!(warp::mask_to_bits(&issued.pred), 0xF0);
        assert_eq!(issued.timing.issue, Some(1));
        assert!(h.scoreboard.pending_writes(1).contains(&Slot::Reg(3)));
        assert_eq!(h.issue.num_issued(), 1);
        Ok(())
    }

    #[test]
    fn immediate_is_second_operand() -> eyre::Result<()> {
        let mut h = Harness::new();
        let addi = decoded(0, 0, encode(Op::I(I_Op::ADDI), 1, 2, 0x3E, 0));
        h.issue.behind_mut().push(addi).unwrap();
        h.step(&NoSquash, 0)?;
        h.step(&NoSquash, 1)?;
        let issued = h.execute.behind().snoop().unwrap();
        assert_eq!(issued.rdat2, [(-2_i32) as u32; WARP_SIZE]);
        Ok(())
    }

    #[test]
    fn hazard_holds_instruction() -> eyre::Result<()> {
        let mut h = Harness::new();
        h.scoreboard.reserve(0, Slot::Reg(3), 0)?;
        let reader = decoded(0, 0, encode(Op::R(R_Op::ADD), 4, 3, 0, 0));
        h.issue.behind_mut().push(reader).unwrap();
        for cycle in 0..3 {
            h.step(&NoSquash, cycle)?;
        }
        assert!(!h.execute.behind().is_valid());
        assert_eq!(h.issue.hazard_stalls(), 2);

        h.scoreboard.release(0, Slot::Reg(3));
        h.step(&NoSquash, 3)?;
        assert!(h.execute.behind().is_valid());
        Ok(())
    }

    #[test]
    fn memory_operations_go_to_load_store_unit() -> eyre::Result<()> {
        let mut h = Harness::new();
        let load = decoded(0, 0, encode(Op::I(I_Op::LW), 2, 1, 0, 0));
        h.issue.behind_mut().push(load).unwrap();
        h.step(&NoSquash, 0)?;
        h.step(&NoSquash, 1)?;
        let issued = h.ldst.behind().snoop().unwrap();
        assert_eq!(issued.intended_fsu.as_deref(), Some("ldst"));
        assert!(!h.execute.behind().is_valid());
        Ok(())
    }

    #[test]
    fn busy_unit_stalls_dispatch() -> eyre::Result<()> {
        let mut h = Harness::new();
        let first = decoded(0, 0, encode(Op::R(R_Op::ADD), 1, 0, 0, 0));
        let second = decoded(1, 2, encode(Op::R(R_Op::ADD), 1, 0, 0, 0));
        h.issue.behind_mut().push(first).unwrap();
        h.step(&NoSquash, 0)?;
        h.issue.behind_mut().push(second).unwrap();
        h.step(&NoSquash, 1)?;
        // IS_EX still holds the first add
        h.step(&NoSquash, 2)?;
        assert_eq!(h.issue.unit_busy_stalls(), 1);
        assert_eq!(h.execute.behind_mut().pop().map(|instr| instr.uid), Some(0));
        h.step(&NoSquash, 3)?;
        assert_eq!(h.execute.behind().snoop().map(|instr| instr.uid), Some(1));
        Ok(())
    }

    #[test]
    fn csr_and_predicate_operands() -> eyre::Result<()> {
        let mut h = Harness::new();
        h.preds.write_predicate(true, 0, 5, warp::mask_from_bits(0b1010));
        let csrr = decoded(0, 0, encode(Op::C(C_Op::CSRR), 1, 0, 0, 0));
        h.issue.behind_mut().push(csrr).unwrap();
        h.step(&NoSquash, 0)?;
        h.step(&NoSquash, 1)?;
        let issued = h.execute.behind_mut().pop().unwrap();
        assert_eq!(issued.rdat1[3], 3, "thread id of lane 3 in warp 0");

        let prr = decoded(1, 0, encode(Op::P(P_Op::PRR), 2, 5, 0, 0));
        h.issue.behind_mut().push(prr).unwrap();
        h.step(&NoSquash, 2)?;
        h.step(&NoSquash, 3)?;
        let issued = h.execute.behind_mut().pop().unwrap();
        assert_eq!(issued.rdat1, [0b1010; WARP_SIZE]);
        Ok(())
    }

    #[test]
    fn younger_instructions_wait_for_jump() -> eyre::Result<()> {
        let mut h = Harness::new();
        let mut groups = vec![WarpGroup::new(0, 0), WarpGroup::new(1, 0)];
        groups[0].in_flight.extend([0, 1, 2]);
        groups[0].pending_jumps.insert(0, 1);
        let younger = decoded(2, 0, encode(Op::R(R_Op::ADD), 1, 0, 0, 0));
        h.issue.behind_mut().push(younger).unwrap();
        for cycle in 0..3 {
            h.step(groups.as_slice(), cycle)?;
        }
        assert!(!h.execute.behind().is_valid());

        // the jump resolved and squashed everything after uid 1
        groups[0].pending_jumps.clear();
        groups[0].squash_after = Some(1);
        h.step(groups.as_slice(), 3)?;
        assert!(h.issue.is_idle());
        assert!(!h.execute.behind().is_valid());
        assert_eq!(h.drain.pop().map(|drained| drained.len()), Some(1));
        Ok(())
    }

    #[test]
    fn signals_full_buffers() -> eyre::Result<()> {
        let mut h = Harness::new();
        // every jump links into r9, which stays reserved
        h.scoreboard.reserve(0, Slot::Reg(9), 0)?;
        for uid in 0..3 {
            let jal = decoded(uid, 0, encode(Op::J(J_Op::JAL), 9, 0, 0, 0));
            h.issue.behind_mut().push(jal).unwrap();
            h.step(&NoSquash, uid)?;
        }
        assert_eq!(h.issue.ibuffers()[0].len(), 3);
        assert_eq!(h.issue.ibuffer_full().snoop(), Some(&vec![true, false]));
        Ok(())
    }
}
