use crate::{
    config,
    instruction::Instruction,
    latch::{ForwardingIf, Latch},
    scheduler::DecodeEvent,
    warp::{self, Drained, SquashView},
    Error,
};
use console::style;

pub const STAGE: &str = "decode";

/// Decode stage.
///
/// Takes fetched instructions with their cache block from `IC_ID`, decodes
/// the instruction word and forwards the result to issue. Halts never leave
/// decode: once every older instruction of the group has drained they are
/// reported to the scheduler and retire here.
#[derive(Debug)]
pub struct Decode {
    config: config::Core,
    behind: Latch<Instruction>,
    events: ForwardingIf<Vec<DecodeEvent>>,
    num_decoded: u64,
    halt_wait_cycles: u64,
}

fn check_operands(config: &config::Core, instr: &Instruction) -> Result<(), Error> {
    let regs = instr.inputs().into_iter().chain(instr.outputs());
    if let Some(reg) = regs.into_iter().find(|reg| *reg >= config.regs_per_warp) {
        return Err(Error::RegisterOutOfRange { reg, pc: instr.pc });
    }
    let preds = instr
        .predicate_inputs()
        .into_iter()
        .chain(instr.predicate_output());
    if let Some(pred) = preds.into_iter().find(|pred| *pred >= config.preds_per_warp) {
        return Err(Error::PredicateOutOfRange { pred, pc: instr.pc });
    }
    Ok(())
}

impl Decode {
    #[must_use]
    pub fn new(config: config::Core) -> Self {
        Self {
            config,
            behind: Latch::new("IC_ID"),
            events: ForwardingIf::new("decode_events"),
            num_decoded: 0,
            halt_wait_cycles: 0,
        }
    }

    #[must_use]
    pub fn behind(&self) -> &Latch<Instruction> {
        &self.behind
    }

    pub fn behind_mut(&mut self) -> &mut Latch<Instruction> {
        &mut self.behind
    }

    pub fn events_mut(&mut self) -> &mut ForwardingIf<Vec<DecodeEvent>> {
        &mut self.events
    }

    #[must_use]
    pub fn num_decoded(&self) -> u64 {
        self.num_decoded
    }

    #[must_use]
    pub fn halt_wait_cycles(&self) -> u64 {
        self.halt_wait_cycles
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.behind.is_valid()
    }

    /// Decodes the instruction waiting in `IC_ID` in place.
    fn decode_head(&mut self, cycle: u64) -> Result<(), Error> {
        let Self { config, behind, .. } = self;
        let Some(instr) = behind.snoop_mut() else {
            return Ok(());
        };
        if instr.raw.is_some() {
            return Ok(());
        }
        instr.mark_stage_enter(STAGE, cycle);
        let raw = instr.word_from_block().ok_or_else(|| {
            Error::invariant(cycle, format!("decode: {instr} arrived without its cache block"))
        })?;
        instr.decode(raw)?;
        check_operands(config, instr)?;
        self.num_decoded += 1;
        Ok(())
    }

    #[tracing::instrument(name = "decode", skip_all)]
    pub fn cycle<S: SquashView + ?Sized>(
        &mut self,
        ahead: &mut Latch<Instruction>,
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
            log::debug!("cycle {:03} decode: drop stale {}", cycle, instr);
            drain.append(Drained {
                group_id,
                uid,
                retired: false,
            });
            return Ok(());
        }

        self.decode_head(cycle)?;
        let is_halt = self.behind.snoop().is_some_and(|instr| instr.op.is_halt());

        if is_halt {
            if warps.has_older_in_flight(group_id, uid) {
                self.halt_wait_cycles += 1;
                return Ok(());
            }
            let mut instr = self.behind.pop_or_fail(STAGE, cycle)?;
            instr.mark_stage_exit(STAGE, cycle);
            instr.mark_writeback(cycle);
            log::debug!(
                "{}",
                style(format!("cycle {cycle:03} decode: halt {instr}")).red()
            );
            self.events.append(DecodeEvent::Halt {
                group_id,
                horizon: warp::pair_horizon(uid, instr.warp_id, self.config.warps_per_group),
            });
            drain.append(Drained {
                group_id,
                uid,
                retired: true,
            });
            return Ok(());
        }

        if !ahead.ready_for_push() {
            return Ok(());
        }
        let mut instr = self.behind.pop_or_fail(STAGE, cycle)?;
        if instr.end_of_packet {
            self.events.append(DecodeEvent::EndOfPacket { group_id });
        }
        if instr.op.is_jump() {
            self.events.append(DecodeEvent::Jump {
                group_id,
                uid,
                horizon: warp::pair_horizon(uid, instr.warp_id, self.config.warps_per_group),
            });
        }
        instr.mark_stage_exit(STAGE, cycle);
        log::debug!(
            "{}",
            style(format!("cycle {cycle:03} decode: {instr}")).blue()
        );
        ahead.push_or_fail(instr, STAGE, cycle)
    }
}

#[cfg(test)]
mod tests {
    use super::Decode;
    use crate::{
        config,
        instruction::{encode, fields, Instruction},
        latch::{ForwardingIf, Latch},
        opcodes::{H_Op, J_Op, Op, R_Op},
        scheduler::DecodeEvent,
        warp::{NoSquash, WarpGroup},
    };
    use color_eyre::eyre;

    fn fetched(uid: u64, warp_id: usize, raw: u32) -> Instruction {
        let mut instr = Instruction::fetch(uid, 0x14, warp_id, warp_id / 2);
        let block = [0u32, raw]
            .iter()
            .flat_map(|word| word.to_le_bytes())
            .collect();
        instr.block = Some((0x10, block));
        instr
    }

    #[test]
    fn decodes_and_forwards() -> eyre::Result<()> {
        let mut decode = Decode::new(config::Core::default());
        let mut ahead = Latch::new("ID_IS");
        let mut drain = ForwardingIf::new("drain");
        let raw = encode(Op::R(R_Op::SUB), 3, 4, 5, 2);
        decode.behind_mut().push(fetched(0, 0, raw)).unwrap();
        decode.cycle(&mut ahead, &NoSquash, &mut drain, 0)?;
        let instr = ahead.pop().unwrap();
        assert_eq!(instr.op, Op::R(R_Op::SUB));
        assert_eq!((instr.rd, instr.rs1, instr.rs2, instr.src_pred), (3, 4, 5, 2));
        assert!(decode.is_idle());
        assert!(decode.events_mut().pop().is_none());
        Ok(())
    }

    #[test]
    fn stalls_while_issue_is_busy() -> eyre::Result<()> {
        let mut decode = Decode::new(config::Core::default());
        let mut ahead = Latch::new("ID_IS");
        let mut drain = ForwardingIf::new("drain");
        ahead.push(Instruction::fetch(9, 0, 0, 0)).unwrap();
        decode
            .behind_mut()
            .push(fetched(0, 0, encode(Op::R(R_Op::ADD), 1, 2, 3, 0)))
            .unwrap();
        decode.cycle(&mut ahead, &NoSquash, &mut drain, 0)?;
        assert!(decode.behind().is_valid());
        assert_eq!(ahead.pop().map(|instr| instr.uid), Some(9));
        decode.cycle(&mut ahead, &NoSquash, &mut drain, 1)?;
        assert_eq!(ahead.pop().map(|instr| instr.uid), Some(0));
        assert_eq!(decode.num_decoded(), 1);
        Ok(())
    }

    #[test]
    fn undefined_opcode_is_fatal() {
        let mut decode = Decode::new(config::Core::default());
        let mut ahead = Latch::new("ID_IS");
        let mut drain = ForwardingIf::new("drain");
        decode.behind_mut().push(fetched(0, 0, 0b111_0000)).unwrap();
        let err = decode.cycle(&mut ahead, &NoSquash, &mut drain, 0).unwrap_err();
        assert!(err.to_string().contains("undefined opcode"), "{err}");
    }

    #[test]
    fn register_out_of_range_is_fatal() {
        let mut decode = Decode::new(config::Core {
            regs_per_warp: 8,
            ..config::Core::default()
        });
        let mut ahead = Latch::new("ID_IS");
        let mut drain = ForwardingIf::new("drain");
        let raw = encode(Op::R(R_Op::ADD), 9, 1, 2, 0);
        decode.behind_mut().push(fetched(0, 0, raw)).unwrap();
        assert!(decode.cycle(&mut ahead, &NoSquash, &mut drain, 0).is_err());
    }

    #[test]
    fn drops_stale_instruction() -> eyre::Result<()> {
        let mut decode = Decode::new(config::Core::default());
        let mut ahead = Latch::new("ID_IS");
        let mut drain = ForwardingIf::new("drain");
        let mut groups = vec![WarpGroup::new(0, 0)];
        groups[0].squash_after = Some(1);
        decode
            .behind_mut()
            .push(fetched(2, 0, encode(Op::R(R_Op::ADD), 1, 2, 3, 0)))
            .unwrap();
        decode.cycle(&mut ahead, groups.as_slice(), &mut drain, 0)?;
        assert!(!ahead.is_valid());
        let drained = drain.pop().unwrap();
        assert_eq!(drained.len(), 1);
        assert!(!drained[0].retired);
        Ok(())
    }

    #[test]
    fn halt_waits_for_older_instructions() -> eyre::Result<()> {
        let mut decode = Decode::new(config::Core::default());
        let mut ahead = Latch::new("ID_IS");
        let mut drain = ForwardingIf::new("drain");
        let mut groups = vec![WarpGroup::new(0, 0)];
        groups[0].in_flight.extend([0, 1]);
        let halt = encode(Op::H(H_Op::HALT), 0, 0, 0, 0);
        decode.behind_mut().push(fetched(1, 1, halt)).unwrap();

        decode.cycle(&mut ahead, groups.as_slice(), &mut drain, 0)?;
        assert!(decode.behind().is_valid());
        assert_eq!(decode.halt_wait_cycles(), 1);

        groups[0].in_flight.remove(&0);
        decode.cycle(&mut ahead, groups.as_slice(), &mut drain, 1)?;
        assert!(decode.is_idle());
        assert!(!ahead.is_valid());
        utils::diff::assert_eq!(
            have: decode.events_mut().pop(),
            want: Some(vec![DecodeEvent::Halt { group_id: 0, horizon: 1 }])
        );
        assert!(drain.pop().is_some_and(|drained| drained[0].retired));
        Ok(())
    }

    #[test]
    fn reports_jumps_and_end_of_packet() -> eyre::Result<()> {
        let mut decode = Decode::new(config::Core::default());
        let mut ahead = Latch::new("ID_IS");
        let mut drain = ForwardingIf::new("drain");
        let jal = encode(Op::J(J_Op::JAL), 1, 0, 0, 0) | 1 << fields::END_OF_PACKET_BIT;
        decode.behind_mut().push(fetched(4, 2, jal)).unwrap();
        decode.cycle(&mut ahead, &NoSquash, &mut drain, 0)?;
        assert!(ahead.pop().is_some());
        utils::diff::assert_eq!(
            have: decode.events_mut().pop(),
            want: Some(vec![
                DecodeEvent::EndOfPacket { group_id: 1 },
                DecodeEvent::Jump { group_id: 1, uid: 4, horizon: 5 },
            ])
        );
        Ok(())
    }
}
