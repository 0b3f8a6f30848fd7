use crate::instruction::Instruction;
use std::collections::HashSet;

/// Architectural storage tracked by the scoreboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Slot {
    Reg(usize),
    Pred(usize),
}

/// Scoreboard access.
///
/// The scoreboard keeps track of registers and predicate slots with pending
/// writes per warp.
pub trait Access<I> {
    /// Checks to see if registers used by an instruction are reserved in the scoreboard
    ///
    /// # Returns
    /// `true` if WAW or RAW hazard (no WAR since in-order issue)
    #[must_use]
    fn has_collision(&self, warp_id: usize, instr: &I) -> bool;

    /// Get all pending writes for a warp.
    #[must_use]
    fn pending_writes(&self, warp_id: usize) -> &HashSet<Slot>;

    /// Release a slot for a warp.
    fn release(&mut self, warp_id: usize, slot: Slot);

    /// Release all outputs of an instruction.
    fn release_all(&mut self, instr: &I);

    /// Reserve a slot for a warp.
    fn reserve(&mut self, warp_id: usize, slot: Slot, cycle: u64) -> Result<(), crate::Error>;

    /// Reserve all outputs of an instruction.
    fn reserve_all(&mut self, instr: &I, cycle: u64) -> Result<(), crate::Error>;
}

/// Per-warp pending write sets.
#[derive(Debug, Default, Clone)]
pub struct Scoreboard {
    pub warp_slots: Box<[HashSet<Slot>]>,
}

impl Scoreboard {
    #[must_use]
    pub fn new(num_warps: usize) -> Self {
        Self {
            warp_slots: utils::box_slice![HashSet::new(); num_warps],
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.warp_slots.iter().all(HashSet::is_empty)
    }
}

fn outputs(instr: &Instruction) -> impl Iterator<Item = Slot> {
    instr
        .outputs()
        .map(Slot::Reg)
        .into_iter()
        .chain(instr.predicate_output().map(Slot::Pred))
}

impl Access<Instruction> for Scoreboard {
    fn has_collision(&self, warp_id: usize, instr: &Instruction) -> bool {
        use itertools::Itertools;

        let Some(reserved) = self.warp_slots.get(warp_id) else {
            return false;
        };
        let mut used: HashSet<Slot> = outputs(instr).collect();
        used.extend(instr.inputs().into_iter().map(Slot::Reg));
        used.extend(instr.predicate_inputs().into_iter().map(Slot::Pred));

        log::trace!(
            "scoreboard: {} uses {:?}, warp {} has reserved {:?}",
            instr,
            used.iter().sorted().collect::<Vec<_>>(),
            warp_id,
            reserved.iter().sorted().collect::<Vec<_>>(),
        );
        used.intersection(reserved).next().is_some()
    }

    fn pending_writes(&self, warp_id: usize) -> &HashSet<Slot> {
        &self.warp_slots[warp_id]
    }

    fn release(&mut self, warp_id: usize, slot: Slot) {
        if self.warp_slots[warp_id].remove(&slot) {
            log::trace!("scoreboard: warp {} releases {:?}", warp_id, slot);
        }
    }

    fn release_all(&mut self, instr: &Instruction) {
        for slot in outputs(instr) {
            self.release(instr.warp_id, slot);
        }
    }

    fn reserve(&mut self, warp_id: usize, slot: Slot, cycle: u64) -> Result<(), crate::Error> {
        if !self.warp_slots[warp_id].insert(slot) {
            return Err(crate::Error::invariant(
                cycle,
                format!("warp {warp_id} reserved {slot:?} twice"),
            ));
        }
        log::trace!("scoreboard: warp {} reserves {:?}", warp_id, slot);
        Ok(())
    }

    fn reserve_all(&mut self, instr: &Instruction, cycle: u64) -> Result<(), crate::Error> {
        for slot in outputs(instr) {
            self.reserve(instr.warp_id, slot, cycle)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Access, Scoreboard, Slot};
    use crate::{
        instruction::{encode, Instruction},
        opcodes::{B_Op, Op, R_Op},
    };

    fn decoded(uid: u64, warp_id: usize, raw: u32) -> Instruction {
        let mut instr = Instruction::fetch(uid, 0, warp_id, warp_id / 2);
        instr.decode(raw).unwrap();
        instr
    }

    #[test]
    fn raw_and_waw_hazards() -> color_eyre::eyre::Result<()> {
        let mut scoreboard = Scoreboard::new(2);
        let producer = decoded(0, 0, encode(Op::R(R_Op::ADD), 3, 1, 2, 0));
        scoreboard.reserve_all(&producer, 0)?;

        let reader = decoded(1, 0, encode(Op::R(R_Op::ADD), 4, 3, 0, 0));
        let writer = decoded(2, 0, encode(Op::R(R_Op::SUB), 3, 5, 6, 0));
        let independent = decoded(3, 0, encode(Op::R(R_Op::ADD), 7, 5, 6, 0));
        let other_warp = decoded(4, 1, encode(Op::R(R_Op::ADD), 4, 3, 0, 0));
        assert!(scoreboard.has_collision(0, &reader));
        assert!(scoreboard.has_collision(0, &writer));
        assert!(!scoreboard.has_collision(0, &independent));
        assert!(!scoreboard.has_collision(1, &other_warp));

        scoreboard.release_all(&producer);
        assert!(!scoreboard.has_collision(0, &reader));
        assert!(scoreboard.is_empty());
        Ok(())
    }

    #[test]
    fn predicates_tracked_separately() -> color_eyre::eyre::Result<()> {
        let mut scoreboard = Scoreboard::new(1);
        // BEQ writes predicate slot 3, not register 3
        let compare = decoded(0, 0, encode(Op::B(B_Op::BEQ), 3, 1, 2, 0));
        scoreboard.reserve_all(&compare, 0)?;
        assert!(scoreboard.pending_writes(0).contains(&Slot::Pred(3)));

        let uses_r3 = decoded(1, 0, encode(Op::R(R_Op::ADD), 4, 3, 0, 0));
        let guarded_by_p3 = decoded(2, 0, encode(Op::R(R_Op::ADD), 4, 1, 0, 3));
        assert!(!scoreboard.has_collision(0, &uses_r3));
        assert!(scoreboard.has_collision(0, &guarded_by_p3));
        Ok(())
    }

    #[test]
    fn double_reservation_is_an_error() {
        let mut scoreboard = Scoreboard::new(1);
        scoreboard.reserve(0, Slot::Reg(5), 3).unwrap();
        let err = scoreboard.reserve(0, Slot::Reg(5), 17).unwrap_err();
        assert!(
            matches!(err, crate::Error::Invariant { cycle: 17, .. }),
            "{err}"
        );
    }
}
