//! Vector register file, predicate register file and control status registers.

use crate::warp::{self, ActiveMask, Lanes, WARP_SIZE};
use bitvec::array::BitArray;
use ndarray::Array4;

/// Per-lane general purpose registers.
///
/// Storage is laid out as `[bank][warp-group][register][lane]`. Warp `w`
/// lives in bank `w % banks` of group `w / banks`, so the warps of one
/// group never contend for the same bank.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    banks: usize,
    regs: Array4<u32>,
}

impl RegisterFile {
    #[must_use]
    pub fn new(banks: usize, num_warps: usize, regs_per_warp: usize) -> Self {
        assert!(banks > 0, "register file needs at least one bank");
        let groups = num_warps.div_ceil(banks);
        Self {
            banks,
            regs: Array4::zeros((banks, groups, regs_per_warp, WARP_SIZE)),
        }
    }

    #[must_use]
    pub fn banks(&self) -> usize {
        self.banks
    }

    #[must_use]
    pub fn regs_per_warp(&self) -> usize {
        self.regs.dim().2
    }

    /// Register bank serving `warp_id`.
    #[must_use]
    pub fn bank_of(&self, warp_id: usize) -> usize {
        warp_id % self.banks
    }

    #[inline]
    fn locate(&self, warp_id: usize) -> (usize, usize) {
        (warp_id % self.banks, warp_id / self.banks)
    }

    #[must_use]
    pub fn read_warp(&self, warp_id: usize, reg: usize) -> Lanes {
        let (bank, group) = self.locate(warp_id);
        let mut lanes = [0; WARP_SIZE];
        for (lane, value) in lanes.iter_mut().enumerate() {
            *value = self.regs[[bank, group, reg, lane]];
        }
        lanes
    }

    #[must_use]
    pub fn read_thread(&self, warp_id: usize, reg: usize, lane: usize) -> u32 {
        let (bank, group) = self.locate(warp_id);
        self.regs[[bank, group, reg, lane]]
    }

    /// Writes all lanes of `reg`. Writes to register 0 are dropped.
    pub fn write_warp(&mut self, warp_id: usize, reg: usize, values: &Lanes) {
        if reg == 0 {
            return;
        }
        let (bank, group) = self.locate(warp_id);
        for (lane, value) in values.iter().enumerate() {
            self.regs[[bank, group, reg, lane]] = *value;
        }
    }

    /// Writes one lane of `reg`. Writes to register 0 are dropped.
    pub fn write_thread(&mut self, warp_id: usize, reg: usize, lane: usize, value: u32) {
        if reg == 0 {
            return;
        }
        let (bank, group) = self.locate(warp_id);
        self.regs[[bank, group, reg, lane]] = value;
    }

    /// Writes the lanes of `reg` selected by `mask`.
    pub fn write_masked(&mut self, warp_id: usize, reg: usize, values: &Lanes, mask: &ActiveMask) {
        for lane in mask.iter_ones() {
            self.write_thread(warp_id, reg, lane, values[lane]);
        }
    }
}

/// One predicate slot, stored in both polarities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Predicate {
    pub value: ActiveMask,
    pub negated: ActiveMask,
}

impl Predicate {
    #[must_use]
    pub fn new(value: ActiveMask) -> Self {
        Self {
            value,
            negated: !value,
        }
    }
}

impl Default for Predicate {
    fn default() -> Self {
        Self::new(BitArray::ZERO)
    }
}

/// Per-warp predicate slots.
///
/// Slot 0 starts out with every lane enabled so unpredicated code runs on all
/// lanes.
#[derive(Debug, Clone)]
pub struct PredicateRegisterFile {
    preds: Vec<Box<[Predicate]>>,
}

impl PredicateRegisterFile {
    #[must_use]
    pub fn new(num_preds_per_warp: usize, num_warps: usize) -> Self {
        let preds = (0..num_warps)
            .map(|_| {
                let mut slots = utils::box_slice![Predicate::default(); num_preds_per_warp];
                if let Some(p0) = slots.first_mut() {
                    *p0 = Predicate::new(warp::full_mask());
                }
                slots
            })
            .collect();
        Self { preds }
    }

    #[must_use]
    pub fn num_preds_per_warp(&self) -> usize {
        self.preds.first().map_or(0, |slots| slots.len())
    }

    /// Reads one polarity of a predicate slot.
    ///
    /// Returns `None` when `enable` is low so callers cannot consume stale data.
    #[must_use]
    pub fn read_predicate(
        &self,
        enable: bool,
        warp_id: usize,
        pred: usize,
        negate: bool,
    ) -> Option<ActiveMask> {
        if !enable {
            return None;
        }
        let slot = &self.preds[warp_id][pred];
        Some(if negate { slot.negated } else { slot.value })
    }

    /// Writes a predicate slot and its negation in one step.
    pub fn write_predicate(&mut self, enable: bool, warp_id: usize, pred: usize, data: ActiveMask) {
        if !enable {
            return;
        }
        self.preds[warp_id][pred] = Predicate::new(data);
        log::trace!(
            "predicate: warp {} p{} <= {:#010x}",
            warp_id,
            pred,
            warp::mask_to_bits(&data)
        );
    }

    /// Sets a single lane of a predicate slot.
    pub fn write_thread(&mut self, warp_id: usize, pred: usize, lane: usize, value: bool) {
        let mut data = self.preds[warp_id][pred].value;
        data.set(lane, value);
        self.preds[warp_id][pred] = Predicate::new(data);
    }

    #[must_use]
    pub fn slot(&self, warp_id: usize, pred: usize) -> &Predicate {
        &self.preds[warp_id][pred]
    }
}

/// Control status registers readable with `CSRR`.
#[derive(Debug, strum::FromRepr, strum::Display, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Csr {
    THREAD_ID = 0x000,
    BLOCK_ID = 0x001,
    BLOCK_DIM = 0x002,
    ARG_PTR = 0x003,
}

/// Launch parameters backing the control status registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CsrFile {
    pub block_id: u32,
    pub block_dim: u32,
    pub arg_ptr: u32,
}

impl CsrFile {
    pub fn read(&self, csr: u32, warp_id: usize) -> Result<Lanes, crate::Error> {
        let csr = Csr::from_repr(csr).ok_or(crate::Error::UnmappedCsr(csr))?;
        let mut lanes = [0; WARP_SIZE];
        for (lane, value) in lanes.iter_mut().enumerate() {
            *value = match csr {
                Csr::THREAD_ID => (warp_id * WARP_SIZE + lane) as u32,
                Csr::BLOCK_ID => self.block_id,
                Csr::BLOCK_DIM => self.block_dim,
                Csr::ARG_PTR => self.arg_ptr,
            };
        }
        Ok(lanes)
    }
}
