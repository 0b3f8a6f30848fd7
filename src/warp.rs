use bitvec::{array::BitArray, BitArr};
use std::collections::{BTreeMap, BTreeSet};

/// Warp size.
///
/// Number of lanes (threads) per warp.
pub const WARP_SIZE: usize = 32;

/// Lane active mask.
///
/// Bitmask where a 1 at position i means that lane i is active for the current instruction.
pub type ActiveMask = BitArr!(for WARP_SIZE, in u32);

/// One 32-bit word per lane.
pub type Lanes = [u32; WARP_SIZE];

#[must_use]
pub fn mask_from_bits(bits: u32) -> ActiveMask {
    BitArray::new([bits])
}

#[must_use]
pub fn mask_to_bits(mask: &ActiveMask) -> u32 {
    mask.into_inner()[0]
}

#[must_use]
pub fn full_mask() -> ActiveMask {
    mask_from_bits(u32::MAX)
}

/// Lifecycle of a warp-group as tracked by the scheduler.
#[derive(Debug, strum::Display, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
pub enum WarpState {
    RUNNING,
    STALLED_ICACHE,
    STALLED_IBUFFER_FULL,
    BRANCH_PENDING,
    HALTED,
}

/// Warp table entry.
///
/// A warp-group holds `warps_per_group` warps that share one program counter
/// and are fetched back to back, one warp per register bank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WarpGroup {
    pub group_id: usize,
    pub pc: u32,
    pub state: WarpState,
    /// Uids of fetched but not yet retired or dropped instructions.
    pub in_flight: BTreeSet<u64>,
    /// Set by an end-of-packet marker, blocks fetching until `in_flight` drains.
    pub end_of_packet: bool,
    /// Index of the warp within the group that is fetched next.
    pub next_warp: usize,
    /// Instructions of this group fetched after this uid are stale.
    pub squash_after: Option<u64>,
    /// Decoded but not yet drained jumps, uid to squash horizon.
    pub pending_jumps: BTreeMap<u64, u64>,
}

impl WarpGroup {
    #[must_use]
    pub fn new(group_id: usize, pc: u32) -> Self {
        Self {
            group_id,
            pc,
            state: WarpState::RUNNING,
            in_flight: BTreeSet::new(),
            end_of_packet: false,
            next_warp: 0,
            squash_after: None,
            pending_jumps: BTreeMap::new(),
        }
    }

    /// Whether the scheduler may fetch for this group this cycle.
    #[must_use]
    pub fn can_fetch(&self) -> bool {
        self.state == WarpState::RUNNING && !self.end_of_packet
    }

    #[must_use]
    pub fn is_halted(&self) -> bool {
        self.state == WarpState::HALTED
    }

    #[must_use]
    pub fn is_stale(&self, uid: u64) -> bool {
        self.squash_after.is_some_and(|horizon| uid > horizon)
    }

    /// Whether an instruction fetched before `uid` is still in flight.
    #[must_use]
    pub fn has_older_in_flight(&self, uid: u64) -> bool {
        self.in_flight.range(..uid).next().is_some()
    }

    /// Whether an older unresolved jump may still squash `uid`.
    #[must_use]
    pub fn has_older_jump(&self, uid: u64) -> bool {
        self.pending_jumps
            .range(..uid)
            .any(|(_, horizon)| *horizon < uid)
    }
}

/// Last uid of the fetch pair containing `uid`.
///
/// The warps of a group are fetched back to back with consecutive uids, so a
/// jump or halt from warp index `k` keeps the `warps_per_group - 1 - k` younger
/// siblings of its own pair alive.
#[must_use]
pub fn pair_horizon(uid: u64, warp_id: usize, warps_per_group: usize) -> u64 {
    let index = warp_id % warps_per_group;
    uid + (warps_per_group - 1 - index) as u64
}

impl std::fmt::Display for WarpGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "group[{}](pc={:#06x}, {}, in_flight={})",
            self.group_id,
            self.pc,
            self.state,
            self.in_flight.len()
        )
    }
}

/// An instruction leaving the pipeline, retired or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Drained {
    pub group_id: usize,
    pub uid: u64,
    /// Committed, as opposed to dropped after a squash.
    pub retired: bool,
}

/// Read-only view of the warp table handed to stages that must drop stale work.
pub trait SquashView {
    #[must_use]
    fn is_stale(&self, group_id: usize, uid: u64) -> bool;

    /// Whether an instruction of `group_id` fetched before `uid` has not drained yet.
    #[must_use]
    fn has_older_in_flight(&self, group_id: usize, uid: u64) -> bool;

    #[must_use]
    fn has_older_jump(&self, group_id: usize, uid: u64) -> bool;
}

impl SquashView for [WarpGroup] {
    fn is_stale(&self, group_id: usize, uid: u64) -> bool {
        self.get(group_id)
            .is_some_and(|group| group.is_stale(uid))
    }

    fn has_older_in_flight(&self, group_id: usize, uid: u64) -> bool {
        self.get(group_id)
            .is_some_and(|group| group.has_older_in_flight(uid))
    }

    fn has_older_jump(&self, group_id: usize, uid: u64) -> bool {
        self.get(group_id)
            .is_some_and(|group| group.has_older_jump(uid))
    }
}

/// A view where nothing is ever stale or in flight, used to drive stages in isolation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSquash;

impl SquashView for NoSquash {
    fn is_stale(&self, _group_id: usize, _uid: u64) -> bool {
        false
    }

    fn has_older_in_flight(&self, _group_id: usize, _uid: u64) -> bool {
        false
    }

    fn has_older_jump(&self, _group_id: usize, _uid: u64) -> bool {
        false
    }
}
