pub mod ordering;

use crate::{
    config,
    icache::IHit,
    instruction::Instruction,
    latch::{ForwardingIf, Latch},
    warp::{Drained, WarpGroup, WarpState},
    Error,
};
use console::style;

pub const STAGE: &str = "scheduler";

/// Notification raised by decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DecodeEvent {
    /// The last instruction of a fetch packet was decoded.
    EndOfPacket { group_id: usize },
    /// A jump was decoded and may squash everything fetched after `horizon`.
    Jump {
        group_id: usize,
        uid: u64,
        horizon: u64,
    },
    Halt { group_id: usize, horizon: u64 },
}

/// Taken jump reported by writeback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Redirect {
    pub group_id: usize,
    pub target: u32,
    /// Instructions of the group fetched after this uid are squashed.
    pub horizon: u64,
}

/// Side-band signals the scheduler consumes every cycle.
#[derive(Debug)]
pub struct Signals<'a> {
    pub ihit: &'a ForwardingIf<IHit>,
    pub ibuffer_full: &'a ForwardingIf<Vec<bool>>,
    pub events: &'a mut ForwardingIf<Vec<DecodeEvent>>,
    pub redirects: &'a mut ForwardingIf<Vec<Redirect>>,
    pub drain: &'a mut ForwardingIf<Vec<Drained>>,
}

/// Warp-group scheduler.
///
/// Owns the warp table and is the only component mutating it. Every cycle it
/// applies the notices of the other stages and then fetches one warp of one
/// group into `SCHED_IC`. The warps of a group are fetched back to back at the
/// same pc before the group's pc advances.
#[derive(Debug)]
pub struct WarpScheduler {
    groups: Vec<WarpGroup>,
    warps_per_group: usize,
    /// Group that wins the next round robin tie.
    next_group: usize,
    next_uid: u64,
    num_retired: u64,
    num_squashed: u64,
    stats: stats::Scheduler,
}

impl WarpScheduler {
    #[must_use]
    pub fn new(config: &config::Core) -> Self {
        Self {
            groups: (0..config.num_groups())
                .map(|group_id| WarpGroup::new(group_id, config.start_pc))
                .collect(),
            warps_per_group: config.warps_per_group,
            next_group: 0,
            next_uid: 0,
            num_retired: 0,
            num_squashed: 0,
            stats: stats::Scheduler::default(),
        }
    }

    #[must_use]
    pub fn groups(&self) -> &[WarpGroup] {
        &self.groups
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Scheduler {
        &self.stats
    }

    #[must_use]
    pub fn num_retired(&self) -> u64 {
        self.num_retired
    }

    #[must_use]
    pub fn num_squashed(&self) -> u64 {
        self.num_squashed
    }

    #[must_use]
    pub fn all_halted(&self) -> bool {
        self.groups.iter().all(WarpGroup::is_halted)
    }

    fn group_mut(&mut self, group_id: usize, cycle: u64) -> Result<&mut WarpGroup, Error> {
        self.groups
            .get_mut(group_id)
            .ok_or_else(|| Error::invariant(cycle, format!("no warp-group {group_id}")))
    }

    fn apply_drains(&mut self, drained: Vec<Drained>, cycle: u64) -> Result<(), Error> {
        for Drained {
            group_id,
            uid,
            retired,
        } in drained
        {
            let group = self.group_mut(group_id, cycle)?;
            if !group.in_flight.remove(&uid) {
                return Err(Error::invariant(
                    cycle,
                    format!("uid {uid} drained but not in flight for group {group_id}"),
                ));
            }
            group.pending_jumps.remove(&uid);
            if retired {
                self.num_retired += 1;
            } else {
                self.num_squashed += 1;
            }
        }
        Ok(())
    }

    fn apply_events(&mut self, events: Vec<DecodeEvent>, cycle: u64) -> Result<(), Error> {
        for event in events {
            match event {
                DecodeEvent::EndOfPacket { group_id } => {
                    let group = self.group_mut(group_id, cycle)?;
                    if !group.end_of_packet && !group.is_halted() {
                        group.end_of_packet = true;
                        self.stats.num_end_of_packet += 1;
                    }
                }
                DecodeEvent::Jump {
                    group_id,
                    uid,
                    horizon,
                } => {
                    let group = self.group_mut(group_id, cycle)?;
                    if group.in_flight.contains(&uid) {
                        group.pending_jumps.insert(uid, horizon);
                    }
                }
                DecodeEvent::Halt { group_id, horizon } => {
                    let group = self.group_mut(group_id, cycle)?;
                    if group.is_halted() {
                        continue;
                    }
                    group.state = WarpState::HALTED;
                    group.next_warp = 0;
                    group.squash_after = Some(group.squash_after.map_or(horizon, |h| h.min(horizon)));
                    log::debug!(
                        "{}",
                        style(format!("cycle {cycle:03} scheduler: halt {group}")).red()
                    );
                    self.stats.num_halted += 1;
                }
            }
        }
        Ok(())
    }

    fn apply_redirects(&mut self, redirects: Vec<Redirect>, cycle: u64) -> Result<(), Error> {
        for Redirect {
            group_id,
            target,
            horizon,
        } in redirects
        {
            let group = self.group_mut(group_id, cycle)?;
            if group.is_halted() {
                continue;
            }
            // the sibling warps of a jump report the same horizon
            if group.squash_after.is_some_and(|h| h <= horizon) {
                continue;
            }
            group.pc = target;
            group.squash_after = Some(horizon);
            group.state = WarpState::BRANCH_PENDING;
            group.next_warp = 0;
            self.stats.num_branches_taken += 1;
            log::debug!(
                "{}",
                style(format!(
                    "cycle {cycle:03} scheduler: redirect group {group_id} to {target:#06x} (squash after uid {horizon})"
                ))
                .yellow()
            );
        }
        Ok(())
    }

    /// Group whose warp is fetched this cycle.
    fn select(&self) -> Option<usize> {
        if let Some(group) = self
            .groups
            .iter()
            .find(|group| group.next_warp != 0 && group.can_fetch())
        {
            return Some(group.group_id);
        }
        ordering::round_robin(self.next_group, self.groups.len())
            .find(|idx| self.groups[*idx].can_fetch())
    }

    fn fetch(&mut self, ahead: &mut Latch<Instruction>, cycle: u64) -> Result<bool, Error> {
        if !ahead.ready_for_push() {
            return Ok(false);
        }
        let Some(group_id) = self.select() else {
            return Ok(false);
        };
        let uid = self.next_uid;
        let warps_per_group = self.warps_per_group;
        let group = &mut self.groups[group_id];
        let warp_id = group_id * warps_per_group + group.next_warp;
        let mut instr = Instruction::fetch(uid, group.pc, warp_id, group_id);
        instr.mark_stage_exit(STAGE, cycle);
        log::debug!(
            "{}",
            style(format!("cycle {cycle:03} scheduler: fetch {instr}")).cyan()
        );
        ahead.push_or_fail(instr, STAGE, cycle)?;

        group.in_flight.insert(uid);
        group.next_warp += 1;
        if group.next_warp == warps_per_group {
            group.next_warp = 0;
            group.pc = group.pc.wrapping_add(4);
            self.next_group = group_id + 1;
        }
        self.next_uid += 1;
        self.stats.num_fetches += 1;
        Ok(true)
    }

    #[tracing::instrument(name = "scheduler", skip_all)]
    pub fn cycle(
        &mut self,
        ahead: &mut Latch<Instruction>,
        signals: Signals<'_>,
        cycle: u64,
    ) -> Result<(), Error> {
        if let Some(drained) = signals.drain.pop() {
            self.apply_drains(drained, cycle)?;
        }
        if let Some(events) = signals.events.pop() {
            self.apply_events(events, cycle)?;
        }
        if let Some(redirects) = signals.redirects.pop() {
            self.apply_redirects(redirects, cycle)?;
        }

        for group in &mut self.groups {
            if !group.in_flight.is_empty() {
                continue;
            }
            group.end_of_packet = false;
            if group.state == WarpState::BRANCH_PENDING {
                group.state = WarpState::RUNNING;
                group.squash_after = None;
            }
        }

        if let Some(ihit) = signals.ihit.snoop() {
            let group = self.group_mut(ihit.group_id, cycle)?;
            match (ihit.hit, group.state) {
                (false, WarpState::RUNNING | WarpState::STALLED_IBUFFER_FULL) => {
                    group.state = WarpState::STALLED_ICACHE;
                }
                (true, WarpState::STALLED_ICACHE) => group.state = WarpState::RUNNING,
                _ => {}
            }
        }
        if let Some(full) = signals.ibuffer_full.snoop() {
            for (group, full) in self.groups.iter_mut().zip(full) {
                match (*full, group.state) {
                    (true, WarpState::RUNNING) => group.state = WarpState::STALLED_IBUFFER_FULL,
                    (false, WarpState::STALLED_IBUFFER_FULL) => group.state = WarpState::RUNNING,
                    _ => {}
                }
            }
        }

        for group in &self.groups {
            match group.state {
                WarpState::STALLED_ICACHE => self.stats.icache_stall_cycles += 1,
                WarpState::STALLED_IBUFFER_FULL => self.stats.ibuffer_full_stall_cycles += 1,
                WarpState::BRANCH_PENDING => self.stats.branch_pending_cycles += 1,
                WarpState::RUNNING | WarpState::HALTED => {}
            }
        }

        if !self.fetch(ahead, cycle)? {
            self.stats.idle_cycles += 1;
        }
        Ok(())
    }
}

impl std::fmt::Display for WarpScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scheduler[")?;
        for (idx, group) in self.groups.iter().enumerate() {
            if idx > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{group}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::{DecodeEvent, Redirect, Signals, WarpScheduler};
    use crate::{
        config,
        icache::IHit,
        instruction::Instruction,
        latch::{ForwardingIf, Latch},
        warp::{Drained, WarpState},
    };
    use color_eyre::eyre;

    #[derive(Debug)]
    struct Harness {
        scheduler: WarpScheduler,
        sched_ic: Latch<Instruction>,
        ihit: ForwardingIf<IHit>,
        ibuffer_full: ForwardingIf<Vec<bool>>,
        events: ForwardingIf<Vec<DecodeEvent>>,
        redirects: ForwardingIf<Vec<Redirect>>,
        drain: ForwardingIf<Vec<Drained>>,
    }

    impl Harness {
        fn new(num_warps: usize, warps_per_group: usize) -> Self {
            let config = config::Core {
                num_warps,
                warps_per_group,
                ..config::Core::default()
            };
            Self {
                scheduler: WarpScheduler::new(&config),
                sched_ic: Latch::new("SCHED_IC"),
                ihit: ForwardingIf::new("ihit"),
                ibuffer_full: ForwardingIf::new("ibuffer_full"),
                events: ForwardingIf::new("decode_events"),
                redirects: ForwardingIf::new("redirect"),
                drain: ForwardingIf::new("drain"),
            }
        }

        /// Runs one cycle and returns the fetched (uid, warp, group, pc).
        fn step(&mut self, cycle: u64) -> eyre::Result<Option<(u64, usize, usize, u32)>> {
            let signals = Signals {
                ihit: &self.ihit,
                ibuffer_full: &self.ibuffer_full,
                events: &mut self.events,
                redirects: &mut self.redirects,
                drain: &mut self.drain,
            };
            self.scheduler.cycle(&mut self.sched_ic, signals, cycle)?;
            Ok(self
                .sched_ic
                .pop()
                .map(|instr| (instr.uid, instr.warp_id, instr.group_id, instr.pc)))
        }

        fn retire(&mut self, group_id: usize, uid: u64) {
            self.drain.append(Drained {
                group_id,
                uid,
                retired: true,
            });
        }
    }

    #[test]
    fn fetches_pairs_round_robin() -> eyre::Result<()> {
        let mut h = Harness::new(4, 2);
        let mut fetched = Vec::new();
        for cycle in 0..6 {
            fetched.extend(h.step(cycle)?);
        }
        utils::diff::assert_eq!(
            have: fetched,
            want: vec![
                (0, 0, 0, 0x0),
                (1, 1, 0, 0x0),
                (2, 2, 1, 0x0),
                (3, 3, 1, 0x0),
                (4, 0, 0, 0x4),
                (5, 1, 0, 0x4),
            ]
        );
        assert_eq!(h.scheduler.groups()[0].in_flight.len(), 4);
        assert_eq!(h.scheduler.stats().num_fetches, 6);
        Ok(())
    }

    #[test]
    fn end_of_packet_waits_for_drain() -> eyre::Result<()> {
        let mut h = Harness::new(2, 2);
        assert!(h.step(0)?.is_some());
        assert!(h.step(1)?.is_some());
        h.events.append(DecodeEvent::EndOfPacket { group_id: 0 });
        assert_eq!(h.step(2)?, None);
        h.retire(0, 0);
        assert_eq!(h.step(3)?, None);
        h.retire(0, 1);
        assert_eq!(h.step(4)?, Some((2, 0, 0, 0x4)));
        assert_eq!(h.scheduler.stats().num_end_of_packet, 1);
        assert_eq!(h.scheduler.num_retired(), 2);
        Ok(())
    }

    #[test]
    fn redirect_squashes_and_resumes_at_target() -> eyre::Result<()> {
        let mut h = Harness::new(2, 2);
        for cycle in 0..4 {
            h.step(cycle)?;
        }
        // the jump pair is uids 0 and 1
        h.retire(0, 0);
        h.retire(0, 1);
        for horizon in [1, 1] {
            h.redirects.append(Redirect {
                group_id: 0,
                target: 0x40,
                horizon,
            });
        }
        assert_eq!(h.step(4)?, None);
        let group = &h.scheduler.groups()[0];
        assert_eq!(group.state, WarpState::BRANCH_PENDING);
        assert!(group.is_stale(2));
        assert!(!group.is_stale(1));
        assert_eq!(h.scheduler.stats().num_branches_taken, 1);

        for uid in [2, 3] {
            h.drain.append(Drained {
                group_id: 0,
                uid,
                retired: false,
            });
        }
        assert_eq!(h.step(5)?, Some((4, 0, 0, 0x40)));
        assert_eq!(h.scheduler.groups()[0].squash_after, None);
        assert_eq!(h.scheduler.num_squashed(), 2);
        Ok(())
    }

    #[test]
    fn icache_miss_stalls_group() -> eyre::Result<()> {
        let mut h = Harness::new(4, 2);
        h.ihit.push(IHit {
            group_id: 0,
            hit: false,
        });
        assert_eq!(h.step(0)?, Some((0, 2, 1, 0x0)));
        assert_eq!(h.scheduler.groups()[0].state, WarpState::STALLED_ICACHE);
        h.ihit.push(IHit {
            group_id: 0,
            hit: true,
        });
        // group 1 finishes its pair first
        assert_eq!(h.step(1)?, Some((1, 3, 1, 0x0)));
        assert_eq!(h.step(2)?, Some((2, 0, 0, 0x0)));
        assert!(h.scheduler.stats().icache_stall_cycles > 0);
        Ok(())
    }

    #[test]
    fn halt_is_terminal() -> eyre::Result<()> {
        let mut h = Harness::new(2, 2);
        h.step(0)?;
        h.step(1)?;
        h.events.append(DecodeEvent::Halt {
            group_id: 0,
            horizon: 1,
        });
        h.retire(0, 0);
        h.retire(0, 1);
        for cycle in 2..6 {
            assert_eq!(h.step(cycle)?, None);
        }
        assert!(h.scheduler.all_halted());
        assert_eq!(h.scheduler.stats().num_halted, 1);
        Ok(())
    }

    #[test]
    fn unknown_drain_is_an_error() {
        let mut h = Harness::new(2, 2);
        h.retire(0, 9);
        assert!(h.step(0).is_err());
    }

    #[test]
    fn full_ibuffer_stalls_fetch() -> eyre::Result<()> {
        let mut h = Harness::new(2, 2);
        h.ibuffer_full.push(vec![true]);
        assert_eq!(h.step(0)?, None);
        assert_eq!(h.scheduler.groups()[0].state, WarpState::STALLED_IBUFFER_FULL);
        h.ibuffer_full.push(vec![false]);
        assert!(h.step(1)?.is_some());
        Ok(())
    }
}
