//! Instruction cache stage between the scheduler and decode.

use crate::{
    config,
    instruction::{Block, Instruction},
    latch::{ForwardingIf, Latch},
    mcu,
    mem_fetch::{MemRequest, Source},
    tag_array::{ProbeStatus, TagArray},
    Error,
};
use console::style;
use stats::cache::RequestStatus;

pub const STAGE: &str = "icache";

/// Hit or miss notification for the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IHit {
    pub group_id: usize,
    pub hit: bool,
}

/// Outstanding demand miss.
#[derive(Debug)]
struct Miss {
    block_addr: u32,
    /// Fill request not yet handed to the memory controller.
    request: Option<MemRequest>,
    /// Instruction waiting on a fill that was requested as a prefetch.
    instr: Option<Instruction>,
}

/// Next-line prefetch.
#[derive(Debug)]
struct Prefetch {
    block_addr: u32,
    request: Option<MemRequest>,
}

#[derive(Debug)]
pub struct InstructionCache {
    config: config::ICache,
    tags: TagArray,
    /// `SCHED_IC`, fed by the scheduler.
    behind: Latch<Instruction>,
    ihit: ForwardingIf<IHit>,
    /// Instruction with its block attached that decode could not take yet.
    held: Option<Instruction>,
    miss: Option<Miss>,
    prefetch: Option<Prefetch>,
    stats: stats::Cache,
}

impl InstructionCache {
    #[must_use]
    pub fn new(config: config::ICache) -> Self {
        Self {
            tags: TagArray::new(&config),
            config,
            behind: Latch::new("SCHED_IC"),
            ihit: ForwardingIf::new("ihit"),
            held: None,
            miss: None,
            prefetch: None,
            stats: stats::Cache::default(),
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
    pub fn ihit(&self) -> &ForwardingIf<IHit> {
        &self.ihit
    }

    /// Both sides the scheduler talks to in one borrow.
    pub fn fetch_interface(&mut self) -> (&mut Latch<Instruction>, &ForwardingIf<IHit>) {
        (&mut self.behind, &self.ihit)
    }

    #[must_use]
    pub fn tags(&self) -> &TagArray {
        &self.tags
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Cache {
        &self.stats
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.behind.is_valid()
            && self.held.is_none()
            && self.miss.is_none()
            && self.prefetch.is_none()
    }

    fn attach(&self, instr: &mut Instruction, index: usize) {
        let line = self.tags.line(index);
        instr.block = Some((line.block_addr, line.data.clone()));
    }

    /// Pushes `instr` to decode or holds it until decode is ready.
    fn forward(&mut self, mut instr: Instruction, ahead: &mut Latch<Instruction>, cycle: u64) {
        instr.mark_stage_exit(STAGE, cycle);
        if let Err(instr) = ahead.push(instr) {
            self.held = Some(instr);
        }
    }

    fn fill_request(&self, block_addr: u32) -> MemRequest {
        MemRequest::read(Source::ICACHE, block_addr, self.config.block_size)
    }

    fn handle_fill(
        &mut self,
        port: &mut mcu::Port,
        ahead: &mut Latch<Instruction>,
        cycle: u64,
    ) {
        let Some(resp) = port.rsp.pop() else {
            return;
        };
        let block: Block = resp.data.iter().copied().collect();
        self.stats.inc(RequestStatus::FILL);
        if self.tags.fill(resp.addr, block, cycle).is_some() {
            self.stats.inc(RequestStatus::EVICTION);
        }
        log::debug!(
            "{}",
            style(format!("cycle {cycle:03} icache: fill {:#010x}", resp.addr)).green()
        );

        if self
            .prefetch
            .as_ref()
            .is_some_and(|prefetch| prefetch.block_addr == resp.addr)
        {
            self.prefetch = None;
        }
        if !self
            .miss
            .as_ref()
            .is_some_and(|miss| miss.block_addr == resp.addr)
        {
            return;
        }

        // the demand fill resumes the instruction that missed
        let waiting = self.miss.take().and_then(|miss| miss.instr);
        self.behind.set_wait(false);
        let mut instr = waiting.unwrap_or(resp.instr);
        let status = self.tags.access(instr.pc, cycle);
        self.attach(&mut instr, status.index);
        self.ihit.push(IHit {
            group_id: instr.group_id,
            hit: true,
        });
        self.forward(instr, ahead, cycle);
    }

    /// Hands pending fill requests to the memory controller, demand first.
    fn send_requests(&mut self, port: &mut mcu::Port) {
        if let Some(miss) = self.miss.as_mut() {
            if let Some(req) = miss.request.take() {
                if let Err(req) = port.req.push(req) {
                    miss.request = Some(req);
                    return;
                }
            }
        }
        let demand_sent = self.miss.as_ref().map_or(true, |miss| miss.request.is_none());
        if !demand_sent {
            return;
        }
        if let Some(prefetch) = self.prefetch.as_mut() {
            if let Some(req) = prefetch.request.take() {
                if let Err(req) = port.req.push(req) {
                    prefetch.request = Some(req);
                } else {
                    self.stats.inc(RequestStatus::PREFETCH);
                }
            }
        }
    }

    fn start_miss(&mut self, instr: Instruction, cycle: u64) {
        let block_addr = self.tags.block_addr(instr.pc);
        self.ihit.push(IHit {
            group_id: instr.group_id,
            hit: false,
        });
        self.behind.set_wait(true);
        log::debug!(
            "{}",
            style(format!(
                "cycle {cycle:03} icache: miss {instr} block={block_addr:#010x}"
            ))
            .red()
        );

        // whether a prefetch of this block exists and was already sent
        let prefetched = self
            .prefetch
            .as_ref()
            .filter(|prefetch| prefetch.block_addr == block_addr)
            .map(|prefetch| prefetch.request.is_none());
        self.miss = Some(match prefetched {
            // an in-flight prefetch of the same block doubles as the fill
            Some(true) => Miss {
                block_addr,
                request: None,
                instr: Some(instr),
            },
            Some(false) | None => {
                if prefetched.is_some() {
                    self.prefetch = None;
                }
                Miss {
                    block_addr,
                    request: Some(self.fill_request(block_addr).with_instruction(instr)),
                    instr: None,
                }
            }
        });

        if self.config.miss_policy == config::CacheMissPolicy::PREFETCH && self.prefetch.is_none()
        {
            let next = block_addr.wrapping_add(self.config.block_size as u32);
            if self.tags.probe(next).status == ProbeStatus::MISS {
                self.prefetch = Some(Prefetch {
                    block_addr: next,
                    request: Some(self.fill_request(next)),
                });
            }
        }
    }

    #[tracing::instrument(name = "icache", skip_all)]
    pub fn cycle(
        &mut self,
        ahead: &mut Latch<Instruction>,
        port: &mut mcu::Port,
        cycle: u64,
    ) -> Result<(), Error> {
        self.handle_fill(port, ahead, cycle);

        if let Some(instr) = self.held.take() {
            if let Err(instr) = ahead.push(instr) {
                self.held = Some(instr);
                self.stats.inc(RequestStatus::STALLED);
            }
        }

        if self.miss.is_none() && self.held.is_none() && ahead.ready_for_push() {
            if let Some(mut instr) = self.behind.pop() {
                instr.mark_stage_enter(STAGE, cycle);
                let status = self.tags.access(instr.pc, cycle);
                match status.status {
                    ProbeStatus::HIT => {
                        self.stats.inc(RequestStatus::HIT);
                        self.attach(&mut instr, status.index);
                        log::debug!(
                            "{}",
                            style(format!("cycle {cycle:03} icache: hit {instr}")).green()
                        );
                        self.ihit.push(IHit {
                            group_id: instr.group_id,
                            hit: true,
                        });
                        self.forward(instr, ahead, cycle);
                    }
                    ProbeStatus::MISS => {
                        self.stats.inc(RequestStatus::MISS);
                        self.start_miss(instr, cycle);
                    }
                }
            }
        } else if self.behind.is_valid() {
            self.stats.inc(RequestStatus::STALLED);
        }

        self.send_requests(port);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::InstructionCache;
    use crate::{
        config,
        engine::cycle::Component,
        instruction::Instruction,
        latch::Latch,
        mcu::MemoryController,
        mem::Memory,
        testing,
    };
    use color_eyre::eyre;
    use stats::cache::RequestStatus;

    fn setup(latency: u64, miss_policy: config::CacheMissPolicy) -> (MemoryController, InstructionCache) {
        let mut mem = Memory::new();
        for (idx, word) in [0x11, 0x22, 0x33, 0x44].into_iter().enumerate() {
            mem.write_u32(0x40 + 4 * idx as u32, word);
        }
        let mcu = MemoryController::new(
            config::Memory {
                latency,
                ..config::Memory::default()
            },
            mem,
        );
        let icache = InstructionCache::new(config::ICache {
            miss_policy,
            ..config::ICache::default()
        });
        (mcu, icache)
    }

    #[test]
    fn miss_penalty_matches_memory_latency() -> eyre::Result<()> {
        testing::init_logging();
        let (mut mcu, mut icache) = setup(50, config::CacheMissPolicy::BLOCKING);
        let mut decode = Latch::new("IC_ID");
        icache.behind_mut().push(Instruction::fetch(0, 0x44, 0, 0)).unwrap();

        let mut observed = Vec::new();
        let mut delivered = Vec::new();
        for cycle in 0..60 {
            mcu.cycle(cycle)?;
            icache.cycle(&mut decode, &mut mcu.icache, cycle)?;
            observed.push(icache.ihit().snoop().map(|ihit| ihit.hit));
            if let Some(instr) = decode.pop() {
                delivered.push((cycle, instr.uid, instr.word_from_block()));
                if instr.uid == 0 {
                    // the next word of the same block
                    icache.behind_mut().push(Instruction::fetch(1, 0x48, 1, 0)).unwrap();
                }
            }
        }

        let misses = observed.iter().filter(|hit| **hit == Some(false)).count();
        assert_eq!(misses, 50);
        assert_eq!(observed[49], Some(false));
        assert_eq!(observed[50], Some(true));
        utils::diff::assert_eq!(
            have: delivered,
            want: vec![(50, 0, Some(0x22)), (51, 1, Some(0x33))]
        );
        assert_eq!(icache.stats().count(RequestStatus::MISS), 1);
        assert_eq!(icache.stats().count(RequestStatus::HIT), 1);
        assert_eq!(icache.stats().count(RequestStatus::FILL), 1);
        assert!(icache.is_idle());
        Ok(())
    }

    #[test]
    fn miss_penalty_for_every_latency() -> eyre::Result<()> {
        for latency in [1, 2, 3, 50] {
            let (mut mcu, mut icache) = setup(latency, config::CacheMissPolicy::BLOCKING);
            let mut decode = Latch::new("IC_ID");
            icache.behind_mut().push(Instruction::fetch(0, 0x40, 0, 0)).unwrap();
            let mut misses = 0;
            let mut delivered = None;
            for cycle in 0..=latency + 1 {
                mcu.cycle(cycle)?;
                icache.cycle(&mut decode, &mut mcu.icache, cycle)?;
                if icache.ihit().snoop().is_some_and(|ihit| !ihit.hit) {
                    misses += 1;
                }
                if decode.pop().is_some() {
                    delivered = Some(cycle);
                    break;
                }
            }
            assert_eq!(delivered, Some(latency), "latency {latency}");
            assert_eq!(misses, latency, "latency {latency}");
        }
        Ok(())
    }

    #[test]
    fn miss_blocks_further_fetches() -> eyre::Result<()> {
        let (mut mcu, mut icache) = setup(10, config::CacheMissPolicy::BLOCKING);
        let mut decode = Latch::new("IC_ID");
        icache.behind_mut().push(Instruction::fetch(0, 0x40, 0, 0)).unwrap();
        mcu.cycle(0)?;
        icache.cycle(&mut decode, &mut mcu.icache, 0)?;
        assert!(!icache.behind().ready_for_push());
        assert!(icache.behind_mut().push(Instruction::fetch(1, 0x40, 1, 0)).is_err());
        Ok(())
    }

    #[test]
    fn prefetch_fills_next_line() -> eyre::Result<()> {
        let (mut mcu, mut icache) = setup(5, config::CacheMissPolicy::PREFETCH);
        let mut decode = Latch::new("IC_ID");
        icache.behind_mut().push(Instruction::fetch(0, 0x40, 0, 0)).unwrap();

        let mut delivered = Vec::new();
        for cycle in 0..20 {
            mcu.cycle(cycle)?;
            icache.cycle(&mut decode, &mut mcu.icache, cycle)?;
            if let Some(instr) = decode.pop() {
                delivered.push((cycle, instr.pc));
                if instr.uid == 0 {
                    icache.behind_mut().push(Instruction::fetch(1, 0x60, 0, 0)).unwrap();
                }
            }
        }
        utils::diff::assert_eq!(have: delivered, want: vec![(5, 0x40), (6, 0x60)]);
        assert_eq!(icache.stats().count(RequestStatus::MISS), 1);
        assert_eq!(icache.stats().count(RequestStatus::PREFETCH), 1);
        assert_eq!(icache.stats().count(RequestStatus::FILL), 2);
        assert_eq!(mcu.stats().inst_reads, 2);
        Ok(())
    }
}
