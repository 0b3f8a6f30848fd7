//! Memory controller serving the instruction cache and the load/store unit.

use crate::{
    config,
    engine::cycle::Component,
    latch::Latch,
    mem::Memory,
    mem_fetch::{Kind, MemRequest, MemResponse, Source},
    Error,
};
use console::style;

/// Request and response latch pair of one client.
#[derive(Debug)]
pub struct Port {
    pub req: Latch<MemRequest>,
    pub rsp: Latch<MemResponse>,
}

impl Port {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            req: Latch::new(format!("{name}_mem_req")),
            rsp: Latch::new(format!("mem_{name}_rsp")),
        }
    }
}

/// Fixed latency memory with a bounded number of outstanding requests.
///
/// At most one request completes per cycle. A new request is only accepted
/// in a cycle without a completion, and with a latency of one it completes
/// in that same cycle.
#[derive(Debug)]
pub struct MemoryController {
    config: config::Memory,
    mem: Memory,
    pub icache: Port,
    pub ldst: Port,
    in_flight: Vec<MemRequest>,
    next_id: u64,
    /// Source that wins the next round robin tie.
    next_source: Source,
    stats: stats::Memory,
    cycle: u64,
}

impl MemoryController {
    #[must_use]
    pub fn new(config: config::Memory, mem: Memory) -> Self {
        Self {
            config,
            mem,
            icache: Port::new("icache"),
            ldst: Port::new("ldst"),
            in_flight: Vec::new(),
            next_id: 0,
            next_source: Source::ICACHE,
            stats: stats::Memory::default(),
            cycle: 0,
        }
    }

    #[must_use]
    pub fn mem(&self) -> &Memory {
        &self.mem
    }

    pub fn mem_mut(&mut self) -> &mut Memory {
        &mut self.mem
    }

    #[must_use]
    pub fn in_flight(&self) -> &[MemRequest] {
        &self.in_flight
    }

    /// Cycle the next clock edge will be.
    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Memory {
        &self.stats
    }

    /// No request outstanding and no response waiting to be picked up.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.in_flight.is_empty()
            && [&self.icache, &self.ldst]
                .iter()
                .all(|port| !port.req.is_valid() && !port.rsp.is_valid())
    }

    /// Writes not yet applied to memory, oldest first.
    pub fn pending_writes(&self) -> impl Iterator<Item = &MemRequest> {
        self.in_flight
            .iter()
            .chain(self.icache.req.snoop())
            .chain(self.ldst.req.snoop())
            .filter(|req| req.is_write())
    }

    /// Applies the payload of a write request to memory and returns its length.
    pub fn apply_write(&mut self, req: &MemRequest) -> Result<usize, Error> {
        let bytes = match &req.payload {
            Some(payload) => payload.normalize()?,
            None => Vec::new(),
        };
        self.mem.write(req.addr, &bytes);
        Ok(bytes.len())
    }

    fn port_mut(&mut self, source: Source) -> &mut Port {
        match source {
            Source::ICACHE => &mut self.icache,
            Source::LDST => &mut self.ldst,
        }
    }

    /// Oldest request whose countdown expired and whose client can take the response.
    fn ready(&self) -> Option<usize> {
        self.in_flight.iter().position(|req| {
            let port = match req.source {
                Source::ICACHE => &self.icache,
                Source::LDST => &self.ldst,
            };
            req.remaining == 0 && port.rsp.ready_for_push()
        })
    }

    fn complete(&mut self, idx: usize, cycle: u64) -> Result<(), Error> {
        let req = self.in_flight.remove(idx);
        let data = match req.kind {
            Kind::WRITE => {
                let len = self.apply_write(&req)?;
                self.stats
                    .record(stats::mem::AccessKind::DATA_WRITE, len as u64);
                Vec::new()
            }
            Kind::READ => {
                let bytes = self.mem.read(req.addr, req.size);
                let kind = match req.source {
                    Source::ICACHE => stats::mem::AccessKind::INST_READ,
                    Source::LDST => stats::mem::AccessKind::DATA_READ,
                };
                self.stats.record(kind, bytes.len() as u64);
                bytes
            }
        };
        log::debug!(
            "{}",
            style(format!("cycle {cycle:03} mcu: complete {req}")).magenta()
        );
        let source = req.source;
        let resp = MemResponse::new(req, data);
        self.port_mut(source).rsp.push_or_fail(resp, "mcu", cycle)
    }

    /// Picks the client whose request is accepted this cycle.
    fn arbitrate(&self) -> Option<Source> {
        let icache = self.icache.req.is_valid();
        let ldst = self.ldst.req.is_valid();
        match (icache, ldst) {
            (false, false) => None,
            (true, false) => Some(Source::ICACHE),
            (false, true) => Some(Source::LDST),
            (true, true) => match self.config.arbitration {
                config::Arbitration::ICACHE_PRIORITY => Some(Source::ICACHE),
                config::Arbitration::ROUND_ROBIN => Some(self.next_source),
            },
        }
    }

    /// Accepts at most one new request and returns its index in `in_flight`.
    fn accept(&mut self, cycle: u64) -> Option<usize> {
        if self.in_flight.len() >= self.config.max_in_flight {
            if self.icache.req.is_valid() || self.ldst.req.is_valid() {
                self.stats.in_flight_full_cycles += 1;
            }
            return None;
        }
        let source = self.arbitrate()?;
        let mut req = self.port_mut(source).req.pop()?;
        self.next_source = match source {
            Source::ICACHE => Source::LDST,
            Source::LDST => Source::ICACHE,
        };
        req.id = self.next_id;
        self.next_id += 1;
        // the request latch hop accounts for the first cycle
        req.remaining = self.config.latency.saturating_sub(1);
        log::debug!(
            "{}",
            style(format!("cycle {cycle:03} mcu: accept {req}")).magenta()
        );
        self.in_flight.push(req);
        self.stats.max_in_flight = self.stats.max_in_flight.max(self.in_flight.len() as u64);
        Some(self.in_flight.len() - 1)
    }
}

impl Component for MemoryController {
    #[tracing::instrument(name = "mcu", skip_all)]
    fn cycle(&mut self, cycle: u64) -> Result<(), Error> {
        for req in &mut self.in_flight {
            req.remaining = req.remaining.saturating_sub(1);
        }
        // a request accepted at cycle A completes at A + latency - 1 at the earliest
        if let Some(idx) = self.ready() {
            self.complete(idx, cycle)?;
        } else {
            if self.in_flight.iter().any(|req| req.remaining == 0) {
                self.stats.response_stall_cycles += 1;
            }
            let accepted = self.accept(cycle);
            if let Some(idx) = accepted.filter(|idx| self.in_flight[*idx].remaining == 0) {
                if self.ready() == Some(idx) {
                    self.complete(idx, cycle)?;
                }
            }
        }
        self.cycle = cycle + 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryController;
    use crate::{
        config,
        engine::cycle::Component,
        mem::Memory,
        mem_fetch::{MemRequest, Payload, Source},
        testing,
    };
    use color_eyre::eyre;

    fn controller(latency: u64, arbitration: config::Arbitration) -> MemoryController {
        let config = config::Memory {
            latency,
            max_in_flight: 4,
            arbitration,
        };
        MemoryController::new(config, Memory::new())
    }

    #[test]
    fn read_completes_after_latency() -> eyre::Result<()> {
        testing::init_logging();
        let mut mcu = controller(5, config::Arbitration::ROUND_ROBIN);
        mcu.mem_mut().write_u32(0x40, 0xCAFE);
        mcu.icache
            .req
            .push(MemRequest::read(Source::ICACHE, 0x40, 8))
            .unwrap();
        let mut arrived = None;
        for cycle in 0..10 {
            mcu.cycle(cycle)?;
            if let Some(resp) = mcu.icache.rsp.pop() {
                arrived = Some((cycle, resp.data));
                break;
            }
        }
        utils::diff::assert_eq!(
            have: arrived,
            want: Some((4, vec![0xFE, 0xCA, 0, 0, 0, 0, 0, 0]))
        );
        assert!(mcu.is_idle());
        Ok(())
    }

    #[test]
    fn at_most_one_completion_per_cycle() -> eyre::Result<()> {
        let mut mcu = controller(3, config::Arbitration::ROUND_ROBIN);
        let mut completions = Vec::new();
        let mut issued = 0;
        for cycle in 0..40 {
            if issued < 6 && mcu.ldst.req.ready_for_push() {
                let req = MemRequest::write(
                    Source::LDST,
                    0x100 + 4 * issued,
                    Payload::Int {
                        value: u64::from(issued) + 1,
                        width: 4,
                    },
                );
                mcu.ldst.req.push(req).unwrap();
                issued += 1;
            }
            if issued < 12 && issued >= 6 && mcu.icache.req.ready_for_push() {
                mcu.icache
                    .req
                    .push(MemRequest::read(Source::ICACHE, 0, 4))
                    .unwrap();
                issued += 1;
            }
            let before = mcu.in_flight().len();
            mcu.cycle(cycle)?;
            let done = usize::from(mcu.ldst.rsp.pop().is_some())
                + usize::from(mcu.icache.rsp.pop().is_some());
            assert!(done <= 1, "cycle {cycle}: {done} completions");
            assert!(mcu.in_flight().len() + done <= before + 1);
            completions.push(done);
        }
        assert_eq!(completions.iter().sum::<usize>(), 12);
        for idx in 0..6 {
            assert_eq!(mcu.mem().read_u32(0x100 + 4 * idx), idx + 1);
        }
        assert_eq!(mcu.stats().data_writes, 6);
        assert_eq!(mcu.stats().inst_reads, 6);
        Ok(())
    }

    #[test]
    fn blocked_response_is_deferred_not_dropped() -> eyre::Result<()> {
        let mut mcu = controller(2, config::Arbitration::ROUND_ROBIN);
        for _ in 0..2 {
            mcu.icache
                .req
                .push(MemRequest::read(Source::ICACHE, 0, 4))
                .unwrap();
            mcu.cycle(0)?;
        }
        // nobody drains the response latch
        for cycle in 1..6 {
            mcu.cycle(cycle)?;
        }
        assert_eq!(mcu.in_flight().len(), 1);
        assert!(mcu.stats().response_stall_cycles > 0);
        mcu.icache.rsp.pop().unwrap();
        mcu.cycle(6)?;
        assert!(mcu.icache.rsp.pop().is_some());
        assert!(mcu.in_flight().is_empty());
        Ok(())
    }

    #[test]
    fn icache_priority_arbitration() -> eyre::Result<()> {
        let mut mcu = controller(1, config::Arbitration::ICACHE_PRIORITY);
        mcu.icache
            .req
            .push(MemRequest::read(Source::ICACHE, 0, 4))
            .unwrap();
        mcu.ldst
            .req
            .push(MemRequest::read(Source::LDST, 0, 4))
            .unwrap();
        mcu.cycle(0)?;
        assert!(!mcu.icache.req.is_valid());
        assert!(mcu.ldst.req.is_valid());

        let mut rr = controller(2, config::Arbitration::ROUND_ROBIN);
        rr.icache
            .req
            .push(MemRequest::read(Source::ICACHE, 0, 4))
            .unwrap();
        rr.cycle(0)?;
        rr.icache
            .req
            .push(MemRequest::read(Source::ICACHE, 0, 4))
            .unwrap();
        rr.ldst
            .req
            .push(MemRequest::read(Source::LDST, 0, 4))
            .unwrap();
        // completion of the first request blocks acceptance this cycle
        rr.cycle(1)?;
        assert!(rr.icache.rsp.pop().is_some());
        assert!(rr.icache.req.is_valid() && rr.ldst.req.is_valid());
        rr.cycle(2)?;
        assert!(rr.icache.req.is_valid(), "ldst wins after icache was served");
        assert!(!rr.ldst.req.is_valid());
        Ok(())
    }

    #[test]
    fn completion_cycle_follows_latency() -> eyre::Result<()> {
        for latency in [1, 2, 3, 50] {
            let mut mcu = controller(latency, config::Arbitration::ROUND_ROBIN);
            mcu.ldst
                .req
                .push(MemRequest::read(Source::LDST, 0x80, 4))
                .unwrap();
            let mut arrived = None;
            for cycle in 0..=latency + 1 {
                mcu.cycle(cycle)?;
                if mcu.ldst.rsp.pop().is_some() {
                    arrived = Some(cycle);
                    break;
                }
            }
            utils::diff::assert_eq!(have: arrived, want: Some(latency - 1));
        }
        Ok(())
    }
}
