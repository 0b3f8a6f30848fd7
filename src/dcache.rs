//! Banked write-back data cache between the load/store unit and the memory controller.

use crate::{
    config,
    instruction::Block,
    latch::Latch,
    mcu,
    mem_fetch::{Kind, MemRequest, Payload, Source},
    tag_array::{Banked, EvictedBlock, ProbeStatus, TagArray},
    Error,
};
use console::style;
use stats::cache::RequestStatus;
use std::collections::VecDeque;

pub const STAGE: &str = "dcache";

/// Bytes of one lane inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaneAccess {
    pub lane: usize,
    pub addr: u32,
    pub size: usize,
    /// Store data on the way in, loaded data on the way back.
    pub data: Option<Vec<u8>>,
}

/// Lane accesses of one instruction that fall into the same block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRequest {
    pub block_addr: u32,
    pub kind: Kind,
    pub lanes: Vec<LaneAccess>,
    pub uid: u64,
    pub warp_id: usize,
    pub group_id: usize,
}

impl std::fmt::Display for DataRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}(block={:#010x}, uid={}, {} lanes)",
            self.kind,
            self.block_addr,
            self.uid,
            self.lanes.len()
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataResponse {
    pub block_addr: u32,
    pub kind: Kind,
    pub uid: u64,
    pub lanes: Vec<LaneAccess>,
    /// Served from the cache without waiting for a fill.
    pub hit: bool,
}

impl std::fmt::Display for DataResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}Response(block={:#010x}, uid={}, hit={})",
            self.kind, self.block_addr, self.uid, self.hit
        )
    }
}

/// Request and response latch pair towards the load/store unit.
#[derive(Debug)]
pub struct Port {
    pub req: Latch<DataRequest>,
    pub rsp: Latch<DataResponse>,
}

impl Default for Port {
    fn default() -> Self {
        Self {
            req: Latch::new("ldst_dcache_req"),
            rsp: Latch::new("dcache_ldst_rsp"),
        }
    }
}

/// Outstanding miss on one block and the requests merged into it.
#[derive(Debug)]
struct MshrEntry {
    block_addr: u32,
    requests: Vec<DataRequest>,
    /// Fill handed to the outbox.
    issued: bool,
}

/// Misses of one bank in arrival order.
///
/// Only the front entry has its fill in flight.
#[derive(Debug, Default)]
struct Bank {
    entries: VecDeque<MshrEntry>,
}

/// Write-back, write-allocate data cache.
///
/// A hit is answered in the cycle it is accepted. Each bank serves one miss
/// at a time and queues up to `mshr_size - 1` more; a miss on a block that
/// already waits for its fill is merged into that entry. Stores to a missing
/// block are applied once the block arrives. Modified lines go back to memory
/// when they are evicted or flushed.
#[derive(Debug)]
pub struct DataCache {
    config: config::DCache,
    tags: TagArray<Banked>,
    banks: Vec<Bank>,
    pub ldst: Port,
    /// Fill reads and writebacks in the order memory has to see them.
    outbox: VecDeque<MemRequest>,
    responses: VecDeque<DataResponse>,
    stats: stats::Cache,
}

impl DataCache {
    #[must_use]
    pub fn new(config: config::DCache) -> Self {
        let banked = Banked {
            block_size: config.block_size as u32,
            num_banks: config.num_banks,
            num_sets: config.num_sets(),
        };
        Self {
            tags: TagArray::with_translation(
                config.num_sets(),
                config.associativity,
                config.replacement_policy,
                banked,
            ),
            banks: (0..config.num_banks).map(|_| Bank::default()).collect(),
            ldst: Port::default(),
            outbox: VecDeque::new(),
            responses: VecDeque::new(),
            stats: stats::Cache::default(),
            config,
        }
    }

    #[must_use]
    pub fn tags(&self) -> &TagArray<Banked> {
        &self.tags
    }

    #[must_use]
    pub fn stats(&self) -> &stats::Cache {
        &self.stats
    }

    #[must_use]
    pub fn num_pending_misses(&self) -> usize {
        self.banks.iter().map(|bank| bank.entries.len()).sum()
    }

    /// No miss outstanding and nothing left to send to either side.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.ldst.req.is_valid()
            && !self.ldst.rsp.is_valid()
            && self.outbox.is_empty()
            && self.responses.is_empty()
            && self.num_pending_misses() == 0
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.tags.num_dirty() == 0
    }

    fn writeback(&mut self, block: EvictedBlock, cycle: u64) {
        log::debug!(
            "{}",
            style(format!(
                "cycle {cycle:03} dcache: writeback {:#010x}",
                block.block_addr
            ))
            .yellow()
        );
        self.stats.inc(RequestStatus::WRITEBACK);
        self.outbox.push_back(MemRequest::write(
            Source::LDST,
            block.block_addr,
            Payload::Bytes(block.data.to_vec()),
        ));
    }

    /// Queues a writeback for every modified line.
    pub fn flush(&mut self, cycle: u64) {
        for block in self.tags.flush() {
            self.writeback(block, cycle);
        }
    }

    /// Flushes and hands over every write not yet accepted by memory, oldest first.
    pub fn take_writebacks(&mut self, cycle: u64) -> Vec<MemRequest> {
        self.flush(cycle);
        self.outbox.drain(..).filter(MemRequest::is_write).collect()
    }

    /// Applies the lanes of `req` to the resident line at `index`.
    fn serve(
        &mut self,
        index: usize,
        req: DataRequest,
        hit: bool,
        cycle: u64,
    ) -> Result<DataResponse, Error> {
        let mut lanes = Vec::with_capacity(req.lanes.len());
        for mut access in req.lanes {
            let offset = access.addr.wrapping_sub(req.block_addr) as usize;
            if offset + access.size > self.config.block_size {
                return Err(Error::invariant(
                    cycle,
                    format!(
                        "dcache: lane {} access {:#010x}+{} leaves block {:#010x}",
                        access.lane, access.addr, access.size, req.block_addr
                    ),
                ));
            }
            let range = offset..offset + access.size;
            match req.kind {
                Kind::WRITE => {
                    let data = access
                        .data
                        .as_deref()
                        .filter(|data| data.len() == access.size)
                        .ok_or_else(|| {
                            Error::invariant(
                                cycle,
                                format!("dcache: store to {:#010x} carries no data", access.addr),
                            )
                        })?;
                    self.tags.write_line(index)[range].copy_from_slice(data);
                }
                Kind::READ => {
                    access.data = Some(self.tags.line(index).data[range].to_vec());
                }
            }
            lanes.push(access);
        }
        Ok(DataResponse {
            block_addr: req.block_addr,
            kind: req.kind,
            uid: req.uid,
            lanes,
            hit,
        })
    }

    fn handle_fill(&mut self, mem: &mut mcu::Port, cycle: u64) -> Result<(), Error> {
        let Some(resp) = mem.rsp.pop() else {
            return Ok(());
        };
        if resp.kind == Kind::WRITE {
            log::trace!("cycle {:03} dcache: {} done", cycle, resp);
            return Ok(());
        }
        let bank = self.tags.addr_translation().bank(resp.addr);
        let entry = match self.banks[bank].entries.pop_front() {
            Some(entry) if entry.issued && entry.block_addr == resp.addr => entry,
            entry => {
                return Err(Error::invariant(
                    cycle,
                    format!(
                        "dcache: fill {resp} does not match bank {bank} miss {:?}",
                        entry.map(|entry| entry.block_addr)
                    ),
                ))
            }
        };
        let block: Block = resp.data.into_iter().collect();
        self.stats.inc(RequestStatus::FILL);
        if let Some(evicted) = self.tags.fill_line(entry.block_addr, block, cycle) {
            self.stats.inc(RequestStatus::EVICTION);
            if evicted.modified {
                self.writeback(evicted, cycle);
            }
        }
        log::debug!(
            "{}",
            style(format!(
                "cycle {cycle:03} dcache: fill {:#010x} serves {} requests",
                entry.block_addr,
                entry.requests.len()
            ))
            .green()
        );
        let index = self.tags.probe(entry.block_addr).index;
        for req in entry.requests {
            let resp = self.serve(index, req, false, cycle)?;
            self.responses.push_back(resp);
        }
        Ok(())
    }

    /// Takes at most one request from the load/store unit.
    fn accept(&mut self, cycle: u64) -> Result<(), Error> {
        let Some(req) = self.ldst.req.snoop() else {
            return Ok(());
        };
        let block_addr = req.block_addr;
        let bank = self.tags.addr_translation().bank(block_addr);
        let pending = self.banks[bank]
            .entries
            .iter()
            .position(|entry| entry.block_addr == block_addr);
        let status = self.tags.probe(block_addr).status;
        if pending.is_none()
            && status == ProbeStatus::MISS
            && self.banks[bank].entries.len() >= self.config.mshr_size
        {
            self.stats.inc(RequestStatus::STALLED);
            return Ok(());
        }
        let Some(req) = self.ldst.req.pop() else {
            return Ok(());
        };

        if let Some(pos) = pending {
            log::debug!("cycle {:03} dcache: merge {} into bank {}", cycle, req, bank);
            self.stats.inc(RequestStatus::MSHR_HIT);
            self.banks[bank].entries[pos].requests.push(req);
            return Ok(());
        }
        let status = self.tags.access(block_addr, cycle);
        match status.status {
            ProbeStatus::HIT => {
                self.stats.inc(RequestStatus::HIT);
                log::debug!(
                    "{}",
                    style(format!("cycle {cycle:03} dcache: hit {req}")).green()
                );
                let resp = self.serve(status.index, req, true, cycle)?;
                self.responses.push_back(resp);
            }
            ProbeStatus::MISS => {
                self.stats.inc(RequestStatus::MISS);
                log::debug!(
                    "{}",
                    style(format!("cycle {cycle:03} dcache: miss {req} in bank {bank}")).red()
                );
                self.banks[bank].entries.push_back(MshrEntry {
                    block_addr,
                    requests: vec![req],
                    issued: false,
                });
            }
        }
        Ok(())
    }

    /// Queues the fill of every bank whose oldest miss has not been requested.
    fn launch_fills(&mut self) {
        for bank in &mut self.banks {
            if let Some(entry) = bank.entries.front_mut().filter(|entry| !entry.issued) {
                entry.issued = true;
                self.outbox.push_back(MemRequest::read(
                    Source::LDST,
                    entry.block_addr,
                    self.config.block_size,
                ));
            }
        }
    }

    #[tracing::instrument(name = "dcache", skip_all)]
    pub fn cycle(&mut self, mem: &mut mcu::Port, cycle: u64) -> Result<(), Error> {
        // writebacks of this fill are queued before any new fill request
        self.handle_fill(mem, cycle)?;
        self.accept(cycle)?;
        self.launch_fills();

        if let Some(req) = self.outbox.pop_front() {
            if let Err(req) = mem.req.push(req) {
                self.outbox.push_front(req);
            }
        }
        if let Some(resp) = self.responses.pop_front() {
            if let Err(resp) = self.ldst.rsp.push(resp) {
                self.responses.push_front(resp);
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for DataCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{STAGE}[misses={}, outbox={}, responses={}, dirty={}]",
            self.num_pending_misses(),
            self.outbox.len(),
            self.responses.len(),
            self.tags.num_dirty()
        )
    }
}
