use crate::{
    dcache::{self, DataRequest, LaneAccess},
    fifo::Fifo,
    instruction::{self, Instruction},
    latch::Latch,
    mem_fetch::Kind,
    opcodes::{I_Op, Op, S_Op},
    warp::SquashView,
    Error, WARP_SIZE,
};
use console::style;
use std::collections::VecDeque;

pub const NAME: &str = "ldst";

/// Instruction whose block requests are being served.
#[derive(Debug)]
struct Access {
    instr: Instruction,
    pending: VecDeque<DataRequest>,
    outstanding: usize,
    /// Little-endian bytes loaded per lane.
    loaded: [[u8; 4]; WARP_SIZE],
}

impl Access {
    fn new(instr: Instruction, pending: VecDeque<DataRequest>) -> Self {
        Self {
            instr,
            pending,
            outstanding: 0,
            loaded: [[0; 4]; WARP_SIZE],
        }
    }

    fn is_done(&self) -> bool {
        self.pending.is_empty() && self.outstanding == 0
    }
}

/// Load/store unit.
///
/// Fed by issue through `IS_LDST`. The active lanes of an instruction are
/// coalesced into one request per data cache block. Requests are sent one
/// per cycle and may complete out of order; the instruction leaves through
/// the `ldst_ex_wb` latch once all of them came back.
#[derive(Debug)]
pub struct LoadStoreUnit {
    behind: Latch<Instruction>,
    queue: Fifo<Instruction>,
    block_size: u32,
    active: Option<Access>,
    next_writeback: Option<Instruction>,
    stats: stats::FunctionalUnit,
    coalescer: stats::Coalescer,
}

/// Access size in bytes and whether the loaded value is sign extended.
fn access_size(op: Op) -> Option<(usize, bool)> {
    match op {
        Op::I(I_Op::LW) | Op::S(S_Op::SW) => Some((4, false)),
        Op::I(I_Op::LH) => Some((2, true)),
        Op::I(I_Op::LB) => Some((1, true)),
        Op::S(S_Op::SH) => Some((2, false)),
        Op::S(S_Op::SB) => Some((1, false)),
        _ => None,
    }
}

fn lane_addr(instr: &Instruction, lane: usize) -> u32 {
    instr.rdat1[lane].wrapping_add(instr.imm as u32)
}

impl LoadStoreUnit {
    #[must_use]
    pub fn new(queue_size: usize, block_size: usize) -> Self {
        Self {
            behind: Latch::new("IS_LDST"),
            queue: Fifo::new(Some(queue_size)),
            block_size: block_size as u32,
            active: None,
            next_writeback: None,
            stats: stats::FunctionalUnit::default(),
            coalescer: stats::Coalescer::default(),
        }
    }

    #[must_use]
    pub fn output_interface() -> String {
        format!("{NAME}_ex_wb")
    }

    #[must_use]
    pub fn behind(&self) -> &Latch<Instruction> {
        &self.behind
    }

    pub fn behind_mut(&mut self) -> &mut Latch<Instruction> {
        &mut self.behind
    }

    #[must_use]
    pub fn stats(&self) -> &stats::FunctionalUnit {
        &self.stats
    }

    #[must_use]
    pub fn coalescer_stats(&self) -> &stats::Coalescer {
        &self.coalescer
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        !self.behind.is_valid()
            && self.queue.is_empty()
            && self.active.is_none()
            && self.next_writeback.is_none()
    }

    /// Groups the active lanes of `instr` by block, in lane order.
    ///
    /// A lane whose bytes cross a block boundary contributes to both blocks.
    fn coalesce(&self, instr: &Instruction) -> Result<VecDeque<DataRequest>, Error> {
        let (size, _) = access_size(instr.op).ok_or_else(|| Error::UnsupportedOperation {
            unit: NAME.to_string(),
            op: instr.op.to_string(),
        })?;
        let kind = match instr.op {
            Op::S(_) => Kind::WRITE,
            _ => Kind::READ,
        };
        let mut requests: VecDeque<DataRequest> = VecDeque::new();
        for lane in instr.pred.iter_ones() {
            let addr = lane_addr(instr, lane);
            let value = instr.rdat2[lane].to_le_bytes();
            let mut done = 0;
            while done < size {
                let piece_addr = addr.wrapping_add(done as u32);
                let block_addr = piece_addr & !(self.block_size - 1);
                let room = (self.block_size - (piece_addr - block_addr)) as usize;
                let len = room.min(size - done);
                let access = LaneAccess {
                    lane,
                    addr: piece_addr,
                    size: len,
                    data: (kind == Kind::WRITE).then(|| value[done..done + len].to_vec()),
                };
                match requests.iter_mut().find(|req| req.block_addr == block_addr) {
                    Some(req) => req.lanes.push(access),
                    None => requests.push_back(DataRequest {
                        block_addr,
                        kind,
                        lanes: vec![access],
                        uid: instr.uid,
                        warp_id: instr.warp_id,
                        group_id: instr.group_id,
                    }),
                }
                done += len;
            }
        }
        Ok(requests)
    }

    /// Takes the next queued instruction.
    ///
    /// A squashed instruction skips memory and is handed on untouched so
    /// writeback can release its scoreboard entries.
    fn start<S: SquashView + ?Sized>(&mut self, warps: &S, cycle: u64) -> Result<(), Error> {
        let Some(instr) = self.queue.first() else {
            return Ok(());
        };
        let stale = warps.is_stale(instr.group_id, instr.uid);
        // a store waits until it can no longer be squashed by an older jump
        if !stale
            && matches!(instr.op, Op::S(_))
            && warps.has_older_in_flight(instr.group_id, instr.uid)
        {
            self.stats.stall_cycles += 1;
            return Ok(());
        }
        let Some(mut instr) = self.queue.dequeue() else {
            return Ok(());
        };
        if stale {
            log::debug!("cycle {:03} ldst: skip stale {}", cycle, instr);
            self.active = Some(Access::new(instr, VecDeque::new()));
            return Ok(());
        }
        instr.mark_fu_enter(NAME, cycle);
        self.stats.record_instruction(instr.op.to_string());
        instr.wdat = [0; WARP_SIZE];
        let requests = self.coalesce(&instr)?;
        self.coalescer.lane_accesses += instr.active_lanes() as u64;
        self.coalescer.requests += requests.len() as u64;
        log::debug!(
            "{}",
            style(format!(
                "cycle {:03} ldst: start {} ({} lanes in {} requests)",
                cycle,
                instr,
                instr.active_lanes(),
                requests.len()
            ))
            .cyan()
        );
        self.active = Some(Access::new(instr, requests));
        Ok(())
    }

    fn handle_response(&mut self, port: &mut dcache::Port, cycle: u64) -> Result<(), Error> {
        let Some(resp) = port.rsp.pop() else {
            return Ok(());
        };
        let access = self
            .active
            .as_mut()
            .filter(|access| access.outstanding > 0 && access.instr.uid == resp.uid)
            .ok_or_else(|| Error::invariant(cycle, format!("ldst: unexpected response {resp}")))?;
        access.outstanding -= 1;
        if resp.kind == Kind::WRITE {
            return Ok(());
        }
        for piece in resp.lanes {
            let shift = piece.addr.wrapping_sub(lane_addr(&access.instr, piece.lane)) as usize;
            let data = piece.data.unwrap_or_default();
            let bytes = access
                .loaded
                .get_mut(piece.lane)
                .and_then(|bytes| bytes.get_mut(shift..shift + data.len()))
                .ok_or_else(|| {
                    Error::invariant(
                        cycle,
                        format!("ldst: lane {} got bytes for {:#010x}", piece.lane, piece.addr),
                    )
                })?;
            bytes.copy_from_slice(&data);
        }
        Ok(())
    }

    /// Hands the finished instruction to writeback with its loaded lanes.
    fn finish(&mut self, ahead: &mut Latch<Instruction>, cycle: u64) {
        let Some(access) = self.active.take() else {
            return;
        };
        let mut instr = access.instr;
        if let (Op::I(_), Some((size, signed))) = (instr.op, access_size(instr.op)) {
            for lane in instr.pred.iter_ones() {
                let raw = u32::from_le_bytes(access.loaded[lane]);
                instr.wdat[lane] = if signed {
                    instruction::sign_extend(raw, 8 * size as u32) as u32
                } else {
                    raw
                };
            }
        }
        instr.mark_fu_exit(NAME, cycle);
        log::debug!("cycle {:03} ldst: done {}", cycle, instr);
        if let Err(instr) = ahead.push(instr) {
            self.next_writeback = Some(instr);
        }
    }

    #[tracing::instrument(name = "ldst", skip_all)]
    pub fn cycle<S: SquashView + ?Sized>(
        &mut self,
        ahead: &mut Latch<Instruction>,
        port: &mut dcache::Port,
        warps: &S,
        cycle: u64,
    ) -> Result<(), Error> {
        self.stats.total_cycles += 1;

        if let Some(instr) = self.next_writeback.take() {
            if let Err(instr) = ahead.push(instr) {
                self.next_writeback = Some(instr);
                self.stats.stall_cycles += 1;
            }
        }

        self.handle_response(port, cycle)?;

        if let Some(access) = self.active.as_mut() {
            if let Some(req) = access.pending.pop_front() {
                match port.req.push(req) {
                    Ok(()) => access.outstanding += 1,
                    Err(req) => access.pending.push_front(req),
                }
            }
        }

        let done = self.active.as_ref().is_some_and(Access::is_done);
        if done && self.next_writeback.is_none() {
            self.finish(ahead, cycle);
        }

        if self.active.is_none() {
            self.start(warps, cycle)?;
        } else {
            self.stats.utilization_cycles += 1;
        }

        if !self.queue.full() {
            if let Some(instr) = self.behind.pop() {
                if let Err(instr) = self.queue.enqueue(instr) {
                    return Err(Error::Overflow {
                        buffer: format!("{NAME} queue ({instr})"),
                        capacity: self.queue.max_size().unwrap_or(0),
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for LoadStoreUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{NAME}[queued={}", self.queue.len())?;
        if let Some(access) = &self.active {
            write!(
                f,
                ", active={} ({} pending, {} outstanding)",
                access.instr,
                access.pending.len(),
                access.outstanding
            )?;
        }
        write!(f, "]")
    }
}
