use crate::{
    config::Config,
    dcache::DataCache,
    decode::Decode,
    engine::cycle::Component,
    execute::ExecuteStage,
    func_unit::{load_store, ArithmeticFunctionalUnit, LoadStoreUnit},
    icache::InstructionCache,
    instruction::Instruction,
    issue::{self, Issue},
    latch::{ForwardingIf, Latch},
    mcu::MemoryController,
    mem::{ImageFormat, Memory},
    register_file::{CsrFile, PredicateRegisterFile, RegisterFile},
    scheduler::{self, Redirect, WarpScheduler},
    scoreboard::Scoreboard,
    warp::Drained,
    writeback::{self, Writeback},
    Error,
};
use console::style;
use std::collections::BTreeMap;
use std::io::BufRead;

/// A single SIMT core with its memory.
///
/// Owns every stage, the latches between them and the architectural state.
/// [`Simulator::step`] advances all components by one clock edge, visiting
/// them from writeback back to the scheduler so every stage sees what its
/// neighbours held at the start of the cycle.
#[derive(Debug)]
pub struct Simulator {
    config: Config,
    cycle: u64,

    scheduler: WarpScheduler,
    icache: InstructionCache,
    decode: Decode,
    issue: Issue,
    execute: ExecuteStage,
    ldst: LoadStoreUnit,
    ldst_ex_wb: Latch<Instruction>,
    dcache: DataCache,
    writeback: Writeback,
    mcu: MemoryController,

    regs: RegisterFile,
    preds: PredicateRegisterFile,
    csrs: CsrFile,
    scoreboard: Scoreboard,

    redirects: ForwardingIf<Vec<Redirect>>,
    drain: ForwardingIf<Vec<Drained>>,
}

impl Simulator {
    pub fn new(config: Config, mem: Memory) -> Result<Self, Error> {
        config.validate()?;
        let core = &config.core;
        let execute = ExecuteStage::new(ArithmeticFunctionalUnit::all(&config.functional_units));
        let producers: Vec<String> = execute
            .sub_units()
            .map(|sub_unit| sub_unit.name().to_string())
            .chain(std::iter::once(load_store::NAME.to_string()))
            .collect();
        let writeback = Writeback::new(&config.writeback, core.warps_per_group, producers);
        Ok(Self {
            cycle: 0,
            scheduler: WarpScheduler::new(core),
            icache: InstructionCache::new(config.icache.clone()),
            decode: Decode::new(core.clone()),
            issue: Issue::new(core),
            execute,
            ldst: LoadStoreUnit::new(config.ldst.queue_size, config.dcache.block_size),
            ldst_ex_wb: Latch::new(LoadStoreUnit::output_interface()),
            dcache: DataCache::new(config.dcache.clone()),
            writeback,
            mcu: MemoryController::new(config.memory.clone(), mem),
            regs: RegisterFile::new(core.warps_per_group, core.num_warps, core.regs_per_warp),
            preds: PredicateRegisterFile::new(core.preds_per_warp, core.num_warps),
            csrs: CsrFile {
                block_id: 0,
                block_dim: core.block_dim,
                arg_ptr: core.arg_ptr,
            },
            scoreboard: Scoreboard::new(core.num_warps),
            redirects: ForwardingIf::new("redirects"),
            drain: ForwardingIf::new("drain"),
            config,
        })
    }

    /// Loads a program image at the configured start pc.
    pub fn load_program(&mut self, reader: impl BufRead, format: ImageFormat) -> Result<usize, Error> {
        let start_pc = self.config.core.start_pc;
        self.mcu.mem_mut().load_image(reader, format, start_pc)
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub fn mem(&self) -> &Memory {
        self.mcu.mem()
    }

    #[must_use]
    pub fn dcache(&self) -> &DataCache {
        &self.dcache
    }

    /// Applies every store still held by the data cache or in flight to memory.
    ///
    /// Used to dump memory after a run that did not finish.
    pub fn sync_memory(&mut self) -> Result<(), Error> {
        let mut writes: Vec<_> = self.mcu.pending_writes().cloned().collect();
        writes.extend(self.dcache.take_writebacks(self.cycle));
        for req in &writes {
            self.mcu.apply_write(req)?;
        }
        log::debug!("synced {} pending writes to memory", writes.len());
        Ok(())
    }

    /// Every group halted and has no instruction left in flight.
    fn drained(&self) -> bool {
        self.scheduler.all_halted()
            && self
                .scheduler
                .groups()
                .iter()
                .all(|group| group.in_flight.is_empty())
    }

    #[must_use]
    pub fn regs(&self) -> &RegisterFile {
        &self.regs
    }

    #[must_use]
    pub fn preds(&self) -> &PredicateRegisterFile {
        &self.preds
    }

    #[must_use]
    pub fn scheduler(&self) -> &WarpScheduler {
        &self.scheduler
    }

    /// Every group halted, nothing is left in flight and memory holds every store.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.drained()
            && self.icache.is_idle()
            && self.decode.is_idle()
            && self.issue.is_idle()
            && self.execute.is_idle()
            && self.ldst.is_idle()
            && !self.ldst_ex_wb.is_valid()
            && self.dcache.is_idle()
            && self.dcache.is_clean()
            && self.writeback.is_idle()
            && self.mcu.is_idle()
    }

    /// Advances every component by one cycle.
    #[tracing::instrument(name = "step", skip_all)]
    pub fn step(&mut self) -> Result<(), Error> {
        let cycle = self.cycle;
        log::debug!(
            "{}",
            style(format!("=============== cycle {cycle:03} ===============")).bold()
        );

        self.mcu.cycle(cycle)?;

        let commit = writeback::Commit {
            regs: &mut self.regs,
            preds: &mut self.preds,
            scoreboard: &mut self.scoreboard,
            redirects: &mut self.redirects,
            drain: &mut self.drain,
        };
        let inputs = self
            .execute
            .ahead_latches_mut()
            .values_mut()
            .chain(std::iter::once(&mut self.ldst_ex_wb));
        self.writeback
            .cycle(inputs, commit, self.scheduler.groups(), cycle)?;

        if self.drained() && self.ldst.is_idle() && !self.dcache.is_clean() {
            self.dcache.flush(cycle);
        }
        self.dcache.cycle(&mut self.mcu.ldst, cycle)?;

        self.ldst.cycle(
            &mut self.ldst_ex_wb,
            &mut self.dcache.ldst,
            self.scheduler.groups(),
            cycle,
        )?;

        self.execute.cycle(cycle)?;

        let targets = issue::Targets {
            execute: &mut self.execute,
            ldst: &mut self.ldst,
        };
        let registers = issue::Registers {
            regs: &self.regs,
            preds: &self.preds,
            csrs: &self.csrs,
        };
        self.issue.cycle(
            targets,
            &mut self.scoreboard,
            registers,
            self.scheduler.groups(),
            &mut self.drain,
            cycle,
        )?;

        self.decode.cycle(
            self.issue.behind_mut(),
            self.scheduler.groups(),
            &mut self.drain,
            cycle,
        )?;

        self.icache
            .cycle(self.decode.behind_mut(), &mut self.mcu.icache, cycle)?;

        let (fetch, ihit) = self.icache.fetch_interface();
        let signals = scheduler::Signals {
            ihit,
            ibuffer_full: self.issue.ibuffer_full(),
            events: self.decode.events_mut(),
            redirects: &mut self.redirects,
            drain: &mut self.drain,
        };
        self.scheduler.cycle(fetch, signals, cycle)?;

        log::trace!("cycle {:03} {}", cycle, self.scheduler);
        self.cycle += 1;
        Ok(())
    }

    /// Steps until the program finished or `max_cycles` elapsed.
    pub fn run(&mut self, max_cycles: u64) -> Result<stats::Stats, Error> {
        while !self.is_done() {
            if self.cycle >= max_cycles {
                return Err(Error::Timeout(max_cycles));
            }
            self.step()?;
        }
        log::info!(
            "finished after {} cycles ({} instructions retired)",
            self.cycle,
            self.scheduler.num_retired()
        );
        Ok(self.stats())
    }

    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        let mut functional_units: BTreeMap<String, stats::FunctionalUnit> = self
            .execute
            .sub_units()
            .map(|sub_unit| (sub_unit.name().to_string(), sub_unit.stats().clone()))
            .collect();
        functional_units.insert(load_store::NAME.to_string(), self.ldst.stats().clone());
        stats::Stats {
            sim: stats::Sim {
                cycles: self.cycle,
                instructions_retired: self.scheduler.num_retired(),
                instructions_squashed: self.scheduler.num_squashed(),
                issue_hazard_stalls: self.issue.hazard_stalls(),
                issue_unit_busy_stalls: self.issue.unit_busy_stalls(),
            },
            scheduler: self.scheduler.stats().clone(),
            icache: self.icache.stats().clone(),
            dcache: self.dcache.stats().clone(),
            coalescer: self.ldst.coalescer_stats().clone(),
            memory: self.mcu.stats().clone(),
            writeback: self.writeback.stats().clone(),
            functional_units,
        }
    }
}
