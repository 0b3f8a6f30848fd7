use clap::Parser;
use color_eyre::eyre::{self, WrapErr};
use simtpipe::{config::Config, mem::ImageFormat, mem::Memory, Simulator};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(author, version, about = "cycle accurate SIMT pipeline simulator", long_about = None)]
struct Options {
    /// Program image to load at the start pc
    #[arg(short, long, value_name = "PROGRAM")]
    program: PathBuf,
    /// Encoding of the program image
    #[arg(short, long, value_enum, default_value_t = ImageFormat::default())]
    format: ImageFormat,
    /// YAML machine configuration (defaults are used when omitted)
    #[arg(short, long, value_name = "CONFIG")]
    config: Option<PathBuf>,
    /// Give up after this many cycles
    #[arg(long, default_value_t = 1_000_000)]
    max_cycles: u64,
    /// Write a memory dump here when the run ends
    #[arg(long, value_name = "DUMP")]
    dump: Option<PathBuf>,
    /// Write performance counters as JSON here
    #[arg(long, value_name = "STATS")]
    stats: Option<PathBuf>,
    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    let options = Options::parse();
    init_logging(options.verbose);

    let config = match options.config {
        Some(ref path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let mut sim = Simulator::new(config, Memory::new())?;
    let reader = utils::fs::open_readable(&options.program)?;
    let num_words = sim
        .load_program(reader, options.format)
        .wrap_err_with(|| format!("failed to load {}", options.program.display()))?;
    log::info!("loaded {num_words} words from {}", options.program.display());

    let start = std::time::Instant::now();
    let result = sim.run(options.max_cycles);
    log::info!("simulated {} cycles in {:?}", sim.cycle(), start.elapsed());

    // the dump is written even when the run failed
    if let Some(ref path) = options.dump {
        sim.sync_memory()?;
        let writer = utils::fs::open_writable(path)?;
        sim.mem().dump(writer)?;
    }
    if let Some(ref path) = options.stats {
        let writer = utils::fs::open_writable(path)?;
        serde_json::to_writer_pretty(writer, &sim.stats())?;
    }

    let stats = result?;
    eprintln!(
        "cycles: {} retired: {} ipc: {:.3}",
        stats.sim.cycles,
        stats.sim.instructions_retired,
        stats.sim.ipc()
    );
    Ok(())
}
