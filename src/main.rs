use std::path::PathBuf;
use std::process::exit;

use clap::Parser;
use tracing::{error, info};

use crate::core::config::MachineConfig;
use crate::core::emu::{Emulator, StepOutcome};

mod core;
mod log;

const EMU_NAME: &str = "r-r4000";
const EMU_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = EMU_NAME, version, about = "MIPS R4000 full-system simulator")]
struct Args {
    /// Machine configuration file (YAML); a default machine is built
    /// without one
    config: Option<PathBuf>,

    /// Stop after this many machine cycles
    #[arg(short, long)]
    steps: Option<u64>,

    /// Enable instruction tracing
    #[arg(short, long)]
    trace: bool,

    /// Initial log filter
    #[arg(long, default_value = "info")]
    log: String,
}

fn main() {
    let args = Args::parse();
    let _logger = log::Logger::new(&args.log);

    info!("Welcome to {} v{}", EMU_NAME, EMU_VERSION);

    let config = match args.config {
        Some(ref path) => match MachineConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                error!("{}", e);
                exit(1);
            }
        },
        None => MachineConfig::default(),
    };

    let mut emu = match Emulator::from_config(&config) {
        Ok(emu) => emu,
        Err(e) => {
            error!("{}", e);
            exit(1);
        }
    };

    if args.trace {
        emu.bus_mut().trace = true;
    }

    let steps = args.steps.or(config.steps);
    info!(
        "Machine ready: {} cpu(s), {} memory area(s)",
        emu.cpu_count(),
        emu.bus().areas().len()
    );

    let outcome = emu.run(steps);
    match outcome {
        StepOutcome::Halted => info!("Machine halted"),
        StepOutcome::Interactive => info!("Machine stopped after {} cycles", emu.msteps()),
        StepOutcome::Continue => unreachable!(),
    }

    emu.shutdown();
}
