use std::{error::Error, path::PathBuf, time::Duration};

use clap::Parser;

use orchestrator::{Orchestrator, RunConfig, RunSummary};
use vmm::{
    sim::{SimConfig, SimHypervisor},
    KvmHypervisor, VmError,
};

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
compile_error!("Only x86_64 Linux hosts with KVM are supported");

mod orchestrator;
mod vmm;

/// Runs a counting loop in a one-vCPU guest and knocks it out with an
/// injected interrupt.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Guest memory size in KiB; the window always ends at 4 GiB
    #[arg(long, default_value_t = 1024)]
    memory_kib: usize,

    /// Delay before the interrupt is injected
    #[arg(long, default_value_t = 1000)]
    delay_ms: u64,

    /// Interrupt vector to inject
    #[arg(long, default_value_t = 3)]
    vector: u32,

    /// Fill guest memory with random bytes before loading the program
    #[arg(long)]
    randomize: bool,

    /// Refuse to run on an unexpected KVM API version
    #[arg(long)]
    strict_api_version: bool,

    /// Raw real-mode code to place at the reset vector instead of the loop
    #[arg(long)]
    program: Option<PathBuf>,

    /// Use the in-process simulated hypervisor instead of /dev/kvm
    #[arg(long)]
    simulate: bool,
}

fn run(args: &Args) -> Result<RunSummary, VmError> {
    let mut config = RunConfig {
        interrupt_vector: args.vector,
        interrupt_delay: Duration::from_millis(args.delay_ms),
        randomize: args.randomize,
        strict_api_version: args.strict_api_version,
        ..RunConfig::default()
    }
    .with_memory_kib(args.memory_kib)?;

    if let Some(program) = &args.program {
        config = config.with_program_file(program)?;
    }

    let orchestrator = Orchestrator::new(config);

    if args.simulate {
        let hypervisor = SimHypervisor::with_config(SimConfig {
            reset_cs_base: vmm::x86_64::RESET_CS_BASE,
            ..SimConfig::default()
        });
        orchestrator.run(&hypervisor)
    } else {
        let hypervisor = KvmHypervisor::open()?;
        orchestrator.run(&hypervisor)
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let code = match run(&args) {
        Ok(summary) => {
            log::info!("{}", summary);
            if !summary.accumulator_advanced() {
                log::warn!("The guest did not advance the accumulator");
            }
            0
        }
        Err(err) => {
            log::error!("{}", err);
            let mut source = err.source();
            while let Some(cause) = source {
                log::error!("  caused by: {}", cause);
                source = cause.source();
            }
            err.exit_code()
        }
    };

    std::process::exit(code);
}
