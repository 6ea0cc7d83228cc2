//! Drives one guest run from device open to teardown.

use std::{fmt, path::Path, time::Duration};

use crate::vmm::{
    x86_64::{
        disassemble_real_mode, COUNTING_LOOP, GUEST_MEMORY_SIZE, GUEST_PHYS_BASE,
        INJECTED_VECTOR, KVM_API_VERSION, NOP, RESET_CS_BASE, RESET_IP, RESET_VECTOR_OFFSET,
    },
    ExitReason, ExitReport, GuestMemory, Hypervisor, InjectionOutcome, InterruptInjector,
    MemoryFlags, Result, VirtualMachine, VmError,
};

const FOUR_GIB: u64 = 1 << 32;

#[derive(Debug, Clone)]
pub struct RunConfig {
    pub memory_size: usize,
    /// Guest physical base of the single memory slot.
    pub guest_phys_base: u64,
    /// Where the program lands inside guest memory.
    pub program_offset: usize,
    pub program: Vec<u8>,
    pub fill_byte: u8,
    /// Overwrite memory with random bytes before loading the program.
    pub randomize: bool,
    pub reset_ip: u64,
    pub reset_cs_base: u64,
    pub interrupt_vector: u32,
    pub interrupt_delay: Duration,
    /// Refuse to run on an unexpected KVM API version instead of warning.
    pub strict_api_version: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            memory_size: GUEST_MEMORY_SIZE,
            guest_phys_base: GUEST_PHYS_BASE,
            program_offset: RESET_VECTOR_OFFSET,
            program: COUNTING_LOOP.to_vec(),
            fill_byte: NOP,
            randomize: false,
            reset_ip: RESET_IP,
            reset_cs_base: RESET_CS_BASE,
            interrupt_vector: INJECTED_VECTOR,
            interrupt_delay: Duration::from_secs(1),
            strict_api_version: false,
        }
    }
}

impl RunConfig {
    /// Resizes guest memory while keeping its top at 4 GiB. Fails when the
    /// reset vector would fall outside it.
    pub fn with_memory_size(mut self, memory_size: usize) -> Result<Self> {
        let reset_vector = self.reset_cs_base + self.reset_ip;
        let base = FOUR_GIB
            .checked_sub(memory_size as u64)
            .filter(|&base| base <= reset_vector)
            .ok_or_else(|| {
                VmError::InvalidRegion(format!(
                    "{:#x} bytes below 4 GiB cannot hold the reset vector {:#x}",
                    memory_size, reset_vector
                ))
            })?;

        self.memory_size = memory_size;
        self.guest_phys_base = base;
        self.program_offset = (reset_vector - base) as usize;

        Ok(self)
    }

    /// Same as [`RunConfig::with_memory_size`], sized in KiB.
    pub fn with_memory_kib(self, memory_kib: usize) -> Result<Self> {
        let memory_size = memory_kib.checked_mul(1024).ok_or_else(|| {
            VmError::InvalidRegion(format!("{} KiB overflows the host address space", memory_kib))
        })?;

        self.with_memory_size(memory_size)
    }

    /// Uses the contents of `path` as the guest program.
    pub fn with_program_file(mut self, path: &Path) -> Result<Self> {
        log::info!("Opening {}", path.display());

        let file = std::fs::File::open(path)?;
        let program = unsafe { memmap2::Mmap::map(&file)? };
        self.program = program.to_vec();

        Ok(self)
    }
}

/// What the guest did, read back after the run.
#[derive(Debug)]
pub struct RunSummary {
    pub api_version: i32,
    pub exit: ExitReport,
    pub initial_rax: u64,
    pub final_rip: u64,
    pub final_rax: u64,
    pub injection: InjectionOutcome,
}

impl RunSummary {
    /// The loop ran at least once between reset and the exit.
    pub fn accumulator_advanced(&self) -> bool {
        self.final_rax & 0xFFFF != self.initial_rax & 0xFFFF
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit_reason {:?}", self.exit.reason)?;
        if let Some(suberror) = self.exit.suberror {
            write!(f, ", suberror code {}", suberror)?;
        }
        write!(
            f,
            ", finishing IP: {:#x} RAX: {:#x}",
            self.final_rip, self.final_rax
        )
    }
}

pub struct Orchestrator {
    config: RunConfig,
}

impl Orchestrator {
    pub fn new(config: RunConfig) -> Self {
        Self { config }
    }

    fn check_api_version(&self, api_version: i32) -> Result<()> {
        if api_version == KVM_API_VERSION {
            return Ok(());
        }
        if self.config.strict_api_version {
            return Err(VmError::Compatibility {
                expected: KVM_API_VERSION,
                actual: api_version,
            });
        }

        log::warn!(
            "KVM API version {} differs from the expected {}",
            api_version,
            KVM_API_VERSION
        );
        Ok(())
    }

    fn prepare_memory(&self) -> Result<GuestMemory> {
        let config = &self.config;
        let mut memory = GuestMemory::allocate(config.memory_size)?;

        memory.fill(config.fill_byte);
        if config.randomize {
            memory.randomize()?;
        }

        let load_gpa = config.guest_phys_base + config.program_offset as u64;
        log::info!(
            "Loading {} byte(s) of guest code at GPA {:#x}",
            config.program.len(),
            load_gpa
        );
        disassemble_real_mode(&config.program, config.reset_ip);
        memory.write_at(config.program_offset, &config.program)?;

        Ok(memory)
    }

    /// Runs the guest once. Every object created here is released in reverse
    /// creation order before this returns, whatever the outcome.
    pub fn run<H: Hypervisor + ?Sized>(&self, hypervisor: &H) -> Result<RunSummary> {
        let config = &self.config;
        let api_version = hypervisor.api_version();
        self.check_api_version(api_version)?;

        let memory = self.prepare_memory()?;
        let vm = VirtualMachine::create(hypervisor)?;
        let mut vcpu = vm.create_vcpu(0)?;
        vm.register_memory(0, config.guest_phys_base, &memory, MemoryFlags::empty())?;

        log::info!("Pointing vCPU {} at the reset vector", vcpu.id());
        vcpu.set_instruction_pointer(config.reset_ip)?;
        vcpu.correct_code_segment(config.reset_cs_base)?;
        let initial_rax = vcpu.get_registers()?.rax;

        let injector = InterruptInjector::spawn(
            vcpu.interrupt_handle(),
            config.interrupt_vector,
            config.interrupt_delay,
        )?;

        let exit = vcpu.run();
        let injection = match &exit {
            Ok(report) if report.reason == ExitReason::Interrupted => injector.join(),
            _ => injector.cancel(),
        };
        let exit = exit?;

        if exit.is_internal_error() {
            log::error!("vCPU hit an internal error: {}", exit);
        }
        if let InjectionOutcome::Rejected(err) = &injection {
            log::warn!("Interrupt was not delivered: {}", err);
        }

        let regs = vcpu.get_registers()?;
        log::info!("Finishing IP: {:#x} RAX: {:#x}", regs.rip, regs.rax);

        Ok(RunSummary {
            api_version,
            exit,
            initial_rax,
            final_rip: regs.rip,
            final_rax: regs.rax,
            injection,
        })
    }
}
