//! An in-process hypervisor for exercising the lifecycle without `/dev/kvm`.
//!
//! It accounts for every handle and mapping it hands out, logs creation and
//! teardown in order, and interprets the handful of real-mode opcodes the
//! guest loop uses. Anything else the guest executes ends the run with an
//! emulation failure.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc, Mutex, MutexGuard,
};

use super::{
    error::os_error,
    x86_64::{RFlags, HLT, INTERNAL_ERROR_EMULATION, KVM_API_VERSION, NOP},
    ExitReason, ExitReport, Hypervisor, InterruptLine, MemoryRegion, Registers, Result,
    SpecialRegisters, Vcpu, Vm, VmError,
};

/// Knobs for the simulated hypervisor.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub api_version: i32,
    /// CS base the vCPU reports at reset. Defaults to the value early KVM
    /// reported, which the caller has to correct.
    pub reset_cs_base: u64,
    /// Instructions a run executes before a simulated host preemption ends it
    /// with `Interrupted`. `None` runs until kicked.
    pub time_slice: Option<u64>,
    pub vcpu_mmap_size: usize,
    pub fail_vm_creation: bool,
    pub fail_vcpu_creation: bool,
    pub fail_special_registers: bool,
    /// Errno returned for every memory slot installation.
    pub fail_memory_registration: Option<i32>,
    pub reject_interrupts: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            api_version: KVM_API_VERSION,
            reset_cs_base: 0x000F_0000,
            time_slice: None,
            vcpu_mmap_size: 0x3000,
            fail_vm_creation: false,
            fail_vcpu_creation: false,
            fail_special_registers: false,
            fail_memory_registration: None,
            reject_interrupts: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimEvent {
    OpenDevice,
    CreateVm,
    SetMemoryRegion(u32),
    CreateVcpu(u64),
    MapRunState(u64),
    UnmapRunState(u64),
    CloseVcpu(u64),
    DestroyVm,
    CloseDevice,
}

#[derive(Default)]
struct SimState {
    open_handles: AtomicUsize,
    live_mappings: AtomicUsize,
    events: Mutex<Vec<SimEvent>>,
    slots: Mutex<Vec<MemoryRegion>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // A test that panicked while holding the lock already failed.
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl SimState {
    fn record(&self, event: SimEvent) {
        lock(&self.events).push(event);
    }

    fn open(&self, event: SimEvent) {
        self.open_handles.fetch_add(1, Ordering::SeqCst);
        self.record(event);
    }

    fn close(&self, event: SimEvent) {
        self.open_handles.fetch_sub(1, Ordering::SeqCst);
        self.record(event);
    }
}

/// Read-only view of the simulator's bookkeeping that outlives the
/// hypervisor itself.
#[derive(Clone)]
pub struct SimProbe {
    state: Arc<SimState>,
}

impl SimProbe {
    pub fn open_handles(&self) -> usize {
        self.state.open_handles.load(Ordering::SeqCst)
    }

    pub fn live_mappings(&self) -> usize {
        self.state.live_mappings.load(Ordering::SeqCst)
    }

    pub fn events(&self) -> Vec<SimEvent> {
        lock(&self.state.events).clone()
    }

    pub fn registered_slots(&self) -> Vec<u32> {
        lock(&self.state.slots).iter().map(|r| r.slot).collect()
    }
}

pub struct SimHypervisor {
    config: SimConfig,
    state: Arc<SimState>,
}

impl SimHypervisor {
    pub fn new() -> Self {
        Self::with_config(SimConfig::default())
    }

    pub fn with_config(config: SimConfig) -> Self {
        let state = Arc::new(SimState::default());
        state.open(SimEvent::OpenDevice);

        Self { config, state }
    }

    pub fn probe(&self) -> SimProbe {
        SimProbe {
            state: self.state.clone(),
        }
    }
}

impl Default for SimHypervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for SimHypervisor {
    fn drop(&mut self) {
        self.state.close(SimEvent::CloseDevice);
    }
}

impl Hypervisor for SimHypervisor {
    fn api_version(&self) -> i32 {
        self.config.api_version
    }

    fn vcpu_mmap_size(&self) -> Result<usize> {
        Ok(self.config.vcpu_mmap_size)
    }

    fn create_vm(&self) -> Result<Box<dyn Vm + '_>> {
        if self.config.fail_vm_creation {
            return Err(VmError::VmCreation(os_error(libc::ENOMEM)));
        }

        self.state.open(SimEvent::CreateVm);

        Ok(Box::new(SimVm {
            config: &self.config,
            state: self.state.clone(),
        }))
    }
}

struct SimVm<'h> {
    config: &'h SimConfig,
    state: Arc<SimState>,
}

impl Drop for SimVm<'_> {
    fn drop(&mut self) {
        lock(&self.state.slots).clear();
        self.state.close(SimEvent::DestroyVm);
    }
}

impl Vm for SimVm<'_> {
    unsafe fn set_memory_region(&self, region: &MemoryRegion) -> Result<()> {
        if let Some(errno) = self.config.fail_memory_registration {
            return Err(match errno {
                libc::EPERM | libc::EACCES | libc::EFAULT => VmError::Permission(format!(
                    "slot {} rejected: {}",
                    region.slot,
                    os_error(errno)
                )),
                _ => VmError::InvalidRegion(format!(
                    "slot {} rejected: {}",
                    region.slot,
                    os_error(errno)
                )),
            });
        }

        lock(&self.state.slots).push(*region);
        self.state.record(SimEvent::SetMemoryRegion(region.slot));

        Ok(())
    }

    fn create_vcpu(&self, id: u64) -> Result<Box<dyn Vcpu + '_>> {
        if self.config.fail_vcpu_creation {
            return Err(VmError::VcpuCreation {
                id,
                source: os_error(libc::EINVAL),
            });
        }

        self.state.open(SimEvent::CreateVcpu(id));
        self.state.live_mappings.fetch_add(1, Ordering::SeqCst);
        self.state.record(SimEvent::MapRunState(id));

        let regs = Registers {
            rip: 0xFFF0,
            rflags: RFlags::RESERVED.bits(),
            ..Default::default()
        };
        let mut sregs = SpecialRegisters::default();
        sregs.cs.base = self.config.reset_cs_base;
        sregs.cs.selector = 0xF000;
        sregs.cs.limit = 0xFFFF;
        sregs.cs.present = 1;
        sregs.cs.s = 1;
        sregs.cs.type_ = 0xB;
        for segment in [
            &mut sregs.ds,
            &mut sregs.es,
            &mut sregs.fs,
            &mut sregs.gs,
            &mut sregs.ss,
        ] {
            segment.limit = 0xFFFF;
            segment.present = 1;
            segment.s = 1;
            segment.type_ = 0x3;
        }

        Ok(Box::new(SimVcpu {
            id,
            config: self.config,
            state: self.state.clone(),
            regs,
            sregs,
            request_interrupt_window: false,
            ready_for_interrupt_injection: false,
            line: Arc::new(SimInterruptLine {
                kicked: AtomicBool::new(false),
                pending: Mutex::new(None),
                reject: self.config.reject_interrupts,
            }),
        }))
    }
}

struct SimInterruptLine {
    kicked: AtomicBool,
    pending: Mutex<Option<u32>>,
    reject: bool,
}

impl InterruptLine for SimInterruptLine {
    fn kick(&self) {
        self.kicked.store(true, Ordering::SeqCst);
    }

    fn inject(&self, vector: u32) -> Result<()> {
        let errno = if self.reject {
            Some(libc::ENXIO)
        } else if vector > 0xFF {
            Some(libc::EINVAL)
        } else {
            None
        };
        if let Some(errno) = errno {
            return Err(VmError::InterruptDelivery {
                vector,
                source: os_error(errno),
            });
        }

        let mut pending = lock(&self.pending);
        if pending.is_some() {
            return Err(VmError::InterruptDelivery {
                vector,
                source: os_error(libc::EEXIST),
            });
        }
        *pending = Some(vector);

        Ok(())
    }
}

struct SimVcpu<'v> {
    id: u64,
    config: &'v SimConfig,
    state: Arc<SimState>,
    regs: Registers,
    sregs: SpecialRegisters,
    request_interrupt_window: bool,
    ready_for_interrupt_injection: bool,
    line: Arc<SimInterruptLine>,
}

impl Drop for SimVcpu<'_> {
    fn drop(&mut self) {
        self.state.live_mappings.fetch_sub(1, Ordering::SeqCst);
        self.state.record(SimEvent::UnmapRunState(self.id));
        self.state.close(SimEvent::CloseVcpu(self.id));
    }
}

enum Step {
    Continue,
    Exit(ExitReport),
}

impl SimVcpu<'_> {
    fn read_guest(&self, gpa: u64) -> Option<u8> {
        let slots = lock(&self.state.slots);
        let region = slots.iter().find(|r| r.contains(gpa))?;
        let offset = gpa - region.guest_phys_addr;

        // Registered regions are backed by mappings that outlive the VM.
        Some(unsafe { std::ptr::read_volatile((region.host_addr + offset) as *const u8) })
    }

    fn fetch(&self, ip: u64) -> Option<u8> {
        self.read_guest(self.sregs.cs.base.wrapping_add(ip & 0xFFFF))
    }

    fn advance(&mut self, len: u64) {
        self.regs.rip = (self.regs.rip + len) & 0xFFFF;
    }

    fn step(&mut self) -> Step {
        let emulation_failure = Step::Exit(ExitReport::internal_error(INTERNAL_ERROR_EMULATION));
        let ip = self.regs.rip;

        match self.fetch(ip) {
            Some(NOP) => self.advance(1),
            Some(HLT) => {
                self.advance(1);
                return Step::Exit(ExitReport::new(ExitReason::Hlt));
            }
            Some(0xFF) if self.fetch(ip + 1) == Some(0xC0) => {
                // inc ax
                let ax = (self.regs.rax as u16).wrapping_add(1);
                self.regs.rax = (self.regs.rax & !0xFFFF) | ax as u64;
                self.advance(2);
            }
            Some(0xEB) => match self.fetch(ip + 1) {
                Some(rel) => {
                    let target = (ip as i64 + 2 + rel as i8 as i64) as u64;
                    self.regs.rip = target & 0xFFFF;
                }
                None => return emulation_failure,
            },
            _ => return emulation_failure,
        }

        Step::Continue
    }

    fn interrupts_enabled(&self) -> bool {
        RFlags::from_bits_truncate(self.regs.rflags).contains(RFlags::IF)
    }

    fn execute(&mut self) -> ExitReport {
        let mut executed = 0u64;

        loop {
            if self.line.kicked.swap(false, Ordering::SeqCst) {
                return ExitReport::new(ExitReason::Interrupted);
            }

            if self.interrupts_enabled() {
                let mut pending = lock(&self.line.pending);
                if let Some(vector) = pending.take() {
                    // Acknowledged without vectoring through the IVT.
                    log::debug!("sim vCPU {} accepted vector {}", self.id, vector);
                } else if self.request_interrupt_window {
                    return ExitReport::new(ExitReason::IrqWindowOpen);
                }
            }

            if self.config.time_slice.map_or(false, |slice| executed >= slice) {
                return ExitReport::new(ExitReason::Interrupted);
            }

            if let Step::Exit(exit) = self.step() {
                return exit;
            }
            executed += 1;
        }
    }
}

impl Vcpu for SimVcpu<'_> {
    fn get_regs(&self) -> Result<Registers> {
        Ok(self.regs)
    }

    fn set_regs(&mut self, regs: &Registers) -> Result<()> {
        self.regs = *regs;
        Ok(())
    }

    fn get_sregs(&self) -> Result<SpecialRegisters> {
        if self.config.fail_special_registers {
            return Err(VmError::StateQuery("special registers", os_error(libc::EIO)));
        }

        Ok(self.sregs)
    }

    fn set_sregs(&mut self, sregs: &SpecialRegisters) -> Result<()> {
        if self.config.fail_special_registers {
            return Err(VmError::StateUpdate("special registers", os_error(libc::EIO)));
        }

        self.sregs = *sregs;
        Ok(())
    }

    fn run(&mut self) -> Result<ExitReport> {
        let exit = self.execute();
        self.ready_for_interrupt_injection =
            self.interrupts_enabled() && lock(&self.line.pending).is_none();

        Ok(exit)
    }

    fn request_interrupt_window(&mut self) -> bool {
        self.request_interrupt_window
    }

    fn set_request_interrupt_window(&mut self, enabled: bool) {
        self.request_interrupt_window = enabled;
    }

    fn ready_for_interrupt_injection(&mut self) -> bool {
        self.ready_for_interrupt_injection
    }

    fn interrupt_line(&self) -> Arc<dyn InterruptLine> {
        self.line.clone()
    }
}

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder, LittleEndian};

    use super::*;
    use crate::vmm::{
        x86_64::{COUNTING_LOOP, RESET_CS_BASE, RESET_VECTOR_OFFSET},
        GuestMemory, MemoryFlags, VirtualMachine,
    };

    const MIB: usize = 1024 * 1024;
    const GPA: u64 = 0xFFF0_0000;

    fn sliced(slice: u64) -> SimHypervisor {
        SimHypervisor::with_config(SimConfig {
            time_slice: Some(slice),
            ..SimConfig::default()
        })
    }

    #[test]
    fn nop_sled_runs_without_internal_errors() {
        let hv = sliced(10_000);
        let mut memory = GuestMemory::allocate(MIB).unwrap();
        memory.fill(NOP);
        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();
        vm.register_memory(0, GPA, &memory, MemoryFlags::empty())
            .unwrap();
        vcpu.correct_code_segment(RESET_CS_BASE).unwrap();

        // 16 slices of 10k NOPs cover the whole 64 KiB segment and wrap.
        for _ in 0..16 {
            let exit = vcpu.run().unwrap();
            assert!(!exit.is_internal_error(), "unexpected exit {}", exit);
            assert_eq!(exit.reason, ExitReason::Interrupted);
        }
    }

    #[test]
    fn counting_loop_increments_accumulator() {
        let hv = sliced(1_000);
        let mut memory = GuestMemory::allocate(MIB).unwrap();
        memory.fill(NOP);
        memory
            .write_at(RESET_VECTOR_OFFSET, &COUNTING_LOOP)
            .unwrap();
        assert_eq!(
            LittleEndian::read_u32(&memory.read_at(RESET_VECTOR_OFFSET, 4).unwrap()),
            0xFCEB_C0FF
        );

        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();
        vm.register_memory(0, GPA, &memory, MemoryFlags::empty())
            .unwrap();
        vcpu.correct_code_segment(RESET_CS_BASE).unwrap();

        vcpu.run().unwrap();
        let regs = vcpu.get_registers().unwrap();

        // 1000 instructions, alternating inc and jmp.
        assert_eq!(regs.rax, 500);
        assert_eq!(regs.rip, 0xFFF0);
    }

    #[test]
    fn halt_ends_the_run() {
        let hv = SimHypervisor::new();
        let mut memory = GuestMemory::allocate(MIB).unwrap();
        memory.fill(NOP);
        memory
            .write_at(RESET_VECTOR_OFFSET, &[NOP, NOP, HLT])
            .unwrap();
        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();
        vm.register_memory(0, GPA, &memory, MemoryFlags::empty())
            .unwrap();
        vcpu.correct_code_segment(RESET_CS_BASE).unwrap();

        let exit = vcpu.run().unwrap();

        assert_eq!(exit.reason, ExitReason::Hlt);
        assert_eq!(vcpu.get_instruction_pointer().unwrap(), 0xFFF3);
    }

    #[test]
    fn kick_before_run_returns_immediately() {
        let hv = SimHypervisor::new();
        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();

        vcpu.interrupt_handle().upgrade().unwrap().kick();

        assert_eq!(vcpu.run().unwrap().reason, ExitReason::Interrupted);
        assert_eq!(vcpu.get_instruction_pointer().unwrap(), 0xFFF0);
    }

    #[test]
    fn rejected_interrupts_report_the_vector() {
        let hv = SimHypervisor::with_config(SimConfig {
            reject_interrupts: true,
            ..SimConfig::default()
        });
        let vm = VirtualMachine::create(&hv).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();

        assert!(matches!(
            vcpu.inject_interrupt(3),
            Err(VmError::InterruptDelivery { vector: 3, .. })
        ));
    }
}
