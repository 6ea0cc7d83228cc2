use std::{
    cell::RefCell,
    marker::PhantomData,
    sync::{Arc, Weak},
};

use super::{
    memory::{check_protection, validate_region},
    ExitReport, GuestMemory, Hypervisor, InterruptLine, MemoryFlags, MemoryRegion, Registers,
    Result, SpecialRegisters, Vcpu, Vm,
};

/// A VM context plus the guest memory slots registered into it.
///
/// `'h` ties the VM to its hypervisor handle, `'m` to every registered
/// [`GuestMemory`]: both have to outlive the VM. `'m` is invariant, so a
/// registration cannot pick a shorter lifetime than the VM's own:
///
/// ```compile_fail
/// let vm = VirtualMachine::create(&hypervisor)?;
/// {
///     let memory = GuestMemory::allocate(0x10_0000)?;
///     vm.register_memory(0, 0xFFF0_0000, &memory, MemoryFlags::empty())?;
/// } // `memory` dropped here while still borrowed by `vm`
/// ```
pub struct VirtualMachine<'h, 'm> {
    vm: Box<dyn Vm + 'h>,
    page_size: u64,
    vcpu_mmap_size: usize,
    regions: RefCell<Vec<MemoryRegion>>,
    _memory: PhantomData<fn(&'m GuestMemory) -> &'m GuestMemory>,
}

impl<'h, 'm> VirtualMachine<'h, 'm> {
    pub fn create<H: Hypervisor + ?Sized>(hypervisor: &'h H) -> Result<Self> {
        let vcpu_mmap_size = hypervisor.vcpu_mmap_size()?;
        let vm = hypervisor.create_vm()?;

        Ok(Self {
            vm,
            page_size: hypervisor.page_size(),
            vcpu_mmap_size,
            regions: RefCell::new(Vec::new()),
            _memory: PhantomData,
        })
    }

    /// Installs `memory` at `guest_phys_addr` under `slot`.
    ///
    /// Nothing is registered when this fails, so slots that were already
    /// installed stay as they were.
    pub fn register_memory(
        &self,
        slot: u32,
        guest_phys_addr: u64,
        memory: &'m GuestMemory,
        flags: MemoryFlags,
    ) -> Result<MemoryRegion> {
        let region = MemoryRegion {
            slot,
            flags,
            guest_phys_addr,
            size: memory.len() as u64,
            host_addr: memory.host_address(),
        };

        log::info!(
            "Setting up slot {} at GPA {:#x} ({:#x} bytes) from host address {:#x}",
            slot,
            guest_phys_addr,
            region.size,
            region.host_addr
        );

        validate_region(&region, self.page_size, &self.regions.borrow())?;
        check_protection(memory.protection(), flags)?;

        // The `'m` borrow keeps the mapping alive for as long as this VM.
        unsafe { self.vm.set_memory_region(&region)? };

        self.regions.borrow_mut().push(region);

        Ok(region)
    }

    pub fn regions(&self) -> Vec<MemoryRegion> {
        self.regions.borrow().clone()
    }

    pub fn create_vcpu(&self, id: u64) -> Result<VirtualCpu<'_>> {
        VirtualCpu::create(self, id)
    }

    /// Closes the VM context. Same as dropping it.
    pub fn destroy(self) {}
}

impl Drop for VirtualMachine<'_, '_> {
    fn drop(&mut self) {
        log::debug!(
            "Destroying VM with {} memory slot(s)",
            self.regions.borrow().len()
        );
    }
}

/// A vCPU owned by the caller for its whole life: created from a VM,
/// released before it.
pub struct VirtualCpu<'v> {
    id: u64,
    vcpu: Box<dyn Vcpu + 'v>,
    line: Arc<dyn InterruptLine>,
}

impl<'v> VirtualCpu<'v> {
    /// Creates the vCPU and opens its interrupt window so injected
    /// interrupts are queued rather than dropped.
    pub fn create(vm: &'v VirtualMachine<'_, '_>, id: u64) -> Result<Self> {
        let mut vcpu = vm.vm.create_vcpu(id)?;

        log::info!(
            "Created vCPU {}, run-state view is {} bytes",
            id,
            vm.vcpu_mmap_size
        );

        vcpu.set_request_interrupt_window(true);
        let line = vcpu.interrupt_line();

        Ok(Self { id, vcpu, line })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn get_registers(&self) -> Result<Registers> {
        self.vcpu.get_regs()
    }

    pub fn set_registers(&mut self, regs: &Registers) -> Result<()> {
        self.vcpu.set_regs(regs)
    }

    pub fn get_special_registers(&self) -> Result<SpecialRegisters> {
        self.vcpu.get_sregs()
    }

    pub fn set_special_registers(&mut self, sregs: &SpecialRegisters) -> Result<()> {
        self.vcpu.set_sregs(sregs)
    }

    pub fn set_instruction_pointer(&mut self, ip: u64) -> Result<()> {
        let mut regs = self.vcpu.get_regs()?;
        regs.rip = ip;
        self.vcpu.set_regs(&regs)
    }

    pub fn get_instruction_pointer(&self) -> Result<u64> {
        Ok(self.vcpu.get_regs()?.rip)
    }

    /// Rewrites the code segment base, leaving every other special
    /// register as the hypervisor reported it.
    pub fn correct_code_segment(&mut self, base: u64) -> Result<SpecialRegisters> {
        let mut sregs = self.vcpu.get_sregs()?;
        log::info!(
            "Starting CS: Base {:#x} Limit {:#x} Selector {:#x}",
            sregs.cs.base,
            sregs.cs.limit,
            sregs.cs.selector
        );

        sregs.cs.base = base;
        self.vcpu.set_sregs(&sregs)?;
        log::info!(
            "Corrected CS: Base {:#x} Limit {:#x} Selector {:#x}",
            sregs.cs.base,
            sregs.cs.limit,
            sregs.cs.selector
        );

        Ok(sregs)
    }

    pub fn request_interrupt_window(&mut self) -> bool {
        self.vcpu.request_interrupt_window()
    }

    pub fn set_request_interrupt_window(&mut self, enabled: bool) {
        self.vcpu.set_request_interrupt_window(enabled)
    }

    pub fn ready_for_interrupt_injection(&mut self) -> bool {
        self.vcpu.ready_for_interrupt_injection()
    }

    /// Runs the guest until it exits. Blocks for as long as the guest runs.
    pub fn run(&mut self) -> Result<ExitReport> {
        if !self.vcpu.request_interrupt_window() {
            log::warn!(
                "vCPU {} runs without an interrupt window, injected interrupts may be lost",
                self.id
            );
        }

        let exit = self.vcpu.run()?;
        log::info!("vCPU {} exited: {}", self.id, exit);

        Ok(exit)
    }

    /// Injects an interrupt from the thread that owns the vCPU.
    pub fn inject_interrupt(&self, vector: u32) -> Result<()> {
        self.line.inject(vector)
    }

    /// A non-owning handle other threads use to kick and interrupt this vCPU.
    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle {
            vcpu_id: self.id,
            line: Arc::downgrade(&self.line),
        }
    }

    /// Unmaps the run-state view and closes the vCPU. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for VirtualCpu<'_> {
    fn drop(&mut self) {
        log::debug!("Releasing vCPU {}", self.id);
    }
}

/// Weak reference to a vCPU's interrupt line.
///
/// Upgrading fails once the vCPU has been released.
#[derive(Clone)]
pub struct InterruptHandle {
    vcpu_id: u64,
    line: Weak<dyn InterruptLine>,
}

impl InterruptHandle {
    pub fn vcpu_id(&self) -> u64 {
        self.vcpu_id
    }

    pub fn upgrade(&self) -> Option<Arc<dyn InterruptLine>> {
        self.line.upgrade()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::{
        sim::{SimConfig, SimEvent, SimHypervisor},
        x86_64::{COUNTING_LOOP, NOP, RESET_CS_BASE, RESET_IP, RESET_VECTOR_OFFSET},
        ExitReason, VmError,
    };

    const MIB: usize = 1024 * 1024;
    const GPA: u64 = 0xFFF0_0000;

    fn loop_memory() -> GuestMemory {
        let mut memory = GuestMemory::allocate(MIB).unwrap();
        memory.fill(NOP);
        memory.write_at(RESET_VECTOR_OFFSET, &COUNTING_LOOP).unwrap();
        memory
    }

    #[test]
    fn overlapping_registration_fails_and_keeps_slot_zero() {
        let hv = SimHypervisor::new();
        let low = GuestMemory::allocate(MIB).unwrap();
        let high = GuestMemory::allocate(MIB).unwrap();
        let vm = VirtualMachine::create(&hv).unwrap();

        let slot0 = vm
            .register_memory(0, GPA, &low, MemoryFlags::empty())
            .unwrap();
        let err = vm
            .register_memory(1, GPA + 0x8_0000, &high, MemoryFlags::empty())
            .unwrap_err();

        assert!(matches!(err, VmError::InvalidRegion(_)));
        assert_eq!(vm.regions(), vec![slot0]);
        assert_eq!(hv.probe().registered_slots(), vec![0]);
    }

    #[test]
    fn misaligned_base_is_rejected_before_reaching_the_backend() {
        let hv = SimHypervisor::new();
        let memory = GuestMemory::allocate(MIB).unwrap();
        let vm = VirtualMachine::create(&hv).unwrap();

        let err = vm
            .register_memory(0, GPA + 0x10, &memory, MemoryFlags::empty())
            .unwrap_err();

        assert!(matches!(err, VmError::InvalidRegion(_)));
        assert!(vm.regions().is_empty());
        assert!(hv.probe().registered_slots().is_empty());
    }

    #[test]
    fn read_only_mapping_cannot_back_writable_slot() {
        let hv = SimHypervisor::new();
        let memory = GuestMemory::allocate_with(
            crate::vmm::host_page_size() as usize,
            crate::vmm::Protection::READ,
        )
        .unwrap();
        let vm = VirtualMachine::create(&hv).unwrap();

        assert!(matches!(
            vm.register_memory(0, 0, &memory, MemoryFlags::empty()),
            Err(VmError::Permission(_))
        ));
        assert!(vm
            .register_memory(0, 0, &memory, MemoryFlags::READONLY)
            .is_ok());
    }

    #[test]
    fn backend_rejection_is_propagated() {
        let hv = SimHypervisor::with_config(SimConfig {
            fail_memory_registration: Some(libc::EFAULT),
            ..SimConfig::default()
        });
        let memory = GuestMemory::allocate(MIB).unwrap();
        let vm = VirtualMachine::create(&hv).unwrap();

        assert!(matches!(
            vm.register_memory(0, GPA, &memory, MemoryFlags::empty()),
            Err(VmError::Permission(_))
        ));
        assert!(vm.regions().is_empty());
    }

    #[test]
    fn teardown_in_reverse_order_leaks_nothing() {
        let hv = SimHypervisor::new();
        let probe = hv.probe();
        {
            let memory = loop_memory();
            let vm = VirtualMachine::create(&hv).unwrap();
            let vcpu = vm.create_vcpu(0).unwrap();
            vm.register_memory(0, GPA, &memory, MemoryFlags::empty())
                .unwrap();

            assert_eq!(probe.open_handles(), 3);
            assert_eq!(probe.live_mappings(), 1);

            vcpu.release();
            vm.destroy();
            memory.release();
        }
        drop(hv);

        assert_eq!(probe.open_handles(), 0);
        assert_eq!(probe.live_mappings(), 0);
        assert_eq!(
            probe.events(),
            vec![
                SimEvent::OpenDevice,
                SimEvent::CreateVm,
                SimEvent::CreateVcpu(0),
                SimEvent::MapRunState(0),
                SimEvent::SetMemoryRegion(0),
                SimEvent::UnmapRunState(0),
                SimEvent::CloseVcpu(0),
                SimEvent::DestroyVm,
                SimEvent::CloseDevice,
            ]
        );
    }

    #[test]
    fn registered_memory_outlives_its_slot() {
        let hv = SimHypervisor::with_config(SimConfig {
            time_slice: Some(100),
            ..SimConfig::default()
        });
        let probe = hv.probe();
        let memory = loop_memory();
        {
            let vm = VirtualMachine::create(&hv).unwrap();
            let mut vcpu = vm.create_vcpu(0).unwrap();
            vm.register_memory(0, GPA, &memory, MemoryFlags::empty())
                .unwrap();
            vcpu.correct_code_segment(RESET_CS_BASE).unwrap();
            vcpu.set_instruction_pointer(RESET_IP).unwrap();

            assert_eq!(probe.registered_slots(), vec![0]);
            assert!(!vcpu.run().unwrap().is_internal_error());
        }

        // The slot went away with the VM, only now may the mapping go.
        assert!(probe.registered_slots().is_empty());
        assert_eq!(memory.read_at(RESET_VECTOR_OFFSET, 4).unwrap(), COUNTING_LOOP);
        memory.release();
    }

    #[test]
    fn vm_creation_failure_is_a_creation_error() {
        let hv = SimHypervisor::with_config(SimConfig {
            fail_vm_creation: true,
            ..SimConfig::default()
        });

        let err = VirtualMachine::create(&hv).err().unwrap();
        assert!(matches!(err, VmError::VmCreation(_)));
        assert_eq!(err.exit_code(), 3);
        assert_eq!(hv.probe().open_handles(), 1);
    }

    #[test]
    fn vcpu_creation_failure_is_typed() {
        let hv = SimHypervisor::with_config(SimConfig {
            fail_vcpu_creation: true,
            ..SimConfig::default()
        });
        let vm = VirtualMachine::create(&hv).unwrap();

        assert!(matches!(
            vm.create_vcpu(0),
            Err(VmError::VcpuCreation { id: 0, .. })
        ));
        assert_eq!(hv.probe().open_handles(), 2);
    }

    #[test]
    fn code_segment_correction_sticks_regardless_of_reset_base() {
        for reported in [0x000F_0000, 0xFFFF_0000, 0x1234_5000] {
            let hv = SimHypervisor::with_config(SimConfig {
                reset_cs_base: reported,
                ..SimConfig::default()
            });
            let vm = VirtualMachine::create(&hv).unwrap();
            let mut vcpu = vm.create_vcpu(0).unwrap();

            let before = vcpu.get_special_registers().unwrap();
            assert_eq!(before.cs.base, reported);

            vcpu.correct_code_segment(RESET_CS_BASE).unwrap();

            let after = vcpu.get_special_registers().unwrap();
            assert_eq!(after.cs.base, RESET_CS_BASE);
            assert_eq!(after.cs.selector, before.cs.selector);
            assert_eq!(after.cs.limit, before.cs.limit);
            assert_eq!(after.ds.base, before.ds.base);
        }
    }

    #[test]
    fn special_register_failures_are_typed() {
        let hv = SimHypervisor::with_config(SimConfig {
            fail_special_registers: true,
            ..SimConfig::default()
        });
        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();

        assert!(matches!(
            vcpu.correct_code_segment(RESET_CS_BASE),
            Err(VmError::StateQuery("special registers", _))
        ));
        assert!(matches!(
            vcpu.set_special_registers(&SpecialRegisters::default()),
            Err(VmError::StateUpdate("special registers", _))
        ));
    }

    #[test]
    fn uncorrected_code_segment_fetches_outside_guest_memory() {
        let hv = SimHypervisor::with_config(SimConfig {
            reset_cs_base: 0x000F_0000,
            ..SimConfig::default()
        });
        let memory = loop_memory();
        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();
        vm.register_memory(0, GPA, &memory, MemoryFlags::empty())
            .unwrap();
        vcpu.set_instruction_pointer(RESET_IP).unwrap();

        let exit = vcpu.run().unwrap();

        assert!(exit.is_internal_error());
        assert!(exit.suberror.is_some());
    }

    #[test]
    fn interrupt_window_is_requested_at_creation() {
        let hv = SimHypervisor::new();
        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();

        assert!(vcpu.request_interrupt_window());

        vcpu.set_request_interrupt_window(false);
        assert!(!vcpu.request_interrupt_window());
    }

    #[test]
    fn open_window_exits_once_guest_accepts_interrupts() {
        let hv = SimHypervisor::with_config(SimConfig {
            time_slice: Some(64),
            ..SimConfig::default()
        });
        let memory = loop_memory();
        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();
        vm.register_memory(0, GPA, &memory, MemoryFlags::empty())
            .unwrap();
        vcpu.correct_code_segment(RESET_CS_BASE).unwrap();

        // Interrupts masked: the window never opens, the time slice ends the run.
        assert_eq!(vcpu.run().unwrap().reason, ExitReason::Interrupted);
        assert!(!vcpu.ready_for_interrupt_injection());

        let mut regs = vcpu.get_registers().unwrap();
        regs.rflags |= crate::vmm::x86_64::RFlags::IF.bits();
        vcpu.set_registers(&regs).unwrap();

        assert_eq!(vcpu.run().unwrap().reason, ExitReason::IrqWindowOpen);
        assert!(vcpu.ready_for_interrupt_injection());

        // Without the request the same guest state keeps running.
        vcpu.set_request_interrupt_window(false);
        assert_eq!(vcpu.run().unwrap().reason, ExitReason::Interrupted);
    }

    #[test]
    fn handle_goes_dead_with_its_vcpu() {
        let hv = SimHypervisor::new();
        let vm = VirtualMachine::create(&hv).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();
        let handle = vcpu.interrupt_handle();

        assert_eq!(handle.vcpu_id(), 0);
        assert!(handle.upgrade().is_some());

        vcpu.release();
        assert!(handle.upgrade().is_none());
    }

    #[test]
    fn second_pending_interrupt_is_rejected_without_harm() {
        let hv = SimHypervisor::new();
        let vm = VirtualMachine::create(&hv).unwrap();
        let vcpu = vm.create_vcpu(0).unwrap();

        vcpu.inject_interrupt(3).unwrap();
        let err = vcpu.inject_interrupt(4).unwrap_err();

        assert!(err.is_recoverable());
        assert!(vcpu.get_registers().is_ok());
    }
}
