//! KVM backend.

use std::{
    cell::Cell,
    os::fd::{AsRawFd, BorrowedFd, OwnedFd},
    ptr::null_mut,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Once,
    },
};

use kvm_bindings::{
    kvm_interrupt, kvm_run, kvm_userspace_memory_region, KVM_EXIT_DEBUG, KVM_EXIT_EXCEPTION,
    KVM_EXIT_FAIL_ENTRY, KVM_EXIT_HLT, KVM_EXIT_HYPERCALL, KVM_EXIT_INTERNAL_ERROR, KVM_EXIT_INTR,
    KVM_EXIT_IO, KVM_EXIT_IO_OUT, KVM_EXIT_IRQ_WINDOW_OPEN, KVM_EXIT_MMIO, KVM_EXIT_SHUTDOWN,
    KVM_EXIT_SYSTEM_EVENT, KVM_EXIT_UNKNOWN,
};
use kvm_ioctls::{Kvm, VcpuFd, VmFd};
use nix::sys::pthread::{pthread_self, Pthread};

use super::{
    error::os_error, ExitReason, ExitReport, Hypervisor, InterruptLine, IoDirection,
    MemoryRegion, Registers, Result, SpecialRegisters, Vcpu, Vm, VmError,
};

const KVMIO: u8 = 0xAE;
nix::ioctl_write_ptr!(kvm_interrupt_ioctl, KVMIO, 0x86, kvm_interrupt);

fn describe_unavailable() -> String {
    let cpu_id = raw_cpuid::CpuId::new();
    let vmx = cpu_id.get_feature_info().map_or(false, |f| f.has_vmx());
    let svm = cpu_id
        .get_extended_processor_and_feature_identifiers()
        .map_or(false, |f| f.has_svm());

    if vmx || svm {
        "cannot open /dev/kvm (check permissions and that the kvm module is loaded)".to_string()
    } else {
        "cannot open /dev/kvm and the CPU reports neither VMX nor SVM".to_string()
    }
}

/// The `/dev/kvm` connection.
pub struct KvmHypervisor {
    kvm: Kvm,
    api_version: i32,
}

impl KvmHypervisor {
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(|e| VmError::Unavailable {
            reason: describe_unavailable(),
            source: os_error(e.errno()),
        })?;
        log::info!("/dev/kvm open with FD {}", kvm.as_raw_fd());

        let api_version = kvm.get_api_version();
        log::info!("KVM API version is {}", api_version);

        Ok(Self { kvm, api_version })
    }
}

impl Drop for KvmHypervisor {
    fn drop(&mut self) {
        log::debug!("Closing /dev/kvm FD {}", self.kvm.as_raw_fd());
    }
}

impl Hypervisor for KvmHypervisor {
    fn api_version(&self) -> i32 {
        self.api_version
    }

    fn vcpu_mmap_size(&self) -> Result<usize> {
        self.kvm
            .get_vcpu_mmap_size()
            .map_err(|e| VmError::VmCreation(os_error(e.errno())))
    }

    fn create_vm(&self) -> Result<Box<dyn Vm + '_>> {
        let fd = self
            .kvm
            .create_vm()
            .map_err(|e| VmError::VmCreation(os_error(e.errno())))?;
        log::info!("Created a KVM VM FD: {}", fd.as_raw_fd());

        Ok(Box::new(KvmVm { fd }))
    }
}

struct KvmVm {
    fd: VmFd,
}

impl Drop for KvmVm {
    fn drop(&mut self) {
        log::debug!("Closing VM FD {}", self.fd.as_raw_fd());
    }
}

impl Vm for KvmVm {
    unsafe fn set_memory_region(&self, region: &MemoryRegion) -> Result<()> {
        self.fd
            .set_user_memory_region(kvm_userspace_memory_region {
                slot: region.slot,
                flags: region.flags.bits(),
                guest_phys_addr: region.guest_phys_addr,
                memory_size: region.size,
                userspace_addr: region.host_addr,
            })
            .map_err(|e| {
                let errno = e.errno();
                let detail = format!(
                    "KVM_SET_USER_MEMORY_REGION slot {}: {}",
                    region.slot,
                    os_error(errno)
                );
                match errno {
                    libc::EPERM | libc::EACCES | libc::EFAULT => VmError::Permission(detail),
                    libc::EINVAL | libc::EEXIST => VmError::InvalidRegion(detail),
                    _ => VmError::Io(os_error(errno)),
                }
            })?;
        log::info!("KVM_SET_USER_MEMORY_REGION slot {} installed", region.slot);

        Ok(())
    }

    fn create_vcpu(&self, id: u64) -> Result<Box<dyn Vcpu + '_>> {
        let fd = self
            .fd
            .create_vcpu(id)
            .map_err(|e| VmError::VcpuCreation {
                id,
                source: os_error(e.errno()),
            })?;
        log::info!("KVM_CREATE_VCPU: {}", fd.as_raw_fd());

        // The injector issues KVM_INTERRUPT through its own descriptor so it
        // never touches the VcpuFd that `run` holds mutably.
        let line_fd = unsafe { BorrowedFd::borrow_raw(fd.as_raw_fd()) }
            .try_clone_to_owned()
            .map_err(|source| VmError::VcpuCreation { id, source })?;

        install_kick_handler();

        Ok(Box::new(KvmVcpu {
            id,
            fd,
            line: Arc::new(KvmInterruptLine {
                fd: line_fd,
                runner: Mutex::new(None),
                kick_pending: AtomicBool::new(false),
            }),
        }))
    }
}

thread_local! {
    static RUNNING: Cell<*mut kvm_run> = const { Cell::new(null_mut()) };
}

fn kick_signal() -> libc::c_int {
    libc::SIGRTMIN()
}

extern "C" fn handle_kick(_: libc::c_int) {
    // Closes the window between the last kick check and entering KVM_RUN:
    // with immediate_exit set, KVM_RUN returns EINTR right away.
    RUNNING.with(|running| {
        let run = running.get();
        if !run.is_null() {
            unsafe { (*run).immediate_exit = 1 };
        }
    });
}

fn install_kick_handler() {
    static INSTALL: Once = Once::new();

    INSTALL.call_once(|| {
        let res = unsafe {
            let mut action: libc::sigaction = std::mem::zeroed();
            action.sa_sigaction = handle_kick as *const () as libc::sighandler_t;
            libc::sigemptyset(&mut action.sa_mask);
            libc::sigaction(kick_signal(), &action, null_mut())
        };
        if res != 0 {
            log::warn!(
                "Cannot install the vCPU kick handler: {}",
                std::io::Error::last_os_error()
            );
        }
    });
}

struct KvmInterruptLine {
    fd: OwnedFd,
    /// Thread currently inside KVM_RUN.
    runner: Mutex<Option<Pthread>>,
    kick_pending: AtomicBool,
}

impl KvmInterruptLine {
    /// Registers the calling thread as the runner. Returns `true` if a kick
    /// arrived since the last run, in which case the run must not start.
    fn begin_run(&self, run: *mut kvm_run) -> bool {
        let mut runner = self.runner.lock().unwrap_or_else(|p| p.into_inner());
        if self.kick_pending.swap(false, Ordering::SeqCst) {
            return true;
        }

        RUNNING.with(|running| running.set(run));
        *runner = Some(pthread_self());

        false
    }

    fn end_run(&self) {
        let mut runner = self.runner.lock().unwrap_or_else(|p| p.into_inner());
        *runner = None;
        RUNNING.with(|running| running.set(null_mut()));
        self.kick_pending.store(false, Ordering::SeqCst);
    }
}

impl InterruptLine for KvmInterruptLine {
    fn kick(&self) {
        let runner = self.runner.lock().unwrap_or_else(|p| p.into_inner());
        self.kick_pending.store(true, Ordering::SeqCst);

        if let Some(thread) = *runner {
            let res = unsafe { libc::pthread_kill(thread, kick_signal()) };
            if res != 0 {
                log::warn!("Cannot signal the vCPU thread: {}", os_error(res));
            }
        }
    }

    fn inject(&self, vector: u32) -> Result<()> {
        let interrupt = kvm_interrupt { irq: vector };

        // Blocks until the vCPU is outside KVM_RUN.
        unsafe { kvm_interrupt_ioctl(self.fd.as_raw_fd(), &interrupt) }
            .map(|_| ())
            .map_err(|errno| VmError::InterruptDelivery {
                vector,
                source: os_error(errno as i32),
            })
    }
}

struct KvmVcpu {
    id: u64,
    fd: VcpuFd,
    line: Arc<KvmInterruptLine>,
}

impl Drop for KvmVcpu {
    fn drop(&mut self) {
        log::debug!("Closing vCPU {} FD {}", self.id, self.fd.as_raw_fd());
    }
}

impl KvmVcpu {
    fn decode_exit(&mut self) -> ExitReport {
        let run = self.fd.get_kvm_run();

        // Union members are only read for the exit reason that selects them.
        let reason = unsafe {
            match run.exit_reason {
                KVM_EXIT_UNKNOWN => ExitReason::Unknown {
                    hardware_reason: run.__bindgen_anon_1.hw.hardware_exit_reason,
                },
                KVM_EXIT_EXCEPTION => ExitReason::Exception,
                KVM_EXIT_IO => {
                    let io = run.__bindgen_anon_1.io;
                    ExitReason::Io {
                        port: io.port,
                        direction: if io.direction as u32 == KVM_EXIT_IO_OUT {
                            IoDirection::Out
                        } else {
                            IoDirection::In
                        },
                    }
                }
                KVM_EXIT_HYPERCALL => ExitReason::Hypercall,
                KVM_EXIT_DEBUG => ExitReason::Debug,
                KVM_EXIT_HLT => ExitReason::Hlt,
                KVM_EXIT_MMIO => {
                    let mmio = run.__bindgen_anon_1.mmio;
                    ExitReason::Mmio {
                        address: mmio.phys_addr,
                        is_write: mmio.is_write != 0,
                    }
                }
                KVM_EXIT_IRQ_WINDOW_OPEN => ExitReason::IrqWindowOpen,
                KVM_EXIT_SHUTDOWN => ExitReason::Shutdown,
                KVM_EXIT_FAIL_ENTRY => ExitReason::FailEntry {
                    hardware_reason: run
                        .__bindgen_anon_1
                        .fail_entry
                        .hardware_entry_failure_reason,
                },
                KVM_EXIT_INTR => ExitReason::Interrupted,
                KVM_EXIT_INTERNAL_ERROR => {
                    return ExitReport::internal_error(run.__bindgen_anon_1.internal.suberror)
                }
                KVM_EXIT_SYSTEM_EVENT => ExitReason::SystemEvent,
                other => ExitReason::Other(other),
            }
        };

        ExitReport::new(reason)
    }
}

impl Vcpu for KvmVcpu {
    fn get_regs(&self) -> Result<Registers> {
        self.fd
            .get_regs()
            .map_err(|e| VmError::StateQuery("registers", os_error(e.errno())))
    }

    fn set_regs(&mut self, regs: &Registers) -> Result<()> {
        self.fd
            .set_regs(regs)
            .map_err(|e| VmError::StateUpdate("registers", os_error(e.errno())))
    }

    fn get_sregs(&self) -> Result<SpecialRegisters> {
        self.fd
            .get_sregs()
            .map_err(|e| VmError::StateQuery("special registers", os_error(e.errno())))
    }

    fn set_sregs(&mut self, sregs: &SpecialRegisters) -> Result<()> {
        self.fd
            .set_sregs(sregs)
            .map_err(|e| VmError::StateUpdate("special registers", os_error(e.errno())))
    }

    fn run(&mut self) -> Result<ExitReport> {
        let run_state: *mut kvm_run = self.fd.get_kvm_run();
        if self.line.begin_run(run_state) {
            return Ok(ExitReport::new(ExitReason::Interrupted));
        }

        let result = self.fd.run().map(|_| ());

        self.line.end_run();
        self.fd.get_kvm_run().immediate_exit = 0;

        match result {
            Ok(()) => Ok(self.decode_exit()),
            Err(e) if e.errno() == libc::EINTR => Ok(ExitReport::new(ExitReason::Interrupted)),
            Err(e) => Err(VmError::Run(os_error(e.errno()))),
        }
    }

    fn request_interrupt_window(&mut self) -> bool {
        self.fd.get_kvm_run().request_interrupt_window != 0
    }

    fn set_request_interrupt_window(&mut self, enabled: bool) {
        self.fd.get_kvm_run().request_interrupt_window = enabled as u8;
    }

    fn ready_for_interrupt_injection(&mut self) -> bool {
        self.fd.get_kvm_run().ready_for_interrupt_injection != 0
    }

    fn interrupt_line(&self) -> Arc<dyn InterruptLine> {
        self.line.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vmm::{
        x86_64::{COUNTING_LOOP, NOP, RESET_CS_BASE, RESET_IP, RESET_VECTOR_OFFSET},
        GuestMemory, InterruptInjector, MemoryFlags, VirtualMachine,
    };
    use std::time::Duration;

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn reports_stable_api_version() {
        let hv = KvmHypervisor::open().unwrap();
        assert_eq!(hv.api_version(), crate::vmm::x86_64::KVM_API_VERSION);
        assert!(hv.vcpu_mmap_size().unwrap() > 0);
    }

    #[test]
    #[ignore = "requires /dev/kvm"]
    fn injector_kicks_counting_loop_out_of_run() {
        let hv = KvmHypervisor::open().unwrap();
        let mut memory = GuestMemory::allocate(1024 * 1024).unwrap();
        memory.fill(NOP);
        memory.write_at(RESET_VECTOR_OFFSET, &COUNTING_LOOP).unwrap();

        let vm = VirtualMachine::create(&hv).unwrap();
        let mut vcpu = vm.create_vcpu(0).unwrap();
        vm.register_memory(0, 0xFFF0_0000, &memory, MemoryFlags::empty())
            .unwrap();
        vcpu.set_instruction_pointer(RESET_IP).unwrap();
        vcpu.correct_code_segment(RESET_CS_BASE).unwrap();
        let initial_rax = vcpu.get_registers().unwrap().rax;

        let injector =
            InterruptInjector::spawn(vcpu.interrupt_handle(), 3, Duration::from_millis(200))
                .unwrap();
        let exit = vcpu.run().unwrap();
        let outcome = injector.join();

        assert_eq!(exit.reason, ExitReason::Interrupted);
        assert!(outcome.is_delivered(), "{:?}", outcome);
        assert_ne!(vcpu.get_registers().unwrap().rax & 0xFFFF, initial_rax & 0xFFFF);
    }
}
