//! Hypervisor surface and the lifecycle types built on top of it.
//!
//! Backends implement [`Hypervisor`], [`Vm`], [`Vcpu`] and [`InterruptLine`].
//! Callers go through [`VirtualMachine`] and its vCPUs, which validate
//! requests and tie every object's lifetime to the one it was created from.

use std::{fmt, sync::Arc};

mod error;
mod injector;
mod machine;
mod memory;
pub mod sim;
pub mod x86_64;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::KvmHypervisor;

pub use error::{Result, VmError};
pub use injector::{InjectionOutcome, InterruptInjector};
pub use machine::{InterruptHandle, VirtualMachine};
pub use memory::{host_page_size, GuestMemory, MemoryFlags, MemoryRegion, Protection};

pub use kvm_bindings::{kvm_regs as Registers, kvm_sregs as SpecialRegisters};

/// An open connection to the virtualization facility.
pub trait Hypervisor {
    fn api_version(&self) -> i32;

    fn page_size(&self) -> u64 {
        host_page_size()
    }

    /// Size of the run-state view every vCPU maps.
    fn vcpu_mmap_size(&self) -> Result<usize>;

    fn create_vm(&self) -> Result<Box<dyn Vm + '_>>;
}

/// A VM context.
pub trait Vm {
    /// Installs a user memory slot.
    ///
    /// # Safety
    ///
    /// `region.host_addr .. region.host_addr + region.size` must stay mapped
    /// for as long as the slot is registered.
    unsafe fn set_memory_region(&self, region: &MemoryRegion) -> Result<()>;

    fn create_vcpu(&self, id: u64) -> Result<Box<dyn Vcpu + '_>>;
}

/// A vCPU context together with its run-state view.
///
/// None of these may be called while `run` executes on another thread; the
/// only cross-thread entry point is the [`InterruptLine`].
pub trait Vcpu {
    fn get_regs(&self) -> Result<Registers>;
    fn set_regs(&mut self, regs: &Registers) -> Result<()>;
    fn get_sregs(&self) -> Result<SpecialRegisters>;
    fn set_sregs(&mut self, sregs: &SpecialRegisters) -> Result<()>;

    /// Runs the guest until the next exit.
    fn run(&mut self) -> Result<ExitReport>;

    fn request_interrupt_window(&mut self) -> bool;
    fn set_request_interrupt_window(&mut self, enabled: bool);
    fn ready_for_interrupt_injection(&mut self) -> bool;

    fn interrupt_line(&self) -> Arc<dyn InterruptLine>;
}

/// Thread-safe control over a vCPU that may be blocked in `run`.
pub trait InterruptLine: Send + Sync {
    /// Makes an in-flight `run` return, or the next one return immediately.
    fn kick(&self);

    /// Queues an interrupt with the given vector.
    fn inject(&self, vector: u32) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDirection {
    In,
    Out,
}

/// Why a run call handed control back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    Unknown { hardware_reason: u64 },
    Exception,
    Io { port: u16, direction: IoDirection },
    Hypercall,
    Debug,
    Hlt,
    Mmio { address: u64, is_write: bool },
    IrqWindowOpen,
    Shutdown,
    FailEntry { hardware_reason: u64 },
    /// A host signal forced the run call out.
    Interrupted,
    InternalError,
    SystemEvent,
    Other(u32),
}

/// Outcome of one run call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub reason: ExitReason,
    /// Present only when `reason` is `InternalError`.
    pub suberror: Option<u32>,
}

impl ExitReport {
    pub fn new(reason: ExitReason) -> Self {
        Self {
            reason,
            suberror: None,
        }
    }

    pub fn internal_error(suberror: u32) -> Self {
        Self {
            reason: ExitReason::InternalError,
            suberror: Some(suberror),
        }
    }

    pub fn is_internal_error(&self) -> bool {
        self.reason == ExitReason::InternalError
    }
}

impl fmt::Display for ExitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.reason)?;
        if let Some(suberror) = self.suberror {
            write!(
                f,
                " (suberror {}: {})",
                suberror,
                x86_64::internal_error_name(suberror)
            )?;
        }

        Ok(())
    }
}
