use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, VmError>;

/// Failures surfaced by the lifecycle types.
///
/// Kernel failures carry the `std::io::Error` built from the errno the
/// hypervisor returned.
#[derive(Error, Debug)]
pub enum VmError {
    #[error("hypervisor device unavailable: {reason}")]
    Unavailable {
        reason: String,
        #[source]
        source: io::Error,
    },

    #[error("unsupported hypervisor API version {actual} (expected {expected})")]
    Compatibility { expected: i32, actual: i32 },

    #[error("resource exhausted while {0}")]
    ResourceExhaustion(String, #[source] io::Error),

    #[error("access of {len} bytes at offset {offset:#x} exceeds region of {size:#x} bytes")]
    OutOfBounds { offset: usize, len: usize, size: usize },

    #[error("invalid memory region: {0}")]
    InvalidRegion(String),

    #[error("memory region permission mismatch: {0}")]
    Permission(String),

    /// The hypervisor refused a new VM context, usually a kernel limit.
    #[error("cannot create VM")]
    VmCreation(#[source] io::Error),

    #[error("cannot create vCPU {id}")]
    VcpuCreation {
        id: u64,
        #[source]
        source: io::Error,
    },

    #[error("cannot query {0} from vCPU")]
    StateQuery(&'static str, #[source] io::Error),

    #[error("cannot update {0} on vCPU")]
    StateUpdate(&'static str, #[source] io::Error),

    #[error("vCPU run request failed")]
    Run(#[source] io::Error),

    #[error("interrupt vector {vector} rejected")]
    InterruptDelivery {
        vector: u32,
        #[source]
        source: io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl VmError {
    /// Interrupt rejection is a timing race, everything else is structural.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, VmError::InterruptDelivery { .. })
    }

    /// Process exit code reported by `main` for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            VmError::Unavailable { .. } => 1,
            VmError::ResourceExhaustion(..) => 2,
            VmError::VmCreation(_) | VmError::VcpuCreation { .. } => 3,
            VmError::StateQuery(..) | VmError::StateUpdate(..) => 4,
            VmError::InvalidRegion(_) | VmError::Permission(_) | VmError::OutOfBounds { .. } => 5,
            VmError::Run(_) => 6,
            VmError::Compatibility { .. } => 7,
            VmError::InterruptDelivery { .. } => 8,
            VmError::Io(_) => 9,
        }
    }
}

/// Converts an errno-carrying kernel error into `std::io::Error`.
pub(crate) fn os_error(errno: i32) -> io::Error {
    io::Error::from_raw_os_error(errno)
}
