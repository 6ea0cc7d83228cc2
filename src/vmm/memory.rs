//! Host mappings that back guest physical memory, and the slot descriptors
//! used to install them into a VM.

use std::ptr::{null_mut, NonNull};

use bitflags::bitflags;
use nix::unistd::{sysconf, SysconfVar};

use super::error::{Result, VmError};

const FALLBACK_PAGE_SIZE: u64 = 0x1000;

/// Granularity the hypervisor requires for slot bases and sizes.
pub fn host_page_size() -> u64 {
    match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(size)) if size > 0 => size as u64,
        _ => FALLBACK_PAGE_SIZE,
    }
}

bitflags! {
    /// Host protection of a guest memory mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: i32 {
        const READ = libc::PROT_READ;
        const WRITE = libc::PROT_WRITE;
        const EXEC = libc::PROT_EXEC;
        const READ_WRITE_EXECUTE = Self::READ.bits() | Self::WRITE.bits() | Self::EXEC.bits();
    }
}

bitflags! {
    /// `KVM_MEM_*` slot flags.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct MemoryFlags: u32 {
        const LOG_DIRTY_PAGES = 1 << 0;
        const READONLY = 1 << 1;
    }
}

/// An anonymous shared mapping used as guest physical memory.
///
/// Unmapped on drop. A `VirtualMachine` borrows it for as long as the
/// registration exists, so it cannot go away under a running vCPU.
pub struct GuestMemory {
    addr: NonNull<u8>,
    size: usize,
    protection: Protection,
}

// The mapping is plain memory. Host-side writes need `&mut self`, which is
// impossible while a VM holds the registration borrow.
unsafe impl Send for GuestMemory {}
unsafe impl Sync for GuestMemory {}

impl GuestMemory {
    /// Maps `size` bytes readable, writable and executable.
    pub fn allocate(size: usize) -> Result<Self> {
        Self::allocate_with(size, Protection::READ_WRITE_EXECUTE)
    }

    pub fn allocate_with(size: usize, protection: Protection) -> Result<Self> {
        let page_size = host_page_size();
        if size == 0 || size as u64 % page_size != 0 {
            return Err(VmError::InvalidRegion(format!(
                "size {:#x} is not a non-zero multiple of the page size {:#x}",
                size, page_size
            )));
        }

        let addr = unsafe {
            libc::mmap(
                null_mut(),
                size,
                protection.bits(),
                libc::MAP_ANONYMOUS | libc::MAP_SHARED | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(VmError::ResourceExhaustion(
                format!("mapping {:#x} bytes of guest memory", size),
                std::io::Error::last_os_error(),
            ));
        }

        log::info!("Mapped {:#x} bytes of guest memory at host address {:p}", size, addr);

        Ok(Self {
            // mmap never hands out the null page on success
            addr: NonNull::new(addr as *mut u8).ok_or_else(|| {
                VmError::ResourceExhaustion(
                    "mapping guest memory".into(),
                    std::io::Error::from_raw_os_error(libc::ENOMEM),
                )
            })?,
            size,
            protection,
        })
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn host_address(&self) -> u64 {
        self.addr.as_ptr() as u64
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.addr.as_ptr(), self.size) }
    }

    /// Overwrites the whole region with `byte`.
    pub fn fill(&mut self, byte: u8) {
        self.as_mut_slice().fill(byte);
    }

    /// Overwrites the whole region with random bytes.
    pub fn randomize(&mut self) -> Result<()> {
        getrandom::getrandom(self.as_mut_slice()).map_err(|e| {
            VmError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                format!("cannot randomize guest memory: {}", e),
            ))
        })
    }

    fn check_bounds(&self, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.size => Ok(()),
            _ => Err(VmError::OutOfBounds {
                offset,
                len,
                size: self.size,
            }),
        }
    }

    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check_bounds(offset, bytes.len())?;
        self.as_mut_slice()[offset..offset + bytes.len()].copy_from_slice(bytes);

        Ok(())
    }

    /// Copies `len` bytes out of the region.
    ///
    /// The guest may write the region while a vCPU runs, so this returns a
    /// snapshot rather than a borrow.
    pub fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.check_bounds(offset, len)?;

        let mut data = vec![0u8; len];
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr.as_ptr().add(offset), data.as_mut_ptr(), len);
        }

        Ok(data)
    }

    /// Unmaps the region. Same as dropping it.
    pub fn release(self) {}
}

impl Drop for GuestMemory {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.addr.as_ptr() as *mut libc::c_void, self.size) };
        if res != 0 {
            log::error!(
                "munmap of guest memory at {:p} failed: {}",
                self.addr,
                std::io::Error::last_os_error()
            );
        } else {
            log::debug!("Unmapped guest memory at {:p}", self.addr);
        }
    }
}

/// One registered guest physical memory slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub slot: u32,
    pub flags: MemoryFlags,
    pub guest_phys_addr: u64,
    pub size: u64,
    pub host_addr: u64,
}

impl MemoryRegion {
    /// Exclusive end of the guest physical range, `None` if it wraps.
    pub fn guest_end(&self) -> Option<u64> {
        self.guest_phys_addr.checked_add(self.size)
    }

    pub fn overlaps(&self, other: &MemoryRegion) -> bool {
        let (Some(end), Some(other_end)) = (self.guest_end(), other.guest_end()) else {
            return true;
        };

        self.guest_phys_addr < other_end && other.guest_phys_addr < end
    }

    pub fn contains(&self, gpa: u64) -> bool {
        self.guest_phys_addr <= gpa && self.guest_end().map_or(true, |end| gpa < end)
    }
}

/// Rejects a region that is misaligned, empty, wrapping, reuses a slot
/// index or overlaps a registered range.
pub(crate) fn validate_region(
    region: &MemoryRegion,
    page_size: u64,
    registered: &[MemoryRegion],
) -> Result<()> {
    if region.guest_phys_addr % page_size != 0 {
        return Err(VmError::InvalidRegion(format!(
            "guest physical base {:#x} is not aligned to {:#x}",
            region.guest_phys_addr, page_size
        )));
    }
    if region.size == 0 || region.size % page_size != 0 {
        return Err(VmError::InvalidRegion(format!(
            "size {:#x} is not a non-zero multiple of {:#x}",
            region.size, page_size
        )));
    }
    if region.host_addr % page_size != 0 {
        return Err(VmError::InvalidRegion(format!(
            "host address {:#x} is not aligned to {:#x}",
            region.host_addr, page_size
        )));
    }
    if region.guest_end().is_none() {
        return Err(VmError::InvalidRegion(format!(
            "range at {:#x} of {:#x} bytes wraps the address space",
            region.guest_phys_addr, region.size
        )));
    }

    for other in registered {
        if other.slot == region.slot {
            return Err(VmError::InvalidRegion(format!(
                "slot {} is already registered",
                region.slot
            )));
        }
        if other.overlaps(region) {
            return Err(VmError::InvalidRegion(format!(
                "slot {} [{:#x}; {:#x}) overlaps slot {} [{:#x}; {:#x})",
                region.slot,
                region.guest_phys_addr,
                region.guest_phys_addr + region.size,
                other.slot,
                other.guest_phys_addr,
                other.guest_phys_addr + other.size
            )));
        }
    }

    Ok(())
}

/// Checks the host mapping grants what the slot lets the guest do.
pub(crate) fn check_protection(protection: Protection, flags: MemoryFlags) -> Result<()> {
    if !protection.contains(Protection::READ) {
        return Err(VmError::Permission(
            "host mapping is not readable".to_string(),
        ));
    }
    if !flags.contains(MemoryFlags::READONLY) && !protection.contains(Protection::WRITE) {
        return Err(VmError::Permission(
            "writable slot backed by a read-only host mapping".to_string(),
        ));
    }

    Ok(())
}
