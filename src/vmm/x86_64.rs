//! Real-mode facts needed to start the guest at the reset vector and to
//! stop it again.

#![allow(dead_code)]

use bitflags::bitflags;
use static_assertions::const_assert_eq;

macro_rules! bit {
    ($x:expr) => {
        1 << $x
    };
}

/// `KVM_API_VERSION`; every stable kernel reports this value.
pub const KVM_API_VERSION: i32 = 12;

/// Guest physical base of the 1 MiB window that ends at 4 GiB.
pub const GUEST_PHYS_BASE: u64 = 0xFFF0_0000;
pub const GUEST_MEMORY_SIZE: usize = 1024 * 1024;

/// Architectural CS base at reset. Early KVM reported a different value, so
/// the vCPU's CS base is rewritten to this before the first run.
pub const RESET_CS_BASE: u64 = 0xFFFF_0000;
pub const RESET_IP: u64 = 0xFFF0;

/// Offset of the reset vector inside the window starting at `GUEST_PHYS_BASE`.
pub const RESET_VECTOR_OFFSET: usize = (RESET_CS_BASE + RESET_IP - GUEST_PHYS_BASE) as usize;

const_assert_eq!(RESET_VECTOR_OFFSET, 0xFFFF0);

pub const NOP: u8 = 0x90;
pub const HLT: u8 = 0xF4;

/// `inc ax; jmp short -4`: counts in the accumulator until something stops
/// the vCPU.
pub const COUNTING_LOOP: [u8; 4] = [
    0xFF, 0xC0, /* inc ax */
    0xEB, 0xFC, /* jmp <inc ax> */
];

/// Vector used to knock the guest out of the loop.
pub const INJECTED_VECTOR: u32 = 3;

/// `KVM_INTERNAL_ERROR_*` suberror codes.
pub const INTERNAL_ERROR_EMULATION: u32 = 1;
pub const INTERNAL_ERROR_SIMUL_EX: u32 = 2;
pub const INTERNAL_ERROR_DELIVERY_EV: u32 = 3;
pub const INTERNAL_ERROR_UNEXPECTED_EXIT_REASON: u32 = 4;

pub fn internal_error_name(suberror: u32) -> &'static str {
    match suberror {
        INTERNAL_ERROR_EMULATION => "emulation failure",
        INTERNAL_ERROR_SIMUL_EX => "exception while delivering an exception",
        INTERNAL_ERROR_DELIVERY_EV => "event delivery failure",
        INTERNAL_ERROR_UNEXPECTED_EXIT_REASON => "unexpected exit reason",
        _ => "unknown suberror",
    }
}

bitflags! {
    /// The RFLAGS bits the guest loop and interrupt delivery depend on.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RFlags: u64 {
        /// Carry
        const CF       = bit!(0);
        /// Always one
        const RESERVED = bit!(1);
        /// Zero
        const ZF       = bit!(6);
        /// Trap (single-step)
        const TF       = bit!(8);
        /// Maskable interrupts enabled
        const IF       = bit!(9);
    }
}

/// Logs the real-mode disassembly of `bytes` as loaded at `ip`.
pub fn disassemble_real_mode(bytes: &[u8], ip: u64) {
    use iced_x86::Formatter;

    let mut decoder = iced_x86::Decoder::with_ip(16, bytes, ip, iced_x86::DecoderOptions::NONE);
    let mut formatter = iced_x86::GasFormatter::new();

    formatter.options_mut().set_first_operand_char_index(10);
    formatter.options_mut().set_leading_zeros(true);

    let mut output = String::new();
    let mut instruction = iced_x86::Instruction::default();

    while decoder.can_decode() {
        decoder.decode_out(&mut instruction);

        if instruction.is_invalid() {
            continue;
        }

        output.clear();
        formatter.format(&instruction, &mut output);

        let start_index = (instruction.ip() - ip) as usize;
        let instr_bytes = &bytes[start_index..start_index + instruction.len()];

        log::info!("0x{:08x} {:32} # {:02x?}", instruction.ip(), output, instr_bytes);
    }
}
