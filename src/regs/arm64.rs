//! AArch64.

use super::Regs;
use crate::memory::Memory;

pub const FP: usize = 29;
pub const LR: usize = 30;
pub const SP: usize = 31;
pub const PC: usize = 32;
pub const PSTATE: usize = 33;
pub const REG_COUNT: usize = 34;

/// DWARF pseudo-register tracking whether the return address is signed.
pub const RA_SIGN_STATE: u16 = 34;

pub static NAMES: [&str; REG_COUNT] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
    "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
    "x27", "x28", "x29", "lr", "sp", "pc", "pst",
];

/// Pointer authentication codes live above the 48-bit virtual address.
const PTR_MASK: u64 = (1 << 48) - 1;

#[inline(always)]
pub fn strip_ptr_auth(ptr: u64) -> u64 {
    ptr & PTR_MASK
}

pub fn pc_adjustment(rel_pc: u64) -> u64 {
    if rel_pc < 4 {
        0
    } else {
        4
    }
}

pub fn step_if_signal_handler(
    regs: &mut Regs,
    elf_offset: u64,
    code: &dyn Memory,
    process_memory: &dyn Memory,
) -> bool {
    // __kernel_rt_sigreturn: "mov x8, #0x8b; svc #0"
    match code.read_u64(elf_offset) {
        Ok(0xd400_0001_d280_1168) => {}
        _ => return false,
    }
    // siginfo, then ucontext up to uc_mcontext.regs.
    let offset = regs.sp().wrapping_add(0x80 + 0xb0 + 0x08);
    let mut raw = [0u8; REG_COUNT * 8];
    if process_memory.read_fully(offset, &mut raw).is_err() {
        return false;
    }
    for (i, chunk) in raw.chunks_exact(8).enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        regs.set_reg(i, u64::from_le_bytes(bytes));
    }
    true
}
