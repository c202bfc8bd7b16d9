//! x86-64.

use super::Regs;
use crate::memory::Memory;

pub const RAX: usize = 0;
pub const RDX: usize = 1;
pub const RCX: usize = 2;
pub const RBX: usize = 3;
pub const RSI: usize = 4;
pub const RDI: usize = 5;
pub const RBP: usize = 6;
pub const RSP: usize = 7;
pub const R8: usize = 8;
pub const RIP: usize = 16;
pub const REG_COUNT: usize = 17;

pub static NAMES: [&str; REG_COUNT] = [
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12",
    "r13", "r14", "r15", "rip",
];

/// Register order of `mcontext_t.gregs`, up to and including rip.
const GREGS_ORDER: [usize; 17] = [
    R8,
    R8 + 1,
    R8 + 2,
    R8 + 3,
    R8 + 4,
    R8 + 5,
    R8 + 6,
    R8 + 7,
    RDI,
    RSI,
    RBP,
    RBX,
    RDX,
    RAX,
    RCX,
    RSP,
    RIP,
];

/// `uc_flags`, `uc_link` and `uc_stack` precede `uc_mcontext`.
const UCONTEXT_MCONTEXT_OFFSET: u64 = 0x28;

pub fn step_if_signal_handler(
    regs: &mut Regs,
    elf_offset: u64,
    code: &dyn Memory,
    process_memory: &dyn Memory,
) -> bool {
    // __restore_rt: "mov $0xf,%rax; syscall"
    if code.read_u64(elf_offset) != Ok(0x0f00_0000_0fc0_c748) {
        return false;
    }
    if code.read_u16(elf_offset.wrapping_add(8)) != Ok(0x0f05) {
        return false;
    }
    // sp points at the ucontext.
    let mcontext = regs.sp().wrapping_add(UCONTEXT_MCONTEXT_OFFSET);
    let mut raw = [0u8; GREGS_ORDER.len() * 8];
    if process_memory.read_fully(mcontext, &mut raw).is_err() {
        return false;
    }
    for (chunk, reg) in raw.chunks_exact(8).zip(GREGS_ORDER) {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        regs.set_reg(reg, u64::from_le_bytes(bytes));
    }
    true
}
