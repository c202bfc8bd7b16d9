//! 32-bit x86.

use super::Regs;
use crate::memory::Memory;

pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;
pub const EIP: usize = 8;
pub const REG_COUNT: usize = 16;

pub static NAMES: [&str; REG_COUNT] = [
    "eax", "ecx", "edx", "ebx", "esp", "ebp", "esi", "edi", "eip", "eflags", "cs", "ss", "ds",
    "es", "fs", "gs",
];

/// Shared by x86 and x86_64: calls are at least one byte long.
pub fn pc_adjustment(rel_pc: u64) -> u64 {
    if rel_pc == 0 {
        0
    } else {
        1
    }
}

/// Offsets of the general registers inside `struct sigcontext` / `mcontext_t`.
const MCONTEXT_LAYOUT: [(usize, u64); 9] = [
    (EDI, 4 * 4),
    (ESI, 5 * 4),
    (EBP, 6 * 4),
    (ESP, 7 * 4),
    (EBX, 8 * 4),
    (EDX, 9 * 4),
    (ECX, 10 * 4),
    (EAX, 11 * 4),
    (EIP, 14 * 4),
];

/// `uc_flags`, `uc_link` and `uc_stack` precede `uc_mcontext`.
const UCONTEXT_MCONTEXT_OFFSET: u64 = 20;

fn set_from_mcontext(regs: &mut Regs, process_memory: &dyn Memory, mcontext: u64) -> bool {
    let mut values = [0u64; 9];
    for (value, (_, offset)) in values.iter_mut().zip(MCONTEXT_LAYOUT) {
        match process_memory.read_u32(mcontext.wrapping_add(offset)) {
            Ok(v) => *value = u64::from(v),
            Err(_) => return false,
        }
    }
    for (value, (reg, _)) in values.iter().zip(MCONTEXT_LAYOUT) {
        regs.set_reg(reg, *value);
    }
    true
}

pub fn step_if_signal_handler(
    regs: &mut Regs,
    elf_offset: u64,
    code: &dyn Memory,
    process_memory: &dyn Memory,
) -> bool {
    let Ok(data) = code.read_u64(elf_offset) else {
        return false;
    };
    match data {
        // __restore: "pop %eax; movl $0x77,%eax; int $0x80"
        0x80cd_0000_0077_b858 => {
            // The sigcontext is passed by value right above the return address.
            set_from_mcontext(regs, process_memory, regs.sp().wrapping_add(4))
        }
        // __restore_rt: "movl $0xad,%eax; int $0x80; nop"
        0x0080_cd00_0000_adb8 => {
            let Ok(ucontext) = process_memory.read_u32(regs.sp().wrapping_add(8)) else {
                return false;
            };
            set_from_mcontext(
                regs,
                process_memory,
                u64::from(ucontext) + UCONTEXT_MCONTEXT_OFFSET,
            )
        }
        _ => false,
    }
}
