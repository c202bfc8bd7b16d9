//! MIPS, 32- and 64-bit. Both use the same register numbering.

use super::Regs;
use crate::memory::Memory;

pub const SP: usize = 29;
pub const RA: usize = 31;
pub const PC: usize = 32;
pub const REG_COUNT: usize = 33;

pub static NAMES: [&str; REG_COUNT] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "r16", "r17", "r18", "r19", "r20", "r21", "r22", "r23", "r24", "r25", "r26",
    "r27", "r28", "sp", "r30", "ra", "pc",
];

/// The call is followed by a delay slot.
pub fn pc_adjustment(rel_pc: u64) -> u64 {
    if rel_pc < 8 {
        0
    } else {
        8
    }
}

/// Restores from `sc_pc` followed by `sc_regs[32]`, all 64-bit.
fn restore_pc_then_regs(regs: &mut Regs, process_memory: &dyn Memory, addr: u64) -> bool {
    let mut raw = [0u8; REG_COUNT * 8];
    if process_memory.read_fully(addr, &mut raw).is_err() {
        return false;
    }
    let mut values = raw.chunks_exact(8).map(|chunk| {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        u64::from_le_bytes(bytes)
    });
    if let Some(pc) = values.next() {
        regs.set_reg(PC, pc);
    }
    for (i, value) in values.enumerate() {
        regs.set_reg(i, value);
    }
    true
}

pub fn step_if_signal_handler(
    regs: &mut Regs,
    elf_offset: u64,
    code: &dyn Memory,
    process_memory: &dyn Memory,
) -> bool {
    let offset = match code.read_u64(elf_offset) {
        // __vdso_rt_sigreturn: "li v0, 0x1061; syscall"
        // siginfo offset + sizeof(siginfo) + uc_mcontext offset + sc_pc offset
        Ok(0x0000_000c_2402_1061) => 24 + 128 + 24 + 8,
        // __vdso_sigreturn: "li v0, 0x1017; syscall"
        Ok(0x0000_000c_2402_1017) => 24 + 8,
        _ => return false,
    };
    restore_pc_then_regs(regs, process_memory, regs.sp().wrapping_add(offset))
}

pub fn step_if_signal_handler_64(
    regs: &mut Regs,
    elf_offset: u64,
    code: &dyn Memory,
    process_memory: &dyn Memory,
) -> bool {
    // __vdso_rt_sigreturn: "li v0, 0x145b; syscall"
    if code.read_u64(elf_offset) != Ok(0x0000_000c_2402_145b) {
        return false;
    }
    // siginfo, then the n64 sigcontext: sc_regs[32], sc_fpregs[32],
    // eight hi/lo words, then sc_pc.
    let sigcontext = regs.sp().wrapping_add(24 + 128 + 40);
    let mut raw = [0u8; 32 * 8];
    if process_memory.read_fully(sigcontext, &mut raw).is_err() {
        return false;
    }
    let Ok(pc) = process_memory.read_u64(sigcontext + (32 + 32 + 8) * 8) else {
        return false;
    };
    for (i, chunk) in raw.chunks_exact(8).enumerate() {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(chunk);
        regs.set_reg(i, u64::from_le_bytes(bytes));
    }
    regs.set_reg(PC, pc);
    true
}
