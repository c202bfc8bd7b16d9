//! 32-bit ARM.

use super::Regs;
use crate::memory::Memory;
use crate::object::UnwindObject;

pub const SP: usize = 13;
pub const LR: usize = 14;
pub const PC: usize = 15;
pub const REG_COUNT: usize = 16;

pub static NAMES: [&str; REG_COUNT] = [
    "r0", "r1", "r2", "r3", "r4", "r5", "r6", "r7", "r8", "r9", "r10", "r11", "ip", "sp", "lr",
    "pc",
];

/// Return addresses with the low bit set are in Thumb code, where the call
/// was either a 2-byte `blx reg` or a 4-byte Thumb-2 `bl`.
pub fn pc_adjustment(rel_pc: u64, object: &dyn UnwindObject) -> u64 {
    if !object.valid() {
        return 2;
    }
    let load_bias = object.load_bias();
    if load_bias > 0 && rel_pc < load_bias as u64 {
        return if rel_pc < 2 { 0 } else { 2 };
    }
    let adjusted_rel_pc = rel_pc.wrapping_sub(load_bias as u64);
    if adjusted_rel_pc < 5 {
        return if adjusted_rel_pc < 2 { 0 } else { 2 };
    }
    if adjusted_rel_pc & 1 != 0 {
        // A 32-bit Thumb-2 call starts with a halfword whose top bits are 0b111.
        let value = object
            .memory()
            .and_then(|memory| memory.read_u32(adjusted_rel_pc - 5).ok());
        match value {
            Some(value) if value & 0xe000_f000 == 0xe000_f000 => {}
            _ => return 2,
        }
    }
    4
}

pub fn step_if_signal_handler(
    regs: &mut Regs,
    elf_offset: u64,
    code: &dyn Memory,
    process_memory: &dyn Memory,
) -> bool {
    let Ok(data) = code.read_u32(elf_offset) else {
        return false;
    };
    let sp = regs.sp();
    let offset = match data {
        // sigreturn: "mov r7, #0x77; svc 0", "svc 0x900077", thumb "movs r7, #0x77; svc 0"
        0xe3a0_7077 | 0xef90_0077 | 0xdf00_2777 => {
            let Ok(marker) = process_memory.read_u32(sp) else {
                return false;
            };
            if marker == 0x5ac3_c35a {
                // struct sigframe with the magic from the old kernel ABI.
                sp + 0x14 + 0xc
            } else {
                sp + 0xc
            }
        }
        // rt_sigreturn: same three forms with syscall number 0xad.
        0xe3a0_70ad | 0xef90_00ad | 0xdf00_27ad => {
            let Ok(pinfo) = process_memory.read_u32(sp) else {
                return false;
            };
            // siginfo, then the ucontext's uc_mcontext.
            if u64::from(pinfo) == sp + 8 {
                sp + 8 + 0x80 + 0x14 + 0xc
            } else {
                sp + 0x80 + 0x14 + 0xc
            }
        }
        _ => return false,
    };
    let mut raw = [0u8; REG_COUNT * 4];
    if process_memory.read_fully(offset, &mut raw).is_err() {
        return false;
    }
    for (i, chunk) in raw.chunks_exact(4).enumerate() {
        regs.set_reg(i, u64::from(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]])));
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::memory::MemorySnapshot;

    #[test]
    fn non_rt_sigreturn() {
        let code = MemorySnapshot::new();
        code.set_u32(0x500, 0xe3a0_7077);
        let stack = MemorySnapshot::new();
        let sp = 0x8000;
        stack.set_u32(sp, 0);
        for i in 0..16u64 {
            stack.set_u32(sp + 0xc + i * 4, 0x100 + i as u32);
        }
        let mut regs = Regs::new(Arch::Arm).unwrap();
        regs.set_sp(sp);
        assert!(step_if_signal_handler(&mut regs, 0x500, &code, &stack));
        assert_eq!(regs.pc(), 0x10f);
        assert_eq!(regs.sp(), 0x10d);
        assert_eq!(regs.reg(0), Some(0x100));
    }

    #[test]
    fn rt_sigreturn_thumb() {
        let code = MemorySnapshot::new();
        code.set_u32(0x500, 0xdf00_27ad);
        let stack = MemorySnapshot::new();
        let sp = 0x8000u64;
        stack.set_u32(sp, (sp + 8) as u32);
        let base = sp + 8 + 0x80 + 0x14 + 0xc;
        for i in 0..16u64 {
            stack.set_u32(base + i * 4, 0x200 + i as u32);
        }
        let mut regs = Regs::new(Arch::Arm).unwrap();
        regs.set_sp(sp);
        assert!(step_if_signal_handler(&mut regs, 0x500, &code, &stack));
        assert_eq!(regs.reg(LR), Some(0x20e));

        code.set_u32(0x500, 0xe120_0070);
        let mut regs = Regs::new(Arch::Arm).unwrap();
        regs.set_sp(sp);
        assert!(!step_if_signal_handler(&mut regs, 0x500, &code, &stack));
    }
}
