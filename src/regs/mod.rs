//! Register files for the supported architectures.
//!
//! [`Regs`] is a plain value: an architecture tag plus one `u64` slot per
//! register, numbered the way DWARF numbers them for that architecture. The
//! per-architecture modules know where the pc, sp and return address live,
//! how to recognize a kernel signal trampoline and how to turn a return
//! address back into a call site.

pub mod arm;
pub mod arm64;
pub mod mips;
pub mod x86;
pub mod x86_64;

use std::fmt::Debug;

use arrayvec::ArrayVec;

use crate::arch::Arch;
use crate::display_utils::HexNum;
use crate::error::Error;
use crate::memory::Memory;
use crate::object::UnwindObject;

/// Capacity of the register file; the largest architecture is ARM64.
pub const MAX_REGS: usize = 34;

#[derive(Clone, PartialEq, Eq)]
pub struct Regs {
    arch: Arch,
    values: ArrayVec<u64, MAX_REGS>,
    dex_pc: u64,
}

impl Regs {
    /// A zeroed register file. Returns `None` for [`Arch::Unknown`].
    pub fn new(arch: Arch) -> Option<Self> {
        let count = Self::count_for(arch)?;
        let mut values = ArrayVec::new();
        values.extend(std::iter::repeat(0).take(count));
        Some(Self {
            arch,
            values,
            dex_pc: 0,
        })
    }

    /// Builds a register file from raw values in DWARF order. Missing values
    /// are zero; extra values are ignored.
    pub fn from_raw(arch: Arch, raw: &[u64]) -> Option<Self> {
        let mut regs = Self::new(arch)?;
        for (slot, value) in regs.values.iter_mut().zip(raw) {
            *slot = *value;
        }
        Some(regs)
    }

    fn count_for(arch: Arch) -> Option<usize> {
        Some(match arch {
            Arch::Arm => arm::REG_COUNT,
            Arch::Arm64 => arm64::REG_COUNT,
            Arch::X86 => x86::REG_COUNT,
            Arch::X86_64 => x86_64::REG_COUNT,
            Arch::Mips | Arch::Mips64 => mips::REG_COUNT,
            Arch::Unknown => return None,
        })
    }

    /// Reads the registers of a ptrace-stopped thread of the native
    /// architecture.
    pub fn remote(tid: libc::pid_t) -> Result<Self, Error> {
        remote::read_registers(tid)
    }

    #[inline(always)]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    #[inline(always)]
    pub fn num_regs(&self) -> usize {
        self.values.len()
    }

    pub fn is_64bit(&self) -> bool {
        self.arch.is_64bit()
    }

    #[inline(always)]
    pub fn reg(&self, i: usize) -> Option<u64> {
        self.values.get(i).copied()
    }

    /// Sets register `i`, truncating to 32 bits on 32-bit architectures.
    /// Out-of-range indices are ignored.
    #[inline(always)]
    pub fn set_reg(&mut self, i: usize, value: u64) {
        let value = self.truncate(value);
        if let Some(slot) = self.values.get_mut(i) {
            *slot = value;
        }
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    #[inline(always)]
    fn truncate(&self, value: u64) -> u64 {
        if self.arch.is_64bit() {
            value
        } else {
            value & 0xffff_ffff
        }
    }

    pub fn pc_reg(&self) -> usize {
        match self.arch {
            Arch::Arm => arm::PC,
            Arch::Arm64 => arm64::PC,
            Arch::X86 => x86::EIP,
            Arch::X86_64 => x86_64::RIP,
            Arch::Mips | Arch::Mips64 | Arch::Unknown => mips::PC,
        }
    }

    pub fn sp_reg(&self) -> usize {
        match self.arch {
            Arch::Arm => arm::SP,
            Arch::Arm64 => arm64::SP,
            Arch::X86 => x86::ESP,
            Arch::X86_64 => x86_64::RSP,
            Arch::Mips | Arch::Mips64 | Arch::Unknown => mips::SP,
        }
    }

    /// The DWARF return-address column for the architecture.
    pub fn return_address_reg(&self) -> usize {
        match self.arch {
            Arch::Arm => arm::LR,
            Arch::Arm64 => arm64::LR,
            Arch::X86 => x86::EIP,
            Arch::X86_64 => x86_64::RIP,
            Arch::Mips | Arch::Mips64 | Arch::Unknown => mips::RA,
        }
    }

    #[inline(always)]
    pub fn pc(&self) -> u64 {
        self.values[self.pc_reg()]
    }

    #[inline(always)]
    pub fn sp(&self) -> u64 {
        self.values[self.sp_reg()]
    }

    #[inline(always)]
    pub fn set_pc(&mut self, pc: u64) {
        self.set_reg(self.pc_reg(), pc)
    }

    #[inline(always)]
    pub fn set_sp(&mut self, sp: u64) {
        self.set_reg(self.sp_reg(), sp)
    }

    pub fn dex_pc(&self) -> u64 {
        self.dex_pc
    }

    pub fn set_dex_pc(&mut self, dex_pc: u64) {
        self.dex_pc = dex_pc;
    }

    /// The value of the return-address register on architectures that keep
    /// it in a register. `None` on x86, where it lives on the stack.
    pub fn return_address(&self) -> Option<u64> {
        match self.arch {
            Arch::X86 | Arch::X86_64 | Arch::Unknown => None,
            _ => self.reg(self.return_address_reg()),
        }
    }

    /// Replaces the pc by the caller's return address: the link register on
    /// RISC architectures, the word at `sp` (which is then popped) on x86.
    /// Returns false if that would not change the pc.
    pub fn set_pc_from_return_address(&mut self, process_memory: &dyn Memory) -> bool {
        match self.arch {
            Arch::X86 | Arch::X86_64 => {
                let size = u64::from(self.arch.address_size());
                let Ok(new_pc) = process_memory.read_address(self.sp(), self.arch) else {
                    return false;
                };
                if new_pc == self.pc() {
                    return false;
                }
                self.set_pc(new_pc);
                self.set_sp(self.sp().wrapping_add(size));
                true
            }
            Arch::Unknown => false,
            _ => {
                let ra = self.values[self.return_address_reg()];
                if ra == self.pc() {
                    return false;
                }
                self.set_pc(ra);
                true
            }
        }
    }

    /// The number of bytes to subtract from a return address so that it
    /// points into the call instruction.
    pub fn pc_adjustment(&self, rel_pc: u64, object: &dyn UnwindObject) -> u64 {
        match self.arch {
            Arch::Arm => arm::pc_adjustment(rel_pc, object),
            Arch::Arm64 => arm64::pc_adjustment(rel_pc),
            Arch::X86 | Arch::X86_64 => x86::pc_adjustment(rel_pc),
            Arch::Mips | Arch::Mips64 => mips::pc_adjustment(rel_pc),
            Arch::Unknown => 0,
        }
    }

    /// Checks whether the code at `elf_offset` of `code` is a kernel signal
    /// return trampoline. If so, restores every register from the signal
    /// frame on the stack and returns true.
    pub fn step_if_signal_handler(
        &mut self,
        elf_offset: u64,
        code: &dyn Memory,
        process_memory: &dyn Memory,
    ) -> bool {
        match self.arch {
            Arch::Arm => arm::step_if_signal_handler(self, elf_offset, code, process_memory),
            Arch::Arm64 => arm64::step_if_signal_handler(self, elf_offset, code, process_memory),
            Arch::X86 => x86::step_if_signal_handler(self, elf_offset, code, process_memory),
            Arch::X86_64 => {
                x86_64::step_if_signal_handler(self, elf_offset, code, process_memory)
            }
            Arch::Mips => mips::step_if_signal_handler(self, elf_offset, code, process_memory),
            Arch::Mips64 => {
                mips::step_if_signal_handler_64(self, elf_offset, code, process_memory)
            }
            Arch::Unknown => false,
        }
    }

    /// Register names for diagnostics, in register order.
    pub fn names(&self) -> &'static [&'static str] {
        match self.arch {
            Arch::Arm => &arm::NAMES[..],
            Arch::Arm64 => &arm64::NAMES[..],
            Arch::X86 => &x86::NAMES[..],
            Arch::X86_64 => &x86_64::NAMES[..],
            Arch::Mips | Arch::Mips64 => &mips::NAMES[..],
            Arch::Unknown => &[],
        }
    }
}

impl Debug for Regs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut s = f.debug_struct("Regs");
        s.field("arch", &self.arch);
        for (name, value) in self.names().iter().zip(self.values.iter()) {
            s.field(name, &HexNum(*value));
        }
        if self.dex_pc != 0 {
            s.field("dex_pc", &HexNum(self.dex_pc));
        }
        s.finish()
    }
}

mod remote {
    use super::*;

    #[allow(unused)]
    fn ptrace_error(tid: libc::pid_t) -> Error {
        let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
        if errno == libc::ESRCH {
            Error::ThreadDoesNotExist(tid)
        } else {
            Error::Ptrace(errno)
        }
    }

    cfg_if::cfg_if! {
        if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
            pub fn read_registers(tid: libc::pid_t) -> Result<Regs, Error> {
                // Safety: user_regs_struct is plain old data.
                let mut user: libc::user_regs_struct = unsafe { std::mem::zeroed() };
                let mut iov = libc::iovec {
                    iov_base: &mut user as *mut _ as *mut libc::c_void,
                    iov_len: std::mem::size_of::<libc::user_regs_struct>(),
                };
                // Safety: `iov` points at a buffer of the advertised size.
                let rc = unsafe {
                    libc::ptrace(libc::PTRACE_GETREGSET, tid, libc::NT_PRSTATUS, &mut iov as *mut libc::iovec)
                };
                if rc == -1 {
                    return Err(ptrace_error(tid));
                }
                let mut regs = Regs::new(Arch::X86_64).ok_or(Error::BadArch)?;
                for (i, v) in [
                    user.rax, user.rdx, user.rcx, user.rbx, user.rsi, user.rdi, user.rbp,
                    user.rsp, user.r8, user.r9, user.r10, user.r11, user.r12, user.r13,
                    user.r14, user.r15, user.rip,
                ]
                .into_iter()
                .enumerate()
                {
                    regs.set_reg(i, v);
                }
                Ok(regs)
            }
        } else if #[cfg(all(target_os = "linux", target_arch = "aarch64"))] {
            pub fn read_registers(tid: libc::pid_t) -> Result<Regs, Error> {
                // Safety: user_regs_struct is plain old data.
                let mut user: libc::user_regs_struct = unsafe { std::mem::zeroed() };
                let mut iov = libc::iovec {
                    iov_base: &mut user as *mut _ as *mut libc::c_void,
                    iov_len: std::mem::size_of::<libc::user_regs_struct>(),
                };
                // Safety: `iov` points at a buffer of the advertised size.
                let rc = unsafe {
                    libc::ptrace(libc::PTRACE_GETREGSET, tid, libc::NT_PRSTATUS, &mut iov as *mut libc::iovec)
                };
                if rc == -1 {
                    return Err(ptrace_error(tid));
                }
                let mut regs = Regs::new(Arch::Arm64).ok_or(Error::BadArch)?;
                for (i, v) in user.regs.iter().enumerate() {
                    regs.set_reg(i, *v);
                }
                regs.set_reg(arm64::SP, user.sp);
                regs.set_reg(arm64::PC, user.pc);
                regs.set_reg(arm64::PSTATE, user.pstate);
                Ok(regs)
            }
        } else {
            pub fn read_registers(_tid: libc::pid_t) -> Result<Regs, Error> {
                Err(Error::BadArch)
            }
        }
    }
}
