use object::elf;

/// The architectures whose register files and unwind formats are understood.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Arch {
    #[default]
    Unknown,
    Arm,
    Arm64,
    X86,
    X86_64,
    Mips,
    Mips64,
}

impl Arch {
    /// The architecture of the running process.
    pub fn native() -> Arch {
        cfg_if::cfg_if! {
            if #[cfg(target_arch = "aarch64")] {
                Arch::Arm64
            } else if #[cfg(target_arch = "arm")] {
                Arch::Arm
            } else if #[cfg(target_arch = "x86_64")] {
                Arch::X86_64
            } else if #[cfg(target_arch = "x86")] {
                Arch::X86
            } else if #[cfg(target_arch = "mips64")] {
                Arch::Mips64
            } else if #[cfg(target_arch = "mips")] {
                Arch::Mips
            } else {
                Arch::Unknown
            }
        }
    }

    /// Maps an ELF `e_machine` and class to an architecture.
    pub fn from_elf_machine(e_machine: u16, is_64: bool) -> Arch {
        match (e_machine, is_64) {
            (elf::EM_ARM, false) => Arch::Arm,
            (elf::EM_AARCH64, true) => Arch::Arm64,
            (elf::EM_386, false) => Arch::X86,
            (elf::EM_X86_64, true) => Arch::X86_64,
            (elf::EM_MIPS, false) => Arch::Mips,
            (elf::EM_MIPS, true) => Arch::Mips64,
            _ => Arch::Unknown,
        }
    }

    pub fn is_64bit(self) -> bool {
        matches!(self, Arch::Arm64 | Arch::X86_64 | Arch::Mips64)
    }

    /// Pointer size in bytes on the target.
    pub fn address_size(self) -> u8 {
        if self.is_64bit() {
            8
        } else {
            4
        }
    }

    /// Removes the AArch64 top-byte tag so that the address can be used for
    /// a lookup or a memory read. Other architectures are untouched.
    #[inline(always)]
    pub fn strip_address_tag(self, addr: u64) -> u64 {
        match self {
            Arch::Arm64 => (((addr as i64) << 8) >> 8) as u64,
            _ => addr,
        }
    }
}
