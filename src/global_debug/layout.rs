//! Field offsets of `jit_descriptor` and `jit_code_entry` in the target.
//!
//! ```text
//! struct jit_code_entry {          struct jit_descriptor {
//!     uintptr_t next;                  uint32_t version;
//!     uintptr_t prev;                  uint32_t action_flag;
//!     uintptr_t symfile_addr;          uintptr_t relevant_entry;
//!     uint64_t symfile_size;           uintptr_t first_entry;
//!     // "Android2" only                // "Android2" only
//!     uint64_t timestamp;              uint8_t magic[8];
//!     uint32_t seqlock;                uint32_t flags;
//! };                                   uint32_t sizeof_descriptor;
//!                                      uint32_t sizeof_entry;
//!                                      uint32_t seqlock;
//!                                      uint64_t timestamp;
//!                                  };
//! ```
//!
//! `uint64_t` is 8-byte aligned everywhere except 32-bit x86.

use crate::arch::Arch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub descriptor_first_entry: u64,
    pub descriptor_magic: u64,
    pub descriptor_size_v1: u64,
    pub descriptor_size_v2: u64,
    pub entry_next: u64,
    pub entry_symfile_addr: u64,
    pub entry_symfile_size: u64,
    pub entry_timestamp: u64,
    pub entry_seqlock: u64,
    pub entry_size_v1: u64,
    pub entry_size_v2: u64,
}

impl Layout {
    pub fn for_arch(arch: Arch) -> Option<Layout> {
        Some(match arch {
            Arch::X86 => Layout {
                descriptor_first_entry: 12,
                descriptor_magic: 16,
                descriptor_size_v1: 16,
                descriptor_size_v2: 48,
                entry_next: 0,
                entry_symfile_addr: 8,
                entry_symfile_size: 12,
                entry_timestamp: 20,
                entry_seqlock: 28,
                entry_size_v1: 20,
                entry_size_v2: 32,
            },
            Arch::Arm | Arch::Mips => Layout {
                descriptor_first_entry: 12,
                descriptor_magic: 16,
                descriptor_size_v1: 16,
                descriptor_size_v2: 48,
                entry_next: 0,
                entry_symfile_addr: 8,
                entry_symfile_size: 16,
                entry_timestamp: 24,
                entry_seqlock: 32,
                entry_size_v1: 24,
                entry_size_v2: 40,
            },
            Arch::Arm64 | Arch::X86_64 | Arch::Mips64 => Layout {
                descriptor_first_entry: 16,
                descriptor_magic: 24,
                descriptor_size_v1: 24,
                descriptor_size_v2: 56,
                entry_next: 0,
                entry_symfile_addr: 16,
                entry_symfile_size: 24,
                entry_timestamp: 32,
                entry_seqlock: 40,
                entry_size_v1: 32,
                entry_size_v2: 48,
            },
            Arch::Unknown => return None,
        })
    }
}
