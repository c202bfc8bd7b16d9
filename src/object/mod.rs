//! The boundary between the unwinder and the code it unwinds through.
//!
//! Every map gets at most one object. ELF images are the only objects that
//! can step; JIT-registered ELF and DEX images are also reachable through
//! [`Symfile`] for the global-debug walkers.

use crate::arch::Arch;
use crate::error::StepError;
use crate::maps::Maps;
use crate::memory::Memory;
use crate::regs::Regs;

/// The outcome of one successful step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StepResult {
    /// No caller frame exists.
    pub finished: bool,
    /// The caller's registers were restored from a signal frame.
    pub is_signal_frame: bool,
}

/// An object mapped into the process. `rel_pc` values are addresses in the
/// object's own vaddr space, see [`crate::MapInfo::rel_pc`].
pub trait UnwindObject: Send + Sync {
    /// False if the object could not be parsed. Invalid objects answer
    /// every query negatively.
    fn valid(&self) -> bool;

    fn arch(&self) -> Arch;

    /// `vaddr - file offset` of the first executable segment.
    fn load_bias(&self) -> i64;

    /// The object's bytes, addressed by file offset.
    fn memory(&self) -> Option<&dyn Memory>;

    /// Unwinds one frame, rewriting `regs` to the caller's registers.
    fn step(
        &self,
        rel_pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> Result<StepResult, StepError>;

    /// Checks for a kernel signal trampoline at `rel_pc` and, if there is
    /// one, restores `regs` from the signal frame.
    fn step_if_signal_handler(
        &self,
        rel_pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> bool {
        if !self.valid() {
            return false;
        }
        let Some(memory) = self.memory() else {
            return false;
        };
        let load_bias = self.load_bias();
        let elf_offset = if load_bias >= 0 {
            match rel_pc.checked_sub(load_bias as u64) {
                Some(offset) => offset,
                None => return false,
            }
        } else {
            rel_pc.wrapping_add(load_bias.unsigned_abs())
        };
        regs.step_if_signal_handler(elf_offset, memory, process_memory)
    }

    /// The function containing `rel_pc` and the offset into it.
    fn function_name(&self, rel_pc: u64) -> Option<(String, u64)>;

    /// The file offset of the global variable `name`.
    fn global_variable_offset(&self, _name: &str) -> Option<u64> {
        None
    }

    fn is_valid_pc(&self, rel_pc: u64) -> bool;

    fn build_id(&self) -> Option<&[u8]> {
        None
    }

    fn soname(&self) -> Option<&str> {
        None
    }
}

/// An image registered with a runtime through a global debug descriptor.
/// Addresses passed to a symfile are absolute process addresses.
pub trait Symfile: Send + Sync + Sized {
    /// Loads the image that occupies `[addr, addr + size)` of process memory.
    fn load(maps: &Maps, memory: &dyn Memory, addr: u64, size: u64) -> Option<Self>;

    fn contains_pc(&self, pc: u64) -> bool;

    fn symbolize(&self, pc: u64) -> Option<(String, u64)>;
}
