//! Unwinds the stacks of stopped threads and names the functions on them.
//!
//! An unwind needs three things: the thread's registers ([`Regs`]), the
//! process's address-space layout ([`Maps`]) and a way to read its memory
//! (any [`Memory`]). The [`Unwinder`] resolves the pc of each frame to a
//! map, creates the map's object through an [`ObjectCache`], steps the
//! registers to the caller using the object's CFI (`.eh_frame`,
//! `.debug_frame`, ARM `.ARM.exidx`) and symbolizes the frame.
//!
//! Code that no map describes is found through the runtime's global debug
//! descriptors: [`JitDebug`] for JIT-compiled ELF images and [`DexFiles`]
//! for DEX bytecode.
//!
//! ```no_run
//! use std::sync::Arc;
//! use unwindstack::{Arch, Maps, MemorySnapshot, Regs, Unwinder};
//!
//! let maps = Maps::parse("1000-8000 r-xp 00000000 00:00 0 /system/lib64/libc.so\n").unwrap();
//! let mut regs = Regs::new(Arch::X86_64).unwrap();
//! regs.set_pc(0x1234);
//! regs.set_sp(0x7fff_0000);
//!
//! let mut unwinder = Unwinder::new(Arc::new(maps), regs, Arc::new(MemorySnapshot::new()));
//! unwinder.unwind();
//! for i in 0..unwinder.num_frames() {
//!     println!("{}", unwinder.format_frame(i).unwrap());
//! }
//! ```

mod arcdata;
mod arch;
mod display_utils;
mod error;
mod frame;
mod maps;
mod object;
mod object_cache;
mod unwinder;

pub mod dex;
pub mod dwarf;
pub mod elf;
pub mod global_debug;
pub mod memory;
pub mod regs;

pub use arcdata::{ArcData, ObjectBytes};
pub use arch::Arch;
pub use dex::DexFile;
pub use elf::{Elf, ElfError};
pub use error::{Error, ErrorCode, ErrorData, MemoryError, StepError, Warnings};
pub use frame::{format_frame, FrameData};
pub use global_debug::{DexFiles, GlobalDebug, JitDebug};
pub use maps::{MapFlags, MapInfo, Maps, MapsError};
pub use memory::{Memory, MemorySnapshot};
pub use object::{StepResult, Symfile, UnwindObject};
pub use object_cache::ObjectCache;
pub use regs::Regs;
pub use unwinder::{Unwinder, UnwinderOptions, DEFAULT_MAX_FRAMES};
