//! Reads the lists of in-memory symbol files that runtimes publish through
//! the GDB JIT interface (`__jit_debug_descriptor`) and its DEX twin
//! (`__dex_debug_descriptor`).
//!
//! The target keeps modifying the list while it is read. Every entry of an
//! "Android2" descriptor carries a seqlock, and an entry is trusted only if
//! the same even seqlock value is seen before and after reading it. A race
//! restarts the walk; loaded symbol files are cached by `(address, seqlock)`
//! so a restart does not load them again.

mod layout;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use self::layout::Layout;
use crate::arch::Arch;
use crate::dex::DexFile;
use crate::elf::Elf;
use crate::error::Error;
use crate::maps::{MapFlags, MapInfo, Maps};
use crate::memory::Memory;
use crate::object::Symfile;
use crate::object_cache::ObjectCache;

const MAX_RACE_RETRIES: usize = 16;
const MAX_HEAD_RETRIES: usize = 16;
const MAGIC: &[u8; 8] = b"Android2";

pub const JIT_DEBUG_DESCRIPTOR: &str = "__jit_debug_descriptor";
pub const DEX_DEBUG_DESCRIPTOR: &str = "__dex_debug_descriptor";

/// JIT-compiled code registered as in-memory ELF images.
pub type JitDebug = GlobalDebug<Elf>;
/// DEX files registered by the runtime.
pub type DexFiles = GlobalDebug<DexFile>;

/// Identifies one version of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct Uid {
    address: u64,
    seqlock: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadError {
    /// The producer changed the list while it was read. Retry.
    Race,
    /// Memory could not be read.
    Failed,
}

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    addr: u64,
    entry_size: u64,
    /// `None` for descriptors without the "Android2" extension.
    seqlock_offset: Option<u64>,
}

struct CodeEntry {
    symfile_addr: u64,
    symfile_size: u64,
    timestamp: Option<u64>,
}

/// A loaded symfile and the process memory it was loaded from.
pub struct Registered<S> {
    pub symfile: Arc<S>,
    pub addr: u64,
    pub size: u64,
}

impl<S> Clone for Registered<S> {
    fn clone(&self) -> Self {
        Self {
            symfile: self.symfile.clone(),
            addr: self.addr,
            size: self.size,
        }
    }
}

struct State<S> {
    descriptor: Option<Descriptor>,
    entries: BTreeMap<Uid, Registered<S>>,
}

pub struct GlobalDebug<S: Symfile> {
    arch: Arch,
    layout: Layout,
    memory: Arc<dyn Memory>,
    objects: Arc<ObjectCache>,
    variable_name: &'static str,
    search_libs: Vec<String>,
    state: Mutex<State<S>>,
}

impl GlobalDebug<Elf> {
    pub fn jit(
        arch: Arch,
        memory: Arc<dyn Memory>,
        objects: Arc<ObjectCache>,
    ) -> Result<Self, Error> {
        Self::new(arch, memory, objects, JIT_DEBUG_DESCRIPTOR)
    }
}

impl GlobalDebug<DexFile> {
    pub fn dex(
        arch: Arch,
        memory: Arc<dyn Memory>,
        objects: Arc<ObjectCache>,
    ) -> Result<Self, Error> {
        Self::new(arch, memory, objects, DEX_DEBUG_DESCRIPTOR)
    }
}

impl<S: Symfile> GlobalDebug<S> {
    /// A reader for the descriptor called `variable_name`. Caching layers
    /// of `memory` are bypassed: the producer's writes must be seen as
    /// they happen.
    pub fn new(
        arch: Arch,
        memory: Arc<dyn Memory>,
        objects: Arc<ObjectCache>,
        variable_name: &'static str,
    ) -> Result<Self, Error> {
        let layout = Layout::for_arch(arch).ok_or(Error::BadArch)?;
        let memory = memory.uncached().unwrap_or(memory);
        Ok(Self {
            arch,
            layout,
            memory,
            objects,
            variable_name,
            search_libs: Vec::new(),
            state: Mutex::new(State {
                descriptor: None,
                entries: BTreeMap::new(),
            }),
        })
    }

    /// Only look for the descriptor in libraries with these file names.
    pub fn with_search_libs(mut self, search_libs: Vec<String>) -> Self {
        self.search_libs = search_libs;
        self
    }

    /// Uses the descriptor at `addr` instead of searching the maps for it.
    /// Returns false if no usable descriptor is there.
    pub fn set_descriptor_address(&self, addr: u64) -> bool {
        let descriptor = self.read_descriptor(addr);
        let mut state = self.state.lock();
        state.descriptor = descriptor;
        state.entries.clear();
        descriptor.is_some()
    }

    /// The symbol file whose code contains `pc`. Files that can name the
    /// function at `pc` are preferred.
    pub fn find(&self, maps: &Maps, pc: u64) -> Option<Registered<S>> {
        let mut result = None;
        self.for_each_symfile(maps, pc, |registered| {
            result = Some(registered.clone());
            registered.symfile.symbolize(pc).is_some()
        });
        result
    }

    pub fn function_name(&self, maps: &Maps, pc: u64) -> Option<(String, u64)> {
        let mut name = None;
        self.for_each_symfile(maps, pc, |registered| {
            name = registered.symfile.symbolize(pc);
            name.is_some()
        });
        name
    }

    /// Calls `f` with every symbol file containing `pc` until it returns
    /// true. Cached files are tried first; if none accepts, the list is
    /// re-read and the search repeated.
    fn for_each_symfile(
        &self,
        maps: &Maps,
        pc: u64,
        mut f: impl FnMut(&Registered<S>) -> bool,
    ) -> bool {
        let mut state = self.state.lock();
        if state.descriptor.is_none() {
            state.descriptor = self.find_descriptor(maps);
        }
        let Some(descriptor) = state.descriptor else {
            return false;
        };

        for (uid, registered) in &state.entries {
            // Old entries may have been freed since they were read.
            if registered.symfile.contains_pc(pc)
                && self.check_seqlock(&descriptor, *uid).is_ok()
                && f(registered)
            {
                return true;
            }
        }

        self.read_all_entries(maps, &descriptor, &mut state.entries);
        // An entry that went stale since the re-read is still used: the
        // runtime only frees code after copying it elsewhere.
        state
            .entries
            .values()
            .any(|registered| registered.symfile.contains_pc(pc) && f(registered))
    }

    fn searchable(&self, name: &str) -> bool {
        if name.is_empty() || name.starts_with("/dev/") {
            return false;
        }
        if self.search_libs.is_empty() {
            return true;
        }
        let base_name = name.rsplit('/').next().unwrap_or(name);
        self.search_libs.iter().any(|lib| lib == base_name)
    }

    /// Looks for the descriptor variable in each library. The variable lives
    /// in a read-write map that follows the library's offset-zero map.
    fn find_descriptor(&self, maps: &Maps) -> Option<Descriptor> {
        let mut map_zero: Option<&Arc<MapInfo>> = None;
        for map in maps {
            let writable = map.flags().contains(MapFlags::READ | MapFlags::WRITE);
            match map_zero {
                Some(zero) if writable && self.searchable(map.name()) && map.name() == zero.name() => {
                    if let Some(descriptor) = self.read_variable(zero, map) {
                        return Some(descriptor);
                    }
                }
                _ if map.offset() == 0 && !map.name().is_empty() => map_zero = Some(map),
                _ => {}
            }
        }
        None
    }

    fn read_variable(&self, map_zero: &MapInfo, rw_map: &MapInfo) -> Option<Descriptor> {
        let object = self.objects.get(map_zero, &self.memory);
        let offset = object
            .global_variable_offset(self.variable_name)
            .filter(|&offset| offset != 0)?;
        let rw_size = rw_map.end() - rw_map.start();
        if offset < rw_map.offset() || offset - rw_map.offset() >= rw_size {
            return None;
        }
        self.read_descriptor(rw_map.start() + offset - rw_map.offset())
    }

    fn read_descriptor(&self, addr: u64) -> Option<Descriptor> {
        let layout = &self.layout;
        let mut buf = vec![0; layout.descriptor_size_v2 as usize];
        if self.memory.read_fully(addr, &mut buf).is_err() {
            // Without the extension the magic check fails below.
            buf.truncate(layout.descriptor_size_v1 as usize);
            self.memory.read_fully(addr, &mut buf).ok()?;
        }
        let version = u32::from_le_bytes(buf[..4].try_into().ok()?);
        let first_entry = self.pointer_at(&buf, layout.descriptor_first_entry)?;
        if version != 1 || first_entry == 0 {
            log::trace!("No entries in {} at 0x{addr:x}", self.variable_name);
            return None;
        }
        let magic_start = layout.descriptor_magic as usize;
        let android2 = buf.get(magic_start..magic_start + MAGIC.len()) == Some(&MAGIC[..]);
        Some(if android2 {
            Descriptor {
                addr,
                entry_size: layout.entry_size_v2,
                seqlock_offset: Some(layout.entry_seqlock),
            }
        } else {
            Descriptor {
                addr,
                entry_size: layout.entry_size_v1,
                seqlock_offset: None,
            }
        })
    }

    fn pointer_at(&self, buf: &[u8], offset: u64) -> Option<u64> {
        let start = offset as usize;
        if self.arch.is_64bit() {
            Some(u64::from_le_bytes(buf.get(start..start + 8)?.try_into().ok()?))
        } else {
            Some(u64::from(u32::from_le_bytes(
                buf.get(start..start + 4)?.try_into().ok()?,
            )))
        }
    }

    fn u64_at(buf: &[u8], offset: u64) -> Option<u64> {
        let start = offset as usize;
        Some(u64::from_le_bytes(buf.get(start..start + 8)?.try_into().ok()?))
    }

    fn read_entry(&self, descriptor: &Descriptor, addr: u64) -> Result<CodeEntry, ReadError> {
        let mut buf = vec![0; descriptor.entry_size as usize];
        self.memory
            .read_fully(addr, &mut buf)
            .map_err(|_| ReadError::Failed)?;
        let layout = &self.layout;
        let symfile_addr = self
            .pointer_at(&buf, layout.entry_symfile_addr)
            .ok_or(ReadError::Failed)?;
        let symfile_size = Self::u64_at(&buf, layout.entry_symfile_size).ok_or(ReadError::Failed)?;
        let timestamp = descriptor
            .seqlock_offset
            .and_then(|_| Self::u64_at(&buf, layout.entry_timestamp));
        Ok(CodeEntry {
            symfile_addr: self.arch.strip_address_tag(symfile_addr),
            symfile_size,
            timestamp,
        })
    }

    /// Reads a pointer to an entry together with the entry's seqlock, as if
    /// both were read atomically.
    fn read_next_field(&self, descriptor: &Descriptor, field_addr: u64) -> Result<Uid, ReadError> {
        let mut address = [0u64; 2];
        let mut seqlock = [0u32; 2];
        for i in 0..2 {
            fence(Ordering::Acquire);
            let raw = self
                .memory
                .read_address(field_addr, self.arch)
                .map_err(|_| ReadError::Failed)?;
            address[i] = self.arch.strip_address_tag(raw);
            let Some(seqlock_offset) = descriptor.seqlock_offset else {
                return Ok(Uid {
                    address: address[0],
                    seqlock: 0,
                });
            };
            if address[i] != 0 {
                fence(Ordering::Acquire);
                seqlock[i] = self
                    .memory
                    .read_u32(address[i].wrapping_add(seqlock_offset))
                    .map_err(|_| ReadError::Failed)?;
            }
        }
        if address[0] != address[1] || seqlock[0] != seqlock[1] || seqlock[0] & 1 == 1 {
            return Err(ReadError::Race);
        }
        Ok(Uid {
            address: address[1],
            seqlock: seqlock[1],
        })
    }

    /// Checks that the entry has not been freed or reused since `uid` was
    /// read.
    fn check_seqlock(&self, descriptor: &Descriptor, uid: Uid) -> Result<(), ReadError> {
        let Some(seqlock_offset) = descriptor.seqlock_offset else {
            return Ok(());
        };
        fence(Ordering::Acquire);
        let seen = self
            .memory
            .read_u32(uid.address.wrapping_add(seqlock_offset))
            .map_err(|_| ReadError::Failed)?;
        if seen != uid.seqlock {
            return Err(ReadError::Race);
        }
        Ok(())
    }

    fn read_all_entries(
        &self,
        maps: &Maps,
        descriptor: &Descriptor,
        entries: &mut BTreeMap<Uid, Registered<S>>,
    ) -> bool {
        for _ in 0..MAX_RACE_RETRIES {
            match self.read_all_entries_once(maps, descriptor, entries) {
                Ok(()) => return true,
                Err(ReadError::Race) => continue,
                Err(ReadError::Failed) => return false,
            }
        }
        log::debug!(
            "Gave up reading {} after {MAX_RACE_RETRIES} races",
            self.variable_name
        );
        false
    }

    /// New entries are pushed at the head while the list is walked, so the
    /// head is re-read until a walk finds nothing new.
    fn read_all_entries_once(
        &self,
        maps: &Maps,
        descriptor: &Descriptor,
        entries: &mut BTreeMap<Uid, Registered<S>>,
    ) -> Result<(), ReadError> {
        let mut fresh = BTreeMap::new();
        for _ in 0..MAX_HEAD_RETRIES {
            let old_len = fresh.len();
            self.read_new_entries(maps, descriptor, entries, &mut fresh)?;
            if fresh.len() == old_len {
                *entries = fresh;
                return Ok(());
            }
        }
        Err(ReadError::Failed)
    }

    /// Walks from the head until reaching an entry read in an earlier pass.
    fn read_new_entries(
        &self,
        maps: &Maps,
        descriptor: &Descriptor,
        cached: &BTreeMap<Uid, Registered<S>>,
        fresh: &mut BTreeMap<Uid, Registered<S>>,
    ) -> Result<(), ReadError> {
        let mut visited = BTreeSet::new();
        let mut uid =
            self.read_next_field(descriptor, descriptor.addr + self.layout.descriptor_first_entry)?;
        while uid.address != 0 {
            if fresh.contains_key(&uid) || !visited.insert(uid) {
                return Ok(());
            }

            let entry = self.read_entry(descriptor, uid.address)?;
            self.check_seqlock(descriptor, uid)?;

            if let Some(registered) = cached.get(&uid) {
                fresh.insert(uid, registered.clone());
            } else if entry.symfile_addr != 0 {
                let symfile =
                    S::load(maps, &*self.memory, entry.symfile_addr, entry.symfile_size);
                // The symfile may have been freed while it was copied.
                self.check_seqlock(descriptor, uid)?;
                if let Some(symfile) = symfile {
                    log::trace!(
                        "Loaded symfile at 0x{:x} (timestamp {:?})",
                        entry.symfile_addr,
                        entry.timestamp
                    );
                    fresh.insert(
                        uid,
                        Registered {
                            symfile: Arc::new(symfile),
                            addr: entry.symfile_addr,
                            size: entry.symfile_size,
                        },
                    );
                }
            }

            let next =
                self.read_next_field(descriptor, uid.address + self.layout.entry_next)?;
            self.check_seqlock(descriptor, uid)?;
            uid = next;
        }
        Ok(())
    }
}
