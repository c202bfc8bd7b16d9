use std::collections::BTreeMap;
use std::sync::Arc;

use crate::arch::Arch;
use crate::error::{Error, ErrorCode, ErrorData, Warnings};
use crate::frame::{format_frame, FrameData};
use crate::global_debug::{DexFiles, JitDebug};
use crate::maps::{MapFlags, MapInfo, Maps};
use crate::memory::{Memory, MemoryCache, MemoryRemote};
use crate::object::UnwindObject;
use crate::object_cache::ObjectCache;
use crate::regs::Regs;

pub const DEFAULT_MAX_FRAMES: usize = 64;

/// What an unwind produces and where it stops.
#[derive(Debug, Clone)]
pub struct UnwinderOptions {
    pub max_frames: usize,
    /// When false, frames carry no function names.
    pub resolve_names: bool,
    /// Appends `(BuildId: ...)` in [`Unwinder::format_frame`].
    pub display_build_id: bool,
    /// File names (without directory) of maps whose frames are dropped
    /// while they are the innermost frames.
    pub initial_map_names_to_skip: Vec<String>,
    /// File extensions, without the dot. The unwind stops before a frame in
    /// a map with one of these extensions, without creating its object.
    pub map_suffixes_to_ignore: Vec<String>,
    /// `function start -> size`. The unwind stops after the first frame
    /// inside one of these functions.
    pub functions_to_stop_at: BTreeMap<u64, u64>,
}

impl Default for UnwinderOptions {
    fn default() -> Self {
        Self {
            max_frames: DEFAULT_MAX_FRAMES,
            resolve_names: true,
            display_build_id: false,
            initial_map_names_to_skip: Vec::new(),
            map_suffixes_to_ignore: Vec::new(),
            functions_to_stop_at: BTreeMap::new(),
        }
    }
}

impl UnwinderOptions {
    pub fn max_frames(mut self, max_frames: usize) -> Self {
        self.max_frames = max_frames;
        self
    }

    pub fn resolve_names(mut self, resolve_names: bool) -> Self {
        self.resolve_names = resolve_names;
        self
    }

    pub fn display_build_id(mut self, display_build_id: bool) -> Self {
        self.display_build_id = display_build_id;
        self
    }

    pub fn initial_map_names_to_skip(mut self, names: Vec<String>) -> Self {
        self.initial_map_names_to_skip = names;
        self
    }

    pub fn map_suffixes_to_ignore(mut self, suffixes: Vec<String>) -> Self {
        self.map_suffixes_to_ignore = suffixes;
        self
    }

    pub fn functions_to_stop_at(mut self, functions: BTreeMap<u64, u64>) -> Self {
        self.functions_to_stop_at = functions;
        self
    }
}

/// Walks the stack of one thread, innermost frame first.
///
/// The registers given to the unwinder are never modified, so unwinding
/// twice over unchanged memory yields the same frames.
pub struct Unwinder {
    options: UnwinderOptions,
    maps: Arc<Maps>,
    regs: Regs,
    process_memory: Arc<dyn Memory>,
    objects: Arc<ObjectCache>,
    jit_debug: Option<Arc<JitDebug>>,
    dex_files: Option<Arc<DexFiles>>,

    frames: Vec<FrameData>,
    last_error: ErrorData,
    warnings: Warnings,
}

/// Where a pc lands: the map, the object to step and symbolize with, and
/// the pcs to use with it.
struct Location {
    map_info: Option<Arc<MapInfo>>,
    object: Option<Arc<dyn UnwindObject>>,
    rel_pc: u64,
    /// The pc to step and symbolize with. Differs from `rel_pc` for JIT
    /// code, which is addressed by absolute pc.
    step_pc: u64,
    pc_adjustment: u64,
}

impl Unwinder {
    pub fn new(maps: Arc<Maps>, regs: Regs, process_memory: Arc<dyn Memory>) -> Self {
        let objects = Arc::new(ObjectCache::new(regs.arch()));
        Self {
            options: UnwinderOptions::default(),
            maps,
            regs,
            process_memory,
            objects,
            jit_debug: None,
            dex_files: None,
            frames: Vec::new(),
            last_error: ErrorData::default(),
            warnings: Warnings::empty(),
        }
    }

    /// An unwinder for a thread of another process. The maps are read from
    /// `/proc/<pid>/maps` and memory through a cache over `/proc/<pid>/mem`.
    /// JIT and DEX descriptors are looked up in the process.
    pub fn for_pid(pid: libc::pid_t, regs: Regs) -> Result<Self, Error> {
        let arch = regs.arch();
        let maps = Arc::new(Maps::parse_pid(pid)?);
        let process_memory: Arc<dyn Memory> =
            Arc::new(MemoryCache::new(Arc::new(MemoryRemote::new(pid))));
        let mut unwinder = Self::new(maps, regs, process_memory.clone());
        let jit_debug = JitDebug::jit(arch, process_memory.clone(), unwinder.objects.clone())?;
        let dex_files = DexFiles::dex(arch, process_memory, unwinder.objects.clone())?;
        unwinder.jit_debug = Some(Arc::new(jit_debug));
        unwinder.dex_files = Some(Arc::new(dex_files));
        Ok(unwinder)
    }

    pub fn with_options(mut self, options: UnwinderOptions) -> Self {
        self.options = options;
        self
    }

    /// Shares objects with other unwinders of the same process.
    pub fn with_object_cache(mut self, objects: Arc<ObjectCache>) -> Self {
        self.objects = objects;
        self
    }

    pub fn set_jit_debug(&mut self, jit_debug: Arc<JitDebug>) {
        self.jit_debug = Some(jit_debug);
    }

    pub fn set_dex_files(&mut self, dex_files: Arc<DexFiles>) {
        self.dex_files = Some(dex_files);
    }

    pub fn set_regs(&mut self, regs: Regs) {
        self.regs = regs;
    }

    pub fn options(&self) -> &UnwinderOptions {
        &self.options
    }

    pub fn options_mut(&mut self) -> &mut UnwinderOptions {
        &mut self.options
    }

    pub fn arch(&self) -> Arch {
        self.regs.arch()
    }

    pub fn maps(&self) -> &Arc<Maps> {
        &self.maps
    }

    pub fn object_cache(&self) -> &Arc<ObjectCache> {
        &self.objects
    }

    pub fn frames(&self) -> &[FrameData] {
        &self.frames
    }

    pub fn into_frames(self) -> Vec<FrameData> {
        self.frames
    }

    pub fn num_frames(&self) -> usize {
        self.frames.len()
    }

    pub fn last_error(&self) -> ErrorData {
        self.last_error
    }

    pub fn last_error_code(&self) -> ErrorCode {
        self.last_error.code
    }

    pub fn warnings(&self) -> Warnings {
        self.warnings
    }

    pub fn format_frame(&self, index: usize) -> Option<String> {
        let frame = self.frames.get(index)?;
        Some(format_frame(self.arch(), frame, self.options.display_build_id))
    }

    pub fn unwind(&mut self) {
        self.frames.clear();
        self.last_error = ErrorData::default();
        self.warnings = Warnings::empty();
        self.process_memory.clear();

        let mut regs = self.regs.clone();
        let arch = regs.arch();
        let mut skipping = !self.options.initial_map_names_to_skip.is_empty();
        let mut return_address_attempt = false;
        let mut adjust_pc = false;

        while self.frames.len() < self.options.max_frames {
            let cur_pc = regs.pc();
            let cur_sp = regs.sp();
            let lookup_pc = arch.strip_address_tag(cur_pc);

            let map_info = self
                .maps
                .find(lookup_pc)
                .cloned()
                .or_else(|| self.jit_map(lookup_pc));

            let mut skip_frame = false;
            let location = match map_info {
                Some(map_info) => {
                    skip_frame = skipping && self.skipped(&map_info);
                    if !skip_frame && self.ignored(&map_info) {
                        break;
                    }
                    self.locate(map_info, lookup_pc, adjust_pc.then_some(&regs))
                }
                None => {
                    // An invalid map reached by the return-address fallback
                    // does not hide the error of the frame before it.
                    if !return_address_attempt || self.last_error.code == ErrorCode::None {
                        self.last_error = ErrorData::new(ErrorCode::InvalidMap, lookup_pc);
                    }
                    Location {
                        map_info: None,
                        object: None,
                        rel_pc: lookup_pc,
                        step_pc: lookup_pc,
                        pc_adjustment: 0,
                    }
                }
            };

            let mut frame_index = None;
            if !skip_frame {
                if regs.dex_pc() != 0 {
                    self.push_dex_frame(&regs);
                    regs.set_dex_pc(0);
                    if self.frames.len() == self.options.max_frames {
                        self.last_error.code = ErrorCode::MaxFramesExceeded;
                        break;
                    }
                }
                frame_index = Some(self.push_frame(&location, cur_pc, cur_sp));
                skipping = false;
            }
            adjust_pc = true;

            let mut step_pc = location.step_pc;
            let mut stepped = false;
            let mut in_device_map = false;
            let mut finished = false;
            if let (Some(map_info), Some(object)) = (&location.map_info, &location.object) {
                let sp_in_device = self
                    .maps
                    .find(arch.strip_address_tag(cur_sp))
                    .is_some_and(|map| map.is_device_map());
                if map_info.is_device_map() || sp_in_device {
                    // Not a break: a speculative frame may still need removing.
                    in_device_map = true;
                } else {
                    let mut is_signal_frame = false;
                    if object.step_if_signal_handler(
                        location.rel_pc,
                        &mut regs,
                        &*self.process_memory,
                    ) {
                        stepped = true;
                        is_signal_frame = true;
                        self.last_error = ErrorData::default();
                    } else {
                        match object.step(step_pc, &mut regs, &*self.process_memory) {
                            Ok(result) => {
                                stepped = true;
                                finished = result.finished;
                                is_signal_frame = result.is_signal_frame;
                                self.last_error = ErrorData::default();
                            }
                            Err(e) => {
                                log::trace!("Step at 0x{step_pc:x} failed: {e}");
                                self.last_error = e.error_data();
                            }
                        }
                    }

                    if is_signal_frame {
                        // The interrupted pc is not a return address.
                        if let Some(index) = frame_index {
                            let frame = &mut self.frames[index];
                            frame.rel_pc = location.rel_pc;
                            frame.pc = frame.pc.wrapping_add(location.pc_adjustment);
                        }
                        step_pc = location.rel_pc;
                        adjust_pc = false;
                    }
                }
            }

            if stepped && return_address_attempt {
                self.warnings |= Warnings::SPECULATIVE_FRAME;
            }

            if let Some(index) = frame_index {
                if self.options.resolve_names {
                    if let Some((name, offset)) = location
                        .object
                        .as_ref()
                        .and_then(|object| object.function_name(step_pc))
                    {
                        let frame = &mut self.frames[index];
                        frame.function_name = name;
                        frame.function_offset = offset;
                    }
                }
                if self.stops_at(self.frames[index].pc) {
                    break;
                }
            }

            if finished {
                break;
            }

            if !stepped {
                if return_address_attempt {
                    // Keep the speculative frame only if it is the second of
                    // two frames and the first pc is outside every map.
                    let first_pc_mapped = self
                        .frames
                        .first()
                        .is_some_and(|frame| self.maps.find(arch.strip_address_tag(frame.pc)).is_some());
                    if self.frames.len() > 2 || first_pc_mapped {
                        self.frames.pop();
                    } else if !self.frames.is_empty() {
                        self.warnings |= Warnings::SPECULATIVE_FRAME;
                    }
                    break;
                }
                if in_device_map {
                    break;
                }
                if !regs.set_pc_from_return_address(&*self.process_memory) {
                    break;
                }
                return_address_attempt = true;
            } else {
                return_address_attempt = false;
                if self.frames.len() == self.options.max_frames {
                    self.last_error.code = ErrorCode::MaxFramesExceeded;
                }
            }

            if cur_pc == regs.pc() && cur_sp == regs.sp() {
                self.last_error.code = ErrorCode::RepeatedFrame;
                break;
            }
        }
    }

    /// Symbolizes a single pc, as if it were a return address.
    pub fn build_frame_from_pc_only(&self, pc: u64) -> FrameData {
        let lookup_pc = self.arch().strip_address_tag(pc);
        let Some(map_info) = self.maps.find(lookup_pc).cloned() else {
            return FrameData {
                pc,
                rel_pc: pc,
                ..FrameData::default()
            };
        };
        let location = self.locate(map_info, lookup_pc, Some(&self.regs));
        let mut frame = FrameData {
            pc: pc.wrapping_sub(location.pc_adjustment),
            rel_pc: location.rel_pc.wrapping_sub(location.pc_adjustment),
            ..FrameData::default()
        };
        if self.options.resolve_names {
            if let Some((name, offset)) = location
                .object
                .as_ref()
                .and_then(|object| object.function_name(location.step_pc))
            {
                frame.function_name = name;
                frame.function_offset = offset;
            }
        }
        frame.map_info = location.map_info;
        frame
    }

    /// Resolves `pc` inside `map_info`. With `adjust_for`, `pc` is a return
    /// address and is moved back into the call instruction.
    fn locate(&self, map_info: Arc<MapInfo>, pc: u64, adjust_for: Option<&Regs>) -> Location {
        let mut object = self.objects.get(&map_info, &self.process_memory);
        let rel_pc = map_info.rel_pc(pc);
        let pc_adjustment = adjust_for.map_or(0, |regs| regs.pc_adjustment(rel_pc, &*object));
        let mut step_pc = if map_info.flags().contains(MapFlags::JIT_SYMFILE) {
            pc
        } else {
            rel_pc
        }
        .wrapping_sub(pc_adjustment);

        if !object.valid() && map_info.flags().contains(MapFlags::EXEC) {
            let jit_pc = pc.wrapping_sub(pc_adjustment);
            if let Some(jit) = self
                .jit_debug
                .as_ref()
                .and_then(|jit_debug| jit_debug.find(&self.maps, jit_pc))
            {
                let jit_object: Arc<dyn UnwindObject> = jit.symfile;
                step_pc = jit_pc;
                object = jit_object;
            }
        }

        Location {
            map_info: Some(map_info),
            object: Some(object),
            rel_pc,
            step_pc,
            pc_adjustment,
        }
    }

    /// A map standing in for JIT code that no map covers. Its object is the
    /// JIT image, and its rel_pc is the absolute pc.
    fn jit_map(&self, pc: u64) -> Option<Arc<MapInfo>> {
        let jit = self.jit_debug.as_ref()?.find(&self.maps, pc)?;
        let map_info = Arc::new(MapInfo::new(
            jit.addr,
            jit.addr.saturating_add(jit.size),
            0,
            MapFlags::READ | MapFlags::EXEC | MapFlags::JIT_SYMFILE,
            "",
        ));
        map_info.set_object(jit.symfile);
        map_info.set_load_bias(jit.addr as i64);
        Some(map_info)
    }

    fn skipped(&self, map_info: &MapInfo) -> bool {
        let name = map_info.name();
        let base_name = name.rsplit('/').next().unwrap_or(name);
        self.options
            .initial_map_names_to_skip
            .iter()
            .any(|skip| skip == base_name)
    }

    fn ignored(&self, map_info: &MapInfo) -> bool {
        let name = map_info.name();
        self.options
            .map_suffixes_to_ignore
            .iter()
            .any(|suffix| name.rsplit_once('.').is_some_and(|(_, ext)| ext == suffix))
    }

    fn stops_at(&self, pc: u64) -> bool {
        let pc = self.arch().strip_address_tag(pc);
        self.options
            .functions_to_stop_at
            .range(..=pc)
            .next_back()
            .is_some_and(|(&start, &size)| pc < start.saturating_add(size))
    }

    fn push_frame(&mut self, location: &Location, pc: u64, sp: u64) -> usize {
        let index = self.frames.len();
        let frame = match &location.map_info {
            Some(map_info) => FrameData {
                index,
                pc: pc.wrapping_sub(location.pc_adjustment),
                rel_pc: location.rel_pc.wrapping_sub(location.pc_adjustment),
                sp,
                map_info: Some(map_info.clone()),
                ..FrameData::default()
            },
            None => FrameData {
                index,
                pc,
                rel_pc: location.rel_pc,
                sp,
                ..FrameData::default()
            },
        };
        self.frames.push(frame);
        index
    }

    /// Adds a frame for the bytecode pc the runtime left in the registers.
    fn push_dex_frame(&mut self, regs: &Regs) {
        let dex_pc = regs.dex_pc();
        let mut frame = FrameData {
            index: self.frames.len(),
            pc: dex_pc,
            rel_pc: dex_pc,
            sp: regs.sp(),
            ..FrameData::default()
        };

        let lookup_pc = regs.arch().strip_address_tag(dex_pc);
        match self.maps.find(lookup_pc) {
            Some(map_info) => {
                frame.rel_pc = lookup_pc - map_info.start();
                frame.map_info = Some(map_info.clone());
                if self.options.resolve_names {
                    if let Some((name, offset)) = self
                        .dex_files
                        .as_ref()
                        .and_then(|dex_files| dex_files.function_name(&self.maps, lookup_pc))
                    {
                        frame.function_name = name;
                        frame.function_offset = offset;
                    }
                }
            }
            None => self.warnings |= Warnings::DEX_PC_NOT_IN_MAP,
        }
        self.frames.push(frame);
    }
}
