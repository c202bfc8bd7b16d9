//! Creates the object behind each map, once.
//!
//! Objects come from the file a map names when that file can be opened,
//! and from process memory otherwise. A map whose object cannot be built
//! still gets an invalid [`Elf`], so the work is never repeated.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use memmap2::MmapMut;

use crate::arcdata::{ArcData, ObjectBytes};
use crate::arch::Arch;
use crate::elf::Elf;
use crate::maps::{MapFlags, MapInfo};
use crate::memory::{Memory, MemoryFileAtOffset, MemoryRange, MemoryRanges, MAX_COPY_SIZE};
use crate::object::UnwindObject;

/// `(path, file offset of the object, size of the view)`.
type FileKey = (String, u64, u64);

pub struct ObjectCache {
    arch: Arch,
    files: Mutex<HashMap<FileKey, Arc<dyn UnwindObject>>>,
}

impl ObjectCache {
    /// Objects whose architecture differs from `arch` are created invalid.
    /// [`Arch::Unknown`] accepts any architecture.
    pub fn new(arch: Arch) -> Self {
        Self {
            arch,
            files: Mutex::new(HashMap::new()),
        }
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// The object for `map`, created on first request. Concurrent callers
    /// for the same map observe the same object.
    pub fn get(&self, map: &MapInfo, process_memory: &Arc<dyn Memory>) -> Arc<dyn UnwindObject> {
        let object = map.get_or_init_object(|| self.create(map, process_memory));
        if !object.valid() {
            map.set_object_start_offset(map.offset());
            return object;
        }

        // A read-only map in front of an executable map of the same file is
        // the start of the same object.
        if let Some(prev) = map.prev_real_map() {
            if prev.flags() == MapFlags::READ && prev.offset() < map.offset() {
                let start_offset = map.object_start_offset();
                if prev.object().is_none() {
                    prev.set_memory_backed_object(map.memory_backed_object());
                    prev.set_object_start_offset(start_offset);
                    prev.set_object_offset(prev.offset().wrapping_sub(start_offset));
                    prev.set_object(object.clone());
                }
            }
        }
        object
    }

    fn create(&self, map: &MapInfo, process_memory: &Arc<dyn Memory>) -> Arc<dyn UnwindObject> {
        map.set_object_offset(0);
        if map.end() <= map.start() || map.is_device_map() {
            return Arc::new(Elf::invalid(ArcData::from_vec(Vec::new())));
        }

        if !map.name().is_empty() {
            if let Some(object) = self.file_object(map) {
                return object;
            }
            map.set_object_offset(0);
            map.set_object_start_offset(0);
        }

        map.set_memory_backed_object(true);
        let data = process_view(map, process_memory)
            .unwrap_or_else(|| ArcData::from_vec(Vec::new()));
        log::trace!("Reading {:?} from process memory", map);
        Arc::new(Elf::new(data).check_arch(self.arch))
    }

    /// The object read from the file `map` names. `None` if the file cannot
    /// be opened or its build-id does not match the map's.
    fn file_object(&self, map: &MapInfo) -> Option<Arc<dyn UnwindObject>> {
        let view = file_view(map)?;
        let key = (
            map.name().to_string(),
            map.object_start_offset(),
            view.len(),
        );
        if let Some(object) = self.files.lock().get(&key) {
            return Some(object.clone());
        }

        let elf = Elf::new(view.data().clone());
        if let Some(expected) = map.expected_build_id() {
            if elf.build_id() != Some(expected) {
                log::debug!(
                    "Build-id of {} does not match the map, reading process memory instead",
                    map.name()
                );
                return None;
            }
        }
        let object: Arc<dyn UnwindObject> = Arc::new(elf.check_arch(self.arch));
        Some(self.files.lock().entry(key).or_insert(object).clone())
    }
}

/// Maps the part of the file that holds the object for `map`, setting the
/// map's object offsets to match.
fn file_view(map: &MapInfo) -> Option<MemoryFileAtOffset> {
    let name = map.name();
    if map.offset() == 0 {
        return MemoryFileAtOffset::open(name, 0, None).ok();
    }

    // An object embedded at the map's offset, as in an uncompressed library
    // inside an APK.
    let map_size = map.end() - map.start();
    let memory = MemoryFileAtOffset::open(name, map.offset(), Some(map_size)).ok()?;
    if let Some(info) = Elf::info(&memory) {
        map.set_object_start_offset(map.offset());
        if info.size > map_size {
            if let Ok(larger) = MemoryFileAtOffset::open(name, map.offset(), Some(info.size)) {
                return Some(larger);
            }
        }
        return Some(memory);
    }

    // The whole file is the object and the map covers part of it.
    if let Ok(whole) = MemoryFileAtOffset::open(name, 0, None) {
        if Elf::is_valid_elf(&whole) {
            map.set_object_offset(map.offset());
            return Some(whole);
        }
    }

    // The object starts at the preceding read-only map of the same file.
    if let Some(prev) = map.prev_real_map() {
        if prev.flags() == MapFlags::READ && prev.offset() < map.offset() {
            let span = map.end().saturating_sub(prev.end());
            let head = MemoryFileAtOffset::open(name, prev.offset(), Some(span)).ok();
            let info = head.as_ref().and_then(|head| Elf::info(head));
            if let Some(info) = info.filter(|info| info.size >= span) {
                if let Ok(view) = MemoryFileAtOffset::open(name, prev.offset(), Some(info.size)) {
                    map.set_object_offset(map.offset() - prev.offset());
                    map.set_object_start_offset(prev.offset());
                    return Some(view);
                }
            }
        }
    }

    Some(memory)
}

/// Copies the object for `map` out of process memory. The read-only and
/// executable maps of one object are stitched back together.
fn process_view(map: &MapInfo, process_memory: &Arc<dyn Memory>) -> Option<ArcData> {
    let size = map.end() - map.start();
    let mut ranges = MemoryRanges::new();
    let mut segments = Vec::new();
    let head = MemoryRange::new(process_memory.clone(), map.start(), size, 0);

    if Elf::is_valid_elf(&head) {
        map.set_object_start_offset(map.offset());
        ranges.insert(head);
        segments.push((0, size));
        if map.offset() == 0 {
            if let Some(next) = map.next_real_map().filter(|next| next.offset() > map.offset()) {
                let next_size = next.end() - next.start();
                let offset = next.offset() - map.offset();
                if ranges.insert(MemoryRange::new(
                    process_memory.clone(),
                    next.start(),
                    next_size,
                    offset,
                )) {
                    segments.push((offset, next_size));
                }
            }
        }
        return copy_segments(&ranges, &segments);
    }

    let prev = map.prev_real_map()?;
    if map.offset() == 0 || prev.offset() >= map.offset() || prev.flags() != MapFlags::READ {
        return None;
    }
    let object_offset = map.offset() - prev.offset();
    map.set_object_offset(object_offset);
    map.set_object_start_offset(prev.offset());
    let prev_size = prev.end() - prev.start();
    ranges.insert(MemoryRange::new(
        process_memory.clone(),
        prev.start(),
        prev_size,
        0,
    ));
    segments.push((0, prev_size));
    if ranges.insert(MemoryRange::new(
        process_memory.clone(),
        map.start(),
        size,
        object_offset,
    )) {
        segments.push((object_offset, size));
    }
    copy_segments(&ranges, &segments)
}

/// Assembles the object from `segments` (`(object offset, len)` pairs read
/// through `ranges`) in an anonymous mapping. Gaps between segments are
/// never touched, so they take no memory.
fn copy_segments(ranges: &MemoryRanges, segments: &[(u64, u64)]) -> Option<ArcData> {
    let mut total = 0u64;
    for &(offset, len) in segments {
        total = total.max(offset.checked_add(len)?);
    }
    if total > MAX_COPY_SIZE {
        log::debug!("Refusing to copy a {total} byte object out of process memory");
        return None;
    }
    let mut buffer = MmapMut::map_anon(usize::try_from(total).ok()?).ok()?;
    for &(offset, len) in segments {
        let start = usize::try_from(offset).ok()?;
        let end = usize::try_from(offset + len).ok()?;
        ranges.read(offset, buffer.get_mut(start..end)?);
    }
    let mmap = buffer.make_read_only().ok()?;
    Some(ArcData::new(ObjectBytes::Mapped(mmap)))
}
