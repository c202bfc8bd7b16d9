//! The address-space layout of a process: one [`MapInfo`] per mapping,
//! sorted by start address.

use std::fmt::Debug;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::display_utils::HexNum;
use crate::object::UnwindObject;

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MapFlags: u16 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// A map synthesized for a JIT symfile that is not in the map list.
        const JIT_SYMFILE = 1 << 14;
        /// Device memory; never read.
        const DEVICE = 1 << 15;
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum MapsError {
    #[error("Could not read the maps file: {0}")]
    Io(String),

    #[error("Malformed maps line {line}: {reason}")]
    Malformed { line: usize, reason: &'static str },

    #[error("Map on line {0} has an empty or inverted address range")]
    EmptyRange(usize),
}

const LOAD_BIAS_UNSET: i64 = i64::MAX;

/// One mapping. The address range, offset, flags and name never change once
/// created. The object and the values derived from it are filled in lazily
/// exactly once, by [`crate::ObjectCache`].
pub struct MapInfo {
    start: u64,
    end: u64,
    offset: u64,
    flags: MapFlags,
    name: String,
    build_id: Option<Vec<u8>>,

    load_bias: AtomicI64,
    object_offset: AtomicU64,
    object_start_offset: AtomicU64,
    memory_backed_object: AtomicBool,
    object: OnceLock<Arc<dyn UnwindObject>>,

    prev: Mutex<Weak<MapInfo>>,
    next: Mutex<Weak<MapInfo>>,
}

impl MapInfo {
    pub fn new(start: u64, end: u64, offset: u64, flags: MapFlags, name: impl Into<String>) -> Self {
        Self {
            start,
            end,
            offset,
            flags,
            name: name.into(),
            build_id: None,
            load_bias: AtomicI64::new(LOAD_BIAS_UNSET),
            object_offset: AtomicU64::new(0),
            object_start_offset: AtomicU64::new(0),
            memory_backed_object: AtomicBool::new(false),
            object: OnceLock::new(),
            prev: Mutex::new(Weak::new()),
            next: Mutex::new(Weak::new()),
        }
    }

    /// Records the build-id the file backing this map is expected to have.
    /// A file on disk with a different build-id is not used.
    pub fn with_build_id(mut self, build_id: Vec<u8>) -> Self {
        self.build_id = Some(build_id);
        self
    }

    #[inline(always)]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[inline(always)]
    pub fn end(&self) -> u64 {
        self.end
    }

    #[inline(always)]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline(always)]
    pub fn flags(&self) -> MapFlags {
        self.flags
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expected_build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }

    #[inline(always)]
    pub fn contains(&self, addr: u64) -> bool {
        self.start <= addr && addr < self.end
    }

    pub fn is_device_map(&self) -> bool {
        self.flags.contains(MapFlags::DEVICE)
    }

    /// A spacer left by the linker between the segments of one object.
    pub fn is_blank(&self) -> bool {
        self.offset == 0 && self.flags.is_empty() && self.name.is_empty()
    }

    /// The offset into the object file at which this map's object begins.
    /// Non-zero for a library embedded in an archive, such as an APK.
    pub fn object_start_offset(&self) -> u64 {
        self.object_start_offset.load(Ordering::Acquire)
    }

    pub fn set_object_start_offset(&self, offset: u64) {
        self.object_start_offset.store(offset, Ordering::Release);
    }

    /// The distance between the start of the object and the start of this
    /// map, when the map does not begin at the object's first byte.
    pub fn object_offset(&self) -> u64 {
        self.object_offset.load(Ordering::Acquire)
    }

    pub fn set_object_offset(&self, offset: u64) {
        self.object_offset.store(offset, Ordering::Release);
    }

    pub fn memory_backed_object(&self) -> bool {
        self.memory_backed_object.load(Ordering::Acquire)
    }

    pub fn set_memory_backed_object(&self, value: bool) {
        self.memory_backed_object.store(value, Ordering::Release);
    }

    /// The object's load bias, once known. Before the object has been
    /// created this is 0 and nothing is cached.
    pub fn load_bias(&self) -> i64 {
        let cached = self.load_bias.load(Ordering::Acquire);
        if cached != LOAD_BIAS_UNSET {
            return cached;
        }
        match self.object.get() {
            Some(object) => {
                let load_bias = if object.valid() { object.load_bias() } else { 0 };
                self.load_bias.store(load_bias, Ordering::Release);
                load_bias
            }
            None => 0,
        }
    }

    pub fn set_load_bias(&self, load_bias: i64) {
        self.load_bias.store(load_bias, Ordering::Release);
    }

    /// The pc in the object's address space.
    pub fn rel_pc(&self, pc: u64) -> u64 {
        pc.wrapping_sub(self.start)
            .wrapping_add(self.load_bias() as u64)
            .wrapping_add(self.object_offset())
    }

    pub fn object(&self) -> Option<&Arc<dyn UnwindObject>> {
        self.object.get()
    }

    /// Installs `object` unless one is already present. Returns the object
    /// that ends up installed.
    pub fn set_object(&self, object: Arc<dyn UnwindObject>) -> Arc<dyn UnwindObject> {
        self.object.get_or_init(|| object).clone()
    }

    /// Returns the installed object, running `create` to make it if there is
    /// none yet. Concurrent callers all observe the same object.
    pub fn get_or_init_object(
        &self,
        create: impl FnOnce() -> Arc<dyn UnwindObject>,
    ) -> Arc<dyn UnwindObject> {
        self.object.get_or_init(create).clone()
    }

    /// The name to show for this map. For an object embedded at a non-zero
    /// offset of a container this is `container!soname`.
    pub fn full_name(&self) -> String {
        if self.object_start_offset() != 0 {
            if let Some(soname) = self.object().and_then(|object| object.soname()) {
                if !soname.is_empty() {
                    return format!("{}!{}", self.name, soname);
                }
            }
        }
        self.name.clone()
    }

    /// The object's build-id once the object has been created, otherwise
    /// the expected build-id.
    pub fn build_id(&self) -> Option<Vec<u8>> {
        self.object()
            .and_then(|object| object.build_id().map(|id| id.to_vec()))
            .or_else(|| self.build_id.clone())
    }

    pub fn prev_map(&self) -> Option<Arc<MapInfo>> {
        self.prev.lock().upgrade()
    }

    pub fn next_map(&self) -> Option<Arc<MapInfo>> {
        self.next.lock().upgrade()
    }

    /// The previous map of the same file, looking past at most one blank
    /// spacer map.
    pub fn prev_real_map(&self) -> Option<Arc<MapInfo>> {
        if self.name.is_empty() {
            return None;
        }
        let mut prev = self.prev_map()?;
        if prev.is_blank() {
            prev = prev.prev_map()?;
        }
        (!prev.is_blank() && prev.name == self.name).then_some(prev)
    }

    /// The next map of the same file, looking past at most one blank spacer
    /// map.
    pub fn next_real_map(&self) -> Option<Arc<MapInfo>> {
        if self.name.is_empty() {
            return None;
        }
        let mut next = self.next_map()?;
        if next.is_blank() {
            next = next.next_map()?;
        }
        (!next.is_blank() && next.name == self.name).then_some(next)
    }
}

impl Debug for MapInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapInfo")
            .field("start", &HexNum(self.start))
            .field("end", &HexNum(self.end))
            .field("offset", &HexNum(self.offset))
            .field("flags", &self.flags)
            .field("name", &self.name)
            .field("object_start_offset", &HexNum(self.object_start_offset()))
            .finish()
    }
}

/// All maps of a process, sorted by start address.
#[derive(Default)]
pub struct Maps {
    maps: Vec<Arc<MapInfo>>,
}

impl Maps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a map. Maps must be added in address order, or [`Maps::sort`]
    /// called afterwards.
    pub fn add(&mut self, map: MapInfo) -> Arc<MapInfo> {
        let map = Arc::new(map);
        if let Some(last) = self.maps.last() {
            *last.next.lock() = Arc::downgrade(&map);
            *map.prev.lock() = Arc::downgrade(last);
        }
        self.maps.push(map.clone());
        map
    }

    /// Sorts by start address and rebuilds the prev/next links.
    pub fn sort(&mut self) {
        self.maps.sort_by_key(|map| map.start);
        for map in &self.maps {
            *map.prev.lock() = Weak::new();
            *map.next.lock() = Weak::new();
        }
        for pair in self.maps.windows(2) {
            *pair[0].next.lock() = Arc::downgrade(&pair[1]);
            *pair[1].prev.lock() = Arc::downgrade(&pair[0]);
        }
    }

    /// The map containing `addr`. A map covers `[start, end)`.
    pub fn find(&self, addr: u64) -> Option<&Arc<MapInfo>> {
        let index = match self.maps.binary_search_by_key(&addr, |map| map.start) {
            Ok(i) => i,
            Err(0) => return None,
            Err(i) => i - 1,
        };
        let map = &self.maps[index];
        map.contains(addr).then_some(map)
    }

    pub fn get(&self, index: usize) -> Option<&Arc<MapInfo>> {
        self.maps.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<MapInfo>> {
        self.maps.iter()
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Parses `/proc/<pid>/maps` text.
    pub fn parse(text: &str) -> Result<Maps, MapsError> {
        let mut maps = Maps::new();
        for (index, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            maps.add(parse_line(line, index + 1)?);
        }
        maps.sort();
        Ok(maps)
    }

    pub fn parse_file(path: impl AsRef<Path>) -> Result<Maps, MapsError> {
        let text = std::fs::read_to_string(path).map_err(|e| MapsError::Io(e.to_string()))?;
        Self::parse(&text)
    }

    pub fn parse_pid(pid: libc::pid_t) -> Result<Maps, MapsError> {
        Self::parse_file(format!("/proc/{pid}/maps"))
    }
}

impl<'a> IntoIterator for &'a Maps {
    type Item = &'a Arc<MapInfo>;
    type IntoIter = std::slice::Iter<'a, Arc<MapInfo>>;

    fn into_iter(self) -> Self::IntoIter {
        self.maps.iter()
    }
}

fn get_until<'a>(p: &mut &'a str, delimiter: char) -> &'a str {
    match p.find(delimiter) {
        Some(index) => {
            let (before, after) = p.split_at(index);
            *p = &after[delimiter.len_utf8()..];
            before
        }
        None => {
            let before = *p;
            *p = "";
            before
        }
    }
}

fn get_char(p: &mut &str) -> Option<char> {
    let ch = p.chars().next()?;
    *p = &p[ch.len_utf8()..];
    Some(ch)
}

fn skip_whitespace(p: &mut &str) {
    *p = p.trim_start_matches(&[' ', '\t'][..]);
}

fn parse_hex(s: &str, line: usize, reason: &'static str) -> Result<u64, MapsError> {
    u64::from_str_radix(s, 16).map_err(|_| MapsError::Malformed { line, reason })
}

fn parse_line(mut line: &str, line_number: usize) -> Result<MapInfo, MapsError> {
    let malformed = |reason| MapsError::Malformed {
        line: line_number,
        reason,
    };
    let start = parse_hex(get_until(&mut line, '-'), line_number, "bad start address")?;
    let end = parse_hex(get_until(&mut line, ' '), line_number, "bad end address")?;
    if end <= start {
        return Err(MapsError::EmptyRange(line_number));
    }

    let mut flags = MapFlags::empty();
    for (bit, expected) in [(MapFlags::READ, 'r'), (MapFlags::WRITE, 'w'), (MapFlags::EXEC, 'x')] {
        match get_char(&mut line) {
            Some(ch) if ch == expected => flags |= bit,
            Some('-') => {}
            _ => return Err(malformed("bad permissions")),
        }
    }
    // Shared/private marker.
    get_char(&mut line).ok_or_else(|| malformed("truncated permissions"))?;
    skip_whitespace(&mut line);

    let offset = parse_hex(get_until(&mut line, ' '), line_number, "bad offset")?;
    skip_whitespace(&mut line);
    let device = get_until(&mut line, ' ');
    if !device.contains(':') {
        return Err(malformed("bad device"));
    }
    skip_whitespace(&mut line);
    let inode = get_until(&mut line, ' ');
    if inode.parse::<u64>().is_err() {
        return Err(malformed("bad inode"));
    }
    skip_whitespace(&mut line);
    let name = line.trim_end();

    if name.starts_with("/dev/") && !name.starts_with("/dev/ashmem/") {
        flags |= MapFlags::DEVICE;
    }
    Ok(MapInfo::new(start, end, offset, flags, name))
}

#[cfg(test)]
mod test {
    use super::*;

    const MAPS: &str = r#"
00400000-0040c000 r-xp 00000000 08:02 1321238                            /usr/bin/cat
0060d000-0062e000 rw-p 00000000 00:00 0                                  [heap]
7ffff5600000-7ffff5800000 rw-p 00000000 00:00 0
7ffff672c000-7ffff69db000 r--s 00001ac2 1f:33 1335289                    /usr/lib/locale/locale-archive
7ffff7000000-7ffff7001000 rw-s 00000000 00:05 33                         /dev/kgsl-3d0
7ffff7001000-7ffff7002000 rw-s 00000000 00:05 34                         /dev/ashmem/dalvik-heap (deleted)
"#;

    #[test]
    fn parse_lines() {
        let maps = Maps::parse(MAPS).unwrap();
        assert_eq!(maps.len(), 6);
        let cat = maps.get(0).unwrap();
        assert_eq!(cat.start(), 0x400000);
        assert_eq!(cat.end(), 0x40c000);
        assert_eq!(cat.flags(), MapFlags::READ | MapFlags::EXEC);
        assert_eq!(cat.name(), "/usr/bin/cat");

        let anon = maps.get(2).unwrap();
        assert_eq!(anon.name(), "");
        assert_eq!(anon.flags(), MapFlags::READ | MapFlags::WRITE);

        let locale = maps.get(3).unwrap();
        assert_eq!(locale.offset(), 0x1ac2);

        assert!(maps.get(4).unwrap().is_device_map());
        let ashmem = maps.get(5).unwrap();
        assert!(!ashmem.is_device_map());
        assert_eq!(ashmem.name(), "/dev/ashmem/dalvik-heap (deleted)");
    }

    #[test]
    fn malformed_lines_are_rejected() {
        assert_eq!(
            Maps::parse("zz-1000 r-xp 0 00:00 0 x").err(),
            Some(MapsError::Malformed {
                line: 1,
                reason: "bad start address"
            })
        );
        assert_eq!(
            Maps::parse("\n2000-1000 r-xp 0 00:00 0 x").err(),
            Some(MapsError::EmptyRange(2))
        );
        assert!(Maps::parse("1000-2000 rq-p 0 00:00 0 x").is_err());
        assert!(Maps::parse("1000-2000 r-xp 0 0000 0 x").is_err());
        assert!(Maps::parse("").unwrap().is_empty());
    }

    #[test]
    fn find_bounds() {
        let maps = Maps::parse(MAPS).unwrap();
        assert_eq!(maps.find(0x400000).unwrap().name(), "/usr/bin/cat");
        assert_eq!(maps.find(0x40bfff).unwrap().name(), "/usr/bin/cat");
        assert!(maps.find(0x40c000).is_none());
        assert!(maps.find(0x3fffff).is_none());
        assert_eq!(maps.find(0x60d000).unwrap().name(), "[heap]");
        assert!(maps.find(u64::MAX).is_none());
    }

    #[test]
    fn real_map_links() {
        let mut maps = Maps::new();
        maps.add(MapInfo::new(0x1000, 0x2000, 0, MapFlags::READ, "/lib/libfoo.so"));
        maps.add(MapInfo::new(0x2000, 0x3000, 0, MapFlags::empty(), ""));
        maps.add(MapInfo::new(
            0x3000,
            0x4000,
            0x1000,
            MapFlags::READ | MapFlags::EXEC,
            "/lib/libfoo.so",
        ));
        maps.add(MapInfo::new(0x4000, 0x5000, 0x2000, MapFlags::READ, "/lib/libbar.so"));

        let exec = maps.get(2).unwrap();
        let ro = exec.prev_real_map().unwrap();
        assert_eq!(ro.start(), 0x1000);
        assert_eq!(ro.next_real_map().unwrap().start(), 0x3000);
        assert!(exec.next_real_map().is_none());
        assert!(maps.get(1).unwrap().prev_real_map().is_none());
        assert!(maps.get(0).unwrap().prev_real_map().is_none());
    }

    #[test]
    fn sort_relinks() {
        let mut maps = Maps::new();
        maps.add(MapInfo::new(0x3000, 0x4000, 0x1000, MapFlags::EXEC, "a"));
        maps.add(MapInfo::new(0x1000, 0x2000, 0, MapFlags::READ, "a"));
        maps.sort();
        assert_eq!(maps.get(0).unwrap().start(), 0x1000);
        assert!(maps.get(0).unwrap().prev_map().is_none());
        assert_eq!(
            maps.get(1).unwrap().prev_real_map().unwrap().start(),
            0x1000
        );
    }
}
