//! Just enough of the DEX format to map a dex pc to a method name.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::Mutex;

use crate::arcdata::ArcData;
use crate::maps::Maps;
use crate::memory::{read_to_vec, Memory, MemoryFileAtOffset};
use crate::object::Symfile;

const HEADER_SIZE: u64 = 0x70;
const ENDIAN_CONSTANT: u32 = 0x1234_5678;
/// `registers_size`, `ins_size`, `outs_size`, `tries_size`, `debug_info_off`
/// and `insns_size` precede the instructions.
const CODE_ITEM_INSNS_OFFSET: u64 = 16;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DexError {
    #[error("Not a DEX file")]
    BadMagic,

    #[error("Unsupported DEX byte order")]
    BadEndian,

    #[error("DEX data truncated at offset 0x{0:x}")]
    Truncated(u64),

    #[error("Could not open the DEX file: {0}")]
    Io(String),

    #[error("A {0} byte DEX image is too large to copy")]
    TooLarge(u64),
}

#[derive(Debug, Clone, Copy)]
struct Table {
    size: u32,
    offset: u32,
}

/// Parsed tables of one DEX image. Method ranges are indexed on first use.
struct DexContents {
    data: ArcData,
    string_ids: Table,
    type_ids: Table,
    method_ids: Table,
    class_defs: Table,
    /// Keyed by the end of each method's instructions, with the start and
    /// the method index. Offsets are from the start of the file.
    methods: OnceLock<BTreeMap<u64, (u64, u32)>>,
}

/// A DEX image at `base` in the target process.
pub struct DexFile {
    base: u64,
    contents: Arc<DexContents>,
}

type CacheKey = (String, u64, u64);

fn file_cache() -> &'static Mutex<HashMap<CacheKey, Weak<DexContents>>> {
    static CACHE: OnceLock<Mutex<HashMap<CacheKey, Weak<DexContents>>>> = OnceLock::new();
    CACHE.get_or_init(Default::default)
}

impl DexFile {
    /// Parses a DEX image held in `data`, which the process maps at `base`.
    pub fn parse(data: ArcData, base: u64) -> Result<Self, DexError> {
        Ok(Self {
            base,
            contents: Arc::new(DexContents::parse(data)?),
        })
    }

    /// Loads the DEX image at `[addr, addr + size)`. When the bytes come
    /// from a file-backed map the file itself is mapped and shared with
    /// other loads of the same range.
    pub fn create(maps: &Maps, memory: &dyn Memory, addr: u64, size: u64) -> Result<Self, DexError> {
        if let Some(map) = maps.find(addr) {
            let in_map = addr.checked_add(size).is_some_and(|end| end <= map.end());
            if in_map && !map.name().is_empty() && !map.is_device_map() {
                let offset = addr - map.start() + map.offset();
                match Self::from_file(map.name(), offset, size) {
                    Ok(contents) => {
                        return Ok(Self {
                            base: addr,
                            contents,
                        })
                    }
                    Err(e) => log::debug!("Falling back to process memory: {e}"),
                }
            }
        }
        let bytes = read_to_vec(memory, addr, size).ok_or(DexError::TooLarge(size))?;
        if bytes.len() as u64 != size {
            return Err(DexError::Truncated(bytes.len() as u64));
        }
        Self::parse(ArcData::from_vec(bytes), addr)
    }

    fn from_file(path: &str, offset: u64, size: u64) -> Result<Arc<DexContents>, DexError> {
        let key = (path.to_string(), offset, size);
        let mut cache = file_cache().lock();
        if let Some(contents) = cache.get(&key).and_then(Weak::upgrade) {
            return Ok(contents);
        }
        let file = MemoryFileAtOffset::open(path, offset, Some(size))
            .map_err(|e| DexError::Io(e.to_string()))?;
        if file.len() != size {
            return Err(DexError::Truncated(file.len()));
        }
        let contents = Arc::new(DexContents::parse(file.data().clone())?);
        cache.retain(|_, weak| weak.strong_count() > 0);
        cache.insert(key, Arc::downgrade(&contents));
        Ok(contents)
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn size(&self) -> u64 {
        self.contents.data.len() as u64
    }

    /// The method whose instructions contain `dex_pc`, rendered as
    /// `package.Class.method`, and the byte offset into the instructions.
    pub fn method_name(&self, dex_pc: u64) -> Option<(String, u64)> {
        let offset = dex_pc.checked_sub(self.base)?;
        let (_, &(start, method_idx)) = self
            .contents
            .methods()
            .range((Bound::Excluded(offset), Bound::Unbounded))
            .next()?;
        if offset < start {
            return None;
        }
        Some((self.contents.pretty_method(method_idx)?, offset - start))
    }
}

impl Symfile for DexFile {
    fn load(maps: &Maps, memory: &dyn Memory, addr: u64, size: u64) -> Option<Self> {
        match Self::create(maps, memory, addr, size) {
            Ok(dex) => Some(dex),
            Err(e) => {
                log::debug!("Could not load DEX at 0x{addr:x}: {e}");
                None
            }
        }
    }

    fn contains_pc(&self, pc: u64) -> bool {
        pc >= self.base && pc - self.base < self.size()
    }

    fn symbolize(&self, pc: u64) -> Option<(String, u64)> {
        self.method_name(pc)
    }
}

impl DexContents {
    fn parse(data: ArcData) -> Result<Self, DexError> {
        let bytes: &[u8] = &data;
        let magic = bytes.get(..8).ok_or(DexError::Truncated(0))?;
        if &magic[..4] != b"dex\n" || !magic[4..7].iter().all(u8::is_ascii_digit) || magic[7] != 0
        {
            return Err(DexError::BadMagic);
        }
        if (bytes.len() as u64) < HEADER_SIZE {
            return Err(DexError::Truncated(bytes.len() as u64));
        }
        if read_u32(bytes, 0x28)? != ENDIAN_CONSTANT {
            return Err(DexError::BadEndian);
        }
        let table = |at: u64| -> Result<Table, DexError> {
            Ok(Table {
                size: read_u32(bytes, at)?,
                offset: read_u32(bytes, at + 4)?,
            })
        };
        let string_ids = table(0x38)?;
        let type_ids = table(0x40)?;
        let method_ids = table(0x58)?;
        let class_defs = table(0x60)?;
        Ok(Self {
            data,
            string_ids,
            type_ids,
            method_ids,
            class_defs,
            methods: OnceLock::new(),
        })
    }

    fn methods(&self) -> &BTreeMap<u64, (u64, u32)> {
        self.methods.get_or_init(|| {
            let mut methods = BTreeMap::new();
            for class in 0..self.class_defs.size {
                let class_def = u64::from(self.class_defs.offset) + u64::from(class) * 32;
                let Ok(class_data_off) = read_u32(&self.data, class_def + 24) else {
                    break;
                };
                if class_data_off == 0 {
                    continue;
                }
                if let Err(e) = self.index_class_data(u64::from(class_data_off), &mut methods) {
                    log::debug!("Skipping malformed class data: {e}");
                }
            }
            methods
        })
    }

    fn index_class_data(
        &self,
        offset: u64,
        methods: &mut BTreeMap<u64, (u64, u32)>,
    ) -> Result<(), DexError> {
        let mut reader = Uleb128Reader {
            data: &self.data,
            pos: offset,
        };
        let static_fields = reader.next()?;
        let instance_fields = reader.next()?;
        let direct_methods = reader.next()?;
        let virtual_methods = reader.next()?;
        for _ in 0..(static_fields + instance_fields) {
            reader.next()?;
            reader.next()?;
        }
        for count in [direct_methods, virtual_methods] {
            // Method indices are delta-encoded within each list.
            let mut method_idx = 0u32;
            for _ in 0..count {
                method_idx = method_idx.wrapping_add(reader.next()? as u32);
                let _access_flags = reader.next()?;
                let code_off = reader.next()?;
                if code_off == 0 {
                    continue;
                }
                let insns_size = read_u32(&self.data, code_off + 12)?;
                let start = code_off + CODE_ITEM_INSNS_OFFSET;
                let end = start + u64::from(insns_size) * 2;
                if end > start {
                    methods.insert(end, (start, method_idx));
                }
            }
        }
        Ok(())
    }

    fn string(&self, idx: u32) -> Option<String> {
        if idx >= self.string_ids.size {
            return None;
        }
        let id = u64::from(self.string_ids.offset) + u64::from(idx) * 4;
        let data_off = read_u32(&self.data, id).ok()?;
        let mut reader = Uleb128Reader {
            data: &self.data,
            pos: u64::from(data_off),
        };
        let _utf16_len = reader.next().ok()?;
        let bytes = self.data.get(usize::try_from(reader.pos).ok()?..)?;
        let len = bytes.iter().position(|&b| b == 0)?;
        Some(String::from_utf8_lossy(&bytes[..len]).into_owned())
    }

    fn type_descriptor(&self, idx: u32) -> Option<String> {
        if idx >= self.type_ids.size {
            return None;
        }
        let id = u64::from(self.type_ids.offset) + u64::from(idx) * 4;
        self.string(read_u32(&self.data, id).ok()?)
    }

    fn pretty_method(&self, method_idx: u32) -> Option<String> {
        if method_idx >= self.method_ids.size {
            return None;
        }
        let id = u64::from(self.method_ids.offset) + u64::from(method_idx) * 8;
        let class_idx = read_u16(&self.data, id).ok()?;
        let name_idx = read_u32(&self.data, id + 4).ok()?;
        let class = pretty_descriptor(&self.type_descriptor(u32::from(class_idx))?);
        let name = self.string(name_idx)?;
        Some(format!("{class}.{name}"))
    }
}

/// Converts a type descriptor such as `Ljava/lang/String;` or `[I` to its
/// source form.
pub fn pretty_descriptor(descriptor: &str) -> String {
    let dims = descriptor.bytes().take_while(|&b| b == b'[').count();
    let element = &descriptor[dims..];
    let mut pretty = match element {
        "B" => "byte".to_string(),
        "C" => "char".to_string(),
        "D" => "double".to_string(),
        "F" => "float".to_string(),
        "I" => "int".to_string(),
        "J" => "long".to_string(),
        "S" => "short".to_string(),
        "Z" => "boolean".to_string(),
        "V" => "void".to_string(),
        _ => element
            .strip_prefix('L')
            .and_then(|name| name.strip_suffix(';'))
            .unwrap_or(element)
            .replace('/', "."),
    };
    for _ in 0..dims {
        pretty.push_str("[]");
    }
    pretty
}

fn read_u16(data: &[u8], offset: u64) -> Result<u16, DexError> {
    let start = usize::try_from(offset).map_err(|_| DexError::Truncated(offset))?;
    let bytes = data
        .get(start..start + 2)
        .ok_or(DexError::Truncated(offset))?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

fn read_u32(data: &[u8], offset: u64) -> Result<u32, DexError> {
    let start = usize::try_from(offset).map_err(|_| DexError::Truncated(offset))?;
    let bytes = data
        .get(start..start + 4)
        .ok_or(DexError::Truncated(offset))?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

struct Uleb128Reader<'a> {
    data: &'a [u8],
    pos: u64,
}

impl Uleb128Reader<'_> {
    fn next(&mut self) -> Result<u64, DexError> {
        let mut value = 0u64;
        // DEX limits uleb128 values to five bytes.
        for shift in (0..35).step_by(7) {
            let byte = usize::try_from(self.pos)
                .ok()
                .and_then(|pos| self.data.get(pos))
                .copied()
                .ok_or(DexError::Truncated(self.pos))?;
            self.pos += 1;
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(DexError::Truncated(self.pos))
    }
}
