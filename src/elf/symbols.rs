use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::OnceLock;

use object::elf;
use object::read::elf::Sym;
use object::Endianness;

use crate::arcdata::ArcData;

struct RawSymbol {
    name: u32,
    value: u64,
    size: u64,
    kind: u8,
    shndx: u16,
}

/// One `SHT_SYMTAB` or `SHT_DYNSYM` table and its string table. The
/// function lookup map is built on the first query.
pub struct Symbols {
    entries: ArcData,
    strings: ArcData,
    is_64: bool,
    endian: Endianness,
    /// Clear the Thumb bit of ARM function addresses.
    mask_thumb_bit: bool,
    /// Function symbols keyed by end address, with `(start, name)`.
    functions: OnceLock<BTreeMap<u64, (u64, String)>>,
}

impl Symbols {
    pub fn new(
        entries: ArcData,
        strings: ArcData,
        is_64: bool,
        endian: Endianness,
        mask_thumb_bit: bool,
    ) -> Self {
        Self {
            entries,
            strings,
            is_64,
            endian,
            mask_thumb_bit,
            functions: OnceLock::new(),
        }
    }

    fn for_each(&self, f: impl FnMut(RawSymbol)) {
        if self.is_64 {
            read_symbols::<elf::Sym64<Endianness>>(&self.entries, self.endian, f)
        } else {
            read_symbols::<elf::Sym32<Endianness>>(&self.entries, self.endian, f)
        }
    }

    fn name(&self, offset: u32) -> Option<&str> {
        let bytes = self.strings.get(offset as usize..)?;
        let len = bytes.iter().position(|&b| b == 0)?;
        std::str::from_utf8(&bytes[..len]).ok()
    }

    fn functions(&self) -> &BTreeMap<u64, (u64, String)> {
        self.functions.get_or_init(|| {
            let mut functions = BTreeMap::new();
            self.for_each(|sym| {
                if sym.kind != elf::STT_FUNC || sym.shndx == elf::SHN_UNDEF || sym.size == 0 {
                    return;
                }
                let start = if self.mask_thumb_bit {
                    sym.value & !1
                } else {
                    sym.value
                };
                if let Some(name) = self.name(sym.name) {
                    functions
                        .entry(start.wrapping_add(sym.size))
                        .or_insert_with(|| (start, name.to_string()));
                }
            });
            functions
        })
    }

    /// The function containing `addr` and the offset of `addr` into it.
    pub fn function_name(&self, addr: u64) -> Option<(String, u64)> {
        let (_, (start, name)) = self
            .functions()
            .range((Bound::Excluded(addr), Bound::Unbounded))
            .next()?;
        (*start <= addr).then(|| (name.clone(), addr - start))
    }

    /// The vaddr of the data object called `name`.
    pub fn global_variable(&self, name: &str) -> Option<u64> {
        let mut found = None;
        self.for_each(|sym| {
            if found.is_none()
                && sym.kind == elf::STT_OBJECT
                && sym.shndx != elf::SHN_UNDEF
                && self.name(sym.name) == Some(name)
            {
                found = Some(sym.value);
            }
        });
        found
    }
}

fn read_symbols<S: Sym<Endian = Endianness>>(
    data: &[u8],
    endian: Endianness,
    mut f: impl FnMut(RawSymbol),
) {
    let count = data.len() / std::mem::size_of::<S>();
    let Ok((symbols, _)) = object::pod::slice_from_bytes::<S>(data, count) else {
        return;
    };
    for sym in symbols {
        f(RawSymbol {
            name: sym.st_name(endian),
            value: sym.st_value(endian).into(),
            size: sym.st_size(endian).into(),
            kind: sym.st_type(),
            shndx: sym.st_shndx(endian),
        });
    }
}
