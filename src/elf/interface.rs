use std::collections::BTreeMap;
use std::sync::OnceLock;

use object::elf;
use object::read::elf::{Dyn, FileHeader, ProgramHeader, SectionHeader};
use object::read::SectionIndex;
use object::Endianness;

use super::exidx::Exidx;
use super::symbols::Symbols;
use super::ElfError;
use crate::arcdata::ArcData;
use crate::arch::Arch;
use crate::dwarf::{CfiFormat, DwarfCfi, DwarfError, SectionAddresses};
use crate::error::StepError;
use crate::memory::Memory;
use crate::regs::Regs;

const PT_ARM_EXIDX: u32 = 0x7000_0001;
const SHT_ARM_EXIDX: u32 = 0x7000_0001;

/// An executable `PT_LOAD`: file offset, vaddr and size in memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadInfo {
    pub offset: u64,
    pub table_offset: u64,
    pub table_size: u64,
}

/// A section located by both file offset and address. `bias` is
/// `address - offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionInfo {
    pub offset: u64,
    pub size: u64,
    pub bias: i64,
}

impl SectionInfo {
    fn new(offset: u64, address: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            bias: address.wrapping_sub(offset) as i64,
        }
    }

    pub fn address(&self) -> u64 {
        self.offset.wrapping_add(self.bias as u64)
    }

    /// `[start, end)` addresses and the file offset of the start.
    fn translate(&self, vaddr: u64) -> Option<u64> {
        let start = self.address();
        (vaddr >= start && vaddr < start.wrapping_add(self.size))
            .then(|| vaddr - start + self.offset)
    }
}

/// The parsed headers of one ELF image. Queries take addresses in the
/// image's own vaddr space.
pub struct ElfInterface {
    data: ArcData,
    arch: Arch,
    is_64: bool,
    endian: Endianness,
    load_bias: i64,
    pt_loads: BTreeMap<u64, LoadInfo>,
    all_loads: Vec<SectionInfo>,
    dynamic: Option<SectionInfo>,
    eh_frame_hdr: Option<SectionInfo>,
    eh_frame: Option<SectionInfo>,
    debug_frame: Option<SectionInfo>,
    gnu_debugdata: Option<SectionInfo>,
    arm_exidx: Option<SectionInfo>,
    data_section: Option<SectionInfo>,
    section_addresses: SectionAddresses,
    symbols: Vec<Symbols>,
    soname: Option<String>,
    build_id: Option<Vec<u8>>,
    max_size: u64,

    eh_frame_cfi: OnceLock<Option<DwarfCfi>>,
    debug_frame_cfi: OnceLock<Option<DwarfCfi>>,
    exidx: OnceLock<Option<Exidx>>,
}

impl ElfInterface {
    /// Parses the headers of the ELF image at the start of `data`.
    pub fn parse(data: ArcData) -> Result<Self, ElfError> {
        let (ident, _) =
            object::pod::from_bytes::<elf::Ident>(&data).map_err(|()| ElfError::BadMagic)?;
        if ident.magic != elf::ELFMAG {
            return Err(ElfError::BadMagic);
        }
        match ident.class {
            elf::ELFCLASS32 => parse_headers::<elf::FileHeader32<Endianness>>(data),
            elf::ELFCLASS64 => parse_headers::<elf::FileHeader64<Endianness>>(data),
            class => Err(ElfError::UnsupportedClass(class)),
        }
    }

    pub fn data(&self) -> &ArcData {
        &self.data
    }

    pub fn arch(&self) -> Arch {
        self.arch
    }

    pub fn is_64(&self) -> bool {
        self.is_64
    }

    pub fn load_bias(&self) -> i64 {
        self.load_bias
    }

    pub fn pt_loads(&self) -> &BTreeMap<u64, LoadInfo> {
        &self.pt_loads
    }

    pub fn soname(&self) -> Option<&str> {
        self.soname.as_deref()
    }

    pub fn build_id(&self) -> Option<&[u8]> {
        self.build_id.as_deref()
    }

    pub fn gnu_debugdata(&self) -> Option<ArcData> {
        let info = self.gnu_debugdata?;
        self.data.slice(info.offset, info.size)
    }

    pub fn eh_frame_info(&self) -> Option<SectionInfo> {
        self.eh_frame
    }

    pub fn eh_frame_hdr_info(&self) -> Option<SectionInfo> {
        self.eh_frame_hdr
    }

    pub fn debug_frame_info(&self) -> Option<SectionInfo> {
        self.debug_frame
    }

    pub fn arm_exidx_info(&self) -> Option<SectionInfo> {
        self.arm_exidx
    }

    /// The largest file offset any header refers to.
    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    fn gimli_endian(&self) -> gimli::RunTimeEndian {
        match self.endian {
            Endianness::Little => gimli::RunTimeEndian::Little,
            Endianness::Big => gimli::RunTimeEndian::Big,
        }
    }

    fn address_size(&self) -> u8 {
        if self.is_64 {
            8
        } else {
            4
        }
    }

    /// `.eh_frame`, searched through `.eh_frame_hdr` when there is one.
    pub fn eh_frame_cfi(&self) -> Option<&DwarfCfi> {
        self.eh_frame_cfi
            .get_or_init(|| {
                let endian = self.gimli_endian();
                let address_size = self.address_size();
                let hdr = self.eh_frame_hdr.and_then(|hdr| {
                    Some((hdr, self.data.slice(hdr.offset, hdr.size)?))
                });
                let eh_frame = match self.eh_frame {
                    Some(info) => info,
                    None => {
                        // Without section headers the header still points at the frames.
                        let (hdr_info, hdr_data) = hdr.as_ref()?;
                        let address = DwarfCfi::eh_frame_address_from_hdr(
                            hdr_data,
                            endian,
                            address_size,
                            hdr_info.address(),
                        )?;
                        let offset = address.wrapping_sub(hdr_info.bias as u64);
                        let size = (self.data.len() as u64).checked_sub(offset)?;
                        SectionInfo::new(offset, address, size)
                    }
                };
                let eh_frame_data = self.data.slice(eh_frame.offset, eh_frame.size)?;
                let sections = SectionAddresses {
                    eh_frame: eh_frame.address(),
                    eh_frame_hdr: hdr.as_ref().map_or(0, |(info, _)| info.address()),
                    ..self.section_addresses
                };
                Some(match hdr {
                    Some((_, hdr_data)) => DwarfCfi::with_eh_frame_hdr(
                        eh_frame_data,
                        hdr_data,
                        endian,
                        address_size,
                        &sections,
                    ),
                    None => DwarfCfi::new(
                        CfiFormat::EhFrame,
                        eh_frame_data,
                        endian,
                        address_size,
                        &sections,
                    ),
                })
            })
            .as_ref()
    }

    pub fn debug_frame_cfi(&self) -> Option<&DwarfCfi> {
        self.debug_frame_cfi
            .get_or_init(|| {
                let info = self.debug_frame?;
                let data = self.data.slice(info.offset, info.size)?;
                Some(DwarfCfi::new(
                    CfiFormat::DebugFrame,
                    data,
                    self.gimli_endian(),
                    self.address_size(),
                    &self.section_addresses,
                ))
            })
            .as_ref()
    }

    pub fn exidx(&self) -> Option<&Exidx> {
        self.exidx
            .get_or_init(|| {
                let info = self.arm_exidx?;
                Some(Exidx::new(
                    self.data.clone(),
                    info.offset,
                    info.size,
                    info.bias as u64,
                ))
            })
            .as_ref()
    }

    /// Unwinds one frame at `pc`, trying `.ARM.exidx`, then `.eh_frame`, then
    /// `.debug_frame`. A source without an entry for `pc` passes to the next;
    /// the first real failure is reported if no source succeeds.
    pub fn step(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> Result<bool, StepError> {
        let mut first_error = None;

        if self.arch == Arch::Arm {
            if let Some(exidx) = self.exidx() {
                let mut attempt = regs.clone();
                match exidx.step(pc, &mut attempt, process_memory) {
                    Ok(finished) => {
                        *regs = attempt;
                        return Ok(finished);
                    }
                    Err(super::exidx::ExidxError::NoEntry) => {}
                    Err(e) => first_error = Some(StepError::from(e)),
                }
            }
        }

        for cfi in [self.eh_frame_cfi(), self.debug_frame_cfi()]
            .into_iter()
            .flatten()
        {
            let mut attempt = regs.clone();
            match cfi.step(pc, &mut attempt, process_memory) {
                Ok(finished) => {
                    *regs = attempt;
                    return Ok(finished);
                }
                Err(DwarfError::NoFde) => {}
                Err(e) => {
                    first_error.get_or_insert(StepError::from(e));
                }
            }
        }

        Err(first_error.unwrap_or(StepError::NoUnwindInfo))
    }

    /// True if `pc` lies in an executable segment, or, for an image without
    /// program headers, if some FDE covers it.
    pub fn is_valid_pc(&self, pc: u64) -> bool {
        if !self.pt_loads.is_empty() {
            return self
                .pt_loads
                .values()
                .any(|load| pc >= load.table_offset && pc < load.table_offset + load.table_size);
        }
        self.debug_frame_cfi().is_some_and(|cfi| cfi.is_valid_pc(pc))
            || self.eh_frame_cfi().is_some_and(|cfi| cfi.is_valid_pc(pc))
    }

    pub fn function_name(&self, addr: u64) -> Option<(String, u64)> {
        self.symbols
            .iter()
            .find_map(|symbols| symbols.function_name(addr))
    }

    /// The vaddr of the global data object called `name`.
    pub fn global_variable(&self, name: &str) -> Option<u64> {
        self.symbols
            .iter()
            .find_map(|symbols| symbols.global_variable(name))
    }

    /// Converts the vaddr of a global variable into a file offset, through
    /// the `.data` section first and then the dynamic segment.
    pub fn global_vaddr_to_offset(&self, vaddr: u64) -> Option<u64> {
        self.data_section
            .and_then(|data| data.translate(vaddr))
            .or_else(|| self.dynamic.and_then(|dynamic| dynamic.translate(vaddr)))
    }
}

fn parse_headers<Elf: FileHeader<Endian = Endianness>>(
    data: ArcData,
) -> Result<ElfInterface, ElfError> {
    let bytes: &[u8] = &data;
    let header = Elf::parse(bytes)?;
    let endian = header.endian()?;
    let is_64 = header.is_class_64();
    let arch = Arch::from_elf_machine(header.e_machine(endian), is_64);

    let mut load_bias = 0;
    let mut pt_loads = BTreeMap::new();
    let mut all_loads = Vec::new();
    let mut dynamic = None;
    let mut dynamic_entries = Vec::new();
    let mut eh_frame_hdr = None;
    let mut arm_exidx = None;
    let mut note_segments = Vec::new();
    let phoff: u64 = header.e_phoff(endian).into();
    let mut max_size =
        phoff + u64::from(header.e_phnum(endian)) * u64::from(header.e_phentsize(endian));

    for phdr in header.program_headers(endian, bytes)? {
        let offset: u64 = phdr.p_offset(endian).into();
        let vaddr: u64 = phdr.p_vaddr(endian).into();
        let filesz: u64 = phdr.p_filesz(endian).into();
        let memsz: u64 = phdr.p_memsz(endian).into();
        max_size = max_size.max(offset.saturating_add(filesz));
        match phdr.p_type(endian) {
            elf::PT_LOAD => {
                all_loads.push(SectionInfo::new(offset, vaddr, filesz));
                if phdr.p_flags(endian) & elf::PF_X == 0 {
                    continue;
                }
                if pt_loads.is_empty() {
                    load_bias = vaddr.wrapping_sub(offset) as i64;
                }
                pt_loads.insert(
                    offset,
                    LoadInfo {
                        offset,
                        table_offset: vaddr,
                        table_size: memsz,
                    },
                );
            }
            elf::PT_GNU_EH_FRAME => {
                eh_frame_hdr = Some(SectionInfo::new(offset, vaddr, memsz));
            }
            elf::PT_DYNAMIC => {
                dynamic = Some(SectionInfo::new(offset, vaddr, memsz));
                if let Ok(Some(entries)) = phdr.dynamic(endian, bytes) {
                    for entry in entries {
                        let tag: u64 = entry.d_tag(endian).into();
                        if tag == u64::from(elf::DT_NULL) {
                            break;
                        }
                        dynamic_entries.push((tag, entry.d_val(endian).into()));
                    }
                }
            }
            elf::PT_NOTE => note_segments.push((offset, filesz)),
            PT_ARM_EXIDX if arch == Arch::Arm => {
                arm_exidx = Some(SectionInfo::new(offset, vaddr, memsz));
            }
            _ => {}
        }
    }

    let mut eh_frame = None;
    let mut debug_frame = None;
    let mut gnu_debugdata = None;
    let mut data_section = None;
    let mut section_addresses = SectionAddresses::default();
    let mut symbols = Vec::new();
    let mut strtabs = Vec::new();
    let mut build_id = None;

    match header.sections(endian, bytes) {
        Ok(sections) => {
            let shnum = sections.len() as u64;
            let shentsize = u64::from(header.e_shentsize(endian));
            let shoff: u64 = header.e_shoff(endian).into();
            max_size = max_size.max(shoff + shnum * shentsize);
            for section in sections.iter() {
                let sh_type = section.sh_type(endian);
                let offset: u64 = section.sh_offset(endian).into();
                let addr: u64 = section.sh_addr(endian).into();
                let size: u64 = section.sh_size(endian).into();
                if sh_type != elf::SHT_NOBITS {
                    max_size = max_size.max(offset.saturating_add(size));
                }
                let info = SectionInfo::new(offset, addr, size);
                let name = sections.section_name(endian, section).unwrap_or(&[]);
                match sh_type {
                    elf::SHT_SYMTAB | elf::SHT_DYNSYM => {
                        let link = SectionIndex(section.sh_link(endian) as usize);
                        let Ok(strtab) = sections.section(link) else {
                            continue;
                        };
                        let entries = data.slice(offset, size);
                        let strings = data.slice(
                            strtab.sh_offset(endian).into(),
                            strtab.sh_size(endian).into(),
                        );
                        if let (Some(entries), Some(strings)) = (entries, strings) {
                            symbols.push(Symbols::new(
                                entries,
                                strings,
                                is_64,
                                endian,
                                arch == Arch::Arm,
                            ));
                        }
                    }
                    elf::SHT_STRTAB => strtabs.push(info),
                    elf::SHT_NOTE if name == b".note.gnu.build-id" => {
                        if build_id.is_none() {
                            build_id = data
                                .slice(offset, size)
                                .and_then(|notes| parse_build_id(&notes, endian));
                        }
                    }
                    SHT_ARM_EXIDX if arch == Arch::Arm && arm_exidx.is_none() => {
                        arm_exidx = Some(info);
                    }
                    elf::SHT_NOBITS => {}
                    _ => match name {
                        b".eh_frame" => eh_frame = Some(info),
                        b".eh_frame_hdr" if eh_frame_hdr.is_none() => eh_frame_hdr = Some(info),
                        b".debug_frame" => debug_frame = Some(info),
                        b".gnu_debugdata" => gnu_debugdata = Some(info),
                        b".data" => data_section = Some(info),
                        b".text" => section_addresses.text = addr,
                        b".got" => section_addresses.got = addr,
                        _ => {}
                    },
                }
            }
        }
        Err(e) => log::debug!("No usable section headers: {e}"),
    }

    if build_id.is_none() {
        build_id = note_segments.iter().find_map(|&(offset, size)| {
            parse_build_id(&data.slice(offset, size)?, endian)
        });
    }

    let soname = read_soname(&data, &dynamic_entries, &strtabs, &all_loads);

    Ok(ElfInterface {
        data,
        arch,
        is_64,
        endian,
        load_bias,
        pt_loads,
        all_loads,
        dynamic,
        eh_frame_hdr,
        eh_frame,
        debug_frame,
        gnu_debugdata,
        arm_exidx,
        data_section,
        section_addresses,
        symbols,
        soname,
        build_id,
        max_size,
        eh_frame_cfi: OnceLock::new(),
        debug_frame_cfi: OnceLock::new(),
        exidx: OnceLock::new(),
    })
}

/// Resolves `DT_SONAME` through `DT_STRTAB`, bounded by `DT_STRSZ`.
fn read_soname(
    data: &ArcData,
    dynamic_entries: &[(u64, u64)],
    strtabs: &[SectionInfo],
    loads: &[SectionInfo],
) -> Option<String> {
    let find = |tag: u32| {
        dynamic_entries
            .iter()
            .find(|(t, _)| *t == u64::from(tag))
            .map(|(_, value)| *value)
    };
    let soname_offset = find(elf::DT_SONAME)?;
    let strtab_addr = find(elf::DT_STRTAB)?;
    let strtab_size = find(elf::DT_STRSZ)?;
    if soname_offset >= strtab_size {
        return None;
    }
    let strtab_offset = strtabs
        .iter()
        .find(|strtab| strtab.address() == strtab_addr)
        .map(|strtab| strtab.offset)
        .or_else(|| loads.iter().find_map(|load| load.translate(strtab_addr)))?;
    data.read_string(
        strtab_offset.checked_add(soname_offset)?,
        strtab_size - soname_offset - 1,
    )
    .ok()
}

fn read_u32(bytes: &[u8], offset: usize, endian: Endianness) -> Option<u32> {
    let word: [u8; 4] = bytes.get(offset..offset + 4)?.try_into().ok()?;
    Some(match endian {
        Endianness::Little => u32::from_le_bytes(word),
        Endianness::Big => u32::from_be_bytes(word),
    })
}

fn align4(n: usize) -> Option<usize> {
    n.checked_add(3).map(|n| n & !3)
}

/// The descriptor of the first `NT_GNU_BUILD_ID` note named `GNU`.
pub(crate) fn parse_build_id(notes: &[u8], endian: Endianness) -> Option<Vec<u8>> {
    let mut offset = 0;
    while offset + 12 <= notes.len() {
        let namesz = read_u32(notes, offset, endian)? as usize;
        let descsz = read_u32(notes, offset + 4, endian)? as usize;
        let note_type = read_u32(notes, offset + 8, endian)?;
        let name_start = offset + 12;
        let desc_start = name_start.checked_add(align4(namesz)?)?;
        let desc_end = desc_start.checked_add(descsz)?;
        if desc_end > notes.len() {
            return None;
        }
        let name = &notes[name_start..name_start + namesz];
        if note_type == elf::NT_GNU_BUILD_ID && name == elf::ELF_NOTE_GNU {
            return Some(notes[desc_start..desc_end].to_vec());
        }
        offset = desc_start.checked_add(align4(descsz)?)?;
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

    fn note(name: &[u8], note_type: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&note_type.to_le_bytes());
        out.extend_from_slice(name);
        out.resize(align4(out.len()).unwrap(), 0);
        out.extend_from_slice(desc);
        out.resize(align4(out.len()).unwrap(), 0);
        out
    }

    #[test]
    fn build_id_skips_other_notes() {
        let mut notes = note(b"WRONG\0", elf::NT_GNU_BUILD_ID, &[1, 2, 3, 4, 5]);
        notes.extend(note(b"GNU\0", elf::NT_GNU_BUILD_ID, &[0xde, 0xad, 0xbe, 0xef]));
        assert_eq!(
            parse_build_id(&notes, Endianness::Little),
            Some(vec![0xde, 0xad, 0xbe, 0xef])
        );
    }

    #[test]
    fn build_id_needs_the_right_type() {
        let notes = note(b"GNU\0", elf::NT_GNU_ABI_TAG, &[0, 0, 0, 0]);
        assert_eq!(parse_build_id(&notes, Endianness::Little), None);
        let mut truncated = note(b"GNU\0", elf::NT_GNU_BUILD_ID, &[1; 20]);
        truncated.truncate(30);
        assert_eq!(parse_build_id(&truncated, Endianness::Little), None);
    }
}
