//! Synthetic 64-bit little-endian ELF images for the integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use gimli::write::{
    Address, CallFrameInstruction, CommonInformationEntry, DebugFrame, EhFrame, EndianVec,
    FrameDescriptionEntry, FrameTable,
};
use gimli::{BaseAddresses, CieOrFde, Encoding, Format, Register, UnwindSection};
use object::elf;
use object::pod::bytes_of;
use object::{LittleEndian as LE, U16, U32, U64};

use unwindstack::{Arch, MapFlags, MapInfo, Maps, MemorySnapshot};

/// How a function restores its caller.
#[derive(Debug, Clone, Copy)]
pub enum Cfi {
    /// The return address is undefined: the outermost frame.
    Outermost,
    /// `CFA = sp + offset`, return address saved at `CFA - 8`.
    Saved(i32),
    /// `CFA = sp`, the return-address register keeps its value.
    Unchanged,
}

fn cfi_registers(arch: Arch) -> (Register, Register) {
    match arch {
        // (sp, return address)
        Arch::Arm64 => (Register(31), Register(30)),
        _ => (Register(7), Register(16)),
    }
}

fn frame_table(arch: Arch, fdes: &[(u64, u32, Cfi)]) -> FrameTable {
    let encoding = Encoding {
        format: Format::Dwarf32,
        version: 1,
        address_size: 8,
    };
    let (sp, ra) = cfi_registers(arch);
    let mut table = FrameTable::default();
    let mut cie = CommonInformationEntry::new(encoding, 1, -8, ra);
    cie.add_instruction(CallFrameInstruction::Cfa(sp, 0));
    let cie_id = table.add_cie(cie);

    for &(start, len, cfi) in fdes {
        let mut fde = FrameDescriptionEntry::new(Address::Constant(start), len);
        match cfi {
            Cfi::Outermost => fde.add_instruction(0, CallFrameInstruction::Undefined(ra)),
            Cfi::Saved(offset) => {
                fde.add_instruction(0, CallFrameInstruction::CfaOffset(offset));
                fde.add_instruction(0, CallFrameInstruction::Offset(ra, -8));
            }
            Cfi::Unchanged => {}
        }
        table.add_fde(cie_id, fde);
    }
    table
}

/// An `.eh_frame` section describing `[start, start + len)` ranges,
/// terminated by a zero length word.
pub fn eh_frame(arch: Arch, fdes: &[(u64, u32, Cfi)]) -> Vec<u8> {
    let mut out = EhFrame(EndianVec::new(gimli::LittleEndian));
    frame_table(arch, fdes).write_eh_frame(&mut out).unwrap();
    let mut bytes = out.0.into_vec();
    bytes.extend_from_slice(&[0, 0, 0, 0]);
    bytes
}

/// The same ranges as [`eh_frame`], as a `.debug_frame` section.
pub fn debug_frame(arch: Arch, fdes: &[(u64, u32, Cfi)]) -> Vec<u8> {
    let mut out = DebugFrame(EndianVec::new(gimli::LittleEndian));
    frame_table(arch, fdes).write_debug_frame(&mut out).unwrap();
    out.0.into_vec()
}

/// `(initial address, section offset)` of every FDE in `eh_frame`.
fn fde_offsets(eh_frame: &[u8]) -> Vec<(u64, u64)> {
    let section = gimli::EhFrame::new(eh_frame, gimli::LittleEndian);
    let bases = BaseAddresses::default();
    let mut fdes = Vec::new();
    let mut entries = section.entries(&bases);
    while let Some(entry) = entries.next().unwrap() {
        if let CieOrFde::Fde(partial) = entry {
            let fde = partial.parse(gimli::EhFrame::cie_from_offset).unwrap();
            fdes.push((fde.initial_address(), fde.offset() as u64));
        }
    }
    fdes.sort();
    fdes
}

/// A version 1 `.eh_frame_hdr` at `hdr_addr` with a sorted search table
/// over `eh_frame`, which is loaded at `eh_frame_addr`.
pub fn eh_frame_hdr(eh_frame: &[u8], eh_frame_addr: u64, hdr_addr: u64) -> Vec<u8> {
    let fdes = fde_offsets(eh_frame);
    // eh_frame_ptr: pcrel sdata4, fde_count: udata4, table: datarel sdata4.
    let mut out = vec![1, 0x1b, 0x03, 0x3b];
    let eh_frame_ptr = eh_frame_addr.wrapping_sub(hdr_addr + 4) as u32;
    out.extend_from_slice(&eh_frame_ptr.to_le_bytes());
    out.extend_from_slice(&(fdes.len() as u32).to_le_bytes());
    for (start, offset) in fdes {
        let fde_addr = eh_frame_addr + offset;
        out.extend_from_slice(&(start.wrapping_sub(hdr_addr) as u32).to_le_bytes());
        out.extend_from_slice(&(fde_addr.wrapping_sub(hdr_addr) as u32).to_le_bytes());
    }
    out
}

fn eh_frame_hdr_size(eh_frame: &[u8]) -> usize {
    12 + 8 * fde_offsets(eh_frame).len()
}

/// One ELF note.
pub fn note(name: &[u8], note_type: u32, desc: &[u8]) -> Vec<u8> {
    fn pad(out: &mut Vec<u8>) {
        out.resize((out.len() + 3) & !3, 0);
    }
    let mut out = Vec::new();
    out.extend_from_slice(&(name.len() as u32).to_le_bytes());
    out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
    out.extend_from_slice(&note_type.to_le_bytes());
    out.extend_from_slice(name);
    pad(&mut out);
    out.extend_from_slice(desc);
    pad(&mut out);
    out
}

pub fn build_id_note(build_id: &[u8]) -> Vec<u8> {
    note(b"GNU\0", elf::NT_GNU_BUILD_ID, build_id)
}

pub fn xz(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    lzma_rs::xz_compress(&mut &data[..], &mut out).unwrap();
    out
}

struct Section {
    name: &'static str,
    sh_type: u32,
    allocated: bool,
    data: Vec<u8>,
    link: u32,
    entsize: u64,
    /// `(addr, offset, size)` for a header without contents in the file.
    placed: Option<(u64, u64, u64)>,
}

pub struct ElfBuilder {
    machine: u16,
    load_vaddr: u64,
    load_memsz: u64,
    executable_load: bool,
    functions: Vec<(String, u64, u64)>,
    globals: Vec<(String, u64)>,
    eh_frame: Option<Vec<u8>>,
    eh_frame_hdr: bool,
    eh_frame_named: bool,
    debug_frame: Option<Vec<u8>>,
    notes: Option<Vec<u8>>,
    gnu_debugdata: Option<Vec<u8>>,
    soname: Option<(String, Option<u64>)>,
    data_section: Option<(u64, u64, u64)>,
}

impl ElfBuilder {
    pub fn new(arch: Arch) -> Self {
        let machine = match arch {
            Arch::Arm64 => elf::EM_AARCH64,
            _ => elf::EM_X86_64,
        };
        Self {
            machine,
            load_vaddr: 0,
            load_memsz: 0x1_0000,
            executable_load: true,
            functions: Vec::new(),
            globals: Vec::new(),
            eh_frame: None,
            eh_frame_hdr: false,
            eh_frame_named: true,
            debug_frame: None,
            notes: None,
            gnu_debugdata: None,
            soname: None,
            data_section: None,
        }
    }

    /// The vaddr of file offset 0, which is also the load bias.
    pub fn load_vaddr(mut self, vaddr: u64) -> Self {
        self.load_vaddr = vaddr;
        self
    }

    pub fn load_memsz(mut self, memsz: u64) -> Self {
        self.load_memsz = memsz;
        self
    }

    /// Leaves out the executable `PT_LOAD`, as in a mini-debug image.
    pub fn without_load(mut self) -> Self {
        self.executable_load = false;
        self
    }

    pub fn function(mut self, name: &str, addr: u64, size: u64) -> Self {
        self.functions.push((name.to_string(), addr, size));
        self
    }

    pub fn global(mut self, name: &str, addr: u64) -> Self {
        self.globals.push((name.to_string(), addr));
        self
    }

    pub fn eh_frame(mut self, eh_frame: Vec<u8>) -> Self {
        self.eh_frame = Some(eh_frame);
        self
    }

    /// Adds `.eh_frame_hdr` and its `PT_GNU_EH_FRAME` segment, searching
    /// the `.eh_frame` given to [`ElfBuilder::eh_frame`].
    pub fn eh_frame_hdr(mut self) -> Self {
        self.eh_frame_hdr = true;
        self
    }

    /// Gives `.eh_frame` a name the reader does not look for, so that it is
    /// only reachable through `.eh_frame_hdr`.
    pub fn unnamed_eh_frame(mut self) -> Self {
        self.eh_frame_named = false;
        self
    }

    pub fn debug_frame(mut self, debug_frame: Vec<u8>) -> Self {
        self.debug_frame = Some(debug_frame);
        self
    }

    pub fn notes(mut self, notes: Vec<u8>) -> Self {
        self.notes = Some(notes);
        self
    }

    pub fn gnu_debugdata(mut self, compressed: Vec<u8>) -> Self {
        self.gnu_debugdata = Some(compressed);
        self
    }

    /// `DT_SONAME`, with `DT_STRSZ` overridden by `strsz` when given.
    pub fn soname(mut self, soname: &str, strsz: Option<u64>) -> Self {
        self.soname = Some((soname.to_string(), strsz));
        self
    }

    /// A `.data` header placed at `(addr, offset, size)`.
    pub fn data_section(mut self, addr: u64, offset: u64, size: u64) -> Self {
        self.data_section = Some((addr, offset, size));
        self
    }

    pub fn build(self) -> Vec<u8> {
        let header_size = std::mem::size_of::<elf::FileHeader64<LE>>();
        let phdr_size = std::mem::size_of::<elf::ProgramHeader64<LE>>();
        let shdr_size = std::mem::size_of::<elf::SectionHeader64<LE>>();

        let mut sections = vec![Section {
            name: "",
            sh_type: elf::SHT_NULL,
            allocated: false,
            data: Vec::new(),
            link: 0,
            entsize: 0,
            placed: None,
        }];
        let mut add = |section: Section| {
            sections.push(section);
            sections.len() as u32 - 1
        };

        let mut search_table = None;
        if let Some(eh_frame) = self.eh_frame {
            // Filled in once both sections have addresses.
            let hdr = vec![0; eh_frame_hdr_size(&eh_frame)];
            let eh_frame_index = add(Section {
                name: if self.eh_frame_named { ".eh_frame" } else { ".rodata.frames" },
                sh_type: elf::SHT_PROGBITS,
                allocated: true,
                data: eh_frame,
                link: 0,
                entsize: 0,
                placed: None,
            });
            if self.eh_frame_hdr {
                let hdr_index = add(Section {
                    name: ".eh_frame_hdr",
                    sh_type: elf::SHT_PROGBITS,
                    allocated: true,
                    data: hdr,
                    link: 0,
                    entsize: 0,
                    placed: None,
                });
                search_table = Some((hdr_index as usize, eh_frame_index as usize));
            }
        }
        if let Some(debug_frame) = self.debug_frame {
            add(Section {
                name: ".debug_frame",
                sh_type: elf::SHT_PROGBITS,
                allocated: false,
                data: debug_frame,
                link: 0,
                entsize: 0,
                placed: None,
            });
        }
        if let Some(notes) = self.notes {
            add(Section {
                name: ".note.gnu.build-id",
                sh_type: elf::SHT_NOTE,
                allocated: true,
                data: notes,
                link: 0,
                entsize: 0,
                placed: None,
            });
        }
        if let Some(compressed) = self.gnu_debugdata {
            add(Section {
                name: ".gnu_debugdata",
                sh_type: elf::SHT_PROGBITS,
                allocated: false,
                data: compressed,
                link: 0,
                entsize: 0,
                placed: None,
            });
        }
        if let Some(placed) = self.data_section {
            add(Section {
                name: ".data",
                sh_type: elf::SHT_PROGBITS,
                allocated: true,
                data: Vec::new(),
                link: 0,
                entsize: 0,
                placed: Some(placed),
            });
        }
        if !self.functions.is_empty() || !self.globals.is_empty() {
            let mut strings = vec![0u8];
            let mut entries = Vec::new();
            entries.extend_from_slice(bytes_of(&sym(0, 0, 0, 0, 0)));
            let symbols = self
                .functions
                .iter()
                .map(|(name, addr, size)| (name, elf::STT_FUNC, *addr, *size))
                .chain(
                    self.globals
                        .iter()
                        .map(|(name, addr)| (name, elf::STT_OBJECT, *addr, 8)),
                );
            for (name, kind, addr, size) in symbols {
                let name_offset = strings.len() as u32;
                strings.extend_from_slice(name.as_bytes());
                strings.push(0);
                let info = (elf::STB_GLOBAL << 4) | kind;
                entries.extend_from_slice(bytes_of(&sym(name_offset, info, 1, addr, size)));
            }
            let strtab = add(Section {
                name: ".strtab",
                sh_type: elf::SHT_STRTAB,
                allocated: false,
                data: strings,
                link: 0,
                entsize: 0,
                placed: None,
            });
            add(Section {
                name: ".symtab",
                sh_type: elf::SHT_SYMTAB,
                allocated: false,
                data: entries,
                link: strtab,
                entsize: std::mem::size_of::<elf::Sym64<LE>>() as u64,
                placed: None,
            });
        }
        let mut dynamic = None;
        if let Some((soname, strsz)) = &self.soname {
            let mut strings = vec![0u8];
            strings.extend_from_slice(soname.as_bytes());
            strings.push(0);
            let strsz = strsz.unwrap_or(strings.len() as u64);
            let dynstr = add(Section {
                name: ".dynstr",
                sh_type: elf::SHT_STRTAB,
                allocated: true,
                data: strings,
                link: 0,
                entsize: 0,
                placed: None,
            });
            // Filled in once the address of .dynstr is known.
            let entries = vec![0; 4 * std::mem::size_of::<elf::Dyn64<LE>>()];
            let index = add(Section {
                name: ".dynamic",
                sh_type: elf::SHT_DYNAMIC,
                allocated: true,
                data: entries,
                link: dynstr,
                entsize: std::mem::size_of::<elf::Dyn64<LE>>() as u64,
                placed: None,
            });
            dynamic = Some((index as usize, dynstr as usize, strsz));
        }

        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for section in &sections {
            if section.name.is_empty() {
                name_offsets.push(0);
                continue;
            }
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend_from_slice(section.name.as_bytes());
            shstrtab.push(0);
        }
        name_offsets.push(shstrtab.len() as u32);
        shstrtab.extend_from_slice(b".shstrtab\0");
        sections.push(Section {
            name: ".shstrtab",
            sh_type: elf::SHT_STRTAB,
            allocated: false,
            data: shstrtab,
            link: 0,
            entsize: 0,
            placed: None,
        });
        let shstrndx = sections.len() as u16 - 1;

        let phnum = 1 + usize::from(dynamic.is_some()) + usize::from(search_table.is_some());
        let mut offset = (header_size + phnum * phdr_size) as u64;
        let mut offsets = Vec::new();
        for section in &sections {
            offset = (offset + 7) & !7;
            offsets.push(offset);
            offset += section.data.len() as u64;
        }
        let shoff = (offset + 7) & !7;
        let file_size = shoff + (sections.len() * shdr_size) as u64;
        let addr_of = |index: usize| self.load_vaddr + offsets[index];

        if let Some((index, dynstr, strsz)) = dynamic {
            let dynstr_addr = addr_of(dynstr);
            let mut entries = Vec::new();
            for (tag, val) in [
                (elf::DT_STRTAB, dynstr_addr),
                (elf::DT_STRSZ, strsz),
                (elf::DT_SONAME, 1),
                (elf::DT_NULL, 0),
            ] {
                let entry = elf::Dyn64 {
                    d_tag: U64::new(LE, u64::from(tag)),
                    d_val: U64::new(LE, val),
                };
                entries.extend_from_slice(bytes_of(&entry));
            }
            sections[index].data = entries;
        }
        if let Some((hdr, frames)) = search_table {
            let table = eh_frame_hdr(&sections[frames].data, addr_of(frames), addr_of(hdr));
            sections[hdr].data = table;
        }

        let mut out = Vec::with_capacity(file_size as usize);
        let header = elf::FileHeader64::<LE> {
            e_ident: elf::Ident {
                magic: elf::ELFMAG,
                class: elf::ELFCLASS64,
                data: elf::ELFDATA2LSB,
                version: elf::EV_CURRENT,
                os_abi: elf::ELFOSABI_NONE,
                abi_version: 0,
                padding: [0; 7],
            },
            e_type: U16::new(LE, elf::ET_DYN),
            e_machine: U16::new(LE, self.machine),
            e_version: U32::new(LE, u32::from(elf::EV_CURRENT)),
            e_entry: U64::new(LE, 0),
            e_phoff: U64::new(LE, header_size as u64),
            e_shoff: U64::new(LE, shoff),
            e_flags: U32::new(LE, 0),
            e_ehsize: U16::new(LE, header_size as u16),
            e_phentsize: U16::new(LE, phdr_size as u16),
            e_phnum: U16::new(LE, phnum as u16),
            e_shentsize: U16::new(LE, shdr_size as u16),
            e_shnum: U16::new(LE, sections.len() as u16),
            e_shstrndx: U16::new(LE, shstrndx),
        };
        out.extend_from_slice(bytes_of(&header));

        let load_flags = if self.executable_load {
            elf::PF_R | elf::PF_X
        } else {
            elf::PF_R
        };
        out.extend_from_slice(bytes_of(&phdr(
            elf::PT_LOAD,
            load_flags,
            0,
            self.load_vaddr,
            file_size,
            file_size.max(self.load_memsz),
        )));
        if let Some((index, _, _)) = dynamic {
            let size = sections[index].data.len() as u64;
            out.extend_from_slice(bytes_of(&phdr(
                elf::PT_DYNAMIC,
                elf::PF_R | elf::PF_W,
                offsets[index],
                addr_of(index),
                size,
                size,
            )));
        }
        if let Some((index, _)) = search_table {
            let size = sections[index].data.len() as u64;
            out.extend_from_slice(bytes_of(&phdr(
                elf::PT_GNU_EH_FRAME,
                elf::PF_R,
                offsets[index],
                addr_of(index),
                size,
                size,
            )));
        }

        for (section, &offset) in sections.iter().zip(&offsets) {
            out.resize(offset as usize, 0);
            out.extend_from_slice(&section.data);
        }
        out.resize(shoff as usize, 0);

        for (index, section) in sections.iter().enumerate() {
            let (addr, offset, size) = match section.placed {
                Some(placed) => placed,
                None if section.sh_type == elf::SHT_NULL => (0, 0, 0),
                None => {
                    let addr = if section.allocated { addr_of(index) } else { 0 };
                    (addr, offsets[index], section.data.len() as u64)
                }
            };
            let flags = if section.allocated { elf::SHF_ALLOC } else { 0 };
            let header = elf::SectionHeader64::<LE> {
                sh_name: U32::new(LE, name_offsets[index]),
                sh_type: U32::new(LE, section.sh_type),
                sh_flags: U64::new(LE, u64::from(flags)),
                sh_addr: U64::new(LE, addr),
                sh_offset: U64::new(LE, offset),
                sh_size: U64::new(LE, size),
                sh_link: U32::new(LE, section.link),
                sh_info: U32::new(LE, 0),
                sh_addralign: U64::new(LE, 1),
                sh_entsize: U64::new(LE, section.entsize),
            };
            out.extend_from_slice(bytes_of(&header));
        }
        out
    }
}

fn sym(name: u32, info: u8, shndx: u16, value: u64, size: u64) -> elf::Sym64<LE> {
    elf::Sym64 {
        st_name: U32::new(LE, name),
        st_info: info,
        st_other: 0,
        st_shndx: U16::new(LE, shndx),
        st_value: U64::new(LE, value),
        st_size: U64::new(LE, size),
    }
}

fn phdr(p_type: u32, flags: u32, offset: u64, vaddr: u64, filesz: u64, memsz: u64) -> elf::ProgramHeader64<LE> {
    elf::ProgramHeader64 {
        p_type: U32::new(LE, p_type),
        p_flags: U32::new(LE, flags),
        p_offset: U64::new(LE, offset),
        p_vaddr: U64::new(LE, vaddr),
        p_paddr: U64::new(LE, vaddr),
        p_filesz: U64::new(LE, filesz),
        p_memsz: U64::new(LE, memsz),
        p_align: U64::new(LE, 0x1000),
    }
}

/// Copies `image` to `start` of `memory`, zero-filling the rest of
/// `[start, end)`.
pub fn map_image(memory: &MemorySnapshot, start: u64, end: u64, image: &[u8]) {
    assert!(image.len() as u64 <= end - start, "image does not fit its map");
    memory.set_memory_block(start, end - start, 0);
    memory.set_memory(start, image);
}

/// Adds a map whose object is read from process memory.
pub fn add_map(maps: &mut Maps, start: u64, end: u64, offset: u64, flags: MapFlags, name: &str) -> Arc<MapInfo> {
    maps.add(MapInfo::new(start, end, offset, flags, name))
}

const PT_ARM_EXIDX: u32 = 0x7000_0001;

/// A 32-bit ARM image without section headers. Its `PT_ARM_EXIDX` table
/// holds one `(function address, entry word)` pair per entry, sorted by
/// function address.
pub fn arm_exidx_image(entries: &[(u32, u32)]) -> Vec<u8> {
    let header_size = std::mem::size_of::<elf::FileHeader32<LE>>();
    let phdr_size = std::mem::size_of::<elf::ProgramHeader32<LE>>();
    let table_offset = (header_size + 2 * phdr_size) as u32;
    let table_size = 8 * entries.len() as u32;
    let file_size = table_offset + table_size;

    let mut out = Vec::new();
    let header = elf::FileHeader32::<LE> {
        e_ident: elf::Ident {
            magic: elf::ELFMAG,
            class: elf::ELFCLASS32,
            data: elf::ELFDATA2LSB,
            version: elf::EV_CURRENT,
            os_abi: elf::ELFOSABI_NONE,
            abi_version: 0,
            padding: [0; 7],
        },
        e_type: U16::new(LE, elf::ET_DYN),
        e_machine: U16::new(LE, elf::EM_ARM),
        e_version: U32::new(LE, u32::from(elf::EV_CURRENT)),
        e_entry: U32::new(LE, 0),
        e_phoff: U32::new(LE, header_size as u32),
        e_shoff: U32::new(LE, 0),
        e_flags: U32::new(LE, 0),
        e_ehsize: U16::new(LE, header_size as u16),
        e_phentsize: U16::new(LE, phdr_size as u16),
        e_phnum: U16::new(LE, 2),
        e_shentsize: U16::new(LE, std::mem::size_of::<elf::SectionHeader32<LE>>() as u16),
        e_shnum: U16::new(LE, 0),
        e_shstrndx: U16::new(LE, 0),
    };
    out.extend_from_slice(bytes_of(&header));
    let phdr32 = |p_type, flags, offset, filesz, memsz| elf::ProgramHeader32::<LE> {
        p_type: U32::new(LE, p_type),
        p_offset: U32::new(LE, offset),
        p_vaddr: U32::new(LE, offset),
        p_paddr: U32::new(LE, offset),
        p_filesz: U32::new(LE, filesz),
        p_memsz: U32::new(LE, memsz),
        p_flags: U32::new(LE, flags),
        p_align: U32::new(LE, 4),
    };
    out.extend_from_slice(bytes_of(&phdr32(
        elf::PT_LOAD,
        elf::PF_R | elf::PF_X,
        0,
        file_size,
        0x1_0000,
    )));
    out.extend_from_slice(bytes_of(&phdr32(
        PT_ARM_EXIDX,
        elf::PF_R,
        table_offset,
        table_size,
        table_size,
    )));

    for (index, &(function, word)) in entries.iter().enumerate() {
        let entry_vaddr = table_offset + 8 * index as u32;
        let prel31 = function.wrapping_sub(entry_vaddr) & 0x7fff_ffff;
        out.extend_from_slice(&prel31.to_le_bytes());
        out.extend_from_slice(&word.to_le_bytes());
    }
    out
}
