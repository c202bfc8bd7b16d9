//! ELF images: header parsing, unwinding through their CFI tables and
//! symbol lookup.
//!
//! An [`Elf`] is always constructed, even from garbage. Parsing failures
//! leave it invalid, and an invalid ELF answers every query negatively.

pub mod exidx;
pub mod interface;
pub mod symbols;

use std::io::{self, Cursor};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use object::read::elf::FileHeader;
use object::{elf, Endianness};

pub use interface::{ElfInterface, LoadInfo, SectionInfo};

use crate::arcdata::ArcData;
use crate::arch::Arch;
use crate::display_utils::hex_string;
use crate::error::{ErrorCode, ErrorData, StepError};
use crate::memory::{read_to_vec, Memory};
use crate::maps::Maps;
use crate::object::{StepResult, Symfile, UnwindObject};
use crate::regs::Regs;

/// The default cap on the decompressed size of `.gnu_debugdata`.
pub const DEFAULT_MINI_DEBUG_INFO_MAX_SIZE: usize = 16 * 1024 * 1024;

static MINI_DEBUG_INFO_MAX_SIZE: AtomicUsize = AtomicUsize::new(DEFAULT_MINI_DEBUG_INFO_MAX_SIZE);

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ElfError {
    #[error("Not an ELF image")]
    BadMagic,

    #[error("Unsupported ELF class {0}")]
    UnsupportedClass(u8),

    #[error("Malformed ELF: {0}")]
    Parse(#[from] object::read::Error),

    #[error("The image has no executable PT_LOAD segment")]
    NoExecutableLoad,

    #[error("Could not decompress .gnu_debugdata: {0}")]
    Decompression(String),

    #[error("ELF is for {found:?}, expected {expected:?}")]
    WrongArch { expected: Arch, found: Arch },

    #[error("Could not read the ELF file: {0}")]
    Io(String),
}

impl ElfError {
    pub fn error_data(&self) -> ErrorData {
        ErrorData::new(ErrorCode::InvalidElf, 0)
    }
}

/// The header-level facts about an ELF image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElfInfo {
    pub arch: Arch,
    pub is_64: bool,
    /// The end of the furthest header table, which bounds the file.
    pub size: u64,
}

pub struct Elf {
    data: ArcData,
    interface: Option<ElfInterface>,
    gnu_debugdata: OnceLock<Option<ElfInterface>>,
}

impl Elf {
    /// Parses the image in `data`. Failures are logged and produce an
    /// invalid `Elf`.
    pub fn new(data: ArcData) -> Self {
        match Self::parse(data.clone()) {
            Ok(elf) => elf,
            Err(e) => {
                log::debug!("Invalid ELF: {e}");
                Self::invalid(data)
            }
        }
    }

    pub fn parse(data: ArcData) -> Result<Self, ElfError> {
        let interface = ElfInterface::parse(data.clone())?;
        if interface.pt_loads().is_empty() {
            return Err(ElfError::NoExecutableLoad);
        }
        Ok(Self {
            data,
            interface: Some(interface),
            gnu_debugdata: OnceLock::new(),
        })
    }

    pub fn invalid(data: ArcData) -> Self {
        Self {
            data,
            interface: None,
            gnu_debugdata: OnceLock::new(),
        }
    }

    /// Copies `size` bytes at `addr` out of `memory` and parses them.
    /// Images over [`crate::memory::MAX_COPY_SIZE`] are invalid.
    pub fn from_memory(memory: &dyn Memory, addr: u64, size: u64) -> Self {
        match read_to_vec(memory, addr, size) {
            Some(bytes) => Self::new(ArcData::from_vec(bytes)),
            None => Self::invalid(ArcData::from_vec(Vec::new())),
        }
    }

    /// Sets the largest `.gnu_debugdata` output that will be decompressed.
    pub fn set_mini_debug_max_size(max_size: usize) {
        MINI_DEBUG_INFO_MAX_SIZE.store(max_size, Ordering::Relaxed);
    }

    /// Reads just the file header from `memory`.
    pub fn info(memory: &dyn Memory) -> Option<ElfInfo> {
        let header_size = std::mem::size_of::<elf::FileHeader64<Endianness>>() as u64;
        let header = read_to_vec(memory, 0, header_size)?;
        let (ident, _) = object::pod::from_bytes::<elf::Ident>(&header).ok()?;
        match ident.class {
            elf::ELFCLASS32 => header_info::<elf::FileHeader32<Endianness>>(&header),
            elf::ELFCLASS64 => header_info::<elf::FileHeader64<Endianness>>(&header),
            _ => None,
        }
    }

    pub fn is_valid_elf(memory: &dyn Memory) -> bool {
        let mut magic = [0; 4];
        memory.read_fully(0, &mut magic).is_ok() && magic == elf::ELFMAG
    }

    pub fn interface(&self) -> Option<&ElfInterface> {
        self.interface.as_ref()
    }

    pub fn data(&self) -> &ArcData {
        &self.data
    }

    /// The ELF embedded in `.gnu_debugdata`, decompressed on first use.
    pub fn gnu_debugdata_interface(&self) -> Option<&ElfInterface> {
        self.gnu_debugdata
            .get_or_init(|| {
                let compressed = self.interface.as_ref()?.gnu_debugdata()?;
                let max_size = MINI_DEBUG_INFO_MAX_SIZE.load(Ordering::Relaxed);
                let decompressed = match decompress_xz(&compressed, max_size) {
                    Ok(decompressed) => decompressed,
                    Err(e) => {
                        log::debug!("{e}");
                        return None;
                    }
                };
                match ElfInterface::parse(ArcData::from_vec(decompressed)) {
                    Ok(interface) => Some(interface),
                    Err(e) => {
                        log::debug!("Invalid mini debug info: {e}");
                        None
                    }
                }
            })
            .as_ref()
    }

    /// Rejects an image built for another architecture.
    pub fn check_arch(self, expected: Arch) -> Self {
        let found = self.arch();
        if self.valid() && expected != Arch::Unknown && found != expected {
            log::debug!("{}", ElfError::WrongArch { expected, found });
            return Self::invalid(self.data);
        }
        self
    }

    pub fn build_id_hex(&self) -> Option<String> {
        self.build_id().map(hex_string)
    }

    fn with_interfaces<T>(&self, mut f: impl FnMut(&ElfInterface) -> Option<T>) -> Option<T> {
        let interface = self.interface.as_ref()?;
        f(interface).or_else(|| self.gnu_debugdata_interface().and_then(f))
    }
}

impl UnwindObject for Elf {
    fn valid(&self) -> bool {
        self.interface.is_some()
    }

    fn arch(&self) -> Arch {
        self.interface
            .as_ref()
            .map_or(Arch::Unknown, |interface| interface.arch())
    }

    fn load_bias(&self) -> i64 {
        self.interface
            .as_ref()
            .map_or(0, |interface| interface.load_bias())
    }

    fn memory(&self) -> Option<&dyn Memory> {
        Some(&self.data)
    }

    fn step(
        &self,
        rel_pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> Result<StepResult, StepError> {
        let interface = self.interface.as_ref().ok_or(StepError::InvalidObject)?;
        let finished = match interface.step(rel_pc, regs, process_memory) {
            Ok(finished) => finished,
            Err(e) => match self.gnu_debugdata_interface() {
                Some(mini) => mini.step(rel_pc, regs, process_memory).map_err(|_| e)?,
                None => return Err(e),
            },
        };
        Ok(StepResult {
            finished,
            is_signal_frame: false,
        })
    }

    fn function_name(&self, rel_pc: u64) -> Option<(String, u64)> {
        self.with_interfaces(|interface| interface.function_name(rel_pc))
    }

    fn global_variable_offset(&self, name: &str) -> Option<u64> {
        let interface = self.interface.as_ref()?;
        let mut vaddr = self.with_interfaces(|interface| interface.global_variable(name))?;
        if self.arch() == Arch::Arm64 {
            vaddr &= (1 << 56) - 1;
        }
        interface.global_vaddr_to_offset(vaddr)
    }

    fn is_valid_pc(&self, pc: u64) -> bool {
        let Some(interface) = self.interface.as_ref() else {
            return false;
        };
        let load_bias = interface.load_bias();
        if load_bias > 0 && pc < load_bias as u64 {
            return false;
        }
        interface.is_valid_pc(pc)
            || self
                .gnu_debugdata_interface()
                .is_some_and(|mini| mini.is_valid_pc(pc))
    }

    fn build_id(&self) -> Option<&[u8]> {
        self.interface.as_ref()?.build_id()
    }

    fn soname(&self) -> Option<&str> {
        self.interface.as_ref()?.soname()
    }
}

/// A JIT-compiled image. Its vaddrs are the absolute addresses of its code.
impl Symfile for Elf {
    fn load(_maps: &Maps, memory: &dyn Memory, addr: u64, size: u64) -> Option<Self> {
        let Some(bytes) = read_to_vec(memory, addr, size) else {
            log::debug!("Refusing to copy a {size} byte JIT image at 0x{addr:x}");
            return None;
        };
        if bytes.len() as u64 != size {
            return None;
        }
        let elf = Elf::new(ArcData::from_vec(bytes));
        elf.valid().then_some(elf)
    }

    fn contains_pc(&self, pc: u64) -> bool {
        self.is_valid_pc(pc)
    }

    fn symbolize(&self, pc: u64) -> Option<(String, u64)> {
        self.function_name(pc)
    }
}

fn header_info<H: FileHeader<Endian = Endianness>>(bytes: &[u8]) -> Option<ElfInfo> {
    let header = H::parse(bytes).ok()?;
    let endian = header.endian().ok()?;
    let is_64 = header.is_class_64();
    let shoff: u64 = header.e_shoff(endian).into();
    let phoff: u64 = header.e_phoff(endian).into();
    let section_end =
        shoff + u64::from(header.e_shentsize(endian)) * u64::from(header.e_shnum(endian));
    let program_end =
        phoff + u64::from(header.e_phentsize(endian)) * u64::from(header.e_phnum(endian));
    Some(ElfInfo {
        arch: Arch::from_elf_machine(header.e_machine(endian), is_64),
        is_64,
        size: section_end.max(program_end),
    })
}

/// Collects decompressed output, failing once it would exceed the cap.
struct BoundedWriter {
    buf: Vec<u8>,
    max_size: usize,
}

impl io::Write for BoundedWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if self.buf.len() + data.len() > self.max_size {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("output exceeds {} bytes", self.max_size),
            ));
        }
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn decompress_xz(compressed: &[u8], max_size: usize) -> Result<Vec<u8>, ElfError> {
    let mut writer = BoundedWriter {
        buf: Vec::new(),
        max_size,
    };
    lzma_rs::xz_decompress(&mut Cursor::new(compressed), &mut writer)
        .map_err(|e| ElfError::Decompression(e.to_string()))?;
    Ok(writer.buf)
}
