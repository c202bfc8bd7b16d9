//! DWARF call frame information from `.eh_frame` and `.debug_frame`.
//!
//! Parsing of CIEs, FDEs and the CFA instruction stream is done by gimli. The
//! row gimli computes for an address is converted into a [`LocationRow`],
//! cached by the end of its pc range, and then applied to a full register
//! file.

mod index;
mod location;

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, OnceLock};

use gimli::{
    BaseAddresses, CfaRule, DebugFrame, EhFrame, EhFrameHdr, ParsedEhFrameHdr, Pointer,
    RegisterRule, UnwindContext, UnwindSection,
};
use parking_lot::Mutex;

pub use index::DwarfCfiIndex;
pub use location::{CfaLocation, LocationRow, RegisterLocation};

use crate::arcdata::{ArcData, ArcDataReader};
use crate::error::{ErrorCode, ErrorData, MemoryError};
use crate::memory::Memory;
use crate::regs::Regs;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DwarfError {
    #[error("Could not read memory at 0x{0:x}")]
    MemoryInvalid(u64),

    #[error("No FDE covers the address")]
    NoFde,

    #[error("Could not parse the CFI: {0}")]
    Parse(#[source] gimli::Error),

    #[error("Expression evaluation failed: {0}")]
    Expression(#[source] gimli::Error),

    #[error("Unsupported expression")]
    Unsupported,

    #[error("Register {0} does not exist")]
    IllegalRegister(u16),

    #[error("Expression left nothing on the stack")]
    IllegalState,
}

impl From<MemoryError> for DwarfError {
    fn from(e: MemoryError) -> Self {
        DwarfError::MemoryInvalid(e.addr)
    }
}

impl DwarfError {
    pub fn error_data(&self) -> ErrorData {
        match *self {
            DwarfError::MemoryInvalid(addr) => ErrorData::new(ErrorCode::MemoryInvalid, addr),
            DwarfError::Unsupported => ErrorData::new(ErrorCode::Unsupported, 0),
            DwarfError::NoFde
            | DwarfError::Parse(_)
            | DwarfError::Expression(_)
            | DwarfError::IllegalRegister(_)
            | DwarfError::IllegalState => ErrorData::new(ErrorCode::UnwindInfo, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CfiFormat {
    EhFrame,
    DebugFrame,
}

/// The addresses that pointer encodings in the CFI are relative to.
#[derive(Debug, Clone, Copy, Default)]
pub struct SectionAddresses {
    pub eh_frame: u64,
    pub eh_frame_hdr: u64,
    pub text: u64,
    pub got: u64,
}

impl SectionAddresses {
    fn bases(&self) -> BaseAddresses {
        BaseAddresses::default()
            .set_eh_frame(self.eh_frame)
            .set_eh_frame_hdr(self.eh_frame_hdr)
            .set_text(self.text)
            .set_got(self.got)
    }
}

/// A summary of the CIE that governs an FDE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CieInfo {
    pub offset: usize,
    pub version: u16,
    pub code_alignment_factor: u64,
    pub data_alignment_factor: i64,
    pub return_address_register: u16,
    pub lsda_encoding: Option<u8>,
    pub personality: Option<u64>,
    pub signal_frame: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdeInfo {
    pub offset: usize,
    pub pc_begin: u64,
    pub pc_range: u64,
    pub lsda: Option<u64>,
    pub cie: CieInfo,
}

enum FdeLookup {
    /// The binary search table of `.eh_frame_hdr`.
    Hdr(ParsedEhFrameHdr<ArcDataReader>),
    /// Built on first use by scanning the section.
    Index(OnceLock<Option<DwarfCfiIndex>>),
}

struct RowCache {
    context: Box<UnwindContext<usize>>,
    /// Converted rows keyed by the end of their pc range.
    rows: BTreeMap<u64, Arc<LocationRow>>,
}

/// One CFI section of one object.
pub struct DwarfCfi {
    format: CfiFormat,
    data: ArcDataReader,
    address_size: u8,
    bases: BaseAddresses,
    lookup: FdeLookup,
    cache: Mutex<RowCache>,
}

impl DwarfCfi {
    /// `.eh_frame` data without a search table, or `.debug_frame` data.
    pub fn new(
        format: CfiFormat,
        data: ArcData,
        endian: gimli::RunTimeEndian,
        address_size: u8,
        sections: &SectionAddresses,
    ) -> Self {
        Self {
            format,
            data: data.reader(endian),
            address_size,
            bases: sections.bases(),
            lookup: FdeLookup::Index(OnceLock::new()),
            cache: Mutex::new(RowCache::new()),
        }
    }

    /// `.eh_frame` data found through `.eh_frame_hdr`. Falls back to a
    /// linear index when the header has no usable table.
    pub fn with_eh_frame_hdr(
        eh_frame: ArcData,
        eh_frame_hdr: ArcData,
        endian: gimli::RunTimeEndian,
        address_size: u8,
        sections: &SectionAddresses,
    ) -> Self {
        let bases = sections.bases();
        let hdr = EhFrameHdr::from(eh_frame_hdr.reader(endian)).parse(&bases, address_size);
        let lookup = match hdr {
            Ok(hdr) if hdr.table().is_some() => FdeLookup::Hdr(hdr),
            Ok(_) => FdeLookup::Index(OnceLock::new()),
            Err(e) => {
                log::debug!("Ignoring unparsable .eh_frame_hdr: {e}");
                FdeLookup::Index(OnceLock::new())
            }
        };
        Self {
            format: CfiFormat::EhFrame,
            data: eh_frame.reader(endian),
            address_size,
            bases,
            lookup,
            cache: Mutex::new(RowCache::new()),
        }
    }

    /// Reads just the `eh_frame_ptr` field of an `.eh_frame_hdr`, which is
    /// the address of the `.eh_frame` section it describes.
    pub fn eh_frame_address_from_hdr(
        eh_frame_hdr: &ArcData,
        endian: gimli::RunTimeEndian,
        address_size: u8,
        eh_frame_hdr_address: u64,
    ) -> Option<u64> {
        let bases = BaseAddresses::default().set_eh_frame_hdr(eh_frame_hdr_address);
        let hdr = EhFrameHdr::from(eh_frame_hdr.reader(endian))
            .parse(&bases, address_size)
            .ok()?;
        match hdr.eh_frame_ptr() {
            Pointer::Direct(addr) => Some(addr),
            Pointer::Indirect(_) => None,
        }
    }

    pub fn format(&self) -> CfiFormat {
        self.format
    }

    fn eh_frame(&self) -> EhFrame<ArcDataReader> {
        let mut section = EhFrame::from(self.data.clone());
        section.set_address_size(self.address_size);
        section
    }

    fn debug_frame(&self) -> DebugFrame<ArcDataReader> {
        let mut section = DebugFrame::from(self.data.clone());
        section.set_address_size(self.address_size);
        section
    }

    fn index<'a>(
        &'a self,
        slot: &'a OnceLock<Option<DwarfCfiIndex>>,
    ) -> Option<&'a DwarfCfiIndex> {
        slot.get_or_init(|| {
            let index = match self.format {
                CfiFormat::EhFrame => DwarfCfiIndex::try_new(&self.eh_frame(), &self.bases),
                CfiFormat::DebugFrame => DwarfCfiIndex::try_new(&self.debug_frame(), &self.bases),
            };
            match index {
                Ok(index) => Some(index),
                Err(e) => {
                    log::debug!("Could not index {:?} section: {e}", self.format);
                    None
                }
            }
        })
        .as_ref()
    }

    fn fde_offset(&self, pc: u64) -> Option<usize> {
        match &self.lookup {
            FdeLookup::Hdr(hdr) => {
                let table = hdr.table()?;
                let ptr = table.lookup(pc, &self.bases).ok()?;
                let offset = table.pointer_to_offset(ptr).ok()?;
                Some(offset.0)
            }
            FdeLookup::Index(slot) => self.index(slot)?.fde_offset_for_address(pc),
        }
    }

    /// The FDE covering `pc`, if any.
    pub fn fde_info(&self, pc: u64) -> Option<FdeInfo> {
        let offset = self.fde_offset(pc)?;
        let info = match self.format {
            CfiFormat::EhFrame => fde_info_in(&self.eh_frame(), &self.bases, offset),
            CfiFormat::DebugFrame => fde_info_in(&self.debug_frame(), &self.bases, offset),
        }?;
        (info.pc_begin <= pc && pc < info.pc_begin.wrapping_add(info.pc_range)).then_some(info)
    }

    pub fn is_valid_pc(&self, pc: u64) -> bool {
        self.fde_info(pc).is_some()
    }

    /// The row of rules in force at `pc`.
    pub fn location_row(&self, pc: u64) -> Result<Arc<LocationRow>, DwarfError> {
        let mut cache = self.cache.lock();
        if let Some((_, row)) = cache
            .rows
            .range((Bound::Excluded(pc), Bound::Unbounded))
            .next()
        {
            if row.contains(pc) {
                return Ok(row.clone());
            }
        }
        let offset = self.fde_offset(pc).ok_or(DwarfError::NoFde)?;
        let row = match self.format {
            CfiFormat::EhFrame => {
                row_in(&self.eh_frame(), &self.bases, &mut cache.context, offset, pc)
            }
            CfiFormat::DebugFrame => {
                row_in(&self.debug_frame(), &self.bases, &mut cache.context, offset, pc)
            }
        }?;
        let row = Arc::new(row);
        cache.rows.insert(row.end, row.clone());
        Ok(row)
    }

    /// Unwinds one frame. Returns whether the unwind is finished.
    pub fn step(&self, pc: u64, regs: &mut Regs, memory: &dyn Memory) -> Result<bool, DwarfError> {
        let row = self.location_row(pc)?;
        log::trace!("CFI row for 0x{pc:x}: {row:?}");
        row.apply(regs, memory)
    }
}

impl RowCache {
    fn new() -> Self {
        Self {
            context: Box::new(UnwindContext::new()),
            rows: BTreeMap::new(),
        }
    }
}

fn fde_info_in<US>(section: &US, bases: &BaseAddresses, offset: usize) -> Option<FdeInfo>
where
    US: UnwindSection<ArcDataReader>,
{
    let fde = section
        .fde_from_offset(bases, US::Offset::from(offset), US::cie_from_offset)
        .ok()?;
    let cie = fde.cie();
    Some(FdeInfo {
        offset: fde.offset(),
        pc_begin: fde.initial_address(),
        pc_range: fde.len(),
        lsda: fde.lsda().map(pointer_value),
        cie: CieInfo {
            offset: cie.offset(),
            version: cie.encoding().version,
            code_alignment_factor: cie.code_alignment_factor(),
            data_alignment_factor: cie.data_alignment_factor(),
            return_address_register: cie.return_address_register().0,
            lsda_encoding: cie.lsda_encoding().map(|e| e.0),
            personality: cie.personality().map(pointer_value),
            signal_frame: cie.is_signal_trampoline(),
        },
    })
}

fn pointer_value(pointer: Pointer) -> u64 {
    match pointer {
        Pointer::Direct(addr) | Pointer::Indirect(addr) => addr,
    }
}

fn row_in<US>(
    section: &US,
    bases: &BaseAddresses,
    context: &mut UnwindContext<usize>,
    offset: usize,
    pc: u64,
) -> Result<LocationRow, DwarfError>
where
    US: UnwindSection<ArcDataReader>,
{
    let fde = section
        .fde_from_offset(bases, US::Offset::from(offset), US::cie_from_offset)
        .map_err(DwarfError::Parse)?;
    let start = fde.initial_address();
    if pc < start || pc >= start.wrapping_add(fde.len()) {
        return Err(DwarfError::NoFde);
    }
    let cie = fde.cie();
    let encoding = cie.encoding();
    let return_address_register = cie.return_address_register().0;
    let signal_frame = cie.is_signal_trampoline();

    let row = fde
        .unwind_info_for_address(section, bases, context, pc)
        .map_err(DwarfError::Parse)?;

    let cfa = match row.cfa() {
        CfaRule::RegisterAndOffset { register, offset } => CfaLocation::RegisterOffset {
            register: register.0,
            offset: *offset,
        },
        CfaRule::Expression(expr) => {
            CfaLocation::Expression(expr.get(section).map_err(DwarfError::Parse)?)
        }
    };
    let mut registers = Vec::new();
    for (register, rule) in row.registers() {
        let location = match rule {
            RegisterRule::Undefined => RegisterLocation::Undefined,
            RegisterRule::SameValue => RegisterLocation::Same,
            RegisterRule::Offset(n) => RegisterLocation::Offset(*n),
            RegisterRule::ValOffset(n) => RegisterLocation::ValOffset(*n),
            RegisterRule::Register(other) => RegisterLocation::Register(other.0),
            RegisterRule::Expression(expr) => {
                RegisterLocation::Expression(expr.get(section).map_err(DwarfError::Parse)?)
            }
            RegisterRule::ValExpression(expr) => {
                RegisterLocation::ValExpression(expr.get(section).map_err(DwarfError::Parse)?)
            }
            // Architectural and constant rules carry nothing the register
            // file can use; the register keeps its value.
            _ => continue,
        };
        registers.push((register.0, location));
    }

    Ok(LocationRow {
        start: row.start_address(),
        end: row.end_address(),
        cfa,
        registers,
        return_address_register,
        signal_frame,
        encoding,
    })
}
