use std::fmt;

use crate::dwarf::DwarfError;
use crate::elf::exidx::ExidxError;
use crate::maps::MapsError;

/// The numeric error taxonomy reported by an unwind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    #[default]
    None,
    MemoryInvalid,
    UnwindInfo,
    Unsupported,
    InvalidMap,
    MaxFramesExceeded,
    RepeatedFrame,
    InvalidElf,
    ThreadDoesNotExist,
    ThreadTimeout,
    SystemCall,
    BadArch,
    MapsParseFailed,
    InvalidParameter,
    PtraceCall,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::None => "None",
            ErrorCode::MemoryInvalid => "Memory Invalid",
            ErrorCode::UnwindInfo => "Unwind Info",
            ErrorCode::Unsupported => "Unsupported",
            ErrorCode::InvalidMap => "Invalid Map",
            ErrorCode::MaxFramesExceeded => "Maximum Frames Exceeded",
            ErrorCode::RepeatedFrame => "Repeated Frame",
            ErrorCode::InvalidElf => "Invalid Elf",
            ErrorCode::ThreadDoesNotExist => "Thread Does Not Exist",
            ErrorCode::ThreadTimeout => "Thread Timeout",
            ErrorCode::SystemCall => "System Call Failed",
            ErrorCode::BadArch => "Wrong Architecture",
            ErrorCode::MapsParseFailed => "Maps Parse Failed",
            ErrorCode::InvalidParameter => "Invalid Parameter",
            ErrorCode::PtraceCall => "Ptrace Call Failed",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error code plus the address that caused it, when there is one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorData {
    pub code: ErrorCode,
    pub address: u64,
}

impl ErrorData {
    pub fn new(code: ErrorCode, address: u64) -> Self {
        Self { code, address }
    }
}

bitflags::bitflags! {
    /// Informational conditions noticed during an unwind. They never stop it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Warnings: u32 {
        /// A dex pc was present but no map contains it.
        const DEX_PC_NOT_IN_MAP = 1 << 0;
        /// The unwind started from a pc outside any map and recovered via the return address.
        const SPECULATIVE_FRAME = 1 << 1;
    }
}

/// A required memory read came back short.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Could not read memory at 0x{addr:x}")]
pub struct MemoryError {
    pub addr: u64,
}

/// Why a single step of one object failed.
#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepError {
    #[error("Could not read memory at 0x{0:x}")]
    MemoryInvalid(u64),

    #[error("No unwind information covers the address")]
    NoUnwindInfo,

    #[error("DWARF unwinding failed: {0}")]
    Dwarf(#[from] DwarfError),

    #[error("ARM EXIDX unwinding failed: {0}")]
    Exidx(#[from] ExidxError),

    #[error("The object is not valid")]
    InvalidObject,
}

impl From<MemoryError> for StepError {
    fn from(e: MemoryError) -> Self {
        StepError::MemoryInvalid(e.addr)
    }
}

impl StepError {
    pub fn error_data(&self) -> ErrorData {
        match *self {
            StepError::MemoryInvalid(addr) => ErrorData::new(ErrorCode::MemoryInvalid, addr),
            StepError::NoUnwindInfo => ErrorData::new(ErrorCode::UnwindInfo, 0),
            StepError::Dwarf(e) => e.error_data(),
            StepError::Exidx(e) => e.error_data(),
            StepError::InvalidObject => ErrorData::new(ErrorCode::InvalidElf, 0),
        }
    }
}

/// Errors from setting up an unwind: parsing maps, attaching to a thread,
/// picking an architecture.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Could not parse maps: {0}")]
    Maps(#[from] MapsError),

    #[error("Thread {0} does not exist")]
    ThreadDoesNotExist(i32),

    #[error("Timed out waiting for thread {0}")]
    ThreadTimeout(i32),

    #[error("ptrace call failed with errno {0}")]
    Ptrace(i32),

    #[error("System call failed with errno {0}")]
    SystemCall(i32),

    #[error("Unsupported architecture")]
    BadArch,

    #[error("Invalid parameter: {0}")]
    InvalidParameter(&'static str),
}

impl Error {
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Maps(_) => ErrorCode::MapsParseFailed,
            Error::ThreadDoesNotExist(_) => ErrorCode::ThreadDoesNotExist,
            Error::ThreadTimeout(_) => ErrorCode::ThreadTimeout,
            Error::Ptrace(_) => ErrorCode::PtraceCall,
            Error::SystemCall(_) => ErrorCode::SystemCall,
            Error::BadArch => ErrorCode::BadArch,
            Error::InvalidParameter(_) => ErrorCode::InvalidParameter,
        }
    }
}
