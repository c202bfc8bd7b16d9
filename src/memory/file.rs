use std::fs::File;
use std::io;
use std::path::Path;

use crate::arcdata::{ArcData, ObjectBytes};

use super::Memory;

/// A read-only mapping of part of a file. Address 0 is the file offset
/// passed to [`MemoryFileAtOffset::open`].
#[derive(Debug, Clone)]
pub struct MemoryFileAtOffset {
    data: ArcData,
}

impl MemoryFileAtOffset {
    /// Maps `[offset, offset + size)` of the file, clipped to the file length.
    /// A `size` of `None` maps to the end of the file.
    pub fn open(path: impl AsRef<Path>, offset: u64, size: Option<u64>) -> io::Result<Self> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        if offset >= file_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset is past the end of the file",
            ));
        }
        let available = file_len - offset;
        let len = size.map_or(available, |size| size.min(available));
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "mapping too large"))?;
        // Safety: the mapping is read-only. Files truncated while mapped are
        // not guarded against.
        let mmap = unsafe {
            memmap2::MmapOptions::new()
                .offset(offset)
                .len(len)
                .map(&file)?
        };
        Ok(Self {
            data: ArcData::new(ObjectBytes::Mapped(mmap)),
        })
    }

    pub fn data(&self) -> &ArcData {
        &self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Memory for MemoryFileAtOffset {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        self.data.read(addr, dst)
    }
}
