use std::fmt::Debug;
use std::ops::{Deref, Range};
use std::sync::Arc;

/// Backing storage for the bytes of one object image.
pub enum ObjectBytes {
    /// A read-only mapping of a file on disk.
    Mapped(memmap2::Mmap),
    /// Bytes copied out of process memory, or decompressed.
    Owned(Vec<u8>),
}

impl Deref for ObjectBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            ObjectBytes::Mapped(mmap) => mmap,
            ObjectBytes::Owned(vec) => vec,
        }
    }
}

pub type ArcDataReader = gimli::EndianReader<gimli::RunTimeEndian, ArcData>;

/// A shared, cheaply clonable view into [`ObjectBytes`].
#[derive(Clone)]
pub struct ArcData {
    bytes: Arc<ObjectBytes>,
    range: Range<usize>,
}

impl ArcData {
    pub fn new(bytes: ObjectBytes) -> Self {
        let len = bytes.len();
        Self {
            bytes: Arc::new(bytes),
            range: 0..len,
        }
    }

    pub fn from_vec(vec: Vec<u8>) -> Self {
        Self::new(ObjectBytes::Owned(vec))
    }

    /// A sub-view of `len` bytes at `offset`, or `None` if out of bounds.
    pub fn slice(&self, offset: u64, len: u64) -> Option<ArcData> {
        let start = self.range.start.checked_add(usize::try_from(offset).ok()?)?;
        let end = start.checked_add(usize::try_from(len).ok()?)?;
        if end > self.range.end {
            return None;
        }
        Some(Self {
            bytes: self.bytes.clone(),
            range: start..end,
        })
    }

    pub fn reader(&self, endian: gimli::RunTimeEndian) -> ArcDataReader {
        gimli::EndianReader::new(self.clone(), endian)
    }
}

impl Deref for ArcData {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.bytes[self.range.clone()]
    }
}

impl Debug for ArcData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArcData")
            .field("ptr", &self.bytes.as_ptr())
            .field("range", &self.range)
            .finish()
    }
}

// Safety: the bytes live in the heap allocation (or mapping) owned by the Arc.
// Moving or cloning ArcData never moves them.
unsafe impl gimli::StableDeref for ArcData {}
unsafe impl gimli::CloneStableDeref for ArcData {}
