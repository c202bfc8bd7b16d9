//! Byte-addressable views of a process, a file or a buffer.
//!
//! Everything the unwinder reads goes through [`Memory`]. The single required
//! method is [`Memory::read`], which copies as many bytes as are available
//! starting at an address. The fixed-size helpers are built on top of it and
//! fail when any byte is missing.

mod buffer;
mod cache;
mod file;
mod range;
mod remote;
mod snapshot;

use std::sync::Arc;

pub use buffer::MemoryBuffer;
pub use cache::{MemoryCache, MemoryThreadCache};
pub use file::MemoryFileAtOffset;
pub use range::{MemoryRange, MemoryRanges};
pub use remote::{MemoryProcFile, MemoryRemote};
pub use snapshot::MemorySnapshot;

use crate::arch::Arch;
use crate::error::MemoryError;

pub trait Memory: Send + Sync {
    /// Copies bytes starting at `addr` into `dst` and returns how many bytes
    /// were copied. A short count means the bytes after it are unreadable.
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize;

    /// Drops any cached data.
    fn clear(&self) {}

    /// For caching wrappers, the memory that bypasses the cache.
    fn uncached(&self) -> Option<Arc<dyn Memory>> {
        None
    }

    fn read_fully(&self, addr: u64, dst: &mut [u8]) -> Result<(), MemoryError> {
        let n = self.read(addr, dst);
        if n == dst.len() {
            Ok(())
        } else {
            Err(MemoryError {
                addr: addr.wrapping_add(n as u64),
            })
        }
    }

    fn read_u8(&self, addr: u64) -> Result<u8, MemoryError> {
        let mut buf = [0; 1];
        self.read_fully(addr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0; 2];
        self.read_fully(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0; 4];
        self.read_fully(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0; 8];
        self.read_fully(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Reads a pointer-sized value for `arch`, zero-extended.
    fn read_address(&self, addr: u64, arch: Arch) -> Result<u64, MemoryError> {
        if arch.is_64bit() {
            self.read_u64(addr)
        } else {
            self.read_u32(addr).map(u64::from)
        }
    }

    /// Reads a NUL-terminated string of at most `max_len` bytes (NUL excluded).
    fn read_string(&self, addr: u64, max_len: u64) -> Result<String, MemoryError> {
        let mut bytes = Vec::new();
        let mut buf = [0u8; 256];
        let mut offset = 0u64;
        while offset <= max_len {
            let want = (max_len - offset + 1).min(buf.len() as u64) as usize;
            let cur = addr.wrapping_add(offset);
            let n = self.read(cur, &mut buf[..want]);
            if n == 0 {
                return Err(MemoryError { addr: cur });
            }
            if let Some(nul) = buf[..n].iter().position(|&b| b == 0) {
                bytes.extend_from_slice(&buf[..nul]);
                return Ok(String::from_utf8_lossy(&bytes).into_owned());
            }
            bytes.extend_from_slice(&buf[..n]);
            offset += n as u64;
        }
        Err(MemoryError {
            addr: addr.wrapping_add(max_len),
        })
    }
}

impl<M: Memory + ?Sized> Memory for Arc<M> {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        (**self).read(addr, dst)
    }

    fn clear(&self) {
        (**self).clear()
    }

    fn uncached(&self) -> Option<Arc<dyn Memory>> {
        (**self).uncached()
    }
}

/// The largest buffer [`read_to_vec`] fills. Sizes copied out of another
/// process come from that process and cannot be trusted.
pub const MAX_COPY_SIZE: u64 = 64 * 1024 * 1024;

/// Copies `len` bytes at `addr` into a new vector. Unreadable bytes stop the
/// copy; the returned vector holds what was read. `None` if `len` is over
/// [`MAX_COPY_SIZE`] or the buffer cannot be allocated.
pub(crate) fn read_to_vec(memory: &dyn Memory, addr: u64, len: u64) -> Option<Vec<u8>> {
    if len > MAX_COPY_SIZE {
        return None;
    }
    let len = usize::try_from(len).ok()?;
    let mut vec = Vec::new();
    vec.try_reserve_exact(len).ok()?;
    vec.resize(len, 0);
    let n = memory.read(addr, &mut vec);
    vec.truncate(n);
    Some(vec)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fixed_size_reads() {
        let memory = MemoryBuffer::new(vec![1, 2, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(memory.read_u8(0), Ok(1));
        assert_eq!(memory.read_u16(0), Ok(0x0201));
        assert_eq!(memory.read_u32(1), Ok(0x0504_0302));
        assert_eq!(memory.read_u64(1), Ok(0x0908_0706_0504_0302));
        assert_eq!(memory.read_u64(2), Err(MemoryError { addr: 9 }));
        assert_eq!(memory.read_address(0, Arch::Arm), Ok(0x0403_0201));
    }

    #[test]
    fn strings() {
        let mut data = b"short\0".to_vec();
        data.extend(std::iter::repeat(b'a').take(600));
        data.push(0);
        let memory = MemoryBuffer::new(data);
        assert_eq!(memory.read_string(0, 100).unwrap(), "short");
        assert_eq!(memory.read_string(2, 3).unwrap(), "ort");
        assert!(memory.read_string(0, 4).is_err());
        let long = memory.read_string(6, 1000).unwrap();
        assert_eq!(long.len(), 600);
        assert!(memory.read_string(6, 599).is_err());
        // Runs off the end of the buffer without a terminator.
        assert!(MemoryBuffer::new(b"abc".to_vec()).read_string(0, 10).is_err());
    }

    #[test]
    fn copies_are_bounded() {
        let memory = MemoryBuffer::new(vec![7; 16]);
        assert_eq!(read_to_vec(&memory, 4, 8), Some(vec![7; 8]));
        // Short reads keep what was readable.
        assert_eq!(read_to_vec(&memory, 12, 8), Some(vec![7; 4]));
        assert_eq!(read_to_vec(&memory, 0, MAX_COPY_SIZE + 1), None);
        assert_eq!(read_to_vec(&memory, 0, u64::MAX), None);
    }
}
