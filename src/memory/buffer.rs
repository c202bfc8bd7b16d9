use crate::arcdata::ArcData;

use super::Memory;

/// An owned byte buffer addressed from zero.
#[derive(Debug, Default, Clone)]
pub struct MemoryBuffer {
    data: Vec<u8>,
}

impl MemoryBuffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

fn read_from_slice(data: &[u8], addr: u64, dst: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(addr) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = dst.len().min(data.len() - start);
    dst[..n].copy_from_slice(&data[start..start + n]);
    n
}

impl Memory for MemoryBuffer {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        read_from_slice(&self.data, addr, dst)
    }
}

impl Memory for ArcData {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        read_from_slice(self, addr, dst)
    }
}
