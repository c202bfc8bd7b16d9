use std::collections::HashMap;

use parking_lot::RwLock;

use super::Memory;

/// A sparse, byte-granular memory image. Only the bytes that were set are
/// readable.
///
/// This is how recorded stack and data snapshots are replayed. Writes go
/// through `&self`, so a snapshot shared with an unwinder can still be
/// mutated, for example to model a producer thread.
#[derive(Default)]
pub struct MemorySnapshot {
    bytes: RwLock<HashMap<u64, u8>>,
}

impl MemorySnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_memory(&self, addr: u64, data: &[u8]) {
        let mut bytes = self.bytes.write();
        for (i, b) in data.iter().enumerate() {
            bytes.insert(addr.wrapping_add(i as u64), *b);
        }
    }

    pub fn set_memory_block(&self, addr: u64, len: u64, value: u8) {
        let mut bytes = self.bytes.write();
        for i in 0..len {
            bytes.insert(addr.wrapping_add(i), value);
        }
    }

    pub fn set_u8(&self, addr: u64, value: u8) {
        self.set_memory(addr, &[value]);
    }

    pub fn set_u16(&self, addr: u64, value: u16) {
        self.set_memory(addr, &value.to_le_bytes());
    }

    pub fn set_u32(&self, addr: u64, value: u32) {
        self.set_memory(addr, &value.to_le_bytes());
    }

    pub fn set_u64(&self, addr: u64, value: u64) {
        self.set_memory(addr, &value.to_le_bytes());
    }

    /// Writes a NUL-terminated string.
    pub fn set_string(&self, addr: u64, s: &str) {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        self.set_memory(addr, &data);
    }

    pub fn clear_memory(&self, addr: u64, len: u64) {
        let mut bytes = self.bytes.write();
        for i in 0..len {
            bytes.remove(&addr.wrapping_add(i));
        }
    }

    pub fn clear_all(&self) {
        self.bytes.write().clear();
    }
}

impl Memory for MemorySnapshot {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let bytes = self.bytes.read();
        for (i, out) in dst.iter_mut().enumerate() {
            match bytes.get(&addr.wrapping_add(i as u64)) {
                Some(b) => *out = *b,
                None => return i,
            }
        }
        dst.len()
    }
}
