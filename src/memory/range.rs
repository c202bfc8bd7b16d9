use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;

use super::Memory;

/// A window onto another memory. Address `offset + i` of the window reads
/// address `begin + i` of the underlying memory, for `i < length`.
#[derive(Clone)]
pub struct MemoryRange {
    memory: Arc<dyn Memory>,
    begin: u64,
    length: u64,
    offset: u64,
}

impl MemoryRange {
    pub fn new(memory: Arc<dyn Memory>, begin: u64, length: u64, offset: u64) -> Self {
        Self {
            memory,
            begin,
            length,
            offset,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> u64 {
        self.length
    }

    /// One past the last window address, saturating.
    pub fn end_offset(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

impl Memory for MemoryRange {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        if addr < self.offset {
            return 0;
        }
        let read_offset = addr - self.offset;
        if read_offset >= self.length {
            return 0;
        }
        let n = (dst.len() as u64).min(self.length - read_offset) as usize;
        let Some(read_addr) = self.begin.checked_add(read_offset) else {
            return 0;
        };
        self.memory.read(read_addr, &mut dst[..n])
    }
}

/// A set of non-overlapping [`MemoryRange`]s keyed by their end offset.
#[derive(Clone, Default)]
pub struct MemoryRanges {
    ranges: BTreeMap<u64, MemoryRange>,
}

impl MemoryRanges {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a range. Returns false if a range with the same end already exists.
    pub fn insert(&mut self, range: MemoryRange) -> bool {
        let end = range.end_offset();
        if self.ranges.contains_key(&end) {
            return false;
        }
        self.ranges.insert(end, range);
        true
    }
}

impl Memory for MemoryRanges {
    fn read(&self, addr: u64, dst: &mut [u8]) -> usize {
        let mut total = 0;
        while total < dst.len() {
            let cur = addr.wrapping_add(total as u64);
            let Some((_, range)) = self
                .ranges
                .range((Bound::Excluded(cur), Bound::Unbounded))
                .next()
            else {
                break;
            };
            let n = range.read(cur, &mut dst[total..]);
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }
}
