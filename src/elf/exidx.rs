//! ARM exception index tables (`.ARM.exidx` / `.ARM.extab`).

use crate::arcdata::ArcData;
use crate::error::{ErrorCode, ErrorData, MemoryError};
use crate::memory::Memory;
use crate::regs::{arm, Regs};

const OP_FINISH: u8 = 0xb0;

/// The most extra 32-bit words of unwind opcodes an entry may carry.
const MAX_TABLE_WORDS: usize = 5;

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExidxError {
    #[error("No EXIDX entry covers the address")]
    NoEntry,

    #[error("Could not read memory at 0x{0:x}")]
    ReadFailed(u64),

    #[error("Entry is not aligned")]
    InvalidAlignment,

    #[error("Unsupported personality routine")]
    InvalidPersonality,

    #[error("Malformed unwind data")]
    Malformed,

    #[error("Unwind data ended before the finish opcode")]
    Truncated,

    #[error("Reserved opcode 0x{0:02x}")]
    Reserved(u8),

    #[error("Spare opcode 0x{0:02x}")]
    Spare(u8),
}

impl From<MemoryError> for ExidxError {
    fn from(e: MemoryError) -> Self {
        ExidxError::ReadFailed(e.addr)
    }
}

impl ExidxError {
    pub fn error_data(&self) -> ErrorData {
        match *self {
            ExidxError::ReadFailed(addr) => ErrorData::new(ErrorCode::MemoryInvalid, addr),
            _ => ErrorData::new(ErrorCode::UnwindInfo, 0),
        }
    }
}

/// Sign-extends a 31-bit place-relative offset.
fn prel31(word: u32) -> u64 {
    (((word << 1) as i32) >> 1) as i64 as u64
}

/// The index table of one object. Entries are addressed by file offset in
/// `object`; `bias` converts a file offset into a vaddr.
pub struct Exidx {
    object: ArcData,
    table_offset: u64,
    entry_count: u64,
    bias: u64,
}

impl Exidx {
    pub fn new(object: ArcData, table_offset: u64, table_size: u64, bias: u64) -> Self {
        Self {
            object,
            table_offset,
            entry_count: table_size / 8,
            bias,
        }
    }

    pub fn entry_count(&self) -> u64 {
        self.entry_count
    }

    fn entry_vaddr(&self, index: u64) -> u64 {
        (self.table_offset + index * 8).wrapping_add(self.bias) & 0xffff_ffff
    }

    fn function_address(&self, index: u64) -> Result<u64, ExidxError> {
        let word = self.object.read_u32(self.table_offset + index * 8)?;
        Ok(self.entry_vaddr(index).wrapping_add(prel31(word)) & 0xffff_ffff)
    }

    /// The index of the last entry whose function starts at or before `pc`.
    pub fn find_entry(&self, pc: u64) -> Result<u64, ExidxError> {
        if self.entry_count == 0 {
            return Err(ExidxError::NoEntry);
        }
        let mut first = 0;
        let mut last = self.entry_count;
        while first < last {
            let current = (first + last) / 2;
            let addr = self.function_address(current)?;
            if pc == addr {
                return Ok(current);
            }
            if pc < addr {
                last = current;
            } else {
                first = current + 1;
            }
        }
        if last != 0 {
            Ok(last - 1)
        } else {
            Err(ExidxError::NoEntry)
        }
    }

    /// The unwind opcodes of an entry, ending in a finish opcode. `None`
    /// means the entry is marked as not unwindable.
    fn entry_data(&self, index: u64) -> Result<Option<Vec<u8>>, ExidxError> {
        let entry_offset = self.table_offset + index * 8;
        if entry_offset & 1 != 0 {
            return Err(ExidxError::InvalidAlignment);
        }
        let word = self.object.read_u32(entry_offset + 4)?;
        if word == 1 {
            return Ok(None);
        }

        let mut data = Vec::with_capacity(8);
        if word & 0x8000_0000 != 0 {
            // Inline compact model; only personality 0 fits here.
            if (word >> 24) & 0xf != 0 {
                return Err(ExidxError::InvalidPersonality);
            }
            data.extend_from_slice(&[(word >> 16) as u8, (word >> 8) as u8, word as u8]);
            if data[2] != OP_FINISH {
                data.push(OP_FINISH);
            }
            return Ok(Some(data));
        }

        let extab_vaddr = self
            .entry_vaddr(index)
            .wrapping_add(4)
            .wrapping_add(prel31(word))
            & 0xffff_ffff;
        let mut offset = extab_vaddr.wrapping_sub(self.bias);
        let word = self.object.read_u32(offset)?;
        let table_words;
        if word & 0x8000_0000 != 0 {
            match (word >> 24) & 0xf {
                0 => {
                    table_words = 0;
                    data.push((word >> 16) as u8);
                }
                1 | 2 => {
                    table_words = ((word >> 16) & 0xff) as usize;
                    offset += 4;
                }
                _ => return Err(ExidxError::InvalidPersonality),
            }
            data.extend_from_slice(&[(word >> 8) as u8, word as u8]);
        } else {
            // Generic model: skip the personality routine's address.
            offset += 4;
            let word = self.object.read_u32(offset)?;
            table_words = (word >> 24) as usize;
            data.extend_from_slice(&[(word >> 16) as u8, (word >> 8) as u8, word as u8]);
            offset += 4;
        }
        if table_words > MAX_TABLE_WORDS {
            return Err(ExidxError::Malformed);
        }
        for _ in 0..table_words {
            let word = self.object.read_u32(offset)?;
            data.extend_from_slice(&word.to_be_bytes());
            offset += 4;
        }
        if data.last() != Some(&OP_FINISH) {
            data.push(OP_FINISH);
        }
        Ok(Some(data))
    }

    /// Unwinds one frame for `pc`, a vaddr. Returns whether the unwind is
    /// finished.
    pub fn step(
        &self,
        pc: u64,
        regs: &mut Regs,
        process_memory: &dyn Memory,
    ) -> Result<bool, ExidxError> {
        let index = self.find_entry(pc)?;
        let Some(data) = self.entry_data(index)? else {
            return Ok(true);
        };
        let mut decoder = Decoder::new(&data, regs, process_memory);
        match decoder.run()? {
            Outcome::Finished => {}
            Outcome::RefuseToUnwind => return Ok(true),
        }
        let cfa = decoder.cfa;
        let pc_set = decoder.pc_set;
        if !pc_set {
            let lr = regs.reg(arm::LR).unwrap_or(0);
            regs.set_reg(arm::PC, lr);
        }
        regs.set_reg(arm::SP, u64::from(cfa));
        Ok(regs.pc() == 0)
    }
}

enum Outcome {
    Finished,
    RefuseToUnwind,
}

/// Interprets EHABI unwind opcodes against an ARM register file. The
/// virtual stack pointer starts at `sp`.
struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
    regs: &'a mut Regs,
    memory: &'a dyn Memory,
    cfa: u32,
    pc_set: bool,
}

impl<'a> Decoder<'a> {
    fn new(data: &'a [u8], regs: &'a mut Regs, memory: &'a dyn Memory) -> Self {
        let cfa = regs.sp() as u32;
        Self {
            data,
            pos: 0,
            regs,
            memory,
            cfa,
            pc_set: false,
        }
    }

    fn next_byte(&mut self) -> Result<u8, ExidxError> {
        let byte = *self.data.get(self.pos).ok_or(ExidxError::Truncated)?;
        self.pos += 1;
        Ok(byte)
    }

    fn pop(&mut self, reg: usize) -> Result<(), ExidxError> {
        let value = self.memory.read_u32(u64::from(self.cfa))?;
        self.regs.set_reg(reg, u64::from(value));
        self.cfa = self.cfa.wrapping_add(4);
        Ok(())
    }

    fn run(&mut self) -> Result<Outcome, ExidxError> {
        loop {
            let byte = self.next_byte()?;
            match byte >> 6 {
                // 00xxxxxx: vsp = vsp + (xxxxxx << 2) + 4
                0 => self.cfa = self.cfa.wrapping_add((u32::from(byte & 0x3f) << 2) + 4),
                // 01xxxxxx: vsp = vsp - (xxxxxx << 2) - 4
                1 => self.cfa = self.cfa.wrapping_sub((u32::from(byte & 0x3f) << 2) + 4),
                2 => {
                    if let Some(outcome) = self.decode_10(byte)? {
                        return Ok(outcome);
                    }
                }
                _ => self.decode_11(byte)?,
            }
        }
    }

    fn decode_10(&mut self, byte: u8) -> Result<Option<Outcome>, ExidxError> {
        match (byte >> 4) & 0x3 {
            0 => {
                // 1000iiii iiiiiiii: pop up to 12 registers under mask {r15-r4}
                let byte2 = self.next_byte()?;
                let mask = (u16::from(byte & 0xf) << 8) | u16::from(byte2);
                if mask == 0 {
                    return Ok(Some(Outcome::RefuseToUnwind));
                }
                let registers = u32::from(mask) << 4;
                for reg in 4..16 {
                    if registers & (1 << reg) != 0 {
                        self.pop(reg)?;
                    }
                }
                if registers & (1 << arm::SP) != 0 {
                    self.cfa = self.regs.sp() as u32;
                }
                if registers & (1 << arm::PC) != 0 {
                    self.pc_set = true;
                }
            }
            1 => {
                // 1001nnnn: vsp = r[nnnn]
                let reg = usize::from(byte & 0xf);
                if reg == arm::SP || reg == arm::PC {
                    return Err(ExidxError::Reserved(byte));
                }
                self.cfa = self.regs.reg(reg).unwrap_or(0) as u32;
            }
            2 => {
                // 10100nnn: pop r4-r[4+nnn], 10101nnn: and r14
                for reg in 4..=4 + usize::from(byte & 0x7) {
                    self.pop(reg)?;
                }
                if byte & 0x8 != 0 {
                    self.pop(arm::LR)?;
                }
            }
            _ => return self.decode_1011(byte),
        }
        Ok(None)
    }

    fn decode_1011(&mut self, byte: u8) -> Result<Option<Outcome>, ExidxError> {
        match byte & 0xf {
            0 => return Ok(Some(Outcome::Finished)),
            1 => {
                // 10110001 0000iiii: pop integer registers under mask {r3-r0}
                let byte2 = self.next_byte()?;
                if byte2 == 0 || byte2 & 0xf0 != 0 {
                    return Err(ExidxError::Spare(byte2));
                }
                for reg in 0..4 {
                    if byte2 & (1 << reg) != 0 {
                        self.pop(reg)?;
                    }
                }
            }
            2 => {
                // 10110010 uleb128: vsp = vsp + 0x204 + (uleb128 << 2)
                let mut result: u32 = 0;
                let mut shift = 0;
                loop {
                    let byte = self.next_byte()?;
                    if shift < 32 {
                        result |= u32::from(byte & 0x7f) << shift;
                    }
                    shift += 7;
                    if byte & 0x80 == 0 {
                        break;
                    }
                }
                self.cfa = self
                    .cfa
                    .wrapping_add(0x204)
                    .wrapping_add(result.wrapping_shl(2));
            }
            3 => {
                // 10110011 sssscccc: pop VFP D[ssss]-D[ssss+cccc] saved by FSTMFDX
                let byte2 = self.next_byte()?;
                self.cfa = self.cfa.wrapping_add(u32::from(byte2 & 0xf) * 8 + 12);
            }
            4..=7 => return Err(ExidxError::Spare(byte)),
            _ => {
                // 10111nnn: pop VFP D[8]-D[8+nnn] saved by FSTMFDX
                self.cfa = self.cfa.wrapping_add(u32::from(byte & 0x7) * 8 + 12);
            }
        }
        Ok(None)
    }

    fn decode_11(&mut self, byte: u8) -> Result<(), ExidxError> {
        let n = u32::from(byte & 0x7);
        match (byte >> 3) & 0x7 {
            0 => match n {
                6 => {
                    // 11000110 sssscccc: pop wR[ssss]-wR[ssss+cccc]
                    let byte2 = self.next_byte()?;
                    self.cfa = self.cfa.wrapping_add(u32::from(byte2 & 0xf) * 8 + 8);
                }
                7 => {
                    // 11000111 0000iiii: pop wCGR registers under mask
                    let byte2 = self.next_byte()?;
                    if byte2 == 0 || byte2 & 0xf0 != 0 {
                        return Err(ExidxError::Spare(byte2));
                    }
                    self.cfa = self.cfa.wrapping_add(byte2.count_ones() * 4);
                }
                // 11000nnn: pop wR[10]-wR[10+nnn]
                _ => self.cfa = self.cfa.wrapping_add(n * 8 + 8),
            },
            1 => match n {
                // 11001000 / 11001001 sssscccc: pop VFP registers saved by VPUSH
                0 | 1 => {
                    let byte2 = self.next_byte()?;
                    self.cfa = self.cfa.wrapping_add(u32::from(byte2 & 0xf) * 8 + 8);
                }
                _ => return Err(ExidxError::Spare(byte)),
            },
            // 11010nnn: pop VFP D[8]-D[8+nnn] saved by VPUSH
            2 => self.cfa = self.cfa.wrapping_add(n * 8 + 8),
            _ => return Err(ExidxError::Spare(byte)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::arch::Arch;
    use crate::memory::MemorySnapshot;

    fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
        bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn prel31_to(from: u32, to: u32) -> u32 {
        to.wrapping_sub(from) & 0x7fff_ffff
    }

    /// Table at 0x100 with three entries:
    /// 0x1000 inline "vsp += 16; pop {r4, r14}", 0x2000 cannot unwind,
    /// 0x3000 generic extab entry "vsp = r7; pop {r4, r14}".
    fn exidx() -> Exidx {
        let mut bytes = vec![0u8; 0x300];
        put_u32(&mut bytes, 0x100, prel31_to(0x100, 0x1000));
        put_u32(&mut bytes, 0x104, 0x8003_a8b0);
        put_u32(&mut bytes, 0x108, prel31_to(0x108, 0x2000));
        put_u32(&mut bytes, 0x10c, 1);
        put_u32(&mut bytes, 0x110, prel31_to(0x110, 0x3000));
        put_u32(&mut bytes, 0x114, prel31_to(0x114, 0x200));
        put_u32(&mut bytes, 0x200, 0x0000_1234);
        put_u32(&mut bytes, 0x204, 0x0097_a8b0);
        Exidx::new(ArcData::from_vec(bytes), 0x100, 0x18, 0)
    }

    fn regs(sp: u64) -> Regs {
        let mut regs = Regs::new(Arch::Arm).unwrap();
        regs.set_sp(sp);
        regs
    }

    #[test]
    fn find_entry_brackets() {
        let exidx = exidx();
        assert_eq!(exidx.find_entry(0xfff), Err(ExidxError::NoEntry));
        assert_eq!(exidx.find_entry(0x1000), Ok(0));
        assert_eq!(exidx.find_entry(0x1fff), Ok(0));
        assert_eq!(exidx.find_entry(0x2000), Ok(1));
        assert_eq!(exidx.find_entry(0x9000), Ok(2));
    }

    #[test]
    fn inline_compact_entry() {
        let memory = MemorySnapshot::new();
        memory.set_u32(0x8010, 0x44);
        memory.set_u32(0x8014, 0x2222);
        let mut regs = regs(0x8000);
        let finished = exidx().step(0x1004, &mut regs, &memory).unwrap();
        assert!(!finished);
        assert_eq!(regs.reg(4), Some(0x44));
        assert_eq!(regs.reg(arm::LR), Some(0x2222));
        assert_eq!(regs.pc(), 0x2222);
        assert_eq!(regs.sp(), 0x8018);
    }

    #[test]
    fn cant_unwind_finishes() {
        let memory = MemorySnapshot::new();
        let mut regs = regs(0x8000);
        assert_eq!(exidx().step(0x2004, &mut regs, &memory), Ok(true));
    }

    #[test]
    fn generic_extab_entry() {
        let memory = MemorySnapshot::new();
        memory.set_u32(0x9000, 0x55);
        memory.set_u32(0x9004, 0x1111);
        let mut regs = regs(0x8000);
        regs.set_reg(7, 0x9000);
        let finished = exidx().step(0x3010, &mut regs, &memory).unwrap();
        assert!(!finished);
        assert_eq!(regs.reg(4), Some(0x55));
        assert_eq!(regs.pc(), 0x1111);
        assert_eq!(regs.sp(), 0x9008);
    }

    #[test]
    fn stack_read_failure_reports_the_address() {
        let memory = MemorySnapshot::new();
        let mut regs = regs(0x8000);
        let err = exidx().step(0x1004, &mut regs, &memory).unwrap_err();
        assert_eq!(err, ExidxError::ReadFailed(0x8010));
        assert_eq!(err.error_data().code, ErrorCode::MemoryInvalid);
    }

    fn decode(ops: &[u8], regs: &mut Regs) -> Result<(u32, bool), ExidxError> {
        let memory = MemorySnapshot::new();
        memory.set_u32(0x8000, 0x1000);
        memory.set_u32(0x8004, 0x7000);
        let mut decoder = Decoder::new(ops, regs, &memory);
        match decoder.run()? {
            Outcome::Finished => Ok((decoder.cfa, false)),
            Outcome::RefuseToUnwind => Ok((decoder.cfa, true)),
        }
    }

    #[test]
    fn opcodes() {
        let mut r = regs(0x8000);
        assert_eq!(decode(&[0x80, 0x00], &mut r), Ok((0x8000, true)));
        assert_eq!(decode(&[0x41, 0xb0], &mut r), Ok((0x8000 - 8, false)));
        assert_eq!(decode(&[0xb2, 0x01, 0xb0], &mut r), Ok((0x8208, false)));
        assert_eq!(decode(&[0xc9, 0x12, 0xb0], &mut r), Ok((0x8018, false)));
        assert_eq!(decode(&[0xb9, 0xb0], &mut r), Ok((0x8014, false)));
        assert_eq!(decode(&[0xc7, 0x05, 0xb0], &mut r), Ok((0x8008, false)));
        assert_eq!(decode(&[0x9d], &mut r), Err(ExidxError::Reserved(0x9d)));
        assert_eq!(decode(&[0xb1, 0x00], &mut r), Err(ExidxError::Spare(0x00)));
        assert_eq!(decode(&[0xb4], &mut r), Err(ExidxError::Spare(0xb4)));
        assert_eq!(decode(&[0x01], &mut r), Err(ExidxError::Truncated));
    }

    #[test]
    fn popping_sp_moves_the_virtual_sp() {
        // pop {r4, sp}: r4 = [0x8000], sp = [0x8004]
        let mut r = regs(0x8000);
        assert_eq!(decode(&[0xa0 | 0x0, 0xb0], &mut r), Ok((0x8004, false)));
        let mut r = regs(0x8000);
        assert_eq!(decode(&[0x82, 0x01, 0xb0], &mut r), Ok((0x7000, false)));
        assert_eq!(r.reg(4), Some(0x1000));
    }
}
