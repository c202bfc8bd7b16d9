use gimli::{Encoding, EvaluationResult, Expression, Location, Value};

use super::DwarfError;
use crate::arcdata::ArcDataReader;
use crate::arch::Arch;
use crate::memory::Memory;
use crate::regs::{arm64, Regs};

/// Where the caller's value of one register can be found.
#[derive(Debug, Clone)]
pub enum RegisterLocation {
    Undefined,
    Same,
    /// Saved at `CFA + n`.
    Offset(i64),
    /// The value is `CFA + n`.
    ValOffset(i64),
    /// Held in another register.
    Register(u16),
    /// Saved at the address computed by the expression, with the CFA pushed
    /// first.
    Expression(Expression<ArcDataReader>),
    /// The value is the result of the expression, with the CFA pushed first.
    ValExpression(Expression<ArcDataReader>),
}

#[derive(Debug, Clone)]
pub enum CfaLocation {
    RegisterOffset { register: u16, offset: i64 },
    Expression(Expression<ArcDataReader>),
}

/// One row of the CFI table: the rules that hold for `[start, end)`.
#[derive(Debug, Clone)]
pub struct LocationRow {
    pub start: u64,
    pub end: u64,
    pub cfa: CfaLocation,
    pub registers: Vec<(u16, RegisterLocation)>,
    pub return_address_register: u16,
    /// The CIE carries the `S` augmentation.
    pub signal_frame: bool,
    pub encoding: Encoding,
}

impl LocationRow {
    pub fn contains(&self, pc: u64) -> bool {
        self.start <= pc && pc < self.end
    }

    /// Rewrites `regs` to the caller's registers. Every rule reads the
    /// callee's registers as they were on entry. Returns whether the unwind
    /// is finished.
    pub fn apply(&self, regs: &mut Regs, memory: &dyn Memory) -> Result<bool, DwarfError> {
        let arch = regs.arch();
        let mask = address_mask(arch);
        let callee = regs.clone();
        let get = |r: u16| {
            callee
                .reg(usize::from(r))
                .ok_or(DwarfError::IllegalRegister(r))
        };

        let cfa = match &self.cfa {
            CfaLocation::RegisterOffset { register, offset } => {
                get(*register)?.wrapping_add(*offset as u64)
            }
            CfaLocation::Expression(expr) => {
                evaluate(expr.clone(), self.encoding, None, &callee, memory)?
            }
        } & mask;

        let mut return_address_undefined = false;
        let mut return_address_signed = false;
        for (register, location) in &self.registers {
            let register = *register;
            if arch == Arch::Arm64 && register == arm64::RA_SIGN_STATE {
                if !matches!(location, RegisterLocation::Undefined | RegisterLocation::Same) {
                    return_address_signed = true;
                }
                continue;
            }
            if usize::from(register) >= regs.num_regs() {
                continue;
            }
            let value = match location {
                RegisterLocation::Undefined => {
                    if register == self.return_address_register {
                        return_address_undefined = true;
                    }
                    continue;
                }
                RegisterLocation::Same => continue,
                RegisterLocation::Offset(offset) => {
                    memory.read_address(cfa.wrapping_add(*offset as u64) & mask, arch)?
                }
                RegisterLocation::ValOffset(offset) => cfa.wrapping_add(*offset as u64),
                RegisterLocation::Register(other) => get(*other)?,
                RegisterLocation::Expression(expr) => {
                    let addr = evaluate(expr.clone(), self.encoding, Some(cfa), &callee, memory)?;
                    memory.read_address(addr & mask, arch)?
                }
                RegisterLocation::ValExpression(expr) => {
                    evaluate(expr.clone(), self.encoding, Some(cfa), &callee, memory)?
                }
            };
            regs.set_reg(usize::from(register), value);
        }

        let mut pc = if return_address_undefined {
            0
        } else {
            regs.reg(usize::from(self.return_address_register))
                .ok_or(DwarfError::IllegalRegister(self.return_address_register))?
        };
        if return_address_signed {
            pc = arm64::strip_ptr_auth(pc);
        }
        regs.set_pc(pc);
        regs.set_sp(cfa);

        // A signal frame with a zero pc is resumed from the return address.
        Ok(pc == 0 && !self.signal_frame)
    }
}

fn address_mask(arch: Arch) -> u64 {
    if arch.is_64bit() {
        u64::MAX
    } else {
        0xffff_ffff
    }
}

/// Runs a DWARF expression against the callee's registers. Register and
/// memory requests are answered from `regs` and `memory`; anything else the
/// expression asks for is unsupported.
pub(crate) fn evaluate(
    expr: Expression<ArcDataReader>,
    encoding: Encoding,
    initial_value: Option<u64>,
    regs: &Regs,
    memory: &dyn Memory,
) -> Result<u64, DwarfError> {
    let mask = address_mask(regs.arch());
    let mut eval = expr.evaluation(encoding);
    if let Some(value) = initial_value {
        eval.set_initial_value(value);
    }
    let mut result = eval.evaluate().map_err(DwarfError::Expression)?;
    loop {
        result = match result {
            EvaluationResult::Complete => break,
            EvaluationResult::RequiresRegister { register, .. } => {
                let value = regs
                    .reg(usize::from(register.0))
                    .ok_or(DwarfError::IllegalRegister(register.0))?;
                eval.resume_with_register(Value::Generic(value))
                    .map_err(DwarfError::Expression)?
            }
            EvaluationResult::RequiresMemory { address, size, .. } => {
                let mut buf = [0u8; 8];
                let size = usize::from(size).min(buf.len());
                memory.read_fully(address & mask, &mut buf[..size])?;
                eval.resume_with_memory(Value::Generic(u64::from_le_bytes(buf)))
                    .map_err(DwarfError::Expression)?
            }
            _ => return Err(DwarfError::Unsupported),
        };
    }
    let piece = eval.as_result().last().ok_or(DwarfError::IllegalState)?;
    match piece.location {
        Location::Address { address } => Ok(address & mask),
        Location::Value { value } => value.to_u64(mask).map_err(DwarfError::Expression),
        // An expression naming a register rather than computing a value.
        _ => Err(DwarfError::Unsupported),
    }
}
