//! ISA descriptor tables (spec §4.4) and the shared encoder contract
//! (spec §4.5) every target instruction set implements.

pub mod arm;
pub mod x86;

use crate::error::Result;

/// The five supported target instruction sets (spec §1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Isa {
    X86_64,
    X86_32,
    X86_16,
    Aarch64,
    Armv7,
}

impl Isa {
    #[must_use]
    pub const fn is_64bit(self) -> bool {
        matches!(self, Self::X86_64 | Self::Aarch64)
    }

    /// PE `Machine` field value (spec §4.7).
    #[must_use]
    pub const fn pe_machine(self) -> u16 {
        match self {
            Self::X86_64 => 0x8664,
            Self::X86_32 | Self::X86_16 => 0x014C,
            Self::Aarch64 => 0xAA64,
            Self::Armv7 => 0x01C4,
        }
    }
}

/// The two supported binary containers (spec §1, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    Flat,
    Pe,
}

/// Operand/result width driving register-width selection at lowering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

/// Fixed base address of the emitted linear-memory region (spec §4.3).
/// There is no loader or relocator in this crate (Non-goal: no relocation
/// engine), so every target's prologue loads this single constant into its
/// `memory_base_reg` and every `load`/`store`/`global.get`/`global.set`
/// addresses relative to it. 1 MiB keeps it clear of a typical flat
/// binary's own code/data and out of the null-page guard range.
pub const MEMORY_BASE_ADDRESS: u64 = 0x0010_0000;

/// Per-ISA ABI record (spec §4.4): argument registers, return register,
/// callee-saved set, stack alignment, the virtual-stack register bank, and
/// the memory-base register.
#[derive(Debug, Clone)]
pub struct AbiInfo {
    /// Ordered argument registers, by abstract id (mapped to concrete
    /// encodings by the ISA's `reg_encoding`).
    pub arg_regs: Vec<u8>,
    pub return_reg: u8,
    /// Callee-saved registers available to the prologue/epilogue, in save
    /// order (restored in reverse).
    pub callee_saved: Vec<u8>,
    /// The four-register virtual-stack bank (spec §4.1 "K = 4").
    pub stack_bank: [u8; crate::stack::BANK_SIZE],
    pub memory_base_reg: u8,
    pub frame_pointer_reg: u8,
    pub stack_pointer_reg: u8,
    /// Scratch register free for condition/index computation in
    /// control-flow lowering.
    pub scratch_reg: u8,
    pub stack_alignment: u32,
    /// 8 on 64-bit ISAs, 4 on 16-/32-bit ISAs and ARMv7 (spec §4.1).
    pub slot_width: i32,
}

/// A branch's encodable displacement range (spec §4.4).
#[derive(Debug, Clone, Copy)]
pub struct BranchRange {
    /// Width, in bits, of the encoded displacement field.
    pub field_bits: u32,
    /// Instruction-quantum scaling: displacement is divided by this before
    /// range-checking and encoding (4 on word-scaled ARM encodings, 1
    /// otherwise).
    pub quantum: i64,
    /// Added to the current PC before computing the displacement (ARMv7's
    /// pipeline read-ahead is +8; everything else is 0).
    pub pipeline_offset: i64,
}

impl BranchRange {
    #[must_use]
    pub fn signed_limit(&self) -> i64 {
        1i64 << (self.field_bits - 1)
    }

    /// Compute and range-check the scaled displacement from `pc` (the
    /// address of the branch instruction) to `target`.
    pub fn displacement(&self, pc: i64, target: i64) -> Result<i64> {
        let raw = target - (pc + self.pipeline_offset);
        if raw % self.quantum != 0 {
            return Err(crate::Error::Internal(format!(
                "branch displacement {raw} is not a multiple of the {}-byte instruction quantum",
                self.quantum
            )));
        }
        let scaled = raw / self.quantum;
        let limit = self.signed_limit();
        if scaled < -limit || scaled >= limit {
            return Err(crate::Error::BranchOutOfRange {
                displacement: scaled,
                field_bits: self.field_bits,
            });
        }
        Ok(scaled)
    }
}

/// Map from label identifier to byte offset within the code buffer
/// (spec §3 "Symbol table"). Populated in assembler pass 1, read-only in
/// pass 2.
pub type SymbolTable = std::collections::HashMap<String, u32>;

/// Implemented once per concrete target instruction (`x86::Op`,
/// `arm::Op`): the pure encoder contract of spec §4.5/§4.6.
pub trait Encodable: std::fmt::Debug + Clone {
    /// Pass-1 byte-size estimate. Must equal `encode(..).len()` exactly —
    /// a mismatch is `Error::SizeEstimateMismatch` (spec §4.6).
    fn size_estimate(&self) -> usize;

    /// Pass-2 encoding: mnemonic + operands + current PC + symbol table
    /// → bytes.
    fn encode(&self, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn branch_range_rejects_out_of_range_displacement() {
        let range = BranchRange {
            field_bits: 8,
            quantum: 1,
            pipeline_offset: 0,
        };
        assert!(range.displacement(0, 1000).is_err());
        assert!(range.displacement(0, 100).is_ok());
    }

    #[test]
    fn branch_range_scales_by_quantum() {
        let range = BranchRange {
            field_bits: 24,
            quantum: 4,
            pipeline_offset: 8,
        };
        // ARMv7-style: pc is read-ahead by 8, displacement scaled by 4.
        let d = range.displacement(0, 16).unwrap();
        assert_eq!(d, (16 - 8) / 4);
    }
}
