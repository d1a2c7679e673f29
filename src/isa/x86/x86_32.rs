//! x86-32 (protected-mode, import-free) target.

use super::{AluOp, Cond, Mem, MemWidth as X86MemWidth, Mode, Op};
use crate::ast::MemWidth;
use crate::error::Result;
use crate::isa::{AbiInfo, Encodable, Isa, SymbolTable, Width as IsaWidth};
use crate::lower::{ArithOp, CmpOp, TargetBackend};

#[derive(Debug, Clone)]
pub struct X86_32Op(pub Op);

impl Encodable for X86_32Op {
    fn size_estimate(&self) -> usize {
        super::size_estimate(&self.0, Mode::X32)
    }

    fn encode(&self, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
        super::encode(&self.0, Mode::X32, pc, symbols)
    }
}

pub const EAX: u8 = 0;
pub const ECX: u8 = 1;
pub const EDX: u8 = 2;
pub const EBX: u8 = 3;
pub const ESP: u8 = 4;
pub const EBP: u8 = 5;
pub const ESI: u8 = 6;
pub const EDI: u8 = 7;

/// Internal fastcall-style convention: first two arguments in ecx/edx
/// (free again by the time the virtual-stack bank needs them, since the
/// prologue copies incoming args straight into their local slots).
#[must_use]
pub fn abi() -> AbiInfo {
    AbiInfo {
        arg_regs: vec![ECX, EDX],
        return_reg: EAX,
        callee_saved: vec![EBX, ESI, EDI],
        stack_bank: [ECX, EDX, EBX, ESI],
        memory_base_reg: EDI,
        frame_pointer_reg: EBP,
        stack_pointer_reg: ESP,
        scratch_reg: EAX,
        stack_alignment: 4,
        slot_width: 4,
    }
}

fn mem_width(width: MemWidth) -> X86MemWidth {
    match width {
        MemWidth::B8 => X86MemWidth::B8,
        MemWidth::B16 => X86MemWidth::B16,
        MemWidth::B32 => X86MemWidth::B32,
        MemWidth::B64 => X86MemWidth::B64,
    }
}

/// Always operates at `Width::W32` — this target has no wider register
/// file, so a WASM `i64` value truncates to 32 bits the same way
/// `x86_16::X86_16Backend` truncates to 16 (documented limitation, see
/// `DESIGN.md`).
const W: super::Width = super::Width::W32;

/// Drives `FunctionLowerer` for the x86-32 target (spec §4.3).
#[derive(Debug, Default)]
pub struct X86_32Backend {
    abi: AbiInfoCell,
}

#[derive(Debug)]
struct AbiInfoCell(AbiInfo);

impl Default for AbiInfoCell {
    fn default() -> Self {
        Self(abi())
    }
}

impl X86_32Backend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TargetBackend for X86_32Backend {
    type Op = X86_32Op;

    fn isa(&self) -> Isa {
        Isa::X86_32
    }

    fn abi(&self) -> &AbiInfo {
        &self.abi.0
    }

    fn bank_reg(&self, bank_index: u8) -> u8 {
        self.abi.0.stack_bank[bank_index as usize]
    }

    fn move_reg(&self, dst: u8, src: u8) -> Self::Op {
        X86_32Op(Op::MovRegReg { width: W, dst, src })
    }

    fn width_for(&self, ty: crate::ast::ValueType) -> IsaWidth {
        let _ = ty;
        IsaWidth::W32
    }

    fn load_const(&self, dst: u8, value: i64, _width: IsaWidth) -> Vec<Self::Op> {
        vec![X86_32Op(Op::MovRegImm { width: W, dst, imm: value })]
    }

    fn alu(&self, op: ArithOp, _width: IsaWidth, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        super::alu_ops(op, W, dst, lhs, rhs).into_iter().map(X86_32Op).collect()
    }

    fn cmp(&self, op: CmpOp, _width: IsaWidth, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        super::cmp_ops(op, W, dst, lhs, rhs).into_iter().map(X86_32Op).collect()
    }

    fn clz(&self, _width: IsaWidth, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![X86_32Op(Op::BitCount { kind: super::BitCountOp::Lzcnt, width: W, dst, src })]
    }

    fn ctz(&self, _width: IsaWidth, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![X86_32Op(Op::BitCount { kind: super::BitCountOp::Tzcnt, width: W, dst, src })]
    }

    fn select(&self, _width: IsaWidth, dst: u8, if_true: u8, if_false: u8, cond: u8) -> Vec<Self::Op> {
        let mut out = vec![Op::Test { width: W, a: cond, b: cond }];
        if dst != if_true {
            out.push(Op::MovRegReg { width: W, dst, src: if_true });
        }
        out.push(Op::Cmov { cond: Cond::Eq, width: W, dst, src: if_false });
        out.into_iter().map(X86_32Op).collect()
    }

    fn load_memory(
        &self,
        dst: u8,
        base: u8,
        offset: i32,
        width: MemWidth,
        signed: bool,
        _dst_width: IsaWidth,
    ) -> Vec<Self::Op> {
        vec![X86_32Op(Op::LoadMem {
            dst,
            width: W,
            mem: Mem { base, disp: offset },
            mem_width: mem_width(width),
            signed,
        })]
    }

    fn store_memory(&self, src: u8, base: u8, offset: i32, width: MemWidth) -> Vec<Self::Op> {
        vec![X86_32Op(Op::StoreMem { src, mem: Mem { base, disp: offset }, mem_width: mem_width(width) })]
    }

    fn jump(&self, label: String) -> Self::Op {
        X86_32Op(Op::Jmp { label })
    }

    fn jump_if_zero(&self, cond_reg: u8, _width: IsaWidth, label: String) -> Vec<Self::Op> {
        vec![
            X86_32Op(Op::Test { width: W, a: cond_reg, b: cond_reg }),
            X86_32Op(Op::Jcc { cond: Cond::Eq, label }),
        ]
    }

    fn jump_if_nonzero(&self, cond_reg: u8, _width: IsaWidth, label: String) -> Vec<Self::Op> {
        vec![
            X86_32Op(Op::Test { width: W, a: cond_reg, b: cond_reg }),
            X86_32Op(Op::Jcc { cond: Cond::Ne, label }),
        ]
    }

    fn jump_table(&self, index_reg: u8, targets: &[String], default: String) -> Vec<Self::Op> {
        super::jump_table_linear_scan(index_reg, W, targets, default)
            .into_iter()
            .map(X86_32Op)
            .collect()
    }

    fn call(&self, label: String) -> Self::Op {
        X86_32Op(Op::Call { label })
    }

    fn call_indirect(&self, reg: u8) -> Self::Op {
        X86_32Op(Op::CallInd { reg })
    }

    fn ret(&self) -> Self::Op {
        X86_32Op(Op::Ret)
    }

    fn trap(&self) -> Self::Op {
        X86_32Op(Op::Trap)
    }

    fn nop(&self) -> Self::Op {
        X86_32Op(Op::Nop)
    }

    fn frame_store_raw(&self, src: u8, fp_offset: i32) -> Self::Op {
        X86_32Op(Op::StoreMem { src, mem: Mem { base: EBP, disp: -fp_offset }, mem_width: X86MemWidth::B32 })
    }

    fn frame_load_raw(&self, dst: u8, fp_offset: i32) -> Self::Op {
        X86_32Op(Op::LoadMem {
            dst,
            width: W,
            mem: Mem { base: EBP, disp: -fp_offset },
            mem_width: X86MemWidth::B32,
            signed: false,
        })
    }

    fn adjust_stack_pointer(&self, delta: i32) -> Vec<Self::Op> {
        vec![X86_32Op(Op::AluRegImm { op: AluOp::Add, width: W, dst: ESP, imm: delta })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SymbolTable;

    #[test]
    fn ret_is_single_byte_c3() {
        let backend = X86_32Backend::new();
        let bytes = backend.ret().0.encode(0, &SymbolTable::new()).unwrap();
        assert_eq!(bytes, vec![0xC3]);
    }

    /// This target is always `Width::W32` regardless of the WASM type
    /// width requested — the documented i64-truncation limitation.
    #[test]
    fn width_for_i64_still_reports_w32() {
        let backend = X86_32Backend::new();
        assert_eq!(backend.width_for(crate::ast::ValueType::I64), IsaWidth::W32);
    }

    #[test]
    fn abi_stack_bank_excludes_frame_and_stack_pointer() {
        let a = abi();
        for reg in a.stack_bank {
            assert_ne!(reg, a.frame_pointer_reg);
            assert_ne!(reg, a.stack_pointer_reg);
        }
    }

    #[test]
    fn every_encoded_instruction_is_within_one_to_fifteen_bytes() {
        let backend = X86_32Backend::new();
        let samples: Vec<X86_32Op> = vec![
            backend.move_reg(EAX, ECX),
            backend.frame_store_raw(EAX, 4),
            backend.frame_load_raw(EAX, 4),
        ];
        for op in samples {
            let len = op.encode(0, &SymbolTable::new()).unwrap().len();
            assert!((1..=15).contains(&len));
        }
    }
}
