//! x86-16 (real-mode) target — the degenerate case (spec §4.4) where every
//! argument passes on the stack and addressing is restricted to `[bp+disp]`
//! and `[bx+disp]`, the only two `[base+disp]` forms real-mode ModR/M
//! offers without a second base/index register.

use super::{AluOp, Cond, Mem, MemWidth as X86MemWidth, Mode, Op};
use crate::ast::MemWidth;
use crate::error::Result;
use crate::isa::{AbiInfo, Encodable, Isa, SymbolTable, Width as IsaWidth};
use crate::lower::{ArithOp, CmpOp, TargetBackend};

#[derive(Debug, Clone)]
pub struct X86_16Op(pub Op);

impl Encodable for X86_16Op {
    fn size_estimate(&self) -> usize {
        super::size_estimate(&self.0, Mode::X16)
    }

    fn encode(&self, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
        super::encode(&self.0, Mode::X16, pc, symbols)
    }
}

pub const AX: u8 = 0;
pub const CX: u8 = 1;
pub const DX: u8 = 2;
pub const BX: u8 = 3;
pub const SP: u8 = 4;
pub const BP: u8 = 5;
pub const SI: u8 = 6;
pub const DI: u8 = 7;

/// No register-argument passing: every parameter loads from a
/// caller-pushed stack slot (spec §4.4's explicit degenerate case).
#[must_use]
pub fn abi() -> AbiInfo {
    AbiInfo {
        arg_regs: vec![],
        return_reg: AX,
        callee_saved: vec![SI, DI],
        stack_bank: [CX, DX, SI, DI],
        memory_base_reg: BX,
        frame_pointer_reg: BP,
        stack_pointer_reg: SP,
        scratch_reg: AX,
        stack_alignment: 2,
        slot_width: 2,
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

/// Always operates at `Width::W16` — the narrowest of the three x86
/// targets, so both WASM `i32` and `i64` truncate to 16 bits (documented
/// limitation, see `DESIGN.md`, same simplification as `x86_32`).
const W: super::Width = super::Width::W16;

/// Drives `FunctionLowerer` for the x86-16 real-mode target (spec §4.4).
#[derive(Debug, Default)]
pub struct X86_16Backend {
    abi: AbiInfoCell,
}

#[derive(Debug)]
struct AbiInfoCell(AbiInfo);

impl Default for AbiInfoCell {
    fn default() -> Self {
        Self(abi())
    }
}

impl X86_16Backend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TargetBackend for X86_16Backend {
    type Op = X86_16Op;

    fn isa(&self) -> Isa {
        Isa::X86_16
    }

    fn abi(&self) -> &AbiInfo {
        &self.abi.0
    }

    fn bank_reg(&self, bank_index: u8) -> u8 {
        self.abi.0.stack_bank[bank_index as usize]
    }

    fn move_reg(&self, dst: u8, src: u8) -> Self::Op {
        X86_16Op(Op::MovRegReg { width: W, dst, src })
    }

    fn width_for(&self, ty: crate::ast::ValueType) -> IsaWidth {
        let _ = ty;
        IsaWidth::W32
    }

    fn load_const(&self, dst: u8, value: i64, _width: IsaWidth) -> Vec<Self::Op> {
        vec![X86_16Op(Op::MovRegImm { width: W, dst, imm: value })]
    }

    fn alu(&self, op: ArithOp, _width: IsaWidth, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        super::alu_ops(op, W, dst, lhs, rhs).into_iter().map(X86_16Op).collect()
    }

    fn cmp(&self, op: CmpOp, _width: IsaWidth, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        super::cmp_ops(op, W, dst, lhs, rhs).into_iter().map(X86_16Op).collect()
    }

    fn clz(&self, _width: IsaWidth, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![X86_16Op(Op::BitCount { kind: super::BitCountOp::Lzcnt, width: W, dst, src })]
    }

    fn ctz(&self, _width: IsaWidth, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![X86_16Op(Op::BitCount { kind: super::BitCountOp::Tzcnt, width: W, dst, src })]
    }

    fn select(&self, _width: IsaWidth, dst: u8, if_true: u8, if_false: u8, cond: u8) -> Vec<Self::Op> {
        let mut out = vec![Op::Test { width: W, a: cond, b: cond }];
        if dst != if_true {
            out.push(Op::MovRegReg { width: W, dst, src: if_true });
        }
        out.push(Op::Cmov { cond: Cond::Eq, width: W, dst, src: if_false });
        out.into_iter().map(X86_16Op).collect()
    }

    /// Real-mode ModR/M only forms `[bp+disp]` and `[bx+disp]` (no
    /// arbitrary base register, no SIB byte). `base` here is almost always
    /// a stack-bank register (cx/dx/si/di) holding an address already
    /// computed by `FunctionLowerer` — the lone exception is
    /// `global.get`/`global.set`, which pass `memory_base_reg` (bx)
    /// directly. When `base` isn't already bx, relocate the address into
    /// bx around the access and restore bx's resident
    /// `MEMORY_BASE_ADDRESS` constant afterward, since every other memory
    /// access in the function depends on bx continuing to hold it.
    fn load_memory(
        &self,
        dst: u8,
        base: u8,
        offset: i32,
        width: MemWidth,
        signed: bool,
        _dst_width: IsaWidth,
    ) -> Vec<Self::Op> {
        let load = Op::LoadMem {
            dst,
            width: W,
            mem: Mem { base: BX, disp: offset },
            mem_width: mem_width(width),
            signed,
        };
        if base == BX {
            return vec![X86_16Op(load)];
        }
        vec![
            X86_16Op(Op::Push { reg: BX }),
            X86_16Op(Op::MovRegReg { width: W, dst: BX, src: base }),
            X86_16Op(load),
            X86_16Op(Op::Pop { reg: BX }),
        ]
    }

    fn store_memory(&self, src: u8, base: u8, offset: i32, width: MemWidth) -> Vec<Self::Op> {
        let store = Op::StoreMem { src, mem: Mem { base: BX, disp: offset }, mem_width: mem_width(width) };
        if base == BX {
            return vec![X86_16Op(store)];
        }
        vec![
            X86_16Op(Op::Push { reg: BX }),
            X86_16Op(Op::MovRegReg { width: W, dst: BX, src: base }),
            X86_16Op(store),
            X86_16Op(Op::Pop { reg: BX }),
        ]
    }

    fn jump(&self, label: String) -> Self::Op {
        X86_16Op(Op::Jmp { label })
    }

    fn jump_if_zero(&self, cond_reg: u8, _width: IsaWidth, label: String) -> Vec<Self::Op> {
        vec![
            X86_16Op(Op::Test { width: W, a: cond_reg, b: cond_reg }),
            X86_16Op(Op::Jcc { cond: Cond::Eq, label }),
        ]
    }

    fn jump_if_nonzero(&self, cond_reg: u8, _width: IsaWidth, label: String) -> Vec<Self::Op> {
        vec![
            X86_16Op(Op::Test { width: W, a: cond_reg, b: cond_reg }),
            X86_16Op(Op::Jcc { cond: Cond::Ne, label }),
        ]
    }

    fn jump_table(&self, index_reg: u8, targets: &[String], default: String) -> Vec<Self::Op> {
        super::jump_table_linear_scan(index_reg, W, targets, default)
            .into_iter()
            .map(X86_16Op)
            .collect()
    }

    fn call(&self, label: String) -> Self::Op {
        X86_16Op(Op::Call { label })
    }

    fn call_indirect(&self, reg: u8) -> Self::Op {
        X86_16Op(Op::CallInd { reg })
    }

    fn ret(&self) -> Self::Op {
        X86_16Op(Op::Ret)
    }

    fn trap(&self) -> Self::Op {
        X86_16Op(Op::Trap)
    }

    fn nop(&self) -> Self::Op {
        X86_16Op(Op::Nop)
    }

    /// Frame slots always address off bp, never bx, so no relocation dance
    /// is needed here.
    fn frame_store_raw(&self, src: u8, fp_offset: i32) -> Self::Op {
        X86_16Op(Op::StoreMem { src, mem: Mem { base: BP, disp: -fp_offset }, mem_width: X86MemWidth::B16 })
    }

    fn frame_load_raw(&self, dst: u8, fp_offset: i32) -> Self::Op {
        X86_16Op(Op::LoadMem {
            dst,
            width: W,
            mem: Mem { base: BP, disp: -fp_offset },
            mem_width: X86MemWidth::B16,
            signed: false,
        })
    }

    fn adjust_stack_pointer(&self, delta: i32) -> Vec<Self::Op> {
        vec![X86_16Op(Op::AluRegImm { op: AluOp::Add, width: W, dst: SP, imm: delta })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SymbolTable;

    #[test]
    fn ret_is_single_byte_c3() {
        let backend = X86_16Backend::new();
        let bytes = backend.ret().0.encode(0, &SymbolTable::new()).unwrap();
        assert_eq!(bytes, vec![0xC3]);
    }

    #[test]
    fn abi_has_no_argument_registers() {
        let a = abi();
        assert!(a.arg_regs.is_empty());
    }

    /// Loading through a bank register other than `bx` relocates into
    /// `bx` around the access and restores it afterward — real-mode
    /// ModR/M can only address `[bp+disp]`/`[bx+disp]`.
    #[test]
    fn load_memory_through_non_bx_base_saves_and_restores_bx() {
        let backend = X86_16Backend::new();
        let ops = backend.load_memory(AX, CX, 4, crate::ast::MemWidth::B16, false, IsaWidth::W32);
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[0].0, Op::Push { reg } if reg == BX));
        assert!(matches!(ops.last().unwrap().0, Op::Pop { reg } if reg == BX));
    }

    #[test]
    fn load_memory_through_bx_base_needs_no_relocation() {
        let backend = X86_16Backend::new();
        let ops = backend.load_memory(AX, BX, 4, crate::ast::MemWidth::B16, false, IsaWidth::W32);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn every_encoded_instruction_is_within_one_to_fifteen_bytes() {
        let backend = X86_16Backend::new();
        let samples: Vec<X86_16Op> = vec![
            backend.move_reg(AX, CX),
            backend.frame_store_raw(AX, 2),
            backend.frame_load_raw(AX, 2),
        ];
        for op in samples {
            let len = op.encode(0, &SymbolTable::new()).unwrap().len();
            assert!((1..=15).contains(&len));
        }
    }
}
