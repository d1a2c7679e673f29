//! x86-64 (SysV-flavored, import-free) target: the `Op` wrapper, its
//! `Encodable` impl, the ABI record (spec §4.4), and the `TargetBackend`
//! impl that drives `FunctionLowerer` (spec §4.3).

use super::{AluOp, Cond, Mem, MemWidth as X86MemWidth, Mode, Op};
use crate::ast::MemWidth;
use crate::error::Result;
use crate::isa::{AbiInfo, Encodable, Isa, SymbolTable, Width as IsaWidth};
use crate::lower::{ArithOp, CmpOp, TargetBackend};

#[derive(Debug, Clone)]
pub struct X86_64Op(pub Op);

impl Encodable for X86_64Op {
    fn size_estimate(&self) -> usize {
        super::size_estimate(&self.0, Mode::X64)
    }

    fn encode(&self, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
        super::encode(&self.0, Mode::X64, pc, symbols)
    }
}

/// Register ids (ModR/M + REX.B/R encoding): rax=0 rcx=1 rdx=2 rbx=3 rsp=4
/// rbp=5 rsi=6 rdi=7 r8..r15=8..15.
pub const RAX: u8 = 0;
pub const RCX: u8 = 1;
pub const RDX: u8 = 2;
pub const RBX: u8 = 3;
pub const RSP: u8 = 4;
pub const RBP: u8 = 5;
pub const RSI: u8 = 6;
pub const RDI: u8 = 7;

/// Internal calling convention: first six arguments in
/// rdi/rsi/rdx/rcx/r8/r9 (mirrors SysV's register assignment so the ABI
/// reads familiar, even though there is no external caller to match).
#[must_use]
pub fn abi() -> AbiInfo {
    AbiInfo {
        arg_regs: vec![RDI, RSI, RDX, RCX, 8, 9],
        return_reg: RAX,
        callee_saved: vec![RBX, 12, 13, 14, 15],
        stack_bank: [12, 13, 14, 15],
        memory_base_reg: RBX,
        frame_pointer_reg: RBP,
        stack_pointer_reg: RSP,
        scratch_reg: RAX,
        stack_alignment: 16,
        slot_width: 8,
    }
}

fn x86_width(width: IsaWidth) -> super::Width {
    match width {
        IsaWidth::W32 => super::Width::W32,
        IsaWidth::W64 => super::Width::W64,
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

/// Drives `FunctionLowerer` for the x86-64 target (spec §4.3). Holds no
/// mutable state of its own — every `&self` method is a pure translation
/// from abstract operation to concrete `Op` sequence.
#[derive(Debug, Default)]
pub struct X86_64Backend {
    abi: AbiInfoCell,
}

/// `AbiInfo` built once and reused; avoids reallocating the `Vec` fields
/// on every `abi()` call from the hot lowering loop.
#[derive(Debug)]
struct AbiInfoCell(AbiInfo);

impl Default for AbiInfoCell {
    fn default() -> Self {
        Self(abi())
    }
}

impl X86_64Backend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl TargetBackend for X86_64Backend {
    type Op = X86_64Op;

    fn isa(&self) -> Isa {
        Isa::X86_64
    }

    fn abi(&self) -> &AbiInfo {
        &self.abi.0
    }

    fn bank_reg(&self, bank_index: u8) -> u8 {
        self.abi.0.stack_bank[bank_index as usize]
    }

    fn move_reg(&self, dst: u8, src: u8) -> Self::Op {
        X86_64Op(Op::MovRegReg { width: super::Width::W64, dst, src })
    }

    fn load_const(&self, dst: u8, value: i64, width: IsaWidth) -> Vec<Self::Op> {
        vec![X86_64Op(Op::MovRegImm { width: x86_width(width), dst, imm: value })]
    }

    fn alu(&self, op: ArithOp, width: IsaWidth, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        super::alu_ops(op, x86_width(width), dst, lhs, rhs)
            .into_iter()
            .map(X86_64Op)
            .collect()
    }

    fn cmp(&self, op: CmpOp, width: IsaWidth, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        super::cmp_ops(op, x86_width(width), dst, lhs, rhs)
            .into_iter()
            .map(X86_64Op)
            .collect()
    }

    fn clz(&self, width: IsaWidth, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![X86_64Op(Op::BitCount {
            kind: super::BitCountOp::Lzcnt,
            width: x86_width(width),
            dst,
            src,
        })]
    }

    fn ctz(&self, width: IsaWidth, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![X86_64Op(Op::BitCount {
            kind: super::BitCountOp::Tzcnt,
            width: x86_width(width),
            dst,
            src,
        })]
    }

    fn select(&self, width: IsaWidth, dst: u8, if_true: u8, if_false: u8, cond: u8) -> Vec<Self::Op> {
        let w = x86_width(width);
        let mut out = vec![Op::Test { width: w, a: cond, b: cond }];
        if dst != if_true {
            out.push(Op::MovRegReg { width: w, dst, src: if_true });
        }
        out.push(Op::Cmov { cond: Cond::Eq, width: w, dst, src: if_false });
        out.into_iter().map(X86_64Op).collect()
    }

    fn load_memory(
        &self,
        dst: u8,
        base: u8,
        offset: i32,
        width: MemWidth,
        signed: bool,
        dst_width: IsaWidth,
    ) -> Vec<Self::Op> {
        vec![X86_64Op(Op::LoadMem {
            dst,
            width: x86_width(dst_width),
            mem: Mem { base, disp: offset },
            mem_width: mem_width(width),
            signed,
        })]
    }

    fn store_memory(&self, src: u8, base: u8, offset: i32, width: MemWidth) -> Vec<Self::Op> {
        vec![X86_64Op(Op::StoreMem {
            src,
            mem: Mem { base, disp: offset },
            mem_width: mem_width(width),
        })]
    }

    fn jump(&self, label: String) -> Self::Op {
        X86_64Op(Op::Jmp { label })
    }

    fn jump_if_zero(&self, cond_reg: u8, width: IsaWidth, label: String) -> Vec<Self::Op> {
        let w = x86_width(width);
        vec![
            X86_64Op(Op::Test { width: w, a: cond_reg, b: cond_reg }),
            X86_64Op(Op::Jcc { cond: Cond::Eq, label }),
        ]
    }

    fn jump_if_nonzero(&self, cond_reg: u8, width: IsaWidth, label: String) -> Vec<Self::Op> {
        let w = x86_width(width);
        vec![
            X86_64Op(Op::Test { width: w, a: cond_reg, b: cond_reg }),
            X86_64Op(Op::Jcc { cond: Cond::Ne, label }),
        ]
    }

    fn jump_table(&self, index_reg: u8, targets: &[String], default: String) -> Vec<Self::Op> {
        super::jump_table_linear_scan(index_reg, super::Width::W32, targets, default)
            .into_iter()
            .map(X86_64Op)
            .collect()
    }

    fn call(&self, label: String) -> Self::Op {
        X86_64Op(Op::Call { label })
    }

    fn call_indirect(&self, reg: u8) -> Self::Op {
        X86_64Op(Op::CallInd { reg })
    }

    fn ret(&self) -> Self::Op {
        X86_64Op(Op::Ret)
    }

    fn trap(&self) -> Self::Op {
        X86_64Op(Op::Trap)
    }

    fn nop(&self) -> Self::Op {
        X86_64Op(Op::Nop)
    }

    fn frame_store_raw(&self, src: u8, fp_offset: i32) -> Self::Op {
        X86_64Op(Op::StoreMem {
            src,
            mem: Mem { base: RBP, disp: -fp_offset },
            mem_width: X86MemWidth::B64,
        })
    }

    fn frame_load_raw(&self, dst: u8, fp_offset: i32) -> Self::Op {
        X86_64Op(Op::LoadMem {
            dst,
            width: super::Width::W64,
            mem: Mem { base: RBP, disp: -fp_offset },
            mem_width: X86MemWidth::B64,
            signed: false,
        })
    }

    fn adjust_stack_pointer(&self, delta: i32) -> Vec<Self::Op> {
        vec![X86_64Op(Op::AluRegImm {
            op: AluOp::Add,
            width: super::Width::W64,
            dst: RSP,
            imm: delta,
        })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SymbolTable;

    /// Spec §8 scenario 1: `mov eax, 0` encodes as `B8 00 00 00 00`.
    #[test]
    fn mov_eax_0_matches_spec_scenario() {
        let backend = X86_64Backend::new();
        let op = &backend.load_const(RAX, 0, IsaWidth::W32)[0];
        let bytes = op.encode(0, &SymbolTable::new()).unwrap();
        assert_eq!(bytes, vec![0xB8, 0x00, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn ret_is_single_byte_c3() {
        let backend = X86_64Backend::new();
        let bytes = backend.ret().0.encode(0, &SymbolTable::new()).unwrap();
        assert_eq!(bytes, vec![0xC3]);
    }

    /// The Open Question resolution for x86-64 `select`: condition tested,
    /// `if_true` already in `dst`, `cmovz` overwrites with `if_false` only
    /// when the condition is zero — so `if_true` (not `if_false`) survives
    /// when the condition is nonzero.
    #[test]
    fn select_tests_condition_and_cmovs_on_zero() {
        let backend = X86_64Backend::new();
        let ops = backend.select(IsaWidth::W32, RAX, RAX, RCX, RDX);
        assert!(matches!(ops[0].0, Op::Test { a, b, .. } if a == RDX && b == RDX));
        let last = ops.last().unwrap();
        assert!(matches!(
            last.0,
            Op::Cmov { cond: Cond::Eq, dst, src, .. } if dst == RAX && src == RCX
        ));
    }

    #[test]
    fn abi_stack_bank_is_disjoint_from_argument_and_special_registers() {
        let a = abi();
        for reg in a.stack_bank {
            assert!(!a.arg_regs.contains(&reg));
            assert_ne!(reg, a.frame_pointer_reg);
            assert_ne!(reg, a.stack_pointer_reg);
        }
    }

    #[test]
    fn every_encoded_instruction_is_within_one_to_fifteen_bytes() {
        let backend = X86_64Backend::new();
        let samples: Vec<X86_64Op> = vec![
            backend.move_reg(RAX, RCX),
            backend.frame_store_raw(RAX, 8),
            backend.frame_load_raw(RAX, 8),
        ];
        for op in samples {
            let len = op.encode(0, &SymbolTable::new()).unwrap().len();
            assert!((1..=15).contains(&len));
        }
    }
}
