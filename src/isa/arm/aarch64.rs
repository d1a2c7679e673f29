//! AArch64 (A64) target: fixed 4-byte instructions, no general per-
//! instruction predication (only `B.cond`/`CSEL`), and `MOVZ`/`MOVK`
//! immediate loading instead of ARMv7's rotation-search-plus-literal-pool
//! (spec §4.5) — a 64-bit constant always takes exactly four 16-bit-chunk
//! instructions, which keeps the size estimator trivial at the cost of a
//! few extra bytes versus a minimized instruction count.
//!
//! Simplifying assumption (documented in DESIGN.md): `LSL`/`LSR`/`ASR` by
//! an immediate count are lowered through the register-shift-amount form
//! (`LSLV`/`LSRV`/`ASRV`) rather than the `UBFM`/`SBFM` bitfield aliases,
//! trading one extra `MOVZ` for avoiding bitfield-immediate encoding.

use super::Cond;
use crate::ast::MemWidth as WasmMemWidth;
use crate::error::{Error, Result};
use crate::isa::{AbiInfo, Encodable, Isa, SymbolTable, Width};
use crate::lower::{ArithOp, CmpOp, TargetBackend};

pub const X0: u8 = 0;
pub const X1: u8 = 1;
pub const X2: u8 = 2;
pub const X3: u8 = 3;
pub const X4: u8 = 4;
pub const X5: u8 = 5;
pub const X6: u8 = 6;
pub const X7: u8 = 7;
pub const X9: u8 = 9;
pub const X10: u8 = 10;
pub const X11: u8 = 11;
pub const X12: u8 = 12;
pub const X19: u8 = 19;
pub const X20: u8 = 20;
pub const X21: u8 = 21;
pub const X22: u8 = 22;
pub const FP: u8 = 29;
pub const LR: u8 = 30;
pub const SP_ZR: u8 = 31;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Orr,
    Eor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Lsl,
    Lsr,
    Asr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    B8,
    B16,
    B32,
    B64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    MovReg {
        w64: bool,
        dst: u8,
        src: u8,
    },
    /// One 16-bit chunk of an immediate load: `shift` is 0/16/32/48.
    /// Lowering always emits a `MovzChunk` for chunk 0 followed by one
    /// `MovkChunk` per remaining chunk (2 total for 32-bit, 4 for 64-bit).
    MovzChunk {
        w64: bool,
        dst: u8,
        imm16: u16,
        shift: u8,
    },
    MovkChunk {
        w64: bool,
        dst: u8,
        imm16: u16,
        shift: u8,
    },
    AluReg {
        op: AluOp,
        w64: bool,
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Cmp {
        w64: bool,
        lhs: u8,
        rhs: u8,
    },
    Mvn {
        w64: bool,
        dst: u8,
        src: u8,
    },
    Neg {
        w64: bool,
        dst: u8,
        src: u8,
    },
    Mul {
        w64: bool,
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Div {
        w64: bool,
        signed: bool,
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    ShiftReg {
        op: ShiftOp,
        w64: bool,
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    RorReg {
        w64: bool,
        dst: u8,
        lhs: u8,
        rhs: u8,
    },
    Clz {
        w64: bool,
        dst: u8,
        src: u8,
    },
    Rbit {
        w64: bool,
        dst: u8,
        src: u8,
    },
    Cset {
        cond: Cond,
        w64: bool,
        dst: u8,
    },
    Csel {
        cond: Cond,
        w64: bool,
        dst: u8,
        if_true: u8,
        if_false: u8,
    },
    Load {
        dst: u8,
        rn: u8,
        offset: i32,
        width: MemWidth,
        signed: bool,
        dst_w64: bool,
    },
    Store {
        src: u8,
        rn: u8,
        offset: i32,
        width: MemWidth,
    },
    B {
        label: String,
    },
    Bl {
        label: String,
    },
    BCond {
        cond: Cond,
        label: String,
    },
    Br {
        rn: u8,
    },
    Blr {
        rn: u8,
    },
    Ret,
    Nop,
    /// All-zero word — the reserved/undefined AArch64 encoding, used as a
    /// trap for `unreachable` and the integer-division guards.
    Trap,
    /// `ADD sp, sp, #imm` / `SUB sp, sp, #imm` — the real AArch64 idiom for
    /// prologue/epilogue stack adjustment. `delta` may be negative; the
    /// 12-bit immediate field holds `delta.abs()`.
    AddSpImm {
        delta: i32,
    },
    /// `ADD Xd, SP, #0` — the only way to read the live SP value into a
    /// general register; register 31 means the zero register, not SP, in
    /// every register-register form (`ORR`/`MovReg` included), so copying
    /// SP into the frame-pointer register needs this immediate-add form
    /// instead of a plain `MovReg`.
    MovFromSp {
        dst: u8,
    },
}

fn sf(w64: bool) -> u32 {
    u32::from(w64) << 31
}

pub(crate) fn size_estimate(_op: &Op) -> usize {
    4
}

pub(crate) fn encode(op: &Op, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
    let word = match op {
        Op::MovReg { w64, dst, src } => {
            // ORR Xd, XZR, Xm
            sf(*w64)
                | (0b01_01010 << 24)
                | (u32::from(*src) << 16)
                | (u32::from(SP_ZR) << 5)
                | u32::from(*dst)
        }
        Op::MovzChunk { w64, dst, imm16, shift } => {
            sf(*w64)
                | (0b10_100101 << 23)
                | (u32::from(shift / 16) << 21)
                | (u32::from(*imm16) << 5)
                | u32::from(*dst)
        }
        Op::MovkChunk { w64, dst, imm16, shift } => {
            sf(*w64)
                | (0b11_100101 << 23)
                | (u32::from(shift / 16) << 21)
                | (u32::from(*imm16) << 5)
                | u32::from(*dst)
        }
        Op::AluReg { op: alu, w64, dst, lhs, rhs } => encode_alu(*alu, *w64, false, *dst, *lhs, *rhs),
        Op::Cmp { w64, lhs, rhs } => encode_alu(AluOp::Sub, *w64, true, SP_ZR, *lhs, *rhs),
        Op::Mvn { w64, dst, src } => {
            sf(*w64)
                | (0b01_01010 << 24)
                | (1 << 21) // N
                | (u32::from(*src) << 16)
                | (u32::from(SP_ZR) << 5)
                | u32::from(*dst)
        }
        Op::Neg { w64, dst, src } => {
            sf(*w64)
                | (1 << 30) // op=SUB
                | (0b01011 << 24)
                | (u32::from(*src) << 16)
                | (u32::from(SP_ZR) << 5)
                | u32::from(*dst)
        }
        Op::Mul { w64, dst, lhs, rhs } => {
            sf(*w64)
                | (0b0011011 << 24)
                | (u32::from(*rhs) << 16)
                | (u32::from(SP_ZR) << 10)
                | (u32::from(*lhs) << 5)
                | u32::from(*dst)
        }
        Op::Div { w64, signed, dst, lhs, rhs } => {
            sf(*w64)
                | (0b0011010110 << 21)
                | (u32::from(*rhs) << 16)
                | (u32::from(!*signed) << 11) // opcode low bit: 0=SDIV,1=UDIV
                | (0b000001 << 10)
                | (u32::from(*lhs) << 5)
                | u32::from(*dst)
        }
        Op::ShiftReg { op: sh, w64, dst, lhs, rhs } => {
            let opc = match sh {
                ShiftOp::Lsl => 0b1000u32,
                ShiftOp::Lsr => 0b1001,
                ShiftOp::Asr => 0b1010,
            };
            sf(*w64)
                | (0b0011010110 << 21)
                | (u32::from(*rhs) << 16)
                | (opc << 10)
                | (u32::from(*lhs) << 5)
                | u32::from(*dst)
        }
        Op::RorReg { w64, dst, lhs, rhs } => {
            sf(*w64)
                | (0b0011010110 << 21)
                | (u32::from(*rhs) << 16)
                | (0b1011 << 10)
                | (u32::from(*lhs) << 5)
                | u32::from(*dst)
        }
        Op::Clz { w64, dst, src } => {
            sf(*w64)
                | (0b1_0_11010110_00000 << 15)
                | (0b000100 << 10)
                | (u32::from(*src) << 5)
                | u32::from(*dst)
        }
        Op::Rbit { w64, dst, src } => {
            sf(*w64)
                | (0b1_0_11010110_00000 << 15)
                | (0b000000 << 10)
                | (u32::from(*src) << 5)
                | u32::from(*dst)
        }
        Op::Cset { cond, w64, dst } => {
            // CSET Wd, cond == CSINC Wd, WZR, WZR, invert(cond)
            sf(*w64)
                | (0b0011010100 << 21)
                | (u32::from(SP_ZR) << 16)
                | (invert_cond(*cond) << 12)
                | (1 << 10)
                | (u32::from(SP_ZR) << 5)
                | u32::from(*dst)
        }
        Op::Csel { cond, w64, dst, if_true, if_false } => {
            sf(*w64)
                | (0b0011010100 << 21)
                | (u32::from(*if_false) << 16)
                | (cond.code() << 12)
                | (u32::from(*if_true) << 5)
                | u32::from(*dst)
        }
        Op::Load { dst, rn, offset, width, signed, dst_w64 } => {
            encode_mem(*dst, *rn, *offset, *width, true, *signed, *dst_w64)?
        }
        Op::Store { src, rn, offset, width } => {
            encode_mem(*src, *rn, *offset, *width, false, false, false)?
        }
        Op::B { label } => {
            let target = resolve(symbols, label)?;
            let disp = branch_disp(pc, target, 26)?;
            (0b000101 << 26) | (disp & 0x03FF_FFFF)
        }
        Op::Bl { label } => {
            let target = resolve(symbols, label)?;
            let disp = branch_disp(pc, target, 26)?;
            (0b100101 << 26) | (disp & 0x03FF_FFFF)
        }
        Op::BCond { cond, label } => {
            let target = resolve(symbols, label)?;
            let disp = branch_disp(pc, target, 19)?;
            (0b01010100 << 24) | ((disp & 0x0007_FFFF) << 5) | cond.code()
        }
        Op::Br { rn } => 0xD61F_0000 | (u32::from(*rn) << 5),
        Op::Blr { rn } => 0xD63F_0000 | (u32::from(*rn) << 5),
        Op::Ret => 0xD65F_03C0,
        Op::Nop => 0xD503_201F,
        Op::Trap => 0x0000_0000,
        Op::AddSpImm { delta } => {
            let op = u32::from(*delta < 0); // 0=ADD, 1=SUB
            let imm = delta.unsigned_abs();
            if imm > 0xFFF {
                return Err(Error::ImmediateUnrepresentable(i64::from(*delta)));
            }
            (1 << 31) | (op << 30) | (0b100010 << 23) | (imm << 10) | (u32::from(SP_ZR) << 5) | u32::from(SP_ZR)
        }
        Op::MovFromSp { dst } => {
            (1 << 31) | (0b100010 << 23) | (u32::from(SP_ZR) << 5) | u32::from(*dst)
        }
    };
    Ok(word.to_le_bytes().to_vec())
}

fn invert_cond(cond: Cond) -> u32 {
    cond.code() ^ 0x1
}

fn encode_alu(op: AluOp, w64: bool, set_flags: bool, dst: u8, lhs: u8, rhs: u8) -> u32 {
    match op {
        AluOp::Add | AluOp::Sub => {
            sf(w64)
                | (u32::from(matches!(op, AluOp::Sub)) << 30)
                | (u32::from(set_flags) << 29)
                | (0b01011 << 24)
                | (u32::from(rhs) << 16)
                | (u32::from(lhs) << 5)
                | u32::from(dst)
        }
        AluOp::And | AluOp::Orr | AluOp::Eor => {
            let opc = match op {
                AluOp::And => 0b00u32,
                AluOp::Orr => 0b01,
                AluOp::Eor => 0b10,
                AluOp::Add | AluOp::Sub => unreachable!(),
            };
            sf(w64)
                | (opc << 29)
                | (0b01010 << 24)
                | (u32::from(rhs) << 16)
                | (u32::from(lhs) << 5)
                | u32::from(dst)
        }
    }
}

fn encode_mem(
    rt: u8,
    rn: u8,
    offset: i32,
    width: MemWidth,
    load: bool,
    signed: bool,
    dst_w64: bool,
) -> Result<u32> {
    let size = match width {
        MemWidth::B8 => 0b00u32,
        MemWidth::B16 => 0b01,
        MemWidth::B32 => 0b10,
        MemWidth::B64 => 0b11,
    };
    let scale = match width {
        MemWidth::B8 => 1,
        MemWidth::B16 => 2,
        MemWidth::B32 => 4,
        MemWidth::B64 => 8,
    };
    if offset < 0 || offset % scale != 0 || offset / scale > 0xFFF {
        return Err(Error::ImmediateUnrepresentable(i64::from(offset)));
    }
    let imm12 = (offset / scale) as u32;
    let opc: u32 = if !load {
        0b00
    } else if !signed {
        0b01
    } else if dst_w64 {
        0b10
    } else {
        0b11
    };
    Ok((size << 30)
        | (0b111_0_01 << 24)
        | (opc << 22)
        | (imm12 << 10)
        | (u32::from(rn) << 5)
        | u32::from(rt))
}

fn resolve(symbols: &SymbolTable, label: &str) -> Result<u32> {
    symbols
        .get(label)
        .copied()
        .ok_or_else(|| Error::UnresolvedLabel(label.to_string()))
}

fn branch_disp(pc: u32, target: u32, field_bits: u32) -> Result<u32> {
    let range = crate::isa::BranchRange {
        field_bits,
        quantum: 4,
        pipeline_offset: 0,
    };
    let disp = range.displacement(i64::from(pc), i64::from(target))?;
    Ok(disp as u32)
}

/// Split a (possibly 64-bit) immediate into four 16-bit chunks,
/// little-chunk-first, as `MOVZ`+`MOVK` sequence expects.
#[must_use]
pub fn chunks(imm: u64, w64: bool) -> Vec<u16> {
    let n = if w64 { 4 } else { 2 };
    (0..n).map(|i| (imm >> (i * 16)) as u16).collect()
}

#[derive(Debug, Clone)]
pub struct Aarch64Op(pub Op);

impl Encodable for Aarch64Op {
    fn size_estimate(&self) -> usize {
        size_estimate(&self.0)
    }

    fn encode(&self, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
        encode(&self.0, pc, symbols)
    }
}

/// AAPCS64-flavored internal convention: `x0..x7` argument registers,
/// `x19..x22` the virtual-stack bank, `x9` the memory-base register, `x29`
/// the frame pointer, `x30` the link register.
#[must_use]
pub fn abi() -> AbiInfo {
    AbiInfo {
        arg_regs: vec![X0, X1, X2, X3, X4, X5, X6, X7],
        return_reg: X0,
        callee_saved: vec![X19, X20, X21, X22, FP, LR],
        stack_bank: [X19, X20, X21, X22],
        memory_base_reg: X9,
        frame_pointer_reg: FP,
        stack_pointer_reg: 31,
        scratch_reg: X10,
        stack_alignment: 16,
        slot_width: 8,
    }
}

#[must_use]
pub fn width_is_64(width: Width) -> bool {
    matches!(width, Width::W64)
}

/// Drives `FunctionLowerer` for the AArch64 target (spec §4.3).
#[derive(Debug, Default)]
pub struct Aarch64Backend {
    abi: AbiInfoCell,
}

#[derive(Debug)]
struct AbiInfoCell(AbiInfo);

impl Default for AbiInfoCell {
    fn default() -> Self {
        Self(abi())
    }
}

impl Aarch64Backend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn mem_width(width: WasmMemWidth) -> MemWidth {
    match width {
        WasmMemWidth::B8 => MemWidth::B8,
        WasmMemWidth::B16 => MemWidth::B16,
        WasmMemWidth::B32 => MemWidth::B32,
        WasmMemWidth::B64 => MemWidth::B64,
    }
}

fn cond_of(op: CmpOp) -> Cond {
    match op {
        CmpOp::Eq => Cond::Eq,
        CmpOp::Ne => Cond::Ne,
        CmpOp::LtS => Cond::LtS,
        CmpOp::LtU => Cond::LtU,
        CmpOp::GtS => Cond::GtS,
        CmpOp::GtU => Cond::GtU,
        CmpOp::LeS => Cond::LeS,
        CmpOp::LeU => Cond::LeU,
        CmpOp::GeS => Cond::GeS,
        CmpOp::GeU => Cond::GeU,
    }
}

impl TargetBackend for Aarch64Backend {
    type Op = Aarch64Op;

    fn isa(&self) -> Isa {
        Isa::Aarch64
    }

    fn abi(&self) -> &AbiInfo {
        &self.abi.0
    }

    fn bank_reg(&self, bank_index: u8) -> u8 {
        self.abi.0.stack_bank[bank_index as usize]
    }

    fn move_reg(&self, dst: u8, src: u8) -> Self::Op {
        if src == SP_ZR {
            Aarch64Op(Op::MovFromSp { dst })
        } else {
            Aarch64Op(Op::MovReg { w64: true, dst, src })
        }
    }

    fn load_const(&self, dst: u8, value: i64, width: Width) -> Vec<Self::Op> {
        let w64 = width_is_64(width);
        let parts = chunks(value as u64, w64);
        let mut out = vec![Op::MovzChunk { w64, dst, imm16: parts[0], shift: 0 }];
        for (i, chunk) in parts.iter().enumerate().skip(1) {
            out.push(Op::MovkChunk { w64, dst, imm16: *chunk, shift: (i * 16) as u8 });
        }
        out.into_iter().map(Aarch64Op).collect()
    }

    fn alu(&self, op: ArithOp, width: Width, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        let w64 = width_is_64(width);
        let scratch = self.abi.0.scratch_reg;
        let mut out = Vec::new();
        match op {
            ArithOp::Add => out.push(Op::AluReg { op: AluOp::Add, w64, dst, lhs, rhs }),
            ArithOp::Sub => out.push(Op::AluReg { op: AluOp::Sub, w64, dst, lhs, rhs }),
            ArithOp::And => out.push(Op::AluReg { op: AluOp::And, w64, dst, lhs, rhs }),
            ArithOp::Or => out.push(Op::AluReg { op: AluOp::Orr, w64, dst, lhs, rhs }),
            ArithOp::Xor => out.push(Op::AluReg { op: AluOp::Eor, w64, dst, lhs, rhs }),
            ArithOp::Mul => out.push(Op::Mul { w64, dst, lhs, rhs }),
            ArithOp::DivS | ArithOp::DivU => {
                out.push(Op::Div { w64, signed: matches!(op, ArithOp::DivS), dst, lhs, rhs });
            }
            ArithOp::RemS | ArithOp::RemU => {
                out.push(Op::Div { w64, signed: matches!(op, ArithOp::RemS), dst: scratch, lhs, rhs });
                out.push(Op::Mul { w64, dst: scratch, lhs: scratch, rhs });
                out.push(Op::AluReg { op: AluOp::Sub, w64, dst, lhs, rhs: scratch });
            }
            ArithOp::Shl => out.push(Op::ShiftReg { op: ShiftOp::Lsl, w64, dst, lhs, rhs }),
            ArithOp::ShrU => out.push(Op::ShiftReg { op: ShiftOp::Lsr, w64, dst, lhs, rhs }),
            ArithOp::ShrS => out.push(Op::ShiftReg { op: ShiftOp::Asr, w64, dst, lhs, rhs }),
            ArithOp::Rotr => out.push(Op::RorReg { w64, dst, lhs, rhs }),
            ArithOp::Rotl => {
                // ROR's shift amount is taken mod the register width, so
                // rotating left by `rhs` is the same as rotating right by
                // `-rhs` (wraparound does the rest).
                out.push(Op::Neg { w64, dst: scratch, src: rhs });
                out.push(Op::RorReg { w64, dst, lhs, rhs: scratch });
            }
        }
        out.into_iter().map(Aarch64Op).collect()
    }

    fn cmp(&self, op: CmpOp, width: Width, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        let w64 = width_is_64(width);
        vec![
            Aarch64Op(Op::Cmp { w64, lhs, rhs }),
            Aarch64Op(Op::Cset { cond: cond_of(op), w64, dst }),
        ]
    }

    fn clz(&self, width: Width, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![Aarch64Op(Op::Clz { w64: width_is_64(width), dst, src })]
    }

    fn ctz(&self, width: Width, dst: u8, src: u8) -> Vec<Self::Op> {
        let w64 = width_is_64(width);
        let scratch = self.abi.0.scratch_reg;
        vec![
            Aarch64Op(Op::Rbit { w64, dst: scratch, src }),
            Aarch64Op(Op::Clz { w64, dst, src: scratch }),
        ]
    }

    fn select(&self, width: Width, dst: u8, if_true: u8, if_false: u8, cond: u8) -> Vec<Self::Op> {
        let w64 = width_is_64(width);
        vec![
            Aarch64Op(Op::Cmp { w64, lhs: cond, rhs: SP_ZR }),
            Aarch64Op(Op::Csel { cond: Cond::Ne, w64, dst, if_true, if_false }),
        ]
    }

    fn load_memory(
        &self,
        dst: u8,
        base: u8,
        offset: i32,
        width: WasmMemWidth,
        signed: bool,
        dst_width: Width,
    ) -> Vec<Self::Op> {
        vec![Aarch64Op(Op::Load {
            dst,
            rn: base,
            offset,
            width: mem_width(width),
            signed,
            dst_w64: width_is_64(dst_width),
        })]
    }

    fn store_memory(&self, src: u8, base: u8, offset: i32, width: WasmMemWidth) -> Vec<Self::Op> {
        vec![Aarch64Op(Op::Store { src, rn: base, offset, width: mem_width(width) })]
    }

    fn jump(&self, label: String) -> Self::Op {
        Aarch64Op(Op::B { label })
    }

    fn jump_if_zero(&self, cond_reg: u8, width: Width, label: String) -> Vec<Self::Op> {
        let w64 = width_is_64(width);
        vec![
            Aarch64Op(Op::Cmp { w64, lhs: cond_reg, rhs: SP_ZR }),
            Aarch64Op(Op::BCond { cond: Cond::Eq, label }),
        ]
    }

    fn jump_if_nonzero(&self, cond_reg: u8, width: Width, label: String) -> Vec<Self::Op> {
        let w64 = width_is_64(width);
        vec![
            Aarch64Op(Op::Cmp { w64, lhs: cond_reg, rhs: SP_ZR }),
            Aarch64Op(Op::BCond { cond: Cond::Ne, label }),
        ]
    }

    /// No `CMP`-with-immediate form in this encoder (spec §4.5 keeps the
    /// immediate machinery ARMv7-shaped), so each arm's index constant
    /// loads into the scratch register via `MOVZ` before the compare.
    fn jump_table(&self, index_reg: u8, targets: &[String], default: String) -> Vec<Self::Op> {
        let scratch = self.abi.0.scratch_reg;
        let mut out = Vec::new();
        for (i, target) in targets.iter().enumerate() {
            out.push(Op::MovzChunk { w64: false, dst: scratch, imm16: i as u16, shift: 0 });
            out.push(Op::Cmp { w64: false, lhs: index_reg, rhs: scratch });
            out.push(Op::BCond { cond: Cond::Eq, label: target.clone() });
        }
        out.push(Op::B { label: default });
        out.into_iter().map(Aarch64Op).collect()
    }

    fn call(&self, label: String) -> Self::Op {
        Aarch64Op(Op::Bl { label })
    }

    fn call_indirect(&self, reg: u8) -> Self::Op {
        Aarch64Op(Op::Blr { rn: reg })
    }

    fn ret(&self) -> Self::Op {
        Aarch64Op(Op::Ret)
    }

    fn trap(&self) -> Self::Op {
        Aarch64Op(Op::Trap)
    }

    fn nop(&self) -> Self::Op {
        Aarch64Op(Op::Nop)
    }

    fn frame_store_raw(&self, src: u8, fp_offset: i32) -> Self::Op {
        Aarch64Op(Op::Store { src, rn: FP, offset: -fp_offset, width: MemWidth::B64 })
    }

    fn frame_load_raw(&self, dst: u8, fp_offset: i32) -> Self::Op {
        Aarch64Op(Op::Load {
            dst,
            rn: FP,
            offset: -fp_offset,
            width: MemWidth::B64,
            signed: false,
            dst_w64: true,
        })
    }

    fn adjust_stack_pointer(&self, delta: i32) -> Vec<Self::Op> {
        vec![Aarch64Op(Op::AddSpImm { delta })]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ret_matches_spec_scenario() {
        let symbols = SymbolTable::new();
        let bytes = encode(&Op::Ret, 0, &symbols).unwrap();
        assert_eq!(bytes, vec![0xC0, 0x03, 0x5F, 0xD6]);
    }

    #[test]
    fn size_estimate_is_always_four() {
        assert_eq!(size_estimate(&Op::Nop), 4);
        assert_eq!(size_estimate(&Op::Trap), 4);
    }

    #[test]
    fn chunks_splits_little_chunk_first() {
        let c = chunks(0x1122_3344_5566_7788, true);
        assert_eq!(c, vec![0x7788, 0x5566, 0x3344, 0x1122]);
    }

    #[test]
    fn load_store_offset_must_be_alignment_scaled() {
        assert!(encode_mem(X0, FP, 1, MemWidth::B64, true, false, true).is_err());
        assert!(encode_mem(X0, FP, 8, MemWidth::B64, true, false, true).is_ok());
    }
}
