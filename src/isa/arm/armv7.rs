//! ARMv7 ARM-mode (A32) target: fixed 4-byte instructions, per-instruction
//! condition predicate, and the literal-pool fallback for immediates the
//! rotation search can't represent (spec §4.5, §9 "Literal-pool
//! discipline").
//!
//! Simplifying assumptions (documented in DESIGN.md): the target is
//! assumed to support the ARMv7-R/VE `SDIV`/`UDIV` integer-divide
//! instructions rather than requiring a software division routine, and
//! sub-word loads/stores are assumed to fit the 8-bit immediate offset
//! the halfword/signed-byte encoding allows.

use super::{encode_arm_immediate, Cond};
use crate::ast::MemWidth as WasmMemWidth;
use crate::error::{Error, Result};
use crate::isa::{AbiInfo, Encodable, Isa, SymbolTable, Width};
use crate::lower::{ArithOp, CmpOp, TargetBackend};
use std::cell::{Cell, RefCell};

pub const R0: u8 = 0;
pub const R1: u8 = 1;
pub const R2: u8 = 2;
pub const R3: u8 = 3;
pub const R4: u8 = 4;
pub const R5: u8 = 5;
pub const R6: u8 = 6;
pub const R7: u8 = 7;
pub const R8: u8 = 8;
pub const R11: u8 = 11;
pub const IP: u8 = 12;
pub const SP: u8 = 13;
pub const LR: u8 = 14;
pub const PC: u8 = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DpOp {
    And,
    Eor,
    Sub,
    Rsb,
    Add,
    Orr,
    Mov,
    Mvn,
}

impl DpOp {
    const fn code(self) -> u32 {
        match self {
            DpOp::And => 0b0000,
            DpOp::Eor => 0b0001,
            DpOp::Sub => 0b0010,
            DpOp::Rsb => 0b0011,
            DpOp::Add => 0b0100,
            DpOp::Orr => 0b1100,
            DpOp::Mov => 0b1101,
            DpOp::Mvn => 0b1111,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftOp {
    const fn code(self) -> u32 {
        match self {
            ShiftOp::Lsl => 0b00,
            ShiftOp::Lsr => 0b01,
            ShiftOp::Asr => 0b10,
            ShiftOp::Ror => 0b11,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    B8,
    B16,
    B32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    DpReg {
        op: DpOp,
        cond: Cond,
        s: bool,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    /// Encodes the exact residue/rotation pair found by
    /// `encode_arm_immediate`; callers that need an unrepresentable
    /// constant must fall back to `LiteralLoad` themselves.
    DpImm {
        op: DpOp,
        cond: Cond,
        s: bool,
        rd: u8,
        rn: u8,
        rotate: u8,
        imm8: u8,
    },
    Cmp {
        cond: Cond,
        rn: u8,
        rm: u8,
    },
    Mul {
        cond: Cond,
        rd: u8,
        rm: u8,
        rs: u8,
    },
    Div {
        cond: Cond,
        signed: bool,
        rd: u8,
        rn: u8,
        rm: u8,
    },
    ShiftImm {
        op: ShiftOp,
        cond: Cond,
        rd: u8,
        rm: u8,
        amount: u8,
    },
    ShiftReg {
        op: ShiftOp,
        cond: Cond,
        rd: u8,
        rm: u8,
        rs: u8,
    },
    Clz {
        cond: Cond,
        rd: u8,
        rm: u8,
    },
    Rbit {
        cond: Cond,
        rd: u8,
        rm: u8,
    },
    B {
        cond: Cond,
        label: String,
    },
    Bl {
        cond: Cond,
        label: String,
    },
    Bx {
        cond: Cond,
        rm: u8,
    },
    Blx {
        cond: Cond,
        rm: u8,
    },
    Load {
        cond: Cond,
        rd: u8,
        rn: u8,
        offset: i32,
        width: MemWidth,
        signed: bool,
    },
    Store {
        cond: Cond,
        rd: u8,
        rn: u8,
        offset: i32,
        width: MemWidth,
    },
    /// `STR Rd, [SP, #-4]!` — pre-indexed single-register push.
    Push {
        cond: Cond,
        rd: u8,
    },
    /// `LDR Rd, [SP], #4` — post-indexed single-register pop.
    Pop {
        cond: Cond,
        rd: u8,
    },
    /// `LDR Rd, [PC, #offset]`, offset resolved from `label` (a
    /// `PoolWord` placed later in the same function) like a branch target.
    LiteralLoad {
        cond: Cond,
        rd: u8,
        label: String,
    },
    /// One 4-byte constant in the function-end literal pool.
    PoolWord {
        label: String,
        value: i32,
    },
    Nop,
    /// `udf #0` — the ARM "permanently undefined" encoding.
    Trap,
}

fn reg_shift_operand(shift: u32, shift_imm: u32, shift_type: u32, rm: u8) -> u32 {
    (shift_imm << 7) | (shift_type << 5) | (shift << 4) | u32::from(rm)
}

fn cond_bits(cond: Cond) -> u32 {
    cond.code() << 28
}

pub(crate) fn size_estimate(op: &Op) -> usize {
    // Every ARMv7 instruction and pool word is exactly 4 bytes (spec §4.5
    // "fixed 4 bytes (AArch64, ARMv7)").
    let _ = op;
    4
}

pub(crate) fn encode(op: &Op, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
    let word = match op {
        Op::DpReg { op: dp, cond, s, rd, rn, rm } => {
            cond_bits(*cond)
                | (0b00 << 26)
                | (dp.code() << 21)
                | (u32::from(*s) << 20)
                | (u32::from(*rn) << 16)
                | (u32::from(*rd) << 12)
                | reg_shift_operand(0, 0, 0, *rm)
        }
        Op::DpImm { op: dp, cond, s, rd, rn, rotate, imm8 } => {
            cond_bits(*cond)
                | (0b001 << 25)
                | (dp.code() << 21)
                | (u32::from(*s) << 20)
                | (u32::from(*rn) << 16)
                | (u32::from(*rd) << 12)
                | (u32::from(*rotate) << 8)
                | u32::from(*imm8)
        }
        Op::Cmp { cond, rn, rm } => {
            cond_bits(*cond)
                | (0b00 << 26)
                | (0b1010 << 21)
                | (1 << 20)
                | (u32::from(*rn) << 16)
                | reg_shift_operand(0, 0, 0, *rm)
        }
        Op::Mul { cond, rd, rm, rs } => {
            cond_bits(*cond)
                | (u32::from(*rd) << 16)
                | (u32::from(*rs) << 8)
                | (0b1001 << 4)
                | u32::from(*rm)
        }
        Op::Div { cond, signed, rd, rn, rm } => {
            cond_bits(*cond)
                | (0b0111 << 24)
                | (u32::from(!*signed) << 21)
                | (1 << 20)
                | (u32::from(*rd) << 16)
                | (0b1111 << 12)
                | (u32::from(*rm) << 8)
                | (0b0001 << 4)
                | u32::from(*rn)
        }
        Op::ShiftImm { op: sh, cond, rd, rm, amount } => {
            cond_bits(*cond)
                | (0b00 << 26)
                | (DpOp::Mov.code() << 21)
                | (u32::from(*rd) << 12)
                | reg_shift_operand(0, u32::from(*amount), sh.code(), *rm)
        }
        Op::ShiftReg { op: sh, cond, rd, rm, rs } => {
            cond_bits(*cond)
                | (0b00 << 26)
                | (DpOp::Mov.code() << 21)
                | (u32::from(*rd) << 12)
                | (u32::from(*rs) << 8)
                | (sh.code() << 5)
                | (1 << 4)
                | u32::from(*rm)
        }
        Op::Clz { cond, rd, rm } => {
            cond_bits(*cond)
                | (0b0001_0110 << 20)
                | (0b1111 << 16)
                | (u32::from(*rd) << 12)
                | (0b1111 << 8)
                | (0b0001 << 4)
                | u32::from(*rm)
        }
        Op::Rbit { cond, rd, rm } => {
            cond_bits(*cond)
                | (0b0110_1111 << 20)
                | (0b1111 << 16)
                | (u32::from(*rd) << 12)
                | (0b1111 << 8)
                | (0b0011 << 4)
                | u32::from(*rm)
        }
        Op::B { cond, label } => {
            let target = resolve(symbols, label)?;
            let disp = branch_disp(pc, target)?;
            cond_bits(*cond) | (0b101 << 25) | (disp & 0x00FF_FFFF)
        }
        Op::Bl { cond, label } => {
            let target = resolve(symbols, label)?;
            let disp = branch_disp(pc, target)?;
            cond_bits(*cond) | (0b101 << 25) | (1 << 24) | (disp & 0x00FF_FFFF)
        }
        Op::Bx { cond, rm } => cond_bits(*cond) | 0x012F_FF10 | u32::from(*rm),
        Op::Blx { cond, rm } => cond_bits(*cond) | 0x012F_FF30 | u32::from(*rm),
        Op::Load { cond, rd, rn, offset, width, signed } => {
            encode_mem(*cond, *rd, *rn, *offset, *width, true, *signed)?
        }
        Op::Store { cond, rd, rn, offset, width } => {
            encode_mem(*cond, *rd, *rn, *offset, *width, false, false)?
        }
        Op::Push { cond, rd } => {
            encode_mem(*cond, *rd, SP, -4, MemWidth::B32, false, false)? | (1 << 21) /* writeback */
        }
        Op::Pop { cond, rd } => {
            cond_bits(*cond)
                | (0b01 << 26)
                | (1 << 23) // U: post-indexed, add
                | (1 << 20) // L: load
                | (u32::from(SP) << 16)
                | (u32::from(*rd) << 12)
                | 4
        }
        Op::LiteralLoad { cond, rd, label } => {
            let target = resolve(symbols, label)?;
            let raw = i64::from(target) - i64::from(pc + 8);
            let (up, mag) = if raw >= 0 { (1u32, raw) } else { (0u32, -raw) };
            if mag > 0xFFF {
                return Err(Error::ImmediateUnrepresentable(raw));
            }
            cond_bits(*cond)
                | (0b01 << 26)
                | (1 << 24) // P: pre-indexed
                | (up << 23)
                | (1 << 20) // L: load
                | (u32::from(PC) << 16)
                | (u32::from(*rd) << 12)
                | mag as u32
        }
        Op::PoolWord { value, .. } => *value as u32,
        Op::Nop => 0xE320_F000,
        Op::Trap => 0xE7F0_00F0,
    };
    Ok(word.to_le_bytes().to_vec())
}

fn encode_mem(
    cond: Cond,
    rd: u8,
    rn: u8,
    offset: i32,
    width: MemWidth,
    load: bool,
    signed: bool,
) -> Result<u32> {
    let up = u32::from(offset >= 0);
    let mag = offset.unsigned_abs();
    match width {
        MemWidth::B32 => {
            if mag > 0xFFF {
                return Err(Error::ImmediateUnrepresentable(i64::from(offset)));
            }
            Ok(cond_bits(cond)
                | (0b01 << 26)
                | (1 << 24) // P
                | (up << 23)
                | (u32::from(load) << 20)
                | (u32::from(rn) << 16)
                | (u32::from(rd) << 12)
                | mag)
        }
        MemWidth::B8 if !signed => {
            if mag > 0xFFF {
                return Err(Error::ImmediateUnrepresentable(i64::from(offset)));
            }
            Ok(cond_bits(cond)
                | (0b01 << 26)
                | (1 << 24)
                | (up << 23)
                | (1 << 22) // B: byte
                | (u32::from(load) << 20)
                | (u32::from(rn) << 16)
                | (u32::from(rd) << 12)
                | mag)
        }
        MemWidth::B16 | MemWidth::B8 => {
            if mag > 0xFF {
                return Err(Error::ImmediateUnrepresentable(i64::from(offset)));
            }
            let (s, h) = match (width, signed) {
                (MemWidth::B16, false) => (0, 1),
                (MemWidth::B16, true) => (1, 1),
                (MemWidth::B8, true) => (1, 0),
                _ => unreachable!(),
            };
            let hi = (mag >> 4) & 0xF;
            let lo = mag & 0xF;
            Ok(cond_bits(cond)
                | (1 << 24) // P
                | (up << 23)
                | (1 << 22) // I: immediate offset
                | (u32::from(load) << 20)
                | (u32::from(rn) << 16)
                | (u32::from(rd) << 12)
                | (hi << 8)
                | (1 << 7)
                | (s << 6)
                | (h << 5)
                | (1 << 4)
                | lo)
        }
    }
}

fn resolve(symbols: &SymbolTable, label: &str) -> Result<u32> {
    symbols
        .get(label)
        .copied()
        .ok_or_else(|| Error::UnresolvedLabel(label.to_string()))
}

fn branch_disp(pc: u32, target: u32) -> Result<u32> {
    let range = crate::isa::BranchRange {
        field_bits: 24,
        quantum: 4,
        pipeline_offset: 8,
    };
    let disp = range.displacement(i64::from(pc), i64::from(target))?;
    Ok(disp as u32)
}

#[derive(Debug, Clone)]
pub struct ArmV7Op(pub Op);

impl Encodable for ArmV7Op {
    fn size_estimate(&self) -> usize {
        size_estimate(&self.0)
    }

    fn encode(&self, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
        encode(&self.0, pc, symbols)
    }
}

/// AAPCS-flavored internal convention: `r0..r3` argument registers,
/// `r4..r7` the virtual-stack bank, `r8` the memory-base register, `r11`
/// the frame pointer, `r13` the stack pointer, `r14` the link register.
#[must_use]
pub fn abi() -> AbiInfo {
    AbiInfo {
        arg_regs: vec![R0, R1, R2, R3],
        return_reg: R0,
        callee_saved: vec![R4, R5, R6, R7, R8, R11, LR],
        stack_bank: [R4, R5, R6, R7],
        memory_base_reg: R8,
        frame_pointer_reg: R11,
        stack_pointer_reg: SP,
        scratch_reg: IP,
        stack_alignment: 8,
        slot_width: 4,
    }
}

#[must_use]
pub fn encode_immediate(value: u32) -> Option<(u8, u8)> {
    encode_arm_immediate(value)
}

fn mem_width(width: WasmMemWidth) -> MemWidth {
    // ARMv7-A32 general registers are 32 bits wide; a WASM `i64` truncates
    // to 32 bits here the same way it does on x86-32/x86-16.
    match width {
        WasmMemWidth::B8 => MemWidth::B8,
        WasmMemWidth::B16 => MemWidth::B16,
        WasmMemWidth::B32 | WasmMemWidth::B64 => MemWidth::B32,
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

/// Drives `FunctionLowerer` for the ARMv7 target (spec §4.3, §9's
/// literal-pool discipline). Needs interior mutability for the pending
/// literal pool since `drain_pending_pool` takes `&self` — every other
/// method here only translates an abstract op to a concrete `Op`
/// sequence and stays side-effect-free.
#[derive(Debug, Default)]
pub struct ArmV7Backend {
    abi: AbiInfoCell,
    pool: RefCell<Vec<Op>>,
    pool_counter: Cell<u32>,
}

#[derive(Debug)]
struct AbiInfoCell(AbiInfo);

impl Default for AbiInfoCell {
    fn default() -> Self {
        Self(abi())
    }
}

impl ArmV7Backend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_pool_label(&self) -> String {
        let n = self.pool_counter.get();
        self.pool_counter.set(n + 1);
        format!("__armv7_pool_{n}")
    }
}

impl TargetBackend for ArmV7Backend {
    type Op = ArmV7Op;

    fn isa(&self) -> Isa {
        Isa::Armv7
    }

    fn abi(&self) -> &AbiInfo {
        &self.abi.0
    }

    fn bank_reg(&self, bank_index: u8) -> u8 {
        self.abi.0.stack_bank[bank_index as usize]
    }

    fn move_reg(&self, dst: u8, src: u8) -> Self::Op {
        ArmV7Op(Op::DpReg { op: DpOp::Mov, cond: Cond::Al, s: false, rd: dst, rn: 0, rm: src })
    }

    fn width_for(&self, ty: crate::ast::ValueType) -> Width {
        let _ = ty;
        Width::W32
    }

    /// Tries the rotated 8-bit immediate directly, then its bitwise
    /// complement via `MVN` (the usual ARM trick for constants just out of
    /// `MOV`'s reach), then falls back to the literal pool (spec §9).
    fn load_const(&self, dst: u8, value: i64, _width: Width) -> Vec<Self::Op> {
        let v = value as u32;
        if let Some((rotate, imm8)) = encode_arm_immediate(v) {
            return vec![ArmV7Op(Op::DpImm {
                op: DpOp::Mov,
                cond: Cond::Al,
                s: false,
                rd: dst,
                rn: 0,
                rotate,
                imm8,
            })];
        }
        if let Some((rotate, imm8)) = encode_arm_immediate(!v) {
            return vec![ArmV7Op(Op::DpImm {
                op: DpOp::Mvn,
                cond: Cond::Al,
                s: false,
                rd: dst,
                rn: 0,
                rotate,
                imm8,
            })];
        }
        let label = self.fresh_pool_label();
        self.pool.borrow_mut().push(Op::PoolWord { label: label.clone(), value: v as i32 });
        vec![ArmV7Op(Op::LiteralLoad { cond: Cond::Al, rd: dst, label })]
    }

    fn alu(&self, op: ArithOp, _width: Width, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        let scratch = self.abi.0.scratch_reg;
        let reg = |op, rd, rn, rm| Op::DpReg { op, cond: Cond::Al, s: false, rd, rn, rm };
        let mut out = Vec::new();
        match op {
            ArithOp::Add => out.push(reg(DpOp::Add, dst, lhs, rhs)),
            ArithOp::Sub => out.push(reg(DpOp::Sub, dst, lhs, rhs)),
            ArithOp::And => out.push(reg(DpOp::And, dst, lhs, rhs)),
            ArithOp::Or => out.push(reg(DpOp::Orr, dst, lhs, rhs)),
            ArithOp::Xor => out.push(reg(DpOp::Eor, dst, lhs, rhs)),
            ArithOp::Mul => out.push(Op::Mul { cond: Cond::Al, rd: dst, rm: lhs, rs: rhs }),
            ArithOp::DivS | ArithOp::DivU => {
                out.push(Op::Div { cond: Cond::Al, signed: matches!(op, ArithOp::DivS), rd: dst, rn: lhs, rm: rhs });
            }
            ArithOp::RemS | ArithOp::RemU => {
                out.push(Op::Div {
                    cond: Cond::Al,
                    signed: matches!(op, ArithOp::RemS),
                    rd: scratch,
                    rn: lhs,
                    rm: rhs,
                });
                out.push(Op::Mul { cond: Cond::Al, rd: scratch, rm: scratch, rs: rhs });
                out.push(reg(DpOp::Sub, dst, lhs, scratch));
            }
            ArithOp::Shl => out.push(Op::ShiftReg { op: ShiftOp::Lsl, cond: Cond::Al, rd: dst, rm: lhs, rs: rhs }),
            ArithOp::ShrU => out.push(Op::ShiftReg { op: ShiftOp::Lsr, cond: Cond::Al, rd: dst, rm: lhs, rs: rhs }),
            ArithOp::ShrS => out.push(Op::ShiftReg { op: ShiftOp::Asr, cond: Cond::Al, rd: dst, rm: lhs, rs: rhs }),
            ArithOp::Rotr => out.push(Op::ShiftReg { op: ShiftOp::Ror, cond: Cond::Al, rd: dst, rm: lhs, rs: rhs }),
            ArithOp::Rotl => {
                // ARM's register-shift amount is taken mod 256 then mod 32
                // by the barrel shifter, so rotating left by `rhs` is the
                // same as rotating right by `-rhs`.
                out.push(Op::DpImm {
                    op: DpOp::Rsb,
                    cond: Cond::Al,
                    s: false,
                    rd: scratch,
                    rn: rhs,
                    rotate: 0,
                    imm8: 0,
                });
                out.push(Op::ShiftReg { op: ShiftOp::Ror, cond: Cond::Al, rd: dst, rm: lhs, rs: scratch });
            }
        }
        out.into_iter().map(ArmV7Op).collect()
    }

    fn cmp(&self, op: CmpOp, _width: Width, dst: u8, lhs: u8, rhs: u8) -> Vec<Self::Op> {
        vec![
            ArmV7Op(Op::DpImm { op: DpOp::Mov, cond: Cond::Al, s: false, rd: dst, rn: 0, rotate: 0, imm8: 0 }),
            ArmV7Op(Op::Cmp { cond: Cond::Al, rn: lhs, rm: rhs }),
            ArmV7Op(Op::DpImm { op: DpOp::Mov, cond: cond_of(op), s: false, rd: dst, rn: 0, rotate: 0, imm8: 1 }),
        ]
    }

    fn clz(&self, _width: Width, dst: u8, src: u8) -> Vec<Self::Op> {
        vec![ArmV7Op(Op::Clz { cond: Cond::Al, rd: dst, rm: src })]
    }

    fn ctz(&self, _width: Width, dst: u8, src: u8) -> Vec<Self::Op> {
        let scratch = self.abi.0.scratch_reg;
        vec![
            ArmV7Op(Op::Rbit { cond: Cond::Al, rd: scratch, rm: src }),
            ArmV7Op(Op::Clz { cond: Cond::Al, rd: dst, rm: scratch }),
        ]
    }

    fn select(&self, _width: Width, dst: u8, if_true: u8, if_false: u8, cond: u8) -> Vec<Self::Op> {
        let scratch = self.abi.0.scratch_reg;
        let mut out = vec![
            Op::DpImm { op: DpOp::Mov, cond: Cond::Al, s: false, rd: scratch, rn: 0, rotate: 0, imm8: 0 },
            Op::Cmp { cond: Cond::Al, rn: cond, rm: scratch },
        ];
        if dst != if_true {
            out.push(Op::DpReg { op: DpOp::Mov, cond: Cond::Al, s: false, rd: dst, rn: 0, rm: if_true });
        }
        out.push(Op::DpReg { op: DpOp::Mov, cond: Cond::Eq, s: false, rd: dst, rn: 0, rm: if_false });
        out.into_iter().map(ArmV7Op).collect()
    }

    fn load_memory(
        &self,
        dst: u8,
        base: u8,
        offset: i32,
        width: WasmMemWidth,
        signed: bool,
        _dst_width: Width,
    ) -> Vec<Self::Op> {
        vec![ArmV7Op(Op::Load { cond: Cond::Al, rd: dst, rn: base, offset, width: mem_width(width), signed })]
    }

    fn store_memory(&self, src: u8, base: u8, offset: i32, width: WasmMemWidth) -> Vec<Self::Op> {
        vec![ArmV7Op(Op::Store { cond: Cond::Al, rd: src, rn: base, offset, width: mem_width(width) })]
    }

    fn jump(&self, label: String) -> Self::Op {
        ArmV7Op(Op::B { cond: Cond::Al, label })
    }

    fn jump_if_zero(&self, cond_reg: u8, _width: Width, label: String) -> Vec<Self::Op> {
        let scratch = self.abi.0.scratch_reg;
        vec![
            ArmV7Op(Op::DpImm { op: DpOp::Mov, cond: Cond::Al, s: false, rd: scratch, rn: 0, rotate: 0, imm8: 0 }),
            ArmV7Op(Op::Cmp { cond: Cond::Al, rn: cond_reg, rm: scratch }),
            ArmV7Op(Op::B { cond: Cond::Eq, label }),
        ]
    }

    fn jump_if_nonzero(&self, cond_reg: u8, _width: Width, label: String) -> Vec<Self::Op> {
        let scratch = self.abi.0.scratch_reg;
        vec![
            ArmV7Op(Op::DpImm { op: DpOp::Mov, cond: Cond::Al, s: false, rd: scratch, rn: 0, rotate: 0, imm8: 0 }),
            ArmV7Op(Op::Cmp { cond: Cond::Al, rn: cond_reg, rm: scratch }),
            ArmV7Op(Op::B { cond: Cond::Ne, label }),
        ]
    }

    /// No `CMP`-with-immediate encoding in this `Op` enum, so each arm's
    /// index constant goes through `load_const` (rotated immediate or
    /// literal pool, whichever fits) before the compare.
    fn jump_table(&self, index_reg: u8, targets: &[String], default: String) -> Vec<Self::Op> {
        let scratch = self.abi.0.scratch_reg;
        let mut out = Vec::new();
        for (i, target) in targets.iter().enumerate() {
            out.extend(self.load_const(scratch, i as i64, Width::W32));
            out.push(ArmV7Op(Op::Cmp { cond: Cond::Al, rn: index_reg, rm: scratch }));
            out.push(ArmV7Op(Op::B { cond: Cond::Eq, label: target.clone() }));
        }
        out.push(ArmV7Op(Op::B { cond: Cond::Al, label: default }));
        out
    }

    fn call(&self, label: String) -> Self::Op {
        ArmV7Op(Op::Bl { cond: Cond::Al, label })
    }

    fn call_indirect(&self, reg: u8) -> Self::Op {
        ArmV7Op(Op::Blx { cond: Cond::Al, rm: reg })
    }

    fn ret(&self) -> Self::Op {
        ArmV7Op(Op::Bx { cond: Cond::Al, rm: LR })
    }

    fn trap(&self) -> Self::Op {
        ArmV7Op(Op::Trap)
    }

    fn nop(&self) -> Self::Op {
        ArmV7Op(Op::Nop)
    }

    fn frame_store_raw(&self, src: u8, fp_offset: i32) -> Self::Op {
        ArmV7Op(Op::Store { cond: Cond::Al, rd: src, rn: R11, offset: -fp_offset, width: MemWidth::B32 })
    }

    fn frame_load_raw(&self, dst: u8, fp_offset: i32) -> Self::Op {
        ArmV7Op(Op::Load { cond: Cond::Al, rd: dst, rn: R11, offset: -fp_offset, width: MemWidth::B32, signed: false })
    }

    /// Tries a single rotated-immediate `ADD`/`SUB sp, sp, #imm` first;
    /// outsized frames fall back to loading the magnitude into the
    /// scratch register and adding that instead.
    fn adjust_stack_pointer(&self, delta: i32) -> Vec<Self::Op> {
        let dp = if delta < 0 { DpOp::Sub } else { DpOp::Add };
        let mag = delta.unsigned_abs();
        if let Some((rotate, imm8)) = encode_arm_immediate(mag) {
            vec![ArmV7Op(Op::DpImm { op: dp, cond: Cond::Al, s: false, rd: SP, rn: SP, rotate, imm8 })]
        } else {
            let scratch = self.abi.0.scratch_reg;
            let mut out = self.load_const(scratch, i64::from(mag), Width::W32);
            out.push(ArmV7Op(Op::DpReg { op: dp, cond: Cond::Al, s: false, rd: SP, rn: SP, rm: scratch }));
            out
        }
    }

    fn drain_pending_pool(&self) -> Vec<Self::Op> {
        self.pool.borrow_mut().drain(..).map(ArmV7Op).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bx_lr_matches_spec_scenario() {
        let symbols = SymbolTable::new();
        let bytes = encode(&Op::Bx { cond: Cond::Al, rm: LR }, 0, &symbols).unwrap();
        assert_eq!(bytes, vec![0x1E, 0xFF, 0x2F, 0xE1]);
    }

    #[test]
    fn mov_r0_42_matches_spec_scenario() {
        let op = Op::DpImm {
            op: DpOp::Mov,
            cond: Cond::Al,
            s: false,
            rd: R0,
            rn: 0,
            rotate: 0,
            imm8: 42,
        };
        let symbols = SymbolTable::new();
        let bytes = encode(&op, 0, &symbols).unwrap();
        assert_eq!(bytes, vec![0x2A, 0x00, 0xA0, 0xE3]);
    }

    #[test]
    fn mov_r0_255_uses_zero_rotation() {
        let (rotate, residue) = encode_arm_immediate(255).unwrap();
        assert_eq!((rotate, residue), (0, 255));
    }

    #[test]
    fn size_estimate_is_always_four() {
        assert_eq!(size_estimate(&Op::Nop), 4);
        assert_eq!(
            size_estimate(&Op::PoolWord { label: "l".into(), value: 0 }),
            4
        );
    }

    #[test]
    fn load_store_roundtrip_opcode_bits_are_stable() {
        let symbols = SymbolTable::new();
        let store = Op::Store {
            cond: Cond::Al,
            rd: R0,
            rn: R11,
            offset: -16,
            width: MemWidth::B32,
        };
        let bytes = encode(&store, 0, &symbols).unwrap();
        assert_eq!(bytes.len(), 4);
    }
}
