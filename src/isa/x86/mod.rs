//! Shared x86 instruction representation and encoder (spec §4.5), used by
//! the x86-64, x86-32 and x86-16 targets. The three targets differ only in
//! default operand width, REX-prefix availability and jump-displacement
//! width; the ModR/M, immediate-size-reduction and addressing logic below
//! is the same for all three.
//!
//! Addressing is restricted to `[base_reg + disp8/32]` with no SIB byte:
//! this crate's lowering only ever addresses through the frame pointer or
//! the dedicated memory-base register, neither of which is ever `esp`/
//! `r12` (the encodings that would force a SIB byte), so the restriction
//! never bites in practice.

pub mod x86_16;
pub mod x86_32;
pub mod x86_64;

use crate::error::{Error, Result};
use crate::isa::{BranchRange, SymbolTable};

/// Operand width for an x86 instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W16,
    W32,
    W64,
}

/// Which of the three x86 targets is encoding. Determines default operand
/// width, REX-prefix legality, and branch-displacement width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    X64,
    X32,
    X16,
}

impl Mode {
    const fn default_width(self) -> Width {
        match self {
            Mode::X64 | Mode::X32 => Width::W32,
            Mode::X16 => Width::W16,
        }
    }

    const fn allows_rex(self) -> bool {
        matches!(self, Mode::X64)
    }

    /// Near-jump/call displacement field width in bytes.
    const fn jump_disp_bytes(self) -> usize {
        match self {
            Mode::X64 | Mode::X32 => 4,
            Mode::X16 => 2,
        }
    }

    #[must_use]
    pub fn branch_range(self) -> BranchRange {
        BranchRange {
            field_bits: (self.jump_disp_bytes() * 8) as u32,
            quantum: 1,
            pipeline_offset: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    And,
    Or,
    Xor,
    Cmp,
}

impl AluOp {
    const fn reg_reg_opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x01,
            AluOp::Sub => 0x29,
            AluOp::And => 0x21,
            AluOp::Or => 0x09,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
        }
    }

    /// `/digit` extension for the 0x81/0x83 immediate-group opcodes.
    const fn imm_group_digit(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShiftOp {
    Shl,
    ShrLogical,
    ShrArith,
    Rotl,
    Rotr,
}

impl ShiftOp {
    const fn digit(self) -> u8 {
        match self {
            ShiftOp::Rotl => 0,
            ShiftOp::Rotr => 1,
            ShiftOp::Shl => 4,
            ShiftOp::ShrLogical => 5,
            ShiftOp::ShrArith => 7,
        }
    }
}

/// x86 condition codes used by `Jcc`/`Setcc`/`Cmov`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cond {
    Eq,
    Ne,
    LtS,
    LeS,
    GeS,
    GtS,
    LtU,
    LeU,
    GeU,
    GtU,
}

impl Cond {
    const fn code(self) -> u8 {
        match self {
            Cond::Eq => 0x4,
            Cond::Ne => 0x5,
            Cond::LtS => 0xC,
            Cond::GeS => 0xD,
            Cond::LeS => 0xE,
            Cond::GtS => 0xF,
            Cond::LtU => 0x2,
            Cond::GeU => 0x3,
            Cond::LeU => 0x6,
            Cond::GtU => 0x7,
        }
    }
}

/// One x86 memory operand: `[base + disp]`, no SIB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mem {
    pub base: u8,
    pub disp: i32,
}

/// A load/store sub-width, independent of the destination register width
/// (e.g. `i32.load8_u` loads 8 bits into a 32-bit register).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemWidth {
    B8,
    B16,
    B32,
    B64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    MovRegReg {
        width: Width,
        dst: u8,
        src: u8,
    },
    /// Always uses the full-width immediate form (`B8+reg id32/imm64`) so
    /// pass-1/pass-2 agree without inspecting label distances.
    MovRegImm {
        width: Width,
        dst: u8,
        imm: i64,
    },
    AluRegReg {
        op: AluOp,
        width: Width,
        dst: u8,
        src: u8,
    },
    /// Immediate size (8-bit vs 32-bit form) is chosen from `imm` itself,
    /// which is fixed at construction time — never from a label distance.
    AluRegImm {
        op: AluOp,
        width: Width,
        dst: u8,
        imm: i32,
    },
    /// `dst *= src` (`IMUL r, r/m`, two-operand form).
    Imul {
        width: Width,
        dst: u8,
        src: u8,
    },
    /// Signed/unsigned divide: sign/zero-extends `rax`/`eax` into
    /// `rdx`/`edx` first (`cqo`/`cdq`), then `idiv`/`div src`. Quotient in
    /// `rax`, remainder in `rdx`.
    Div {
        width: Width,
        signed: bool,
        src: u8,
    },
    ShiftRegImm {
        op: ShiftOp,
        width: Width,
        dst: u8,
        amount: u8,
    },
    /// Variable-count shift/rotate; the count must already be in `cl`.
    ShiftRegCl {
        op: ShiftOp,
        width: Width,
        dst: u8,
    },
    Not {
        width: Width,
        dst: u8,
    },
    Neg {
        width: Width,
        dst: u8,
    },
    /// `POPCNT`/`LZCNT`/`TZCNT` (assumes SSE4.2/BMI1 are present on the
    /// host, a simplification noted in DESIGN.md).
    BitCount {
        kind: BitCountOp,
        width: Width,
        dst: u8,
        src: u8,
    },
    Test {
        width: Width,
        a: u8,
        b: u8,
    },
    Setcc {
        cond: Cond,
        dst: u8,
    },
    Movzx8 {
        width: Width,
        dst: u8,
        src: u8,
    },
    Cmov {
        cond: Cond,
        width: Width,
        dst: u8,
        src: u8,
    },
    LoadMem {
        dst: u8,
        width: Width,
        mem: Mem,
        mem_width: MemWidth,
        signed: bool,
    },
    StoreMem {
        src: u8,
        mem: Mem,
        mem_width: MemWidth,
    },
    /// Sign/zero-extend `src` into `dst` from a sub-width (`local.tee`
    /// conversions, `i32.extend8_s`, etc).
    ExtendReg {
        dst: u8,
        src: u8,
        from_width: MemWidth,
        dst_width: Width,
        signed: bool,
    },
    Push {
        reg: u8,
    },
    Pop {
        reg: u8,
    },
    Jmp {
        label: String,
    },
    Jcc {
        cond: Cond,
        label: String,
    },
    /// Indirect jump through a register (used by `br_table`'s jump-table
    /// dispatch and `call_indirect`).
    JmpInd {
        reg: u8,
    },
    Call {
        label: String,
    },
    CallInd {
        reg: u8,
    },
    Ret,
    /// `UD2` — traps (`unreachable`, integer-division-by-zero guard).
    Trap,
    Nop,
    /// One little-endian `u32` jump-table entry (`br_table`'s dispatch
    /// table), resolved against `symbols` like a branch displacement.
    JumpTableEntry {
        label: String,
        table_base: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitCountOp {
    Popcnt,
    Lzcnt,
    Tzcnt,
}

/// Register ids 0/1/2/3 name the accumulator/counter/data/base registers
/// identically in all three of this crate's x86 numbering tables
/// (`x86_64`'s rax/rcx/rdx/rbx, `x86_32`'s eax/ecx/edx/ebx, `x86_16`'s
/// ax/cx/dx/bx), so the hardware-mandated operands of `mul`/`div`/variable
/// shifts can be named once here instead of three times.
const EAX: u8 = 0;
const ECX: u8 = 1;
const EDX: u8 = 2;

const fn modrm(md: u8, reg: u8, rm: u8) -> u8 {
    (md << 6) | ((reg & 7) << 3) | (rm & 7)
}

fn rex(mode: Mode, w: bool, reg: u8, rm: u8) -> Option<u8> {
    if !mode.allows_rex() {
        return None;
    }
    let r = u8::from(reg >= 8);
    let b = u8::from(rm >= 8);
    if !w && r == 0 && b == 0 {
        return None;
    }
    Some(0x40 | (u8::from(w) << 3) | (r << 2) | (b << 0))
}

fn fits_i8(v: i64) -> bool {
    v >= i64::from(i8::MIN) && v <= i64::from(i8::MAX)
}

/// Translate a memory operand's base register into its ModR/M `r/m` field
/// code. In 32-/64-bit mode this is just the register's own low 3 bits
/// (base+disp addressing, no SIB). In 16-bit mode the `r/m` table has no
/// base-register correspondence at all — `r/m=110` means BP-relative and
/// `r/m=111` means BX-relative regardless of how those registers are
/// numbered elsewhere — so this crate restricts 16-bit memory operands to
/// exactly those two bases (the frame pointer and the memory-base
/// register, see `x86_16::abi`).
fn mem_rm_code(mode: Mode, base: u8) -> u8 {
    if mode == Mode::X16 {
        match base {
            super::x86_16::BP => 0b110,
            super::x86_16::BX => 0b111,
            _ => unreachable!("x86-16 memory operands must base off bp or bx"),
        }
    } else {
        base & 7
    }
}

/// Whether `rm_code` is the one r/m encoding that a zero displacement
/// cannot represent directly (`mod=00` means something else): `101` in
/// 32-/64-bit mode (would mean RIP/disp32-only) and `110` in 16-bit mode
/// (would mean a bare disp16).
fn rm_code_needs_forced_disp8(mode: Mode, rm_code: u8) -> bool {
    if mode == Mode::X16 {
        rm_code == 0b110
    } else {
        rm_code == 0b101
    }
}

/// Encode `mod/rm` (+ optional SIB-free displacement) for a register
/// operand (`reg`) against either another register or `[base+disp]`.
fn encode_modrm_reg_mem(mode: Mode, reg: u8, rm: RegOrMem) -> Vec<u8> {
    match rm {
        RegOrMem::Reg(rm_reg) => vec![modrm(0b11, reg, rm_reg)],
        RegOrMem::Mem(mem) => {
            let mut out = Vec::new();
            let rm_code = mem_rm_code(mode, mem.base);
            if mem.disp == 0 && !rm_code_needs_forced_disp8(mode, rm_code) {
                out.push(modrm(0b00, reg, rm_code));
            } else if fits_i8(i64::from(mem.disp)) {
                out.push(modrm(0b01, reg, rm_code));
                out.push(mem.disp as i8 as u8);
            } else if mode == Mode::X16 {
                out.push(modrm(0b10, reg, rm_code));
                out.extend((mem.disp as i16).to_le_bytes());
            } else {
                out.push(modrm(0b10, reg, rm_code));
                out.extend((mem.disp).to_le_bytes());
            }
            out
        }
    }
}

enum RegOrMem {
    Reg(u8),
    Mem(Mem),
}

fn width_prefix_bytes(mode: Mode, width: Width) -> Vec<u8> {
    // 0x66 operand-size override when the instruction's width differs
    // from the mode's default 16/32-bit width.
    if width != Width::W64 && width != mode.default_width() {
        vec![0x66]
    } else {
        Vec::new()
    }
}

/// Byte size of the ModR/M (+ disp) bytes `encode_modrm_reg_mem` would
/// produce for this operand, without constructing them.
fn modrm_len(mode: Mode, rm: RegOrMem) -> usize {
    match rm {
        RegOrMem::Reg(_) => 1,
        RegOrMem::Mem(mem) => {
            let rm_code = mem_rm_code(mode, mem.base);
            if mem.disp == 0 && !rm_code_needs_forced_disp8(mode, rm_code) {
                1
            } else if fits_i8(i64::from(mem.disp)) {
                2
            } else if mode == Mode::X16 {
                3
            } else {
                5
            }
        }
    }
}

pub(crate) fn size_estimate(op: &Op, mode: Mode) -> usize {
    match op {
        Op::MovRegReg { width, dst, src } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, *src, *dst).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*dst))
        }
        Op::MovRegImm { width, dst, imm: _ } => {
            let pre = width_prefix_bytes(mode, *width).len();
            let rex_len = rex(mode, *width == Width::W64, 0, *dst).is_some() as usize;
            let imm_len = match width {
                Width::W16 => 2,
                Width::W32 => 4,
                Width::W64 => 8,
            };
            pre + rex_len + 1 + imm_len
        }
        Op::AluRegReg { width, dst, src, .. } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, *src, *dst).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*dst))
        }
        Op::AluRegImm {
            width, dst, imm, ..
        } => {
            let imm_bytes = if fits_i8(i64::from(*imm)) {
                1
            } else {
                match width {
                    Width::W16 => 2,
                    _ => 4,
                }
            };
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, 0, *dst).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*dst))
                + imm_bytes
        }
        Op::Imul { width, dst, src } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, *dst, *src).is_some() as usize
                + 2
                + modrm_len(mode, RegOrMem::Reg(*src))
        }
        Op::Div { width, src, signed } => {
            // Sign-extension prefix: `cdq`/`cqo` (1-2 bytes) for signed
            // division, `xor edx, edx` (2-4 bytes) to zero it for
            // unsigned; then `idiv`/`div` itself (2-3 bytes).
            let ext = if *signed {
                rex(mode, *width == Width::W64, 0, 0).is_some() as usize + 1
            } else {
                width_prefix_bytes(mode, *width).len()
                    + rex(mode, *width == Width::W64, EDX, EDX).is_some() as usize
                    + 1
                    + modrm_len(mode, RegOrMem::Reg(EDX))
            };
            let idiv = width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, 0, *src).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*src));
            ext + idiv
        }
        Op::ShiftRegImm { width, dst, .. } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, 0, *dst).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*dst))
                + 1
        }
        Op::ShiftRegCl { width, dst, .. } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, 0, *dst).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*dst))
        }
        Op::Not { width, dst } | Op::Neg { width, dst } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, 0, *dst).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*dst))
        }
        Op::BitCount { width, dst, src, .. } => {
            1 + width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, *dst, *src).is_some() as usize
                + 2
                + modrm_len(mode, RegOrMem::Reg(*src))
        }
        Op::Test { width, a, b } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, *a, *b).is_some() as usize
                + 1
                + modrm_len(mode, RegOrMem::Reg(*b))
        }
        Op::Setcc { dst, .. } => {
            // `setcc` (rex? + 0F 9x + modrm) followed by the `movzx` that
            // zero-extends the byte result into the full register (0F B6 +
            // modrm), matching the two-instruction sequence in `encode`.
            let modrm = modrm_len(mode, RegOrMem::Reg(*dst));
            rex(mode, false, 0, *dst).is_some() as usize + 4 + 2 * modrm
        }
        Op::Movzx8 { width, dst, src } => {
            rex(mode, *width == Width::W64, *dst, *src).is_some() as usize
                + 3
                + modrm_len(mode, RegOrMem::Reg(*src))
                - 1
        }
        Op::Cmov { width, dst, src, .. } => {
            width_prefix_bytes(mode, *width).len()
                + rex(mode, *width == Width::W64, *dst, *src).is_some() as usize
                + 2
                + modrm_len(mode, RegOrMem::Reg(*src))
        }
        Op::LoadMem {
            dst,
            width,
            mem,
            mem_width,
            signed,
        } => {
            let rm_len = modrm_len(mode, RegOrMem::Mem(*mem));
            match mem_width {
                MemWidth::B64 | MemWidth::B32 if matches!(mem_width, MemWidth::B32) && *width == Width::W64 && !*signed => {
                    // mov dword, implicit zero-extend to 64 — same as plain 32-bit mov
                    width_prefix_bytes(mode, Width::W32).len()
                        + rex(mode, false, *dst, mem.base).is_some() as usize
                        + 1
                        + rm_len
                }
                MemWidth::B64 => {
                    rex(mode, true, *dst, mem.base).is_some() as usize + 1 + rm_len
                }
                MemWidth::B32 => {
                    width_prefix_bytes(mode, *width).len()
                        + rex(mode, *width == Width::W64, *dst, mem.base).is_some() as usize
                        + if *width == Width::W64 { 3 } else { 1 }
                        + rm_len
                }
                MemWidth::B8 | MemWidth::B16 => {
                    width_prefix_bytes(mode, *width).len()
                        + rex(mode, *width == Width::W64, *dst, mem.base).is_some() as usize
                        + 3
                        + rm_len
                }
            }
        }
        Op::StoreMem { src, mem, mem_width } => {
            let rm_len = modrm_len(mode, RegOrMem::Mem(*mem));
            let w = match mem_width {
                MemWidth::B64 => Width::W64,
                MemWidth::B32 => Width::W32,
                MemWidth::B16 => Width::W16,
                MemWidth::B8 => Width::W16,
            };
            let opcode_len = if matches!(mem_width, MemWidth::B8) { 1 } else { 1 };
            width_prefix_bytes(mode, if matches!(mem_width, MemWidth::B16) { Width::W16 } else { w }).len()
                + rex(mode, matches!(mem_width, MemWidth::B64), *src, mem.base).is_some() as usize
                + opcode_len
                + rm_len
        }
        Op::ExtendReg {
            dst,
            src,
            dst_width,
            ..
        } => {
            width_prefix_bytes(mode, *dst_width).len()
                + rex(mode, *dst_width == Width::W64, *dst, *src).is_some() as usize
                + 3
                + modrm_len(mode, RegOrMem::Reg(*src))
                - 1
        }
        Op::Push { reg } | Op::Pop { reg } => {
            rex(mode, false, 0, *reg).is_some() as usize + 1
        }
        Op::Jmp { .. } => 1 + mode.jump_disp_bytes(),
        Op::Jcc { .. } => 2 + mode.jump_disp_bytes(),
        Op::JmpInd { reg } => rex(mode, false, 0, *reg).is_some() as usize + 2,
        Op::Call { .. } => 1 + mode.jump_disp_bytes(),
        Op::CallInd { reg } => rex(mode, false, 0, *reg).is_some() as usize + 2,
        Op::Ret | Op::Trap | Op::Nop => {
            if matches!(op, Op::Trap) {
                2
            } else {
                1
            }
        }
        Op::JumpTableEntry { .. } => 4,
    }
}

pub(crate) fn encode(op: &Op, mode: Mode, pc: u32, symbols: &SymbolTable) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match op {
        Op::MovRegReg { width, dst, src } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, *src, *dst) {
                out.push(r);
            }
            out.push(0x89);
            out.extend(encode_modrm_reg_mem(mode, *src, RegOrMem::Reg(*dst)));
        }
        Op::MovRegImm { width, dst, imm } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, 0, *dst) {
                out.push(r);
            }
            out.push(0xB8 + (dst & 7));
            match width {
                Width::W16 => out.extend((*imm as i16).to_le_bytes()),
                Width::W32 => out.extend((*imm as i32).to_le_bytes()),
                Width::W64 => out.extend((*imm as i64).to_le_bytes()),
            }
        }
        Op::AluRegReg {
            op: alu, width, dst, src,
        } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, *src, *dst) {
                out.push(r);
            }
            out.push(alu.reg_reg_opcode());
            out.extend(encode_modrm_reg_mem(mode, *src, RegOrMem::Reg(*dst)));
        }
        Op::AluRegImm {
            op: alu, width, dst, imm,
        } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, 0, *dst) {
                out.push(r);
            }
            if fits_i8(i64::from(*imm)) {
                out.push(0x83);
                out.extend(encode_modrm_reg_mem(mode, alu.imm_group_digit(), RegOrMem::Reg(*dst)));
                out.push(*imm as i8 as u8);
            } else {
                out.push(0x81);
                out.extend(encode_modrm_reg_mem(mode, alu.imm_group_digit(), RegOrMem::Reg(*dst)));
                match width {
                    Width::W16 => out.extend((*imm as i16).to_le_bytes()),
                    _ => out.extend(imm.to_le_bytes()),
                }
            }
        }
        Op::Imul { width, dst, src } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, *dst, *src) {
                out.push(r);
            }
            out.push(0x0F);
            out.push(0xAF);
            out.extend(encode_modrm_reg_mem(mode, *dst, RegOrMem::Reg(*src)));
        }
        Op::Div { width, signed, src } => {
            if *signed {
                if let Some(r) = rex(mode, *width == Width::W64, 0, 0) {
                    out.push(r);
                }
                out.push(0x99); // cdq/cqo: sign-extend eax/rax into edx:eax / rdx:rax
            } else {
                // div's unsigned dividend occupies edx:eax too, but with
                // no sign to propagate edx is just zeroed outright.
                out.extend(width_prefix_bytes(mode, *width));
                if let Some(r) = rex(mode, *width == Width::W64, EDX, EDX) {
                    out.push(r);
                }
                out.push(AluOp::Xor.reg_reg_opcode());
                out.extend(encode_modrm_reg_mem(mode, EDX, RegOrMem::Reg(EDX)));
            }
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, 0, *src) {
                out.push(r);
            }
            out.push(0xF7);
            let digit = if *signed { 7 } else { 6 };
            out.extend(encode_modrm_reg_mem(mode, digit, RegOrMem::Reg(*src)));
        }
        Op::ShiftRegImm {
            op: sh, width, dst, amount,
        } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, 0, *dst) {
                out.push(r);
            }
            out.push(0xC1);
            out.extend(encode_modrm_reg_mem(mode, sh.digit(), RegOrMem::Reg(*dst)));
            out.push(*amount);
        }
        Op::ShiftRegCl { op: sh, width, dst } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, 0, *dst) {
                out.push(r);
            }
            out.push(0xD3);
            out.extend(encode_modrm_reg_mem(mode, sh.digit(), RegOrMem::Reg(*dst)));
        }
        Op::Not { width, dst } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, 0, *dst) {
                out.push(r);
            }
            out.push(0xF7);
            out.extend(encode_modrm_reg_mem(mode, 2, RegOrMem::Reg(*dst)));
        }
        Op::Neg { width, dst } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, 0, *dst) {
                out.push(r);
            }
            out.push(0xF7);
            out.extend(encode_modrm_reg_mem(mode, 3, RegOrMem::Reg(*dst)));
        }
        Op::BitCount { kind, width, dst, src } => {
            out.push(0xF3);
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, *dst, *src) {
                out.push(r);
            }
            out.push(0x0F);
            out.push(match kind {
                BitCountOp::Popcnt => 0xB8,
                BitCountOp::Lzcnt => 0xBD,
                BitCountOp::Tzcnt => 0xBC,
            });
            out.extend(encode_modrm_reg_mem(mode, *dst, RegOrMem::Reg(*src)));
        }
        Op::Test { width, a, b } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, *a, *b) {
                out.push(r);
            }
            out.push(0x85);
            out.extend(encode_modrm_reg_mem(mode, *a, RegOrMem::Reg(*b)));
        }
        Op::Setcc { cond, dst } => {
            if let Some(r) = rex(mode, false, 0, *dst) {
                out.push(r);
            }
            out.push(0x0F);
            out.push(0x90 + cond.code());
            out.extend(encode_modrm_reg_mem(mode, 0, RegOrMem::Reg(*dst)));
            // zero-extend the byte result into the full register.
            out.push(0x0F);
            out.push(0xB6);
            out.extend(encode_modrm_reg_mem(mode, *dst, RegOrMem::Reg(*dst)));
        }
        Op::Movzx8 { dst, src, .. } => {
            if let Some(r) = rex(mode, false, *dst, *src) {
                out.push(r);
            }
            out.push(0x0F);
            out.push(0xB6);
            out.extend(encode_modrm_reg_mem(mode, *dst, RegOrMem::Reg(*src)));
        }
        Op::Cmov { cond, width, dst, src } => {
            out.extend(width_prefix_bytes(mode, *width));
            if let Some(r) = rex(mode, *width == Width::W64, *dst, *src) {
                out.push(r);
            }
            out.push(0x0F);
            out.push(0x40 + cond.code());
            out.extend(encode_modrm_reg_mem(mode, *dst, RegOrMem::Reg(*src)));
        }
        Op::LoadMem {
            dst,
            width,
            mem,
            mem_width,
            signed,
        } => {
            encode_load(&mut out, mode, *dst, *width, *mem, *mem_width, *signed);
        }
        Op::StoreMem { src, mem, mem_width } => {
            encode_store(&mut out, mode, *src, *mem, *mem_width);
        }
        Op::ExtendReg {
            dst,
            src,
            from_width,
            dst_width,
            signed,
        } => {
            out.extend(width_prefix_bytes(mode, *dst_width));
            if let Some(r) = rex(mode, *dst_width == Width::W64, *dst, *src) {
                out.push(r);
            }
            out.push(0x0F);
            out.push(match (*from_width, *signed) {
                (MemWidth::B8, true) => 0xBE,
                (MemWidth::B8, false) => 0xB6,
                (MemWidth::B16, true) => 0xBF,
                (MemWidth::B16, false) => 0xB7,
                _ => return Err(Error::Internal("unsupported extend width".into())),
            });
            out.extend(encode_modrm_reg_mem(mode, *dst, RegOrMem::Reg(*src)));
        }
        Op::Push { reg } => {
            if let Some(r) = rex(mode, false, 0, *reg) {
                out.push(r);
            }
            out.push(0x50 + (reg & 7));
        }
        Op::Pop { reg } => {
            if let Some(r) = rex(mode, false, 0, *reg) {
                out.push(r);
            }
            out.push(0x58 + (reg & 7));
        }
        Op::Jmp { label } => {
            let target = *symbols
                .get(label)
                .ok_or_else(|| Error::UnresolvedLabel(label.clone()))?;
            out.push(0xE9);
            let disp_start = pc + 1 + mode.jump_disp_bytes() as u32;
            let disp = mode
                .branch_range()
                .displacement(i64::from(disp_start), i64::from(target))?;
            push_disp(&mut out, disp, mode.jump_disp_bytes());
        }
        Op::Jcc { cond, label } => {
            let target = *symbols
                .get(label)
                .ok_or_else(|| Error::UnresolvedLabel(label.clone()))?;
            out.push(0x0F);
            out.push(0x80 + cond.code());
            let disp_start = pc + 2 + mode.jump_disp_bytes() as u32;
            let disp = mode
                .branch_range()
                .displacement(i64::from(disp_start), i64::from(target))?;
            push_disp(&mut out, disp, mode.jump_disp_bytes());
        }
        Op::JmpInd { reg } => {
            if let Some(r) = rex(mode, false, 0, *reg) {
                out.push(r);
            }
            out.push(0xFF);
            out.extend(encode_modrm_reg_mem(mode, 4, RegOrMem::Reg(*reg)));
        }
        Op::Call { label } => {
            let target = *symbols
                .get(label)
                .ok_or_else(|| Error::UnresolvedLabel(label.clone()))?;
            out.push(0xE8);
            let disp_start = pc + 1 + mode.jump_disp_bytes() as u32;
            let disp = mode
                .branch_range()
                .displacement(i64::from(disp_start), i64::from(target))?;
            push_disp(&mut out, disp, mode.jump_disp_bytes());
        }
        Op::CallInd { reg } => {
            if let Some(r) = rex(mode, false, 0, *reg) {
                out.push(r);
            }
            out.push(0xFF);
            out.extend(encode_modrm_reg_mem(mode, 2, RegOrMem::Reg(*reg)));
        }
        Op::Ret => out.push(0xC3),
        Op::Trap => {
            out.push(0x0F);
            out.push(0x0B);
        }
        Op::Nop => out.push(0x90),
        Op::JumpTableEntry { label, table_base } => {
            let target = *symbols
                .get(label)
                .ok_or_else(|| Error::UnresolvedLabel(label.clone()))?;
            let base = *symbols
                .get(table_base)
                .ok_or_else(|| Error::UnresolvedLabel(table_base.clone()))?;
            out.extend((target as i32 - base as i32).to_le_bytes());
        }
    }
    Ok(out)
}

fn push_disp(out: &mut Vec<u8>, disp: i64, bytes: usize) {
    match bytes {
        2 => out.extend((disp as i16).to_le_bytes()),
        _ => out.extend((disp as i32).to_le_bytes()),
    }
}

fn encode_load(
    out: &mut Vec<u8>,
    mode: Mode,
    dst: u8,
    width: Width,
    mem: Mem,
    mem_width: MemWidth,
    signed: bool,
) {
    match mem_width {
        MemWidth::B64 => {
            if let Some(r) = rex(mode, true, dst, mem.base) {
                out.push(r);
            }
            out.push(0x8B);
            out.extend(encode_modrm_reg_mem(mode, dst, RegOrMem::Mem(mem)));
        }
        MemWidth::B32 => {
            // A plain 32-bit load zero-extends into the full 64-bit
            // register on x86-64 (no movzx needed).
            out.extend(width_prefix_bytes(mode, Width::W32));
            if let Some(r) = rex(mode, false, dst, mem.base) {
                out.push(r);
            }
            out.push(0x8B);
            out.extend(encode_modrm_reg_mem(mode, dst, RegOrMem::Mem(mem)));
            if width == Width::W64 && signed {
                // movsxd dst, dst (sign-extend the 32-bit value we just loaded)
                if let Some(r) = rex(mode, true, dst, dst) {
                    out.push(r);
                }
                out.push(0x63);
                out.extend(encode_modrm_reg_mem(mode, dst, RegOrMem::Reg(dst)));
            }
        }
        MemWidth::B8 | MemWidth::B16 => {
            out.extend(width_prefix_bytes(mode, width));
            if let Some(r) = rex(mode, width == Width::W64, dst, mem.base) {
                out.push(r);
            }
            out.push(0x0F);
            out.push(match (mem_width, signed) {
                (MemWidth::B8, true) => 0xBE,
                (MemWidth::B8, false) => 0xB6,
                (MemWidth::B16, true) => 0xBF,
                (MemWidth::B16, false) => 0xB7,
                _ => unreachable!(),
            });
            out.extend(encode_modrm_reg_mem(mode, dst, RegOrMem::Mem(mem)));
        }
    }
}

fn encode_store(out: &mut Vec<u8>, mode: Mode, src: u8, mem: Mem, mem_width: MemWidth) {
    match mem_width {
        MemWidth::B64 => {
            if let Some(r) = rex(mode, true, src, mem.base) {
                out.push(r);
            }
            out.push(0x89);
        }
        MemWidth::B32 => {
            out.extend(width_prefix_bytes(mode, Width::W32));
            if let Some(r) = rex(mode, false, src, mem.base) {
                out.push(r);
            }
            out.push(0x89);
        }
        MemWidth::B16 => {
            out.push(0x66);
            if let Some(r) = rex(mode, false, src, mem.base) {
                out.push(r);
            }
            out.push(0x89);
        }
        MemWidth::B8 => {
            if let Some(r) = rex(mode, false, src, mem.base) {
                out.push(r);
            }
            out.push(0x88);
        }
    }
    out.extend(encode_modrm_reg_mem(mode, src, RegOrMem::Mem(mem)));
}

/// Build the `Op` sequence for one `TargetBackend::alu` call, shared by
/// all three x86 widths (spec §4.3's arithmetic lowering, generalized
/// here instead of duplicated per mode). `dst` is moved from `lhs` first
/// if the two differ; every caller in `crate::lower` happens to pass
/// `dst == lhs`, so that move never actually emits.
pub(crate) fn alu_ops(op: crate::lower::ArithOp, width: Width, dst: u8, lhs: u8, rhs: u8) -> Vec<Op> {
    use crate::lower::ArithOp as A;
    let mut out = Vec::new();
    if dst != lhs {
        out.push(Op::MovRegReg { width, dst, src: lhs });
    }
    match op {
        A::Add => out.push(Op::AluRegReg { op: AluOp::Add, width, dst, src: rhs }),
        A::Sub => out.push(Op::AluRegReg { op: AluOp::Sub, width, dst, src: rhs }),
        A::And => out.push(Op::AluRegReg { op: AluOp::And, width, dst, src: rhs }),
        A::Or => out.push(Op::AluRegReg { op: AluOp::Or, width, dst, src: rhs }),
        A::Xor => out.push(Op::AluRegReg { op: AluOp::Xor, width, dst, src: rhs }),
        A::Mul => out.push(Op::Imul { width, dst, src: rhs }),
        A::DivS | A::DivU | A::RemS | A::RemU => out.extend(div_rem_ops(op, width, dst, rhs)),
        A::Shl | A::ShrS | A::ShrU | A::Rotl | A::Rotr => {
            out.extend(shift_ops(op, width, dst, rhs));
        }
    }
    out
}

/// `eax`/`edx` are hardwired by the `idiv`/`div` instruction itself; when
/// the divisor operand (`rhs`) happens to land in one of those two
/// registers (true whenever `rhs` is the data register — exactly the case
/// on x86-32/x86-16, whose four-register stack bank includes it), it is
/// relocated into `dst`'s register first, which is free at that point
/// since `dst`'s old value has already moved into `eax`.
fn div_rem_ops(op: crate::lower::ArithOp, width: Width, dst: u8, rhs: u8) -> Vec<Op> {
    use crate::lower::ArithOp as A;
    let signed = matches!(op, A::DivS | A::RemS);
    let wants_remainder = matches!(op, A::RemS | A::RemU);
    let mut out = Vec::new();

    if dst != EAX {
        out.push(Op::MovRegReg { width, dst: EAX, src: dst });
    }
    let divisor = if rhs == EAX || rhs == EDX {
        out.push(Op::MovRegReg { width, dst, src: rhs });
        dst
    } else {
        rhs
    };
    out.push(Op::Div { width, signed, src: divisor });

    let result = if wants_remainder { EDX } else { EAX };
    if dst != result {
        out.push(Op::MovRegReg { width, dst, src: result });
    }
    out
}

/// Variable-count shifts/rotates require the count in `cl`; since `dst`
/// must hold the shiftee in place, the two values are swapped through
/// `eax` the same way `div_rem_ops` swaps the dividend out of `dst`.
fn shift_ops(op: crate::lower::ArithOp, width: Width, dst: u8, rhs: u8) -> Vec<Op> {
    use crate::lower::ArithOp as A;
    let sh = match op {
        A::Shl => ShiftOp::Shl,
        A::ShrS => ShiftOp::ShrArith,
        A::ShrU => ShiftOp::ShrLogical,
        A::Rotl => ShiftOp::Rotl,
        A::Rotr => ShiftOp::Rotr,
        _ => unreachable!("shift_ops called with a non-shift ArithOp"),
    };
    let mut out = Vec::new();
    if dst != EAX {
        out.push(Op::MovRegReg { width, dst: EAX, src: dst });
    }
    if rhs != ECX {
        out.push(Op::MovRegReg { width, dst: ECX, src: rhs });
    }
    out.push(Op::ShiftRegCl { op: sh, width, dst: EAX });
    if dst != EAX {
        out.push(Op::MovRegReg { width, dst, src: EAX });
    }
    out
}

/// Build the `Op` sequence for one `TargetBackend::cmp` call: `cmp`/`setcc`
/// leaves a zero-extended 0/1 in `dst` (spec §4.5's condition-code
/// convention, shared by every width).
pub(crate) fn cmp_ops(op: crate::lower::CmpOp, width: Width, dst: u8, lhs: u8, rhs: u8) -> Vec<Op> {
    use crate::lower::CmpOp as C;
    let cond = match op {
        C::Eq => Cond::Eq,
        C::Ne => Cond::Ne,
        C::LtS => Cond::LtS,
        C::LtU => Cond::LtU,
        C::GtS => Cond::GtS,
        C::GtU => Cond::GtU,
        C::LeS => Cond::LeS,
        C::LeU => Cond::LeU,
        C::GeS => Cond::GeS,
        C::GeU => Cond::GeU,
    };
    vec![
        Op::AluRegReg { op: AluOp::Cmp, width, dst: lhs, src: rhs },
        Op::Setcc { cond, dst },
    ]
}

/// `br_table` dispatch as a linear compare-and-branch chain: one `cmp
/// index, i; je target_i` per table entry, falling through to `default`.
/// A real jump table would need a second label-producing channel this
/// trait method doesn't have (`jump_table` returns plain `Op`s, not
/// `Line`s), and WASM `br_table`s are rarely wide enough for the extra
/// indirection to matter (spec's Non-goal: no optimization).
pub(crate) fn jump_table_linear_scan(
    index_reg: u8,
    width: Width,
    targets: &[String],
    default: String,
) -> Vec<Op> {
    let mut out = Vec::new();
    for (i, target) in targets.iter().enumerate() {
        out.push(Op::AluRegImm {
            op: AluOp::Cmp,
            width,
            dst: index_reg,
            imm: i as i32,
        });
        out.push(Op::Jcc { cond: Cond::Eq, label: target.clone() });
    }
    out.push(Op::Jmp { label: default });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::SymbolTable;

    #[test]
    fn mov_eax_imm32_matches_spec_scenario() {
        let op = Op::MovRegImm {
            width: Width::W32,
            dst: 0,
            imm: 0,
        };
        let symbols = SymbolTable::new();
        let bytes = encode(&op, Mode::X64, 0, &symbols).unwrap();
        assert_eq!(bytes, vec![0xB8, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(size_estimate(&op, Mode::X64), bytes.len());
    }

    #[test]
    fn ret_is_single_byte() {
        let symbols = SymbolTable::new();
        let bytes = encode(&Op::Ret, Mode::X64, 0, &symbols).unwrap();
        assert_eq!(bytes, vec![0xC3]);
    }

    #[test]
    fn add_reg_reg_uses_0x01_opcode() {
        let op = Op::AluRegReg {
            op: AluOp::Add,
            width: Width::W32,
            dst: 0,
            src: 1,
        };
        let symbols = SymbolTable::new();
        let bytes = encode(&op, Mode::X64, 0, &symbols).unwrap();
        assert_eq!(bytes, vec![0x01, modrm(0b11, 1, 0)]);
    }

    #[test]
    fn alu_imm_selects_8_bit_form_when_it_fits() {
        let op = Op::AluRegImm {
            op: AluOp::Add,
            width: Width::W64,
            dst: 4,
            imm: 16,
        };
        let symbols = SymbolTable::new();
        let bytes = encode(&op, Mode::X64, 0, &symbols).unwrap();
        assert_eq!(size_estimate(&op, Mode::X64), bytes.len());
        assert_eq!(bytes[bytes.len() - 2], 0x83);
    }

    #[test]
    fn size_estimate_matches_encoded_length_across_variants() {
        let symbols = SymbolTable::new();
        let ops = vec![
            Op::MovRegReg {
                width: Width::W64,
                dst: 8,
                src: 1,
            },
            Op::Push { reg: 12 },
            Op::Imul {
                width: Width::W32,
                dst: 0,
                src: 3,
            },
            Op::Setcc {
                cond: Cond::Eq,
                dst: 0,
            },
            Op::LoadMem {
                dst: 0,
                width: Width::W64,
                mem: Mem { base: 5, disp: -16 },
                mem_width: MemWidth::B32,
                signed: false,
            },
        ];
        for op in ops {
            let bytes = encode(&op, Mode::X64, 0, &symbols).unwrap();
            assert_eq!(
                size_estimate(&op, Mode::X64),
                bytes.len(),
                "mismatch for {op:?}"
            );
            assert!(bytes.len() <= 15 && !bytes.is_empty());
        }
    }
}
