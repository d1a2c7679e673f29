//! End-to-end byte-exact scenarios (spec §8's concrete seeds), one test
//! per scenario, in the style of the teacher's `tests/*.rs` integration
//! suite. Since the WAT text parser is an external collaborator (spec
//! §1), these construct `Module`/`Function` ASTs directly rather than
//! parsing `.wat` source, the way the teacher's own `test_harness` module
//! lets `operator_coverage.rs` build `IrInstruction` sequences by hand.

use wasm_codegen::{compile, compile_with_options, CompileOptions, Container, Function, Instr, Isa, Module, ValueType};

fn single_function_module(function: Function) -> Module {
    Module::new().with_functions(vec![function])
}

/// Scenario 1: `(func $f (result i32) (i32.const 0))` on x86-64 contains
/// `mov eax, 0` (`B8 00 00 00 00`) and the assembler's exit is `C3`.
#[test]
fn x86_64_empty_return_contains_mov_and_ret() {
    let module = single_function_module(
        Function::new("f")
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::I32Const(0)]),
    );
    let (bytes, diagnostics) = compile(&module, Isa::X86_64);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert!(bytes.windows(5).any(|w| w == [0xB8, 0x00, 0x00, 0x00, 0x00]));
    assert_eq!(bytes.last().copied(), Some(0xC3));
}

/// Scenario 2: a function whose body is just the implicit return emits
/// `C0 03 5F D6` (`ret`) at the exit label on AArch64.
#[test]
fn aarch64_implicit_return_emits_ret_bytes() {
    let module = single_function_module(Function::new("f"));
    let (bytes, diagnostics) = compile(&module, Isa::Aarch64);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert!(bytes.windows(4).any(|w| w == [0xC0, 0x03, 0x5F, 0xD6]));
}

/// Scenario 3: a NOP-body function returning nothing emits `1E FF 2F E1`
/// (`bx lr`) on ARMv7.
#[test]
fn armv7_nop_body_emits_bx_lr_bytes() {
    let module = single_function_module(Function::new("f").with_body(vec![Instr::Nop]));
    let (bytes, diagnostics) = compile(&module, Isa::Armv7);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert!(bytes.windows(4).any(|w| w == [0x1E, 0xFF, 0x2F, 0xE1]));
}

/// Scenario 4: adding two locals reaches virtual-stack depth 1 (the
/// single `i32` result) with exactly one ALU add in the emitted code, and
/// the whole function assembles without a size mismatch.
#[test]
fn x86_64_add_two_locals_assembles_cleanly() {
    let module = single_function_module(
        Function::new("f")
            .with_params(vec![ValueType::I32, ValueType::I32])
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::LocalGet(0), Instr::LocalGet(1), Instr::I32Add]),
    );
    let (bytes, diagnostics) = compile(&module, Isa::X86_64);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert!(!bytes.is_empty());
}

/// Scenario 5: ARMv7 immediate encoding — `mov r0, #42` is exactly
/// `2A 00 A0 E3`; a value needing literal pool fallback or rotation still
/// assembles without a pass-1/pass-2 size mismatch.
#[test]
fn armv7_mov_r0_42_matches_exact_bytes() {
    let module = single_function_module(
        Function::new("f")
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::I32Const(42)]),
    );
    let (bytes, diagnostics) = compile(&module, Isa::Armv7);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert!(bytes.windows(4).any(|w| w == [0x2A, 0x00, 0xA0, 0xE3]));
}

#[test]
fn armv7_large_immediate_still_assembles_via_rotation_or_literal_pool() {
    let module = single_function_module(
        Function::new("f")
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::I32Const(1024)]),
    );
    let (bytes, diagnostics) = compile(&module, Isa::Armv7);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert!(!bytes.is_empty());
}

/// Scenario 6: x86-64 PE container wrapping a small code buffer — `MZ`,
/// PE signature at `0x80`, `Machine` = `0x8664`, code at file offset
/// `0x200`, total length a multiple of 512.
#[test]
fn x86_64_pe_container_has_exact_header_layout() {
    let module = single_function_module(
        Function::new("f")
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::I32Const(0)]),
    );
    let options = CompileOptions::new(Isa::X86_64).with_container(Container::Pe);
    let (bytes, diagnostics) = compile_with_options(&module, &options);
    assert!(diagnostics.is_empty(), "{diagnostics:?}");
    assert_eq!(&bytes[0..2], &[0x4D, 0x5A]);
    assert_eq!(&bytes[0x80..0x84], b"PE\0\0");
    assert_eq!(u16::from_le_bytes(bytes[0x84..0x86].try_into().unwrap()), 0x8664);
    assert_eq!(bytes.len() % 512, 0);
}

#[test]
fn every_supported_isa_compiles_the_same_module_without_diagnostics() {
    let module = single_function_module(
        Function::new("f")
            .with_params(vec![ValueType::I32])
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::LocalGet(0), Instr::I32Const(1), Instr::I32Add]),
    );
    for isa in [Isa::X86_64, Isa::X86_32, Isa::X86_16, Isa::Aarch64, Isa::Armv7] {
        let (bytes, diagnostics) = compile(&module, isa);
        assert!(diagnostics.is_empty(), "{isa:?}: {diagnostics:?}");
        assert!(!bytes.is_empty(), "{isa:?} produced no bytes");
    }
}

#[test]
fn module_with_unresolvable_branch_depth_reports_a_diagnostic_instead_of_panicking() {
    // `br 5` inside a body with no enclosing block/loop frames exceeds the
    // label-stack height (spec §3's invariant), so the driver surfaces
    // `InvalidBranchDepth` as a per-function diagnostic (spec §7) and
    // skips the function rather than panicking or emitting corrupt IR —
    // verified here at the pipeline level rather than unit level, since
    // it is the end-to-end behavior a caller actually observes.
    let module = single_function_module(Function::new("f").with_body(vec![Instr::Br(5)]));
    let (bytes, diagnostics) = compile(&module, Isa::X86_64);
    assert!(bytes.is_empty());
    assert_eq!(diagnostics.len(), 1);
    assert!(matches!(
        diagnostics[0].error,
        wasm_codegen::Error::InvalidBranchDepth { depth: 5, height: 0 }
    ));
}
