//! Property tests for the universal invariants spec §8 calls out across all
//! scenarios rather than one: pass-1/pass-2 size agreement (no assembler
//! ever reports a `SizeEstimateMismatch` for code this crate itself
//! generates), ARM's fixed 4-byte instruction width, and the PE container's
//! fixed 512-byte file alignment regardless of code size. Modeled on the
//! teacher's use of hand-built `IrInstruction` sequences in
//! `tests/operator_coverage.rs`, generalized here to randomly-sized but
//! always stack-balanced bodies (`N` consts followed by `N-1` adds) so
//! `proptest` can shrink toward a minimal failing body.

use proptest::prelude::*;
use wasm_codegen::{compile, compile_with_options, CompileOptions, Container, Function, Instr, Isa, Module, ValueType};

const ALL_ISAS: [Isa; 5] = [Isa::X86_64, Isa::X86_32, Isa::X86_16, Isa::Aarch64, Isa::Armv7];

fn balanced_add_chain(consts: &[i32]) -> Vec<Instr> {
    let mut body: Vec<Instr> = consts.iter().map(|&v| Instr::I32Const(v)).collect();
    for _ in 1..consts.len() {
        body.push(Instr::I32Add);
    }
    body
}

proptest! {
    /// Any stack-balanced body of i32 consts and adds assembles on every
    /// target without a pass-1/pass-2 size disagreement.
    #[test]
    fn balanced_const_add_chains_never_trigger_a_size_mismatch(consts in prop::collection::vec(any::<i32>(), 1..12)) {
        let module = Module::new().with_functions(vec![
            Function::new("f").with_results(vec![ValueType::I32]).with_body(balanced_add_chain(&consts)),
        ]);
        for isa in ALL_ISAS {
            let (_bytes, diagnostics) = compile(&module, isa);
            prop_assert!(diagnostics.is_empty(), "{isa:?}: {diagnostics:?}");
        }
    }

    /// AArch64 and ARMv7 emit only fixed-width 4-byte instructions (spec
    /// §4.5), so a function's flat code length is always a multiple of 4
    /// regardless of body shape or literal-pool fallbacks.
    #[test]
    fn arm_targets_always_emit_a_multiple_of_four_bytes(consts in prop::collection::vec(any::<i32>(), 0..12)) {
        let module = Module::new().with_functions(vec![
            Function::new("f").with_results(vec![ValueType::I32]).with_body(balanced_add_chain(&consts)),
        ]);
        for isa in [Isa::Aarch64, Isa::Armv7] {
            let (bytes, diagnostics) = compile(&module, isa);
            prop_assert!(diagnostics.is_empty(), "{isa:?}: {diagnostics:?}");
            prop_assert_eq!(bytes.len() % 4, 0, "{isa:?} produced {} bytes", bytes.len());
        }
    }

    /// The PE container (spec §4.7) is always 512-byte file-aligned and at
    /// least large enough to hold its header plus the code, no matter how
    /// much code it wraps.
    #[test]
    fn pe_container_length_is_always_512_byte_aligned(consts in prop::collection::vec(any::<i32>(), 0..20)) {
        let module = Module::new().with_functions(vec![
            Function::new("f").with_results(vec![ValueType::I32]).with_body(balanced_add_chain(&consts)),
        ]);
        let options = CompileOptions::new(Isa::X86_64).with_container(Container::Pe);
        let (bytes, diagnostics) = compile_with_options(&module, &options);
        prop_assert!(diagnostics.is_empty(), "{diagnostics:?}");
        prop_assert_eq!(bytes.len() % 512, 0);
        prop_assert!(bytes.len() >= 0x200);
    }
}
