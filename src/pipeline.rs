//! Pipeline driver (spec §4.8/§6): threads a `Module` through the function
//! lowerer, the two-pass assembler, and the container emitter, surfacing
//! `Diagnostic`s rather than panicking. Grounded in the teacher's
//! `translate::{compile, compile_with_options}` pair — a thin
//! options-free entry point plus an options-taking one sharing the same
//! core, `CompileOptions` named and shaped after the teacher's own.

use crate::assembler::{assemble, Line};
use crate::ast::Module;
use crate::container;
use crate::error::{Diagnostic, Error, Span};
use crate::isa::arm::{aarch64::Aarch64Backend, armv7::ArmV7Backend};
use crate::isa::x86::{x86_16::X86_16Backend, x86_32::X86_32Backend, x86_64::X86_64Backend};
use crate::isa::{Container, Isa};
use crate::lower::{FunctionLowerer, TargetBackend};

/// Feature-gate / resource-limit struct (SPEC_FULL §2's ambient "config"
/// requirement) mirroring the teacher's `CompileOptions` builder pattern.
/// Only one limit exists today: a cap on a single function's instruction
/// count, since an unbounded body is the one input shape that can make the
/// virtual-stack spill area or frame size grow without useful bound.
#[derive(Debug, Clone, Default)]
pub struct Limits {
    pub max_function_body_instrs: Option<usize>,
}

impl Limits {
    #[must_use]
    pub fn with_max_function_body_instrs(mut self, max: usize) -> Self {
        self.max_function_body_instrs = Some(max);
        self
    }
}

/// Options for compilation (SPEC_FULL §2's `CompileOptions`-equivalent):
/// the `(target, container)` pair plus `Limits`.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    pub target: Isa,
    pub container: Container,
    pub limits: Limits,
}

impl CompileOptions {
    #[must_use]
    pub fn new(target: Isa) -> Self {
        Self {
            target,
            container: Container::Flat,
            limits: Limits::default(),
        }
    }

    #[must_use]
    pub fn with_container(mut self, container: Container) -> Self {
        self.container = container;
        self
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

/// Compile `module` for `target`, flat container, default limits.
#[must_use]
pub fn compile(module: &Module, target: Isa) -> (Vec<u8>, Vec<Diagnostic>) {
    compile_with_options(module, &CompileOptions::new(target))
}

/// Compile `module` per `options` — the surface named in spec §6:
/// `compile(wat_ast, target_isa, container) → (bytes, diagnostics)`.
#[must_use]
pub fn compile_with_options(module: &Module, options: &CompileOptions) -> (Vec<u8>, Vec<Diagnostic>) {
    tracing::debug!(target = ?options.target, functions = module.functions.len(), "pipeline: compile start");
    match options.target {
        Isa::X86_64 => compile_for(&X86_64Backend::new(), module, options),
        Isa::X86_32 => compile_for(&X86_32Backend::new(), module, options),
        Isa::X86_16 => compile_for(&X86_16Backend::new(), module, options),
        Isa::Aarch64 => compile_for(&Aarch64Backend::new(), module, options),
        Isa::Armv7 => compile_for(&ArmV7Backend::new(), module, options),
    }
}

/// One ISA's worth of the pipeline: lower every function (collecting a
/// diagnostic and skipping the function on fatal lowering error, per
/// spec §7's "driver may continue to later functions" policy), concatenate
/// the survivors' IR behind a `func_<index>:` label each (so `call`'s
/// `func_<index>` targets resolve across function boundaries — the
/// assembler's symbol table is built once, over the whole module, rather
/// than once per function, specifically to make this work), assemble once,
/// then hand the result to the container emitter.
fn compile_for<B: TargetBackend>(
    backend: &B,
    module: &Module,
    options: &CompileOptions,
) -> (Vec<u8>, Vec<Diagnostic>) {
    let mut diagnostics = Vec::new();
    let mut combined: Vec<Line<B::Op>> = Vec::new();

    for (index, function) in module.functions.iter().enumerate() {
        let span = Span {
            function_index: index as u32,
            instr_index: 0,
        };
        if let Some(max) = options.limits.max_function_body_instrs {
            if function.body.len() > max {
                diagnostics.push(Diagnostic::error(
                    Error::Internal(format!(
                        "function '{}' body has {} instructions, exceeding the configured limit of {max}",
                        function.name,
                        function.body.len()
                    )),
                    Some(span),
                ));
                continue;
            }
        }
        match lower_one(backend, function) {
            Ok(lines) => {
                combined.push(Line::Label(format!("func_{index}")));
                combined.extend(lines);
            }
            Err(error) => {
                tracing::debug!(function = %function.name, error = %error, "function lowering failed");
                diagnostics.push(Diagnostic::error(error, Some(span)));
            }
        }
    }

    if combined.is_empty() {
        return (Vec::new(), diagnostics);
    }

    match assemble(&combined) {
        Ok(code) => {
            tracing::debug!(bytes = code.len(), "pipeline: assembly complete");
            let wrapped = container::emit(&code, backend.isa(), options.container);
            (wrapped, diagnostics)
        }
        Err(error) => {
            diagnostics.push(Diagnostic::error(error, None));
            (Vec::new(), diagnostics)
        }
    }
}

fn lower_one<B: TargetBackend>(
    backend: &B,
    function: &crate::ast::Function,
) -> crate::error::Result<Vec<Line<B::Op>>> {
    let mut lowerer = FunctionLowerer::new(backend, function);
    lowerer.lower_function()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{Function, Instr, ValueType};

    #[test]
    fn empty_module_yields_no_diagnostics_and_empty_output() {
        let module = Module::new();
        let (bytes, diagnostics) = compile(&module, Isa::X86_64);
        assert!(bytes.is_empty());
        assert!(diagnostics.is_empty());
    }

    #[test]
    fn single_function_compiles_to_nonempty_flat_bytes() {
        let module = Module::new().with_functions(vec![Function::new("f")
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::I32Const(0)])]);
        let (bytes, diagnostics) = compile(&module, Isa::X86_64);
        assert!(diagnostics.is_empty());
        assert!(!bytes.is_empty());
        assert!(bytes.ends_with(&[0xC3]));
    }

    #[test]
    fn pe_container_wraps_the_same_module() {
        let module = Module::new().with_functions(vec![Function::new("f")
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::I32Const(0)])]);
        let options = CompileOptions::new(Isa::X86_64).with_container(Container::Pe);
        let (bytes, diagnostics) = compile_with_options(&module, &options);
        assert!(diagnostics.is_empty());
        assert_eq!(&bytes[0..2], &[0x4D, 0x5A]);
    }

    #[test]
    fn call_between_two_functions_resolves_cross_function_label() {
        let callee = Function::new("callee").with_results(vec![ValueType::I32]).with_body(vec![Instr::I32Const(7)]);
        let caller = Function::new("caller")
            .with_results(vec![ValueType::I32])
            .with_body(vec![Instr::Call(0)]);
        let module = Module::new().with_functions(vec![callee, caller]);
        let (bytes, diagnostics) = compile(&module, Isa::X86_64);
        assert!(diagnostics.is_empty());
        assert!(!bytes.is_empty());
    }

    #[test]
    fn oversized_function_body_is_skipped_with_a_diagnostic() {
        let body = vec![Instr::Nop; 10];
        let module = Module::new().with_functions(vec![Function::new("f").with_body(body)]);
        let options = CompileOptions::new(Isa::X86_64).with_limits(Limits::default().with_max_function_body_instrs(5));
        let (bytes, diagnostics) = compile_with_options(&module, &options);
        assert!(bytes.is_empty());
        assert_eq!(diagnostics.len(), 1);
    }
}
