// Bit-level layout and displacement arithmetic throughout this crate
// deliberately narrows/truncates/reinterprets sign; that's the job.
#![allow(
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::too_many_lines,
    clippy::missing_errors_doc
)]

pub mod assembler;
pub mod ast;
pub mod container;
pub mod control_flow;
pub mod error;
pub mod isa;
pub mod lower;
pub mod pipeline;
pub mod stack;

pub use ast::{Function, Global, Instr, MemoryBase, Module, ValueType};
pub use error::{Diagnostic, Error, Result, Severity, Span};
pub use isa::{Container, Isa};
pub use pipeline::{compile, compile_with_options, CompileOptions, Limits};
