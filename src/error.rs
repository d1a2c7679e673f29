//! Error taxonomy (spec §7) and the diagnostic records surfaced across the
//! pipeline (spec §6).

use std::fmt;

/// A source-span reference borrowed from the WAT AST, identifying where in
/// the input a diagnostic originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    pub function_index: u32,
    pub instr_index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("virtual stack underflow")]
    StackUnderflow,

    #[error("branch depth {depth} exceeds label-stack height {height}")]
    InvalidBranchDepth { depth: u32, height: usize },

    #[error("unresolved label '{0}'")]
    UnresolvedLabel(String),

    #[error("pass-1 size estimate ({estimated}) disagreed with pass-2 encoding ({actual}) for '{label}'")]
    SizeEstimateMismatch {
        label: String,
        estimated: usize,
        actual: usize,
    },

    #[error("branch displacement {displacement} out of range for field width {field_bits} bits")]
    BranchOutOfRange { displacement: i64, field_bits: u32 },

    #[error("immediate {0} cannot be represented by this instruction")]
    ImmediateUnrepresentable(i64),

    #[error("unknown instruction '{0}' for this target")]
    UnknownInstruction(String),

    #[error("unsupported container '{0}'")]
    UnsupportedContainer(String),

    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// One diagnostic as surfaced through the pipeline-driver interface (§6).
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub error: Error,
    pub message: String,
    pub span: Option<Span>,
    pub severity: Severity,
}

impl Diagnostic {
    #[must_use]
    pub fn error(error: Error, span: Option<Span>) -> Self {
        let message = error.to_string();
        Self {
            error,
            message,
            span,
            severity: Severity::Error,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span {
            Some(span) => write!(
                f,
                "[fn {} instr {}] {}",
                span.function_index, span.instr_index, self.message
            ),
            None => write!(f, "{}", self.message),
        }
    }
}
