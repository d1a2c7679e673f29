//! Two-pass assembler (spec §4.6): pass 1 computes label offsets and
//! per-instruction byte sizes; pass 2 encodes with those offsets resolved.

use crate::error::{Error, Result};
use crate::isa::{Encodable, SymbolTable};

/// One line of the assembly IR (spec §3): either a label definition or a
/// single instruction.
#[derive(Debug, Clone)]
pub enum Line<Op> {
    Label(String),
    Instr(Op),
}

/// Pass 1: walk the IR, recording each label's byte offset and summing
/// instruction sizes. Returns the resolved symbol table.
pub fn resolve_labels<Op: Encodable>(lines: &[Line<Op>]) -> SymbolTable {
    let mut symbols = SymbolTable::new();
    let mut offset: u32 = 0;
    for line in lines {
        match line {
            Line::Label(name) => {
                symbols.insert(name.clone(), offset);
            }
            Line::Instr(op) => {
                offset += op.size_estimate() as u32;
            }
        }
    }
    symbols
}

/// Pass 2: encode every instruction line using the resolved symbol table,
/// verifying the pass-1 estimate and the actual encoded length agree.
pub fn encode<Op: Encodable>(lines: &[Line<Op>], symbols: &SymbolTable) -> Result<Vec<u8>> {
    let mut code = Vec::new();
    let mut offset: u32 = 0;
    for line in lines {
        let Line::Instr(op) = line else { continue };
        let estimated = op.size_estimate();
        let bytes = op.encode(offset, symbols)?;
        if bytes.len() != estimated {
            return Err(Error::SizeEstimateMismatch {
                label: format!("{op:?}"),
                estimated,
                actual: bytes.len(),
            });
        }
        offset += bytes.len() as u32;
        code.extend(bytes);
    }
    Ok(code)
}

/// Assemble a complete function body: pass 1 then pass 2.
pub fn assemble<Op: Encodable>(lines: &[Line<Op>]) -> Result<Vec<u8>> {
    let symbols = resolve_labels(lines);
    tracing::debug!(labels = symbols.len(), "assembler pass 1 complete");
    let code = encode(lines, &symbols)?;
    tracing::debug!(bytes = code.len(), "assembler pass 2 complete");
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct FixedOp(usize, u8);

    impl Encodable for FixedOp {
        fn size_estimate(&self) -> usize {
            self.0
        }
        fn encode(&self, _pc: u32, _symbols: &SymbolTable) -> Result<Vec<u8>> {
            Ok(vec![self.1; self.0])
        }
    }

    #[test]
    fn labels_resolve_to_running_byte_offset() {
        let lines = vec![
            Line::Instr(FixedOp(2, 0xAA)),
            Line::Label("mid".to_string()),
            Line::Instr(FixedOp(3, 0xBB)),
            Line::Label("end".to_string()),
        ];
        let symbols = resolve_labels(&lines);
        assert_eq!(symbols["mid"], 2);
        assert_eq!(symbols["end"], 5);
    }

    #[test]
    fn encode_concatenates_instruction_bytes_in_order() {
        let lines = vec![
            Line::Instr(FixedOp(1, 0x11)),
            Line::Instr(FixedOp(2, 0x22)),
        ];
        let bytes = assemble(&lines).unwrap();
        assert_eq!(bytes, vec![0x11, 0x22, 0x22]);
    }

    #[derive(Debug, Clone)]
    struct LyingOp;
    impl Encodable for LyingOp {
        fn size_estimate(&self) -> usize {
            4
        }
        fn encode(&self, _pc: u32, _symbols: &SymbolTable) -> Result<Vec<u8>> {
            Ok(vec![0; 1])
        }
    }

    #[test]
    fn size_mismatch_is_fatal() {
        let lines = vec![Line::Instr(LyingOp)];
        assert!(matches!(
            assemble(&lines),
            Err(Error::SizeEstimateMismatch { .. })
        ));
    }
}
