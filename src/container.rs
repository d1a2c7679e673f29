//! Container emitter (spec §4.7): wraps the assembler's code buffer in the
//! selected binary layout. `Flat` is the identity transform; `Pe` writes a
//! single-`.text`-section Windows PE image with no imports, exports, or
//! relocations, grounded in the byte-cursor style of hand-rolled PE writers
//! (`write_u16`/`write_u32`/`write_at_u32` helpers over a growable `Vec<u8>`
//! rather than a crate like `object`, since the layout here is one fixed
//! template, not a general-purpose writer).

use crate::isa::{Container, Isa};

const FILE_ALIGNMENT: u32 = 0x200;
const SECTION_ALIGNMENT: u32 = 0x1000;
const CODE_FILE_OFFSET: u32 = 0x200;
const SECTION_RVA: u32 = 0x1000;
const IMAGE_BASE_PE32: u64 = 0x0040_0000;
const IMAGE_BASE_PE32_PLUS: u64 = 0x1_4000_0000;

/// Round `value` up to the next multiple of `align` (`align` a power of two).
fn align_up(value: u32, align: u32) -> u32 {
    (value + align - 1) & !(align - 1)
}

fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn write_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Emit `code` wrapped in `container` for `isa`. Infallible: `Container`
/// only has the two variants this crate implements, so there is no
/// `UnsupportedContainer` case to reach here — that diagnostic exists for
/// a pipeline-driver caller that exposes a wider container enum than this
/// crate's own.
#[must_use]
pub fn emit(code: &[u8], isa: Isa, container: Container) -> Vec<u8> {
    match container {
        Container::Flat => code.to_vec(),
        Container::Pe => emit_pe(code, isa),
    }
}

/// PE32 for every 32-bit-and-narrower target (x86-32, x86-16, ARMv7),
/// PE32+ for the two 64-bit targets (x86-64, AArch64) — spec §4.7.
fn emit_pe(code: &[u8], isa: Isa) -> Vec<u8> {
    let pe32_plus = isa.is_64bit();
    let mut header = Vec::with_capacity(CODE_FILE_OFFSET as usize);

    // DOS header (64 bytes): only e_magic and e_lfanew matter, the rest is
    // padding since there is no DOS stub to run.
    write_u16(&mut header, 0x5A4D); // "MZ"
    header.resize(0x3C, 0);
    write_u32(&mut header, 0x80); // e_lfanew: PE header at offset 0x80

    header.resize(0x80, 0);
    header.extend_from_slice(b"PE\0\0");

    // COFF file header (20 bytes).
    write_u16(&mut header, isa.pe_machine());
    write_u16(&mut header, 1); // NumberOfSections
    write_u32(&mut header, 0); // TimeDateStamp
    write_u32(&mut header, 0); // PointerToSymbolTable
    write_u32(&mut header, 0); // NumberOfSymbols
    write_u16(&mut header, if pe32_plus { 240 } else { 224 }); // SizeOfOptionalHeader
    write_u16(&mut header, 0x22); // Characteristics: executable, line-numbers-stripped

    let optional_header_start = header.len();

    let size_of_code = align_up(code.len() as u32, FILE_ALIGNMENT);
    let size_of_image = align_up(CODE_FILE_OFFSET + size_of_code, SECTION_ALIGNMENT);

    // Optional header standard fields.
    write_u16(&mut header, if pe32_plus { 0x020B } else { 0x010B }); // Magic
    header.push(0); // MajorLinkerVersion
    header.push(0); // MinorLinkerVersion
    write_u32(&mut header, size_of_code); // SizeOfCode
    write_u32(&mut header, 0); // SizeOfInitializedData
    write_u32(&mut header, 0); // SizeOfUninitializedData
    write_u32(&mut header, SECTION_RVA); // AddressOfEntryPoint
    write_u32(&mut header, SECTION_RVA); // BaseOfCode
    if !pe32_plus {
        write_u32(&mut header, 0); // BaseOfData (PE32 only)
    }

    // Windows-specific fields.
    let image_base = if pe32_plus { IMAGE_BASE_PE32_PLUS } else { IMAGE_BASE_PE32 };
    if pe32_plus {
        write_u64(&mut header, image_base);
    } else {
        write_u32(&mut header, image_base as u32);
    }
    write_u32(&mut header, SECTION_ALIGNMENT);
    write_u32(&mut header, FILE_ALIGNMENT);
    write_u16(&mut header, 0); // OS major
    write_u16(&mut header, 0); // OS minor
    write_u16(&mut header, 0); // Image major
    write_u16(&mut header, 0); // Image minor
    write_u16(&mut header, 0); // Subsystem major
    write_u16(&mut header, 0); // Subsystem minor
    write_u32(&mut header, 0); // Win32VersionValue, reserved
    write_u32(&mut header, size_of_image);
    write_u32(&mut header, CODE_FILE_OFFSET); // SizeOfHeaders
    write_u32(&mut header, 0); // CheckSum
    write_u16(&mut header, 3); // Subsystem: native (no CRT, no console)
    write_u16(&mut header, 0); // DllCharacteristics
    if pe32_plus {
        write_u64(&mut header, 0x10_0000); // SizeOfStackReserve
        write_u64(&mut header, 0x1000); // SizeOfStackCommit
        write_u64(&mut header, 0x10_0000); // SizeOfHeapReserve
        write_u64(&mut header, 0x1000); // SizeOfHeapCommit
    } else {
        write_u32(&mut header, 0x10_0000);
        write_u32(&mut header, 0x1000);
        write_u32(&mut header, 0x10_0000);
        write_u32(&mut header, 0x1000);
    }
    write_u32(&mut header, 0); // LoaderFlags, reserved
    write_u32(&mut header, 16); // NumberOfRvaAndSizes

    // 16 empty data directories: no exports, imports, relocations, debug.
    for _ in 0..16 {
        write_u32(&mut header, 0);
        write_u32(&mut header, 0);
    }

    debug_assert_eq!(header.len() - optional_header_start, if pe32_plus { 240 } else { 224 });

    // Section header: the lone `.text` section (40 bytes).
    let mut name = [0u8; 8];
    name[..5].copy_from_slice(b".text");
    header.extend_from_slice(&name);
    write_u32(&mut header, code.len() as u32); // VirtualSize
    write_u32(&mut header, SECTION_RVA); // VirtualAddress
    write_u32(&mut header, size_of_code); // SizeOfRawData
    write_u32(&mut header, CODE_FILE_OFFSET); // PointerToRawData
    write_u32(&mut header, 0); // PointerToRelocations
    write_u32(&mut header, 0); // PointerToLinenumbers
    write_u16(&mut header, 0); // NumberOfRelocations
    write_u16(&mut header, 0); // NumberOfLinenumbers
    write_u32(&mut header, 0x6000_0020); // Characteristics: code, execute, read

    header.resize(CODE_FILE_OFFSET as usize, 0);
    debug_assert_eq!(header.len() as u32, CODE_FILE_OFFSET);

    let mut out = header;
    out.extend_from_slice(code);
    let padded_len = align_up(out.len() as u32, FILE_ALIGNMENT);
    out.resize(padded_len as usize, 0);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flat_is_identity() {
        let code = vec![0xC3, 0x90, 0xB8];
        assert_eq!(emit(&code, Isa::X86_64, Container::Flat), code);
    }

    #[test]
    fn pe_header_matches_spec_layout() {
        let code = vec![0xB8, 0x00, 0x00, 0x00, 0x00, 0xC3];
        let out = emit(&code, Isa::X86_64, Container::Pe);
        assert_eq!(&out[0..2], &[0x4D, 0x5A]);
        let lfanew = u32::from_le_bytes(out[0x3C..0x40].try_into().unwrap());
        assert_eq!(lfanew, 0x80);
        assert_eq!(&out[0x80..0x84], b"PE\0\0");
        assert_eq!(u16::from_le_bytes(out[0x84..0x86].try_into().unwrap()), 0x8664);
        assert_eq!(u16::from_le_bytes(out[0x86..0x88].try_into().unwrap()), 1);
        assert_eq!(u16::from_le_bytes(out[0x94..0x96].try_into().unwrap()), 240);
        assert_eq!(u16::from_le_bytes(out[0x96..0x98].try_into().unwrap()), 0x22);
        assert_eq!(&out[CODE_FILE_OFFSET as usize..CODE_FILE_OFFSET as usize + code.len()], code.as_slice());
        assert_eq!(out.len() % 512, 0);
    }

    #[test]
    fn pe_32bit_target_uses_pe32_not_plus() {
        let out = emit(&[0x90], Isa::Armv7, Container::Pe);
        let magic = u16::from_le_bytes(out[0x98..0x9A].try_into().unwrap());
        assert_eq!(magic, 0x010B);
        assert_eq!(u16::from_le_bytes(out[0x84..0x86].try_into().unwrap()), 0x01C4);
    }

    #[test]
    fn pe_length_is_multiple_of_512_for_various_code_sizes() {
        for len in [0usize, 1, 511, 512, 513, 4096] {
            let code = vec![0x90; len];
            let out = emit(&code, Isa::Aarch64, Container::Pe);
            assert_eq!(out.len() % 512, 0);
            assert!(out.len() as u32 >= CODE_FILE_OFFSET + len as u32);
        }
    }
}
