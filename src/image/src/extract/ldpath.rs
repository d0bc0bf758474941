//! Dynamic linker discovery from an ELF `PT_INTERP` segment.
//!
//! The xz decoder is run through the same dynamic linker the tool itself was
//! linked against, so the interpreter path is read out of our own binary.

use std::path::Path;

use acipack_core::error::{PackError, Result};

const ELF_MAGIC: &[u8] = &[0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const PT_INTERP: u32 = 3;

/// Interpreter path of the ELF executable at `path`.
pub fn interpreter_of(path: &Path) -> Result<String> {
    let data = std::fs::read(path).map_err(|e| {
        PackError::FormatError(format!("cannot read executable {}: {}", path.display(), e))
    })?;
    parse_interpreter(&data).map_err(|e| match e {
        PackError::FormatError(msg) => PackError::FormatError(format!("{}: {}", path.display(), msg)),
        other => other,
    })
}

/// Interpreter of the running executable.
pub fn current_interpreter() -> Result<String> {
    interpreter_of(Path::new("/proc/self/exe"))
}

/// Byte-order aware reads over an ELF image.
struct Reader<'a> {
    data: &'a [u8],
    big_endian: bool,
}

impl Reader<'_> {
    fn bytes<const N: usize>(&self, offset: usize) -> Result<[u8; N]> {
        offset
            .checked_add(N)
            .and_then(|end| self.data.get(offset..end))
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| PackError::FormatError(format!("truncated ELF at offset {:#x}", offset)))
    }

    fn u16(&self, offset: usize) -> Result<u16> {
        let b = self.bytes::<2>(offset)?;
        Ok(if self.big_endian { u16::from_be_bytes(b) } else { u16::from_le_bytes(b) })
    }

    fn u32(&self, offset: usize) -> Result<u32> {
        let b = self.bytes::<4>(offset)?;
        Ok(if self.big_endian { u32::from_be_bytes(b) } else { u32::from_le_bytes(b) })
    }

    fn u64(&self, offset: usize) -> Result<u64> {
        let b = self.bytes::<8>(offset)?;
        Ok(if self.big_endian { u64::from_be_bytes(b) } else { u64::from_le_bytes(b) })
    }
}

/// Offsets of the fields we need, per ELF class.
struct Layout {
    phoff: usize,
    phentsize: usize,
    phnum: usize,
    p_offset: usize,
    p_filesz: usize,
    wide: bool,
}

const ELF32: Layout = Layout {
    phoff: 0x1c,
    phentsize: 0x2a,
    phnum: 0x2c,
    p_offset: 4,
    p_filesz: 16,
    wide: false,
};

const ELF64: Layout = Layout {
    phoff: 0x20,
    phentsize: 0x36,
    phnum: 0x38,
    p_offset: 8,
    p_filesz: 32,
    wide: true,
};

/// Interpreter path recorded in an ELF image.
pub fn parse_interpreter(data: &[u8]) -> Result<String> {
    if !data.starts_with(ELF_MAGIC) || data.len() < 6 {
        return Err(PackError::FormatError("not an ELF file".to_string()));
    }

    let layout = match data[4] {
        ELFCLASS32 => &ELF32,
        ELFCLASS64 => &ELF64,
        class => return Err(PackError::FormatError(format!("unknown ELF class {}", class))),
    };
    let big_endian = match data[5] {
        ELFDATA2LSB => false,
        ELFDATA2MSB => true,
        enc => return Err(PackError::FormatError(format!("unknown ELF data encoding {}", enc))),
    };
    let r = Reader { data, big_endian };

    let word = |offset: usize| -> Result<usize> {
        let value = if layout.wide {
            r.u64(offset)?
        } else {
            u64::from(r.u32(offset)?)
        };
        usize::try_from(value)
            .map_err(|_| PackError::FormatError(format!("ELF offset {:#x} out of range", value)))
    };

    let phoff = word(layout.phoff)?;
    let phentsize = usize::from(r.u16(layout.phentsize)?);
    let phnum = usize::from(r.u16(layout.phnum)?);

    for i in 0..phnum {
        let ph = i
            .checked_mul(phentsize)
            .and_then(|o| o.checked_add(phoff))
            .ok_or_else(|| PackError::FormatError("ELF program header out of range".to_string()))?;
        if r.u32(ph)? != PT_INTERP {
            continue;
        }

        let offset = word(ph + layout.p_offset)?;
        let size = word(ph + layout.p_filesz)?;
        let raw = offset
            .checked_add(size)
            .and_then(|end| data.get(offset..end))
            .ok_or_else(|| PackError::FormatError("truncated ELF interpreter".to_string()))?;

        let path = raw.split(|&b| b == 0).next().unwrap_or_default();
        if path.is_empty() {
            break;
        }
        return String::from_utf8(path.to_vec())
            .map_err(|_| PackError::FormatError("ELF interpreter is not UTF-8".to_string()));
    }

    Err(PackError::FormatError("no ELF interpreter".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERP: &[u8] = b"/lib64/ld-linux-x86-64.so.2\0";

    /// Minimal ELF image with one PT_LOAD and one PT_INTERP header.
    fn elf(class: u8, big_endian: bool) -> Vec<u8> {
        let wide = class == ELFCLASS64;
        let (ehsize, phentsize) = if wide { (64usize, 56usize) } else { (52, 32) };
        let phoff = ehsize;
        let interp_off = phoff + 2 * phentsize;

        let mut data = vec![0u8; interp_off];
        data[..4].copy_from_slice(ELF_MAGIC);
        data[4] = class;
        data[5] = if big_endian { ELFDATA2MSB } else { ELFDATA2LSB };
        data[6] = 1;

        let put = |data: &mut Vec<u8>, offset: usize, value: u64, width: usize| {
            let bytes = value.to_be_bytes();
            let bytes = &bytes[8 - width..];
            let mut field = bytes.to_vec();
            if !big_endian {
                field.reverse();
            }
            data[offset..offset + width].copy_from_slice(&field);
        };
        let layout = if wide { &ELF64 } else { &ELF32 };
        let word = if wide { 8 } else { 4 };

        put(&mut data, layout.phoff, phoff as u64, word);
        put(&mut data, layout.phentsize, phentsize as u64, 2);
        put(&mut data, layout.phnum, 2, 2);

        // PT_LOAD first, then PT_INTERP
        put(&mut data, phoff, 1, 4);
        let interp_ph = phoff + phentsize;
        put(&mut data, interp_ph, u64::from(PT_INTERP), 4);
        put(&mut data, interp_ph + layout.p_offset, interp_off as u64, word);
        put(&mut data, interp_ph + layout.p_filesz, INTERP.len() as u64, word);

        data.extend_from_slice(INTERP);
        data
    }

    #[test]
    fn test_parse_elf64_le() {
        assert_eq!(
            parse_interpreter(&elf(ELFCLASS64, false)).unwrap(),
            "/lib64/ld-linux-x86-64.so.2"
        );
    }

    #[test]
    fn test_parse_elf32_and_big_endian() {
        for (class, be) in [(ELFCLASS32, false), (ELFCLASS32, true), (ELFCLASS64, true)] {
            assert_eq!(
                parse_interpreter(&elf(class, be)).unwrap(),
                "/lib64/ld-linux-x86-64.so.2",
                "class {} big endian {}",
                class,
                be
            );
        }
    }

    #[test]
    fn test_not_elf() {
        let err = parse_interpreter(b"#!/bin/sh\n").unwrap_err();
        assert!(err.is_format_error());
    }

    #[test]
    fn test_truncated_elf() {
        let data = elf(ELFCLASS64, false);
        assert!(parse_interpreter(&data[..80]).is_err());
    }

    #[test]
    fn test_static_binary_has_no_interpreter() {
        let mut data = elf(ELFCLASS64, false);
        // turn PT_INTERP into PT_NOTE
        data[64 + 56] = 4;
        let err = parse_interpreter(&data).unwrap_err();
        assert!(err.to_string().contains("no ELF interpreter"));
    }

    #[test]
    fn test_current_interpreter() {
        // Test binaries are dynamically linked on the usual targets
        if let Ok(interp) = current_interpreter() {
            assert!(interp.starts_with('/'));
        }
    }
}
