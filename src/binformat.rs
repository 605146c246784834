//! The on-disk module format `mfasm`/`mfsc` write and `mfrun` reads
//! (spec.md §6). Grounded on `original_source/src/mfasm.cpp`'s writer:
//! a little-endian header, the raw instruction words, then an export
//! table terminated by a `-1` name-length sentinel.

use std::convert::TryInto;
use std::io::{self, Read, Write};

use crate::types::{Instruction, Module};

const EXPORT_SENTINEL: i32 = -1;

pub fn write_module(w: &mut impl Write, module: &Module) -> io::Result<()> {
    w.write_all(&(module.entry_point as i32).to_le_bytes())?;
    w.write_all(&((module.text.len() * 2) as i32).to_le_bytes())?;
    for instr in &module.text {
        w.write_all(&instr.to_bytes())?;
    }
    let mut exports: Vec<(&String, &u16)> = module.exports.iter().collect();
    exports.sort_by_key(|(name, _)| name.as_str());
    for (name, offset) in exports {
        let bytes = name.as_bytes();
        w.write_all(&(bytes.len() as i32).to_le_bytes())?;
        w.write_all(bytes)?;
        w.write_all(&offset.to_le_bytes())?;
    }
    w.write_all(&EXPORT_SENTINEL.to_le_bytes())?;
    Ok(())
}

pub fn read_module(r: &mut impl Read, name: impl Into<String>) -> io::Result<Module> {
    let mut module = Module::new(name);

    let mut i32_buf = [0u8; 4];
    r.read_exact(&mut i32_buf)?;
    module.entry_point = i32::from_le_bytes(i32_buf) as u16;

    r.read_exact(&mut i32_buf)?;
    let text_word_count = i32::from_le_bytes(i32_buf);
    if text_word_count < 0 || text_word_count % 2 != 0 {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed text word count"));
    }
    let instr_count = text_word_count as usize / 2;

    module.text.reserve(instr_count);
    for _ in 0..instr_count {
        let mut raw = [0u8; Instruction::SIZE];
        r.read_exact(&mut raw)?;
        let instr = Instruction::from_bytes(&raw)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "unknown opcode byte"))?;
        module.text.push(instr);
    }

    loop {
        r.read_exact(&mut i32_buf)?;
        let name_len = i32::from_le_bytes(i32_buf);
        if name_len == EXPORT_SENTINEL {
            break;
        }
        if name_len < 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "negative export name length"));
        }
        let mut name_bytes = vec![0u8; name_len as usize];
        r.read_exact(&mut name_bytes)?;
        let export_name = String::from_utf8(name_bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "export name is not UTF-8"))?;
        let mut offset_buf = [0u8; 2];
        r.read_exact(&mut offset_buf)?;
        module.exports.insert(export_name, u16::from_le_bytes(offset_buf));
    }

    Ok(module)
}

/// Convenience wrapper matching `mfrun`'s usage: load straight from bytes
/// rather than a stream.
pub fn module_from_bytes(bytes: &[u8], name: impl Into<String>) -> io::Result<Module> {
    let mut cursor = bytes;
    read_module(&mut cursor, name)
}

pub fn module_to_bytes(module: &Module) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    write_module(&mut out, module)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Opcode;

    #[test]
    fn module_round_trips_through_bytes() {
        let mut m = Module::new("demo");
        m.entry_point = 0;
        m.text.push(Instruction::adi(Opcode::ISetC, 8, 42));
        m.text.push(Instruction::a_only(Opcode::Terminate, 0));
        m.exports.insert("main".to_string(), 0);

        let bytes = module_to_bytes(&m).unwrap();
        let back = module_from_bytes(&bytes, "demo").unwrap();

        assert_eq!(back.entry_point, m.entry_point);
        assert_eq!(back.text, m.text);
        assert_eq!(back.exports.get("main"), Some(&0));
    }

    #[test]
    fn empty_module_has_just_header_and_sentinel() {
        let m = Module::new("empty");
        let bytes = module_to_bytes(&m).unwrap();
        assert_eq!(bytes.len(), 4 + 4 + 4); // entry_point, word_count, sentinel
        let back = module_from_bytes(&bytes, "empty").unwrap();
        assert!(back.text.is_empty());
        assert!(back.exports.is_empty());
    }

    #[test]
    fn rejects_truncated_input() {
        let bytes = [0u8; 2];
        assert!(module_from_bytes(&bytes, "bad").is_err());
    }
}
