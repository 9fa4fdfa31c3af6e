//! Compilation units: header parsing, discovery, and the DIE walk that
//! feeds the index.

use log::trace;

use crate::abbrev::{self, cmd, AbbrevDecl};
use crate::elf::File;
use crate::hash::{name_bytes, DieHash, DieHashEntry, NameRef};
use crate::reader::Reader;
use crate::Error;

/// Unit header size in front of the first DIE: length field, version,
/// abbreviation offset, address size.
const HEADER_32: usize = 11;
const HEADER_64: usize = 23;

/// One unit of `.debug_info`, with its abbreviation table compiled and
/// ready for the walker.
#[derive(Debug)]
pub(crate) struct CompilationUnit {
    /// Byte offset of the unit header within `.debug_info`.
    pub(crate) offset: usize,
    /// Length of the unit after the length field itself.
    pub(crate) unit_length: u64,
    pub(crate) version: u16,
    pub(crate) debug_abbrev_offset: u64,
    pub(crate) address_size: u8,
    /// True for the DWARF 64-bit format (offsets are 8 bytes).
    pub(crate) is_64_bit: bool,
    /// Compiled declarations, keyed by abbreviation code minus one.
    pub(crate) abbrev_decls: Vec<AbbrevDecl>,
}

impl CompilationUnit {
    fn header_size(&self) -> usize {
        if self.is_64_bit {
            HEADER_64
        } else {
            HEADER_32
        }
    }

    /// Unit size including the length field.
    fn total_size(&self) -> usize {
        (if self.is_64_bit { 12 } else { 4 }) + self.unit_length as usize
    }
}

#[derive(Debug)]
struct UnitHeader {
    unit_length: u64,
    version: u16,
    debug_abbrev_offset: u64,
    address_size: u8,
    is_64_bit: bool,
}

fn read_unit_header(r: &mut Reader<'_>) -> Result<UnitHeader, Error> {
    let first = r.read_u32()?;
    let is_64_bit = first == 0xffff_ffff;
    let unit_length = if is_64_bit {
        r.read_u64()?
    } else {
        u64::from(first)
    };

    let version = r.read_u16()?;
    if !(2..=4).contains(&version) {
        return Err(Error::DwarfFormat(format!("unknown DWARF version {version}")));
    }

    let debug_abbrev_offset = if is_64_bit {
        r.read_u64()?
    } else {
        u64::from(r.read_u32()?)
    };

    let address_size = r.read_u8()?;
    // Anything wilder would collide with the compiled command encoding.
    if !(1..=8).contains(&address_size) {
        return Err(Error::DwarfFormat(format!(
            "unsupported address size {address_size}"
        )));
    }

    Ok(UnitHeader {
        unit_length,
        version,
        debug_abbrev_offset,
        address_size,
        is_64_bit,
    })
}

/// Walks `.debug_info`, reading every unit header and compiling every
/// unit's abbreviation table. Units must cover the section exactly.
pub(crate) fn read_cus(file: &File) -> Result<Vec<CompilationUnit>, Error> {
    let info = file.debug_info();
    let abbrev_data = file.debug_abbrev();
    let mut cus = Vec::new();
    let mut offset = 0;
    while offset < info.len() {
        let mut r = Reader::at(info, offset);
        let header = read_unit_header(&mut r)?;

        let length_field: u64 = if header.is_64_bit { 12 } else { 4 };
        let next = header
            .unit_length
            .checked_add(length_field)
            .and_then(|total| total.checked_add(offset as u64));
        let next = match next {
            Some(next) if next <= info.len() as u64 => next as usize,
            _ => return Err(Error::Eof),
        };

        let abbrev_offset =
            usize::try_from(header.debug_abbrev_offset).map_err(|_| Error::Eof)?;
        let abbrev_decls = abbrev::read_abbrev_table(
            abbrev_data,
            abbrev_offset,
            header.address_size,
            header.is_64_bit,
        )?;

        let cu = CompilationUnit {
            offset,
            unit_length: header.unit_length,
            version: header.version,
            debug_abbrev_offset: header.debug_abbrev_offset,
            address_size: header.address_size,
            is_64_bit: header.is_64_bit,
            abbrev_decls,
        };
        trace!(
            "{}: unit at {:#x}: DWARF v{}, abbrev table at {:#x}, {} decls",
            file.path().display(),
            cu.offset,
            cu.version,
            cu.debug_abbrev_offset,
            cu.abbrev_decls.len()
        );
        cus.push(cu);
        offset = next;
    }
    Ok(cus)
}

fn to_usize(value: u64) -> Result<usize, Error> {
    usize::try_from(value).map_err(|_| Error::Eof)
}

#[inline(always)]
fn prefetch(data: &[u8], pos: usize) {
    #[cfg(target_arch = "x86_64")]
    if let Some(p) = data.get(pos) {
        // SAFETY: a plain reference is a valid prefetch operand.
        unsafe {
            use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
            _mm_prefetch::<_MM_HINT_T0>(p as *const u8 as *const i8);
        }
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = (data, pos);
}

fn sibling_target(
    info: &[u8],
    cu_start: usize,
    cu_size: usize,
    offset: u64,
) -> Result<usize, Error> {
    let offset = to_usize(offset)?;
    if offset > cu_size {
        return Err(Error::Eof);
    }
    let target = cu_start + offset;
    prefetch(info, target);
    Ok(target)
}

/// Walks the DIEs of one unit, interpreting each DIE's compiled command
/// stream, and records every named top-level DIE with an interesting tag
/// in `table`.
///
/// `DW_AT_sibling` lets entire subtrees be skipped, which makes the walk
/// roughly linear in the number of top-level DIEs rather than all DIEs.
pub(crate) fn index_cu(
    files: &[File],
    file_idx: usize,
    cu_idx: usize,
    table: &mut DieHash,
) -> Result<(), Error> {
    let file = &files[file_idx];
    let cu = &file.cus[cu_idx];
    let cu_start = cu.offset;
    let cu_size = cu.total_size();
    // read_cus validated the unit's extent.
    let info = &file.debug_info()[..cu_start + cu_size];
    let debug_str = file.debug_str();

    let mut r = Reader::at(info, cu_start + cu.header_size());
    // Depth 0 is the root DIE of the unit; its children are the top-level
    // DIEs this index records.
    let mut depth = 0usize;

    loop {
        let die_offset = r.pos() - cu_start;
        let code = r.read_uleb128()?;
        if code == 0 {
            if depth <= 1 {
                break;
            }
            depth -= 1;
            continue;
        }
        if code > cu.abbrev_decls.len() as u64 {
            return Err(Error::DwarfFormat(format!("unknown abbreviation code {code}")));
        }
        let decl = &cu.abbrev_decls[(code - 1) as usize];

        let mut name: Option<NameRef> = None;
        let mut sibling: Option<usize> = None;
        let mut ci = 0;
        loop {
            let op = decl.cmds[ci];
            ci += 1;
            if op == 0 {
                break;
            }
            match op {
                cmd::BLOCK1 => {
                    let len = r.read_u8()?;
                    r.skip(usize::from(len))?;
                }
                cmd::BLOCK2 => {
                    let len = r.read_u16()?;
                    r.skip(usize::from(len))?;
                }
                cmd::BLOCK4 => {
                    let len = r.read_u32()?;
                    r.skip(to_usize(u64::from(len))?)?;
                }
                cmd::EXPRLOC => {
                    let len = r.read_uleb128()?;
                    r.skip(to_usize(len)?)?;
                }
                cmd::LEB128 => r.skip_leb128()?,
                cmd::NAME_STRING => {
                    name = Some(NameRef::Info { offset: r.pos() });
                    r.skip_cstr()?;
                }
                cmd::STRING => r.skip_cstr()?,
                cmd::SIBLING_REF1 => {
                    let off = u64::from(r.read_u8()?);
                    sibling = Some(sibling_target(info, cu_start, cu_size, off)?);
                }
                cmd::SIBLING_REF2 => {
                    let off = u64::from(r.read_u16()?);
                    sibling = Some(sibling_target(info, cu_start, cu_size, off)?);
                }
                cmd::SIBLING_REF4 => {
                    let off = u64::from(r.read_u32()?);
                    sibling = Some(sibling_target(info, cu_start, cu_size, off)?);
                }
                cmd::SIBLING_REF8 => {
                    let off = r.read_u64()?;
                    sibling = Some(sibling_target(info, cu_start, cu_size, off)?);
                }
                cmd::SIBLING_REF_UDATA => {
                    let off = r.read_uleb128()?;
                    sibling = Some(sibling_target(info, cu_start, cu_size, off)?);
                }
                cmd::NAME_STRP => {
                    let off = if cu.is_64_bit {
                        r.read_u64()?
                    } else {
                        u64::from(r.read_u32()?)
                    };
                    let off = to_usize(off)?;
                    if off >= debug_str.len() {
                        return Err(Error::Eof);
                    }
                    prefetch(debug_str, off);
                    name = Some(NameRef::Str { offset: off });
                }
                skip => r.skip(usize::from(skip))?,
            }
        }

        let tag = decl.cmds[ci];
        let children = decl.cmds[ci + 1];

        if depth == 1 && tag != 0 {
            if let Some(name) = name {
                let entry = DieHashEntry {
                    name,
                    tag: u16::from(tag),
                    file: file_idx as u32,
                    cu: cu_idx as u32,
                    die_offset,
                };
                let resolved = name_bytes(files, &entry);
                table.insert(resolved, entry, |e| name_bytes(files, e))?;
            }
        }

        if children != 0 {
            if let Some(sibling) = sibling {
                r.set_pos(sibling);
            } else {
                depth += 1;
            }
        } else if depth == 0 {
            break;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_32_bit() {
        let mut data = Vec::new();
        data.extend(100u32.to_ne_bytes());
        data.extend(4u16.to_ne_bytes());
        data.extend(0x40u32.to_ne_bytes());
        data.push(8);
        let header = read_unit_header(&mut Reader::new(&data)).unwrap();
        assert!(!header.is_64_bit);
        assert_eq!(header.unit_length, 100);
        assert_eq!(header.version, 4);
        assert_eq!(header.debug_abbrev_offset, 0x40);
        assert_eq!(header.address_size, 8);
    }

    #[test]
    fn header_64_bit() {
        let mut data = vec![0xff, 0xff, 0xff, 0xff];
        data.extend(300u64.to_ne_bytes());
        data.extend(2u16.to_ne_bytes());
        data.extend(0x1234u64.to_ne_bytes());
        data.push(4);
        let header = read_unit_header(&mut Reader::new(&data)).unwrap();
        assert!(header.is_64_bit);
        assert_eq!(header.unit_length, 300);
        assert_eq!(header.version, 2);
        assert_eq!(header.debug_abbrev_offset, 0x1234);
        assert_eq!(header.address_size, 4);
    }

    #[test]
    fn header_rejects_unknown_version() {
        let mut data = Vec::new();
        data.extend(100u32.to_ne_bytes());
        data.extend(5u16.to_ne_bytes());
        data.extend(0u32.to_ne_bytes());
        data.push(8);
        let err = read_unit_header(&mut Reader::new(&data)).unwrap_err();
        assert!(matches!(err, Error::DwarfFormat(_)));
    }

    #[test]
    fn header_rejects_wild_address_size() {
        let mut data = Vec::new();
        data.extend(100u32.to_ne_bytes());
        data.extend(4u16.to_ne_bytes());
        data.extend(0u32.to_ne_bytes());
        data.push(0xfa);
        let err = read_unit_header(&mut Reader::new(&data)).unwrap_err();
        assert!(matches!(err, Error::DwarfFormat(_)));
    }

    #[test]
    fn header_truncated() {
        let data = 100u32.to_ne_bytes();
        let err = read_unit_header(&mut Reader::new(&data)).unwrap_err();
        assert!(matches!(err, Error::Eof));
    }
}
