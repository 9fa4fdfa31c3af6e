//! Abbreviation tables and their compiled command streams.
//!
//! Decoding `(attribute, form)` pairs for every DIE is far too slow for
//! indexing. Each abbreviation declaration is instead compiled once into a
//! compact byte program for the walker in [`crate::cu`]: a command below
//! [`cmd::MIN_SPECIAL`] skips that many bytes of DIE payload (consecutive
//! fixed-size attributes fuse into a single command), and the commands at
//! or above it handle the variable-length forms and the two attributes the
//! index actually extracts, `DW_AT_name` and `DW_AT_sibling`.

use gimli::constants as gim_con;

use crate::reader::Reader;
use crate::Error;

/// Opcodes understood by the DIE walker.
pub(crate) mod cmd {
    /// u8 length prefix, then that many bytes.
    pub(crate) const BLOCK1: u8 = 243;
    /// u16 length prefix.
    pub(crate) const BLOCK2: u8 = 244;
    /// u32 length prefix.
    pub(crate) const BLOCK4: u8 = 245;
    /// ULEB128 length prefix.
    pub(crate) const EXPRLOC: u8 = 246;
    /// One LEB128 value, signed or unsigned.
    pub(crate) const LEB128: u8 = 247;
    /// Inline NUL-terminated string.
    pub(crate) const STRING: u8 = 248;
    /// Sibling offset from the start of the unit, as u8.
    pub(crate) const SIBLING_REF1: u8 = 249;
    /// ... as u16.
    pub(crate) const SIBLING_REF2: u8 = 250;
    /// ... as u32.
    pub(crate) const SIBLING_REF4: u8 = 251;
    /// ... as u64.
    pub(crate) const SIBLING_REF8: u8 = 252;
    /// ... as ULEB128.
    pub(crate) const SIBLING_REF_UDATA: u8 = 253;
    /// Name is at a 4- or 8-byte offset into `.debug_str`, per the unit's
    /// DWARF width.
    pub(crate) const NAME_STRP: u8 = 254;
    /// Name is the inline string at the current position.
    pub(crate) const NAME_STRING: u8 = 255;
    /// Everything below this value is a literal skip count.
    pub(crate) const MIN_SPECIAL: u8 = BLOCK1;
}

/// One compiled abbreviation declaration.
///
/// `cmds` holds the command stream, then a 0 terminator, a one-byte tag,
/// and the has-children flag. A stored tag of 0 means the DIE is walked
/// for structure but never indexed; that covers both tags outside the
/// whitelist and type declarations carrying `DW_AT_declaration`.
#[derive(Debug)]
pub(crate) struct AbbrevDecl {
    pub(crate) cmds: Vec<u8>,
}

/// Parses and compiles the abbreviation table at `offset` in
/// `.debug_abbrev`.
///
/// Abbreviation codes do not have to be sequential, but GCC and Clang
/// always emit them that way, so a flat array is used and anything else is
/// rejected.
pub(crate) fn read_abbrev_table(
    data: &[u8],
    offset: usize,
    address_size: u8,
    is_64_bit: bool,
) -> Result<Vec<AbbrevDecl>, Error> {
    if offset > data.len() {
        return Err(Error::Eof);
    }
    let mut r = Reader::at(data, offset);
    let mut decls = Vec::new();
    loop {
        let code = r.read_uleb128()?;
        if code == 0 {
            return Ok(decls);
        }
        if code != decls.len() as u64 + 1 {
            return Err(Error::NotImplemented(
                "abbreviation table is not sequential".into(),
            ));
        }
        decls.push(read_abbrev_decl(&mut r, address_size, is_64_bit)?);
    }
}

fn read_abbrev_decl(
    r: &mut Reader<'_>,
    address_size: u8,
    is_64_bit: bool,
) -> Result<AbbrevDecl, Error> {
    let mut tag = indexed_tag(r.read_uleb128()?);
    let children = r.read_u8()?;

    let mut cmds: Vec<u8> = Vec::with_capacity(8);
    loop {
        let name = r.read_uleb128()?;
        let form = r.read_uleb128()?;
        if name == 0 && form == 0 {
            break;
        }

        if name == u64::from(gim_con::DW_AT_sibling.0) {
            if let Some(special) = sibling_cmd(form) {
                cmds.push(special);
                continue;
            }
        } else if name == u64::from(gim_con::DW_AT_name.0) && tag != 0 {
            if let Some(special) = name_cmd(form) {
                cmds.push(special);
                continue;
            }
        } else if name == u64::from(gim_con::DW_AT_declaration.0)
            && tag != gim_con::DW_TAG_variable.0 as u8
        {
            // A type declaration is not the definition; the definition is
            // what gets indexed.
            tag = 0;
        }

        match form_cmd(form, address_size, is_64_bit)? {
            FormCmd::Fixed(skip) => push_skip(&mut cmds, skip),
            FormCmd::Special(special) => cmds.push(special),
            FormCmd::Empty => {}
        }
    }
    cmds.push(0);
    cmds.push(tag);
    cmds.push(children);
    Ok(AbbrevDecl { cmds })
}

/// Appends a fixed-size skip, fusing it into a preceding one. A fused pair
/// that would reach [`cmd::MIN_SPECIAL`] is split: the first command is
/// capped one below it and the remainder follows.
fn push_skip(cmds: &mut Vec<u8>, skip: u8) {
    if let Some(last) = cmds.last_mut() {
        if *last < cmd::MIN_SPECIAL {
            let sum = u16::from(*last) + u16::from(skip);
            if sum < u16::from(cmd::MIN_SPECIAL) {
                *last = sum as u8;
            } else {
                *last = cmd::MIN_SPECIAL - 1;
                cmds.push((sum - u16::from(cmd::MIN_SPECIAL) + 1) as u8);
            }
            return;
        }
    }
    cmds.push(skip);
}

/// Tags whose top-level DIEs produce index entries; everything else maps
/// to 0.
fn indexed_tag(tag: u64) -> u8 {
    let Ok(tag) = u16::try_from(tag) else { return 0 };
    match gim_con::DwTag(tag) {
        gim_con::DW_TAG_base_type
        | gim_con::DW_TAG_class_type
        | gim_con::DW_TAG_enumeration_type
        | gim_con::DW_TAG_structure_type
        | gim_con::DW_TAG_typedef
        | gim_con::DW_TAG_union_type
        | gim_con::DW_TAG_variable => tag as u8,
        _ => 0,
    }
}

fn sibling_cmd(form: u64) -> Option<u8> {
    match gim_con::DwForm(u16::try_from(form).ok()?) {
        gim_con::DW_FORM_ref1 => Some(cmd::SIBLING_REF1),
        gim_con::DW_FORM_ref2 => Some(cmd::SIBLING_REF2),
        gim_con::DW_FORM_ref4 => Some(cmd::SIBLING_REF4),
        gim_con::DW_FORM_ref8 => Some(cmd::SIBLING_REF8),
        gim_con::DW_FORM_ref_udata => Some(cmd::SIBLING_REF_UDATA),
        _ => None,
    }
}

fn name_cmd(form: u64) -> Option<u8> {
    match gim_con::DwForm(u16::try_from(form).ok()?) {
        gim_con::DW_FORM_strp => Some(cmd::NAME_STRP),
        gim_con::DW_FORM_string => Some(cmd::NAME_STRING),
        _ => None,
    }
}

enum FormCmd {
    Fixed(u8),
    Special(u8),
    Empty,
}

fn form_cmd(form: u64, address_size: u8, is_64_bit: bool) -> Result<FormCmd, Error> {
    let unknown = || Error::DwarfFormat(format!("unknown attribute form {form}"));
    let Ok(form16) = u16::try_from(form) else {
        return Err(unknown());
    };
    Ok(match gim_con::DwForm(form16) {
        gim_con::DW_FORM_addr => FormCmd::Fixed(address_size),
        gim_con::DW_FORM_data1 | gim_con::DW_FORM_ref1 | gim_con::DW_FORM_flag => {
            FormCmd::Fixed(1)
        }
        gim_con::DW_FORM_data2 | gim_con::DW_FORM_ref2 => FormCmd::Fixed(2),
        gim_con::DW_FORM_data4 | gim_con::DW_FORM_ref4 => FormCmd::Fixed(4),
        gim_con::DW_FORM_data8 | gim_con::DW_FORM_ref8 | gim_con::DW_FORM_ref_sig8 => {
            FormCmd::Fixed(8)
        }
        gim_con::DW_FORM_ref_addr | gim_con::DW_FORM_sec_offset | gim_con::DW_FORM_strp => {
            FormCmd::Fixed(if is_64_bit { 8 } else { 4 })
        }
        gim_con::DW_FORM_block1 => FormCmd::Special(cmd::BLOCK1),
        gim_con::DW_FORM_block2 => FormCmd::Special(cmd::BLOCK2),
        gim_con::DW_FORM_block4 => FormCmd::Special(cmd::BLOCK4),
        gim_con::DW_FORM_exprloc => FormCmd::Special(cmd::EXPRLOC),
        gim_con::DW_FORM_sdata | gim_con::DW_FORM_udata | gim_con::DW_FORM_ref_udata => {
            FormCmd::Special(cmd::LEB128)
        }
        gim_con::DW_FORM_string => FormCmd::Special(cmd::STRING),
        gim_con::DW_FORM_flag_present => FormCmd::Empty,
        gim_con::DW_FORM_indirect => {
            return Err(Error::NotImplemented(
                "DW_FORM_indirect is not implemented".into(),
            ));
        }
        _ => return Err(unknown()),
    })
}
