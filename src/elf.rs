//! ELF64 image handling: mapping, section discovery, relocation.
//!
//! Only the pieces of ELF the index needs are understood here: the section
//! header table, the three DWARF sections, `.symtab`, and `SHT_RELA`
//! relocations targeting the DWARF sections. Each file is mapped
//! copy-on-write so relocations can be applied in place without touching
//! the file on disk.

use std::fs;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};

use crate::cu::{self, CompilationUnit};
use crate::Error;

pub(crate) const DEBUG_ABBREV: usize = 0;
pub(crate) const DEBUG_INFO: usize = 1;
pub(crate) const DEBUG_STR: usize = 2;
pub(crate) const NUM_DEBUG_SECTIONS: usize = 3;

pub(crate) const SECTION_NAMES: [&str; NUM_DEBUG_SECTIONS] =
    [".debug_abbrev", ".debug_info", ".debug_str"];

const ELFMAG: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;
const EI_NIDENT: usize = 16;
const EV_CURRENT: u8 = 1;
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;

const SHN_UNDEF: u32 = 0;
const SHN_XINDEX: u16 = 0xffff;
const SHT_PROGBITS: u32 = 1;
const SHT_SYMTAB: u32 = 2;
const SHT_RELA: u32 = 4;

const R_X86_64_NONE: u32 = 0;
const R_X86_64_64: u32 = 1;
const R_X86_64_32: u32 = 10;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;
const RELA_SIZE: usize = 24;

fn ne_u16(buf: &[u8], off: usize) -> u16 {
    let mut bytes = [0; 2];
    bytes.copy_from_slice(&buf[off..off + 2]);
    u16::from_ne_bytes(bytes)
}

fn ne_u32(buf: &[u8], off: usize) -> u32 {
    let mut bytes = [0; 4];
    bytes.copy_from_slice(&buf[off..off + 4]);
    u32::from_ne_bytes(bytes)
}

fn ne_u64(buf: &[u8], off: usize) -> u64 {
    let mut bytes = [0; 8];
    bytes.copy_from_slice(&buf[off..off + 8]);
    u64::from_ne_bytes(bytes)
}

/// The section header fields the index cares about.
#[derive(Clone, Copy)]
struct Shdr {
    sh_name: u32,
    sh_type: u32,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
}

fn read_shdr(map: &[u8], table_offset: usize, index: usize) -> Shdr {
    let base = table_offset + index * SHDR_SIZE;
    Shdr {
        sh_name: ne_u32(map, base),
        sh_type: ne_u32(map, base + 4),
        sh_offset: ne_u64(map, base + 24),
        sh_size: ne_u64(map, base + 32),
        sh_link: ne_u32(map, base + 40),
        sh_info: ne_u32(map, base + 44),
    }
}

/// A validated byte range within a file's mapping, remembered together
/// with its section header index so relocation sections can be matched
/// back to their targets.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Section {
    shdr_index: u16,
    offset: usize,
    size: usize,
}

/// One mapped object file and everything derived from it.
#[derive(Debug)]
pub(crate) struct File {
    path: PathBuf,
    map: MmapMut,
    symtab: Section,
    debug_sections: [Section; NUM_DEBUG_SECTIONS],
    rela_sections: [Option<Section>; NUM_DEBUG_SECTIONS],
    pub(crate) cus: Vec<CompilationUnit>,
}

impl File {
    /// Runs the whole per-file pipeline: map the file, locate its sections,
    /// apply relocations, and read its compilation units.
    pub(crate) fn load(path: &Path) -> Result<File, Error> {
        let map = map_file(path)?;
        let (symtab, debug_sections, rela_sections) = read_sections(&map)?;
        let mut file = File {
            path: path.to_owned(),
            map,
            symtab,
            debug_sections,
            rela_sections,
            cus: Vec::new(),
        };
        for i in 0..NUM_DEBUG_SECTIONS {
            file.apply_relocations(i)?;
        }
        if file.debug_str().last() != Some(&0) {
            return Err(Error::DwarfFormat(
                ".debug_str is not null terminated".into(),
            ));
        }
        file.cus = cu::read_cus(&file)?;
        Ok(file)
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    fn section_data(&self, section: Section) -> &[u8] {
        &self.map[section.offset..section.offset + section.size]
    }

    pub(crate) fn debug_abbrev(&self) -> &[u8] {
        self.section_data(self.debug_sections[DEBUG_ABBREV])
    }

    pub(crate) fn debug_info(&self) -> &[u8] {
        self.section_data(self.debug_sections[DEBUG_INFO])
    }

    pub(crate) fn debug_str(&self) -> &[u8] {
        self.section_data(self.debug_sections[DEBUG_STR])
    }

    /// Applies the relocations for debug section `which`, if it has any,
    /// patching the private mapping directly.
    fn apply_relocations(&mut self, which: usize) -> Result<(), Error> {
        let Some(rela) = self.rela_sections[which] else {
            return Ok(());
        };
        let target = self.debug_sections[which];
        let symtab = self.symtab;
        let num_relocs = rela.size / RELA_SIZE;
        let num_syms = symtab.size / SYM_SIZE;
        for i in 0..num_relocs {
            let entry = rela.offset + i * RELA_SIZE;
            let r_offset = ne_u64(&self.map, entry);
            let r_info = ne_u64(&self.map, entry + 8);
            let r_addend = ne_u64(&self.map, entry + 16);
            let r_sym = (r_info >> 32) as usize;
            let size: u64 = match r_info as u32 {
                R_X86_64_NONE => continue,
                R_X86_64_32 => 4,
                R_X86_64_64 => 8,
                r_type => {
                    return Err(Error::NotImplemented(format!(
                        "unimplemented relocation type {r_type}"
                    )));
                }
            };
            if r_sym >= num_syms {
                return Err(Error::ElfFormat("invalid relocation symbol".into()));
            }
            let end = r_offset.checked_add(size);
            if end.map_or(true, |end| end > target.size as u64) {
                return Err(Error::ElfFormat("invalid relocation offset".into()));
            }
            let st_value = ne_u64(&self.map, symtab.offset + r_sym * SYM_SIZE + 8);
            let value = st_value.wrapping_add(r_addend);
            let at = target.offset + r_offset as usize;
            if size == 4 {
                self.map[at..at + 4].copy_from_slice(&(value as u32).to_ne_bytes());
            } else {
                self.map[at..at + 8].copy_from_slice(&value.to_ne_bytes());
            }
        }
        Ok(())
    }
}

fn map_file(path: &Path) -> Result<MmapMut, Error> {
    let file = fs::File::open(path).map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })?;
    // MAP_PRIVATE with write access: relocations patch the in-memory copy
    // only.
    unsafe { MmapOptions::new().map_copy(&file) }.map_err(|source| Error::Io {
        path: path.to_owned(),
        source,
    })
}

fn validate_ehdr(map: &[u8]) -> Result<(usize, u16, u16), Error> {
    if map.len() < EI_NIDENT || map[..4] != ELFMAG {
        return Err(Error::ElfFormat("not an ELF file".into()));
    }
    if map[EI_VERSION] != EV_CURRENT {
        return Err(Error::ElfFormat(format!(
            "ELF version {} is not EV_CURRENT",
            map[EI_VERSION]
        )));
    }
    let host_data = if cfg!(target_endian = "little") {
        ELFDATA2LSB
    } else {
        ELFDATA2MSB
    };
    if map[EI_DATA] != host_data {
        return Err(Error::NotImplemented(
            "ELF file endianness does not match machine".into(),
        ));
    }
    match map[EI_CLASS] {
        ELFCLASS64 => {}
        ELFCLASS32 => {
            return Err(Error::NotImplemented("32-bit ELF is not implemented".into()));
        }
        class => {
            return Err(Error::ElfFormat(format!("unknown ELF class {class}")));
        }
    }
    if map.len() < EHDR_SIZE {
        return Err(Error::ElfFormat("ELF header is truncated".into()));
    }
    let e_shoff = ne_u64(map, 40);
    let e_shnum = ne_u16(map, 60);
    let e_shstrndx = ne_u16(map, 62);
    if e_shnum == 0 {
        return Err(Error::ElfFormat("ELF file has no sections".into()));
    }
    let table_end = e_shoff.checked_add(SHDR_SIZE as u64 * u64::from(e_shnum));
    if table_end.map_or(true, |end| end > map.len() as u64) {
        return Err(Error::ElfFormat(
            "ELF section header table is beyond EOF".into(),
        ));
    }
    Ok((e_shoff as usize, e_shnum, e_shstrndx))
}

fn validate_shdr(map: &[u8], shdr: &Shdr) -> Result<(usize, usize), Error> {
    let end = shdr.sh_offset.checked_add(shdr.sh_size);
    if end.map_or(true, |end| end > map.len() as u64) {
        return Err(Error::ElfFormat("ELF section is beyond EOF".into()));
    }
    Ok((shdr.sh_offset as usize, shdr.sh_size as usize))
}

/// Looks `sh_name` up in the section name string table. Returns `None` for
/// a nameless section or one whose name is not NUL-terminated in bounds.
fn section_name(shstrtab: &[u8], sh_name: u32) -> Option<&[u8]> {
    if sh_name == 0 {
        return None;
    }
    let rest = shstrtab.get(sh_name as usize..)?;
    let nul = rest.iter().position(|&b| b == 0)?;
    Some(&rest[..nul])
}

type SectionSet = (Section, [Section; NUM_DEBUG_SECTIONS], [Option<Section>; NUM_DEBUG_SECTIONS]);

fn read_sections(map: &[u8]) -> Result<SectionSet, Error> {
    let (shoff, e_shnum, e_shstrndx) = validate_ehdr(map)?;
    let shdr = |i: usize| read_shdr(map, shoff, i);

    let mut shstrndx = u32::from(e_shstrndx);
    if e_shstrndx == SHN_XINDEX {
        shstrndx = shdr(0).sh_link;
    }
    if shstrndx == SHN_UNDEF || shstrndx >= u32::from(e_shnum) {
        return Err(Error::ElfFormat(
            "invalid ELF section header string table index".into(),
        ));
    }
    let (shstr_offset, shstr_size) = validate_shdr(map, &shdr(shstrndx as usize))?;
    let shstrtab = &map[shstr_offset..shstr_offset + shstr_size];

    let mut symtab = None;
    let mut debug: [Option<Section>; NUM_DEBUG_SECTIONS] = [None; NUM_DEBUG_SECTIONS];
    for i in 0..usize::from(e_shnum) {
        let s = shdr(i);
        let slot = if s.sh_type == SHT_PROGBITS {
            match section_name(shstrtab, s.sh_name)
                .and_then(|name| SECTION_NAMES.iter().position(|&n| n.as_bytes() == name))
            {
                Some(j) => &mut debug[j],
                None => continue,
            }
        } else if s.sh_type == SHT_SYMTAB {
            &mut symtab
        } else {
            continue;
        };
        if slot.is_some() {
            continue;
        }
        let (offset, size) = validate_shdr(map, &s)?;
        *slot = Some(Section {
            shdr_index: i as u16,
            offset,
            size,
        });
    }

    let symtab = symtab.ok_or_else(|| Error::DwarfFormat("missing .symtab".into()))?;
    let missing = |j: usize| Error::DwarfFormat(format!("missing {}", SECTION_NAMES[j]));
    let debug_sections = [
        debug[DEBUG_ABBREV].ok_or_else(|| missing(DEBUG_ABBREV))?,
        debug[DEBUG_INFO].ok_or_else(|| missing(DEBUG_INFO))?,
        debug[DEBUG_STR].ok_or_else(|| missing(DEBUG_STR))?,
    ];

    let mut rela_sections: [Option<Section>; NUM_DEBUG_SECTIONS] = [None; NUM_DEBUG_SECTIONS];
    for i in 0..usize::from(e_shnum) {
        let s = shdr(i);
        if s.sh_type != SHT_RELA {
            continue;
        }
        let Some(j) = debug_sections
            .iter()
            .position(|d| u32::from(d.shdr_index) == s.sh_info)
        else {
            continue;
        };
        if s.sh_link != u32::from(symtab.shdr_index) {
            return Err(Error::ElfFormat(
                "relocation symbol table section is not .symtab".into(),
            ));
        }
        let (offset, size) = validate_shdr(map, &s)?;
        rela_sections[j] = Some(Section {
            shdr_index: i as u16,
            offset,
            size,
        });
    }

    Ok((symtab, debug_sections, rela_sections))
}
