//! Hand-assembled ELF64 and DWARF fixtures.
//!
//! Everything here builds byte images from scratch so the end-to-end tests
//! exercise the crate's own parsers, not another crate's writer.

use std::path::PathBuf;

pub const SHT_PROGBITS: u32 = 1;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;

pub const R_X86_64_64: u32 = 1;
pub const R_X86_64_32: u32 = 10;

pub fn uleb(mut value: u64) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            out.push(byte | 0x80);
        } else {
            out.push(byte);
            return out;
        }
    }
}

/// One abbreviation declaration, attribute list terminated for you.
pub fn abbrev_decl(
    code: u64,
    tag: gimli::DwTag,
    children: bool,
    attrs: &[(gimli::DwAt, gimli::DwForm)],
) -> Vec<u8> {
    let mut out = uleb(code);
    out.extend(uleb(u64::from(tag.0)));
    out.push(children as u8);
    for &(at, form) in attrs {
        out.extend(uleb(u64::from(at.0)));
        out.extend(uleb(u64::from(form.0)));
    }
    out.extend([0, 0]);
    out
}

/// A whole abbreviation table: the declarations plus the 0 terminator.
pub fn abbrev_table(decls: &[Vec<u8>]) -> Vec<u8> {
    let mut out = decls.concat();
    out.push(0);
    out
}

/// A 32-bit-format compilation unit wrapping `body`. The first DIE starts
/// 11 bytes in.
pub fn cu32(version: u16, abbrev_offset: u32, address_size: u8, body: &[u8]) -> Vec<u8> {
    let unit_length = (7 + body.len()) as u32;
    let mut out = Vec::new();
    out.extend(unit_length.to_ne_bytes());
    out.extend(version.to_ne_bytes());
    out.extend(abbrev_offset.to_ne_bytes());
    out.push(address_size);
    out.extend(body);
    out
}

/// A 64-bit-format compilation unit wrapping `body`. The first DIE starts
/// 23 bytes in.
pub fn cu64(version: u16, abbrev_offset: u64, address_size: u8, body: &[u8]) -> Vec<u8> {
    let unit_length = (11 + body.len()) as u64;
    let mut out = vec![0xff, 0xff, 0xff, 0xff];
    out.extend(unit_length.to_ne_bytes());
    out.extend(version.to_ne_bytes());
    out.extend(abbrev_offset.to_ne_bytes());
    out.push(address_size);
    out.extend(body);
    out
}

/// A symbol table entry with the given value; every other field zero.
pub fn sym(st_value: u64) -> Vec<u8> {
    let mut out = vec![0u8; 24];
    out[8..16].copy_from_slice(&st_value.to_ne_bytes());
    out
}

pub fn rela(r_offset: u64, r_type: u32, r_sym: u32, r_addend: i64) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend(r_offset.to_ne_bytes());
    out.extend(((u64::from(r_sym) << 32) | u64::from(r_type)).to_ne_bytes());
    out.extend(r_addend.to_ne_bytes());
    out
}

struct SectionSpec {
    name: &'static str,
    sh_type: u32,
    data: Vec<u8>,
    link: u32,
    info: u32,
    entsize: u64,
}

/// Assembles a minimal ELF64 relocatable image: NULL section, the sections
/// added here, and a trailing `.shstrtab`, followed by the section header
/// table.
pub struct ElfBuilder {
    sections: Vec<SectionSpec>,
}

impl ElfBuilder {
    pub fn new() -> ElfBuilder {
        ElfBuilder {
            sections: Vec::new(),
        }
    }

    /// Adds a section and returns its header table index.
    pub fn section(&mut self, name: &'static str, sh_type: u32, data: Vec<u8>) -> u32 {
        self.section_linked(name, sh_type, data, 0, 0, 0)
    }

    pub fn section_linked(
        &mut self,
        name: &'static str,
        sh_type: u32,
        data: Vec<u8>,
        link: u32,
        info: u32,
        entsize: u64,
    ) -> u32 {
        self.sections.push(SectionSpec {
            name,
            sh_type,
            data,
            link,
            info,
            entsize,
        });
        self.sections.len() as u32
    }

    pub fn build(&self) -> Vec<u8> {
        let mut shstrtab = vec![0u8];
        let mut name_offsets = Vec::new();
        for s in &self.sections {
            name_offsets.push(shstrtab.len() as u32);
            shstrtab.extend(s.name.as_bytes());
            shstrtab.push(0);
        }
        let shstrtab_name = shstrtab.len() as u32;
        shstrtab.extend(b".shstrtab");
        shstrtab.push(0);

        struct Header {
            name: u32,
            sh_type: u32,
            offset: u64,
            size: u64,
            link: u32,
            info: u32,
            entsize: u64,
        }

        let mut image = vec![0u8; 64];
        let mut headers = vec![Header {
            name: 0,
            sh_type: 0,
            offset: 0,
            size: 0,
            link: 0,
            info: 0,
            entsize: 0,
        }];
        for (i, s) in self.sections.iter().enumerate() {
            headers.push(Header {
                name: name_offsets[i],
                sh_type: s.sh_type,
                offset: image.len() as u64,
                size: s.data.len() as u64,
                link: s.link,
                info: s.info,
                entsize: s.entsize,
            });
            image.extend(&s.data);
        }
        headers.push(Header {
            name: shstrtab_name,
            sh_type: SHT_STRTAB,
            offset: image.len() as u64,
            size: shstrtab.len() as u64,
            link: 0,
            info: 0,
            entsize: 0,
        });
        let shstrndx = (headers.len() - 1) as u16;
        image.extend(&shstrtab);

        let e_shoff = image.len() as u64;
        for h in &headers {
            let mut sh = [0u8; 64];
            sh[0..4].copy_from_slice(&h.name.to_ne_bytes());
            sh[4..8].copy_from_slice(&h.sh_type.to_ne_bytes());
            sh[24..32].copy_from_slice(&h.offset.to_ne_bytes());
            sh[32..40].copy_from_slice(&h.size.to_ne_bytes());
            sh[40..44].copy_from_slice(&h.link.to_ne_bytes());
            sh[44..48].copy_from_slice(&h.info.to_ne_bytes());
            sh[56..64].copy_from_slice(&h.entsize.to_ne_bytes());
            image.extend(sh);
        }

        image[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        image[4] = 2; // ELFCLASS64
        image[5] = if cfg!(target_endian = "little") { 1 } else { 2 };
        image[6] = 1; // EV_CURRENT
        image[16..18].copy_from_slice(&1u16.to_ne_bytes()); // ET_REL
        image[18..20].copy_from_slice(&62u16.to_ne_bytes()); // EM_X86_64
        image[20..24].copy_from_slice(&1u32.to_ne_bytes());
        image[40..48].copy_from_slice(&e_shoff.to_ne_bytes());
        image[52..54].copy_from_slice(&64u16.to_ne_bytes());
        image[58..60].copy_from_slice(&64u16.to_ne_bytes());
        image[60..62].copy_from_slice(&(headers.len() as u16).to_ne_bytes());
        image[62..64].copy_from_slice(&shstrndx.to_ne_bytes());
        image
    }
}

/// The debug payload of one object. `syms` become symtab entries 1..; a
/// null symbol is always prepended. `info_relas` become a
/// `.rela.debug_info` section when non-empty.
#[derive(Default)]
pub struct DebugObject {
    pub abbrev: Vec<u8>,
    pub info: Vec<u8>,
    pub strs: Vec<u8>,
    pub syms: Vec<Vec<u8>>,
    pub info_relas: Vec<Vec<u8>>,
}

pub fn build_object(o: &DebugObject) -> Vec<u8> {
    let mut b = ElfBuilder::new();
    let mut symtab_data = vec![0u8; 24];
    for s in &o.syms {
        symtab_data.extend(s);
    }
    let symtab = b.section_linked(".symtab", SHT_SYMTAB, symtab_data, 0, 0, 24);
    b.section(".debug_abbrev", SHT_PROGBITS, o.abbrev.clone());
    let info = b.section(".debug_info", SHT_PROGBITS, o.info.clone());
    b.section(".debug_str", SHT_PROGBITS, o.strs.clone());
    if !o.info_relas.is_empty() {
        b.section_linked(
            ".rela.debug_info",
            SHT_RELA,
            o.info_relas.concat(),
            symtab,
            info,
            24,
        );
    }
    b.build()
}

pub fn write_object(dir: &tempfile::TempDir, name: &str, image: &[u8]) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, image).unwrap();
    path
}
