//! Fast, read-only index of DWARF debugging information across ELF object
//! files.
//!
//! Construction memory-maps every file copy-on-write, applies x86-64
//! relocations to the debug sections in place, compiles each compilation
//! unit's abbreviation table into a compact skip program, and walks the
//! top-level DIEs of every unit, recording each interesting `(name, tag)`
//! pair in one global open-addressed hash table. After construction the
//! index is immutable: [`DwarfIndex::find`] resolves a name and tag to the
//! file, unit, and DIE that declare it, and [`DwarfIndex::sections`] hands
//! out the relocated section bytes for a caller that wants to decode the
//! DIE itself.
//!
//! Supported input is 64-bit ELF with host-matching endianness carrying
//! DWARF versions 2 through 4.

mod abbrev;
mod cu;
mod elf;
mod hash;
pub mod reader;

use std::io;
use std::path::{Path, PathBuf};

use log::debug;
use thiserror::Error;

use crate::elf::File;
use crate::hash::DieHash;

/// Errors produced while building a [`DwarfIndex`].
///
/// Any error aborts construction; there is no partially built index. A
/// missing name in a built index is not an error, it is a `None` from
/// [`DwarfIndex::find`].
#[derive(Debug, Error)]
pub enum Error {
    /// A file could not be opened or mapped.
    #[error("{}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        source: io::Error,
    },
    /// The ELF image is structurally invalid.
    #[error("{0}")]
    ElfFormat(String),
    /// The DWARF data is structurally invalid.
    #[error("{0}")]
    DwarfFormat(String),
    /// Valid input that this indexer does not support.
    #[error("{0}")]
    NotImplemented(String),
    /// A reader ran past the end of a section or unit.
    #[error("unexpected end of data")]
    Eof,
    /// A LEB128 value would not fit in 64 bits.
    #[error("{0}")]
    Overflow(&'static str),
    /// The fixed-size hash table has no room for another distinct name.
    #[error("DIE hash table is full")]
    TableFull,
}

/// Locates an indexed DIE: which file, which unit, where in the unit.
///
/// Offsets are in bytes: `cu_offset` locates the unit header within
/// `.debug_info`, and `die_offset` locates the DIE's abbreviation code
/// relative to the unit header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Locator {
    pub file: usize,
    pub cu_offset: usize,
    pub die_offset: usize,
}

/// Borrowed views of one file's relocated debug sections, for a caller
/// that materializes DIEs from a [`Locator`].
#[derive(Clone, Copy, Debug)]
pub struct FileSections<'a> {
    pub debug_abbrev: &'a [u8],
    pub debug_info: &'a [u8],
    pub debug_str: &'a [u8],
}

/// The index. Built once from a set of object files, then queried.
///
/// Queries only touch immutable state, so a built index can be shared
/// freely across threads.
#[derive(Debug)]
pub struct DwarfIndex {
    files: Vec<File>,
    table: DieHash,
    address_size: u8,
}

impl DwarfIndex {
    /// Builds an index over `paths` with the default table capacity.
    pub fn new<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
    ) -> Result<DwarfIndex, Error> {
        DwarfIndex::with_capacity(paths, hash::DIE_HASH_SIZE)
    }

    /// Builds an index whose hash table has `capacity` slots, rounded up to
    /// a power of two. The table never grows: construction fails with
    /// [`Error::TableFull`] if the inputs carry more distinct names than it
    /// can hold.
    pub fn with_capacity<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
        capacity: usize,
    ) -> Result<DwarfIndex, Error> {
        let mut files = Vec::new();
        let mut address_size = 0;
        for path in paths {
            let file = File::load(path.as_ref())?;
            if let Some(cu) = file.cus.last() {
                address_size = cu.address_size;
            }
            debug!(
                "{}: {} compilation units",
                path.as_ref().display(),
                file.cus.len()
            );
            files.push(file);
        }

        let mut table = DieHash::with_capacity(capacity);
        for file_idx in 0..files.len() {
            for cu_idx in 0..files[file_idx].cus.len() {
                cu::index_cu(&files, file_idx, cu_idx, &mut table)?;
            }
        }
        debug!("indexed {} names", table.len());

        Ok(DwarfIndex {
            files,
            table,
            address_size,
        })
    }

    /// Looks up the DIE indexed under `name` and `tag`.
    ///
    /// Only top-level type and variable DIEs are indexed; when the same
    /// pair was declared in several units, the first one processed wins.
    pub fn find(&self, name: &str, tag: gimli::DwTag) -> Option<Locator> {
        let entry = self
            .table
            .lookup(name.as_bytes(), tag.0, |e| hash::name_bytes(&self.files, e))?;
        let cu = &self.files[entry.file as usize].cus[entry.cu as usize];
        Some(Locator {
            file: entry.file as usize,
            cu_offset: cu.offset,
            die_offset: entry.die_offset,
        })
    }

    /// Pointer width in bytes reported by the last unit processed, or 0 if
    /// no unit was seen.
    pub fn address_size(&self) -> u8 {
        self.address_size
    }

    /// Number of distinct `(name, tag)` pairs in the index.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.len() == 0
    }

    /// Number of files backing the index.
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// The relocated debug section bytes of file `file`, as indexed by
    /// [`Locator::file`].
    pub fn sections(&self, file: usize) -> Option<FileSections<'_>> {
        let file = self.files.get(file)?;
        Some(FileSections {
            debug_abbrev: file.debug_abbrev(),
            debug_info: file.debug_info(),
            debug_str: file.debug_str(),
        })
    }
}
