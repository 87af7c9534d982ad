use addr2line::Context;
use gimli::{EndianRcSlice, RunTimeEndian};
use log::debug;
use object::{Object, ObjectSection, ObjectSegment, ObjectSymbol, SymbolKind};
use rustc_demangle::demangle;
use std::fmt;
use std::fs;
use std::path::Path;
use std::rc::Rc;

use crate::domain::SymbolizationError;

/// A function symbol from the ELF symbol tables
#[derive(Debug, Clone, PartialEq, Eq)]
struct SymbolEntry {
    address: u64,
    size: u64,
    name: String,
}

/// A loadable segment, for mapping file offsets back to virtual addresses
#[derive(Debug, Clone, Copy)]
struct Segment {
    address: u64,
    file_offset: u64,
    file_size: u64,
}

/// Symbolizer for resolving addresses within one binary
///
/// Addresses handed to it are the binary's own virtual addresses (as
/// recorded in the ELF file), not runtime addresses; see
/// [`Symbolizer::file_offset_to_address`].
pub struct Symbolizer {
    ctx: Context<EndianRcSlice<RunTimeEndian>>,
    /// Sorted by address, one entry per address
    symbols: Vec<SymbolEntry>,
    segments: Vec<Segment>,
}

impl Symbolizer {
    /// Create a new symbolizer for the given binary
    ///
    /// # Errors
    /// Returns an error if the binary file cannot be read or parsed, or if its DWARF
    /// debug info is corrupt. Missing debug info is not an error.
    pub fn new<P: AsRef<Path>>(binary_path: P) -> Result<Self, SymbolizationError> {
        let path = binary_path.as_ref();
        let binary_data = fs::read(path).map_err(|source| SymbolizationError::BinaryUnreadable {
            path: path.to_path_buf(),
            source,
        })?;

        let obj_file = object::File::parse(&*binary_data).map_err(|source| {
            SymbolizationError::ObjectParseFailed { path: path.to_path_buf(), source }
        })?;

        // Load DWARF debug info
        let endian =
            if obj_file.is_little_endian() { RunTimeEndian::Little } else { RunTimeEndian::Big };

        let load_section =
            |id: gimli::SectionId| -> Result<EndianRcSlice<RunTimeEndian>, gimli::Error> {
                let data = obj_file
                    .section_by_name(id.name())
                    .and_then(|section| section.uncompressed_data().ok())
                    .unwrap_or(std::borrow::Cow::Borrowed(&[][..]));
                Ok(EndianRcSlice::new(Rc::from(&*data), endian))
            };

        let dwarf = gimli::Dwarf::load(&load_section)?;
        let ctx = Context::from_dwarf(dwarf)?;

        let mut symbols: Vec<SymbolEntry> = obj_file
            .symbols()
            .chain(obj_file.dynamic_symbols())
            .filter(|sym| sym.kind() == SymbolKind::Text && sym.is_definition() && sym.address() != 0)
            .filter_map(|sym| {
                Some(SymbolEntry {
                    address: sym.address(),
                    size: sym.size(),
                    name: sym.name().ok()?.to_string(),
                })
            })
            .collect();
        // Stable sort keeps .symtab names ahead of their .dynsym duplicates
        symbols.sort_by_key(|sym| sym.address);
        symbols.dedup_by_key(|sym| sym.address);

        let segments = obj_file
            .segments()
            .map(|seg| {
                let (file_offset, file_size) = seg.file_range();
                Segment { address: seg.address(), file_offset, file_size }
            })
            .filter(|seg| seg.file_size > 0)
            .collect();

        debug!("Loaded {} symbols from {}", symbols.len(), path.display());
        Ok(Self { ctx, symbols, segments })
    }

    /// Translate an offset in the binary file into the binary's virtual address
    #[must_use]
    pub fn file_offset_to_address(&self, offset: u64) -> Option<u64> {
        self.segments
            .iter()
            .find(|seg| offset >= seg.file_offset && offset - seg.file_offset < seg.file_size)
            .map(|seg| seg.address + (offset - seg.file_offset))
    }

    /// Nearest function symbol at or before `addr`, with the displacement
    /// from its start
    ///
    /// Symbols with a recorded size only match addresses inside them.
    #[must_use]
    pub fn symbol(&self, addr: u64) -> Option<(&str, u64)> {
        let idx = self.symbols.partition_point(|sym| sym.address <= addr);
        let sym = self.symbols[..idx].last()?;
        let displacement = addr - sym.address;
        if sym.size > 0 && displacement >= sym.size {
            return None;
        }
        Some((&sym.name, displacement))
    }

    /// Source file and line for `addr`, if line tables cover it
    #[must_use]
    pub fn location(&self, addr: u64) -> Option<(String, u32)> {
        let location = self.ctx.find_location(addr).ok()??;
        Some((location.file?.to_string(), location.line?))
    }

    /// Number of function symbols known
    #[must_use]
    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// Demangle a Rust symbol name
    ///
    /// Names that are not Rust-mangled come back unchanged.
    #[must_use]
    pub fn demangle_symbol(symbol: &str) -> String {
        format!("{:#}", demangle(symbol))
    }
}

impl fmt::Debug for Symbolizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Symbolizer").field("symbols", &self.symbols.len()).finish_non_exhaustive()
    }
}
