//! Memory mapping utilities for process address space analysis
//!
//! This module parses `/proc/self/maps` to attribute an address to the
//! module (executable or shared library) it was loaded from, and to turn
//! runtime addresses into file offsets within that module, which is
//! essential for symbolizing position-independent code.

use log::{info, trace};
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::{Address, ResolverInitError};

/// Memory range of a mapping in the process's address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRange {
    pub start: u64,
    pub end: u64,
}

impl MemoryRange {
    /// Check if an address falls within this memory range
    #[must_use]
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.start && addr < self.end
    }
}

/// One line of the maps file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub range: MemoryRange,
    /// Offset into the backing file of `range.start`
    pub offset: u64,
    pub executable: bool,
    /// Path column: a file path, a pseudo name like `[vdso]`, or empty
    pub pathname: String,
}

impl Mapping {
    /// Backing file, if this mapping comes from a readable file path
    #[must_use]
    pub fn file_path(&self) -> Option<&Path> {
        if self.pathname.starts_with('/') {
            Some(Path::new(&self.pathname))
        } else {
            None
        }
    }

    /// Offset into the backing file that `addr` was loaded from
    #[must_use]
    pub fn file_offset(&self, addr: u64) -> u64 {
        addr - self.range.start + self.offset
    }
}

/// The module an address belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRef {
    /// Lowest address any mapping of the module starts at
    pub base: Address,
    /// `None` when the module has no readable file path (e.g. `[vdso]`)
    pub path: Option<PathBuf>,
}

/// Snapshot of the modules loaded in the current process
#[derive(Debug, Clone, Default)]
pub struct ModuleMap {
    mappings: Vec<Mapping>,
}

impl ModuleMap {
    /// Read and parse a maps file
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, a line is malformed, or
    /// no executable mapping is found
    pub fn load(maps_path: &Path) -> Result<Self, ResolverInitError> {
        let contents = fs::read_to_string(maps_path).map_err(|source| {
            ResolverInitError::ModuleMapUnreadable { path: maps_path.to_path_buf(), source }
        })?;
        let map = Self::parse(&contents, maps_path)?;

        info!(
            "Module map {}: {} mappings, {} modules",
            maps_path.display(),
            map.mappings.len(),
            map.module_paths().count()
        );
        Ok(map)
    }

    /// Parse the contents of a maps file
    ///
    /// # Errors
    /// Returns an error if a line is malformed or no executable mapping exists
    pub fn parse(contents: &str, source: &Path) -> Result<Self, ResolverInitError> {
        let mut mappings = Vec::new();

        // Parse each line: "start-end perms offset dev inode pathname"
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let mapping = parse_line(line).map_err(|reason| ResolverInitError::ModuleMapMalformed {
                path: source.to_path_buf(),
                line: index + 1,
                reason,
            })?;
            mappings.push(mapping);
        }

        if !mappings.iter().any(|m| m.executable) {
            return Err(ResolverInitError::NoModules(source.to_path_buf()));
        }

        mappings.sort_by_key(|m| m.range.start);
        Ok(Self { mappings })
    }

    /// The executable mapping containing `addr`
    ///
    /// Anonymous mappings (JIT code, trampolines) are not modules and never
    /// match.
    #[must_use]
    pub fn mapping_for(&self, addr: u64) -> Option<&Mapping> {
        let idx = self.mappings.partition_point(|m| m.range.start <= addr);
        let mapping = self.mappings[..idx].last()?;
        (mapping.range.contains(addr) && mapping.executable && !mapping.pathname.is_empty())
            .then_some(mapping)
    }

    /// Base address and path of the module a mapping belongs to
    ///
    /// The base is the minimum start of all mappings sharing the pathname.
    #[must_use]
    pub fn module_of(&self, mapping: &Mapping) -> ModuleRef {
        let base = self
            .mappings
            .iter()
            .filter(|m| m.pathname == mapping.pathname)
            .map(|m| m.range.start)
            .min()
            .unwrap_or(mapping.range.start);

        ModuleRef { base: Address(base as usize), path: mapping.file_path().map(Path::to_path_buf) }
    }

    /// Distinct file paths of all executable modules, in load order
    pub fn module_paths(&self) -> impl Iterator<Item = &Path> + '_ {
        let mut seen: Vec<&str> = Vec::new();
        self.mappings.iter().filter(|m| m.executable).filter_map(move |m| {
            let path = m.file_path()?;
            if seen.contains(&m.pathname.as_str()) {
                return None;
            }
            seen.push(m.pathname.as_str());
            Some(path)
        })
    }

    #[must_use]
    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }
}

fn next_field<'a>(rest: &mut &'a str) -> Option<&'a str> {
    let trimmed = rest.trim_start();
    let end = trimmed.find(char::is_whitespace).unwrap_or(trimmed.len());
    let (field, tail) = trimmed.split_at(end);
    *rest = tail;
    (!field.is_empty()).then_some(field)
}

fn parse_line(line: &str) -> Result<Mapping, String> {
    let mut rest = line;
    let range = next_field(&mut rest).ok_or("missing address range")?;
    let perms = next_field(&mut rest).ok_or("missing permissions")?;
    let offset = next_field(&mut rest).ok_or("missing offset")?;
    let _dev = next_field(&mut rest).ok_or("missing device")?;
    let _inode = next_field(&mut rest).ok_or("missing inode")?;
    let pathname = rest.trim().to_string();

    let (start, end) = range.split_once('-').ok_or("address range without '-'")?;
    let start = u64::from_str_radix(start, 16).map_err(|e| format!("range start: {e}"))?;
    let end = u64::from_str_radix(end, 16).map_err(|e| format!("range end: {e}"))?;
    let offset = u64::from_str_radix(offset, 16).map_err(|e| format!("offset: {e}"))?;
    if end < start {
        return Err(format!("range end {end:#x} before start {start:#x}"));
    }

    let mapping = Mapping {
        range: MemoryRange { start, end },
        offset,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        pathname,
    };
    trace!("mapping {:#x}-{:#x} {}", start, end, mapping.pathname);
    Ok(mapping)
}
