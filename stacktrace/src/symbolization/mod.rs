//! # Symbol Resolution
//!
//! Turns captured code addresses into a function name, a source file and
//! line, and the module (executable or shared library) they belong to.
//!
//! ## Address translation
//!
//! Captured addresses are runtime addresses. Modules are loaded at a
//! randomised base (ASLR, PIE executables and shared libraries), so the
//! symbol tables and DWARF line tables in the module's file describe a
//! different address space. For each address:
//!
//! ```text
//! 1. /proc/self/maps          0x55d4a1c02345 lies in
//!                             55d4a1c02000-55d4a1c08000 r-xp 00002000 /usr/bin/demo
//! 2. file offset              0x55d4a1c02345 - 0x55d4a1c02000 + 0x2000 = 0x2345
//! 3. ELF program headers      file offset 0x2345 -> virtual address 0x3345
//! 4. .symtab / .dynsym        nearest function at or before 0x3345, displacement
//! 5. DWARF line tables        file and line for 0x3345
//! ```
//!
//! Going through the file offset rather than subtracting the lowest mapping
//! keeps the translation correct for binaries whose segments are not laid
//! out contiguously from virtual address zero.
//!
//! ## Module Structure
//!
//! - **`memory_maps`**: parses the module map, finds the mapping and module
//!   of an address.
//! - **`symbolizer`**: one binary's symbol tables, segment table and DWARF
//!   line info (`object`, `gimli`, `addr2line`), plus Rust demangling.
//! - **`resolver`**: [`SymbolResolver`], which ties both together for the
//!   whole process and formats report entries.
//!
//! ## Limitations
//!
//! - Line info requires debug info in the binary (`debug = true`);
//!   separate debug files are not searched.
//! - Only the innermost function is reported for inlined code.

pub mod memory_maps;
pub mod resolver;
pub mod symbolizer;

pub use memory_maps::{Mapping, MemoryRange, ModuleMap, ModuleRef};
pub use resolver::{ResolvedSymbol, ResolverOptions, SourceLocation, SymbolInfo, SymbolResolver};
pub use symbolizer::Symbolizer;
