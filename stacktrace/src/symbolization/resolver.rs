use log::{debug, error};
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use super::memory_maps::{ModuleMap, ModuleRef};
use super::symbolizer::Symbolizer;
use crate::domain::{Address, ResolverInitError};

/// How a [`SymbolResolver`] loads and presents symbols
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverOptions {
    /// Load a module's symbols the first time one of its addresses is
    /// resolved, instead of at construction
    pub deferred_loads: bool,
    /// Demangle symbol names
    pub undecorated_names: bool,
    /// Look up source file and line
    pub load_lines: bool,
    /// Module map of the current process
    pub maps_path: PathBuf,
}

impl Default for ResolverOptions {
    fn default() -> Self {
        Self {
            deferred_loads: true,
            undecorated_names: true,
            load_lines: true,
            maps_path: PathBuf::from("/proc/self/maps"),
        }
    }
}

/// Function symbol covering an address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub name: String,
    /// Bytes from the start of the symbol
    pub displacement: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

/// Everything known about one address
///
/// Formats as one report entry, without the trailing newline:
///
/// ```text
/// \tmy_crate::handler [0x55d4a1c02345+37] (src/handler.rs:12)
/// \t\t module: /usr/bin/demo
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub address: Address,
    pub symbol: Option<SymbolInfo>,
    pub location: Option<SourceLocation>,
    pub module: Option<ModuleRef>,
}

impl ResolvedSymbol {
    /// An address nothing is known about
    #[must_use]
    pub fn unresolved(address: Address) -> Self {
        Self { address, symbol: None, location: None, module: None }
    }
}

impl fmt::Display for ResolvedSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.symbol {
            Some(symbol) => {
                write!(f, "\t{} [{}+{}]", symbol.name, self.address, symbol.displacement)?;
            }
            None => write!(f, "\t(No symbol) [{}]", self.address)?,
        }
        if let Some(location) = &self.location {
            write!(f, " ({}:{})", location.file, location.line)?;
        }
        if let Some(module) = &self.module {
            match &module.path {
                Some(path) => write!(f, "\n\t\t module: {}", path.display())?,
                None => write!(f, "\n\t\t module: [unknown module]")?,
            }
        }
        Ok(())
    }
}

/// Symbol engine for the current process
///
/// Construction reads the module map once. Per-module symbol tables are
/// loaded on first use and cached for the resolver's lifetime; a module
/// whose binary cannot be loaded is remembered as having no symbols.
///
/// Construction never fails: a resolver that could not initialise records
/// the reason in [`SymbolResolver::init_error`] and resolves nothing.
#[derive(Debug)]
pub struct SymbolResolver {
    options: ResolverOptions,
    modules: ModuleMap,
    init_error: Option<ResolverInitError>,
    symbolizers: RefCell<HashMap<PathBuf, Option<Rc<Symbolizer>>>>,
}

impl SymbolResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(ResolverOptions::default())
    }

    #[must_use]
    pub fn with_options(options: ResolverOptions) -> Self {
        let (modules, init_error) = match ModuleMap::load(&options.maps_path) {
            Ok(modules) => (modules, None),
            Err(err) => {
                error!("Symbol resolver initialization failed ({}): {err}", err.code());
                (ModuleMap::default(), Some(err))
            }
        };

        let resolver =
            Self { options, modules, init_error, symbolizers: RefCell::new(HashMap::new()) };

        if !resolver.options.deferred_loads {
            for path in resolver.modules.module_paths() {
                resolver.symbolizer_for(path);
            }
        }
        resolver
    }

    /// Why initialisation failed, or `None` if the resolver is usable
    #[must_use]
    pub fn init_error(&self) -> Option<&ResolverInitError> {
        self.init_error.as_ref()
    }

    /// Resolve one address to its symbol, source location and module
    ///
    /// Missing information is `None`; this never fails.
    #[must_use]
    pub fn resolve(&self, address: Address) -> ResolvedSymbol {
        let addr = address.as_u64();
        let Some(mapping) = self.modules.mapping_for(addr) else {
            return ResolvedSymbol::unresolved(address);
        };
        let module = self.modules.module_of(mapping);

        let symbolizer = module.path.as_deref().and_then(|path| self.symbolizer_for(path));
        let svma = symbolizer
            .as_ref()
            .and_then(|symbolizer| symbolizer.file_offset_to_address(mapping.file_offset(addr)));

        let (symbol, location) = match (symbolizer.as_deref(), svma) {
            (Some(symbolizer), Some(svma)) => {
                let symbol = symbolizer.symbol(svma).map(|(name, displacement)| SymbolInfo {
                    name: if self.options.undecorated_names {
                        Symbolizer::demangle_symbol(name)
                    } else {
                        name.to_string()
                    },
                    displacement,
                });
                let location = if self.options.load_lines {
                    symbolizer.location(svma).map(|(file, line)| SourceLocation { file, line })
                } else {
                    None
                };
                (symbol, location)
            }
            _ => (None, None),
        };

        ResolvedSymbol { address, symbol, location, module: Some(module) }
    }

    /// Write one report entry per address to `sink`
    ///
    /// # Errors
    /// Returns the first write error; nothing after it is written
    pub fn render_trace<W: Write + ?Sized>(
        &self,
        addresses: &[Address],
        sink: &mut W,
    ) -> io::Result<()> {
        for &address in addresses {
            writeln!(sink, "{}", self.resolve(address))?;
        }
        Ok(())
    }

    fn symbolizer_for(&self, path: &Path) -> Option<Rc<Symbolizer>> {
        if let Some(cached) = self.symbolizers.borrow().get(path) {
            return cached.clone();
        }

        let loaded = match Symbolizer::new(path) {
            Ok(symbolizer) => Some(Rc::new(symbolizer)),
            Err(err) => {
                debug!("No symbols for {}: {err}", path.display());
                None
            }
        };
        self.symbolizers.borrow_mut().insert(path.to_path_buf(), loaded.clone());
        loaded
    }
}

impl Default for SymbolResolver {
    fn default() -> Self {
        Self::new()
    }
}
