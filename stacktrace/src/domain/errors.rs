//! Structured error types for stacktrace
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! None of these ever escape a capture or a render as a panic: they are
//! recorded, logged, and turned into degraded output.

use std::path::PathBuf;
use thiserror::Error;

/// The symbol engine could not be initialised for the current process
#[derive(Error, Debug)]
pub enum ResolverInitError {
    #[error("Failed to read module map {path}: {source}")]
    ModuleMapUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed module map {path}, line {line}: {reason}")]
    ModuleMapMalformed { path: PathBuf, line: usize, reason: String },

    #[error("No executable modules found in {0}")]
    NoModules(PathBuf),
}

impl ResolverInitError {
    /// Numeric status code for the failure
    ///
    /// The OS error number when the failure came from the OS, `-1` otherwise.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            ResolverInitError::ModuleMapUnreadable { source, .. } => {
                source.raw_os_error().unwrap_or(-1)
            }
            ResolverInitError::ModuleMapMalformed { .. } | ResolverInitError::NoModules(_) => -1,
        }
    }
}

/// Symbols for one module binary could not be loaded
#[derive(Error, Debug)]
pub enum SymbolizationError {
    #[error("Failed to read binary {path}: {source}")]
    BinaryUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse object file {path}: {source}")]
    ObjectParseFailed {
        path: PathBuf,
        #[source]
        source: object::Error,
    },

    #[error("Failed to load DWARF debug information: {0}")]
    Dwarf(#[from] gimli::Error),
}

/// A single unwind step could not be computed
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnwindError {
    #[error("no module contains pc {0:#x}")]
    NoModule(u64),

    #[error("no unwind information for pc {0:#x}")]
    NoUnwindInfo(u64),

    #[error("unsupported CFA rule")]
    UnsupportedCfaRule,

    #[error("CFA rule references unknown register {0}")]
    CfaRuleUnknownRegister(u16),

    #[error("unimplemented rule for register {0}")]
    UnimplementedRegisterRule(u16),

    #[error("read of {0:#x} is outside the stack")]
    OutOfBounds(u64),
}
