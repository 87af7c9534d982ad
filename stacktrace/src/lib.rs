//! # stacktrace - In-process Stack Capture and Symbolication
//!
//! Captures the return addresses of the current call stack, either from
//! the point of the call or from a saved register state such as the
//! context a signal handler receives, and turns them into a readable
//! backtrace.
//!
//! ## Architecture Overview
//!
//! ```text
//!   MachineContext ──▶ StackUnwinder ──▶ StackTrace ──▶ SymbolResolver ──▶ io::Write
//!   (registers)        (fp / DWARF)      [Address; N]   (maps, ELF, DWARF)   (report)
//! ```
//!
//! Capture and rendering are separate steps: a trace is a plain `Copy`
//! value that can be taken in a constrained context and symbolized later.
//!
//! ## Module Structure
//!
//! - [`trace`]: [`StackTrace`], capture entry points and report rendering
//! - [`unwind`]: register snapshots, stack bounds and the unwinders
//! - [`symbolization`]: module map, per-binary symbol tables, [`SymbolResolver`]
//! - [`domain`]: shared types and error enums
//! - [`cli`]: argument parsing for the `stacktrace` binary
//!
//! ## Typical Usage
//!
//! ```rust,no_run
//! use stacktrace::StackTrace;
//!
//! let trace: StackTrace = StackTrace::capture();
//! trace.output_to_stream(&mut std::io::stderr()).ok();
//! ```
//!
//! Output:
//!
//! ```text
//!
//!
//! Backtrace:
//!     demo::main [0x55d4a1c02345+37] (src/main.rs:4)
//!         module: /usr/bin/demo
//! ```
//!
//! ## Supported Targets
//!
//! Linux on x86_64, x86 and aarch64. Other targets compile but capture
//! empty traces.

pub mod cli;
pub mod domain;
pub mod symbolization;
pub mod trace;
pub mod unwind;

pub use domain::{Address, MachineType, ResolverInitError};
pub use symbolization::{ResolvedSymbol, ResolverOptions, SymbolResolver};
pub use trace::{StackTrace, MAX_TRACES};
pub use unwind::{MachineContext, StackBounds, StackUnwinder};
