//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

use crate::symbolization::ResolverOptions;

#[derive(Parser, Debug)]
#[command(
    name = "stacktrace",
    about = "Capture this process's call stack and print a symbolized backtrace",
    after_help = "\
EXAMPLES:
    stacktrace                          Capture three calls deep and symbolize
    stacktrace --depth 10 --limit 5     Deeper stack, print the innermost 5 frames
    stacktrace --signal                 Capture from inside a SIGUSR1 handler
    stacktrace --raw                    Print addresses only"
)]
pub struct Args {
    /// Nested calls to make before capturing
    #[arg(short, long, default_value_t = 3)]
    pub depth: usize,

    /// Print only the innermost N frames
    #[arg(short, long, value_name = "N")]
    pub limit: Option<usize>,

    /// Print raw addresses without symbolizing them
    #[arg(long)]
    pub raw: bool,

    /// Skip source file and line lookup
    #[arg(long)]
    pub no_lines: bool,

    /// Print symbol names as they appear in the binary
    #[arg(long)]
    pub mangled: bool,

    /// Load every module's symbols before rendering
    #[arg(long)]
    pub eager: bool,

    /// Capture from the saved context of a SIGUSR1 handler
    #[arg(long)]
    pub signal: bool,

    /// Module map to read instead of /proc/self/maps
    #[arg(long, value_name = "FILE")]
    pub maps: Option<PathBuf>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Resolver settings selected by the flags
    #[must_use]
    pub fn resolver_options(&self) -> ResolverOptions {
        let defaults = ResolverOptions::default();
        ResolverOptions {
            deferred_loads: !self.eager,
            undecorated_names: !self.mangled,
            load_lines: !self.no_lines,
            maps_path: self.maps.clone().unwrap_or(defaults.maps_path),
        }
    }
}
