//! Command-line interface of the `stacktrace` binary

mod args;

pub use args::Args;
