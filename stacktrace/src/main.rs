//! # stacktrace - Main Entry Point
//!
//! Makes `--depth` nested calls, captures the stack at the bottom (directly
//! or from a `SIGUSR1` handler's saved context with `--signal`) and prints
//! the symbolized backtrace to stdout.

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::ffi::{c_int, c_void};
use std::hint::black_box;
use std::io::{self, Write};
use std::sync::OnceLock;

use stacktrace::cli::Args;
use stacktrace::{StackTrace, SymbolResolver};

// Exit codes
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_USAGE: i32 = 2;

/// Trace taken by the SIGUSR1 handler
static SIGNAL_TRACE: OnceLock<StackTrace> = OnceLock::new();

fn main() {
    env_logger::init();

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            // --help and --version are not usage errors
            let code = if e.use_stderr() { EXIT_USAGE } else { EXIT_SUCCESS };
            let _ = e.print();
            std::process::exit(code);
        }
    };

    std::process::exit(match run(&args) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            EXIT_ERROR
        }
    });
}

fn run(args: &Args) -> Result<()> {
    let capture = || {
        if args.signal {
            capture_in_signal_handler()
        } else {
            Ok(StackTrace::capture())
        }
    };
    let trace = nest(args.depth, &capture)?;
    let trace = args.limit.map_or(trace, |limit| trace.truncated(limit));

    info!("Captured {} of at most {} frames", trace.len(), trace.capacity());
    if !args.quiet {
        eprintln!("Captured {} frames at depth {}", trace.len(), args.depth);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    if args.raw {
        write!(out, "{trace}").context("Failed to write addresses")?;
    } else {
        let resolver = SymbolResolver::with_options(args.resolver_options());
        trace.render_with(&resolver, &mut out).context("Failed to write backtrace")?;
    }
    out.flush().context("Failed to flush stdout")?;
    Ok(())
}

/// Recurse `depth` times, then capture
#[inline(never)]
fn nest(depth: usize, capture: &dyn Fn() -> Result<StackTrace>) -> Result<StackTrace> {
    if depth == 0 {
        return capture();
    }
    // Keeps the recursion from becoming a tail call
    black_box(nest(black_box(depth - 1), capture))
}

#[allow(unsafe_code)]
extern "C" fn on_sigusr1(_signal: c_int, _info: *mut libc::siginfo_t, ucontext: *mut c_void) {
    // SAFETY: the kernel passes a valid ucontext_t to SA_SIGINFO handlers
    let trace = unsafe { StackTrace::from_ucontext(ucontext) };
    let _ = SIGNAL_TRACE.set(trace);
}

#[allow(unsafe_code)]
fn capture_in_signal_handler() -> Result<StackTrace> {
    unsafe {
        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = on_sigusr1 as *const () as libc::sighandler_t;
        action.sa_flags = libc::SA_SIGINFO;
        libc::sigemptyset(&mut action.sa_mask);
        if libc::sigaction(libc::SIGUSR1, &action, std::ptr::null_mut()) != 0 {
            return Err(io::Error::last_os_error()).context("Failed to install SIGUSR1 handler");
        }
        if libc::raise(libc::SIGUSR1) != 0 {
            return Err(io::Error::last_os_error()).context("Failed to raise SIGUSR1");
        }
    }
    SIGNAL_TRACE.get().copied().context("SIGUSR1 handler did not run")
}
