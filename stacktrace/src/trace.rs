//! Captured stack traces
//!
//! A [`StackTrace`] is a fixed-capacity list of code addresses, innermost
//! frame first. Capturing never allocates for the addresses and never
//! fails: an unwind that cannot continue just ends the trace early.

#![allow(unsafe_code)]

use std::ffi::c_void;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io::{self, Write};

use crate::domain::Address;
use crate::symbolization::SymbolResolver;
use crate::unwind::{Frame, MachineContext, PlatformUnwinder, StackBounds, StackUnwinder};

/// Default number of frames a trace holds
pub const MAX_TRACES: usize = 64;

/// Up to `N` return addresses of one call stack
#[derive(Clone, Copy)]
pub struct StackTrace<const N: usize = MAX_TRACES> {
    trace: [Address; N],
    count: usize,
}

impl<const N: usize> StackTrace<N> {
    /// A trace holding no addresses
    #[must_use]
    pub const fn empty() -> Self {
        Self { trace: [Address::NULL; N], count: 0 }
    }

    /// Capture the calling thread's stack
    ///
    /// The first address lies in the function that called `capture`.
    #[inline(never)]
    #[must_use]
    pub fn capture() -> Self {
        let Some(ctx) = MachineContext::capture() else {
            return Self::empty();
        };
        let mut unwinder =
            PlatformUnwinder::for_machine(ctx.machine, StackBounds::current_thread());
        // Frame 0 is this function
        Self::walk_skipping(&ctx, &mut unwinder, 1)
    }

    /// Capture the stack a saved register state belongs to
    ///
    /// The context must have been taken on the calling thread's stack, e.g.
    /// inside a signal handler running on it. The first address is the
    /// context's program counter.
    #[must_use]
    pub fn from_context(ctx: &MachineContext) -> Self {
        let mut unwinder =
            PlatformUnwinder::for_machine(ctx.machine, StackBounds::current_thread());
        Self::walk(ctx, &mut unwinder)
    }

    /// Capture the stack of the `ucontext_t` a signal handler received
    ///
    /// Returns an empty trace when `ucontext` is null or the architecture
    /// is unsupported.
    ///
    /// # Safety
    /// `ucontext` must be null or point to a valid `ucontext_t` saved on the
    /// calling thread, such as the third argument of an `SA_SIGINFO` handler.
    #[must_use]
    pub unsafe fn from_ucontext(ucontext: *const c_void) -> Self {
        match MachineContext::from_ucontext(ucontext) {
            Some(ctx) => Self::from_context(&ctx),
            None => Self::empty(),
        }
    }

    /// Walk from `ctx` with the given unwinder
    ///
    /// The unwinder is reset first, so one unwinder can serve many walks.
    pub fn walk<U: StackUnwinder + ?Sized>(ctx: &MachineContext, unwinder: &mut U) -> Self {
        Self::walk_skipping(ctx, unwinder, 0)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn walk_skipping<U: StackUnwinder + ?Sized>(
        ctx: &MachineContext,
        unwinder: &mut U,
        mut skip: usize,
    ) -> Self {
        let mut trace = Self::empty();
        let mut frame = Frame::from(ctx);
        unwinder.reset();

        while trace.count < N && frame.pc != 0 {
            if skip > 0 {
                skip -= 1;
            } else {
                trace.trace[trace.count] = Address(frame.pc as usize);
                trace.count += 1;
            }
            if trace.count == N || !unwinder.step(&mut frame) {
                break;
            }
        }
        trace
    }

    /// The captured addresses, innermost first
    #[must_use]
    pub fn addresses(&self) -> &[Address] {
        &self.trace[..self.count]
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.count
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Maximum number of addresses this trace type holds
    #[must_use]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// The innermost `len` frames of this trace
    #[must_use]
    pub fn truncated(&self, len: usize) -> Self {
        let mut trace = *self;
        trace.count = self.count.min(len);
        trace.trace[trace.count..].fill(Address::NULL);
        trace
    }

    /// Symbolize and write the trace to `sink`
    ///
    /// Builds a [`SymbolResolver`] for this call; use
    /// [`StackTrace::render_with`] to share one between reports.
    ///
    /// # Errors
    /// Returns the first write error from `sink`
    pub fn output_to_stream<W: Write + ?Sized>(&self, sink: &mut W) -> io::Result<()> {
        self.render_with(&SymbolResolver::new(), sink)
    }

    /// Symbolize and write the trace to `sink` with an existing resolver
    ///
    /// A resolver that failed to initialise still produces a report: a
    /// notice line followed by the raw addresses.
    ///
    /// # Errors
    /// Returns the first write error from `sink`
    pub fn render_with<W: Write + ?Sized>(
        &self,
        resolver: &SymbolResolver,
        sink: &mut W,
    ) -> io::Result<()> {
        if let Some(err) = resolver.init_error() {
            writeln!(
                sink,
                "Error initializing symbols ({}).  Dumping unresolved backtrace:",
                err.code()
            )?;
            for address in self.addresses() {
                writeln!(sink, "\t{address}")?;
            }
            return Ok(());
        }

        sink.write_all(b"\n\nBacktrace:\n")?;
        resolver.render_trace(self.addresses(), sink)
    }
}

impl<const N: usize> Default for StackTrace<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> PartialEq for StackTrace<N> {
    fn eq(&self, other: &Self) -> bool {
        self.addresses() == other.addresses()
    }
}

impl<const N: usize> Eq for StackTrace<N> {}

impl<const N: usize> Hash for StackTrace<N> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.addresses().hash(state);
    }
}

impl<const N: usize> fmt::Debug for StackTrace<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackTrace")
            .field("capacity", &N)
            .field("addresses", &self.addresses())
            .finish()
    }
}

/// Raw addresses, one per line
impl<const N: usize> fmt::Display for StackTrace<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for address in self.addresses() {
            writeln!(f, "{address}")?;
        }
        Ok(())
    }
}
