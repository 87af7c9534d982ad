//! # Stack Unwinding
//!
//! Turns a [`MachineContext`] into the chain of caller frames, one return
//! address per step. The walk itself lives in [`crate::trace`]; this module
//! provides the per-step strategies behind the [`StackUnwinder`] trait:
//!
//! - [`FramePointerUnwinder`]: follows the saved frame pointer chain. Works
//!   on every supported architecture as long as code keeps frame pointers
//!   (this workspace forces them in `.cargo/config.toml`).
//! - [`DwarfUnwinder`]: evaluates the `.eh_frame` call frame information of
//!   whichever loaded module contains the pc, and falls back to a frame
//!   pointer step for code that has none.
//! - [`PlatformUnwinder`]: picks one of the above for a [`MachineType`].
//!
//! ## Frame layout
//!
//! ```text
//! high addresses
//! ┌───────────────────────┐
//! │ return address        │  fp + word
//! ├───────────────────────┤
//! │ caller's fp           │  fp          ◀── frame pointer register
//! ├───────────────────────┤
//! │ locals ...            │
//! └───────────────────────┘  sp
//! low addresses
//! ```
//!
//! x86_64 (rbp), x86 (ebp) and aarch64 (x29 frame records) all share this
//! layout; only the word size differs.

pub mod context;
pub mod dwarf;
mod eh_frame;
pub mod frame_pointer;

pub use context::{MachineContext, StackBounds};
pub use dwarf::DwarfUnwinder;
pub use frame_pointer::FramePointerUnwinder;

use crate::domain::MachineType;

/// Register state of one frame during a walk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame {
    pub machine: MachineType,
    pub pc: u64,
    pub sp: u64,
    pub fp: u64,
    /// Return address register, when its value is known
    pub ra: Option<u64>,
}

impl From<&MachineContext> for Frame {
    fn from(ctx: &MachineContext) -> Self {
        Self { machine: ctx.machine, pc: ctx.pc, sp: ctx.sp, fp: ctx.fp, ra: ctx.lr }
    }
}

/// One step of a stack walk
///
/// Implementations replace `frame` with its caller's frame and return
/// `true`, or return `false` when there is no further caller. They must
/// never panic: a step that cannot be computed ends the walk.
pub trait StackUnwinder {
    fn step(&mut self, frame: &mut Frame) -> bool;

    /// Forget per-walk state before starting a new walk
    fn reset(&mut self) {}
}

impl<U: StackUnwinder + ?Sized> StackUnwinder for &mut U {
    fn step(&mut self, frame: &mut Frame) -> bool {
        (**self).step(frame)
    }

    fn reset(&mut self) {
        (**self).reset();
    }
}

/// The unwinder to use for a given architecture
///
/// DWARF call frame information with a frame pointer fallback on x86_64 and
/// aarch64, plain frame pointers on x86.
#[derive(Debug)]
pub enum PlatformUnwinder {
    Dwarf(DwarfUnwinder),
    FramePointer(FramePointerUnwinder),
}

impl PlatformUnwinder {
    #[must_use]
    pub fn for_machine(machine: MachineType, bounds: StackBounds) -> Self {
        match machine {
            MachineType::X86_64 | MachineType::Aarch64 => {
                PlatformUnwinder::Dwarf(DwarfUnwinder::new(bounds))
            }
            MachineType::X86 => PlatformUnwinder::FramePointer(FramePointerUnwinder::new(bounds)),
        }
    }
}

impl StackUnwinder for PlatformUnwinder {
    fn step(&mut self, frame: &mut Frame) -> bool {
        match self {
            PlatformUnwinder::Dwarf(unwinder) => unwinder.step(frame),
            PlatformUnwinder::FramePointer(unwinder) => unwinder.step(frame),
        }
    }

    fn reset(&mut self) {
        match self {
            PlatformUnwinder::Dwarf(unwinder) => unwinder.reset(),
            PlatformUnwinder::FramePointer(unwinder) => unwinder.reset(),
        }
    }
}

/// Read one stack word of the frame's machine type
///
/// # Safety
/// `addr..addr + word_size` must be readable memory.
#[allow(unsafe_code)]
pub(crate) unsafe fn read_word(machine: MachineType, addr: u64) -> u64 {
    match machine.word_size() {
        4 => u64::from((addr as usize as *const u32).read_unaligned()),
        _ => (addr as usize as *const u64).read_unaligned(),
    }
}
