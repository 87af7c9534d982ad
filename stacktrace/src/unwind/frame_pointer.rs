use log::trace;

use super::{read_word, Frame, StackBounds, StackUnwinder};

/// Walks the saved frame pointer chain
///
/// Each frame record holds the caller's frame pointer at `[fp]` and the
/// return address at `[fp + word]`. A record is only followed when it is
/// word-aligned, lies inside the stack bounds, and the next record sits
/// strictly closer to the stack base.
#[derive(Debug, Clone, Copy)]
pub struct FramePointerUnwinder {
    bounds: StackBounds,
}

impl FramePointerUnwinder {
    #[must_use]
    pub fn new(bounds: StackBounds) -> Self {
        Self { bounds }
    }
}

impl StackUnwinder for FramePointerUnwinder {
    #[allow(unsafe_code)]
    fn step(&mut self, frame: &mut Frame) -> bool {
        let word = frame.machine.word_size() as u64;
        let fp = frame.fp;

        if fp == 0 || fp % word != 0 || !self.bounds.contains(fp, 2 * word) {
            trace!("frame pointer {fp:#x} is not a valid frame record");
            return false;
        }

        // SAFETY: both words were checked to lie inside the stack
        let caller_fp = unsafe { read_word(frame.machine, fp) };
        let ret = unsafe { read_word(frame.machine, fp + word) };

        if ret == 0 {
            return false;
        }
        if caller_fp != 0 && caller_fp <= fp {
            trace!("frame chain does not advance: {fp:#x} -> {caller_fp:#x}");
            return false;
        }

        frame.pc = ret;
        frame.sp = fp + 2 * word;
        frame.fp = caller_fp;
        frame.ra = None;
        true
    }
}
