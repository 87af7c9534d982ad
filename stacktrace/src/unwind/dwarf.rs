#![allow(unsafe_code)]

use std::fmt::{Debug, Formatter};
use std::slice;

use gimli::{
    AArch64, BaseAddresses, CfaRule, EhFrame, EhFrameHdr, EndianSlice, NativeEndian, Pointer,
    Register, RegisterRule, UnwindContext, UnwindSection, X86, X86_64,
};
use log::trace;

use super::eh_frame::{find_eh_frame, EhFrameLocation};
use super::{read_word, Frame, FramePointerUnwinder, StackBounds, StackUnwinder};
use crate::domain::{MachineType, UnwindError};

/// The registers call frame information is evaluated over
///
/// Only the stack pointer, frame pointer and return address matter for
/// producing a backtrace; rules for any other register are ignored.
#[derive(Debug, Default, Clone, Copy)]
struct RegisterSet {
    sp: Option<u64>,
    fp: Option<u64>,
    ra: Option<u64>,
}

impl RegisterSet {
    fn from_frame(frame: &Frame) -> Self {
        Self { sp: Some(frame.sp), fp: Some(frame.fp), ra: frame.ra }
    }

    /// DWARF numbers of (sp, fp, ra) for a machine
    fn numbering(machine: MachineType) -> [Register; 3] {
        match machine {
            MachineType::X86_64 => [X86_64::RSP, X86_64::RBP, X86_64::RA],
            MachineType::X86 => [X86::ESP, X86::EBP, X86::RA],
            MachineType::Aarch64 => [AArch64::SP, AArch64::X29, AArch64::X30],
        }
    }

    fn slot(&mut self, machine: MachineType, reg: Register) -> Option<&mut Option<u64>> {
        let [sp, fp, ra] = Self::numbering(machine);
        if reg == sp {
            Some(&mut self.sp)
        } else if reg == fp {
            Some(&mut self.fp)
        } else if reg == ra {
            Some(&mut self.ra)
        } else {
            None
        }
    }

    fn get(mut self, machine: MachineType, reg: Register) -> Option<u64> {
        self.slot(machine, reg).and_then(|value| *value)
    }

    fn set(&mut self, machine: MachineType, reg: Register, val: Option<u64>) {
        if let Some(slot) = self.slot(machine, reg) {
            *slot = val;
        }
    }
}

/// Unwinds using `.eh_frame` call frame information
///
/// The module containing the pc is looked up among the loaded objects and
/// its `.eh_frame_hdr` binary search table is used to find the FDE. Frames
/// without unwind information get one frame pointer step instead.
pub struct DwarfUnwinder {
    bounds: StackBounds,
    unwind_ctx: UnwindContext<usize>,
    fallback: FramePointerUnwinder,
    is_first: bool,
}

impl Debug for DwarfUnwinder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DwarfUnwinder")
            .field("bounds", &self.bounds)
            .field("is_first", &self.is_first)
            .finish_non_exhaustive()
    }
}

impl DwarfUnwinder {
    #[must_use]
    pub fn new(bounds: StackBounds) -> Self {
        Self {
            bounds,
            unwind_ctx: UnwindContext::new(),
            fallback: FramePointerUnwinder::new(bounds),
            is_first: true,
        }
    }

    fn step_cfi(&mut self, frame: &mut Frame, lookup: u64) -> Result<bool, UnwindError> {
        let machine = frame.machine;
        let location = find_eh_frame(lookup as usize).ok_or(UnwindError::NoModule(lookup))?;
        let (eh_frame, bases, hdr) = parse_eh_frame(location, machine)
            .ok_or(UnwindError::NoUnwindInfo(lookup))?;
        let table = hdr.table().ok_or(UnwindError::NoUnwindInfo(lookup))?;

        let row = table
            .unwind_info_for_address(
                &eh_frame,
                &bases,
                &mut self.unwind_ctx,
                lookup,
                |section, bases, offset| section.cie_from_offset(bases, offset),
            )
            .map_err(|_| UnwindError::NoUnwindInfo(lookup))?;

        let cfa_rule = row.cfa().clone();
        let rules = RegisterSet::numbering(machine).map(|reg| (reg, row.register(reg)));

        let regs = RegisterSet::from_frame(frame);
        let cfa = match cfa_rule {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = regs
                    .get(machine, register)
                    .ok_or(UnwindError::CfaRuleUnknownRegister(register.0))?;
                base.wrapping_add_signed(offset)
            }
            _ => return Err(UnwindError::UnsupportedCfaRule),
        };

        let word = machine.word_size() as u64;
        let [_, _, ra_reg] = RegisterSet::numbering(machine);
        let mut caller = regs;
        for (reg, rule) in rules {
            let value = match rule {
                // An undefined return address marks the outermost frame;
                // callee-saved registers without a rule keep their value
                RegisterRule::Undefined if reg == ra_reg => None,
                RegisterRule::Undefined | RegisterRule::SameValue => regs.get(machine, reg),
                RegisterRule::Offset(offset) => {
                    let addr = cfa.wrapping_add_signed(offset);
                    if !self.bounds.contains(addr, word) {
                        return Err(UnwindError::OutOfBounds(addr));
                    }
                    // SAFETY: the slot lies inside the stack
                    Some(unsafe { read_word(machine, addr) })
                }
                RegisterRule::ValOffset(offset) => Some(cfa.wrapping_add_signed(offset)),
                RegisterRule::Register(other) => regs.get(machine, other),
                _ => return Err(UnwindError::UnimplementedRegisterRule(reg.0)),
            };
            caller.set(machine, reg, value);
        }

        let ret = match caller.ra {
            Some(0) | None => return Ok(false),
            Some(ret) => ret,
        };
        if cfa <= frame.sp {
            trace!("cfa {cfa:#x} does not advance past sp {:#x}", frame.sp);
            return Ok(false);
        }

        frame.pc = ret;
        frame.sp = cfa;
        frame.fp = caller.fp.unwrap_or(0);
        // Each caller recovers its return address from its own CFI row
        frame.ra = None;
        Ok(true)
    }
}

fn parse_eh_frame(
    location: EhFrameLocation,
    machine: MachineType,
) -> Option<(
    EhFrame<EndianSlice<'static, NativeEndian>>,
    BaseAddresses,
    gimli::ParsedEhFrameHdr<EndianSlice<'static, NativeEndian>>,
)> {
    // SAFETY: the header lies inside a loaded segment of a module that stays
    // mapped for as long as the trace is being captured
    let hdr_data = unsafe { slice::from_raw_parts(location.hdr as *const u8, location.hdr_len) };
    let bases = BaseAddresses::default().set_eh_frame_hdr(location.hdr as u64);
    let hdr = EhFrameHdr::new(hdr_data, NativeEndian)
        .parse(&bases, machine.word_size() as u8)
        .ok()?;

    let Pointer::Direct(eh_frame_addr) = hdr.eh_frame_ptr() else {
        return None;
    };
    let eh_frame_addr = eh_frame_addr as usize;
    if eh_frame_addr < location.hdr || eh_frame_addr >= location.segment_end {
        trace!("eh_frame at {eh_frame_addr:#x} lies outside its segment");
        return None;
    }
    // SAFETY: same segment as the header
    let eh_frame_data = unsafe {
        slice::from_raw_parts(eh_frame_addr as *const u8, location.segment_end - eh_frame_addr)
    };
    let bases = bases.set_eh_frame(eh_frame_addr as u64);
    Some((EhFrame::new(eh_frame_data, NativeEndian), bases, hdr))
}

impl StackUnwinder for DwarfUnwinder {
    fn step(&mut self, frame: &mut Frame) -> bool {
        // The first pc is where execution stopped; every later one is a
        // return address, which may already point past the end of the call's
        // FDE
        let lookup = if self.is_first { frame.pc } else { frame.pc.saturating_sub(1) };
        self.is_first = false;

        match self.step_cfi(frame, lookup) {
            Ok(more) => more,
            Err(UnwindError::NoModule(_) | UnwindError::NoUnwindInfo(_)) => {
                trace!("no CFI for {lookup:#x}, following frame pointer");
                self.fallback.step(frame)
            }
            Err(err) => {
                trace!("unwind stopped at {:#x}: {err}", frame.pc);
                false
            }
        }
    }

    fn reset(&mut self) {
        self.is_first = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(target_pointer_width = "64")]
    use crate::{domain::Address, trace::StackTrace};
    use crate::unwind::MachineContext;

    #[test]
    fn test_register_set_maps_dwarf_numbers() {
        let frame = Frame { machine: MachineType::X86_64, pc: 0, sp: 0x100, fp: 0x200, ra: None };
        let mut regs = RegisterSet::from_frame(&frame);

        assert_eq!(regs.get(MachineType::X86_64, X86_64::RSP), Some(0x100));
        assert_eq!(regs.get(MachineType::X86_64, X86_64::RBP), Some(0x200));
        assert_eq!(regs.get(MachineType::X86_64, X86_64::RA), None);
        assert_eq!(regs.get(MachineType::X86_64, X86_64::RAX), None);

        regs.set(MachineType::X86_64, X86_64::RA, Some(0x300));
        regs.set(MachineType::X86_64, X86_64::RBX, Some(0x400));
        assert_eq!(regs.ra, Some(0x300));
    }

    #[test]
    fn test_register_numbering_per_machine() {
        assert_eq!(RegisterSet::numbering(MachineType::X86), [X86::ESP, X86::EBP, X86::RA]);
        assert_eq!(
            RegisterSet::numbering(MachineType::Aarch64),
            [AArch64::SP, AArch64::X29, AArch64::X30]
        );
    }

    #[test]
    fn test_unknown_pc_falls_back_to_frame_pointer() {
        let stack = [0u64; 4];
        let base = stack.as_ptr() as u64;
        let mut unwinder = DwarfUnwinder::new(StackBounds::of_slice(&stack));
        let mut frame = Frame { machine: MachineType::X86_64, pc: 0x10, sp: base, fp: base, ra: None };

        // No module maps 0x10 and the frame record holds a null return address
        assert!(!unwinder.step(&mut frame));
        assert_eq!(frame.pc, 0x10);
    }

    #[cfg(target_pointer_width = "64")]
    #[inline(never)]
    fn caller() -> u64 {
        std::hint::black_box(7)
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn test_frame_without_cfi_takes_one_frame_pointer_step() {
        let ret = caller as usize as u64 + 4;
        let stack = [0u64, ret, 0, 0];
        let base = stack.as_ptr() as u64;
        let ctx = MachineContext::new(MachineType::X86_64, 0x10, base, base);
        let mut unwinder = DwarfUnwinder::new(StackBounds::of_slice(&stack));

        let trace: StackTrace = StackTrace::walk(&ctx, &mut unwinder);

        #[allow(clippy::cast_possible_truncation)]
        let expected = [Address(0x10), Address(ret as usize)];
        assert_eq!(&trace.addresses()[..2], &expected);
    }

    #[test]
    fn test_reset_restores_first_frame_lookup() {
        let mut unwinder = DwarfUnwinder::new(StackBounds::empty());
        let mut frame = Frame { machine: MachineType::X86_64, pc: 0x10, sp: 0, fp: 0, ra: None };

        assert!(!unwinder.step(&mut frame));
        assert!(!unwinder.is_first);
        unwinder.reset();
        assert!(unwinder.is_first);
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    fn collect(mut unwinder: impl StackUnwinder, ctx: &MachineContext) -> Vec<u64> {
        let mut frame = Frame::from(ctx);
        let mut pcs = vec![frame.pc];
        while pcs.len() < 8 && unwinder.step(&mut frame) {
            pcs.push(frame.pc);
        }
        pcs
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[inline(never)]
    fn walk_here() -> (Vec<u64>, Vec<u64>) {
        let ctx = MachineContext::capture().expect("capture is supported on this target");
        let bounds = StackBounds::current_thread();
        let cfi = collect(DwarfUnwinder::new(bounds), &ctx);
        let fp = collect(FramePointerUnwinder::new(bounds), &ctx);
        (cfi, fp)
    }

    #[cfg(all(target_os = "linux", any(target_arch = "x86_64", target_arch = "aarch64")))]
    #[test]
    fn test_cfi_walk_agrees_with_frame_pointers() {
        let (cfi, fp) = walk_here();

        assert!(cfi.len() >= 3, "cfi walk too short: {cfi:x?}");
        assert!(fp.len() >= 2, "frame pointer walk too short: {fp:x?}");
        // Both walks start at the same pc and return into this test function
        assert_eq!(cfi[0], fp[0]);
        assert_eq!(cfi[1], fp[1]);
    }
}
