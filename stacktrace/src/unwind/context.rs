//! Machine context snapshots and stack bounds
//!
//! A [`MachineContext`] is the register state an unwind starts from: either
//! the calling thread's live registers ([`MachineContext::capture`]) or a
//! state saved earlier, typically the `ucontext_t` handed to a signal
//! handler ([`MachineContext::from_ucontext`]).

#![allow(unsafe_code)]

use std::ffi::c_void;

use crate::domain::MachineType;

/// Register snapshot an unwind starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineContext {
    pub machine: MachineType,
    /// Program counter
    pub pc: u64,
    /// Frame pointer (rbp / ebp / x29)
    pub fp: u64,
    /// Stack pointer
    pub sp: u64,
    /// Link register (x30), aarch64 only
    pub lr: Option<u64>,
}

impl MachineContext {
    #[must_use]
    pub fn new(machine: MachineType, pc: u64, fp: u64, sp: u64) -> Self {
        Self { machine, pc, fp, sp, lr: None }
    }

    #[must_use]
    pub fn with_lr(mut self, lr: u64) -> Self {
        self.lr = Some(lr);
        self
    }

    /// Snapshot the calling thread's registers
    ///
    /// The program counter points into the function this call was inlined
    /// into. Returns `None` on architectures without a capture routine.
    #[inline(always)]
    #[must_use]
    pub fn capture() -> Option<Self> {
        capture_registers()
    }

    /// Read the registers saved in a signal handler's `ucontext_t`
    ///
    /// # Safety
    /// `ucontext` must be null or point to a valid `ucontext_t`, such as the
    /// third argument of an `SA_SIGINFO` handler.
    #[must_use]
    pub unsafe fn from_ucontext(ucontext: *const c_void) -> Option<Self> {
        if ucontext.is_null() {
            return None;
        }
        ucontext_registers(ucontext)
    }
}

#[cfg(target_arch = "x86_64")]
#[inline(always)]
fn capture_registers() -> Option<MachineContext> {
    let pc: u64;
    let fp: u64;
    let sp: u64;
    unsafe {
        std::arch::asm!(
            "lea {pc}, [rip]",
            "mov {fp}, rbp",
            "mov {sp}, rsp",
            pc = out(reg) pc,
            fp = out(reg) fp,
            sp = out(reg) sp,
            options(nomem, nostack, preserves_flags),
        );
    }
    Some(MachineContext::new(MachineType::X86_64, pc, fp, sp))
}

#[cfg(target_arch = "x86")]
#[inline(always)]
fn capture_registers() -> Option<MachineContext> {
    let pc: u32;
    let fp: u32;
    let sp: u32;
    unsafe {
        std::arch::asm!(
            "call 2f",
            "2:",
            "pop {pc}",
            "mov {fp}, ebp",
            "mov {sp}, esp",
            pc = out(reg) pc,
            fp = out(reg) fp,
            sp = out(reg) sp,
        );
    }
    Some(MachineContext::new(MachineType::X86, u64::from(pc), u64::from(fp), u64::from(sp)))
}

#[cfg(target_arch = "aarch64")]
#[inline(always)]
fn capture_registers() -> Option<MachineContext> {
    let pc: u64;
    let fp: u64;
    let sp: u64;
    let lr: u64;
    unsafe {
        std::arch::asm!(
            "adr {pc}, .",
            "mov {fp}, x29",
            "mov {sp}, sp",
            "mov {lr}, x30",
            pc = out(reg) pc,
            fp = out(reg) fp,
            sp = out(reg) sp,
            lr = out(reg) lr,
            options(nomem, nostack, preserves_flags),
        );
    }
    Some(MachineContext::new(MachineType::Aarch64, pc, fp, sp).with_lr(lr))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")))]
#[inline(always)]
fn capture_registers() -> Option<MachineContext> {
    None
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
unsafe fn ucontext_registers(ucontext: *const c_void) -> Option<MachineContext> {
    let uc = &*ucontext.cast::<libc::ucontext_t>();
    let gregs = &uc.uc_mcontext.gregs;
    Some(MachineContext::new(
        MachineType::X86_64,
        gregs[libc::REG_RIP as usize] as u64,
        gregs[libc::REG_RBP as usize] as u64,
        gregs[libc::REG_RSP as usize] as u64,
    ))
}

#[cfg(all(target_os = "linux", target_arch = "x86"))]
unsafe fn ucontext_registers(ucontext: *const c_void) -> Option<MachineContext> {
    let uc = &*ucontext.cast::<libc::ucontext_t>();
    let gregs = &uc.uc_mcontext.gregs;
    Some(MachineContext::new(
        MachineType::X86,
        u64::from(gregs[libc::REG_EIP as usize] as u32),
        u64::from(gregs[libc::REG_EBP as usize] as u32),
        u64::from(gregs[libc::REG_ESP as usize] as u32),
    ))
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
unsafe fn ucontext_registers(ucontext: *const c_void) -> Option<MachineContext> {
    let uc = &*ucontext.cast::<libc::ucontext_t>();
    let mc = &uc.uc_mcontext;
    Some(
        MachineContext::new(MachineType::Aarch64, mc.pc, mc.regs[29], mc.sp)
            .with_lr(mc.regs[30]),
    )
}

#[cfg(not(all(
    target_os = "linux",
    any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")
)))]
unsafe fn ucontext_registers(_ucontext: *const c_void) -> Option<MachineContext> {
    None
}

/// Address range of a thread's stack
///
/// Every memory read an unwinder performs must fall inside these bounds,
/// which keeps a corrupt frame chain from faulting the walk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackBounds {
    /// Lowest valid address
    pub low: u64,
    /// One past the highest valid address
    pub high: u64,
}

impl StackBounds {
    #[must_use]
    pub fn new(low: u64, high: u64) -> Self {
        Self { low, high }
    }

    /// Bounds that reject every read
    #[must_use]
    pub fn empty() -> Self {
        Self { low: 0, high: 0 }
    }

    /// Bounds covering a caller-owned buffer
    #[must_use]
    pub fn of_slice<T>(slice: &[T]) -> Self {
        let low = slice.as_ptr() as u64;
        Self { low, high: low + std::mem::size_of_val(slice) as u64 }
    }

    /// Check whether `len` bytes starting at `addr` lie inside the stack
    #[must_use]
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.low && addr.checked_add(len).is_some_and(|end| end <= self.high)
    }

    /// Stack of the calling thread
    ///
    /// Falls back to [`StackBounds::empty`] when the platform cannot report
    /// it, which limits any trace to its first frame.
    #[must_use]
    pub fn current_thread() -> Self {
        current_thread_stack().unwrap_or_else(|| {
            log::debug!("stack bounds of the current thread are unknown");
            Self::empty()
        })
    }
}

#[cfg(target_os = "linux")]
fn current_thread_stack() -> Option<StackBounds> {
    unsafe {
        let mut attr: libc::pthread_attr_t = std::mem::zeroed();
        if libc::pthread_getattr_np(libc::pthread_self(), &mut attr) != 0 {
            return None;
        }
        let mut addr: *mut c_void = std::ptr::null_mut();
        let mut size: libc::size_t = 0;
        let rc = libc::pthread_attr_getstack(&attr, &mut addr, &mut size);
        libc::pthread_attr_destroy(&mut attr);
        if rc != 0 || addr.is_null() {
            return None;
        }
        let low = addr as u64;
        Some(StackBounds::new(low, low + size as u64))
    }
}

#[cfg(not(target_os = "linux"))]
fn current_thread_stack() -> Option<StackBounds> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_contains() {
        let bounds = StackBounds::new(0x1000, 0x2000);

        assert!(bounds.contains(0x1000, 8));
        assert!(bounds.contains(0x1FF8, 8));
        assert!(!bounds.contains(0x1FFC, 8));
        assert!(!bounds.contains(0x0FF8, 8));
        assert!(!bounds.contains(u64::MAX - 2, 8));
    }

    #[test]
    fn test_empty_bounds_reject_everything() {
        let bounds = StackBounds::empty();
        assert!(!bounds.contains(0, 1));
        assert!(!bounds.contains(0x1000, 8));
    }

    #[test]
    fn test_slice_bounds() {
        let buf = [0usize; 4];
        let bounds = StackBounds::of_slice(&buf);
        let base = buf.as_ptr() as u64;
        let word = std::mem::size_of::<usize>() as u64;

        assert!(bounds.contains(base, word));
        assert!(bounds.contains(base + 3 * word, word));
        assert!(!bounds.contains(base + 4 * word, word));
    }

    #[test]
    fn test_null_ucontext() {
        assert!(unsafe { MachineContext::from_ucontext(std::ptr::null()) }.is_none());
    }

    #[cfg(all(
        target_os = "linux",
        any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")
    ))]
    #[test]
    fn test_capture_lies_on_current_stack() {
        let ctx = MachineContext::capture().expect("capture is supported on this target");
        let bounds = StackBounds::current_thread();

        assert_eq!(Some(ctx.machine), MachineType::host());
        assert_ne!(ctx.pc, 0);
        assert!(bounds.contains(ctx.sp, 1), "sp {:#x} outside {bounds:?}", ctx.sp);
    }
}
