//! Domain types providing compile-time safety and self-documentation

use std::fmt;

/// A return address captured from the call stack
///
/// Has no identity beyond its numeric value. Displays as `0x`-prefixed
/// lower-case hex, the form used in every rendered report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(pub usize);

impl Address {
    /// The null address, used to pad unused trace slots
    pub const NULL: Address = Address(0);

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0 as u64
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Processor architecture a machine context was taken on
///
/// Selects the register numbering and word size the unwinders apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MachineType {
    X86_64,
    X86,
    Aarch64,
}

impl MachineType {
    /// The architecture this crate was compiled for, if it is supported
    #[must_use]
    pub const fn host() -> Option<Self> {
        if cfg!(target_arch = "x86_64") {
            Some(MachineType::X86_64)
        } else if cfg!(target_arch = "x86") {
            Some(MachineType::X86)
        } else if cfg!(target_arch = "aarch64") {
            Some(MachineType::Aarch64)
        } else {
            None
        }
    }

    /// Size of a stack slot in bytes
    #[must_use]
    pub const fn word_size(self) -> usize {
        match self {
            MachineType::X86_64 | MachineType::Aarch64 => 8,
            MachineType::X86 => 4,
        }
    }
}

impl fmt::Display for MachineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MachineType::X86_64 => "x86_64",
            MachineType::X86 => "x86",
            MachineType::Aarch64 => "aarch64",
        };
        f.write_str(name)
    }
}
