//! x86-64 registers and their encodings.

use crate::mir::VReg;
use core::fmt;

/// A general-purpose x86-64 register.
///
/// The discriminants double as the physical register ids in MIR (all below
/// `VREG_MIN`); zero is reserved for "no register". The order puts the
/// allocatable caller-saved registers first, which is also the allocation
/// order the register allocator prefers.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u32)]
pub enum Gpr {
    /// `%rax`
    Rax = 1,
    /// `%rcx`
    Rcx,
    /// `%rdx`
    Rdx,
    /// `%rsi`
    Rsi,
    /// `%rdi`
    Rdi,
    /// `%r8`
    R8,
    /// `%r9`
    R9,
    /// `%r10`
    R10,
    /// `%r11`
    R11,
    /// `%r12`
    R12,
    /// `%rbx`
    Rbx,
    /// `%r13`
    R13,
    /// `%r14`
    R14,
    /// `%r15`
    R15,
    /// `%rbp`
    Rbp,
    /// `%rsp`
    Rsp,
    /// `%rip`; only valid as an addressing base.
    Rip,
}

/// All registers, in id order.
pub const ALL_GPRS: [Gpr; 17] = [
    Gpr::Rax,
    Gpr::Rcx,
    Gpr::Rdx,
    Gpr::Rsi,
    Gpr::Rdi,
    Gpr::R8,
    Gpr::R9,
    Gpr::R10,
    Gpr::R11,
    Gpr::R12,
    Gpr::Rbx,
    Gpr::R13,
    Gpr::R14,
    Gpr::R15,
    Gpr::Rbp,
    Gpr::Rsp,
    Gpr::Rip,
];

impl Gpr {
    /// The MIR register id of this register.
    pub fn vreg(self) -> VReg {
        self as VReg
    }

    /// Recover a register from its MIR id.
    pub fn from_vreg(reg: VReg) -> Option<Gpr> {
        ALL_GPRS.iter().copied().find(|g| g.vreg() == reg)
    }

    /// The 4-bit hardware encoding; the top bit becomes REX.B/REX.R/REX.X.
    pub fn regbits(self) -> u8 {
        match self {
            Gpr::Rax => 0b0000,
            Gpr::Rcx => 0b0001,
            Gpr::Rdx => 0b0010,
            Gpr::Rbx => 0b0011,
            Gpr::Rsp => 0b0100,
            Gpr::Rbp => 0b0101,
            Gpr::Rsi => 0b0110,
            Gpr::Rdi => 0b0111,
            Gpr::R8 => 0b1000,
            Gpr::R9 => 0b1001,
            Gpr::R10 => 0b1010,
            Gpr::R11 => 0b1011,
            Gpr::R12 => 0b1100,
            Gpr::R13 => 0b1101,
            Gpr::R14 => 0b1110,
            Gpr::R15 => 0b1111,
            Gpr::Rip => panic!("%rip has no ModRM encoding"),
        }
    }

    /// Is the top encoding bit set, i.e. does this register need
    /// REX.B/REX.R/REX.X?
    pub fn needs_rex_bit(self) -> bool {
        self != Gpr::Rip && self.regbits() & 0b1000 != 0
    }

    /// The name of the register at the given access size.
    pub fn name(self, size: RegSize) -> &'static str {
        use RegSize::*;
        match self {
            Gpr::Rax => match size {
                R8 => "al",
                R16 => "ax",
                R32 => "eax",
                R64 => "rax",
            },
            Gpr::Rcx => match size {
                R8 => "cl",
                R16 => "cx",
                R32 => "ecx",
                R64 => "rcx",
            },
            Gpr::Rdx => match size {
                R8 => "dl",
                R16 => "dx",
                R32 => "edx",
                R64 => "rdx",
            },
            Gpr::Rbx => match size {
                R8 => "bl",
                R16 => "bx",
                R32 => "ebx",
                R64 => "rbx",
            },
            Gpr::Rsp => match size {
                R8 => "spl",
                R16 => "sp",
                R32 => "esp",
                R64 => "rsp",
            },
            Gpr::Rbp => match size {
                R8 => "bpl",
                R16 => "bp",
                R32 => "ebp",
                R64 => "rbp",
            },
            Gpr::Rsi => match size {
                R8 => "sil",
                R16 => "si",
                R32 => "esi",
                R64 => "rsi",
            },
            Gpr::Rdi => match size {
                R8 => "dil",
                R16 => "di",
                R32 => "edi",
                R64 => "rdi",
            },
            Gpr::R8 => match size {
                R8 => "r8b",
                R16 => "r8w",
                R32 => "r8d",
                R64 => "r8",
            },
            Gpr::R9 => match size {
                R8 => "r9b",
                R16 => "r9w",
                R32 => "r9d",
                R64 => "r9",
            },
            Gpr::R10 => match size {
                R8 => "r10b",
                R16 => "r10w",
                R32 => "r10d",
                R64 => "r10",
            },
            Gpr::R11 => match size {
                R8 => "r11b",
                R16 => "r11w",
                R32 => "r11d",
                R64 => "r11",
            },
            Gpr::R12 => match size {
                R8 => "r12b",
                R16 => "r12w",
                R32 => "r12d",
                R64 => "r12",
            },
            Gpr::R13 => match size {
                R8 => "r13b",
                R16 => "r13w",
                R32 => "r13d",
                R64 => "r13",
            },
            Gpr::R14 => match size {
                R8 => "r14b",
                R16 => "r14w",
                R32 => "r14d",
                R64 => "r14",
            },
            Gpr::R15 => match size {
                R8 => "r15b",
                R16 => "r15w",
                R32 => "r15d",
                R64 => "r15",
            },
            Gpr::Rip => "rip",
        }
    }

    /// Look a register up by its 64-bit name, with or without the `%`
    /// sigil.
    pub fn by_name(name: &str) -> Option<Gpr> {
        let name = name.strip_prefix('%').unwrap_or(name);
        ALL_GPRS
            .iter()
            .copied()
            .find(|g| g.name(RegSize::R64) == name)
    }
}

impl fmt::Display for Gpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "%{}", self.name(RegSize::R64))
    }
}

/// Register access sizes.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegSize {
    /// 8-bit access.
    R8,
    /// 16-bit access.
    R16,
    /// 32-bit access.
    R32,
    /// 64-bit access.
    R64,
}

impl RegSize {
    /// The access size in bytes.
    pub fn bytes(self) -> u8 {
        match self {
            Self::R8 => 1,
            Self::R16 => 2,
            Self::R32 => 4,
            Self::R64 => 8,
        }
    }

    /// The access size covering `bytes` bytes, rounding up. Zero maps to a
    /// 64-bit access.
    pub fn from_bytes(bytes: u8) -> Self {
        match bytes {
            1 => Self::R8,
            2 => Self::R16,
            3 | 4 => Self::R32,
            _ => Self::R64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodings() {
        assert_eq!(Gpr::Rax.regbits(), 0);
        assert_eq!(Gpr::Rsp.regbits(), 0b100);
        assert_eq!(Gpr::Rbp.regbits(), 0b101);
        assert_eq!(Gpr::R12.regbits(), 0b1100);
        assert!(Gpr::R8.needs_rex_bit());
        assert!(!Gpr::Rdi.needs_rex_bit());
    }

    #[test]
    fn names_and_sizes() {
        assert_eq!(Gpr::Rax.name(RegSize::R32), "eax");
        assert_eq!(Gpr::Rsi.name(RegSize::R8), "sil");
        assert_eq!(Gpr::by_name("%r13"), Some(Gpr::R13));
        assert_eq!(RegSize::from_bytes(3), RegSize::R32);
        assert_eq!(RegSize::from_bytes(0), RegSize::R64);
    }
}
