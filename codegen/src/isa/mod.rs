//! Target selection, calling conventions, and the machine description the
//! register allocator works against.

pub mod x64;

use crate::mir::{MInst, VReg};
use crate::{CodegenError, CodegenResult};
use core::fmt;
use core::str;
use target_lexicon::{CallingConvention, Triple};

/// Calling convention identifiers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CallConv {
    /// System V-style convention used on Linux and most Unixes.
    SystemV,
    /// Windows "fastcall" convention.
    WindowsFastcall,
}

impl CallConv {
    /// Return the default calling convention for the given target triple.
    pub fn triple_default(triple: &Triple) -> Self {
        match triple.default_calling_convention() {
            Ok(CallingConvention::WindowsFastcall) => Self::WindowsFastcall,
            // Default to System V because most everything uses it.
            _ => Self::SystemV,
        }
    }
}

impl fmt::Display for CallConv {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            Self::SystemV => "linux",
            Self::WindowsFastcall => "mswin",
        })
    }
}

impl str::FromStr for CallConv {
    type Err = ();
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "linux" | "system_v" => Ok(Self::SystemV),
            "mswin" | "windows_fastcall" => Ok(Self::WindowsFastcall),
            _ => Err(()),
        }
    }
}

/// The supported target architectures.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Arch {
    /// x86-64.
    X64,
}

/// Look up the backend for a target triple.
pub fn lookup(triple: &Triple) -> CodegenResult<Arch> {
    match triple.architecture {
        target_lexicon::Architecture::X86_64 => Ok(Arch::X64),
        other => Err(CodegenError::Unsupported(format!(
            "target architecture {other}"
        ))),
    }
}

/// What the register allocator needs to know about the target.
pub struct MachineDescription {
    /// Allocatable registers in allocation order.
    pub registers: &'static [VReg],
    /// Registers the allocator may use freely for short-lived scratch
    /// values.
    pub scratch: &'static [VReg],
    /// Argument registers of the calling convention, in order.
    pub argument_registers: &'static [VReg],
    /// Caller-saved registers of the calling convention.
    pub caller_saved: &'static [VReg],
    /// Callee-saved registers of the calling convention.
    pub callee_saved: &'static [VReg],
    /// The register results are returned in.
    pub result_register: VReg,
    /// The registers an instruction clobbers as a side effect, as a bitset
    /// indexed by register id.
    pub interference: fn(&MInst, CallConv) -> u64,
    /// The calling convention this description was built for.
    pub call_conv: CallConv,
}
