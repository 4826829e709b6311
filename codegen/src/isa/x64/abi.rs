//! Calling conventions and stack frames on x86-64.

use crate::isa::x64::regs::Gpr;
use crate::isa::x64::X64Op;
use crate::isa::CallConv;
use crate::mir::{MFunction, MInst, VReg};

/// Allocatable registers, in allocation order. RBP, RSP and RIP are
/// reserved.
pub const GENERAL_REGISTERS: [VReg; 14] = [
    Gpr::Rax as VReg,
    Gpr::Rcx as VReg,
    Gpr::Rdx as VReg,
    Gpr::Rsi as VReg,
    Gpr::Rdi as VReg,
    Gpr::R8 as VReg,
    Gpr::R9 as VReg,
    Gpr::R10 as VReg,
    Gpr::R11 as VReg,
    Gpr::R12 as VReg,
    Gpr::Rbx as VReg,
    Gpr::R13 as VReg,
    Gpr::R14 as VReg,
    Gpr::R15 as VReg,
];

const LINUX_ARGUMENT_REGISTERS: [VReg; 6] = [
    Gpr::Rdi as VReg,
    Gpr::Rsi as VReg,
    Gpr::Rdx as VReg,
    Gpr::Rcx as VReg,
    Gpr::R8 as VReg,
    Gpr::R9 as VReg,
];

const MSWIN_ARGUMENT_REGISTERS: [VReg; 4] = [
    Gpr::Rcx as VReg,
    Gpr::Rdx as VReg,
    Gpr::R8 as VReg,
    Gpr::R9 as VReg,
];

const LINUX_CALLER_SAVED: [VReg; 9] = [
    Gpr::Rax as VReg,
    Gpr::Rcx as VReg,
    Gpr::Rdx as VReg,
    Gpr::R8 as VReg,
    Gpr::R9 as VReg,
    Gpr::R10 as VReg,
    Gpr::R11 as VReg,
    Gpr::Rsi as VReg,
    Gpr::Rdi as VReg,
];

const MSWIN_CALLER_SAVED: [VReg; 7] = [
    Gpr::Rax as VReg,
    Gpr::Rcx as VReg,
    Gpr::Rdx as VReg,
    Gpr::R8 as VReg,
    Gpr::R9 as VReg,
    Gpr::R10 as VReg,
    Gpr::R11 as VReg,
];

const LINUX_CALLEE_SAVED: [VReg; 5] = [
    Gpr::Rbx as VReg,
    Gpr::R12 as VReg,
    Gpr::R13 as VReg,
    Gpr::R14 as VReg,
    Gpr::R15 as VReg,
];

const MSWIN_CALLEE_SAVED: [VReg; 7] = [
    Gpr::Rbx as VReg,
    Gpr::Rsi as VReg,
    Gpr::Rdi as VReg,
    Gpr::R12 as VReg,
    Gpr::R13 as VReg,
    Gpr::R14 as VReg,
    Gpr::R15 as VReg,
];

/// The ordered argument registers of a calling convention.
pub fn argument_registers(cc: CallConv) -> &'static [VReg] {
    match cc {
        CallConv::SystemV => &LINUX_ARGUMENT_REGISTERS,
        CallConv::WindowsFastcall => &MSWIN_ARGUMENT_REGISTERS,
    }
}

/// The caller-saved registers of a calling convention.
pub fn caller_saved(cc: CallConv) -> &'static [VReg] {
    match cc {
        CallConv::SystemV => &LINUX_CALLER_SAVED,
        CallConv::WindowsFastcall => &MSWIN_CALLER_SAVED,
    }
}

/// The callee-saved registers of a calling convention.
pub fn callee_saved(cc: CallConv) -> &'static [VReg] {
    match cc {
        CallConv::SystemV => &LINUX_CALLEE_SAVED,
        CallConv::WindowsFastcall => &MSWIN_CALLEE_SAVED,
    }
}

/// The register results are returned in.
pub const RESULT_REGISTER: VReg = Gpr::Rax as VReg;

fn bit(reg: VReg) -> u64 {
    1u64 << reg
}

fn bits(regs: &[VReg]) -> u64 {
    regs.iter().copied().map(bit).fold(0, |a, b| a | b)
}

/// The registers `inst` clobbers as a side effect, invisible at the IR
/// level: shifts use an implicit CL count, division writes RDX:RAX, and
/// calls clobber the result register and everything caller-saved.
pub fn interference_mask(inst: &MInst, cc: CallConv) -> u64 {
    match X64Op::from_opcode(inst.opcode) {
        Some(X64Op::Shl) | Some(X64Op::Shr) | Some(X64Op::Sar) => bit(Gpr::Rcx as VReg),
        Some(X64Op::Idiv) | Some(X64Op::Div) | Some(X64Op::Cqo) | Some(X64Op::Cdq)
        | Some(X64Op::Cwd) => bit(Gpr::Rax as VReg) | bit(Gpr::Rdx as VReg),
        Some(X64Op::Call) => bit(Gpr::Rax as VReg) | bits(caller_saved(cc)),
        _ => 0,
    }
}

/// The stack frame shapes a function can have.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FrameKind {
    /// No locals, leaf function: no frame at all.
    None,
    /// No locals, but calls out: keep the stack aligned across calls.
    Minimal,
    /// Locals present: full RBP frame.
    Full,
}

/// Choose the frame shape for a function, up front.
pub fn frame_kind(mfunc: &MFunction, is_leaf: bool) -> FrameKind {
    if !mfunc.frame_objects.is_empty() {
        return FrameKind::Full;
    }
    if !is_leaf {
        return FrameKind::Minimal;
    }
    FrameKind::None
}

/// Round `value` up to the next multiple of `align`.
pub fn align_to(value: i64, align: i64) -> i64 {
    debug_assert!(align > 0);
    (value + align - 1) / align * align
}
