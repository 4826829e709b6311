//! The SSA intermediate representation.
//!
//! A function is a control-flow graph of basic blocks holding typed
//! instructions. Each instruction is the SSA value it defines: it is defined
//! exactly once, never reassigned, and records the set of instructions using
//! it. Blocks end in exactly one terminator, and phis carry one argument per
//! CFG predecessor.

mod builder;
mod dfg;
mod entities;
mod function;
mod instructions;
pub mod layout;

pub use self::dfg::{BlockData, DataFlowGraph, UserList};
pub use self::entities::{Block, FuncId, Inst, StaticId};
pub use self::function::{DisplayFunction, Function};
pub use self::instructions::{Callee, InstData, Opcode, PhiArg};
pub use self::layout::Layout;

use crate::ast::{Node, StrId, Type};
use crate::entity::packed_option::PackedOption;

/// Linkage of a static variable.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Linkage {
    /// Visible inside the object only.
    Local,
    /// Exported from the object.
    Exported,
}

/// The compile-time initialiser of a static variable.
#[derive(Copy, Clone, Debug)]
pub enum StaticInit {
    /// An integer literal.
    Integer(u64),
    /// An interned string literal, emitted NUL-terminated.
    String(StrId),
}

/// A variable with static storage duration.
#[derive(Debug)]
pub struct StaticData {
    /// Symbol name.
    pub name: String,
    /// Value type.
    pub ty: Type,
    /// The declaration that introduced the variable, if any.
    pub decl: PackedOption<Node>,
    /// Every `static.ref` instruction referencing the variable, with the
    /// function containing it.
    pub references: Vec<(FuncId, Inst)>,
    /// Optional initialising literal.
    pub init: Option<StaticInit>,
    /// Linkage.
    pub linkage: Linkage,
    /// Set once emission observes a live reference.
    pub referenced: bool,
}
