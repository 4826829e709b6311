//! IR entity references.
//!
//! Instructions reference blocks, functions and static variables, and — the
//! users/uses relation being cyclic — other instructions. All of these are
//! compact `u32` references into arenas owned by the function or the
//! [`Context`](crate::Context); the separate index type per entity keeps the
//! index spaces apart at compile time.
//!
//! The `Display` implementations match the textual IR format.

/// An opaque reference to an IR instruction.
///
/// Every instruction is also the SSA value it defines, so operands are
/// `Inst`s as well; a separate value entity is not needed.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Inst(u32);
gantry_entity::entity_impl!(Inst, "%");

/// An opaque reference to a basic block.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Block(u32);
gantry_entity::entity_impl!(Block, "bb");

/// An opaque reference to an IR function.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(u32);
gantry_entity::entity_impl!(FuncId, "fn");

/// An opaque reference to a variable with static storage duration.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StaticId(u32);
gantry_entity::entity_impl!(StaticId, "static");
