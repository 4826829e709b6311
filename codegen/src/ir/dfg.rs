//! Data flow graph tracking instructions, blocks and the users relation.

use crate::ast::Type;
use crate::entity::packed_option::PackedOption;
use crate::entity::{PrimaryMap, SecondaryMap};
use crate::ir::{Block, Inst, InstData, Opcode};
use smallvec::SmallVec;

/// A basic block. The name is assigned late, just before emission.
#[derive(Clone, Debug, Default)]
pub struct BlockData {
    /// Label assigned for emission (`.L0`, ...). Empty until then.
    pub name: Option<String>,
}

/// The set of instructions using a value. Most values have few users.
pub type UserList = SmallVec<[Inst; 4]>;

/// A data flow graph: the primary definition of all instructions and blocks
/// in a function, plus the side tables hanging off them.
///
/// Instruction order is tracked separately by the
/// [`Layout`](crate::ir::Layout); the maps here are not in program order.
///
/// The users/uses relation is inherently cyclic, so it is stored as a
/// parallel index (a `SecondaryMap` of user vectors) whose consistency the
/// builder maintains: an instruction appears in an operand's user list
/// exactly once, and removal detaches both sides.
#[derive(Debug)]
pub struct DataFlowGraph {
    /// Instruction payloads.
    pub insts: PrimaryMap<Inst, InstData>,
    /// Basic blocks.
    pub blocks: PrimaryMap<Block, BlockData>,

    /// The type of each instruction's value. Void for non-values.
    types: SecondaryMap<Inst, PackedOption<Type>>,
    /// The instructions using each instruction.
    users: SecondaryMap<Inst, UserList>,
    /// Numeric ids assigned by the renumbering passes. Stable only between
    /// renumberings.
    pub ids: SecondaryMap<Inst, u32>,
    /// Result physical register, 0 while unassigned.
    pub results: SecondaryMap<Inst, u32>,
    /// The MIR virtual register an instruction lowered to, 0 while
    /// unassigned.
    pub vregs: SecondaryMap<Inst, u32>,
}

impl DataFlowGraph {
    /// Create a new empty `DataFlowGraph`.
    pub fn new() -> Self {
        Self {
            insts: PrimaryMap::new(),
            blocks: PrimaryMap::new(),
            types: SecondaryMap::new(),
            users: SecondaryMap::new(),
            ids: SecondaryMap::new(),
            results: SecondaryMap::new(),
            vregs: SecondaryMap::new(),
        }
    }

    /// Get the total number of instructions created in this function,
    /// whether they are currently inserted in the layout or not.
    pub fn num_insts(&self) -> usize {
        self.insts.len()
    }

    /// Create a new basic block.
    pub fn make_block(&mut self) -> Block {
        self.blocks.push(BlockData::default())
    }

    /// Create a new instruction with the given payload and value type.
    ///
    /// The new instruction is recorded as a user of each of its operands.
    pub fn make_inst(&mut self, data: InstData, ty: Type) -> Inst {
        let inst = self.insts.push(data);
        self.types[inst] = ty.into();
        self.mark_operands_used(inst);
        inst
    }

    /// The opcode of `inst`.
    pub fn opcode(&self, inst: Inst) -> Opcode {
        self.insts[inst].opcode()
    }

    /// The type of the value `inst` defines.
    pub fn inst_type(&self, inst: Inst) -> Type {
        self.types[inst].expect("instruction has no type")
    }

    /// Change the type of `inst`.
    pub fn set_inst_type(&mut self, inst: Inst, ty: Type) {
        self.types[inst] = ty.into();
    }

    /// The instructions that use the value of `inst`.
    pub fn users(&self, inst: Inst) -> &[Inst] {
        &self.users[inst]
    }

    /// Record `user` as a user of `usee`. A user is recorded once no matter
    /// how many operand slots reference the value.
    pub fn add_user(&mut self, usee: Inst, user: Inst) {
        if !self.users[usee].contains(&user) {
            self.users[usee].push(user);
        }
    }

    /// Remove `user` from `usee`'s user list if no operand slot of `user`
    /// references `usee` any more.
    pub fn remove_use(&mut self, usee: Inst, user: Inst) {
        let mut still_referenced = false;
        self.insts[user].for_each_operand(|op| {
            if op == usee {
                still_referenced = true;
            }
        });
        if !still_referenced {
            self.users[usee].retain(|u| *u != user);
        }
    }

    /// Record this instruction in the user lists of all of its operands.
    pub fn mark_operands_used(&mut self, inst: Inst) {
        let mut operands = SmallVec::<[Inst; 4]>::new();
        self.insts[inst].for_each_operand(|op| operands.push(op));
        for op in operands {
            self.add_user(op, inst);
        }
    }

    /// Remove this instruction from the user lists of all of its operands.
    pub fn unmark_usees(&mut self, inst: Inst) {
        let mut operands = SmallVec::<[Inst; 4]>::new();
        self.insts[inst].for_each_operand(|op| operands.push(op));
        for op in operands {
            self.users[op].retain(|u| *u != inst);
        }
    }

    /// Replace every use of `old` with `new`.
    ///
    /// Each user of `old` has its operand slots rewritten, and its entry
    /// moves from `old`'s user list to `new`'s.
    pub fn replace_uses(&mut self, old: Inst, new: Inst) {
        if old == new {
            return;
        }
        let users = std::mem::take(&mut self.users[old]);
        for &user in &users {
            self.insts[user].map_operands(|op| if op == old { new } else { op });
            if user != new {
                self.add_user(new, user);
            }
        }
    }

    /// Visit every operand edge of `inst`: call arguments and phi values
    /// included.
    pub fn for_each_child(&self, inst: Inst, f: impl FnMut(Inst)) {
        self.insts[inst].for_each_operand(f);
    }

    /// Add an argument to a phi instruction, recording the use.
    pub fn phi_add_argument(&mut self, phi: Inst, arg: crate::ir::PhiArg) {
        let value = arg.value;
        match &mut self.insts[phi] {
            InstData::Phi { args, .. } => args.push(arg),
            other => panic!("phi_add_argument on non-phi {other:?}"),
        }
        self.add_user(value, phi);
    }

    /// Remove the phi argument arriving from `pred`, detaching the use.
    pub fn phi_remove_argument(&mut self, phi: Inst, pred: Block) {
        let removed: Vec<Inst> = match &mut self.insts[phi] {
            InstData::Phi { args, .. } => {
                let removed = args
                    .iter()
                    .filter(|a| a.block == pred)
                    .map(|a| a.value)
                    .collect();
                args.retain(|a| a.block != pred);
                removed
            }
            other => panic!("phi_remove_argument on non-phi {other:?}"),
        };
        for value in removed {
            self.remove_use(value, phi);
        }
    }
}
