//! Intermediate representation of a function.
//!
//! The `Function` struct defined in this module owns all of its basic blocks
//! and instructions; block and instruction order live in the
//! [`Layout`](crate::ir::Layout) half of the representation.

use crate::ast::{FuncAttrs, Module, Type};
use crate::ir::{Block, DataFlowGraph, Inst, Layout};
use crate::write::write_function_plain;
use core::fmt;

/// A function.
#[derive(Debug)]
pub struct Function {
    /// Name of this function. Mangled in place just before emission.
    pub name: String,

    /// The function type.
    pub ty: Type,

    /// The pre-created parameter instructions, in declaration order.
    pub params: Vec<Inst>,

    /// Data flow graph: the primary definition of all instructions and
    /// blocks.
    pub dfg: DataFlowGraph,

    /// Layout of blocks and instructions in the function body.
    pub layout: Layout,

    /// Attribute flags set by the front end.
    pub attrs: FuncAttrs,

    /// Total size of stack-allocated locals, in bytes. Computed by target
    /// lowering.
    pub locals_size: u64,

    /// Bitset of physical registers the register allocator assigned in this
    /// function, for prologue/epilogue decisions.
    pub registers_used: u64,
}

impl Function {
    /// Create an empty function with the given name and function type.
    pub fn new(name: impl Into<String>, ty: Type) -> Self {
        Self {
            name: name.into(),
            ty,
            params: Vec::new(),
            dfg: DataFlowGraph::new(),
            layout: Layout::new(),
            attrs: FuncAttrs::default(),
            locals_size: 0,
            registers_used: 0,
        }
    }

    /// Is this a declaration without a body?
    pub fn is_declaration(&self) -> bool {
        self.attrs.is_extern || self.layout.entry_block().is_none()
    }

    /// Is `block` closed, i.e. does it end in a terminator?
    pub fn is_closed(&self, block: Block) -> bool {
        match self.layout.last_inst(block) {
            Some(last) => self.dfg.insts[last].is_terminator(),
            None => false,
        }
    }

    /// The CFG predecessors of `block`: every block whose terminator can
    /// branch to it.
    pub fn predecessors(&self, block: Block) -> Vec<Block> {
        let mut preds = Vec::new();
        for b in self.layout.blocks() {
            if let Some(term) = self.layout.last_inst(b) {
                if self.dfg.insts[term]
                    .branch_destinations()
                    .contains(&block)
                    && !preds.contains(&b)
                {
                    preds.push(b);
                }
            }
        }
        preds
    }

    /// Renumber the instructions of this function.
    ///
    /// Ids are assigned sequentially in layout order starting from zero.
    /// Running the pass twice is a no-op after the first run.
    pub fn set_func_ids(&mut self) {
        let mut next = 0u32;
        let blocks: Vec<Block> = self.layout.blocks().collect();
        for block in blocks {
            let insts: Vec<Inst> = self.layout.block_insts(block).collect();
            for inst in insts {
                self.dfg.ids[inst] = next;
                next += 1;
            }
        }
    }

    /// Return an object that can display this function, resolving types and
    /// names through `module`.
    pub fn display<'a>(&'a self, module: &'a Module) -> DisplayFunction<'a> {
        DisplayFunction {
            func: self,
            module,
        }
    }
}

/// Wrapper type capable of displaying a `Function`.
pub struct DisplayFunction<'a> {
    func: &'a Function,
    module: &'a Module,
}

impl<'a> fmt::Display for DisplayFunction<'a> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write_function_plain(fmt, self.func, self.module)
    }
}
