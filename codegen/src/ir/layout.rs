//! Function layout.
//!
//! The order of basic blocks in a function and the order of instructions in
//! a block is determined by the `Layout` data structure defined in this
//! module. It does not contain definitions of instructions or blocks, only
//! their order: the doubly linked intrusive lists are stored as
//! `PackedOption` prev/next references in secondary maps, so a link is four
//! bytes and unattached entities cost nothing.

use crate::entity::packed_option::PackedOption;
use crate::entity::SecondaryMap;
use crate::ir::{Block, Inst};

#[derive(Clone, Debug, Default)]
struct BlockNode {
    prev: PackedOption<Block>,
    next: PackedOption<Block>,
    first_inst: PackedOption<Inst>,
    last_inst: PackedOption<Inst>,
}

#[derive(Clone, Debug, Default)]
struct InstNode {
    /// The block containing this instruction.
    block: PackedOption<Block>,
    prev: PackedOption<Inst>,
    next: PackedOption<Inst>,
}

/// The layout of blocks in a function and of instructions in each block.
#[derive(Debug, Clone)]
pub struct Layout {
    blocks: SecondaryMap<Block, BlockNode>,
    insts: SecondaryMap<Inst, InstNode>,
    first_block: Option<Block>,
    last_block: Option<Block>,
}

impl Layout {
    /// Create a new empty `Layout`.
    pub fn new() -> Self {
        Self {
            blocks: SecondaryMap::new(),
            insts: SecondaryMap::new(),
            first_block: None,
            last_block: None,
        }
    }

    /// Clear the layout.
    pub fn clear(&mut self) {
        self.blocks.clear();
        self.insts.clear();
        self.first_block = None;
        self.last_block = None;
    }
}

/// Methods for laying out blocks.
impl Layout {
    /// Is `block` currently part of the layout?
    pub fn is_block_inserted(&self, block: Block) -> bool {
        Some(block) == self.first_block || self.blocks[block].prev.is_some()
    }

    /// Insert `block` as the last block in the layout.
    pub fn append_block(&mut self, block: Block) {
        debug_assert!(
            !self.is_block_inserted(block),
            "cannot append block that is already in the layout"
        );
        {
            let node = &mut self.blocks[block];
            debug_assert!(node.first_inst.is_none() && node.last_inst.is_none());
            node.prev = self.last_block.into();
            node.next = None.into();
        }
        if let Some(last) = self.last_block {
            self.blocks[last].next = block.into();
        } else {
            self.first_block = Some(block);
        }
        self.last_block = Some(block);
    }

    /// Insert `block` in the layout before the existing block `before`.
    pub fn insert_block(&mut self, block: Block, before: Block) {
        debug_assert!(
            !self.is_block_inserted(block),
            "cannot insert block that is already in the layout"
        );
        debug_assert!(
            self.is_block_inserted(before),
            "block insertion point not in the layout"
        );
        let after = self.blocks[before].prev;
        {
            let node = &mut self.blocks[block];
            node.next = before.into();
            node.prev = after;
        }
        self.blocks[before].prev = block.into();
        match after.expand() {
            None => self.first_block = Some(block),
            Some(a) => self.blocks[a].next = block.into(),
        }
    }

    /// Remove `block` from the layout. The block must be empty.
    pub fn remove_block(&mut self, block: Block) {
        debug_assert!(self.is_block_inserted(block), "block not in the layout");
        debug_assert!(
            self.blocks[block].first_inst.is_none(),
            "cannot remove a non-empty block"
        );
        let prev = self.blocks[block].prev;
        let next = self.blocks[block].next;
        match prev.expand() {
            None => self.first_block = next.expand(),
            Some(p) => self.blocks[p].next = next,
        }
        match next.expand() {
            None => self.last_block = prev.expand(),
            Some(n) => self.blocks[n].prev = prev,
        }
        self.blocks[block] = BlockNode::default();
    }

    /// The entry block, i.e. the first block in the layout.
    pub fn entry_block(&self) -> Option<Block> {
        self.first_block
    }

    /// The last block in the layout.
    pub fn last_block(&self) -> Option<Block> {
        self.last_block
    }

    /// The block following `block` in the layout.
    pub fn next_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].next.expand()
    }

    /// The block preceding `block` in the layout.
    pub fn prev_block(&self, block: Block) -> Option<Block> {
        self.blocks[block].prev.expand()
    }

    /// An iterator over the blocks in layout order.
    pub fn blocks(&self) -> Blocks {
        Blocks {
            layout: self,
            next: self.first_block,
        }
    }
}

/// Methods for laying out instructions.
impl Layout {
    /// Get the block containing `inst`, or `None` if it is not inserted.
    pub fn inst_block(&self, inst: Inst) -> Option<Block> {
        self.insts[inst].block.expand()
    }

    /// Append `inst` to the end of `block`.
    pub fn append_inst(&mut self, inst: Inst, block: Block) {
        debug_assert!(self.inst_block(inst).is_none(), "instruction already inserted");
        debug_assert!(self.is_block_inserted(block), "block not in the layout");
        {
            let node = &mut self.insts[inst];
            node.block = block.into();
            node.prev = self.blocks[block].last_inst;
            node.next = None.into();
        }
        match self.blocks[block].last_inst.expand() {
            None => self.blocks[block].first_inst = inst.into(),
            Some(last) => self.insts[last].next = inst.into(),
        }
        self.blocks[block].last_inst = inst.into();
    }

    /// Insert `inst` before the already-inserted instruction `before`.
    pub fn insert_inst(&mut self, inst: Inst, before: Inst) {
        debug_assert!(self.inst_block(inst).is_none(), "instruction already inserted");
        let block = self
            .inst_block(before)
            .expect("insertion point not in the layout");
        let prev = self.insts[before].prev;
        {
            let node = &mut self.insts[inst];
            node.block = block.into();
            node.prev = prev;
            node.next = before.into();
        }
        self.insts[before].prev = inst.into();
        match prev.expand() {
            None => self.blocks[block].first_inst = inst.into(),
            Some(p) => self.insts[p].next = inst.into(),
        }
    }

    /// Insert `inst` after the already-inserted instruction `after`.
    pub fn insert_inst_after(&mut self, inst: Inst, after: Inst) {
        debug_assert!(self.inst_block(inst).is_none(), "instruction already inserted");
        let block = self
            .inst_block(after)
            .expect("insertion point not in the layout");
        let next = self.insts[after].next;
        {
            let node = &mut self.insts[inst];
            node.block = block.into();
            node.prev = after.into();
            node.next = next;
        }
        self.insts[after].next = inst.into();
        match next.expand() {
            None => self.blocks[block].last_inst = inst.into(),
            Some(n) => self.insts[n].prev = inst.into(),
        }
    }

    /// Remove `inst` from the layout.
    pub fn remove_inst(&mut self, inst: Inst) {
        let block = self.inst_block(inst).expect("instruction not inserted");
        let prev = self.insts[inst].prev;
        let next = self.insts[inst].next;
        match prev.expand() {
            None => self.blocks[block].first_inst = next,
            Some(p) => self.insts[p].next = next,
        }
        match next.expand() {
            None => self.blocks[block].last_inst = prev,
            Some(n) => self.insts[n].prev = prev,
        }
        self.insts[inst] = InstNode::default();
    }

    /// The first instruction of `block`.
    pub fn first_inst(&self, block: Block) -> Option<Inst> {
        self.blocks[block].first_inst.expand()
    }

    /// The last instruction of `block`.
    pub fn last_inst(&self, block: Block) -> Option<Inst> {
        self.blocks[block].last_inst.expand()
    }

    /// The instruction following `inst` in its block.
    pub fn next_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].next.expand()
    }

    /// The instruction preceding `inst` in its block.
    pub fn prev_inst(&self, inst: Inst) -> Option<Inst> {
        self.insts[inst].prev.expand()
    }

    /// An iterator over the instructions of `block` in layout order.
    pub fn block_insts(&self, block: Block) -> Insts {
        Insts {
            layout: self,
            next: self.first_inst(block),
        }
    }
}

/// An iterator over blocks in layout order.
pub struct Blocks<'a> {
    layout: &'a Layout,
    next: Option<Block>,
}

impl<'a> Iterator for Blocks<'a> {
    type Item = Block;

    fn next(&mut self) -> Option<Block> {
        let cur = self.next?;
        self.next = self.layout.next_block(cur);
        Some(cur)
    }
}

/// An iterator over the instructions of one block in layout order.
pub struct Insts<'a> {
    layout: &'a Layout,
    next: Option<Inst>,
}

impl<'a> Iterator for Insts<'a> {
    type Item = Inst;

    fn next(&mut self) -> Option<Inst> {
        let cur = self.next?;
        self.next = self.layout.next_inst(cur);
        Some(cur)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::EntityRef;

    fn b(n: usize) -> Block {
        Block::new(n)
    }

    fn i(n: usize) -> Inst {
        Inst::new(n)
    }

    #[test]
    fn block_order() {
        let mut layout = Layout::new();
        assert_eq!(layout.entry_block(), None);

        layout.append_block(b(0));
        layout.append_block(b(2));
        layout.insert_block(b(1), b(2));

        let order: Vec<Block> = layout.blocks().collect();
        assert_eq!(order, [b(0), b(1), b(2)]);
        assert_eq!(layout.entry_block(), Some(b(0)));
        assert_eq!(layout.last_block(), Some(b(2)));
    }

    #[test]
    fn inst_order() {
        let mut layout = Layout::new();
        layout.append_block(b(0));

        layout.append_inst(i(0), b(0));
        layout.append_inst(i(2), b(0));
        layout.insert_inst(i(1), i(2));

        let order: Vec<Inst> = layout.block_insts(b(0)).collect();
        assert_eq!(order, [i(0), i(1), i(2)]);
        assert_eq!(layout.inst_block(i(1)), Some(b(0)));
        assert_eq!(layout.last_inst(b(0)), Some(i(2)));

        layout.remove_inst(i(1));
        let order: Vec<Inst> = layout.block_insts(b(0)).collect();
        assert_eq!(order, [i(0), i(2)]);
        assert_eq!(layout.inst_block(i(1)), None);
    }

    #[test]
    fn remove_block() {
        let mut layout = Layout::new();
        layout.append_block(b(0));
        layout.append_block(b(1));
        layout.append_inst(i(0), b(1));

        layout.remove_inst(i(0));
        layout.remove_block(b(1));
        let order: Vec<Block> = layout.blocks().collect();
        assert_eq!(order, [b(0)]);
        assert!(!layout.is_block_inserted(b(1)));
    }
}
