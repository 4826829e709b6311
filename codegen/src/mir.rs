//! The machine IR.
//!
//! MIR is target-parametric: instructions carry either a generic opcode
//! (`M_*`, below [`MIR_BACKEND_FIRST`]) or a target-specific one at or above
//! it. Values are virtual registers; [`VREG_MIN`] and up are virtual,
//! everything below denotes a physical register, and zero is invalid.
//!
//! An instruction has up to three inline operand slots; variadic forms such
//! as calls with more than two arguments spill into a heap-allocated bundle,
//! which is exactly what the `SmallVec` inline capacity models.

use crate::ast::Module;
use crate::entity::SecondaryMap;
use crate::ir::{Block, Callee, FuncId, Function, Inst, InstData, Opcode, StaticId};
use crate::Context;
use core::fmt;
use smallvec::SmallVec;

/// A virtual (or, below [`VREG_MIN`], physical) register id.
pub type VReg = u32;

/// The first virtual register id. Values below denote physical registers.
pub const VREG_MIN: VReg = 1024;

/// The invalid register id: a MIR sink with no definable result.
pub const VREG_INVALID: VReg = 0;

/// A MIR opcode: generic below [`MIR_BACKEND_FIRST`], target-specific at or
/// above it.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct MOpcode(pub u16);

/// Materialise an immediate.
pub const M_IMM: MOpcode = MOpcode(0);
/// Register copy.
pub const M_COPY: MOpcode = MOpcode(1);
/// Call: callee first, then arguments.
pub const M_CALL: MOpcode = MOpcode(2);
/// Load from an address register.
pub const M_LOAD: MOpcode = MOpcode(3);
/// Store to an address register.
pub const M_STORE: MOpcode = MOpcode(4);
/// Return, with an optional value operand.
pub const M_RETURN: MOpcode = MOpcode(5);
/// Branch: one block operand, or condition plus two blocks.
pub const M_BRANCH: MOpcode = MOpcode(6);
/// Bitwise not.
pub const M_NOT: MOpcode = MOpcode(7);
/// Addition.
pub const M_ADD: MOpcode = MOpcode(8);
/// Subtraction.
pub const M_SUB: MOpcode = MOpcode(9);
/// Multiplication.
pub const M_MUL: MOpcode = MOpcode(10);
/// Division.
pub const M_DIV: MOpcode = MOpcode(11);
/// Remainder.
pub const M_MOD: MOpcode = MOpcode(12);
/// Shift left.
pub const M_SHL: MOpcode = MOpcode(13);
/// Arithmetic shift right.
pub const M_SAR: MOpcode = MOpcode(14);
/// Logical shift right.
pub const M_SHR: MOpcode = MOpcode(15);
/// Bitwise and.
pub const M_AND: MOpcode = MOpcode(16);
/// Bitwise or.
pub const M_OR: MOpcode = MOpcode(17);
/// Less than.
pub const M_LT: MOpcode = MOpcode(18);
/// Less than or equal.
pub const M_LE: MOpcode = MOpcode(19);
/// Greater than.
pub const M_GT: MOpcode = MOpcode(20);
/// Greater than or equal.
pub const M_GE: MOpcode = MOpcode(21);
/// Equal.
pub const M_EQ: MOpcode = MOpcode(22);
/// Not equal.
pub const M_NE: MOpcode = MOpcode(23);

/// First opcode value available to backends.
pub const MIR_BACKEND_FIRST: u16 = 24;

impl MOpcode {
    /// Is this a generic MIR opcode, i.e. not yet lowered to the target?
    pub fn is_generic(self) -> bool {
        self.0 < MIR_BACKEND_FIRST
    }

    /// The mnemonic of a generic opcode.
    pub fn generic_name(self) -> Option<&'static str> {
        Some(match self {
            M_IMM => "M_IMM",
            M_COPY => "M_COPY",
            M_CALL => "M_CALL",
            M_LOAD => "M_LOAD",
            M_STORE => "M_STORE",
            M_RETURN => "M_RETURN",
            M_BRANCH => "M_BRANCH",
            M_NOT => "M_NOT",
            M_ADD => "M_ADD",
            M_SUB => "M_SUB",
            M_MUL => "M_MUL",
            M_DIV => "M_DIV",
            M_MOD => "M_MOD",
            M_SHL => "M_SHL",
            M_SAR => "M_SAR",
            M_SHR => "M_SHR",
            M_AND => "M_AND",
            M_OR => "M_OR",
            M_LT => "M_LT",
            M_LE => "M_LE",
            M_GT => "M_GT",
            M_GE => "M_GE",
            M_EQ => "M_EQ",
            M_NE => "M_NE",
            _ => return None,
        })
    }
}

impl fmt::Debug for MOpcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.generic_name() {
            Some(name) => f.write_str(name),
            None => write!(f, "MI({})", self.0),
        }
    }
}

/// The generic opcode matching a binary IR opcode.
pub fn binary_opcode(op: Opcode) -> MOpcode {
    match op {
        Opcode::Add => M_ADD,
        Opcode::Sub => M_SUB,
        Opcode::Mul => M_MUL,
        Opcode::Div => M_DIV,
        Opcode::Mod => M_MOD,
        Opcode::Shl => M_SHL,
        Opcode::Sar => M_SAR,
        Opcode::Shr => M_SHR,
        Opcode::And => M_AND,
        Opcode::Or => M_OR,
        Opcode::Lt => M_LT,
        Opcode::Le => M_LE,
        Opcode::Gt => M_GT,
        Opcode::Ge => M_GE,
        Opcode::Eq => M_EQ,
        Opcode::Ne => M_NE,
        other => panic!("not a binary opcode: {other}"),
    }
}

/// A machine instruction operand.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MOperand {
    /// Empty slot.
    None,
    /// Immediate value.
    Imm(i64),
    /// Register, virtual or physical, with its access size in bytes.
    Reg {
        /// Register id.
        reg: VReg,
        /// Access size in bytes: 1, 2, 4 or 8. Zero when unknown.
        size: u8,
    },
    /// Reference to a function; the operand's type is a symbol name.
    Func(FuncId),
    /// Reference to a static variable; the operand's type is a symbol name.
    Static(StaticId),
    /// A basic block.
    Block(Block),
    /// Poison value.
    Poison,
}

/// The operand storage of an instruction: three inline slots, spilling to a
/// heap bundle for variadic forms.
pub type MOperands = SmallVec<[MOperand; 3]>;

/// A machine instruction.
#[derive(Clone, Debug)]
pub struct MInst {
    /// The opcode.
    pub opcode: MOpcode,
    /// The virtual register this instruction defines, or [`VREG_INVALID`].
    pub vreg: VReg,
    /// Operands in order.
    pub operands: MOperands,
}

impl MInst {
    /// Create an instruction with no result.
    pub fn new(opcode: MOpcode, operands: MOperands) -> Self {
        Self {
            opcode,
            vreg: VREG_INVALID,
            operands,
        }
    }

    /// Create an instruction defining `vreg`.
    pub fn with_result(opcode: MOpcode, vreg: VReg, operands: MOperands) -> Self {
        Self {
            opcode,
            vreg,
            operands,
        }
    }
}

/// A frame object: a stack-allocated value, with the offset from the frame
/// base computed at emission.
#[derive(Copy, Clone, Debug)]
pub struct FrameObject {
    /// Size in bytes.
    pub size: u64,
    /// Offset from RBP, filled in by the encoder.
    pub offset: i64,
}

/// A machine basic block: a label and an ordered instruction vector.
pub struct MBlock {
    /// The label. Assigned late, `.L<n>` for local blocks.
    pub name: String,
    /// The IR block this was lowered from.
    pub block: Block,
    /// Instructions in order.
    pub insts: Vec<MInst>,
}

/// A machine function.
pub struct MFunction {
    /// Symbol name; mangled in place before emission.
    pub name: String,
    /// The IR function this was lowered from.
    pub func: FuncId,
    /// True for declarations: a symbol is emitted, no code.
    pub is_declaration: bool,
    /// Blocks in layout order.
    pub blocks: Vec<MBlock>,
    /// Stack frame objects in allocation order.
    pub frame_objects: Vec<FrameObject>,
    /// The next virtual register to hand out.
    pub next_vreg: VReg,
    /// Bitset of physical registers the allocator used.
    pub registers_used: u64,
    /// Index of the machine block lowered from each IR block.
    pub block_index: SecondaryMap<Block, u32>,
}

impl MFunction {
    /// Create a machine function mirroring the block structure of `func`.
    pub fn new(id: FuncId, func: &Function) -> Self {
        let mut blocks = Vec::new();
        let mut block_index = SecondaryMap::with_default(u32::MAX);
        for block in func.layout.blocks() {
            block_index[block] = blocks.len() as u32;
            blocks.push(MBlock {
                name: String::new(),
                block,
                insts: Vec::new(),
            });
        }
        Self {
            name: func.name.clone(),
            func: id,
            is_declaration: func.is_declaration(),
            blocks,
            frame_objects: Vec::new(),
            next_vreg: VREG_MIN,
            registers_used: 0,
            block_index,
        }
    }

    /// Allocate a fresh virtual register.
    pub fn new_vreg(&mut self) -> VReg {
        let v = self.next_vreg;
        self.next_vreg += 1;
        v
    }

    /// Append an instruction to the machine block lowered from `block`.
    pub fn push_to(&mut self, block: Block, inst: MInst) {
        let idx = self.block_index[block] as usize;
        self.blocks[idx].insts.push(inst);
    }
}

/// Clamp a type size to a register access size in bytes.
pub fn reg_size_for(module: &Module, ty: crate::ast::Type) -> u8 {
    match module.type_sizeof(ty) {
        0 | 1 => 1,
        2 => 2,
        3 | 4 => 4,
        _ => 8,
    }
}

/// Lower one IR instruction to generic MIR, recursively materialising its
/// operands, and return the virtual register holding its value.
///
/// Instructions that were already lowered (by the pattern matcher or the
/// target's pre-lowering) just return their recorded vreg. Phis return their
/// reserved vreg; values pinned by `register` return the physical register;
/// terminators and stores return [`VREG_INVALID`].
pub fn lower_inst(ctx: &mut Context, func: FuncId, mfunc: &mut MFunction, inst: Inst) -> VReg {
    let existing = ctx.functions[func].dfg.vregs[inst];
    if existing != VREG_INVALID {
        return existing;
    }

    let block = ctx.functions[func]
        .layout
        .inst_block(inst)
        .expect("lowering a detached instruction");
    let data = ctx.functions[func].dfg.insts[inst].clone();
    let size = reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(inst));

    let vreg = match data {
        InstData::Phi { vreg, .. } => {
            debug_assert!(vreg != VREG_INVALID, "phi vreg not reserved");
            vreg
        }
        InstData::Register { reg } => reg,
        InstData::Unreachable => VREG_INVALID,

        InstData::Immediate { value } => {
            let v = mfunc.new_vreg();
            mfunc.push_to(
                block,
                MInst::with_result(M_IMM, v, smallvec::smallvec![MOperand::Imm(value as i64)]),
            );
            v
        }

        InstData::Call { callee, args, .. } => {
            let is_void = ctx
                .module
                .type_is_void(ctx.functions[func].dfg.inst_type(inst));
            let callee_op = match callee {
                Callee::Indirect(c) => {
                    let creg = lower_inst(ctx, func, mfunc, c);
                    MOperand::Reg { reg: creg, size: 8 }
                }
                Callee::Direct(f) => MOperand::Func(f),
            };
            let mut operands: MOperands = smallvec::smallvec![callee_op];
            for arg in &args {
                let areg = lower_inst(ctx, func, mfunc, *arg);
                let asize = reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(*arg));
                operands.push(MOperand::Reg {
                    reg: areg,
                    size: asize,
                });
            }
            let v = if is_void {
                VREG_INVALID
            } else {
                mfunc.new_vreg()
            };
            mfunc.push_to(block, MInst::with_result(M_CALL, v, operands));
            v
        }

        InstData::Load { addr } => {
            let a = lower_inst(ctx, func, mfunc, addr);
            let v = mfunc.new_vreg();
            mfunc.push_to(
                block,
                MInst::with_result(
                    M_LOAD,
                    v,
                    smallvec::smallvec![
                        MOperand::Reg { reg: a, size: 8 },
                        MOperand::Imm(i64::from(size))
                    ],
                ),
            );
            v
        }

        InstData::Store { addr, value } => {
            let a = lower_inst(ctx, func, mfunc, addr);
            let vsize = reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(value));
            let v = lower_inst(ctx, func, mfunc, value);
            mfunc.push_to(
                block,
                MInst::new(
                    M_STORE,
                    smallvec::smallvec![
                        MOperand::Reg { reg: a, size: 8 },
                        MOperand::Reg { reg: v, size: vsize }
                    ],
                ),
            );
            VREG_INVALID
        }

        InstData::Return { value } => {
            let mut operands = MOperands::new();
            if let Some(v) = value {
                let vsize = reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(v));
                let r = lower_inst(ctx, func, mfunc, v);
                operands.push(MOperand::Reg { reg: r, size: vsize });
            }
            mfunc.push_to(block, MInst::new(M_RETURN, operands));
            VREG_INVALID
        }

        InstData::Branch { destination } => {
            mfunc.push_to(
                block,
                MInst::new(M_BRANCH, smallvec::smallvec![MOperand::Block(destination)]),
            );
            VREG_INVALID
        }

        InstData::BranchCond {
            condition,
            then_block,
            else_block,
        } => {
            let csize = reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(condition));
            let c = lower_inst(ctx, func, mfunc, condition);
            mfunc.push_to(
                block,
                MInst::new(
                    M_BRANCH,
                    smallvec::smallvec![
                        MOperand::Reg { reg: c, size: csize },
                        MOperand::Block(then_block),
                        MOperand::Block(else_block)
                    ],
                ),
            );
            VREG_INVALID
        }

        InstData::Unary {
            opcode: Opcode::Copy,
            operand,
        } => {
            // A copy feeding a phi takes over the phi's reserved vreg,
            // collapsing the join out of SSA.
            let phi_vreg = ctx.functions[func]
                .dfg
                .users(inst)
                .iter()
                .find_map(|&user| match &ctx.functions[func].dfg.insts[user] {
                    InstData::Phi { vreg, .. } if *vreg != VREG_INVALID => Some(*vreg),
                    _ => None,
                });
            let src = lower_inst(ctx, func, mfunc, operand);
            let v = phi_vreg.unwrap_or_else(|| mfunc.new_vreg());
            mfunc.push_to(
                block,
                MInst::with_result(
                    M_COPY,
                    v,
                    smallvec::smallvec![MOperand::Reg { reg: src, size }],
                ),
            );
            v
        }

        InstData::Unary {
            opcode: Opcode::Not,
            operand,
        } => {
            let src = lower_inst(ctx, func, mfunc, operand);
            let v = mfunc.new_vreg();
            mfunc.push_to(
                block,
                MInst::with_result(
                    M_NOT,
                    v,
                    smallvec::smallvec![MOperand::Reg { reg: src, size }],
                ),
            );
            v
        }

        InstData::Unary { opcode, .. } => panic!("unexpected unary opcode {opcode}"),

        InstData::Binary { opcode, lhs, rhs } => {
            let lsize = reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(lhs));
            let rsize = reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(rhs));
            let l = lower_inst(ctx, func, mfunc, lhs);
            let r = lower_inst(ctx, func, mfunc, rhs);
            let v = mfunc.new_vreg();
            mfunc.push_to(
                block,
                MInst::with_result(
                    binary_opcode(opcode),
                    v,
                    smallvec::smallvec![
                        MOperand::Reg { reg: l, size: lsize },
                        MOperand::Reg { reg: r, size: rsize }
                    ],
                ),
            );
            v
        }

        InstData::StaticRef { var } => {
            let v = mfunc.new_vreg();
            mfunc.push_to(
                block,
                MInst::with_result(M_COPY, v, smallvec::smallvec![MOperand::Static(var)]),
            );
            v
        }

        InstData::FuncRef { func: f } => {
            let v = mfunc.new_vreg();
            mfunc.push_to(
                block,
                MInst::with_result(M_COPY, v, smallvec::smallvec![MOperand::Func(f)]),
            );
            v
        }

        InstData::Parameter { .. } | InstData::Alloca { .. } => {
            panic!("parameters and allocas are lowered by the target before generic lowering")
        }
        InstData::LitInteger { .. } | InstData::LitString { .. } => {
            panic!("literal transfer instructions never reach MIR lowering")
        }
    };

    ctx.functions[func].dfg.vregs[inst] = vreg;
    vreg
}
