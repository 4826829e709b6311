//! The x86-64 back end: registers, ABI, target lowering and the encoder.

pub mod abi;
mod emit;
pub mod regs;

#[cfg(test)]
mod emit_tests;

pub use self::emit::emit_object;
pub use self::regs::{Gpr, RegSize};

use crate::ast::TypeData;
use crate::binemit::GenericObjectFile;
use crate::ir::{FuncId, Inst, InstData};
use crate::isa::CallConv;
use crate::isel::matcher::{select_function, CompiledTable, TargetInfo};
use crate::isel::Table;
use crate::mir::{
    MFunction, MInst, MOpcode, MOperand, VReg, MIR_BACKEND_FIRST, M_BRANCH, M_CALL, M_COPY,
    M_IMM, M_LOAD, M_RETURN, M_STORE, VREG_INVALID,
};
use crate::{CodegenError, CodegenResult, Context};
use smallvec::smallvec;

/// The built-in instruction selection table for this backend.
pub const DEFAULT_ISEL_TABLE: &str = include_str!("x64.isel");

/// x86-64 machine instructions.
///
/// The discriminants live in the target opcode space of the MIR, starting at
/// [`MIR_BACKEND_FIRST`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u16)]
#[allow(missing_docs)]
pub enum X64Op {
    Mov = MIR_BACKEND_FIRST,
    Lea,
    Imul,
    Idiv,
    Div,
    Not,
    And,
    Or,
    Xor,
    Add,
    Sub,
    Cmp,
    Test,
    Shl,
    Shr,
    Sar,
    Push,
    Pop,
    Call,
    Jmp,
    Jcc,
    Setcc,
    Cwd,
    Cdq,
    Cqo,
    Ret,
    Syscall,
    Ud2,
    Int3,
    Movzx,
    Movsx,
    Xchg,
}

/// All x86-64 opcodes.
pub const ALL_OPS: [X64Op; 32] = [
    X64Op::Mov,
    X64Op::Lea,
    X64Op::Imul,
    X64Op::Idiv,
    X64Op::Div,
    X64Op::Not,
    X64Op::And,
    X64Op::Or,
    X64Op::Xor,
    X64Op::Add,
    X64Op::Sub,
    X64Op::Cmp,
    X64Op::Test,
    X64Op::Shl,
    X64Op::Shr,
    X64Op::Sar,
    X64Op::Push,
    X64Op::Pop,
    X64Op::Call,
    X64Op::Jmp,
    X64Op::Jcc,
    X64Op::Setcc,
    X64Op::Cwd,
    X64Op::Cdq,
    X64Op::Cqo,
    X64Op::Ret,
    X64Op::Syscall,
    X64Op::Ud2,
    X64Op::Int3,
    X64Op::Movzx,
    X64Op::Movsx,
    X64Op::Xchg,
];

impl X64Op {
    /// The MIR opcode of this instruction.
    pub fn opcode(self) -> MOpcode {
        MOpcode(self as u16)
    }

    /// Recover the instruction from a MIR opcode.
    pub fn from_opcode(op: MOpcode) -> Option<X64Op> {
        ALL_OPS.iter().copied().find(|x| x.opcode() == op)
    }

    /// The mnemonic as written in instruction-selection tables.
    pub fn mnemonic(self) -> &'static str {
        match self {
            X64Op::Mov => "MOV",
            X64Op::Lea => "LEA",
            X64Op::Imul => "IMUL",
            X64Op::Idiv => "IDIV",
            X64Op::Div => "DIV",
            X64Op::Not => "NOT",
            X64Op::And => "AND",
            X64Op::Or => "OR",
            X64Op::Xor => "XOR",
            X64Op::Add => "ADD",
            X64Op::Sub => "SUB",
            X64Op::Cmp => "CMP",
            X64Op::Test => "TEST",
            X64Op::Shl => "SHL",
            X64Op::Shr => "SHR",
            X64Op::Sar => "SAR",
            X64Op::Push => "PUSH",
            X64Op::Pop => "POP",
            X64Op::Call => "CALL",
            X64Op::Jmp => "JMP",
            X64Op::Jcc => "JCC",
            X64Op::Setcc => "SETCC",
            X64Op::Cwd => "CWD",
            X64Op::Cdq => "CDQ",
            X64Op::Cqo => "CQO",
            X64Op::Ret => "RET",
            X64Op::Syscall => "SYSCALL",
            X64Op::Ud2 => "UD2",
            X64Op::Int3 => "INT3",
            X64Op::Movzx => "MOVZX",
            X64Op::Movsx => "MOVSX",
            X64Op::Xchg => "XCHG",
        }
    }
}

/// Condition codes, numbered the way the instruction-selection tables write
/// them as `SETCC`/`JCC` immediates.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    /// Equal / zero.
    Eq = 0,
    /// Not equal / not zero.
    Ne = 1,
    /// Greater (signed).
    Gt = 2,
    /// Less (signed).
    Lt = 3,
    /// Greater or equal (signed).
    Ge = 4,
    /// Less or equal (signed).
    Le = 5,
}

impl Cond {
    /// Recover a condition from its table immediate.
    pub fn from_imm(imm: i64) -> Option<Cond> {
        Some(match imm {
            0 => Cond::Eq,
            1 => Cond::Ne,
            2 => Cond::Gt,
            3 => Cond::Lt,
            4 => Cond::Ge,
            5 => Cond::Le,
            _ => return None,
        })
    }
}

/// The backend's contribution to pattern matching.
pub struct X64TargetInfo;

impl TargetInfo for X64TargetInfo {
    fn opcode_for_mnemonic(&self, name: &str) -> Option<MOpcode> {
        // SAL is an alias for SHL.
        if name == "SAL" {
            return Some(X64Op::Shl.opcode());
        }
        ALL_OPS
            .iter()
            .copied()
            .find(|op| op.mnemonic() == name)
            .map(X64Op::opcode)
    }

    fn register_for_name(&self, name: &str) -> Option<VReg> {
        Gpr::by_name(name).map(Gpr::vreg)
    }

    fn clobber_allowed(&self, reg: VReg) -> bool {
        // Anything allocatable may be clobbered; the frame registers and
        // RIP may not. Liveness across the clobber is the register
        // allocator's business: the clobber becomes part of the
        // instruction's interference mask.
        abi::GENERAL_REGISTERS.contains(&reg)
    }
}

/// The machine description handed to the register allocator.
pub fn machine_description(cc: CallConv) -> crate::isa::MachineDescription {
    crate::isa::MachineDescription {
        registers: &abi::GENERAL_REGISTERS,
        scratch: abi::caller_saved(cc),
        argument_registers: abi::argument_registers(cc),
        caller_saved: abi::caller_saved(cc),
        callee_saved: abi::callee_saved(cc),
        result_register: abi::RESULT_REGISTER,
        interference: abi::interference_mask,
        call_conv: cc,
    }
}

/// Compile every function in the context into a generic object file.
pub fn compile_context(
    ctx: &mut Context,
    table: &Table,
    cc: CallConv,
) -> CodegenResult<GenericObjectFile> {
    let target = X64TargetInfo;
    let compiled = CompiledTable::new(table, &target);

    mangle_function_names(ctx);

    let func_ids: Vec<FuncId> = ctx.functions.keys().collect();
    let mut mfuncs = Vec::with_capacity(func_ids.len());
    for id in func_ids {
        let mut mfunc = MFunction::new(id, &ctx.functions[id]);
        if !mfunc.is_declaration {
            log::debug!("compiling function {}", mfunc.name);
            lower_parameters_and_locals(ctx, id, &mut mfunc, cc)?;
            select_function(ctx, id, &mut mfunc, &compiled, &target)?;
            lower_generic_mir(&mut mfunc);
            let desc = machine_description(cc);
            crate::regalloc::run(&mut mfunc, &desc)?;
            ctx.functions[id].registers_used = mfunc.registers_used;
        }
        mfuncs.push(mfunc);
    }

    assign_block_labels(&mut mfuncs);

    for var in ctx.statics.values_mut() {
        var.referenced = !var.references.is_empty();
    }

    let mut object = GenericObjectFile::new();
    emit::emit_object(ctx, &mfuncs, cc, &mut object)?;
    Ok(object)
}

/// Pre-lowering: reserve phi vregs, copy parameters out of their argument
/// registers, and turn stack allocations into frame objects addressed off
/// RBP.
fn lower_parameters_and_locals(
    ctx: &mut Context,
    func: FuncId,
    mfunc: &mut MFunction,
    cc: CallConv,
) -> CodegenResult<()> {
    let blocks: Vec<crate::ir::Block> = ctx.functions[func].layout.blocks().collect();
    let arg_regs = abi::argument_registers(cc);
    let mut frame_offset: i64 = 0;
    let mut locals_size: u64 = 0;

    for block in blocks {
        let insts: Vec<Inst> = ctx.functions[func].layout.block_insts(block).collect();
        for inst in insts {
            let data = ctx.functions[func].dfg.insts[inst].clone();
            match data {
                InstData::Phi { .. } => {
                    let v = mfunc.new_vreg();
                    if let InstData::Phi { vreg, .. } =
                        &mut ctx.functions[func].dfg.insts[inst]
                    {
                        *vreg = v;
                    }
                    ctx.functions[func].dfg.vregs[inst] = v;
                }

                InstData::Parameter { index } => {
                    let index = index as usize;
                    if index >= arg_regs.len() {
                        return Err(CodegenError::Unimplemented(format!(
                            "passing argument {index} of '{}' on the stack",
                            mfunc.name
                        )));
                    }
                    let size =
                        crate::mir::reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(inst));
                    let v = mfunc.new_vreg();
                    mfunc.push_to(
                        block,
                        MInst::with_result(
                            M_COPY,
                            v,
                            smallvec![MOperand::Reg {
                                reg: arg_regs[index],
                                size,
                            }],
                        ),
                    );
                    ctx.functions[func].dfg.vregs[inst] = v;
                }

                InstData::Alloca { size, .. } => {
                    frame_offset -= size as i64;
                    locals_size += size;
                    mfunc.frame_objects.push(crate::mir::FrameObject {
                        size,
                        offset: frame_offset,
                    });
                    if let InstData::Alloca { offset, .. } =
                        &mut ctx.functions[func].dfg.insts[inst]
                    {
                        *offset = frame_offset;
                    }
                    let v = mfunc.new_vreg();
                    mfunc.push_to(
                        block,
                        MInst::with_result(
                            X64Op::Lea.opcode(),
                            v,
                            smallvec![
                                MOperand::Reg {
                                    reg: Gpr::Rbp.vreg(),
                                    size: 8,
                                },
                                MOperand::Imm(frame_offset)
                            ],
                        ),
                    );
                    ctx.functions[func].dfg.vregs[inst] = v;
                }

                _ => {}
            }
        }
    }

    ctx.functions[func].locals_size = locals_size;
    Ok(())
}

/// Rewrite the generic MIR the selector and the fallback lowering left
/// behind into target instructions. Compute patterns come from the table;
/// this pass owns the shapes the table cannot express: control flow with
/// fallthrough, call results, and memory forms that need access sizes.
fn lower_generic_mir(mfunc: &mut MFunction) {
    let block_count = mfunc.blocks.len();
    for bi in 0..block_count {
        let next_ir_block = if bi + 1 < block_count {
            Some(mfunc.blocks[bi + 1].block)
        } else {
            None
        };
        let old = std::mem::take(&mut mfunc.blocks[bi].insts);
        let mut new = Vec::with_capacity(old.len());

        for inst in old {
            match inst.opcode {
                M_IMM => {
                    let imm = inst.operands[0];
                    new.push(MInst::with_result(
                        X64Op::Mov.opcode(),
                        inst.vreg,
                        smallvec![
                            imm,
                            MOperand::Reg {
                                reg: inst.vreg,
                                size: 8,
                            }
                        ],
                    ));
                }

                M_COPY => match inst.operands.first().copied().unwrap_or(MOperand::None) {
                    MOperand::Reg { reg, size } => {
                        new.push(MInst::with_result(
                            X64Op::Mov.opcode(),
                            inst.vreg,
                            smallvec![
                                MOperand::Reg { reg, size },
                                MOperand::Reg {
                                    reg: inst.vreg,
                                    size,
                                }
                            ],
                        ));
                    }
                    op @ (MOperand::Static(_) | MOperand::Func(_)) => {
                        new.push(MInst::with_result(
                            X64Op::Lea.opcode(),
                            inst.vreg,
                            smallvec![
                                op,
                                MOperand::Reg {
                                    reg: inst.vreg,
                                    size: 8,
                                }
                            ],
                        ));
                    }
                    _ => new.push(inst),
                },

                M_LOAD => {
                    let addr = inst.operands[0];
                    let size = match inst.operands.get(1) {
                        Some(MOperand::Imm(s)) => *s,
                        _ => 8,
                    };
                    new.push(MInst::with_result(
                        X64Op::Mov.opcode(),
                        inst.vreg,
                        smallvec![
                            addr,
                            MOperand::Imm(0),
                            MOperand::Reg {
                                reg: inst.vreg,
                                size: size as u8,
                            },
                            MOperand::Imm(size)
                        ],
                    ));
                }

                M_STORE => {
                    let addr = inst.operands[0];
                    let value = inst.operands[1];
                    new.push(MInst::new(
                        X64Op::Mov.opcode(),
                        smallvec![value, addr, MOperand::Imm(0)],
                    ));
                }

                M_CALL => {
                    let mut call = MInst::new(X64Op::Call.opcode(), inst.operands.clone());
                    call.vreg = VREG_INVALID;
                    new.push(call);
                    if inst.vreg != VREG_INVALID {
                        new.push(MInst::with_result(
                            X64Op::Mov.opcode(),
                            inst.vreg,
                            smallvec![
                                MOperand::Reg {
                                    reg: Gpr::Rax.vreg(),
                                    size: 8,
                                },
                                MOperand::Reg {
                                    reg: inst.vreg,
                                    size: 8,
                                }
                            ],
                        ));
                    }
                }

                M_RETURN => {
                    if let Some(MOperand::Reg { reg, size }) = inst.operands.first().copied() {
                        new.push(MInst::new(
                            X64Op::Mov.opcode(),
                            smallvec![
                                MOperand::Reg { reg, size },
                                MOperand::Reg {
                                    reg: Gpr::Rax.vreg(),
                                    size,
                                }
                            ],
                        ));
                    }
                    new.push(MInst::new(X64Op::Ret.opcode(), smallvec![]));
                }

                M_BRANCH => {
                    let ops = inst.operands.clone();
                    match ops.as_slice() {
                        // Unconditional; direct branches to the next block are
                        // no-ops.
                        [MOperand::Block(dest)] => {
                            if Some(*dest) != next_ir_block {
                                new.push(MInst::new(
                                    X64Op::Jmp.opcode(),
                                    smallvec![MOperand::Block(*dest)],
                                ));
                            }
                        }
                        [cond @ MOperand::Reg { .. }, MOperand::Block(then_block), MOperand::Block(else_block)] =>
                        {
                            new.push(MInst::new(X64Op::Test.opcode(), smallvec![*cond, *cond]));
                            if Some(*then_block) == next_ir_block {
                                new.push(MInst::new(
                                    X64Op::Jcc.opcode(),
                                    smallvec![
                                        MOperand::Imm(Cond::Eq as i64),
                                        MOperand::Block(*else_block)
                                    ],
                                ));
                            } else if Some(*else_block) == next_ir_block {
                                new.push(MInst::new(
                                    X64Op::Jcc.opcode(),
                                    smallvec![
                                        MOperand::Imm(Cond::Ne as i64),
                                        MOperand::Block(*then_block)
                                    ],
                                ));
                            } else {
                                new.push(MInst::new(
                                    X64Op::Jcc.opcode(),
                                    smallvec![
                                        MOperand::Imm(Cond::Eq as i64),
                                        MOperand::Block(*else_block)
                                    ],
                                ));
                                new.push(MInst::new(
                                    X64Op::Jmp.opcode(),
                                    smallvec![MOperand::Block(*then_block)],
                                ));
                            }
                        }
                        _ => new.push(inst),
                    }
                }

                // Target instructions and any remaining generic compute
                // forms pass through; the encoder reports the latter.
                _ => new.push(inst),
            }
        }

        mfunc.blocks[bi].insts = new;
    }
}

/// Assign `.L<n>` labels to every block, globally unique across the object.
fn assign_block_labels(mfuncs: &mut [MFunction]) {
    let mut counter = 0usize;
    for mfunc in mfuncs {
        for block in &mut mfunc.blocks {
            block.name = format!(".L{counter}");
            counter += 1;
        }
    }
}

/// Mangle every defined function symbol except `main` and externals:
/// `_XF<len><name><encoded-type>`.
fn mangle_function_names(ctx: &mut Context) {
    let ids: Vec<FuncId> = ctx.functions.keys().collect();
    for id in ids {
        let (name, ty) = {
            let f = &ctx.functions[id];
            if f.attrs.is_extern || f.name == "main" {
                continue;
            }
            (f.name.clone(), f.ty)
        };
        let mut mangled = format!("_XF{}{}", name.len(), name);
        mangle_type(ctx, ty, &mut mangled);
        ctx.functions[id].name = mangled;
    }
}

fn mangle_type(ctx: &Context, ty: crate::ast::Type, out: &mut String) {
    use core::fmt::Write;
    match ctx.module.type_data(ty) {
        TypeData::Primitive { name, .. } => {
            let text = ctx.module.str(*name);
            write!(out, "{}{}", text.len(), text).unwrap();
        }
        TypeData::Named { name, symbol } => {
            // Named types resolve to their last alias.
            let resolved = match &ctx.module.symbol(*symbol).kind {
                crate::ast::SymbolKind::Type { resolved } => *resolved,
                _ => None,
            };
            match resolved {
                Some(inner) => mangle_type(ctx, inner, out),
                None => {
                    let text = ctx.module.str(*name);
                    write!(out, "{}{}", text.len(), text).unwrap();
                }
            }
        }
        TypeData::Pointer { to } | TypeData::Reference { to } => {
            out.push('P');
            mangle_type(ctx, *to, out);
        }
        TypeData::Array { of, len } => {
            write!(out, "A{len}E").unwrap();
            mangle_type(ctx, *of, out);
        }
        TypeData::Function { ret, params } => {
            out.push('F');
            mangle_type(ctx, *ret, out);
            for p in params {
                mangle_type(ctx, p.ty, out);
            }
            out.push('E');
        }
        TypeData::Integer { is_signed, bits } => {
            let text = format!("{}{bits}", if *is_signed { 's' } else { 'u' });
            write!(out, "{}{}", text.len(), text).unwrap();
        }
        TypeData::Struct { name, .. } => {
            let text = match name {
                Some(n) => ctx.module.str(*n).to_string(),
                None => "struct".to_string(),
            };
            write!(out, "{}{}", text.len(), text).unwrap();
        }
    }
}
