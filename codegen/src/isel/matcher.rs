//! The table-driven instruction selector.
//!
//! The matcher consumes IR in block order. At each instruction position it
//! attempts the table's rules, longest matched sequence first and
//! declaration order among equals; a commutative `with` clause may retry
//! with its two operands swapped, and a pattern whose prefix matched may
//! fall back to its `link` pattern instead of restarting from scratch. On
//! success the matched instructions are absorbed, the emitted machine
//! instructions are appended to the current machine block, and the IR→MIR
//! mapping is recorded on the matched instructions. Instructions no rule
//! matches fall back to the generic lowering in [`crate::mir`].

use crate::ir::{Block, FuncId, Inst, InstData, Opcode};
use crate::isel::{
    CmpKind, Constraint, ConstraintParam, EmitOperand, Filter, FilterOperand, OperandType,
    Pattern, ResultSpec, Table,
};
use crate::mir::{self, MFunction, MInst, MOpcode, MOperand, MOperands, VReg, VREG_INVALID};
use crate::{CodegenError, CodegenResult, Context};
use smallvec::SmallVec;

/// What the backend contributes to matching: mnemonic and register
/// resolution.
pub trait TargetInfo {
    /// The target opcode for an UPPERCASE mnemonic, if the backend knows it.
    fn opcode_for_mnemonic(&self, name: &str) -> Option<MOpcode>;
    /// The physical register for a `%name`, if the backend knows it.
    fn register_for_name(&self, name: &str) -> Option<VReg>;
    /// May a pattern clobber this register here? Patterns whose clobbers are
    /// refused do not apply.
    fn clobber_allowed(&self, reg: VReg) -> bool;
}

/// A table with its interned mnemonics resolved against one backend.
pub struct CompiledTable<'a> {
    /// The source table.
    pub table: &'a Table,
    /// Per interned instruction name: the IR opcode it selects in `where`
    /// clauses.
    ir_opcodes: Vec<Option<Opcode>>,
    /// Per interned instruction name: the target opcode it names in `emit`
    /// clauses.
    target_opcodes: Vec<Option<MOpcode>>,
    /// Per interned register name: the physical register.
    registers: Vec<Option<VReg>>,
    /// Pattern indices, longest sequence first, declaration order among
    /// equals.
    order: Vec<usize>,
}

impl<'a> CompiledTable<'a> {
    /// Resolve `table` against a backend.
    pub fn new(table: &'a Table, target: &dyn TargetInfo) -> CompiledTable<'a> {
        let ir_opcodes = table
            .instruction_names
            .iter()
            .map(|name| {
                Opcode::ALL
                    .iter()
                    .copied()
                    .find(|op| op.isel_name() == name)
            })
            .collect();
        let target_opcodes = table
            .instruction_names
            .iter()
            .map(|name| target.opcode_for_mnemonic(name))
            .collect();
        let registers = table
            .register_names
            .iter()
            .map(|name| target.register_for_name(name))
            .collect();

        let mut order: Vec<usize> = (0..table.patterns.len()).collect();
        order.sort_by_key(|&i| core::cmp::Reverse(table.patterns[i].icount));

        CompiledTable {
            table,
            ir_opcodes,
            target_opcodes,
            registers,
            order,
        }
    }

    fn register(&self, idx: usize) -> CodegenResult<VReg> {
        self.registers[idx].ok_or_else(|| {
            CodegenError::Unsupported(format!(
                "unknown register '{}' in isel table",
                self.table.register_names[idx]
            ))
        })
    }
}

/// One operand of an instruction as the matcher sees it: a value edge or a
/// block edge.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum View {
    Val(Inst),
    Blk(Block),
}

/// A successfully bound named operand.
#[derive(Copy, Clone, Debug)]
enum Bound {
    Value(Inst),
    Imm { value: u64, inst: Inst },
    StaticRef(crate::ir::StaticId, Inst),
    FuncRef(FuncId, Inst),
    Block(Block),
}

impl Bound {
    fn inst(&self) -> Option<Inst> {
        match self {
            Bound::Value(i)
            | Bound::Imm { inst: i, .. }
            | Bound::StaticRef(_, i)
            | Bound::FuncRef(_, i) => Some(*i),
            Bound::Block(_) => None,
        }
    }
}

fn operand_views(data: &InstData, inst: Inst) -> SmallVec<[View; 4]> {
    let mut views = SmallVec::new();
    match data {
        InstData::Branch { destination } => views.push(View::Blk(*destination)),
        InstData::BranchCond {
            condition,
            then_block,
            else_block,
        } => {
            views.push(View::Val(*condition));
            views.push(View::Blk(*then_block));
            views.push(View::Blk(*else_block));
        }
        // An immediate's payload counts as its one operand; this is what
        // lets patterns bind and absorb constants.
        InstData::Immediate { .. } => views.push(View::Val(inst)),
        other => other.for_each_operand(|i| views.push(View::Val(i))),
    }
    views
}

/// Run the selector over one function, filling `mfunc`.
pub fn select_function(
    ctx: &mut Context,
    func: FuncId,
    mfunc: &mut MFunction,
    compiled: &CompiledTable,
    target: &dyn TargetInfo,
) -> CodegenResult<()> {
    let blocks: Vec<Block> = ctx.functions[func].layout.blocks().collect();
    for block in blocks {
        let insts: Vec<Inst> = ctx.functions[func].layout.block_insts(block).collect();
        let mut pos = 0;
        while pos < insts.len() {
            let inst = insts[pos];
            let opcode = ctx.functions[func].dfg.opcode(inst);

            // Parameters and allocas were handled by the target's
            // pre-lowering, phis were collapsed onto reserved vregs, and
            // the literal transfer instructions never lower at all.
            if matches!(
                opcode,
                Opcode::Parameter
                    | Opcode::Alloca
                    | Opcode::Phi
                    | Opcode::LitInteger
                    | Opcode::LitString
            ) || ctx.functions[func].dfg.vregs[inst] != VREG_INVALID
            {
                pos += 1;
                continue;
            }

            match try_patterns(ctx, func, mfunc, compiled, target, &insts[pos..])? {
                Some(matched_len) => pos += matched_len,
                None => {
                    mir::lower_inst(ctx, func, mfunc, inst);
                    pos += 1;
                }
            }
        }
    }
    Ok(())
}

/// Try every applicable pattern at the start of `window`, in priority
/// order. Returns the length of the matched sequence on success.
fn try_patterns(
    ctx: &mut Context,
    func: FuncId,
    mfunc: &mut MFunction,
    compiled: &CompiledTable,
    target: &dyn TargetInfo,
    window: &[Inst],
) -> CodegenResult<Option<usize>> {
    let mut tried = vec![false; compiled.table.patterns.len()];
    let order = &compiled.order;
    let mut queue: Vec<usize> = Vec::new();
    let mut next_order = 0;

    loop {
        let idx = match queue.pop() {
            Some(i) => i,
            None => {
                if next_order == order.len() {
                    return Ok(None);
                }
                let i = order[next_order];
                next_order += 1;
                i
            }
        };
        if tried[idx] {
            continue;
        }
        tried[idx] = true;

        let pattern = &compiled.table.patterns[idx];
        match try_one(ctx, func, compiled, pattern, window) {
            MatchOutcome::Matched(bindings) => {
                if !clobbers_allowed(compiled, target, pattern)? {
                    continue;
                }
                apply(ctx, func, mfunc, compiled, pattern, window, bindings)?;
                return Ok(Some(pattern.icount));
            }
            MatchOutcome::PrefixOnly => {
                // The prefix matched; retry the linked fallback next rather
                // than restarting the scan from scratch.
                if let Some(link) = pattern.link {
                    if !tried[link] {
                        queue.push(link);
                    }
                }
            }
            MatchOutcome::Failed => {}
        }
    }
}

fn clobbers_allowed(
    compiled: &CompiledTable,
    target: &dyn TargetInfo,
    pattern: &Pattern,
) -> CodegenResult<bool> {
    for &clobber in &pattern.clobbers {
        let reg = compiled.register(clobber)?;
        if !target.clobber_allowed(reg) {
            return Ok(false);
        }
    }
    Ok(true)
}

enum MatchOutcome {
    Matched(Vec<Bound>),
    /// The filters on `i1` held but a later instruction failed.
    PrefixOnly,
    Failed,
}

fn try_one(
    ctx: &Context,
    func: FuncId,
    compiled: &CompiledTable,
    pattern: &Pattern,
    window: &[Inst],
) -> MatchOutcome {
    if window.len() < pattern.icount {
        return MatchOutcome::Failed;
    }
    let seq = &window[..pattern.icount];
    let mut bindings: Vec<Bound> = Vec::new();
    let mut lead_held = false;

    for filter in &pattern.filters {
        if !match_filter(ctx, func, compiled, filter, seq, &mut bindings) {
            return if lead_held && filter.iname > 1 {
                MatchOutcome::PrefixOnly
            } else {
                MatchOutcome::Failed
            };
        }
        if filter.iname == 1 {
            lead_held = true;
        }
    }
    MatchOutcome::Matched(bindings)
}

fn match_filter(
    ctx: &Context,
    func: FuncId,
    compiled: &CompiledTable,
    filter: &Filter,
    seq: &[Inst],
    bindings: &mut Vec<Bound>,
) -> bool {
    let inst = seq[filter.iname - 1];
    let dfg = &ctx.functions[func].dfg;
    let opcode = dfg.opcode(inst);

    if let Some(name) = filter.instruction {
        match compiled.ir_opcodes[name] {
            Some(required) if required == opcode => {}
            _ => return false,
        }
    }

    if filter.operands.is_empty() {
        return true;
    }

    let views = operand_views(&dfg.insts[inst], inst);

    // A commutative clause (explicit, or implied by a commutative opcode)
    // may try the two operands in either order. The swap is a distinct
    // attempt at the same priority.
    let commutative =
        filter.commutative || (filter.operands.len() == 2 && opcode.is_commutative());

    let saved = bindings.len();
    if match_operands(ctx, func, compiled, filter, seq, &views, false, bindings) {
        return true;
    }
    bindings.truncate(saved);
    if commutative && views.len() == 2 {
        if match_operands(ctx, func, compiled, filter, seq, &views, true, bindings) {
            return true;
        }
        bindings.truncate(saved);
    }
    false
}

#[allow(clippy::too_many_arguments)]
fn match_operands(
    ctx: &Context,
    func: FuncId,
    compiled: &CompiledTable,
    filter: &Filter,
    seq: &[Inst],
    views: &[View],
    swapped: bool,
    bindings: &mut Vec<Bound>,
) -> bool {
    let view_at = |j: usize| -> Option<View> {
        let idx = if swapped && views.len() == 2 { 1 - j } else { j };
        views.get(idx).copied()
    };

    let mut consumed = 0usize;
    for op in &filter.operands {
        match op {
            FilterOperand::Rest => return true,

            FilterOperand::IName(n) => {
                match view_at(consumed) {
                    Some(View::Val(v)) if v == seq[*n - 1] => consumed += 1,
                    _ => return false,
                }
            }

            FilterOperand::Operand {
                name,
                ty,
                constraint,
            } => {
                let view = match view_at(consumed) {
                    Some(v) => v,
                    None => return false,
                };
                let bound = match classify(ctx, func, view, *ty) {
                    Some(b) => b,
                    None => return false,
                };
                if !check_constraint(ctx, func, compiled, constraint, &bound, seq, bindings) {
                    return false;
                }
                if let Some(n) = name {
                    debug_assert_eq!(*n, bindings.len() + 1, "operand names are sequential");
                    bindings.push(bound);
                }
                consumed += 1;
            }
        }
    }

    // Without a rest operand the clause must cover every operand.
    consumed == views.len()
}

fn classify(ctx: &Context, func: FuncId, view: View, ty: OperandType) -> Option<Bound> {
    let dfg = &ctx.functions[func].dfg;
    match (ty, view) {
        (OperandType::Block, View::Blk(b)) => Some(Bound::Block(b)),
        (OperandType::Block, View::Val(_)) => None,

        (OperandType::Imm, View::Val(inst)) => match dfg.insts[inst] {
            InstData::Immediate { value } => Some(Bound::Imm { value, inst }),
            _ => None,
        },

        (OperandType::Name, View::Val(inst)) => match dfg.insts[inst] {
            InstData::StaticRef { var } => Some(Bound::StaticRef(var, inst)),
            InstData::FuncRef { func: f } => Some(Bound::FuncRef(f, inst)),
            _ => None,
        },

        (OperandType::Reg, View::Val(inst)) => Some(Bound::Value(inst)),

        (OperandType::Any, View::Val(inst)) => match dfg.insts[inst] {
            InstData::Immediate { value } => Some(Bound::Imm { value, inst }),
            _ => Some(Bound::Value(inst)),
        },
        (OperandType::Any, View::Blk(b)) => Some(Bound::Block(b)),

        _ => None,
    }
}

fn check_constraint(
    ctx: &Context,
    func: FuncId,
    compiled: &CompiledTable,
    constraint: &Constraint,
    bound: &Bound,
    seq: &[Inst],
    bindings: &[Bound],
) -> bool {
    let (kind, params) = match constraint {
        Constraint::Any => return true,
        Constraint::Cmp { kind, params } => (*kind, params),
    };

    // Alternatives are combined with '|': the constraint holds when any one
    // of them does (all of them, for 'ne').
    let check_one = |param: &ConstraintParam| -> bool {
        match (bound, param) {
            (Bound::Imm { value, .. }, ConstraintParam::Immediate(rhs)) => {
                let lhs = *value as i64;
                let rhs = *rhs as i64;
                match kind {
                    CmpKind::Eq => lhs == rhs,
                    CmpKind::Ne => lhs != rhs,
                    CmpKind::Lt => lhs < rhs,
                    CmpKind::Gt => lhs > rhs,
                    CmpKind::Le => lhs <= rhs,
                    CmpKind::Ge => lhs >= rhs,
                }
            }

            (Bound::Value(inst), ConstraintParam::Register(reg_idx)) => {
                let reg = match compiled.registers[*reg_idx] {
                    Some(r) => r,
                    None => return false,
                };
                let dfg = &ctx.functions[func].dfg;
                let inst_reg = match dfg.insts[*inst] {
                    InstData::Register { reg } => reg,
                    _ => dfg.results[*inst],
                };
                match kind {
                    CmpKind::Eq => inst_reg == reg,
                    CmpKind::Ne => inst_reg != reg,
                    _ => false,
                }
            }

            (Bound::Value(inst), ConstraintParam::IName(n)) => {
                let other = seq.get(*n - 1).copied();
                match kind {
                    CmpKind::Eq => other == Some(*inst),
                    CmpKind::Ne => other != Some(*inst),
                    _ => false,
                }
            }

            (Bound::Value(inst), ConstraintParam::OName(m)) => {
                let other = bindings.get(*m - 1).and_then(|b| b.inst());
                match kind {
                    CmpKind::Eq => other == Some(*inst),
                    CmpKind::Ne => other != Some(*inst),
                    _ => false,
                }
            }

            _ => false,
        }
    };

    match kind {
        CmpKind::Ne => params.iter().all(check_one),
        _ => params.iter().any(check_one),
    }
}

/// Apply a matched pattern: emit its machine instructions and record the
/// IR→MIR mapping on the matched sequence.
fn apply(
    ctx: &mut Context,
    func: FuncId,
    mfunc: &mut MFunction,
    compiled: &CompiledTable,
    pattern: &Pattern,
    window: &[Inst],
    bindings: Vec<Bound>,
) -> CodegenResult<()> {
    let seq: Vec<Inst> = window[..pattern.icount].to_vec();
    let last = *seq.last().expect("patterns match at least one instruction");

    // Resolve the output of the synthesised sequence.
    let out = match pattern.result {
        ResultSpec::Register(idx) => compiled.register(idx)?,
        ResultSpec::OName(n) => {
            let bound = bindings.get(n - 1).ok_or_else(|| {
                CodegenError::Unsupported(format!("out names unbound operand o{n}"))
            })?;
            match bound.inst() {
                Some(inst) => mir::lower_inst(ctx, func, mfunc, inst),
                None => {
                    return Err(CodegenError::Unsupported(
                        "out cannot name a block operand".to_string(),
                    ))
                }
            }
        }
        ResultSpec::Any | ResultSpec::None => {
            let produces = {
                let dfg = &ctx.functions[func].dfg;
                dfg.insts[last].is_value() && !ctx.module.type_is_void(dfg.inst_type(last))
            };
            if produces {
                mfunc.new_vreg()
            } else {
                VREG_INVALID
            }
        }
    };

    // Emit the machine instructions in declared order.
    let emit_count = pattern.emits.len();
    for (ei, emit) in pattern.emits.iter().enumerate() {
        let opcode = compiled.target_opcodes[emit.instruction].ok_or_else(|| {
            CodegenError::Unsupported(format!(
                "isel table emits unknown target instruction '{}'",
                compiled.table.instruction_names[emit.instruction]
            ))
        })?;

        let mut operands = MOperands::new();
        for op in &emit.operands {
            let operand = match op {
                EmitOperand::OName(n) => {
                    let bound = bindings.get(*n - 1).ok_or_else(|| {
                        CodegenError::Unsupported(format!("emit names unbound operand o{n}"))
                    })?;
                    match *bound {
                        Bound::Value(inst) => {
                            let size =
                                mir::reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(inst));
                            let reg = mir::lower_inst(ctx, func, mfunc, inst);
                            MOperand::Reg { reg, size }
                        }
                        Bound::Imm { value, .. } => MOperand::Imm(value as i64),
                        Bound::StaticRef(var, _) => MOperand::Static(var),
                        Bound::FuncRef(f, _) => MOperand::Func(f),
                        Bound::Block(b) => MOperand::Block(b),
                    }
                }
                EmitOperand::IName(n) => {
                    let inst = seq[*n - 1];
                    let size =
                        mir::reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(inst));
                    let reg = mir::lower_inst(ctx, func, mfunc, inst);
                    MOperand::Reg { reg, size }
                }
                EmitOperand::Result => {
                    let size =
                        mir::reg_size_for(&ctx.module, ctx.functions[func].dfg.inst_type(last));
                    MOperand::Reg { reg: out, size }
                }
                EmitOperand::Immediate(v) => MOperand::Imm(*v as i64),
                EmitOperand::Register(idx) => MOperand::Reg {
                    reg: compiled.register(*idx)?,
                    size: 8,
                },
            };
            operands.push(operand);
        }

        let block = ctx.functions[func]
            .layout
            .inst_block(last)
            .expect("matched instruction is inserted");
        let mut minst = MInst::new(opcode, operands);
        if ei + 1 == emit_count && out != VREG_INVALID {
            minst.vreg = out;
        }
        mfunc.push_to(block, minst);
    }

    // Record the mapping, and for discard patterns rewire the users of the
    // absorbed instructions onto the bound output value.
    if pattern.discard {
        if let ResultSpec::OName(n) = pattern.result {
            if let Some(target_inst) = bindings[n - 1].inst() {
                for &inst in &seq {
                    if inst != target_inst {
                        ctx.functions[func].dfg.replace_uses(inst, target_inst);
                    }
                }
            }
        }
    }
    // Only the final instruction's value is visible outside the sequence;
    // an absorbed intermediate another user still needs will materialise on
    // its own.
    if out != VREG_INVALID {
        ctx.functions[func].dfg.vregs[last] = out;
    }

    Ok(())
}
