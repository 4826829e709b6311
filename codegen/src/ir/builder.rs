//! An append-only, users-aware IR builder.
//!
//! All building goes through the [`Context`](crate::Context): operations
//! create instructions in the current function and append them to the
//! current block. A closed block (one whose last instruction is a
//! terminator) rejects normal insertion; that is a programmer error and
//! panics. Force-insert variants bypass the check for the few passes that
//! legitimately append past a terminator.
//!
//! Every operand of a newly built instruction is recorded as used by it, so
//! the users relation is maintained incrementally and
//! [`replace_uses`](crate::Context::replace_uses) can rewrite in place.

use crate::ast::{Node, Type, TypeData};
use crate::ir::{
    Block, Callee, FuncId, Inst, InstData, Linkage, Opcode, PhiArg, StaticData, StaticId,
    StaticInit,
};
use crate::Context;
use smallvec::SmallVec;

impl Context {
    /// Create a function with the given name and function type, make it
    /// current, and give it an entry block with one parameter instruction
    /// per parameter of the type.
    pub fn create_function(&mut self, name: impl Into<String>, ty: Type) -> FuncId {
        let func = self
            .functions
            .push(crate::ir::Function::new(name, ty));
        self.func = func.into();
        let entry = self.create_block();
        self.switch_to_block(entry);

        let param_tys: Vec<Type> = match self.module.type_data(ty) {
            TypeData::Function { params, .. } => params.iter().map(|p| p.ty).collect(),
            _ => Vec::new(),
        };
        for pty in param_tys {
            self.add_parameter_to_function(pty);
        }
        func
    }

    /// Declare an external function: no entry block, no body.
    pub fn declare_function(&mut self, name: impl Into<String>, ty: Type) -> FuncId {
        let mut f = crate::ir::Function::new(name, ty);
        f.attrs.is_extern = true;
        self.functions.push(f)
    }

    /// Create a new block in the current function, appended to its layout.
    pub fn create_block(&mut self) -> Block {
        let f = self.cur_mut();
        let block = f.dfg.make_block();
        f.layout.append_block(block);
        block
    }

    /// Create a detached instruction in the current function without
    /// inserting it. Operand uses are recorded immediately.
    pub fn create_inst(&mut self, data: InstData, ty: Type) -> Inst {
        self.cur_mut().dfg.make_inst(data, ty)
    }

    /// Insert a detached instruction at the end of the current block.
    ///
    /// Panics if the block is closed.
    pub fn insert(&mut self, inst: Inst) -> Inst {
        let block = self.current_block();
        assert!(
            !self.cur().is_closed(block),
            "internal compiler error: insertion into closed block {block}"
        );
        self.cur_mut().layout.append_inst(inst, block);
        inst
    }

    /// Insert a detached instruction at the end of the current block even if
    /// the block is closed.
    pub fn force_insert(&mut self, inst: Inst) -> Inst {
        let block = self.current_block();
        self.cur_mut().layout.append_inst(inst, block);
        inst
    }

    /// Insert a detached instruction before `before`.
    pub fn insert_before(&mut self, inst: Inst, before: Inst) {
        self.cur_mut().layout.insert_inst(inst, before);
    }

    /// Insert a detached instruction after `after`.
    pub fn insert_after(&mut self, inst: Inst, after: Inst) {
        self.cur_mut().layout.insert_inst_after(inst, after);
    }

    fn build(&mut self, data: InstData, ty: Type) -> Inst {
        let inst = self.create_inst(data, ty);
        self.insert(inst)
    }

    /// Materialise an integer constant.
    pub fn immediate(&mut self, ty: Type, value: u64) -> Inst {
        self.build(InstData::Immediate { value }, ty)
    }

    /// Load from `addr`. The result type is the pointee of the address type
    /// when it is known, otherwise the default integer.
    pub fn load(&mut self, addr: Inst) -> Inst {
        let addr_ty = self.cur().dfg.inst_type(addr);
        let ty = match self
            .module
            .type_canonical(addr_ty)
            .map(|t| self.module.type_data(t))
        {
            Some(TypeData::Pointer { to }) | Some(TypeData::Reference { to }) => *to,
            Some(TypeData::Array { of, .. }) => *of,
            _ => self.module.builtins().integer,
        };
        self.build(InstData::Load { addr }, ty)
    }

    /// Store `value` to `addr`. Returns void.
    pub fn store(&mut self, addr: Inst, value: Inst) -> Inst {
        let void = self.module.builtins().void;
        self.build(InstData::Store { addr, value }, void)
    }

    /// Unconditional branch to `dest`. Terminates the current block.
    pub fn branch(&mut self, dest: Block) -> Inst {
        let void = self.module.builtins().void;
        self.build(InstData::Branch { destination: dest }, void)
    }

    /// Append an unconditional branch to `dest` at the end of `block`,
    /// bypassing the closed-block check.
    pub fn branch_into_block(&mut self, dest: Block, block: Block) -> Inst {
        let void = self.module.builtins().void;
        let inst = self.create_inst(InstData::Branch { destination: dest }, void);
        self.cur_mut().layout.append_inst(inst, block);
        inst
    }

    /// Conditional branch. Terminates the current block.
    pub fn branch_conditional(&mut self, cond: Inst, then_block: Block, else_block: Block) -> Inst {
        let void = self.module.builtins().void;
        self.build(
            InstData::BranchCond {
                condition: cond,
                then_block,
                else_block,
            },
            void,
        )
    }

    /// Return, with or without a value. Terminates the current block.
    pub fn return_(&mut self, value: Option<Inst>) -> Inst {
        let void = self.module.builtins().void;
        self.build(InstData::Return { value }, void)
    }

    /// Control never reaches here. Terminates the current block.
    pub fn unreachable(&mut self) -> Inst {
        let void = self.module.builtins().void;
        self.build(InstData::Unreachable, void)
    }

    /// Create an empty phi of the given type, inserted at the current
    /// insertion point.
    pub fn phi(&mut self, ty: Type) -> Inst {
        self.build(
            InstData::Phi {
                args: Vec::new(),
                vreg: 0,
            },
            ty,
        )
    }

    /// Add an argument to a phi.
    pub fn phi_add_argument(&mut self, phi: Inst, arg: PhiArg) {
        self.cur_mut().dfg.phi_add_argument(phi, arg);
    }

    /// Remove the phi argument arriving from `pred`.
    pub fn phi_remove_argument(&mut self, phi: Inst, pred: Block) {
        self.cur_mut().dfg.phi_remove_argument(phi, pred);
    }

    /// Create a direct call to `callee`. Arguments are appended separately
    /// with [`Context::add_call_argument`]; the call is not inserted until
    /// an explicit [`Context::insert`].
    pub fn direct_call(&mut self, callee: FuncId) -> Inst {
        let ret = self.function_return_type(callee);
        self.create_inst(
            InstData::Call {
                callee: Callee::Direct(callee),
                args: Vec::new(),
                is_tail: false,
            },
            ret,
        )
    }

    /// Create an indirect call through `callee`. Not inserted until an
    /// explicit [`Context::insert`].
    pub fn indirect_call(&mut self, callee: Inst) -> Inst {
        let callee_ty = self.cur().dfg.inst_type(callee);
        let ret = match self
            .module
            .type_canonical(callee_ty)
            .map(|t| self.module.type_data(t))
        {
            Some(TypeData::Function { ret, .. }) => *ret,
            Some(TypeData::Pointer { to }) => match self.module.type_data(*to) {
                TypeData::Function { ret, .. } => *ret,
                _ => self.module.builtins().void,
            },
            _ => self.module.builtins().void,
        };
        self.create_inst(
            InstData::Call {
                callee: Callee::Indirect(callee),
                args: Vec::new(),
                is_tail: false,
            },
            ret,
        )
    }

    /// Append an argument to a call.
    pub fn add_call_argument(&mut self, call: Inst, arg: Inst) {
        let dfg = &mut self.cur_mut().dfg;
        match &mut dfg.insts[call] {
            InstData::Call { args, .. } => args.push(arg),
            other => panic!("add_call_argument on non-call {other:?}"),
        }
        dfg.add_user(arg, call);
    }

    fn function_return_type(&self, func: FuncId) -> Type {
        let fty = self.functions[func].ty;
        match self.module.type_data(fty) {
            TypeData::Function { ret, .. } => *ret,
            _ => self.module.builtins().void,
        }
    }

    /// Build a binary operation. Comparisons produce the default integer
    /// type; arithmetic keeps the left operand's type.
    pub fn binary(&mut self, opcode: Opcode, lhs: Inst, rhs: Inst) -> Inst {
        debug_assert!(opcode.is_binary(), "not a binary opcode: {opcode}");
        let ty = if opcode.is_comparison() {
            self.module.builtins().integer
        } else {
            self.cur().dfg.inst_type(lhs)
        };
        self.build(InstData::Binary { opcode, lhs, rhs }, ty)
    }

    /// Bitwise not.
    pub fn not(&mut self, operand: Inst) -> Inst {
        let ty = self.cur().dfg.inst_type(operand);
        self.build(
            InstData::Unary {
                opcode: Opcode::Not,
                operand,
            },
            ty,
        )
    }

    /// Copy a value.
    pub fn copy(&mut self, operand: Inst) -> Inst {
        let ty = self.cur().dfg.inst_type(operand);
        self.build(
            InstData::Unary {
                opcode: Opcode::Copy,
                operand,
            },
            ty,
        )
    }

    /// Reference a static variable. The value is the variable's address.
    pub fn static_reference(&mut self, var: StaticId) -> Inst {
        let ty = self.statics[var].ty;
        let ptr = self.module.pointer_to(ty);
        let inst = self.build(InstData::StaticRef { var }, ptr);
        let func = self.current_func();
        self.statics[var].references.push((func, inst));
        inst
    }

    /// Create a variable with static storage duration and return a
    /// reference to it.
    pub fn create_static(
        &mut self,
        decl: Option<Node>,
        ty: Type,
        name: impl Into<String>,
    ) -> Inst {
        let var = self.statics.push(StaticData {
            name: name.into(),
            ty,
            decl: decl.into(),
            references: Vec::new(),
            init: None,
            linkage: Linkage::Local,
            referenced: false,
        });
        self.static_reference(var)
    }

    /// Set the initialiser of a static variable.
    pub fn set_static_init(&mut self, var: StaticId, init: StaticInit) {
        self.statics[var].init = Some(init);
    }

    /// Reference a function as a value.
    pub fn func_reference(&mut self, func: FuncId) -> Inst {
        let ty = self.functions[func].ty;
        self.build(InstData::FuncRef { func }, ty)
    }

    /// Allocate stack space for a value of type `ty` and return its
    /// address.
    pub fn stack_allocate(&mut self, ty: Type) -> Inst {
        let size = self.module.type_sizeof(ty);
        let ptr = self.module.pointer_to(ty);
        self.build(InstData::Alloca { size, offset: 0 }, ptr)
    }

    /// Retrieve the pre-created i-th parameter of the current function.
    pub fn parameter(&self, index: usize) -> Inst {
        self.cur().params[index]
    }

    /// Grow the current function's parameter list with a parameter of type
    /// `ty`. The parameter instruction is appended to the entry block.
    pub fn add_parameter_to_function(&mut self, ty: Type) -> Inst {
        let f = self.cur_mut();
        let index = f.params.len() as u32;
        let inst = f.dfg.make_inst(InstData::Parameter { index }, ty);
        f.params.push(inst);
        let entry = f.layout.entry_block().expect("function has no entry block");
        f.layout.append_inst(inst, entry);
        inst
    }

    /// Replace every use of `old` with `new` in the current function.
    pub fn replace_uses(&mut self, old: Inst, new: Inst) {
        self.cur_mut().dfg.replace_uses(old, new);
    }

    /// Remove an instruction from its block.
    ///
    /// Panics if the instruction still has users; that is a programmer
    /// error.
    pub fn remove(&mut self, inst: Inst) {
        let f = self.cur_mut();
        assert!(
            f.dfg.users(inst).is_empty(),
            "internal compiler error: removing {inst} which still has users"
        );
        f.dfg.unmark_usees(inst);
        if f.layout.inst_block(inst).is_some() {
            f.layout.remove_inst(inst);
        }
    }

    /// Remove an entire block, freeing each instruction unconditionally and
    /// dropping the matching phi arguments in successor blocks.
    pub fn remove_and_free_block(&mut self, block: Block) {
        // Phi arguments arriving from this block are no longer reachable.
        let successors: SmallVec<[Block; 2]> = match self.cur().layout.last_inst(block) {
            Some(term) => self.cur().dfg.insts[term].branch_destinations(),
            None => SmallVec::new(),
        };
        for succ in successors {
            let phis: Vec<Inst> = self
                .cur()
                .layout
                .block_insts(succ)
                .filter(|&i| self.cur().dfg.opcode(i) == Opcode::Phi)
                .collect();
            for phi in phis {
                self.phi_remove_argument(phi, block);
            }
        }

        let insts: Vec<Inst> = self.cur().layout.block_insts(block).collect();
        let f = self.cur_mut();
        for inst in insts {
            f.dfg.unmark_usees(inst);
            f.layout.remove_inst(inst);
        }
        f.layout.remove_block(block);
    }

    /// Replace the terminator of `block` with `unreachable` and drop the
    /// block from successor phis.
    pub fn mark_unreachable(&mut self, block: Block) {
        let term = self.cur().layout.last_inst(block);
        if let Some(term) = term {
            if self.cur().dfg.insts[term].is_terminator() {
                let successors = self.cur().dfg.insts[term].branch_destinations();
                for succ in successors {
                    let phis: Vec<Inst> = self
                        .cur()
                        .layout
                        .block_insts(succ)
                        .filter(|&i| self.cur().dfg.opcode(i) == Opcode::Phi)
                        .collect();
                    for phi in phis {
                        self.phi_remove_argument(phi, block);
                    }
                }
                let f = self.cur_mut();
                f.dfg.unmark_usees(term);
                f.layout.remove_inst(term);
            }
        }
        let void = self.module.builtins().void;
        let inst = self.create_inst(InstData::Unreachable, void);
        self.cur_mut().layout.append_inst(inst, block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::Module;

    fn ctx_with_func() -> Context {
        let mut module = Module::new("test", "");
        let b = module.builtins();
        let fty = module.function_type(b.integer, vec![]);
        let mut ctx = Context::new(module);
        ctx.create_function("f", fty);
        ctx
    }

    #[test]
    fn users_are_maintained() {
        let mut ctx = ctx_with_func();
        let b = ctx.module.builtins();
        let one = ctx.immediate(b.integer, 1);
        let two = ctx.immediate(b.integer, 2);
        let sum = ctx.binary(Opcode::Add, one, two);

        assert_eq!(ctx.cur().dfg.users(one), &[sum]);
        assert_eq!(ctx.cur().dfg.users(two), &[sum]);
        assert!(ctx.cur().dfg.users(sum).is_empty());
    }

    #[test]
    fn replace_uses_moves_users() {
        let mut ctx = ctx_with_func();
        let b = ctx.module.builtins();
        let one = ctx.immediate(b.integer, 1);
        let two = ctx.immediate(b.integer, 2);
        let three = ctx.immediate(b.integer, 3);
        let sum = ctx.binary(Opcode::Add, one, two);

        ctx.replace_uses(one, three);
        assert!(ctx.cur().dfg.users(one).is_empty());
        assert_eq!(ctx.cur().dfg.users(three), &[sum]);
        match &ctx.cur().dfg.insts[sum] {
            InstData::Binary { lhs, .. } => assert_eq!(*lhs, three),
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn terminator_closes_block() {
        let mut ctx = ctx_with_func();
        let b = ctx.module.builtins();
        let v = ctx.immediate(b.integer, 42);
        ctx.return_(Some(v));
        assert!(ctx.cur().is_closed(ctx.current_block()));
    }

    #[test]
    #[should_panic(expected = "closed block")]
    fn closed_block_rejects_insertion() {
        let mut ctx = ctx_with_func();
        let b = ctx.module.builtins();
        let v = ctx.immediate(b.integer, 42);
        ctx.return_(Some(v));
        ctx.immediate(b.integer, 1);
    }

    #[test]
    #[should_panic(expected = "still has users")]
    fn remove_with_users_is_fatal() {
        let mut ctx = ctx_with_func();
        let b = ctx.module.builtins();
        let one = ctx.immediate(b.integer, 1);
        let two = ctx.immediate(b.integer, 2);
        let _sum = ctx.binary(Opcode::Add, one, two);
        ctx.remove(one);
    }

    #[test]
    fn phi_arity_follows_edges() {
        let mut ctx = ctx_with_func();
        let b = ctx.module.builtins();
        let entry = ctx.current_block();
        let then_block = ctx.create_block();
        let else_block = ctx.create_block();
        let join = ctx.create_block();

        let cond = ctx.immediate(b.integer, 1);
        ctx.branch_conditional(cond, then_block, else_block);

        ctx.switch_to_block(then_block);
        let a = ctx.immediate(b.integer, 1);
        ctx.branch(join);

        ctx.switch_to_block(else_block);
        let c = ctx.immediate(b.integer, 2);
        ctx.branch(join);

        ctx.switch_to_block(join);
        let phi = ctx.phi(b.integer);
        ctx.phi_add_argument(phi, PhiArg { block: then_block, value: a });
        ctx.phi_add_argument(phi, PhiArg { block: else_block, value: c });

        let preds = ctx.cur().predecessors(join);
        assert_eq!(preds.len(), 2);
        assert!(preds.contains(&then_block) && preds.contains(&else_block));
        let _ = entry;

        ctx.phi_remove_argument(phi, else_block);
        match &ctx.cur().dfg.insts[phi] {
            InstData::Phi { args, .. } => assert_eq!(args.len(), 1),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(ctx.cur().dfg.users(c).is_empty());
    }
}
