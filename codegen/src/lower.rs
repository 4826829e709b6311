//! Lowering the AST into IR.
//!
//! The walk trusts the front end: types were checked during semantic
//! analysis, so lowering only asks structural questions. Variables live in
//! stack slots (or statics at the top level) and are read through loads, so
//! the IR stays in SSA without needing a mem-to-reg pass for correctness.

use crate::ast::{BinaryOp, Node, NodeKind, SymbolId, Type, TypeData, UnaryOp};
use crate::ir::{FuncId, Inst, InstData, Linkage, Opcode, PhiArg, StaticId, StaticInit};
use crate::{CodegenError, CodegenResult, Context};
use rustc_hash::FxHashMap;

/// Where a variable lives.
#[derive(Copy, Clone, Debug)]
enum Storage {
    /// A stack slot; the instruction is the slot's address.
    Local(Inst),
    /// A variable with static storage duration.
    Static(StaticId),
}

struct Lower<'a> {
    ctx: &'a mut Context,
    funcs: FxHashMap<SymbolId, FuncId>,
    vars: FxHashMap<SymbolId, Storage>,
    string_counter: usize,
}

/// Lower every function of the context's module into IR.
pub fn lower_module_to_ir(ctx: &mut Context) -> CodegenResult<()> {
    let root = ctx.module.root;
    let top: Vec<Node> = match &ctx.module.node(root).kind {
        NodeKind::Root { children } => children.clone(),
        _ => Vec::new(),
    };

    let mut lower = Lower {
        ctx,
        funcs: FxHashMap::default(),
        vars: FxHashMap::default(),
        string_counter: 0,
    };

    // Declare every function first so calls resolve regardless of order.
    for &node in &top {
        lower.declare_function(node)?;
    }

    // Top-level declarations become statics.
    for &node in &top {
        lower.lower_top_level(node)?;
    }

    // Then build the bodies.
    for &node in &top {
        lower.define_function(node)?;
    }

    Ok(())
}

impl<'a> Lower<'a> {
    fn declare_function(&mut self, node: Node) -> CodegenResult<()> {
        let (name_id, ty, attrs, has_body) = match &self.ctx.module.node(node).kind {
            NodeKind::Function {
                name, ty, body, attrs,
            } => (*name, *ty, *attrs, body.is_some()),
            _ => return Ok(()),
        };
        let name = self.ctx.module.str(name_id).to_string();

        let func = if has_body && !attrs.is_extern {
            let mut f = crate::ir::Function::new(name, ty);
            f.attrs = attrs;
            self.ctx.functions.push(f)
        } else {
            let f = self.ctx.declare_function(name, ty);
            self.ctx.functions[f].attrs.is_extern = true;
            f
        };

        if let Some(sym) = self.func_symbol(node, name_id) {
            self.funcs.insert(sym, func);
        }
        Ok(())
    }

    /// The symbol a function node is bound to, looked up in the global
    /// scope.
    fn func_symbol(&self, _node: Node, name: crate::ast::StrId) -> Option<SymbolId> {
        let global = self.ctx.module.global_scope();
        self.ctx.module.lookup_in(global, name, true)
    }

    fn lower_top_level(&mut self, node: Node) -> CodegenResult<()> {
        let (name_id, ty, init, is_static) = match &self.ctx.module.node(node).kind {
            NodeKind::Declaration {
                name,
                ty,
                init,
                is_static,
            } => (*name, *ty, *init, *is_static),
            _ => return Ok(()),
        };
        if !is_static {
            return Ok(());
        }
        let name = self.ctx.module.str(name_id).to_string();

        let var = self.ctx.statics.push(crate::ir::StaticData {
            name,
            ty,
            decl: Some(node).into(),
            references: Vec::new(),
            init: None,
            linkage: Linkage::Local,
            referenced: false,
        });

        if let Some(init) = init {
            match &self.ctx.module.node(init).kind {
                NodeKind::IntLit(v) => self.ctx.statics[var].init = Some(StaticInit::Integer(*v)),
                NodeKind::StringLit(s) => {
                    self.ctx.statics[var].init = Some(StaticInit::String(*s))
                }
                other => {
                    return Err(CodegenError::Unimplemented(format!(
                        "non-literal static initialiser {other:?}"
                    )))
                }
            }
        }

        let global = self.ctx.module.global_scope();
        if let Some(sym) = self.ctx.module.lookup_in(global, name_id, true) {
            self.vars.insert(sym, Storage::Static(var));
        }
        Ok(())
    }

    fn define_function(&mut self, node: Node) -> CodegenResult<()> {
        let (name_id, body) = match &self.ctx.module.node(node).kind {
            NodeKind::Function {
                name,
                body: Some(body),
                attrs,
                ..
            } if !attrs.is_extern => (*name, *body),
            _ => return Ok(()),
        };

        let func = match self.func_symbol(node, name_id).and_then(|s| self.funcs.get(&s)) {
            Some(&f) => f,
            None => return Ok(()),
        };

        // Give the function an entry block and its parameter instructions.
        self.ctx.func = func.into();
        let entry = self.ctx.create_block();
        self.ctx.switch_to_block(entry);
        let fty = self.ctx.functions[func].ty;
        let params: Vec<crate::ast::Parameter> = match self.ctx.module.type_data(fty) {
            TypeData::Function { params, .. } => params.clone(),
            _ => Vec::new(),
        };
        for p in &params {
            self.ctx.add_parameter_to_function(p.ty);
        }

        // Parameters are observable variables: spill each into a slot so
        // address-of and assignment work on them.
        for (i, p) in params.iter().enumerate() {
            let value = self.ctx.parameter(i);
            let slot = self.ctx.stack_allocate(p.ty);
            self.ctx.store(slot, value);
            if let Some(sym) = self.ctx.module.lookup_in(self.ctx.module.global_scope(), p.name, false)
            {
                self.vars.insert(sym, Storage::Local(slot));
            }
        }

        let value = self.lower_expr(body)?;

        // An open exit block returns the body's value.
        let block = self.ctx.current_block();
        if !self.ctx.cur().is_closed(block) {
            let ret = self.ctx.functions[func].ty;
            let returns_value = match self.ctx.module.type_data(ret) {
                TypeData::Function { ret, .. } => !self.ctx.module.type_is_void(*ret),
                _ => false,
            };
            self.ctx.return_(if returns_value { value } else { None });
        }
        Ok(())
    }

    fn lower_lvalue(&mut self, node: Node) -> CodegenResult<Inst> {
        match self.ctx.module.node(node).kind.clone() {
            NodeKind::VarRef(sym) => self.storage_addr(sym),
            NodeKind::Declaration { .. } => self.lower_declaration(node),
            NodeKind::Unary {
                op: UnaryOp::Deref,
                operand,
            } => self
                .lower_expr(operand)?
                .ok_or_else(|| CodegenError::Unimplemented("dereference of void".into())),
            NodeKind::MemberAccess { object, member } => self.member_address(object, member),
            NodeKind::Binary {
                op: BinaryOp::Subscript,
                lhs,
                rhs,
            } => self.subscript_address(lhs, rhs),
            other => Err(CodegenError::Unimplemented(format!(
                "address of non-lvalue {other:?}"
            ))),
        }
    }

    fn storage_addr(&mut self, sym: SymbolId) -> CodegenResult<Inst> {
        match self.vars.get(&sym) {
            Some(Storage::Local(addr)) => Ok(*addr),
            Some(Storage::Static(var)) => {
                let var = *var;
                Ok(self.ctx.static_reference(var))
            }
            None => Err(CodegenError::Unimplemented(format!(
                "reference to unlowered variable {sym}"
            ))),
        }
    }

    fn member_address(&mut self, object: Node, member: crate::ast::StrId) -> CodegenResult<Inst> {
        let base = self.lower_lvalue(object)?;
        let base_ty = self.ctx.cur().dfg.inst_type(base);
        let pointee = match self
            .ctx
            .module
            .type_canonical(base_ty)
            .map(|t| self.ctx.module.type_data(t))
        {
            Some(TypeData::Pointer { to }) | Some(TypeData::Reference { to }) => Some(*to),
            Some(TypeData::Array { of, .. }) => Some(*of),
            _ => None,
        };
        let offset = pointee
            .and_then(|ty| self.ctx.module.type_canonical(ty))
            .and_then(|ty| match self.ctx.module.type_data(ty) {
                TypeData::Struct { members, .. } => members
                    .iter()
                    .find(|m| m.name == member)
                    .map(|m| m.offset),
                _ => None,
            })
            .ok_or_else(|| {
                CodegenError::Unimplemented("member access on a non-struct value".into())
            })?;
        if offset == 0 {
            return Ok(base);
        }
        let b = self.ctx.module.builtins();
        let off = self.ctx.immediate(b.integer, offset);
        Ok(self.ctx.binary(Opcode::Add, base, off))
    }

    fn subscript_address(&mut self, base: Node, index: Node) -> CodegenResult<Inst> {
        let addr = self.lower_lvalue(base)?;
        let addr_ty = self.ctx.cur().dfg.inst_type(addr);
        let pointee = match self
            .ctx
            .module
            .type_canonical(addr_ty)
            .map(|t| self.ctx.module.type_data(t))
        {
            Some(TypeData::Pointer { to }) | Some(TypeData::Reference { to }) => Some(*to),
            Some(TypeData::Array { of, .. }) => Some(*of),
            _ => None,
        };
        // Subscripting an array variable steps over its elements; anything
        // else steps over the pointee.
        let elem = pointee
            .map(|t| match self.ctx.module.type_canonical(t).map(|c| self.ctx.module.type_data(c)) {
                Some(TypeData::Array { of, .. }) => *of,
                _ => t,
            })
            .ok_or_else(|| CodegenError::Unimplemented("subscript of scalar value".into()))?;
        let size = self.ctx.module.type_sizeof(elem).max(1);

        let idx = self
            .lower_expr(index)?
            .ok_or_else(|| CodegenError::Unimplemented("void subscript index".into()))?;
        let b = self.ctx.module.builtins();
        let scale = self.ctx.immediate(b.integer, size);
        let scaled = self.ctx.binary(Opcode::Mul, idx, scale);
        Ok(self.ctx.binary(Opcode::Add, addr, scaled))
    }

    fn lower_declaration(&mut self, node: Node) -> CodegenResult<Inst> {
        let (name_id, ty, init) = match self.ctx.module.node(node).kind.clone() {
            NodeKind::Declaration { name, ty, init, .. } => (name, ty, init),
            other => panic!("not a declaration: {other:?}"),
        };
        let slot = self.ctx.stack_allocate(ty);
        if let Some(sym) = self.ctx.module.lookup(name_id) {
            self.vars.insert(sym, Storage::Local(slot));
        }
        if let Some(init) = init {
            match self.ctx.module.node(init).kind.clone() {
                NodeKind::CompoundLit { elems } => {
                    self.lower_compound_init(slot, ty, &elems)?;
                }
                _ => {
                    if let Some(v) = self.lower_expr(init)? {
                        self.ctx.store(slot, v);
                    }
                }
            }
        }
        Ok(slot)
    }

    fn lower_compound_init(
        &mut self,
        slot: Inst,
        ty: Type,
        elems: &[Node],
    ) -> CodegenResult<()> {
        let members: Vec<crate::ast::Member> = match self
            .ctx
            .module
            .type_canonical(ty)
            .map(|t| self.ctx.module.type_data(t).clone())
        {
            Some(TypeData::Struct { members, .. }) => members,
            _ => {
                return Err(CodegenError::Unimplemented(
                    "compound literal for a non-struct type".into(),
                ))
            }
        };
        let b = self.ctx.module.builtins();
        for (member, &elem) in members.iter().zip(elems.iter()) {
            let value = self
                .lower_expr(elem)?
                .ok_or_else(|| CodegenError::Unimplemented("void compound member".into()))?;
            let addr = if member.offset == 0 {
                slot
            } else {
                let off = self.ctx.immediate(b.integer, member.offset);
                self.ctx.binary(Opcode::Add, slot, off)
            };
            self.ctx.store(addr, value);
        }
        Ok(())
    }

    /// Lower an expression for its value. `None` means void.
    fn lower_expr(&mut self, node: Node) -> CodegenResult<Option<Inst>> {
        let kind = self.ctx.module.node(node).kind.clone();
        match kind {
            NodeKind::Root { .. } => Ok(None),
            NodeKind::StructDecl(_) | NodeKind::ModuleRef(_) => Ok(None),

            NodeKind::Block { children } => {
                let mut last = None;
                for child in children {
                    if self.ctx.cur().is_closed(self.ctx.current_block()) {
                        break;
                    }
                    last = self.lower_expr(child)?;
                }
                Ok(last)
            }

            NodeKind::IntLit(v) => {
                let lit = self.ctx.module.builtins().integer_literal;
                Ok(Some(self.ctx.immediate(lit, v)))
            }

            NodeKind::StringLit(s) => {
                let text_len = self.ctx.module.str(s).len() as u64;
                let b = self.ctx.module.builtins();
                let ty = self.ctx.module.make_type(TypeData::Array {
                    of: b.byte,
                    len: text_len + 1,
                });
                let name = format!(".str.{}", self.string_counter);
                self.string_counter += 1;
                let sref = self.ctx.create_static(Some(node), ty, name);
                let var = match self.ctx.cur().dfg.insts[sref] {
                    InstData::StaticRef { var } => var,
                    _ => unreachable!(),
                };
                self.ctx.set_static_init(var, StaticInit::String(s));
                Ok(Some(sref))
            }

            NodeKind::CompoundLit { .. } => Err(CodegenError::Unimplemented(
                "compound literal outside a declaration initialiser".into(),
            )),

            NodeKind::Declaration { .. } => {
                let addr = self.lower_declaration(node)?;
                Ok(Some(addr))
            }

            NodeKind::VarRef(_) | NodeKind::MemberAccess { .. } => {
                let addr = self.lower_lvalue(node)?;
                Ok(Some(self.ctx.load(addr)))
            }

            NodeKind::FuncRef(sym) => {
                let func = *self.funcs.get(&sym).ok_or_else(|| {
                    CodegenError::Unimplemented(format!("reference to unlowered function {sym}"))
                })?;
                Ok(Some(self.ctx.func_reference(func)))
            }

            NodeKind::Cast { ty, operand } => {
                let v = self.lower_expr(operand)?;
                match v {
                    Some(v) => {
                        let copy = self.ctx.copy(v);
                        self.ctx.cur_mut().dfg.set_inst_type(copy, ty);
                        Ok(Some(copy))
                    }
                    None => Ok(None),
                }
            }

            NodeKind::Unary { op, operand } => match op {
                UnaryOp::Deref => {
                    let v = self.lower_expr(operand)?.ok_or_else(|| {
                        CodegenError::Unimplemented("dereference of void".into())
                    })?;
                    Ok(Some(self.ctx.load(v)))
                }
                UnaryOp::AddressOf => Ok(Some(self.lower_lvalue(operand)?)),
                UnaryOp::Not => {
                    let v = self.lower_expr(operand)?.ok_or_else(|| {
                        CodegenError::Unimplemented("logical not of void".into())
                    })?;
                    let b = self.ctx.module.builtins();
                    let zero = self.ctx.immediate(b.integer, 0);
                    Ok(Some(self.ctx.binary(Opcode::Eq, v, zero)))
                }
                UnaryOp::Neg => {
                    let v = self.lower_expr(operand)?.ok_or_else(|| {
                        CodegenError::Unimplemented("negation of void".into())
                    })?;
                    let ty = self.ctx.cur().dfg.inst_type(v);
                    let zero = self.ctx.immediate(ty, 0);
                    Ok(Some(self.ctx.binary(Opcode::Sub, zero, v)))
                }
            },

            NodeKind::Binary { op, lhs, rhs } => match op {
                BinaryOp::Assign => {
                    let addr = self.lower_lvalue(lhs)?;
                    let v = self
                        .lower_expr(rhs)?
                        .ok_or_else(|| CodegenError::Unimplemented("assignment of void".into()))?;
                    self.ctx.store(addr, v);
                    Ok(Some(v))
                }
                BinaryOp::Subscript => {
                    let addr = self.subscript_address(lhs, rhs)?;
                    Ok(Some(self.ctx.load(addr)))
                }
                _ => {
                    let l = self
                        .lower_expr(lhs)?
                        .ok_or_else(|| CodegenError::Unimplemented("void operand".into()))?;
                    let r = self
                        .lower_expr(rhs)?
                        .ok_or_else(|| CodegenError::Unimplemented("void operand".into()))?;
                    let opcode = binary_opcode(op);
                    Ok(Some(self.ctx.binary(opcode, l, r)))
                }
            },

            NodeKind::Call { callee, args } => {
                let call = match self.ctx.module.node(callee).kind.clone() {
                    NodeKind::FuncRef(sym) => {
                        let func = *self.funcs.get(&sym).ok_or_else(|| {
                            CodegenError::Unimplemented(format!(
                                "call to unlowered function {sym}"
                            ))
                        })?;
                        self.ctx.direct_call(func)
                    }
                    _ => {
                        let v = self.lower_expr(callee)?.ok_or_else(|| {
                            CodegenError::Unimplemented("call through void value".into())
                        })?;
                        self.ctx.indirect_call(v)
                    }
                };
                for arg in args {
                    let v = self
                        .lower_expr(arg)?
                        .ok_or_else(|| CodegenError::Unimplemented("void argument".into()))?;
                    self.ctx.add_call_argument(call, v);
                }
                self.ctx.insert(call);
                let void = {
                    let ty = self.ctx.cur().dfg.inst_type(call);
                    self.ctx.module.type_is_void(ty)
                };
                Ok(if void { None } else { Some(call) })
            }

            NodeKind::Return { value } => {
                let v = match value {
                    Some(v) => self.lower_expr(v)?,
                    None => None,
                };
                self.ctx.return_(v);
                Ok(None)
            }

            NodeKind::If {
                cond,
                then,
                otherwise,
            } => self.lower_if(cond, then, otherwise),

            NodeKind::While { cond, body } => {
                let header = self.ctx.create_block();
                let body_block = self.ctx.create_block();
                let exit = self.ctx.create_block();

                self.ctx.branch(header);
                self.ctx.switch_to_block(header);
                let c = self
                    .lower_expr(cond)?
                    .ok_or_else(|| CodegenError::Unimplemented("void loop condition".into()))?;
                self.ctx.branch_conditional(c, body_block, exit);

                self.ctx.switch_to_block(body_block);
                self.lower_expr(body)?;
                if !self.ctx.cur().is_closed(self.ctx.current_block()) {
                    self.ctx.branch(header);
                }

                self.ctx.switch_to_block(exit);
                Ok(None)
            }

            NodeKind::For {
                init,
                cond,
                step,
                body,
            } => {
                self.lower_expr(init)?;
                let header = self.ctx.create_block();
                let body_block = self.ctx.create_block();
                let exit = self.ctx.create_block();

                self.ctx.branch(header);
                self.ctx.switch_to_block(header);
                let c = self
                    .lower_expr(cond)?
                    .ok_or_else(|| CodegenError::Unimplemented("void loop condition".into()))?;
                self.ctx.branch_conditional(c, body_block, exit);

                self.ctx.switch_to_block(body_block);
                self.lower_expr(body)?;
                if !self.ctx.cur().is_closed(self.ctx.current_block()) {
                    self.lower_expr(step)?;
                    self.ctx.branch(header);
                }

                self.ctx.switch_to_block(exit);
                Ok(None)
            }

            NodeKind::Function { .. } => Ok(None),
        }
    }

    fn lower_if(
        &mut self,
        cond: Node,
        then: Node,
        otherwise: Option<Node>,
    ) -> CodegenResult<Option<Inst>> {
        let c = self
            .lower_expr(cond)?
            .ok_or_else(|| CodegenError::Unimplemented("void condition".into()))?;

        let then_block = self.ctx.create_block();
        let else_block = self.ctx.create_block();
        let join = self.ctx.create_block();
        self.ctx.branch_conditional(c, then_block, else_block);

        self.ctx.switch_to_block(then_block);
        let then_value = self.lower_expr(then)?;
        let then_open = !self.ctx.cur().is_closed(self.ctx.current_block());
        // Copies give the phi a private value per edge, so the join can
        // collapse onto one register during lowering.
        let then_copy = match (then_open, then_value) {
            (true, Some(v)) => Some((self.ctx.current_block(), self.ctx.copy(v))),
            _ => None,
        };
        if then_open {
            self.ctx.branch(join);
        }

        self.ctx.switch_to_block(else_block);
        let else_value = match otherwise {
            Some(node) => self.lower_expr(node)?,
            None => None,
        };
        let else_open = !self.ctx.cur().is_closed(self.ctx.current_block());
        let else_copy = match (else_open, else_value) {
            (true, Some(v)) => Some((self.ctx.current_block(), self.ctx.copy(v))),
            _ => None,
        };
        if else_open {
            self.ctx.branch(join);
        }

        self.ctx.switch_to_block(join);
        match (then_copy, else_copy) {
            (Some((tb, tv)), Some((eb, ev))) => {
                let ty = self.ctx.cur().dfg.inst_type(tv);
                let phi = self.ctx.phi(ty);
                self.ctx.phi_add_argument(phi, PhiArg { block: tb, value: tv });
                self.ctx.phi_add_argument(phi, PhiArg { block: eb, value: ev });
                Ok(Some(phi))
            }
            _ => Ok(None),
        }
    }
}

fn binary_opcode(op: BinaryOp) -> Opcode {
    match op {
        BinaryOp::Add => Opcode::Add,
        BinaryOp::Sub => Opcode::Sub,
        BinaryOp::Mul => Opcode::Mul,
        BinaryOp::Div => Opcode::Div,
        BinaryOp::Mod => Opcode::Mod,
        BinaryOp::Shl => Opcode::Shl,
        BinaryOp::Sar => Opcode::Sar,
        BinaryOp::Shr => Opcode::Shr,
        BinaryOp::And => Opcode::And,
        BinaryOp::Or => Opcode::Or,
        BinaryOp::Lt => Opcode::Lt,
        BinaryOp::Le => Opcode::Le,
        BinaryOp::Gt => Opcode::Gt,
        BinaryOp::Ge => Opcode::Ge,
        BinaryOp::Eq => Opcode::Eq,
        BinaryOp::Ne => Opcode::Ne,
        BinaryOp::Assign | BinaryOp::Subscript => {
            unreachable!("assignment and subscript are lowered structurally")
        }
    }
}
