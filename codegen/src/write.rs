//! Converting IR to text.
//!
//! The `write` module provides the textual form of the IR: `defun` blocks
//! with `bb<n>:` labels and one instruction per line. `gantry-reader` parses
//! this same form back, and printing a freshly parsed module reproduces the
//! input byte for byte.

use crate::ast::Module;
use crate::entity::SecondaryMap;
use crate::ir::{Block, Callee, FuncId, Function, Inst, InstData, StaticData, StaticId, StaticInit};
use crate::Context;
use core::fmt::{self, Write};

/// Resolves the symbols an instruction can reference. The context knows the
/// real names; a bare function falls back to entity numbers.
pub trait NameResolver {
    /// The name of a function.
    fn func_name(&self, func: FuncId) -> String;
    /// The name of a static variable.
    fn static_name(&self, var: StaticId) -> String;
}

struct EntityNames;

impl NameResolver for EntityNames {
    fn func_name(&self, func: FuncId) -> String {
        func.to_string()
    }

    fn static_name(&self, var: StaticId) -> String {
        var.to_string()
    }
}

impl NameResolver for Context {
    fn func_name(&self, func: FuncId) -> String {
        self.functions[func].name.clone()
    }

    fn static_name(&self, var: StaticId) -> String {
        self.statics[var].name.clone()
    }
}

/// Write `func` to `w` in the textual IR format, resolving referenced
/// symbols through `names`.
pub fn write_function(
    w: &mut dyn fmt::Write,
    func: &Function,
    module: &Module,
    names: &dyn NameResolver,
) -> fmt::Result {
    if func.is_declaration() {
        return writeln!(w, "declare {}", func.name);
    }

    // Local numbering: values in layout order, blocks in layout order. The
    // renumbering pass would assign the same ids, but printing must not
    // mutate the function.
    let mut value_ids: SecondaryMap<Inst, u32> = SecondaryMap::with_default(u32::MAX);
    let mut block_ids: SecondaryMap<Block, u32> = SecondaryMap::with_default(u32::MAX);
    let mut next_value = 0u32;
    for (i, block) in func.layout.blocks().enumerate() {
        block_ids[block] = i as u32;
        for inst in func.layout.block_insts(block) {
            if produces_value(func, module, inst) {
                value_ids[inst] = next_value;
                next_value += 1;
            }
        }
    }

    writeln!(w, "defun {} {{", func.name)?;
    for block in func.layout.blocks() {
        writeln!(w, "bb{}:", block_ids[block])?;
        for inst in func.layout.block_insts(block) {
            write!(w, "    ")?;
            if produces_value(func, module, inst) {
                write!(w, "%{} = ", value_ids[inst])?;
            }
            write_instruction(w, func, module, names, inst, &value_ids, &block_ids)?;
            writeln!(w)?;
        }
    }
    writeln!(w, "}}")
}

fn produces_value(func: &Function, module: &Module, inst: Inst) -> bool {
    func.dfg.insts[inst].is_value() && !module.type_is_void(func.dfg.inst_type(inst))
}

fn val(ids: &SecondaryMap<Inst, u32>, inst: Inst) -> String {
    format!("%{}", ids[inst])
}

fn write_instruction(
    w: &mut dyn fmt::Write,
    func: &Function,
    module: &Module,
    names: &dyn NameResolver,
    inst: Inst,
    values: &SecondaryMap<Inst, u32>,
    blocks: &SecondaryMap<Block, u32>,
) -> fmt::Result {
    let data = &func.dfg.insts[inst];
    match data {
        InstData::Immediate { value } => write!(w, "imm {}", *value as i64),
        InstData::Call {
            callee,
            args,
            is_tail,
        } => {
            write!(w, "{}", if *is_tail { "call.tail " } else { "call " })?;
            match callee {
                Callee::Direct(f) => write!(w, "{}", names.func_name(*f))?,
                Callee::Indirect(c) => write!(w, "{}", val(values, *c))?,
            }
            write!(w, "(")?;
            for (i, arg) in args.iter().enumerate() {
                if i > 0 {
                    write!(w, ", ")?;
                }
                write!(w, "{}", val(values, *arg))?;
            }
            write!(w, ")")
        }
        InstData::Load { addr } => write!(w, "load {}", val(values, *addr)),
        InstData::Store { addr, value } => {
            write!(w, "store {}, {}", val(values, *value), val(values, *addr))
        }
        InstData::Return { value: Some(v) } => write!(w, "ret {}", val(values, *v)),
        InstData::Return { value: None } => write!(w, "ret"),
        InstData::Branch { destination } => write!(w, "br bb{}", blocks[*destination]),
        InstData::BranchCond {
            condition,
            then_block,
            else_block,
        } => write!(
            w,
            "br.cond {}, bb{}, bb{}",
            val(values, *condition),
            blocks[*then_block],
            blocks[*else_block]
        ),
        InstData::Phi { args, .. } => {
            write!(w, "phi")?;
            for (i, arg) in args.iter().enumerate() {
                write!(
                    w,
                    "{}[bb{}, {}]",
                    if i == 0 { " " } else { ", " },
                    blocks[arg.block],
                    val(values, arg.value)
                )?;
            }
            Ok(())
        }
        InstData::Unary { opcode, operand } => {
            write!(w, "{} {}", opcode, val(values, *operand))
        }
        InstData::Binary { opcode, lhs, rhs } => write!(
            w,
            "{} {}, {}",
            opcode,
            val(values, *lhs),
            val(values, *rhs)
        ),
        InstData::StaticRef { var } => write!(w, "static.ref {}", names.static_name(*var)),
        InstData::FuncRef { func: f } => write!(w, "func.ref {}", names.func_name(*f)),
        InstData::Parameter { index } => write!(w, "param {index}"),
        InstData::Alloca { size, .. } => write!(w, "alloca {size}"),
        InstData::Register { reg } => write!(w, "register {reg}"),
        InstData::Unreachable => write!(w, "unreachable"),
        InstData::LitInteger { value } => write!(w, "lit.int {}", *value as i64),
        InstData::LitString { string } => {
            write!(w, "lit.str \"{}\"", escape(module.str(*string)))
        }
    }
}

/// Write a function without symbol resolution; references print as entity
/// numbers. Used by `Function`'s `Display` impl.
pub fn write_function_plain(
    w: &mut dyn fmt::Write,
    func: &Function,
    module: &Module,
) -> fmt::Result {
    write_function(w, func, module, &EntityNames)
}

/// Write a static variable declaration line.
pub fn write_static(w: &mut dyn fmt::Write, var: &StaticData, module: &Module) -> fmt::Result {
    match &var.init {
        Some(StaticInit::String(s)) => {
            writeln!(w, "static {} = \"{}\"", var.name, escape(module.str(*s)))
        }
        Some(StaticInit::Integer(v)) => writeln!(w, "static {} = {}", var.name, *v as i64),
        None => writeln!(w, "static {} {}", var.name, module.type_sizeof(var.ty)),
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            '\r' => out.push_str("\\r"),
            '\0' => out.push_str("\\0"),
            c => out.push(c),
        }
    }
    out
}

impl Context {
    /// Render the whole compilation unit: statics first, then one `defun`
    /// per function, separated by blank lines.
    pub fn write_ir(&self) -> String {
        let mut out = String::new();
        for var in self.statics.values() {
            write_static(&mut out, var, &self.module).unwrap();
        }
        if !self.statics.is_empty() {
            out.push('\n');
        }
        let mut first = true;
        for func in self.functions.values() {
            if !first {
                out.push('\n');
            }
            first = false;
            write_function(&mut out, func, &self.module, self).unwrap();
        }
        out
    }
}
