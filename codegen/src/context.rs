//! A compilation context.
//!
//! The context owns everything produced while compiling one module: the IR
//! functions and static variables, the current insertion point the builder
//! appends through, and the AST module the types resolve against. It is
//! created once per compilation and dropped wholesale.

use crate::ast::Module;
use crate::binemit::GenericObjectFile;
use crate::entity::packed_option::PackedOption;
use crate::entity::PrimaryMap;
use crate::ir::{Block, FuncId, Function, StaticData, StaticId};
use crate::isa::CallConv;
use crate::isel::Table;
use crate::{CodegenError, CodegenResult};

/// The language of the compiler input.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum SourceLang {
    /// A parsed surface-language module.
    Surface,
    /// Textual IR.
    Ir,
}

/// The object file container format to produce.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ObjectFormat {
    /// ELF relocatable object.
    Elf,
    /// COFF object.
    Coff,
}

/// Options for [`compile_module`].
#[derive(Clone, Debug)]
pub struct CompileOptions {
    /// The calling convention to compile for.
    pub call_conv: CallConv,
    /// The object container format the caller intends to write.
    pub format: ObjectFormat,
    /// Source text of an instruction-selection table, overriding the
    /// built-in x86-64 table.
    pub isel_table: Option<String>,
}

impl CompileOptions {
    /// Options for the given convention and format, with the built-in
    /// instruction-selection table.
    pub fn new(call_conv: CallConv, format: ObjectFormat) -> Self {
        Self {
            call_conv,
            format,
            isel_table: None,
        }
    }
}

/// Everything owned by one compilation.
#[derive(Debug)]
pub struct Context {
    /// The AST module the IR's types and symbols resolve against.
    pub module: Module,
    /// All IR functions, in declaration order.
    pub functions: PrimaryMap<FuncId, Function>,
    /// All static variables.
    pub statics: PrimaryMap<StaticId, StaticData>,

    /// The function new instructions are inserted into.
    pub func: PackedOption<FuncId>,
    /// The block new instructions are appended to.
    pub block: PackedOption<Block>,
}

impl Context {
    /// Create a context for compiling `module`.
    pub fn new(module: Module) -> Self {
        Self {
            module,
            functions: PrimaryMap::new(),
            statics: PrimaryMap::new(),
            func: None.into(),
            block: None.into(),
        }
    }

    /// The current insertion function.
    ///
    /// Panics when no function is selected; that is a programmer error.
    pub fn current_func(&self) -> FuncId {
        self.func.expect("no current function")
    }

    /// The current insertion block.
    pub fn current_block(&self) -> Block {
        self.block.expect("no current block")
    }

    /// Borrow the current function.
    pub fn cur(&self) -> &Function {
        &self.functions[self.current_func()]
    }

    /// Borrow the current function mutably.
    pub fn cur_mut(&mut self) -> &mut Function {
        let f = self.current_func();
        &mut self.functions[f]
    }

    /// Select the insertion point.
    pub fn switch_to_block(&mut self, block: Block) {
        self.block = block.into();
    }

    /// Assign numeric ids across all functions. Ids are stable only between
    /// renumberings.
    pub fn set_ids(&mut self) {
        for func in self.functions.values_mut() {
            func.set_func_ids();
        }
    }

    /// Print the whole IR, one `defun` per function.
    pub fn print_ir(&self) -> String {
        let mut out = String::new();
        for func in self.functions.values() {
            out.push_str(&func.display(&self.module).to_string());
        }
        out
    }
}

/// Compile a parsed module down to a generic object file.
///
/// This is the single entry point of the back end: it lowers the AST to IR,
/// selects instructions against the table, allocates registers, and encodes
/// x86-64 machine code. The returned object is serialised by the object
/// writer.
pub fn compile_module(module: Module, opts: &CompileOptions) -> CodegenResult<GenericObjectFile> {
    let mut ctx = Context::new(module);
    crate::lower::lower_module_to_ir(&mut ctx)?;
    compile_ir_context(&mut ctx, opts)
}

/// Compile a context whose IR has already been built (by the AST lowering or
/// by the IR reader).
pub fn compile_ir_context(
    ctx: &mut Context,
    opts: &CompileOptions,
) -> CodegenResult<GenericObjectFile> {
    let table = match &opts.isel_table {
        Some(source) => Table::parse("<isel-table>", source).map_err(CodegenError::IselParse)?,
        None => Table::parse("x64.isel", crate::isa::x64::DEFAULT_ISEL_TABLE)
            .map_err(CodegenError::IselParse)?,
    };
    crate::isa::x64::compile_context(ctx, &table, opts.call_conv)
}
