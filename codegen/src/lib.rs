//! Middle and back end of the Gantry compiler.
//!
//! This crate takes the typed AST a front end hands it, lowers it to an
//! SSA-form intermediate representation, selects target instructions with a
//! pattern table, allocates registers, and encodes x86-64 machine code into
//! a generic object file that `gantry-object` can serialise as ELF or COFF.
//!
//! The major pieces, leaves first:
//!
//! - [`ast`]: the value types, scopes and nodes consumed from the front end.
//! - [`ir`]: the SSA CFG of typed instructions, its layout, and the builder.
//! - [`isel`]: the pattern DSL and the table-driven matcher.
//! - [`mir`]: the target-parametric machine IR with virtual registers.
//! - [`isa`]: target selection, calling conventions, and the x86-64 back end.
//! - [`binemit`]: the generic object model the encoder writes into.
//! - [`Context`]: owns the IR for one compilation and drives the pipeline.

#![warn(missing_docs)]
#![allow(clippy::new_without_default)]

pub use gantry_entity as entity;

pub mod ast;
pub mod binemit;
pub mod ir;
pub mod isa;
pub mod isel;
pub mod mir;
pub mod regalloc;
pub mod write;

mod context;
mod lower;
mod result;

pub use crate::context::{
    compile_ir_context, compile_module, CompileOptions, Context, ObjectFormat, SourceLang,
};
pub use crate::lower::lower_module_to_ir;
pub use crate::result::{CodegenError, CodegenResult};

/// Version number of this crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
