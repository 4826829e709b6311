//! Reader for the Gantry textual IR.
//!
//! This crate parses the text the printer in `gantry_codegen::write`
//! produces: `static` lines, `declare` lines, and `defun` blocks with
//! `bb<n>:` labels. The parse builds real IR through the public builder, so
//! a parsed unit can go straight into the back end, and printing it again
//! reproduces the input byte for byte.

#![warn(missing_docs)]

mod error;
mod lexer;
mod parser;

pub use crate::error::{Location, ParseError, ParseResult};
pub use crate::lexer::{Lexer, Token};
pub use crate::parser::parse_unit;
