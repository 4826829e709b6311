//! Result and error types representing the outcome of compiling a function.

use std::fmt;

/// A compilation error.
///
/// Programmer errors — inserting after a terminator, removing an instruction
/// with live users — are bugs in the caller and panic instead; the variants
/// here are the errors a correct caller can still run into.
#[derive(Debug)]
pub enum CodegenError {
    /// A deliberately unfinished part of the back end was reached.
    ///
    /// Passing call arguments on the stack and by-value struct arguments are
    /// the known arms; the message names the construct and, where available,
    /// the machine instruction involved.
    Unimplemented(String),

    /// The requested target, object format or calling convention is not
    /// supported by this build.
    Unsupported(String),

    /// An error raised while parsing an instruction-selection table.
    IselParse(crate::isel::IselError),

    /// The register allocator could not satisfy the constraints of a
    /// function.
    RegisterAllocation(String),
}

/// A convenient alias for a `Result` that uses `CodegenError` as the error
/// type.
pub type CodegenResult<T> = Result<T, CodegenError>;

impl fmt::Display for CodegenError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Unimplemented(what) => write!(f, "unimplemented: {what}"),
            Self::Unsupported(what) => write!(f, "unsupported: {what}"),
            Self::IselParse(err) => write!(f, "isel table: {err}"),
            Self::RegisterAllocation(what) => write!(f, "register allocation: {what}"),
        }
    }
}

impl std::error::Error for CodegenError {}

impl From<crate::isel::IselError> for CodegenError {
    fn from(err: crate::isel::IselError) -> Self {
        Self::IselParse(err)
    }
}
