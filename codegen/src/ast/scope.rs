//! Scopes and the symbols they bind.

use crate::ast::{Node, StrId, Type};
use crate::entity::packed_option::PackedOption;

/// An opaque reference to a scope.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScopeId(u32);
gantry_entity::entity_impl!(ScopeId, "scope");

/// An opaque reference to a symbol.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(u32);
gantry_entity::entity_impl!(SymbolId, "sym");

/// What a symbol names.
#[derive(Clone, Debug)]
pub enum SymbolKind {
    /// A type name. `resolved` is filled in once the type is complete;
    /// a `None` here is what makes a named type incomplete.
    Type {
        /// The aliased type, once known.
        resolved: Option<Type>,
    },
    /// A variable, with its declaring node and type.
    Variable {
        /// The declaration node.
        decl: Node,
        /// The variable's type.
        ty: Type,
    },
    /// A function, with its declaring node and function type.
    Function {
        /// The function node.
        decl: Node,
        /// The function type.
        ty: Type,
    },
}

/// A symbol: a name bound in exactly one scope.
#[derive(Clone, Debug)]
pub struct SymbolData {
    /// The symbol's name.
    pub name: StrId,
    /// The scope that contains the symbol.
    pub scope: ScopeId,
    /// What the name refers to.
    pub kind: SymbolKind,
}

/// A scope: a node in the scope tree.
#[derive(Clone, Debug)]
pub struct ScopeData {
    /// The enclosing scope, absent for the global scope.
    pub parent: PackedOption<ScopeId>,
    /// Symbols bound in this scope, in declaration order.
    pub symbols: Vec<SymbolId>,
    /// Child scopes, in creation order.
    pub children: Vec<ScopeId>,
}

impl ScopeData {
    /// Create an empty scope under `parent`.
    pub fn new(parent: Option<ScopeId>) -> Self {
        Self {
            parent: parent.into(),
            symbols: Vec::new(),
            children: Vec::new(),
        }
    }
}
