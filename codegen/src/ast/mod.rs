//! The AST and type model consumed from the front end.
//!
//! The parser delivers a [`Module`]: arenas of nodes, types, scopes and
//! interned strings, plus the root block and the scope stack it used while
//! parsing. Everything is immutable after semantic analysis; the back end
//! only reads it.
//!
//! Like the IR, the AST references its parts through typed `u32` entity
//! references into arenas owned by the module, so parent links and symbol
//! back-references are cheap and the whole module is freed wholesale.

use crate::entity::packed_option::PackedOption;
use crate::entity::PrimaryMap;
use rustc_hash::FxHashMap;

mod scope;
mod types;

pub use self::scope::{ScopeData, ScopeId, SymbolData, SymbolId, SymbolKind};
pub use self::types::{Member, Parameter, Type, TypeData};

/// An interned string.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrId(u32);
gantry_entity::entity_impl!(StrId, "str");

/// A byte range `(start, end)` into the module's source buffer.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceSpan {
    /// Offset of the first byte.
    pub start: u32,
    /// Offset one past the last byte.
    pub end: u32,
}

impl SourceSpan {
    /// A span covering nothing.
    pub const NONE: Self = Self { start: 0, end: 0 };

    /// Create a span from byte offsets.
    pub fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }
}

/// An opaque reference to an AST node.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Node(u32);
gantry_entity::entity_impl!(Node, "node");

/// Binary operators of the surface language.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `<<`
    Shl,
    /// `>>` (arithmetic)
    Sar,
    /// `>>>` (logical)
    Shr,
    /// `&`
    And,
    /// `|`
    Or,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `=`
    Eq,
    /// `!=`
    Ne,
    /// `:=` store into an lvalue
    Assign,
    /// `[` subscript
    Subscript,
}

/// Unary operators of the surface language.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UnaryOp {
    /// `@` dereference
    Deref,
    /// `&` address-of
    AddressOf,
    /// `!` logical not
    Not,
    /// `-` negation
    Neg,
}

/// Function attributes set by the front end.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct FuncAttrs {
    /// Must be evaluated at compile time.
    pub consteval: bool,
    /// Always inline.
    pub forceinline: bool,
    /// Visible outside the module.
    pub global: bool,
    /// Calls no other functions.
    pub leaf: bool,
    /// Never returns.
    pub noreturn: bool,
    /// No observable side effects.
    pub pure_: bool,
    /// Declared but defined elsewhere.
    pub is_extern: bool,
}

/// The payload of an AST node.
#[derive(Clone, Debug)]
pub enum NodeKind {
    /// The root of the module: top-level declarations and expressions.
    Root {
        /// Top-level nodes in source order.
        children: Vec<Node>,
    },
    /// A braced block of expressions; yields the value of the last one.
    Block {
        /// Child nodes in source order.
        children: Vec<Node>,
    },
    /// A variable declaration.
    Declaration {
        /// Declared name.
        name: StrId,
        /// Declared type.
        ty: Type,
        /// Optional initialiser.
        init: Option<Node>,
        /// Static storage duration (top-level declarations).
        is_static: bool,
    },
    /// A function definition or declaration.
    Function {
        /// Function name as written.
        name: StrId,
        /// The function type.
        ty: Type,
        /// The body, absent for declarations.
        body: Option<Node>,
        /// Attributes.
        attrs: FuncAttrs,
    },
    /// `if cond then else`.
    If {
        /// Condition expression.
        cond: Node,
        /// Then arm.
        then: Node,
        /// Optional else arm.
        otherwise: Option<Node>,
    },
    /// `while cond body`.
    While {
        /// Condition expression.
        cond: Node,
        /// Loop body.
        body: Node,
    },
    /// `for init, cond, step body`.
    For {
        /// Loop initialiser.
        init: Node,
        /// Condition expression.
        cond: Node,
        /// Step expression.
        step: Node,
        /// Loop body.
        body: Node,
    },
    /// Return from the current function.
    Return {
        /// Optional value.
        value: Option<Node>,
    },
    /// A call expression.
    Call {
        /// The callee: a function reference or an arbitrary expression.
        callee: Node,
        /// Arguments in source order.
        args: Vec<Node>,
    },
    /// An explicit cast.
    Cast {
        /// Target type.
        ty: Type,
        /// Operand.
        operand: Node,
    },
    /// A binary expression.
    Binary {
        /// Operator.
        op: BinaryOp,
        /// Left operand.
        lhs: Node,
        /// Right operand.
        rhs: Node,
    },
    /// A unary expression.
    Unary {
        /// Operator.
        op: UnaryOp,
        /// Operand.
        operand: Node,
    },
    /// An integer literal.
    IntLit(u64),
    /// A string literal (interned).
    StringLit(StrId),
    /// A compound literal.
    CompoundLit {
        /// Member initialisers in source order.
        elems: Vec<Node>,
    },
    /// A reference to a variable.
    VarRef(SymbolId),
    /// A reference to a function.
    FuncRef(SymbolId),
    /// A reference to an imported module.
    ModuleRef(StrId),
    /// A structure declaration.
    StructDecl(Type),
    /// Member access `expr.member`.
    MemberAccess {
        /// The accessed object.
        object: Node,
        /// Member name.
        member: StrId,
    },
}

/// An AST node: payload, source range, and a parent back-pointer that is
/// re-established whenever the node is attached or replaced.
#[derive(Clone, Debug)]
pub struct NodeData {
    /// The node payload.
    pub kind: NodeKind,
    /// Source range of the node.
    pub span: SourceSpan,
    /// The parent node, if attached.
    pub parent: PackedOption<Node>,
}

/// The built-in types every module starts with.
#[derive(Copy, Clone, Debug)]
pub struct Builtins {
    /// `void`, the zero-sized type.
    pub void: Type,
    /// `integer`, the default signed 8-byte integer.
    pub integer: Type,
    /// The type of untyped integer literals, implicitly equal to `integer`.
    pub integer_literal: Type,
    /// `byte`, an unsigned 1-byte integer.
    pub byte: Type,
}

/// A parsed module: arenas of AST nodes, types, scopes and interned strings,
/// plus the scope stack used during parsing.
#[derive(Debug)]
pub struct Module {
    /// Name of the file this module was parsed from.
    pub filename: String,
    /// The source text.
    pub source: String,
    /// The root node.
    pub root: Node,
    /// True when this translation unit is a named module whose exports are
    /// serialised into the object file.
    pub is_module: bool,
    /// The module name, when `is_module` is set.
    pub module_name: Option<String>,
    /// Serialised export metadata, produced by the module serialiser. The
    /// encoder copies these bytes into their own section verbatim.
    pub metadata: Vec<u8>,

    nodes: PrimaryMap<Node, NodeData>,
    types: PrimaryMap<Type, TypeData>,
    scopes: PrimaryMap<ScopeId, ScopeData>,
    symbols: PrimaryMap<SymbolId, SymbolData>,
    strings: PrimaryMap<StrId, String>,
    string_index: FxHashMap<String, StrId>,
    scope_stack: Vec<ScopeId>,

    builtins: Builtins,
    /// Size in bytes of a pointer on the target.
    pub pointer_width: u8,
}

impl Module {
    /// Create an empty module with the global scope, the root node and the
    /// built-in types.
    pub fn new(filename: impl Into<String>, source: impl Into<String>) -> Self {
        let mut nodes = PrimaryMap::new();
        let mut types = PrimaryMap::new();
        let mut scopes = PrimaryMap::new();
        let mut strings = PrimaryMap::new();
        let mut string_index = FxHashMap::default();

        let root = nodes.push(NodeData {
            kind: NodeKind::Root {
                children: Vec::new(),
            },
            span: SourceSpan::NONE,
            parent: None.into(),
        });

        let global = scopes.push(ScopeData::new(None));

        let mut intern = |s: &str| -> StrId {
            let id = strings.push(s.to_string());
            string_index.insert(s.to_string(), id);
            id
        };

        let void_name = intern("void");
        let int_name = intern("integer");
        let lit_name = intern("<integer_literal>");
        let byte_name = intern("byte");

        let void = types.push(TypeData::Primitive {
            name: void_name,
            size: 0,
            align: 1,
            is_signed: false,
        });
        let integer = types.push(TypeData::Primitive {
            name: int_name,
            size: 8,
            align: 8,
            is_signed: true,
        });
        let integer_literal = types.push(TypeData::Primitive {
            name: lit_name,
            size: 8,
            align: 8,
            is_signed: true,
        });
        let byte = types.push(TypeData::Primitive {
            name: byte_name,
            size: 1,
            align: 1,
            is_signed: false,
        });

        Self {
            filename: filename.into(),
            source: source.into(),
            root,
            is_module: false,
            module_name: None,
            metadata: Vec::new(),
            nodes,
            types,
            scopes,
            symbols: PrimaryMap::new(),
            strings,
            string_index,
            scope_stack: vec![global],
            builtins: Builtins {
                void,
                integer,
                integer_literal,
                byte,
            },
            pointer_width: 8,
        }
    }

    /// The built-in types.
    pub fn builtins(&self) -> Builtins {
        self.builtins
    }

    /// The global scope.
    pub fn global_scope(&self) -> ScopeId {
        self.scope_stack[0]
    }

    /// The innermost scope on the parse-time scope stack.
    pub fn current_scope(&self) -> ScopeId {
        *self.scope_stack.last().expect("scope stack is never empty")
    }

    /// Push a fresh child of the current scope and make it current.
    pub fn push_scope(&mut self) -> ScopeId {
        let parent = self.current_scope();
        let scope = self.scopes.push(ScopeData::new(Some(parent)));
        self.scopes[parent].children.push(scope);
        self.scope_stack.push(scope);
        scope
    }

    /// Pop the current scope. The global scope cannot be popped.
    pub fn pop_scope(&mut self) {
        assert!(self.scope_stack.len() > 1, "cannot pop the global scope");
        self.scope_stack.pop();
    }

    /// Intern a string, returning its id.
    pub fn intern(&mut self, s: &str) -> StrId {
        if let Some(&id) = self.string_index.get(s) {
            return id;
        }
        let id = self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), id);
        id
    }

    /// Look up the text of an interned string.
    pub fn str(&self, id: StrId) -> &str {
        &self.strings[id]
    }

    /// Create a new detached node.
    pub fn make_node(&mut self, kind: NodeKind, span: SourceSpan) -> Node {
        self.nodes.push(NodeData {
            kind,
            span,
            parent: None.into(),
        })
    }

    /// Access a node's data.
    pub fn node(&self, node: Node) -> &NodeData {
        &self.nodes[node]
    }

    /// Access a node's data, mutable edition.
    pub fn node_mut(&mut self, node: Node) -> &mut NodeData {
        &mut self.nodes[node]
    }

    /// Record `parent` as the parent of `child`.
    ///
    /// Called whenever a node is attached or substituted so the back-pointer
    /// is always current.
    pub fn set_parent(&mut self, child: Node, parent: Node) {
        self.nodes[child].parent = parent.into();
    }

    /// Append a node to the root block.
    pub fn append_to_root(&mut self, node: Node) {
        let root = self.root;
        if let NodeKind::Root { children } = &mut self.nodes[root].kind {
            children.push(node);
        }
        self.set_parent(node, root);
    }

    /// Create a type.
    pub fn make_type(&mut self, data: TypeData) -> Type {
        self.types.push(data)
    }

    /// Access a type's data.
    pub fn type_data(&self, ty: Type) -> &TypeData {
        &self.types[ty]
    }

    /// Access a scope's data.
    pub fn scope(&self, scope: ScopeId) -> &ScopeData {
        &self.scopes[scope]
    }

    /// Access a symbol's data.
    pub fn symbol(&self, sym: SymbolId) -> &SymbolData {
        &self.symbols[sym]
    }

    /// Access a symbol's data, mutable edition.
    pub fn symbol_mut(&mut self, sym: SymbolId) -> &mut SymbolData {
        &mut self.symbols[sym]
    }

    /// Add a symbol to `scope`. Names are unique within a scope; a duplicate
    /// returns the existing symbol unchanged.
    pub fn add_symbol(&mut self, scope: ScopeId, name: StrId, kind: SymbolKind) -> SymbolId {
        if let Some(existing) = self.lookup_in(scope, name, true) {
            return existing;
        }
        let sym = self.symbols.push(SymbolData { name, scope, kind });
        self.scopes[scope].symbols.push(sym);
        sym
    }

    /// Look up `name` starting at `scope`. Unless `this_scope_only`, the
    /// search walks parent scopes up to the root.
    pub fn lookup_in(&self, scope: ScopeId, name: StrId, this_scope_only: bool) -> Option<SymbolId> {
        let mut cursor = Some(scope);
        while let Some(s) = cursor {
            for &sym in &self.scopes[s].symbols {
                if self.symbols[sym].name == name {
                    return Some(sym);
                }
            }
            if this_scope_only {
                return None;
            }
            cursor = self.scopes[s].parent.expand();
        }
        None
    }

    /// Look up `name` starting at the current scope.
    pub fn lookup(&self, name: StrId) -> Option<SymbolId> {
        self.lookup_in(self.current_scope(), name, false)
    }
}
