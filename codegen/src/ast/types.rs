//! The value types consumed from the front end, and their utilities.

use crate::ast::{Module, NodeKind, SourceSpan, StrId, SymbolKind, UnaryOp};

/// An opaque reference to a type.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Type(u32);
gantry_entity::entity_impl!(Type, "type");

/// A function parameter: name, type and the source range it was declared at.
#[derive(Clone, Debug)]
pub struct Parameter {
    /// Parameter name.
    pub name: StrId,
    /// Parameter type.
    pub ty: Type,
    /// Where the parameter was declared.
    pub span: SourceSpan,
}

/// A struct member with its computed byte offset.
#[derive(Clone, Debug)]
pub struct Member {
    /// Member name.
    pub name: StrId,
    /// Member type.
    pub ty: Type,
    /// Byte offset from the start of the struct.
    pub offset: u64,
}

/// The payload of a type.
#[derive(Clone, Debug)]
pub enum TypeData {
    /// A built-in primitive.
    Primitive {
        /// The primitive's name.
        name: StrId,
        /// Size in bytes.
        size: u8,
        /// Alignment in bytes.
        align: u8,
        /// Signedness.
        is_signed: bool,
    },
    /// A named alias; resolves through its symbol. Aliases eventually reach
    /// a non-named canonical type once semantic analysis completes.
    Named {
        /// The name.
        name: StrId,
        /// The symbol the alias resolves through.
        symbol: crate::ast::SymbolId,
    },
    /// A pointer.
    Pointer {
        /// Pointee type.
        to: Type,
    },
    /// A reference.
    Reference {
        /// Referent type.
        to: Type,
    },
    /// A fixed-size array. The element type is always complete.
    Array {
        /// Element type.
        of: Type,
        /// Element count.
        len: u64,
    },
    /// A function type. Parameters keep their source order.
    Function {
        /// Return type.
        ret: Type,
        /// Parameters in source order.
        params: Vec<Parameter>,
    },
    /// A structure. Members keep their source order.
    Struct {
        /// Optional struct name.
        name: Option<StrId>,
        /// Members in source order, offsets precomputed.
        members: Vec<Member>,
        /// Total size in bytes.
        size: u64,
        /// Alignment in bytes.
        align: u64,
    },
    /// A sized integer such as `s64` or `u32`.
    Integer {
        /// Signedness.
        is_signed: bool,
        /// Width in bits.
        bits: u32,
    },
}

fn align_to(value: u64, align: u64) -> u64 {
    debug_assert!(align > 0);
    (value + align - 1) / align * align
}

/// Type utilities. All of these resolve named aliases through the module's
/// symbol table, so they live on [`Module`] rather than on [`Type`].
impl Module {
    /// Follow named aliases to the first non-named type. Returns `None` if
    /// the chain ends in an unresolved name (an incomplete type).
    pub fn type_canonical(&self, ty: Type) -> Option<Type> {
        let mut t = Some(ty);
        while let Some(cur) = t {
            match self.type_data(cur) {
                TypeData::Named { symbol, .. } => match &self.symbol(*symbol).kind {
                    SymbolKind::Type { resolved } => t = *resolved,
                    _ => return None,
                },
                _ => return Some(cur),
            }
        }
        None
    }

    /// Follow named aliases as far as they resolve, returning the last type
    /// along the chain. Unlike [`Module::type_canonical`], an unresolved
    /// name is returned rather than dropped.
    pub fn type_last_alias(&self, ty: Type) -> Type {
        let mut t = ty;
        loop {
            match self.type_data(t) {
                TypeData::Named { symbol, .. } => match &self.symbol(*symbol).kind {
                    SymbolKind::Type {
                        resolved: Some(next),
                    } => t = *next,
                    _ => return t,
                },
                _ => return t,
            }
        }
    }

    /// Is this type incomplete, i.e. `void` or an unresolved name?
    pub fn type_is_incomplete(&self, ty: Type) -> bool {
        match self.type_canonical(ty) {
            None => true,
            Some(t) => t == self.builtins().void,
        }
    }

    /// Is this `void`?
    pub fn type_is_void(&self, ty: Type) -> bool {
        self.type_canonical(ty) == Some(self.builtins().void)
    }

    /// Is the canonical type a pointer (after stripping references)?
    pub fn type_is_pointer(&self, ty: Type) -> bool {
        matches!(
            self.type_canonical(ty)
                .map(|t| self.type_data(self.type_strip_references(t))),
            Some(TypeData::Pointer { .. })
        )
    }

    /// Is the canonical type an array (after stripping references)?
    pub fn type_is_array(&self, ty: Type) -> bool {
        matches!(
            self.type_canonical(ty)
                .map(|t| self.type_data(self.type_strip_references(t))),
            Some(TypeData::Array { .. })
        )
    }

    /// Is the canonical type a struct (after stripping references)?
    pub fn type_is_struct(&self, ty: Type) -> bool {
        matches!(
            self.type_canonical(ty)
                .map(|t| self.type_data(self.type_strip_references(t))),
            Some(TypeData::Struct { .. })
        )
    }

    /// Is the canonical type a function?
    pub fn type_is_function(&self, ty: Type) -> bool {
        matches!(
            self.type_canonical(ty).map(|t| self.type_data(t)),
            Some(TypeData::Function { .. })
        )
    }

    /// Is this type signed?
    pub fn type_is_signed(&self, ty: Type) -> bool {
        match self.type_canonical(ty).map(|t| self.type_data(t)) {
            Some(TypeData::Primitive { is_signed, .. }) => *is_signed,
            Some(TypeData::Integer { is_signed, .. }) => *is_signed,
            _ => false,
        }
    }

    /// Strip any number of leading references.
    pub fn type_strip_references(&self, ty: Type) -> Type {
        let mut t = ty;
        while let TypeData::Reference { to } = self.type_data(t) {
            t = *to;
        }
        t
    }

    /// The element type of a pointer, reference or array.
    ///
    /// Panics on types that have no element type; callers check first.
    pub fn type_element(&self, ty: Type) -> Type {
        match self.type_data(ty) {
            TypeData::Named { symbol, .. } => match &self.symbol(*symbol).kind {
                SymbolKind::Type {
                    resolved: Some(next),
                } => self.type_element(*next),
                _ => panic!("unresolved named type has no element type"),
            },
            TypeData::Pointer { to } | TypeData::Reference { to } => *to,
            TypeData::Array { of, .. } => *of,
            other => panic!("type {other:?} does not have an element type"),
        }
    }

    /// Byte size of a type. Integer widths round up to whole bytes; pointer,
    /// reference and function types have the target pointer size; named
    /// types delegate to their alias; `void` is zero-sized.
    pub fn type_sizeof(&self, ty: Type) -> u64 {
        match self.type_data(ty) {
            TypeData::Primitive { size, .. } => u64::from(*size),
            TypeData::Named { symbol, .. } => match &self.symbol(*symbol).kind {
                SymbolKind::Type {
                    resolved: Some(next),
                } => self.type_sizeof(*next),
                _ => 0,
            },
            TypeData::Pointer { .. } | TypeData::Reference { .. } | TypeData::Function { .. } => {
                u64::from(self.pointer_width)
            }
            TypeData::Array { of, len } => len * self.type_sizeof(*of),
            TypeData::Struct { size, .. } => *size,
            TypeData::Integer { bits, .. } => align_to(u64::from(*bits), 8) / 8,
        }
    }

    /// Byte alignment of a type.
    pub fn type_alignof(&self, ty: Type) -> u64 {
        match self.type_data(ty) {
            TypeData::Primitive { align, .. } => u64::from(*align),
            TypeData::Named { symbol, .. } => match &self.symbol(*symbol).kind {
                SymbolKind::Type {
                    resolved: Some(next),
                } => self.type_alignof(*next),
                _ => 0,
            },
            TypeData::Pointer { .. } | TypeData::Reference { .. } | TypeData::Function { .. } => {
                u64::from(self.pointer_width)
            }
            TypeData::Array { of, .. } => self.type_alignof(*of),
            TypeData::Struct { align, .. } => *align,
            TypeData::Integer { bits, .. } => align_to(u64::from(*bits), 8) / 8,
        }
    }

    /// Structural type equality.
    ///
    /// The `<integer_literal>` primitive compares equal to `integer` (and
    /// only those two are implicitly equal among primitives). Pointers
    /// compare by pointee, arrays by size and element, functions by return
    /// type and ordered parameter types, structs by size, alignment and
    /// ordered members, integers by width and signedness. Incomplete types
    /// compare by name only, and `void` equals `void`.
    pub fn type_equals(&self, a: Type, b: Type) -> bool {
        let ta = self.type_last_alias(a);
        let tb = self.type_last_alias(b);

        // Incomplete types are equal iff they have the same name.
        let a_incomplete = self.type_is_incomplete(ta);
        let b_incomplete = self.type_is_incomplete(tb);
        if a_incomplete && b_incomplete {
            return match (self.type_data(ta), self.type_data(tb)) {
                (TypeData::Named { name: na, .. }, TypeData::Named { name: nb, .. }) => na == nb,
                _ => self.type_is_void(ta) && self.type_is_void(tb),
            };
        }
        if a_incomplete || b_incomplete {
            return false;
        }

        let ca = self.type_canonical(ta).expect("complete type has a canon");
        let cb = self.type_canonical(tb).expect("complete type has a canon");
        self.type_equals_canon(ca, cb)
    }

    fn type_equals_canon(&self, a: Type, b: Type) -> bool {
        if a == b {
            return true;
        }
        let builtins = self.builtins();
        match (self.type_data(a), self.type_data(b)) {
            (TypeData::Primitive { .. }, TypeData::Primitive { .. }) => {
                // The integer literal type is implicitly `integer`.
                if a == builtins.integer_literal {
                    return b == builtins.integer_literal || b == builtins.integer;
                }
                if b == builtins.integer_literal {
                    return a == builtins.integer_literal || a == builtins.integer;
                }
                false
            }
            (TypeData::Pointer { to: pa }, TypeData::Pointer { to: pb })
            | (TypeData::Reference { to: pa }, TypeData::Reference { to: pb }) => {
                self.type_equals(*pa, *pb)
            }
            (TypeData::Array { of: ea, len: la }, TypeData::Array { of: eb, len: lb }) => {
                la == lb && self.type_equals(*ea, *eb)
            }
            (
                TypeData::Function {
                    ret: ra,
                    params: pa,
                },
                TypeData::Function {
                    ret: rb,
                    params: pb,
                },
            ) => {
                if !self.type_equals(*ra, *rb) || pa.len() != pb.len() {
                    return false;
                }
                pa.iter()
                    .zip(pb.iter())
                    .all(|(x, y)| self.type_equals(x.ty, y.ty))
            }
            (
                TypeData::Struct {
                    members: ma,
                    size: sa,
                    align: aa,
                    ..
                },
                TypeData::Struct {
                    members: mb,
                    size: sb,
                    align: ab,
                    ..
                },
            ) => {
                sa == sb
                    && aa == ab
                    && ma.len() == mb.len()
                    && ma
                        .iter()
                        .zip(mb.iter())
                        .all(|(x, y)| x.offset == y.offset && self.type_equals(x.ty, y.ty))
            }
            (
                TypeData::Integer {
                    is_signed: sa,
                    bits: ba,
                },
                TypeData::Integer {
                    is_signed: sb,
                    bits: bb,
                },
            ) => sa == sb && ba == bb,
            _ => false,
        }
    }

    /// Render a type with the conventional decorations: `@T` for a pointer,
    /// `&T` for a reference, `T[N]` for an array, `R(P1, P2)` for a function
    /// type, `struct Name`, and `s64`/`u32` for sized integers. A pointer or
    /// reference target that is itself a function or array is parenthesised.
    /// With `colour` set, type names are wrapped in ANSI colour codes.
    pub fn typename(&self, ty: Type, colour: bool) -> String {
        let mut out = String::new();
        if colour {
            out.push_str("\x1b[36m");
        }
        self.write_typename(&mut out, ty);
        if colour {
            out.push_str("\x1b[m");
        }
        out
    }

    fn write_typename(&self, out: &mut String, ty: Type) {
        use std::fmt::Write;
        match self.type_data(ty) {
            TypeData::Primitive { name, .. } => out.push_str(self.str(*name)),
            TypeData::Named { name, .. } => out.push_str(self.str(*name)),
            TypeData::Pointer { to } => {
                out.push('@');
                self.write_parenthesised_target(out, *to);
            }
            TypeData::Reference { to } => {
                out.push('&');
                self.write_parenthesised_target(out, *to);
            }
            TypeData::Array { of, len } => {
                self.write_typename(out, *of);
                write!(out, "[{len}]").unwrap();
            }
            TypeData::Function { ret, params } => {
                self.write_typename(out, *ret);
                out.push('(');
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        out.push_str(", ");
                    }
                    self.write_typename(out, p.ty);
                }
                out.push(')');
            }
            TypeData::Struct { name, .. } => {
                out.push_str("struct");
                if let Some(n) = name {
                    out.push(' ');
                    out.push_str(self.str(*n));
                }
            }
            TypeData::Integer { is_signed, bits } => {
                write!(out, "{}{bits}", if *is_signed { 's' } else { 'u' }).unwrap();
            }
        }
    }

    fn write_parenthesised_target(&self, out: &mut String, ty: Type) {
        let needs_parens = matches!(
            self.type_data(ty),
            TypeData::Function { .. } | TypeData::Array { .. }
        );
        if needs_parens {
            out.push('(');
        }
        self.write_typename(out, ty);
        if needs_parens {
            out.push(')');
        }
    }

    /// Is this node an lvalue? Declarations, variable references, member
    /// accesses and dereferences are.
    pub fn is_lvalue(&self, node: crate::ast::Node) -> bool {
        matches!(
            self.node(node).kind,
            NodeKind::Declaration { .. }
                | NodeKind::VarRef(_)
                | NodeKind::MemberAccess { .. }
                | NodeKind::Unary {
                    op: UnaryOp::Deref,
                    ..
                }
        )
    }

    /// Convenience constructor for a pointer type.
    pub fn pointer_to(&mut self, to: Type) -> Type {
        self.make_type(TypeData::Pointer { to })
    }

    /// Convenience constructor for a sized integer type.
    pub fn integer_type(&mut self, is_signed: bool, bits: u32) -> Type {
        self.make_type(TypeData::Integer { is_signed, bits })
    }

    /// Convenience constructor for a function type.
    pub fn function_type(&mut self, ret: Type, params: Vec<Parameter>) -> Type {
        self.make_type(TypeData::Function { ret, params })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_round_up() {
        let mut m = Module::new("test", "");
        let b = m.builtins();
        assert_eq!(m.type_sizeof(b.void), 0);
        assert_eq!(m.type_sizeof(b.integer), 8);

        let i20 = m.integer_type(true, 20);
        assert_eq!(m.type_sizeof(i20), 3);
        assert_eq!(m.type_alignof(i20), 3);

        let p = m.pointer_to(b.byte);
        assert_eq!(m.type_sizeof(p), 8);

        let arr = m.make_type(TypeData::Array { of: b.byte, len: 10 });
        assert_eq!(m.type_sizeof(arr), 10);
    }

    #[test]
    fn literal_equals_integer() {
        let m = Module::new("test", "");
        let b = m.builtins();
        assert!(m.type_equals(b.integer_literal, b.integer));
        assert!(m.type_equals(b.integer, b.integer_literal));
        assert!(m.type_equals(b.integer, b.integer));
        assert!(!m.type_equals(b.byte, b.integer));
        assert!(m.type_equals(b.void, b.void));
    }

    #[test]
    fn equality_implies_equal_size() {
        let mut m = Module::new("test", "");
        let b = m.builtins();
        let p1 = m.pointer_to(b.integer);
        let p2 = m.pointer_to(b.integer);
        assert!(m.type_equals(p1, p2));
        assert_eq!(m.type_sizeof(p1), m.type_sizeof(p2));

        let f1 = m.function_type(b.integer, vec![]);
        let f2 = m.function_type(b.integer, vec![]);
        assert!(m.type_equals(f1, f2));
    }

    #[test]
    fn rendering() {
        let mut m = Module::new("test", "");
        let b = m.builtins();
        let p = m.pointer_to(b.integer);
        assert_eq!(m.typename(p, false), "@integer");

        let arr = m.make_type(TypeData::Array { of: b.byte, len: 4 });
        assert_eq!(m.typename(arr, false), "byte[4]");

        let parr = m.pointer_to(arr);
        assert_eq!(m.typename(parr, false), "@(byte[4])");

        let f = m.function_type(b.integer, vec![]);
        let pf = m.pointer_to(f);
        assert_eq!(m.typename(pf, false), "@(integer())");

        let s64 = m.integer_type(true, 64);
        assert_eq!(m.typename(s64, false), "s64");
    }
}
