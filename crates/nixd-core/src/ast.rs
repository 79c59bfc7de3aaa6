//! The expression AST.
//!
//! Nodes live in an id-indexed arena owned by [`Ast`]. Derived structures
//! (the parent map, scope resolution) are separate `ExprId -> ExprId`
//! mappings, so nodes stay immutable and the whole tree can be shared
//! across threads behind an `Arc` once parsing finishes.

use crate::table::{PosIdx, PosTable, Sym, SymbolTable};

/// Index of an expression in the [`Ast`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExprId(pub u32);

/// `level` assigned to variables bound in the builtin environment rather
/// than by any node in the document. No scope walk can reach it.
pub const BUILTIN_LEVEL: u32 = u32::MAX;

/// Names predefined in the builtin environment.
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "true"
            | "false"
            | "null"
            | "builtins"
            | "import"
            | "toString"
            | "throw"
            | "abort"
            | "map"
            | "length"
            | "baseNameOf"
            | "dirOf"
            | "removeAttrs"
            | "derivation"
    )
}

/// A variable reference. `level`, `displ` and `from_with` are assigned by
/// the parser's static binder pass:
///
/// - `level`: number of scope-introducing nodes between the reference and
///   its binder (0 = bound by the innermost enclosing scope);
/// - `displ`: index into the binder's displacement list;
/// - `from_with`: the name is not statically bound and resolves through
///   the innermost enclosing `with` at evaluation time.
#[derive(Debug, Clone)]
pub struct Var {
    pub name: Sym,
    pub pos: PosIdx,
    pub level: u32,
    pub displ: u32,
    pub from_with: bool,
}

/// One `name = value;` binding inside an attribute set or `let`.
/// `inherit name;` desugars to a binding whose value is a `Var` of the
/// same name resolved in the enclosing scope (`inherited = true`).
#[derive(Debug, Clone)]
pub struct Binding {
    pub name: Sym,
    pub name_pos: PosIdx,
    pub value: ExprId,
    pub inherited: bool,
}

/// `{ ... }` or `rec { ... }`. Bindings are kept in source order; the
/// source order is also the displacement order used by the binder.
#[derive(Debug, Clone)]
pub struct Attrs {
    pub rec: bool,
    pub bindings: Vec<Binding>,
    pub pos: PosIdx,
}

/// `let ... in body`.
#[derive(Debug, Clone)]
pub struct Let {
    pub bindings: Vec<Binding>,
    pub body: ExprId,
    pub pos: PosIdx,
}

/// `[ a b c ]`
#[derive(Debug, Clone)]
pub struct List {
    pub items: Vec<ExprId>,
    pub pos: PosIdx,
}

/// `with env; body`
#[derive(Debug, Clone)]
pub struct With {
    pub env: ExprId,
    pub body: ExprId,
    pub pos: PosIdx,
}

/// A single formal parameter, e.g. `x` or `x ? default`.
#[derive(Debug, Clone)]
pub struct Formal {
    pub name: Sym,
    pub pos: PosIdx,
    pub default: Option<ExprId>,
}

/// `{ a, b ? 1, ... }` formal set.
#[derive(Debug, Clone)]
pub struct Formals {
    pub formals: Vec<Formal>,
    pub ellipsis: bool,
}

/// `x: body`, `{ a, b }: body` or `arg@{ a }: body`.
#[derive(Debug, Clone)]
pub struct Lambda {
    pub arg: Option<(Sym, PosIdx)>,
    pub formals: Option<Formals>,
    pub body: ExprId,
    pub pos: PosIdx,
}

/// Function application `f x`.
#[derive(Debug, Clone)]
pub struct Apply {
    pub func: ExprId,
    pub arg: ExprId,
    pub pos: PosIdx,
}

/// One static component of an attribute path.
#[derive(Debug, Clone, Copy)]
pub struct AttrName {
    pub sym: Sym,
    pub pos: PosIdx,
}

/// `subject.a.b` with an optional `or default`.
#[derive(Debug, Clone)]
pub struct Select {
    pub subject: ExprId,
    pub path: Vec<AttrName>,
    pub or_default: Option<ExprId>,
    pub pos: PosIdx,
}

/// `subject ? a.b`
#[derive(Debug, Clone)]
pub struct HasAttr {
    pub subject: ExprId,
    pub path: Vec<AttrName>,
    pub pos: PosIdx,
}

/// `if cond then t else e`
#[derive(Debug, Clone)]
pub struct If {
    pub cond: ExprId,
    pub then: ExprId,
    pub else_: ExprId,
    pub pos: PosIdx,
}

/// `assert cond; body`
#[derive(Debug, Clone)]
pub struct Assert {
    pub cond: ExprId,
    pub body: ExprId,
    pub pos: PosIdx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Not,
    Negate,
}

#[derive(Debug, Clone)]
pub struct UnaryOp {
    pub op: UnOp,
    pub operand: ExprId,
    pub pos: PosIdx,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
    Impl,
    Update,
    Concat,
}

#[derive(Debug, Clone)]
pub struct BinaryOp {
    pub op: BinOp,
    pub lhs: ExprId,
    pub rhs: ExprId,
    pub pos: PosIdx,
}

/// The closed set of node kinds. `Error` is the parser's recovery
/// placeholder and must be handled by every dispatch site.
#[derive(Debug, Clone)]
pub enum Expr {
    Var(Var),
    Int(i64, PosIdx),
    Float(f64, PosIdx),
    Str(String, PosIdx),
    Path(String, PosIdx),
    List(List),
    Attrs(Attrs),
    Let(Let),
    With(With),
    Lambda(Lambda),
    Apply(Apply),
    Select(Select),
    HasAttr(HasAttr),
    If(If),
    Assert(Assert),
    UnaryOp(UnaryOp),
    BinaryOp(BinaryOp),
    Error(PosIdx),
}

impl Expr {
    /// The node's own source position (its "anchor", not an extent).
    pub fn pos(&self) -> PosIdx {
        match self {
            Expr::Var(v) => v.pos,
            Expr::Int(_, p)
            | Expr::Float(_, p)
            | Expr::Str(_, p)
            | Expr::Path(_, p)
            | Expr::Error(p) => *p,
            Expr::List(l) => l.pos,
            Expr::Attrs(a) => a.pos,
            Expr::Let(l) => l.pos,
            Expr::With(w) => w.pos,
            Expr::Lambda(l) => l.pos,
            Expr::Apply(a) => a.pos,
            Expr::Select(s) => s.pos,
            Expr::HasAttr(h) => h.pos,
            Expr::If(i) => i.pos,
            Expr::Assert(a) => a.pos,
            Expr::UnaryOp(u) => u.pos,
            Expr::BinaryOp(b) => b.pos,
        }
    }

    /// Human-readable kind name, used in logs and assertions.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Expr::Var(_) => "Var",
            Expr::Int(..) => "Int",
            Expr::Float(..) => "Float",
            Expr::Str(..) => "Str",
            Expr::Path(..) => "Path",
            Expr::List(_) => "List",
            Expr::Attrs(_) => "Attrs",
            Expr::Let(_) => "Let",
            Expr::With(_) => "With",
            Expr::Lambda(_) => "Lambda",
            Expr::Apply(_) => "Apply",
            Expr::Select(_) => "Select",
            Expr::HasAttr(_) => "HasAttr",
            Expr::If(_) => "If",
            Expr::Assert(_) => "Assert",
            Expr::UnaryOp(_) => "UnaryOp",
            Expr::BinaryOp(_) => "BinaryOp",
            Expr::Error(_) => "Error",
        }
    }
}

/// A parsed document: the arena, its root, and the interning tables.
/// Immutable once published by the parser.
#[derive(Debug, Clone)]
pub struct Ast {
    exprs: Vec<Expr>,
    root: ExprId,
    pub symbols: SymbolTable,
    pub positions: PosTable,
}

impl Ast {
    pub fn new(exprs: Vec<Expr>, root: ExprId, symbols: SymbolTable, positions: PosTable) -> Self {
        Ast {
            exprs,
            root,
            symbols,
            positions,
        }
    }

    pub fn root(&self) -> ExprId {
        self.root
    }

    pub fn expr(&self, id: ExprId) -> &Expr {
        &self.exprs[id.0 as usize]
    }

    pub fn expr_mut(&mut self, id: ExprId) -> &mut Expr {
        &mut self.exprs[id.0 as usize]
    }

    /// Number of nodes in the arena.
    pub fn len(&self) -> usize {
        self.exprs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exprs.is_empty()
    }

    /// Iterate every node id in the arena (allocation order, not
    /// traversal order).
    pub fn ids(&self) -> impl Iterator<Item = ExprId> {
        (0..self.exprs.len() as u32).map(ExprId)
    }

    pub fn name(&self, sym: Sym) -> &str {
        self.symbols.resolve(sym)
    }
}
