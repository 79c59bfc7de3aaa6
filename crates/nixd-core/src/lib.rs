pub mod ast;
pub mod error;
pub mod table;

pub use ast::{
    is_builtin, Apply, Assert, Ast, AttrName, Attrs, BinOp, BinaryOp, Binding, Expr, ExprId,
    Formal, Formals, HasAttr, If, Lambda, Let, List, Select, UnOp, UnaryOp, Var, With,
    BUILTIN_LEVEL,
};
pub use error::{ErrorPos, NixdError};
pub use table::{Pos, PosIdx, PosTable, Sym, SymbolTable};
