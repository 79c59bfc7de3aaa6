//! Generic recursive traversal over the closed node-kind set.
//!
//! The contract, relied on by tests and derived structures:
//! - `traverse(_, None)` continues;
//! - dispatch covers every kind, `Error` included;
//! - the visit hook for a node fires exactly once per traversal, before
//!   its children by default, after them when `post_order()` is true;
//! - a visit or traverse hook returning `false` aborts the whole
//!   traversal with `false`;
//! - children are visited in source order: binding lists, function
//!   arguments, operands and attribute declarations as written.

use nixd_core::{Ast, Expr, ExprId};

pub trait Visitor {
    fn post_order(&self) -> bool {
        false
    }

    /// Fallback hook: every `visit_*` defaults to this.
    fn visit_expr(&mut self, ast: &Ast, id: ExprId) -> bool {
        let _ = (ast, id);
        true
    }

    fn visit_var(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_int(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_float(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_str(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_path(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_list(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_attrs(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_let(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_with(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_lambda(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_apply(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_select(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_has_attr(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_if(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_assert(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_unary_op(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_binary_op(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }
    fn visit_error(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_expr(ast, id)
    }

    /// Entry point. Dispatches on the dynamic kind; `None` continues.
    fn traverse(&mut self, ast: &Ast, id: Option<ExprId>) -> bool {
        let Some(id) = id else { return true };
        match ast.expr(id) {
            Expr::Var(_) => self.traverse_var(ast, id),
            Expr::Int(..) => self.traverse_int(ast, id),
            Expr::Float(..) => self.traverse_float(ast, id),
            Expr::Str(..) => self.traverse_str(ast, id),
            Expr::Path(..) => self.traverse_path(ast, id),
            Expr::List(_) => self.traverse_list(ast, id),
            Expr::Attrs(_) => self.traverse_attrs(ast, id),
            Expr::Let(_) => self.traverse_let(ast, id),
            Expr::With(_) => self.traverse_with(ast, id),
            Expr::Lambda(_) => self.traverse_lambda(ast, id),
            Expr::Apply(_) => self.traverse_apply(ast, id),
            Expr::Select(_) => self.traverse_select(ast, id),
            Expr::HasAttr(_) => self.traverse_has_attr(ast, id),
            Expr::If(_) => self.traverse_if(ast, id),
            Expr::Assert(_) => self.traverse_assert(ast, id),
            Expr::UnaryOp(_) => self.traverse_unary_op(ast, id),
            Expr::BinaryOp(_) => self.traverse_binary_op(ast, id),
            Expr::Error(_) => self.traverse_error(ast, id),
        }
    }

    fn traverse_var(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_var(ast, id)
    }
    fn traverse_int(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_int(ast, id)
    }
    fn traverse_float(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_float(ast, id)
    }
    fn traverse_str(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_str(ast, id)
    }
    fn traverse_path(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_path(ast, id)
    }
    fn traverse_error(&mut self, ast: &Ast, id: ExprId) -> bool {
        self.visit_error(ast, id)
    }

    fn traverse_list(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_list(ast, id) {
            return false;
        }
        if let Expr::List(l) = ast.expr(id) {
            for &item in &l.items {
                if !self.traverse(ast, Some(item)) {
                    return false;
                }
            }
        }
        if self.post_order() && !self.visit_list(ast, id) {
            return false;
        }
        true
    }

    fn traverse_attrs(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_attrs(ast, id) {
            return false;
        }
        if let Expr::Attrs(a) = ast.expr(id) {
            for b in &a.bindings {
                if !self.traverse(ast, Some(b.value)) {
                    return false;
                }
            }
        }
        if self.post_order() && !self.visit_attrs(ast, id) {
            return false;
        }
        true
    }

    fn traverse_let(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_let(ast, id) {
            return false;
        }
        if let Expr::Let(l) = ast.expr(id) {
            for b in &l.bindings {
                if !self.traverse(ast, Some(b.value)) {
                    return false;
                }
            }
            if !self.traverse(ast, Some(l.body)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_let(ast, id) {
            return false;
        }
        true
    }

    fn traverse_with(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_with(ast, id) {
            return false;
        }
        if let Expr::With(w) = ast.expr(id) {
            if !self.traverse(ast, Some(w.env)) {
                return false;
            }
            if !self.traverse(ast, Some(w.body)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_with(ast, id) {
            return false;
        }
        true
    }

    fn traverse_lambda(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_lambda(ast, id) {
            return false;
        }
        if let Expr::Lambda(l) = ast.expr(id) {
            if let Some(formals) = &l.formals {
                for f in &formals.formals {
                    if !self.traverse(ast, f.default) {
                        return false;
                    }
                }
            }
            if !self.traverse(ast, Some(l.body)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_lambda(ast, id) {
            return false;
        }
        true
    }

    fn traverse_apply(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_apply(ast, id) {
            return false;
        }
        if let Expr::Apply(a) = ast.expr(id) {
            if !self.traverse(ast, Some(a.func)) {
                return false;
            }
            if !self.traverse(ast, Some(a.arg)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_apply(ast, id) {
            return false;
        }
        true
    }

    fn traverse_select(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_select(ast, id) {
            return false;
        }
        if let Expr::Select(s) = ast.expr(id) {
            if !self.traverse(ast, Some(s.subject)) {
                return false;
            }
            if !self.traverse(ast, s.or_default) {
                return false;
            }
        }
        if self.post_order() && !self.visit_select(ast, id) {
            return false;
        }
        true
    }

    fn traverse_has_attr(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_has_attr(ast, id) {
            return false;
        }
        if let Expr::HasAttr(h) = ast.expr(id) {
            if !self.traverse(ast, Some(h.subject)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_has_attr(ast, id) {
            return false;
        }
        true
    }

    fn traverse_if(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_if(ast, id) {
            return false;
        }
        if let Expr::If(i) = ast.expr(id) {
            if !self.traverse(ast, Some(i.cond)) {
                return false;
            }
            if !self.traverse(ast, Some(i.then)) {
                return false;
            }
            if !self.traverse(ast, Some(i.else_)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_if(ast, id) {
            return false;
        }
        true
    }

    fn traverse_assert(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_assert(ast, id) {
            return false;
        }
        if let Expr::Assert(a) = ast.expr(id) {
            if !self.traverse(ast, Some(a.cond)) {
                return false;
            }
            if !self.traverse(ast, Some(a.body)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_assert(ast, id) {
            return false;
        }
        true
    }

    fn traverse_unary_op(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_unary_op(ast, id) {
            return false;
        }
        if let Expr::UnaryOp(u) = ast.expr(id) {
            if !self.traverse(ast, Some(u.operand)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_unary_op(ast, id) {
            return false;
        }
        true
    }

    fn traverse_binary_op(&mut self, ast: &Ast, id: ExprId) -> bool {
        if !self.post_order() && !self.visit_binary_op(ast, id) {
            return false;
        }
        if let Expr::BinaryOp(b) = ast.expr(id) {
            if !self.traverse(ast, Some(b.lhs)) {
                return false;
            }
            if !self.traverse(ast, Some(b.rhs)) {
                return false;
            }
        }
        if self.post_order() && !self.visit_binary_op(ast, id) {
            return false;
        }
        true
    }
}

/// Direct children of a node, in the visitor's traversal order.
pub fn children(ast: &Ast, id: ExprId) -> Vec<ExprId> {
    match ast.expr(id) {
        Expr::Var(_)
        | Expr::Int(..)
        | Expr::Float(..)
        | Expr::Str(..)
        | Expr::Path(..)
        | Expr::Error(..) => Vec::new(),
        Expr::List(l) => l.items.clone(),
        Expr::Attrs(a) => a.bindings.iter().map(|b| b.value).collect(),
        Expr::Let(l) => {
            let mut out: Vec<ExprId> = l.bindings.iter().map(|b| b.value).collect();
            out.push(l.body);
            out
        }
        Expr::With(w) => vec![w.env, w.body],
        Expr::Lambda(l) => {
            let mut out = Vec::new();
            if let Some(formals) = &l.formals {
                out.extend(formals.formals.iter().filter_map(|f| f.default));
            }
            out.push(l.body);
            out
        }
        Expr::Apply(a) => vec![a.func, a.arg],
        Expr::Select(s) => {
            let mut out = vec![s.subject];
            out.extend(s.or_default);
            out
        }
        Expr::HasAttr(h) => vec![h.subject],
        Expr::If(i) => vec![i.cond, i.then, i.else_],
        Expr::Assert(a) => vec![a.cond, a.body],
        Expr::UnaryOp(u) => vec![u.operand],
        Expr::BinaryOp(b) => vec![b.lhs, b.rhs],
    }
}
