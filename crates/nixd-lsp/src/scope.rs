//! Parent map and lexical scope resolution.
//!
//! The parent map is a separate `ExprId -> ExprId` mapping derived from
//! the child graph, never back-pointers on nodes. Scope questions are
//! answered by walking it upward and counting the ancestors that
//! introduce an environment for the path being walked; that count is the
//! same quantity the binder stored in `Var::level`, so the two always
//! agree on which node binds a variable.

use std::collections::HashMap;

use nixd_core::{Ast, Expr, ExprId, PosIdx, Sym, BUILTIN_LEVEL};

use crate::visitor::children;

pub type ParentMap = HashMap<ExprId, ExprId>;

/// Build the parent map with a single pre-order walk.
pub fn parent_map(ast: &Ast) -> ParentMap {
    let mut map = ParentMap::new();
    let mut stack = vec![ast.root()];
    while let Some(id) = stack.pop() {
        for child in children(ast, id) {
            map.insert(child, id);
            stack.push(child);
        }
    }
    map
}

/// Does `parent` introduce a lexical scope that `child` lives in?
///
/// | parent            | true iff                                    |
/// |-------------------|---------------------------------------------|
/// | `rec { … }`       | child is a non-inherited binding value      |
/// | `{ … }`           | never                                       |
/// | `let … in body`   | child is a non-inherited value or the body  |
/// | `with e; body`    | child is the body (not `e`)                 |
/// | lambda            | child is the body                           |
/// | anything else     | never                                       |
pub fn creates_env(ast: &Ast, parent: ExprId, child: ExprId) -> bool {
    match ast.expr(parent) {
        Expr::Attrs(a) => {
            a.rec
                && a.bindings
                    .iter()
                    .any(|b| !b.inherited && b.value == child)
        }
        Expr::Let(l) => {
            l.body == child
                || l.bindings
                    .iter()
                    .any(|b| !b.inherited && b.value == child)
        }
        Expr::With(w) => w.body == child,
        Expr::Lambda(l) => l.body == child,
        _ => false,
    }
}

/// Find the scope-introducing ancestor that binds `var_id`, by walking
/// the parent map and counting env-creating ancestors until the
/// variable's static `level` is reached.
///
/// Returns `None` for `with`-bound variables (dynamic scope is not
/// statically answerable) and for builtins.
pub fn search_env_expr(ast: &Ast, var_id: ExprId, parents: &ParentMap) -> Option<ExprId> {
    let var = match ast.expr(var_id) {
        Expr::Var(v) => v,
        _ => return None,
    };
    if var.from_with || var.level == BUILTIN_LEVEL {
        return None;
    }

    let mut level = var.level;
    let mut child = var_id;
    while let Some(&parent) = parents.get(&child) {
        if creates_env(ast, parent, child) {
            if level == 0 {
                return Some(parent);
            }
            level -= 1;
        }
        child = parent;
    }
    None
}

/// Position of the name bound at displacement `displ` inside a
/// scope-introducing node.
pub fn displ_pos(ast: &Ast, scope: ExprId, displ: u32) -> Option<PosIdx> {
    match ast.expr(scope) {
        Expr::Attrs(a) if a.rec => a.bindings.get(displ as usize).map(|b| b.name_pos),
        Expr::Let(l) => l.bindings.get(displ as usize).map(|b| b.name_pos),
        Expr::Lambda(l) => {
            let mut displ = displ as usize;
            if let Some((_, pos)) = l.arg {
                if displ == 0 {
                    return Some(pos);
                }
                displ -= 1;
            }
            l.formals
                .as_ref()
                .and_then(|f| f.formals.get(displ))
                .map(|f| f.pos)
        }
        _ => None,
    }
}

/// Names bound by a scope-introducing node, in displacement order.
pub fn scope_names(ast: &Ast, scope: ExprId) -> Vec<Sym> {
    match ast.expr(scope) {
        Expr::Attrs(a) if a.rec => a.bindings.iter().map(|b| b.name).collect(),
        Expr::Let(l) => l.bindings.iter().map(|b| b.name).collect(),
        Expr::Lambda(l) => {
            let mut names = Vec::new();
            if let Some((arg, _)) = l.arg {
                names.push(arg);
            }
            if let Some(formals) = &l.formals {
                names.extend(formals.formals.iter().map(|f| f.name));
            }
            names
        }
        _ => Vec::new(),
    }
}

/// The source position of the definition of `var_id`, for statically
/// bound variables.
pub fn search_definition(ast: &Ast, var_id: ExprId, parents: &ParentMap) -> Option<PosIdx> {
    let scope = search_env_expr(ast, var_id, parents)?;
    let var = match ast.expr(var_id) {
        Expr::Var(v) => v,
        _ => return None,
    };
    displ_pos(ast, scope, var.displ)
}

/// Collect every statically visible name at `expr`, innermost scope
/// first. Duplicates (shadowed names) are kept.
pub fn collect_symbols(ast: &Ast, expr: ExprId, parents: &ParentMap, out: &mut Vec<Sym>) {
    let mut child = expr;
    while let Some(&parent) = parents.get(&child) {
        if creates_env(ast, parent, child) {
            out.extend(scope_names(ast, parent));
        }
        child = parent;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixd_core::Pos;

    fn parse(src: &str) -> Ast {
        nixd_parser::parse(src).ast
    }

    fn var_named(ast: &Ast, name: &str, col: u32) -> ExprId {
        ast.ids()
            .find(|&id| match ast.expr(id) {
                Expr::Var(v) => {
                    ast.name(v.name) == name
                        && ast.positions.get(v.pos).is_some_and(|p| p.col == col)
                }
                _ => false,
            })
            .unwrap_or_else(|| panic!("no Var `{name}` at col {col}"))
    }

    // ── Parent map invariants ────────────────────────────────────

    #[test]
    fn every_non_root_reachable_node_has_a_parent() {
        let ast = parse("let f = x: x + 1; in f { a = [ 1 2 ]; }");
        let parents = parent_map(&ast);

        let mut stack = vec![ast.root()];
        let mut reachable = Vec::new();
        while let Some(id) = stack.pop() {
            reachable.push(id);
            stack.extend(children(&ast, id));
        }
        for &id in &reachable {
            if id == ast.root() {
                assert!(!parents.contains_key(&id), "root must not have a parent");
            } else {
                assert!(parents.contains_key(&id), "{id:?} must have a parent");
            }
        }
    }

    #[test]
    fn parent_map_is_acyclic() {
        let ast = parse("rec { a = { b = a; }; }");
        let parents = parent_map(&ast);
        for &start in parents.keys() {
            let mut seen = std::collections::HashSet::new();
            let mut cur = start;
            while let Some(&p) = parents.get(&cur) {
                assert!(seen.insert(cur), "cycle through {cur:?}");
                assert_ne!(p, start, "{start:?} is its own ancestor");
                cur = p;
            }
        }
    }

    // ── creates_env policy ───────────────────────────────────────

    #[test]
    fn creates_env_implies_syntactic_child() {
        let ast = parse("let a = 1; in rec { b = a; c = with { }; b; }");
        let parents = parent_map(&ast);
        for parent in ast.ids() {
            for child in ast.ids() {
                if creates_env(&ast, parent, child) {
                    assert_eq!(
                        parents.get(&child),
                        Some(&parent),
                        "creates_env must imply parenthood"
                    );
                }
            }
        }
    }

    #[test]
    fn non_rec_attrs_never_create_env() {
        let ast = parse("{ a = 1; b = 2; }");
        let root = ast.root();
        for child in children(&ast, root) {
            assert!(!creates_env(&ast, root, child));
        }
    }

    #[test]
    fn with_creates_env_for_body_only() {
        let ast = parse("with { a = 1; }; a");
        let root = ast.root();
        let (env, body) = match ast.expr(root) {
            Expr::With(w) => (w.env, w.body),
            _ => panic!("expected With"),
        };
        assert!(!creates_env(&ast, root, env));
        assert!(creates_env(&ast, root, body));
    }

    // ── Definition search ────────────────────────────────────────

    #[test]
    fn let_definition_resolves_to_binding_name() {
        // S1: `let x = 1; in x` — the use at col 15 defines at col 5.
        let ast = parse("let x = 1; in x");
        let parents = parent_map(&ast);
        let var = var_named(&ast, "x", 15);
        let def = search_definition(&ast, var, &parents).expect("definition");
        assert_eq!(ast.positions.get(def), Some(Pos { line: 1, col: 5 }));
    }

    #[test]
    fn definition_crosses_scopes() {
        let ast = parse("let a = 1; in x: a + x");
        let parents = parent_map(&ast);
        let a_use = var_named(&ast, "a", 18);
        let def = search_definition(&ast, a_use, &parents).expect("definition");
        assert_eq!(ast.positions.get(def), Some(Pos { line: 1, col: 5 }));

        let x_use = var_named(&ast, "x", 22);
        let def = search_definition(&ast, x_use, &parents).expect("definition");
        assert_eq!(ast.positions.get(def), Some(Pos { line: 1, col: 15 }));
    }

    #[test]
    fn scope_ancestor_matches_static_level() {
        // Invariant 2: the found scope is the env-creating ancestor at
        // depth `level`.
        let ast = parse("let a = 1; in x: y: a");
        let parents = parent_map(&ast);
        let a_use = var_named(&ast, "a", 21);
        let scope = search_env_expr(&ast, a_use, &parents).expect("scope");
        assert!(matches!(ast.expr(scope), Expr::Let(_)));
    }

    #[test]
    fn with_bound_variables_are_unresolved() {
        let ast = parse("with { a = 1; }; a");
        let parents = parent_map(&ast);
        let a_use = var_named(&ast, "a", 18);
        assert!(search_env_expr(&ast, a_use, &parents).is_none());
        assert!(search_definition(&ast, a_use, &parents).is_none());
    }

    #[test]
    fn builtins_are_unresolved() {
        let ast = parse("true");
        let parents = parent_map(&ast);
        let v = var_named(&ast, "true", 1);
        assert!(search_definition(&ast, v, &parents).is_none());
    }

    #[test]
    fn rec_attr_definition() {
        let ast = parse("rec { a = 1; b = a; }");
        let parents = parent_map(&ast);
        let a_use = var_named(&ast, "a", 18);
        let def = search_definition(&ast, a_use, &parents).expect("definition");
        assert_eq!(ast.positions.get(def), Some(Pos { line: 1, col: 7 }));
    }

    #[test]
    fn lambda_formal_definition() {
        let ast = parse("{ x, y ? 1 }: y");
        let parents = parent_map(&ast);
        let y_use = var_named(&ast, "y", 15);
        let def = search_definition(&ast, y_use, &parents).expect("definition");
        assert_eq!(ast.positions.get(def), Some(Pos { line: 1, col: 6 }));
    }

    // ── collect_symbols ──────────────────────────────────────────

    #[test]
    fn collects_innermost_first_with_duplicates() {
        let ast = parse("let a = 1; b = 2; in x: let a = 3; in a");
        let parents = parent_map(&ast);
        let a_use = var_named(&ast, "a", 39);
        let mut out = Vec::new();
        collect_symbols(&ast, a_use, &parents, &mut out);
        let names: Vec<&str> = out.iter().map(|&s| ast.name(s)).collect();
        // Inner let first, then the lambda, then the outer let.
        // `a` appears twice (shadowed, duplicates allowed).
        assert_eq!(names, vec!["a", "x", "a", "b"]);
    }

    #[test]
    fn collect_at_top_level_is_empty() {
        let ast = parse("1 + 2");
        let parents = parent_map(&ast);
        let root = ast.root();
        let mut out = Vec::new();
        collect_symbols(&ast, root, &parents, &mut out);
        assert!(out.is_empty());
    }
}
