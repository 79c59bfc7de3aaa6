//! Static binder: assigns `level` / `displ` / `from_with` to every `Var`.
//!
//! The binder maintains a scope stack while walking the tree. Each
//! scope-introducing node pushes exactly one entry, so a variable's
//! `level` equals the number of scope entries between the reference and
//! its binder. `with` pushes a dynamic entry: names that stay statically
//! unresolved bind to the innermost `with` (`from_with = true`), but a
//! static binding anywhere further out still wins over a closer `with`.

use std::collections::HashMap;

use nixd_core::{is_builtin, Ast, Binding, Expr, ExprId, NixdError, Sym, BUILTIN_LEVEL};

struct ScopeEntry {
    /// Bound name -> displacement. Empty for `with` entries.
    names: HashMap<Sym, u32>,
    is_with: bool,
}

impl ScopeEntry {
    fn of_bindings(bindings: &[Binding]) -> Self {
        let mut names = HashMap::new();
        for (i, b) in bindings.iter().enumerate() {
            // Keep the first occurrence; duplicates were already reported
            // by the parser.
            names.entry(b.name).or_insert(i as u32);
        }
        ScopeEntry {
            names,
            is_with: false,
        }
    }

    fn with() -> Self {
        ScopeEntry {
            names: HashMap::new(),
            is_with: true,
        }
    }
}

pub(crate) fn bind(ast: &mut Ast, errors: &mut Vec<NixdError>) {
    let root = ast.root();
    let mut scopes = Vec::new();
    walk(ast, root, &mut scopes, errors);
}

fn walk(ast: &mut Ast, id: ExprId, scopes: &mut Vec<ScopeEntry>, errors: &mut Vec<NixdError>) {
    let expr = ast.expr(id).clone();
    match expr {
        Expr::Var(v) => resolve_var(ast, id, v.name, scopes, errors),

        Expr::Int(..) | Expr::Float(..) | Expr::Str(..) | Expr::Path(..) | Expr::Error(..) => {}

        Expr::List(l) => {
            for item in l.items {
                walk(ast, item, scopes, errors);
            }
        }

        Expr::Attrs(a) => {
            if a.rec {
                // Inherited values look outward, the rest see the rec scope.
                for b in a.bindings.iter().filter(|b| b.inherited) {
                    walk(ast, b.value, scopes, errors);
                }
                scopes.push(ScopeEntry::of_bindings(&a.bindings));
                for b in a.bindings.iter().filter(|b| !b.inherited) {
                    walk(ast, b.value, scopes, errors);
                }
                scopes.pop();
            } else {
                for b in a.bindings {
                    walk(ast, b.value, scopes, errors);
                }
            }
        }

        Expr::Let(l) => {
            for b in l.bindings.iter().filter(|b| b.inherited) {
                walk(ast, b.value, scopes, errors);
            }
            scopes.push(ScopeEntry::of_bindings(&l.bindings));
            for b in l.bindings.iter().filter(|b| !b.inherited) {
                walk(ast, b.value, scopes, errors);
            }
            walk(ast, l.body, scopes, errors);
            scopes.pop();
        }

        Expr::With(w) => {
            walk(ast, w.env, scopes, errors);
            scopes.push(ScopeEntry::with());
            walk(ast, w.body, scopes, errors);
            scopes.pop();
        }

        Expr::Lambda(l) => {
            // Formal defaults are resolved outside the lambda scope.
            if let Some(formals) = &l.formals {
                for f in &formals.formals {
                    if let Some(d) = f.default {
                        walk(ast, d, scopes, errors);
                    }
                }
            }
            let mut names = HashMap::new();
            let mut displ = 0u32;
            if let Some((arg, _)) = l.arg {
                names.insert(arg, displ);
                displ += 1;
            }
            if let Some(formals) = &l.formals {
                for f in &formals.formals {
                    names.entry(f.name).or_insert(displ);
                    displ += 1;
                }
            }
            scopes.push(ScopeEntry {
                names,
                is_with: false,
            });
            walk(ast, l.body, scopes, errors);
            scopes.pop();
        }

        Expr::Apply(a) => {
            walk(ast, a.func, scopes, errors);
            walk(ast, a.arg, scopes, errors);
        }

        Expr::Select(s) => {
            walk(ast, s.subject, scopes, errors);
            if let Some(d) = s.or_default {
                walk(ast, d, scopes, errors);
            }
        }

        Expr::HasAttr(h) => walk(ast, h.subject, scopes, errors),

        Expr::If(i) => {
            walk(ast, i.cond, scopes, errors);
            walk(ast, i.then, scopes, errors);
            walk(ast, i.else_, scopes, errors);
        }

        Expr::Assert(a) => {
            walk(ast, a.cond, scopes, errors);
            walk(ast, a.body, scopes, errors);
        }

        Expr::UnaryOp(u) => walk(ast, u.operand, scopes, errors),

        Expr::BinaryOp(b) => {
            walk(ast, b.lhs, scopes, errors);
            walk(ast, b.rhs, scopes, errors);
        }
    }
}

fn resolve_var(
    ast: &mut Ast,
    id: ExprId,
    name: Sym,
    scopes: &[ScopeEntry],
    errors: &mut Vec<NixdError>,
) {
    let mut with_level: Option<u32> = None;
    for (level, entry) in scopes.iter().rev().enumerate() {
        if entry.is_with {
            if with_level.is_none() {
                with_level = Some(level as u32);
            }
            continue;
        }
        if let Some(&displ) = entry.names.get(&name) {
            set_var(ast, id, level as u32, displ, false);
            return;
        }
    }

    if let Some(level) = with_level {
        set_var(ast, id, level, 0, true);
        return;
    }

    if is_builtin(ast.name(name)) {
        set_var(ast, id, BUILTIN_LEVEL, 0, false);
        return;
    }

    let var_name = ast.name(name).to_string();
    let pos = match ast.expr(id) {
        Expr::Var(v) => ast.positions.get(v.pos),
        _ => None,
    };
    errors.push(NixdError::Undefined {
        name: var_name,
        pos: pos.into(),
    });
    // Treat like a builtin so downstream consumers see a settled node.
    set_var(ast, id, BUILTIN_LEVEL, 0, false);
}

fn set_var(ast: &mut Ast, id: ExprId, level: u32, displ: u32, from_with: bool) {
    if let Expr::Var(v) = ast.expr_mut(id) {
        v.level = level;
        v.displ = displ;
        v.from_with = from_with;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse;

    /// Find the `Var` named `name` at the given 1-indexed column on line 1.
    fn var_at(ast: &Ast, name: &str, col: u32) -> (u32, u32, bool) {
        for id in ast.ids() {
            if let Expr::Var(v) = ast.expr(id) {
                let pos = ast.positions.get(v.pos);
                if ast.name(v.name) == name && pos.is_some_and(|p| p.line == 1 && p.col == col) {
                    return (v.level, v.displ, v.from_with);
                }
            }
        }
        panic!("no Var `{name}` at column {col}");
    }

    #[test]
    fn let_binds_at_level_zero() {
        // let x = 1; in x
        //     4         15
        let result = parse("let x = 1; in x");
        assert!(result.errors.is_empty());
        assert_eq!(var_at(&result.ast, "x", 15), (0, 0, false));
    }

    #[test]
    fn displacement_follows_source_order() {
        let result = parse("let a = 1; b = 2; in b");
        assert!(result.errors.is_empty());
        assert_eq!(var_at(&result.ast, "b", 22), (0, 1, false));
    }

    #[test]
    fn nested_scopes_increase_level() {
        // The inner lambda body referencing the outer let binding
        // crosses the lambda scope: level 1.
        let result = parse("let a = 1; in x: a");
        assert!(result.errors.is_empty());
        assert_eq!(var_at(&result.ast, "a", 18), (1, 0, false));
    }

    #[test]
    fn lambda_arg_and_formals_displacements() {
        let result = parse("args@{ x, y ? 1 }: y");
        assert!(result.errors.is_empty());
        // arg occupies displacement 0, formals follow in source order.
        assert_eq!(var_at(&result.ast, "y", 20), (0, 2, false));
    }

    #[test]
    fn rec_attrs_bind_their_values() {
        let result = parse("rec { a = 1; b = a; }");
        assert!(result.errors.is_empty());
        assert_eq!(var_at(&result.ast, "a", 18), (0, 0, false));
    }

    #[test]
    fn non_rec_attrs_do_not_bind() {
        let result = parse("{ a = 1; b = a; }");
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].to_string().contains("undefined variable `a`"));
    }

    #[test]
    fn with_marks_dynamic_variables() {
        let result = parse("with { q = 1; }; q");
        assert!(result.errors.is_empty());
        let (level, _, from_with) = var_at(&result.ast, "q", 18);
        assert!(from_with);
        assert_eq!(level, 0);
    }

    #[test]
    fn static_binding_wins_over_closer_with() {
        // `a` is let-bound outside the with; the with must not capture it.
        let result = parse("let a = 1; in with { a = 2; }; a");
        assert!(result.errors.is_empty());
        let (level, displ, from_with) = var_at(&result.ast, "a", 32);
        assert!(!from_with);
        assert_eq!((level, displ), (1, 0));
    }

    #[test]
    fn builtins_resolve_without_errors() {
        let result = parse("if true then null else builtins");
        assert!(result.errors.is_empty());
        let (level, _, from_with) = var_at(&result.ast, "true", 4);
        assert_eq!(level, BUILTIN_LEVEL);
        assert!(!from_with);
    }

    #[test]
    fn inherited_rec_binding_resolves_outward() {
        // `inherit a;` inside the rec set must take the let-bound `a`,
        // not the rec attribute it defines.
        let result = parse("let a = 1; in rec { inherit a; b = a; }");
        assert!(result.errors.is_empty());
        // The desugared inherit var at col 29 resolves to the let (level 0
        // from its own position: outside the rec scope).
        assert_eq!(var_at(&result.ast, "a", 29), (0, 0, false));
        // `b = a` resolves to the rec scope's `a` (displacement 0).
        assert_eq!(var_at(&result.ast, "a", 36), (0, 0, false));
    }

    #[test]
    fn undefined_variable_reports_position() {
        let result = parse("nope");
        assert_eq!(result.errors.len(), 1);
        let msg = result.errors[0].to_string();
        assert!(msg.contains("undefined variable `nope`"));
        assert!(msg.contains("1:1"));
    }

    #[test]
    fn formal_defaults_resolve_outside_the_lambda() {
        // `d` in the default refers to the let binding, not to a formal.
        let result = parse("let d = 1; in { x ? d }: x");
        assert!(result.errors.is_empty());
        assert_eq!(var_at(&result.ast, "d", 21), (0, 0, false));
    }
}
