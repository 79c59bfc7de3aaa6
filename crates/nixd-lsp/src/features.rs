//! Static language features computed from the cached AST alone:
//! document symbols, document links, definition, rename and the
//! completion-context classifier. No evaluation happens here.

use std::collections::HashMap;
use std::path::Path;

use nixd_core::{Ast, Expr, ExprId, Pos, PosIdx, Sym, BUILTIN_LEVEL};
use tower_lsp::lsp_types::*;

use crate::helpers::{name_range, pos_to_position, position_to_pos};
use crate::scope::{collect_symbols, displ_pos, parent_map, search_definition, search_env_expr};
use crate::visitor::children;

// ── Extents ──────────────────────────────────────────────────────

/// Source extents per node: `(start, end)` with an exclusive end.
/// Approximate at the token level (closing delimiters are not tracked),
/// which is precise enough for cursor resolution.
pub struct Extents {
    map: HashMap<ExprId, (Pos, Pos)>,
}

impl Extents {
    pub fn get(&self, id: ExprId) -> Option<(Pos, Pos)> {
        self.map.get(&id).copied()
    }

    pub fn contains(&self, id: ExprId, pos: Pos) -> bool {
        self.map
            .get(&id)
            .is_some_and(|&(start, end)| contains(start, end, pos))
    }

    pub fn range(&self, id: ExprId) -> Option<Range> {
        self.get(id).map(|(start, end)| Range {
            start: pos_to_position(start),
            end: pos_to_position(end),
        })
    }
}

fn contains(start: Pos, end: Pos, pos: Pos) -> bool {
    (start.line, start.col) <= (pos.line, pos.col) && (pos.line, pos.col) < (end.line, end.col)
}

fn span_of(pos: Pos, len: usize) -> (Pos, Pos) {
    (
        pos,
        Pos {
            line: pos.line,
            col: pos.col + len as u32,
        },
    )
}

pub fn extents(ast: &Ast) -> Extents {
    let mut map = HashMap::new();
    compute_extent(ast, ast.root(), &mut map);
    Extents { map }
}

fn compute_extent(
    ast: &Ast,
    id: ExprId,
    map: &mut HashMap<ExprId, (Pos, Pos)>,
) -> Option<(Pos, Pos)> {
    let mut acc: Option<(Pos, Pos)> = None;
    let mut grow = |span: Option<(Pos, Pos)>| {
        if let Some((s, e)) = span {
            acc = Some(match acc {
                None => (s, e),
                Some((as_, ae)) => (
                    if (s.line, s.col) < (as_.line, as_.col) {
                        s
                    } else {
                        as_
                    },
                    if (e.line, e.col) > (ae.line, ae.col) {
                        e
                    } else {
                        ae
                    },
                ),
            });
        }
    };

    // Anchor token.
    let expr = ast.expr(id);
    let anchor_len = match expr {
        Expr::Var(v) => ast.name(v.name).len(),
        Expr::Int(n, _) => n.to_string().len(),
        Expr::Float(x, _) => x.to_string().len(),
        Expr::Str(s, _) => s.chars().count() + 2,
        Expr::Path(p, _) => p.len(),
        Expr::Attrs(a) if a.rec => 3,
        Expr::Let(_) => 3,
        Expr::With(_) => 4,
        Expr::If(_) => 2,
        Expr::Assert(_) => 6,
        _ => 1,
    };
    grow(ast.positions.get(expr.pos()).map(|p| span_of(p, anchor_len)));

    // Name tokens owned by this node.
    let name_span = |sym: Sym, pos: PosIdx| {
        ast.positions
            .get(pos)
            .map(|p| span_of(p, ast.name(sym).len()))
    };
    match expr {
        Expr::Attrs(a) => {
            for b in &a.bindings {
                grow(name_span(b.name, b.name_pos));
            }
        }
        Expr::Let(l) => {
            for b in &l.bindings {
                grow(name_span(b.name, b.name_pos));
            }
        }
        Expr::Lambda(l) => {
            if let Some((arg, pos)) = l.arg {
                grow(name_span(arg, pos));
            }
            if let Some(formals) = &l.formals {
                for f in &formals.formals {
                    grow(name_span(f.name, f.pos));
                }
            }
        }
        Expr::Select(s) => {
            for attr in &s.path {
                grow(name_span(attr.sym, attr.pos));
            }
        }
        Expr::HasAttr(h) => {
            for attr in &h.path {
                grow(name_span(attr.sym, attr.pos));
            }
        }
        _ => {}
    }

    for child in children(ast, id) {
        let span = compute_extent(ast, child, map);
        grow(span);
    }

    if let Some(span) = acc {
        map.insert(id, span);
    }
    acc
}

/// Every node whose extent contains `pos`, innermost (narrowest) first;
/// the later start (deeper node) wins width ties.
pub fn nodes_at(ast: &Ast, ext: &Extents, pos: Pos) -> Vec<ExprId> {
    let mut hits: Vec<(ExprId, (Pos, Pos))> = ast
        .ids()
        .filter_map(|id| ext.get(id).map(|span| (id, span)))
        .filter(|&(_, (start, end))| contains(start, end, pos))
        .collect();
    hits.sort_by_key(|&(_, (start, end))| {
        (
            end.line - start.line,
            end.col as i64 - start.col as i64,
            std::cmp::Reverse((start.line, start.col)),
        )
    });
    hits.into_iter().map(|(id, _)| id).collect()
}

/// Innermost node whose extent contains `pos`.
pub fn node_at(ast: &Ast, ext: &Extents, pos: Pos) -> Option<ExprId> {
    nodes_at(ast, ext, pos).into_iter().next()
}

// ── Cursor identifiers ───────────────────────────────────────────

/// What identifier the cursor is on.
pub enum Ident {
    /// A variable reference.
    Var(ExprId),
    /// A name bound by a scope-introducing node (`rec` attrs, `let`,
    /// lambda arg/formals).
    Binder {
        scope: ExprId,
        displ: u32,
        name: Sym,
        pos: PosIdx,
    },
}

/// Find the variable or binder name under the cursor.
pub fn ident_at(ast: &Ast, pos: Pos) -> Option<Ident> {
    let on_name = |sym: Sym, name_pos: PosIdx| {
        ast.positions.get(name_pos).is_some_and(|p| {
            let (start, end) = span_of(p, ast.name(sym).len());
            contains(start, end, pos)
        })
    };

    for id in ast.ids() {
        match ast.expr(id) {
            Expr::Var(v) => {
                if on_name(v.name, v.pos) {
                    return Some(Ident::Var(id));
                }
            }
            Expr::Attrs(a) if a.rec => {
                for (i, b) in a.bindings.iter().enumerate() {
                    if on_name(b.name, b.name_pos) {
                        return Some(Ident::Binder {
                            scope: id,
                            displ: i as u32,
                            name: b.name,
                            pos: b.name_pos,
                        });
                    }
                }
            }
            Expr::Let(l) => {
                for (i, b) in l.bindings.iter().enumerate() {
                    if on_name(b.name, b.name_pos) {
                        return Some(Ident::Binder {
                            scope: id,
                            displ: i as u32,
                            name: b.name,
                            pos: b.name_pos,
                        });
                    }
                }
            }
            Expr::Lambda(l) => {
                let mut displ = 0u32;
                if let Some((arg, arg_pos)) = l.arg {
                    if on_name(arg, arg_pos) {
                        return Some(Ident::Binder {
                            scope: id,
                            displ,
                            name: arg,
                            pos: arg_pos,
                        });
                    }
                    displ += 1;
                }
                if let Some(formals) = &l.formals {
                    for f in &formals.formals {
                        if on_name(f.name, f.pos) {
                            return Some(Ident::Binder {
                                scope: id,
                                displ,
                                name: f.name,
                                pos: f.pos,
                            });
                        }
                        displ += 1;
                    }
                }
            }
            _ => {}
        }
    }
    None
}

/// Is the cursor on any attribute key (including non-recursive sets,
/// where the key is not a binder)?
fn on_attr_key(ast: &Ast, pos: Pos) -> bool {
    for id in ast.ids() {
        let bindings = match ast.expr(id) {
            Expr::Attrs(a) => &a.bindings,
            Expr::Let(l) => &l.bindings,
            _ => continue,
        };
        for b in bindings {
            if let Some(p) = ast.positions.get(b.name_pos) {
                let (start, end) = span_of(p, ast.name(b.name).len());
                if contains(start, end, pos) {
                    return true;
                }
            }
        }
    }
    false
}

// ── Completion context (C8 classifier) ───────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionContext {
    /// Cursor on an attribute key or inside a lambda parameter list.
    AttrName,
    /// Cursor in an expression position.
    Value,
    Unknown,
}

pub fn completion_context(ast: &Ast, position: Position) -> CompletionContext {
    let pos = position_to_pos(position);
    if on_attr_key(ast, pos) {
        return CompletionContext::AttrName;
    }
    if let Some(Ident::Binder { scope, .. }) = ident_at(ast, pos) {
        if matches!(ast.expr(scope), Expr::Lambda(_)) {
            return CompletionContext::AttrName;
        }
    }
    let ext = extents(ast);
    match node_at(ast, &ext, pos) {
        Some(id) => match ast.expr(id) {
            Expr::Error(_) => CompletionContext::Unknown,
            _ => CompletionContext::Value,
        },
        None => CompletionContext::Unknown,
    }
}

// ── Document symbols ─────────────────────────────────────────────

pub fn document_symbols(ast: &Ast) -> Vec<DocumentSymbol> {
    let ext = extents(ast);
    symbols_of(ast, &ext, ast.root())
}

fn symbols_of(ast: &Ast, ext: &Extents, id: ExprId) -> Vec<DocumentSymbol> {
    let earlier = |a: Position, b: Position| if (a.line, a.character) <= (b.line, b.character) { a } else { b };
    let later = |a: Position, b: Position| if (a.line, a.character) >= (b.line, b.character) { a } else { b };
    let binding_symbol = |name: Sym, name_pos: PosIdx, value: ExprId, kind: SymbolKind| {
        let selection = name_range(ast.positions.get(name_pos)?, ast.name(name).len());
        let range = ext
            .range(value)
            .map(|r| Range {
                start: earlier(selection.start, r.start),
                end: later(selection.end, r.end),
            })
            .unwrap_or(selection);
        #[allow(deprecated)]
        Some(DocumentSymbol {
            name: ast.name(name).to_string(),
            detail: None,
            kind,
            tags: None,
            deprecated: None,
            range,
            selection_range: selection,
            children: Some(symbols_of(ast, ext, value)),
        })
    };

    match ast.expr(id) {
        Expr::Attrs(a) => a
            .bindings
            .iter()
            .filter_map(|b| binding_symbol(b.name, b.name_pos, b.value, SymbolKind::FIELD))
            .collect(),
        Expr::Let(l) => {
            let mut out: Vec<DocumentSymbol> = l
                .bindings
                .iter()
                .filter_map(|b| binding_symbol(b.name, b.name_pos, b.value, SymbolKind::VARIABLE))
                .collect();
            out.extend(symbols_of(ast, ext, l.body));
            out
        }
        Expr::Lambda(l) => {
            let mut out = Vec::new();
            if let Some((arg, pos)) = l.arg {
                if let Some(p) = ast.positions.get(pos) {
                    let selection = name_range(p, ast.name(arg).len());
                    #[allow(deprecated)]
                    out.push(DocumentSymbol {
                        name: ast.name(arg).to_string(),
                        detail: None,
                        kind: SymbolKind::VARIABLE,
                        tags: None,
                        deprecated: None,
                        range: selection,
                        selection_range: selection,
                        children: None,
                    });
                }
            }
            if let Some(formals) = &l.formals {
                for f in &formals.formals {
                    if let Some(p) = ast.positions.get(f.pos) {
                        let selection = name_range(p, ast.name(f.name).len());
                        #[allow(deprecated)]
                        out.push(DocumentSymbol {
                            name: ast.name(f.name).to_string(),
                            detail: None,
                            kind: SymbolKind::VARIABLE,
                            tags: None,
                            deprecated: None,
                            range: selection,
                            selection_range: selection,
                            children: None,
                        });
                    }
                }
            }
            out.extend(symbols_of(ast, ext, l.body));
            out
        }
        _ => children(ast, id)
            .into_iter()
            .flat_map(|c| symbols_of(ast, ext, c))
            .collect(),
    }
}

// ── Document links ───────────────────────────────────────────────

pub fn document_links(ast: &Ast, file: &Path) -> Vec<DocumentLink> {
    let mut links = Vec::new();
    for id in ast.ids() {
        match ast.expr(id) {
            Expr::Path(p, pos_idx) => {
                let Some(pos) = ast.positions.get(*pos_idx) else {
                    continue;
                };
                let resolved = if p.starts_with('/') {
                    std::path::PathBuf::from(p)
                } else if let Some(dir) = file.parent() {
                    dir.join(p.strip_prefix("./").unwrap_or(p))
                } else {
                    continue;
                };
                if let Ok(target) = Url::from_file_path(&resolved) {
                    links.push(DocumentLink {
                        range: name_range(pos, p.len()),
                        target: Some(target),
                        tooltip: None,
                        data: None,
                    });
                }
            }
            Expr::Str(s, pos_idx) => {
                if !(s.starts_with("http://") || s.starts_with("https://")) {
                    continue;
                }
                let Some(pos) = ast.positions.get(*pos_idx) else {
                    continue;
                };
                if let Ok(target) = Url::parse(s) {
                    links.push(DocumentLink {
                        range: name_range(pos, s.chars().count() + 2),
                        target: Some(target),
                        tooltip: None,
                        data: None,
                    });
                }
            }
            _ => {}
        }
    }
    links
}

// ── Definition (static fallback) ─────────────────────────────────

pub fn definition(ast: &Ast, position: Position) -> Option<Range> {
    let pos = position_to_pos(position);
    let parents = parent_map(ast);
    match ident_at(ast, pos)? {
        Ident::Var(var_id) => {
            let def = search_definition(ast, var_id, &parents)?;
            let name = match ast.expr(var_id) {
                Expr::Var(v) => v.name,
                _ => return None,
            };
            Some(name_range(ast.positions.get(def)?, ast.name(name).len()))
        }
        Ident::Binder { name, pos, .. } => {
            Some(name_range(ast.positions.get(pos)?, ast.name(name).len()))
        }
    }
}

// ── Rename ───────────────────────────────────────────────────────

/// Compute rename edits for the identifier at `position`. `None` when
/// the cursor is not on a renameable identifier (unbound names,
/// `with`-bound names and plain attribute keys are not renameable).
pub fn rename(ast: &Ast, position: Position, new_name: &str) -> Option<Vec<TextEdit>> {
    let pos = position_to_pos(position);
    let parents = parent_map(ast);

    let (scope, displ, name) = match ident_at(ast, pos)? {
        Ident::Var(var_id) => {
            let var = match ast.expr(var_id) {
                Expr::Var(v) => v,
                _ => return None,
            };
            if var.from_with || var.level == BUILTIN_LEVEL {
                return None;
            }
            let scope = search_env_expr(ast, var_id, &parents)?;
            (scope, var.displ, var.name)
        }
        Ident::Binder {
            scope,
            displ,
            name,
            ..
        } => (scope, displ, name),
    };

    let mut edits = Vec::new();

    // The definition site.
    let def = displ_pos(ast, scope, displ)?;
    edits.push(TextEdit {
        range: name_range(ast.positions.get(def)?, ast.name(name).len()),
        new_text: new_name.to_string(),
    });

    // Every reference that resolves to the same binder.
    for id in ast.ids() {
        if let Expr::Var(v) = ast.expr(id) {
            if v.name != name || v.from_with || v.level == BUILTIN_LEVEL {
                continue;
            }
            if search_env_expr(ast, id, &parents) == Some(scope) && v.displ == displ {
                if let Some(p) = ast.positions.get(v.pos) {
                    edits.push(TextEdit {
                        range: name_range(p, ast.name(name).len()),
                        new_text: new_name.to_string(),
                    });
                }
            }
        }
    }

    edits.sort_by_key(|e| (e.range.start.line, e.range.start.character));
    edits.dedup_by_key(|e| e.range);
    Some(edits)
}

/// The range of the identifier under the cursor, iff rename would
/// produce edits there.
pub fn prepare_rename(ast: &Ast, position: Position) -> Option<Range> {
    let edits = rename(ast, position, "_")?;
    let at = (position.line, position.character);
    edits
        .into_iter()
        .map(|e| e.range)
        .find(|r| (r.start.line, r.start.character) <= at && at <= (r.end.line, r.end.character))
}

// ── Visible symbols (used by worker completion) ──────────────────

/// Names statically visible at `position`, innermost first, deduplicated.
pub fn visible_symbols(ast: &Ast, position: Position) -> Vec<String> {
    let pos = position_to_pos(position);
    let ext = extents(ast);
    let Some(node) = node_at(ast, &ext, pos) else {
        return Vec::new();
    };
    let parents = parent_map(ast);
    let mut syms: Vec<Sym> = Vec::new();
    collect_symbols(ast, node, &parents, &mut syms);

    let mut seen = std::collections::HashSet::new();
    let mut out = Vec::new();
    for sym in syms {
        let name = ast.name(sym).to_string();
        if seen.insert(name.clone()) {
            out.push(name);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(src: &str) -> Ast {
        nixd_parser::parse(src).ast
    }

    fn apply_edits(src: &str, edits: &[TextEdit]) -> String {
        // Single-line sources only; apply back-to-front.
        let mut text = src.to_string();
        let mut sorted: Vec<&TextEdit> = edits.iter().collect();
        sorted.sort_by_key(|e| std::cmp::Reverse(e.range.start.character));
        for e in sorted {
            assert_eq!(e.range.start.line, 0);
            text.replace_range(
                e.range.start.character as usize..e.range.end.character as usize,
                &e.new_text,
            );
        }
        text
    }

    // ── Definition ───────────────────────────────────────────────

    #[test]
    fn static_definition_of_let_binding() {
        // `let x = 1; in x` — cursor on the trailing x (LSP col 14).
        let ast = parse("let x = 1; in x");
        let range = definition(&ast, Position::new(0, 14)).expect("definition");
        assert_eq!(range.start, Position::new(0, 4));
        assert_eq!(range.end, Position::new(0, 5));
    }

    #[test]
    fn definition_of_with_variable_is_unresolved() {
        let ast = parse("with { a = 1; }; a");
        assert!(definition(&ast, Position::new(0, 17)).is_none());
    }

    // ── Rename (S2 + idempotence law) ────────────────────────────

    #[test]
    fn rename_let_binding_edits_def_and_refs() {
        let src = "let a = 1; in { b = a; }";
        let ast = parse(src);
        // Cursor on the binding name `a` (LSP col 4).
        let edits = rename(&ast, Position::new(0, 4), "z").expect("edits");
        assert_eq!(edits.len(), 2);
        assert_eq!(apply_edits(src, &edits), "let z = 1; in { b = z; }");
    }

    #[test]
    fn rename_from_reference_site() {
        let src = "let a = 1; in { b = a; }";
        let ast = parse(src);
        // Cursor on the use of `a` inside the attrset (LSP col 20).
        let edits = rename(&ast, Position::new(0, 20), "z").expect("edits");
        assert_eq!(apply_edits(src, &edits), "let z = 1; in { b = z; }");
    }

    #[test]
    fn rename_is_idempotent_under_inverse() {
        let src = "let a = 1; in a + a";
        let ast = parse(src);
        let forward = rename(&ast, Position::new(0, 4), "y").expect("edits");
        let renamed = apply_edits(src, &forward);
        assert_eq!(renamed, "let y = 1; in y + y");

        let ast2 = parse(&renamed);
        let back = rename(&ast2, Position::new(0, 4), "a").expect("edits");
        assert_eq!(apply_edits(&renamed, &back), src);
    }

    #[test]
    fn rename_does_not_touch_shadowing_scopes() {
        let src = "let a = 1; in x: let a = 2; in a";
        let ast = parse(src);
        // Rename the OUTER `a`: the inner let and its use must not change.
        let edits = rename(&ast, Position::new(0, 4), "q").expect("edits");
        assert_eq!(apply_edits(src, &edits), "let q = 1; in x: let a = 2; in a");
    }

    #[test]
    fn rename_lambda_formal() {
        let src = "{ x, y }: x + y";
        let ast = parse(src);
        let edits = rename(&ast, Position::new(0, 2), "n").expect("edits");
        assert_eq!(apply_edits(src, &edits), "{ n, y }: n + y");
    }

    #[test]
    fn rename_refuses_with_bound_and_plain_keys() {
        let ast = parse("with { a = 1; }; a");
        assert!(rename(&ast, Position::new(0, 17), "z").is_none());

        // Plain (non-rec) attribute keys are not renameable.
        let ast = parse("{ a = 1; }");
        assert!(rename(&ast, Position::new(0, 2), "z").is_none());
    }

    #[test]
    fn prepare_rename_returns_cursor_identifier_range() {
        let src = "let a = 1; in { b = a; }";
        let ast = parse(src);
        let range = prepare_rename(&ast, Position::new(0, 20)).expect("range");
        assert_eq!(range.start, Position::new(0, 20));
        assert_eq!(range.end, Position::new(0, 21));
    }

    #[test]
    fn prepare_rename_declines_off_identifier() {
        let ast = parse("let a = 1; in a");
        assert!(prepare_rename(&ast, Position::new(0, 6)).is_none());
    }

    // ── Completion context ───────────────────────────────────────

    #[test]
    fn context_on_attr_key_is_attr_name() {
        let ast = parse("{ abc = 1; }");
        assert_eq!(
            completion_context(&ast, Position::new(0, 3)),
            CompletionContext::AttrName
        );
    }

    #[test]
    fn context_in_value_is_value() {
        let ast = parse("{ abc = def; }");
        let col = 9; // inside `def`
        assert_eq!(
            completion_context(&ast, Position::new(0, col)),
            CompletionContext::Value
        );
    }

    #[test]
    fn context_in_formals_is_attr_name() {
        let ast = parse("{ alpha, beta }: alpha");
        assert_eq!(
            completion_context(&ast, Position::new(0, 3)),
            CompletionContext::AttrName
        );
    }

    #[test]
    fn context_after_trailing_dot_is_unknown() {
        // `pkgs.` parses with recovery; the cursor after the dot sits in
        // no node extent.
        let result = nixd_parser::parse("pkgs.");
        assert_eq!(
            completion_context(&result.ast, Position::new(0, 5)),
            CompletionContext::Unknown
        );
    }

    // ── Symbols and links ────────────────────────────────────────

    #[test]
    fn document_symbols_are_hierarchical() {
        let ast = parse("{ outer = { inner = 1; }; flat = 2; }");
        let symbols = document_symbols(&ast);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, "outer");
        assert_eq!(symbols[0].kind, SymbolKind::FIELD);
        let inner = symbols[0].children.as_ref().unwrap();
        assert_eq!(inner.len(), 1);
        assert_eq!(inner[0].name, "inner");
        assert_eq!(symbols[1].name, "flat");
    }

    #[test]
    fn let_bindings_are_variable_symbols() {
        let ast = parse("let x = 1; in { y = x; }");
        let symbols = document_symbols(&ast);
        assert_eq!(symbols[0].name, "x");
        assert_eq!(symbols[0].kind, SymbolKind::VARIABLE);
        assert_eq!(symbols[1].name, "y");
        assert_eq!(symbols[1].kind, SymbolKind::FIELD);
    }

    #[test]
    fn document_links_cover_paths_and_urls() {
        let ast = parse("{ src = ./lib.nix; page = \"https://example.org/x\"; }");
        let links = document_links(&ast, Path::new("/ws/default.nix"));
        assert_eq!(links.len(), 2);
        let targets: Vec<String> = links
            .iter()
            .map(|l| l.target.as_ref().unwrap().to_string())
            .collect();
        assert!(targets.iter().any(|t| t.ends_with("/ws/lib.nix")));
        assert!(targets.iter().any(|t| t == "https://example.org/x"));
    }

    #[test]
    fn relative_links_resolve_against_the_document() {
        let ast = parse("import ../common.nix");
        let links = document_links(&ast, Path::new("/ws/sub/mod.nix"));
        assert_eq!(links.len(), 1);
        let target = links[0].target.as_ref().unwrap().path();
        assert!(target.ends_with("common.nix"), "got {target}");
    }

    // ── Visible symbols ──────────────────────────────────────────

    #[test]
    fn visible_symbols_at_cursor() {
        let ast = parse("let aa = 1; bb = 2; in x: aa");
        // Cursor inside the lambda body.
        let names = visible_symbols(&ast, Position::new(0, 26));
        assert_eq!(names, vec!["x", "aa", "bb"]);
    }
}
