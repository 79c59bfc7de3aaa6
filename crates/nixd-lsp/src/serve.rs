//! Worker-side main loops.
//!
//! A worker is this binary respawned with `--eval-worker` or
//! `--option-worker`: it reads LSP-framed JSON-RPC from stdin, is seeded
//! with the configuration and the open drafts, and then serves the
//! `nixd/ipc/*` requests. Evaluator workers parse and evaluate every
//! seeded draft up front and report diagnostics; option workers evaluate
//! the configured options file and answer attribute-path lookups.
//!
//! Everything runs on the main task (values are `Rc`-based), so handlers
//! are plain synchronous functions between transport awaits.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tokio::io::{AsyncWrite, BufReader};
use tower_lsp::lsp_types::*;

use nixd_core::{Ast, Expr};
use nixd_eval::{Evaluator, Value};

use crate::config::Config;
use crate::features;
use crate::helpers::{
    attr_path_before, error_diagnostic, name_range, position_to_offset, position_to_pos,
};
use crate::ipc::{self, IpcMessage};
use crate::scope;

pub async fn run_eval_worker(workspace_version: u64) -> i32 {
    run(workspace_version, Kind::Eval).await
}

pub async fn run_option_worker(workspace_version: u64) -> i32 {
    run(workspace_version, Kind::Option).await
}

#[derive(Clone, Copy, PartialEq)]
enum Kind {
    Eval,
    Option,
}

struct WorkerState {
    workspace_version: u64,
    config: Config,
    files: HashMap<PathBuf, Analysis>,
}

async fn run(workspace_version: u64, kind: Kind) -> i32 {
    let mut reader = BufReader::new(tokio::io::stdin());
    let mut stdout = tokio::io::stdout();
    let mut state = WorkerState {
        workspace_version,
        config: Config::default(),
        files: HashMap::new(),
    };
    let mut options: Option<OptionTree> = None;

    loop {
        let text = match ipc::read_message(&mut reader).await {
            Ok(Some(text)) => text,
            Ok(None) => return 0,
            Err(err) => {
                tracing::error!("worker transport error: {err}");
                return 1;
            }
        };
        let msg: IpcMessage = match serde_json::from_str(&text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::warn!("worker: discarding malformed frame: {err}");
                continue;
            }
        };
        let Some(method) = msg.method.clone() else {
            continue;
        };

        match (msg.id, method.as_str()) {
            (None, "workspace/didChangeConfiguration") => {
                if let Some(config) = msg
                    .params
                    .as_ref()
                    .and_then(|p| p.get("settings"))
                    .and_then(|s| s.get("nixd"))
                    .and_then(|n| serde_json::from_value(n.clone()).ok())
                {
                    state.config = config;
                    options = None;
                }
            }
            (None, "textDocument/didOpen") => {
                let Some(params) = decode::<DidOpenTextDocumentParams>(msg.params) else {
                    continue;
                };
                let Ok(path) = params.text_document.uri.to_file_path() else {
                    continue;
                };
                let analysis = analyze(
                    params.text_document.uri,
                    &path,
                    params.text_document.text,
                    state.config.eval.depth,
                );
                state.files.insert(path, analysis);
                if kind == Kind::Eval && report_diagnostics(&mut stdout, &state).await.is_err() {
                    return 1;
                }
            }
            (Some(id), method) => {
                let result = match (kind, method) {
                    (Kind::Eval, ipc::HOVER) => to_json(
                        decode::<TextDocumentPositionParams>(msg.params)
                            .and_then(|p| handle_hover(&state, &p)),
                    ),
                    (Kind::Eval, ipc::DEFINITION) => to_json(
                        decode::<TextDocumentPositionParams>(msg.params)
                            .and_then(|p| handle_definition(&state, &p)),
                    ),
                    (Kind::Eval, ipc::COMPLETION) => to_json(
                        decode::<CompletionParams>(msg.params)
                            .map(|p| handle_completion(&state, &p)),
                    ),
                    (Kind::Option, ipc::OPTION_DECLARATION) => {
                        if options.is_none() {
                            options = load_options(&state.config);
                        }
                        to_json(decode::<ipc::AttrPathParams>(msg.params).and_then(|p| {
                            options.as_ref().and_then(|t| handle_option_declaration(t, &p))
                        }))
                    }
                    (Kind::Option, ipc::OPTION_COMPLETION) => {
                        if options.is_none() {
                            options = load_options(&state.config);
                        }
                        to_json(decode::<ipc::AttrPathParams>(msg.params).and_then(|p| {
                            options.as_ref().map(|t| handle_option_completion(t, &p))
                        }))
                    }
                    _ => serde_json::Value::Null,
                };
                let response = IpcMessage::response(id, result);
                let Ok(body) = serde_json::to_string(&response) else {
                    continue;
                };
                if ipc::write_message(&mut stdout, &body).await.is_err() {
                    return 1;
                }
            }
            _ => {}
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(params: Option<serde_json::Value>) -> Option<T> {
    params.and_then(|p| serde_json::from_value(p).ok())
}

fn to_json(value: impl serde::Serialize) -> serde_json::Value {
    serde_json::to_value(value).unwrap_or(serde_json::Value::Null)
}

/// Send the cumulative per-file diagnostics plus the finished marker.
async fn report_diagnostics(
    stdout: &mut (impl AsyncWrite + Unpin),
    state: &WorkerState,
) -> std::io::Result<()> {
    let diag = IpcMessage::notification(
        ipc::DIAGNOSTIC,
        to_json(ipc::DiagnosticsParams {
            workspace_version: state.workspace_version,
            params: state
                .files
                .values()
                .map(|a| PublishDiagnosticsParams {
                    uri: a.uri.clone(),
                    diagnostics: a.diagnostics.clone(),
                    version: None,
                })
                .collect(),
        }),
    );
    let body = serde_json::to_string(&diag)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    ipc::write_message(stdout, &body).await?;

    let finished = IpcMessage::notification(
        ipc::FINISHED,
        to_json(ipc::WorkerMessage {
            workspace_version: state.workspace_version,
        }),
    );
    let body = serde_json::to_string(&finished)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    ipc::write_message(stdout, &body).await
}

// ── Per-file analysis ────────────────────────────────────────────

struct Analysis {
    uri: Url,
    text: String,
    ast: Rc<Ast>,
    evaluator: Evaluator,
    diagnostics: Vec<Diagnostic>,
}

fn analyze(uri: Url, path: &Path, text: String, depth: usize) -> Analysis {
    let parsed = nixd_parser::parse(&text);
    let ast = Rc::new(parsed.ast);
    let mut diagnostics: Vec<Diagnostic> = parsed.errors.iter().map(error_diagnostic).collect();

    let evaluator = Evaluator::new(ast.clone(), path.parent().map(|p| p.to_path_buf()));
    // Only evaluate documents that parsed cleanly: forcing recovered
    // trees would drown the parse diagnostics in eval noise.
    if parsed.errors.is_empty() {
        match evaluator.eval_root() {
            Ok(root) => {
                if let Err(err) = evaluator.force_deep(&root, depth) {
                    diagnostics.push(error_diagnostic(&err));
                }
            }
            Err(err) => diagnostics.push(error_diagnostic(&err)),
        }
    }

    Analysis {
        uri,
        text,
        ast,
        evaluator,
        diagnostics,
    }
}

// ── Evaluator-worker requests ────────────────────────────────────

fn handle_hover(state: &WorkerState, params: &TextDocumentPositionParams) -> Option<Hover> {
    let path = params.text_document.uri.to_file_path().ok()?;
    let analysis = state.files.get(&path)?;
    let pos = position_to_pos(params.position);
    let ext = features::extents(&analysis.ast);

    // Narrowest evaluated expression under the cursor wins.
    for id in features::nodes_at(&analysis.ast, &ext, pos) {
        if let Some(value) = analysis.evaluator.traced(id) {
            return Some(Hover {
                contents: HoverContents::Markup(MarkupContent {
                    kind: MarkupKind::Markdown,
                    value: format!("```nix\n{}\n```", value.render(2)),
                }),
                range: ext.range(id),
            });
        }
    }
    None
}

fn handle_definition(
    state: &WorkerState,
    params: &TextDocumentPositionParams,
) -> Option<Location> {
    let path = params.text_document.uri.to_file_path().ok()?;
    let analysis = state.files.get(&path)?;
    let ast = &analysis.ast;
    let pos = position_to_pos(params.position);

    // Cursor on a select path segment: the evaluated attribute set
    // remembers where each attribute was defined.
    for id in ast.ids() {
        let Expr::Select(s) = ast.expr(id) else {
            continue;
        };
        for (i, attr) in s.path.iter().enumerate() {
            let Some(p) = ast.positions.get(attr.pos) else {
                continue;
            };
            let len = ast.name(attr.sym).len() as u32;
            if !(p.line == pos.line && p.col <= pos.col && pos.col < p.col + len) {
                continue;
            }
            let Some(subject) = analysis.evaluator.traced(s.subject) else {
                continue;
            };
            let segs: Vec<&str> = s.path[..=i].iter().map(|a| ast.name(a.sym)).collect();
            if let Ok(Some((_, def_pos))) = analysis.evaluator.value_at_path(&subject, &segs) {
                if let Some(dp) = ast.positions.get(def_pos) {
                    return Some(Location {
                        uri: params.text_document.uri.clone(),
                        range: name_range(dp, len as usize),
                    });
                }
            }
        }
    }

    // `with`-bound variable: dynamic scope is answerable here because
    // the `with` attrset has been evaluated.
    if let Some(features::Ident::Var(var_id)) = features::ident_at(ast, pos) {
        if let Expr::Var(v) = ast.expr(var_id) {
            if v.from_with {
                let name = ast.name(v.name).to_string();
                let parents = scope::parent_map(ast);
                let mut cur = var_id;
                while let Some(&parent) = parents.get(&cur) {
                    if let Expr::With(w) = ast.expr(parent) {
                        if let Some(env_val) = analysis.evaluator.traced(w.env) {
                            if let Ok(Some((_, def_pos))) =
                                analysis.evaluator.value_at_path(&env_val, &[&name])
                            {
                                if let Some(dp) = ast.positions.get(def_pos) {
                                    return Some(Location {
                                        uri: params.text_document.uri.clone(),
                                        range: name_range(dp, name.len()),
                                    });
                                }
                            }
                        }
                    }
                    cur = parent;
                }
            }
        }
    }

    None
}

fn handle_completion(state: &WorkerState, params: &CompletionParams) -> CompletionList {
    let empty = CompletionList {
        is_incomplete: true,
        items: Vec::new(),
    };
    let Ok(path) = params
        .text_document_position
        .text_document
        .uri
        .to_file_path()
    else {
        return empty;
    };
    let Some(analysis) = state.files.get(&path) else {
        return empty;
    };
    let position = params.text_document_position.position;

    let offset = position_to_offset(&analysis.text, position).ok();
    let after_dot = offset.is_some_and(|o| analysis.text[..o].ends_with('.'));
    let prefix_path = offset
        .map(|o| attr_path_before(&analysis.text, o))
        .unwrap_or_default();

    let mut items = Vec::new();
    if after_dot && !prefix_path.is_empty() {
        let segs: Vec<&str> = prefix_path.split('.').collect();
        if let Some(Value::Attrs(attrs)) = resolve_path_value(analysis, &segs) {
            for (name, attr) in attrs.entries.iter() {
                items.push(CompletionItem {
                    label: name.clone(),
                    kind: Some(CompletionItemKind::FIELD),
                    detail: attr.thunk.peek().map(|v| v.render(1)),
                    ..Default::default()
                });
            }
        }
    } else {
        for name in features::visible_symbols(&analysis.ast, position) {
            items.push(CompletionItem {
                label: name,
                kind: Some(CompletionItemKind::VARIABLE),
                ..Default::default()
            });
        }
        for name in [
            "true",
            "false",
            "null",
            "builtins",
            "import",
            "toString",
            "throw",
            "abort",
            "map",
            "length",
            "baseNameOf",
            "dirOf",
            "removeAttrs",
        ] {
            items.push(CompletionItem {
                label: name.to_string(),
                kind: Some(CompletionItemKind::KEYWORD),
                ..Default::default()
            });
        }
    }

    CompletionList {
        is_incomplete: true,
        items,
    }
}

/// Follow `segs` from the evaluated root, or from any traced variable
/// named like the first segment.
fn resolve_path_value(analysis: &Analysis, segs: &[&str]) -> Option<Value> {
    if let Some(root) = analysis.evaluator.traced(analysis.ast.root()) {
        if let Ok(Some((value, _))) = analysis.evaluator.value_at_path(&root, segs) {
            return Some(value);
        }
    }
    for id in analysis.ast.ids() {
        if let Expr::Var(v) = analysis.ast.expr(id) {
            if analysis.ast.name(v.name) == segs[0] {
                if let Some(value) = analysis.evaluator.traced(id) {
                    if let Ok(Some((value, _))) =
                        analysis.evaluator.value_at_path(&value, &segs[1..])
                    {
                        return Some(value);
                    }
                }
            }
        }
    }
    None
}

// ── Option-worker requests ───────────────────────────────────────

struct OptionTree {
    uri: Url,
    evaluator: Evaluator,
    root: Value,
}

fn load_options(config: &Config) -> Option<OptionTree> {
    let target = config.options.target.clone()?;
    let text = match std::fs::read_to_string(&target) {
        Ok(text) => text,
        Err(err) => {
            tracing::warn!("cannot read options target {}: {err}", target.display());
            return None;
        }
    };
    let uri = Url::from_file_path(&target).ok()?;
    option_tree_from_source(&text, uri, target.parent().map(|p| p.to_path_buf()))
}

fn option_tree_from_source(text: &str, uri: Url, base: Option<PathBuf>) -> Option<OptionTree> {
    let parsed = nixd_parser::parse(text);
    if !parsed.errors.is_empty() {
        tracing::warn!("options target has {} parse errors", parsed.errors.len());
    }
    let evaluator = Evaluator::new(Rc::new(parsed.ast), base);
    match evaluator.eval_root() {
        Ok(root) => Some(OptionTree {
            uri,
            evaluator,
            root,
        }),
        Err(err) => {
            tracing::warn!("options target failed to evaluate: {err}");
            None
        }
    }
}

fn handle_option_declaration(tree: &OptionTree, params: &ipc::AttrPathParams) -> Option<Location> {
    let segs: Vec<&str> = params.path.split('.').filter(|s| !s.is_empty()).collect();
    if segs.is_empty() {
        return None;
    }
    let (_, def_pos) = tree.evaluator.value_at_path(&tree.root, &segs).ok()??;
    let p = tree.evaluator.ast().positions.get(def_pos)?;
    Some(Location {
        uri: tree.uri.clone(),
        range: name_range(p, segs.last().map(|s| s.len()).unwrap_or(0)),
    })
}

fn handle_option_completion(tree: &OptionTree, params: &ipc::AttrPathParams) -> CompletionList {
    let segs: Vec<&str> = params.path.split('.').filter(|s| !s.is_empty()).collect();

    // Children at the exact path; else children at its parent, filtered
    // by the last segment as a typed prefix.
    let (value, prefix) = match tree.evaluator.value_at_path(&tree.root, &segs) {
        Ok(Some((value, _))) => (Some(value), String::new()),
        _ if !segs.is_empty() => {
            let parent = &segs[..segs.len() - 1];
            match tree.evaluator.value_at_path(&tree.root, parent) {
                Ok(Some((value, _))) => (Some(value), segs[segs.len() - 1].to_string()),
                _ => (None, String::new()),
            }
        }
        _ => (None, String::new()),
    };

    let mut items = Vec::new();
    if let Some(Value::Attrs(attrs)) = value {
        for (name, attr) in attrs
            .entries
            .iter()
            .filter(|(name, _)| prefix.is_empty() || name.starts_with(&prefix))
        {
            let child = tree.evaluator.force(&attr.thunk).ok();
            let description = child
                .as_ref()
                .and_then(|v| v.as_attrs())
                .and_then(|a| a.entries.get("description"))
                .and_then(|d| tree.evaluator.force(&d.thunk).ok())
                .and_then(|v| match v {
                    Value::Str(s) => Some(s.to_string()),
                    _ => None,
                });
            items.push(CompletionItem {
                label: name.clone(),
                kind: Some(CompletionItemKind::PROPERTY),
                documentation: description.map(Documentation::String),
                ..Default::default()
            });
        }
    }

    CompletionList {
        is_incomplete: true,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(src: &str) -> (WorkerState, PathBuf, Url) {
        let path = PathBuf::from("/ws/test.nix");
        let uri = Url::from_file_path(&path).unwrap();
        let analysis = analyze(uri.clone(), &path, src.to_string(), 8);
        let mut files = HashMap::new();
        files.insert(path.clone(), analysis);
        (
            WorkerState {
                workspace_version: 1,
                config: Config::default(),
                files,
            },
            path,
            uri,
        )
    }

    fn at(uri: &Url, line: u32, character: u32) -> TextDocumentPositionParams {
        TextDocumentPositionParams {
            text_document: TextDocumentIdentifier { uri: uri.clone() },
            position: Position::new(line, character),
        }
    }

    // ── Hover ────────────────────────────────────────────────────

    #[test]
    fn hover_shows_evaluated_value() {
        let (state, _, uri) = state_with("let x = 1; in x");
        // Cursor on the trailing `x`.
        let hover = handle_hover(&state, &at(&uri, 0, 14)).expect("hover");
        match hover.contents {
            HoverContents::Markup(m) => assert!(m.value.contains('1'), "got {}", m.value),
            other => panic!("expected markup, got {other:?}"),
        }
        // The range covers exactly the identifier.
        let range = hover.range.expect("range");
        assert_eq!(range.start, Position::new(0, 14));
        assert_eq!(range.end, Position::new(0, 15));
    }

    #[test]
    fn hover_on_unparsed_document_is_none() {
        let (state, _, uri) = state_with("let x = ");
        assert!(handle_hover(&state, &at(&uri, 0, 4)).is_none());
    }

    // ── Definition ───────────────────────────────────────────────

    #[test]
    fn definition_through_evaluated_select() {
        let src = "let a = { b = 1; }; in a.b";
        let (state, _, uri) = state_with(src);
        // Cursor on the `b` of `a.b` (LSP col 25).
        let loc = handle_definition(&state, &at(&uri, 0, 25)).expect("location");
        assert_eq!(loc.range.start, Position::new(0, 10));
        assert_eq!(loc.range.end, Position::new(0, 11));
    }

    #[test]
    fn definition_of_with_bound_variable() {
        let src = "with { foo = 1; }; foo";
        let (state, _, uri) = state_with(src);
        // Cursor on the trailing `foo` — statically unresolvable, but the
        // evaluated `with` attrset knows where `foo` was defined.
        let loc = handle_definition(&state, &at(&uri, 0, 19)).expect("location");
        assert_eq!(loc.range.start, Position::new(0, 7));
        assert_eq!(loc.range.end, Position::new(0, 10));
    }

    // ── Completion ───────────────────────────────────────────────

    fn completion_params(uri: &Url, line: u32, character: u32) -> CompletionParams {
        CompletionParams {
            text_document_position: at(uri, line, character),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context: None,
        }
    }

    #[test]
    fn completion_after_dot_lists_attr_members() {
        let src = "rec { pkgs = { alpha = 1; beta = 2; }; all = pkgs.alpha; }";
        let (state, _, uri) = state_with(src);
        // Cursor right after `pkgs.` (before `alpha`).
        let col = src.find("pkgs.alpha").unwrap() as u32 + 5;
        let list = handle_completion(&state, &completion_params(&uri, 0, col));
        let labels: Vec<&str> = list.items.iter().map(|i| i.label.as_str()).collect();
        assert!(labels.contains(&"alpha"), "got {labels:?}");
        assert!(labels.contains(&"beta"), "got {labels:?}");
        assert!(list.is_incomplete);
    }

    #[test]
    fn completion_in_scope_lists_visible_symbols() {
        let src = "let alpha = 1; beta = 2; in alpha";
        let (state, _, uri) = state_with(src);
        // Cursor inside the body identifier.
        let list = handle_completion(&state, &completion_params(&uri, 0, 29));
        let labels: Vec<&str> = list.items.iter().map(|i| i.label.as_str()).collect();
        assert!(labels.contains(&"alpha"));
        assert!(labels.contains(&"beta"));
        assert!(labels.contains(&"builtins"));
    }

    // ── Options ──────────────────────────────────────────────────

    fn options_tree() -> OptionTree {
        let src = r#"{
  services = {
    nginx = {
      enable = { description = "Whether to enable nginx."; };
      port = { description = "Listen port."; };
    };
  };
}"#;
        option_tree_from_source(
            src,
            Url::from_file_path("/ws/options.nix").unwrap(),
            None,
        )
        .expect("option tree")
    }

    #[test]
    fn option_declaration_resolves_dotted_path() {
        let tree = options_tree();
        let loc = handle_option_declaration(
            &tree,
            &ipc::AttrPathParams {
                path: "services.nginx.enable".to_string(),
            },
        )
        .expect("location");
        // `enable` is defined on line 4 (0-indexed line 3).
        assert_eq!(loc.range.start.line, 3);
        assert!(loc.uri.path().ends_with("options.nix"));
    }

    #[test]
    fn option_declaration_missing_path_is_none() {
        let tree = options_tree();
        assert!(handle_option_declaration(
            &tree,
            &ipc::AttrPathParams {
                path: "services.postgres".to_string(),
            },
        )
        .is_none());
    }

    #[test]
    fn option_completion_lists_children_with_descriptions() {
        let tree = options_tree();
        let list = handle_option_completion(
            &tree,
            &ipc::AttrPathParams {
                path: "services.nginx".to_string(),
            },
        );
        let labels: Vec<&str> = list.items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["enable", "port"]);
        assert!(matches!(
            &list.items[0].documentation,
            Some(Documentation::String(s)) if s.contains("nginx")
        ));
    }

    #[test]
    fn option_completion_filters_by_typed_prefix() {
        let tree = options_tree();
        let list = handle_option_completion(
            &tree,
            &ipc::AttrPathParams {
                path: "services.nginx.po".to_string(),
            },
        );
        let labels: Vec<&str> = list.items.iter().map(|i| i.label.as_str()).collect();
        assert_eq!(labels, vec!["port"]);
    }
}
