//! The controller: the only process that talks to the LSP client.
//!
//! Request routing follows two paths. Static requests (document symbols,
//! links, rename, the definition fallback) are answered from the parse
//! cache alone. Evaluation-dependent requests (hover, definition,
//! completion, option lookups) fan out to the worker pools and take the
//! newest worker's answer under a per-method deadline. Document updates
//! publish a cleared diagnostic set, update the draft store, schedule a
//! parse, then advance the workspace version and respawn a worker — in
//! that order, so every worker observes the draft it was spawned for.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tower_lsp::jsonrpc::{Error, ErrorCode, Result};
use tower_lsp::lsp_types::request::{GotoDeclarationParams, GotoDeclarationResponse};
use tower_lsp::lsp_types::*;
use tower_lsp::{Client, LanguageServer, LspService, Server};

use crate::aggregate::{
    ask_workers, latest_match_or, COMPLETION_DEADLINE, DEFINITION_DEADLINE, HOVER_DEADLINE,
    OPTION_COMPLETION_DEADLINE, OPTION_DECLARATION_DEADLINE,
};
use crate::ast_cache::AstCache;
use crate::config::{self, Config};
use crate::draft::{apply_change, DraftStore};
use crate::features::{self, CompletionContext};
use crate::helpers::attr_path_at;
use crate::helpers::position_to_offset;
use crate::ipc;
use crate::worker::{Supervisor, WorkerEvent};

const FORMATTING_DEADLINE: Duration = Duration::from_secs(1);

pub struct Controller {
    pub(crate) client: Client,
    drafts: DraftStore,
    asts: Arc<AstCache>,
    config: RwLock<Config>,
    supervisor: Supervisor,
    can_fetch_config: AtomicBool,
    pub(crate) shutdown_seen: Arc<AtomicBool>,
}

impl Controller {
    pub fn new(
        client: Client,
        initial: Config,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        Controller {
            client,
            drafts: DraftStore::new(),
            asts: Arc::new(AstCache::new()),
            config: RwLock::new(initial),
            supervisor: Supervisor::new(events),
            can_fetch_config: AtomicBool::new(false),
            shutdown_seen: Arc::new(AtomicBool::new(false)),
        }
    }

    fn config(&self) -> Config {
        self.config.read().unwrap().clone()
    }

    async fn update_config(&self, new: Config) {
        *self.config.write().unwrap() = new.clone();
        let drafts = self.drafts.all();
        if new.options.enable {
            self.supervisor.fork_option_worker(&new, &drafts).await;
        }
        self.supervisor.update_workspace_version(&new, &drafts).await;
    }

    async fn fetch_config(&self) {
        if !self.can_fetch_config.load(Ordering::Relaxed) {
            return;
        }
        let items = vec![ConfigurationItem {
            scope_uri: None,
            section: Some("nixd".to_string()),
        }];
        match self.client.configuration(items).await {
            Ok(values) => {
                if let Some(value) = values.into_iter().next() {
                    match serde_json::from_value::<Config>(value) {
                        Ok(new) => self.update_config(new).await,
                        Err(err) => tracing::warn!("ignoring malformed configuration: {err}"),
                    }
                }
            }
            Err(err) => tracing::warn!("workspace/configuration failed: {err}"),
        }
    }

    /// Publish-clear, store the draft, schedule the parse, then advance
    /// the workspace version. The order is load-bearing (§ ordering of
    /// drafts vs. workers).
    async fn add_document(&self, uri: Url, path: PathBuf, contents: String, version: i64) {
        self.client
            .publish_diagnostics(uri, Vec::new(), None)
            .await;
        self.drafts
            .add_draft(path.clone(), version, contents.clone());
        self.asts.sched_parse(contents, path, version);
        let config = self.config();
        self.supervisor
            .update_workspace_version(&config, &self.drafts.all())
            .await;
    }

    fn remove_document(&self, path: &Path) {
        self.drafts.remove_draft(path);
        self.asts.remove(path);
    }

    fn draft_version(&self, path: &Path) -> i64 {
        self.drafts.get_draft(path).map(|d| d.version).unwrap_or(0)
    }
}

fn uri_path(uri: &Url) -> Option<PathBuf> {
    uri.to_file_path().ok()
}

fn no_rename_edits() -> Error {
    Error {
        code: ErrorCode::InvalidRequest,
        message: "no rename edits available".into(),
        data: None,
    }
}

fn hover_has_contents(hover: &Hover) -> bool {
    match &hover.contents {
        HoverContents::Markup(m) => !m.value.is_empty(),
        HoverContents::Scalar(_) | HoverContents::Array(_) => true,
    }
}

#[tower_lsp::async_trait]
impl LanguageServer for Controller {
    async fn initialize(&self, params: InitializeParams) -> Result<InitializeResult> {
        let supports_configuration = params
            .capabilities
            .workspace
            .as_ref()
            .and_then(|w| w.configuration)
            .unwrap_or(false);
        self.can_fetch_config
            .store(supports_configuration, Ordering::Relaxed);

        Ok(InitializeResult {
            server_info: Some(ServerInfo {
                name: "nixd".to_string(),
                version: Some(env!("CARGO_PKG_VERSION").to_string()),
            }),
            capabilities: ServerCapabilities {
                text_document_sync: Some(TextDocumentSyncCapability::Options(
                    TextDocumentSyncOptions {
                        open_close: Some(true),
                        change: Some(TextDocumentSyncKind::INCREMENTAL),
                        save: Some(TextDocumentSyncSaveOptions::Supported(true)),
                        ..Default::default()
                    },
                )),
                declaration_provider: Some(DeclarationCapability::Simple(true)),
                definition_provider: Some(OneOf::Left(true)),
                document_link_provider: Some(DocumentLinkOptions {
                    resolve_provider: Some(false),
                    work_done_progress_options: Default::default(),
                }),
                document_symbol_provider: Some(OneOf::Left(true)),
                hover_provider: Some(HoverProviderCapability::Simple(true)),
                document_formatting_provider: Some(OneOf::Left(true)),
                rename_provider: Some(OneOf::Right(RenameOptions {
                    prepare_provider: Some(true),
                    work_done_progress_options: Default::default(),
                })),
                completion_provider: Some(CompletionOptions {
                    trigger_characters: Some(vec![".".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            },
        })
    }

    async fn initialized(&self, _: InitializedParams) {
        // Apply the file-loaded configuration first, so option workers
        // exist even for clients that never serve
        // `workspace/configuration`; a fetched config replaces it.
        let initial = self.config();
        self.update_config(initial).await;
        self.fetch_config().await;
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdown_seen.store(true, Ordering::Relaxed);
        Ok(())
    }

    // ── Document synchronization ─────────────────────────────────

    async fn did_open(&self, params: DidOpenTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = uri_path(&uri) else {
            return;
        };
        self.add_document(
            uri,
            path,
            params.text_document.text,
            params.text_document.version as i64,
        )
        .await;
    }

    async fn did_change(&self, params: DidChangeTextDocumentParams) {
        let uri = params.text_document.uri;
        let Some(path) = uri_path(&uri) else {
            return;
        };
        let Some(draft) = self.drafts.get_draft(&path) else {
            tracing::info!(
                "ignoring change for unopened document {}",
                path.display()
            );
            return;
        };

        let mut contents = (*draft.contents).clone();
        for change in &params.content_changes {
            if let Err(err) = apply_change(&mut contents, change) {
                // Out of sync with the client: dropping the draft makes
                // further requests fail instead of answering wrongly.
                self.remove_document(&path);
                tracing::error!("failed to update {}: {err}", path.display());
                return;
            }
        }
        self.add_document(uri, path, contents, params.text_document.version as i64)
            .await;
    }

    async fn did_close(&self, params: DidCloseTextDocumentParams) {
        let uri = params.text_document.uri;
        if let Some(path) = uri_path(&uri) {
            self.remove_document(&path);
        }
        self.client.publish_diagnostics(uri, Vec::new(), None).await;
    }

    async fn did_change_configuration(&self, params: DidChangeConfigurationParams) {
        if let Some(section) = params.settings.get("nixd") {
            match serde_json::from_value::<Config>(section.clone()) {
                Ok(new) => self.update_config(new).await,
                Err(err) => tracing::warn!("ignoring malformed configuration: {err}"),
            }
        } else {
            self.fetch_config().await;
        }
    }

    // ── Evaluated features ───────────────────────────────────────

    async fn hover(&self, params: HoverParams) -> Result<Option<Hover>> {
        let replies: Vec<Option<Hover>> = ask_workers(
            &self.supervisor.eval_workers,
            ipc::HOVER,
            &params.text_document_position_params,
            HOVER_DEADLINE,
        )
        .await;
        Ok(latest_match_or(
            replies,
            |h| h.as_ref().is_some_and(hover_has_contents),
            None,
        ))
    }

    async fn goto_definition(
        &self,
        params: GotoDefinitionParams,
    ) -> Result<Option<GotoDefinitionResponse>> {
        // Evaluated locations first: they are usually the more useful
        // answer (they see through `with` and computed attribute sets).
        let replies: Vec<Option<Location>> = ask_workers(
            &self.supervisor.eval_workers,
            ipc::DEFINITION,
            &params.text_document_position_params,
            DEFINITION_DEADLINE,
        )
        .await;
        if let Some(location) = latest_match_or(replies, |r| r.is_some(), None) {
            return Ok(Some(GotoDefinitionResponse::Scalar(location)));
        }

        // Static fallback on the cached AST.
        let uri = params.text_document_position_params.text_document.uri;
        let position = params.text_document_position_params.position;
        let Some(path) = uri_path(&uri) else {
            return Ok(None);
        };
        let range = self
            .asts
            .with_ast(&path, self.draft_version(&path), |ast, _| {
                features::definition(ast, position)
            })
            .await
            .flatten();
        Ok(range.map(|range| GotoDefinitionResponse::Scalar(Location { uri, range })))
    }

    async fn goto_declaration(
        &self,
        params: GotoDeclarationParams,
    ) -> Result<Option<GotoDeclarationResponse>> {
        if !self.config().options.enable {
            return Ok(None);
        }
        let uri = &params.text_document_position_params.text_document.uri;
        let Some(path) = uri_path(uri) else {
            return Ok(None);
        };
        let Some(draft) = self.drafts.get_draft(&path) else {
            return Ok(None);
        };
        let position = params.text_document_position_params.position;
        let Ok(offset) = position_to_offset(&draft.contents, position) else {
            return Ok(None);
        };
        let attr_path = attr_path_at(&draft.contents, offset);
        tracing::debug!("requesting option path: {attr_path}");

        let replies: Vec<Option<Location>> = ask_workers(
            &self.supervisor.option_workers,
            ipc::OPTION_DECLARATION,
            &ipc::AttrPathParams { path: attr_path },
            OPTION_DECLARATION_DEADLINE,
        )
        .await;
        Ok(latest_match_or(replies, |r| r.is_some(), None)
            .map(GotoDeclarationResponse::Scalar))
    }

    async fn completion(&self, params: CompletionParams) -> Result<Option<CompletionResponse>> {
        let uri = &params.text_document_position.text_document.uri;
        let Some(path) = uri_path(uri) else {
            return Ok(None);
        };
        let Some(draft) = self.drafts.get_draft(&path) else {
            return Err(Error {
                code: ErrorCode::InvalidParams,
                message: "requested completion list on unknown draft path".into(),
                data: None,
            });
        };

        let position = params.text_document_position.position;
        let context = self
            .asts
            .with_ast(&path, draft.version, |ast, _| {
                features::completion_context(ast, position)
            })
            .await
            .unwrap_or(CompletionContext::Unknown);

        let config = self.config();

        let from_options = || async {
            if !config.options.enable {
                return Vec::new();
            }
            let attr_path = position_to_offset(&draft.contents, position)
                .map(|offset| crate::helpers::attr_path_before(&draft.contents, offset))
                .unwrap_or_default();
            let replies: Vec<CompletionList> = ask_workers(
                &self.supervisor.option_workers,
                ipc::OPTION_COMPLETION,
                &ipc::AttrPathParams { path: attr_path },
                OPTION_COMPLETION_DEADLINE,
            )
            .await;
            replies.into_iter().last().map(|l| l.items).unwrap_or_default()
        };

        let from_eval = || async {
            let replies: Vec<CompletionList> = ask_workers(
                &self.supervisor.eval_workers,
                ipc::COMPLETION,
                &params,
                COMPLETION_DEADLINE,
            )
            .await;
            latest_match_or(replies, |l| !l.items.is_empty(), CompletionList::default()).items
        };

        let items = match context {
            CompletionContext::AttrName => from_options().await,
            CompletionContext::Value => from_eval().await,
            CompletionContext::Unknown => {
                let mut items = from_options().await;
                items.extend(from_eval().await);
                items
            }
        };

        Ok(Some(CompletionResponse::List(CompletionList {
            is_incomplete: true,
            items,
        })))
    }

    // ── Static features ──────────────────────────────────────────

    async fn document_symbol(
        &self,
        params: DocumentSymbolParams,
    ) -> Result<Option<DocumentSymbolResponse>> {
        let Some(path) = uri_path(&params.text_document.uri) else {
            return Ok(None);
        };
        let symbols = self
            .asts
            .with_ast(&path, self.draft_version(&path), |ast, _| {
                features::document_symbols(ast)
            })
            .await;
        Ok(symbols.map(DocumentSymbolResponse::Nested))
    }

    async fn document_link(&self, params: DocumentLinkParams) -> Result<Option<Vec<DocumentLink>>> {
        let Some(path) = uri_path(&params.text_document.uri) else {
            return Ok(None);
        };
        let links = self
            .asts
            .with_ast(&path, self.draft_version(&path), |ast, _| {
                features::document_links(ast, &path)
            })
            .await;
        Ok(links)
    }

    async fn rename(&self, params: RenameParams) -> Result<Option<WorkspaceEdit>> {
        let uri = params.text_document_position.text_document.uri;
        let Some(path) = uri_path(&uri) else {
            return Err(no_rename_edits());
        };
        let position = params.text_document_position.position;
        let edits = self
            .asts
            .with_ast(&path, self.draft_version(&path), |ast, _| {
                features::rename(ast, position, &params.new_name)
            })
            .await
            .flatten();
        match edits {
            Some(edits) => {
                let mut changes = HashMap::new();
                changes.insert(uri, edits);
                Ok(Some(WorkspaceEdit {
                    changes: Some(changes),
                    ..Default::default()
                }))
            }
            None => Err(no_rename_edits()),
        }
    }

    async fn prepare_rename(
        &self,
        params: TextDocumentPositionParams,
    ) -> Result<Option<PrepareRenameResponse>> {
        let Some(path) = uri_path(&params.text_document.uri) else {
            return Err(no_rename_edits());
        };
        let range = self
            .asts
            .with_ast(&path, self.draft_version(&path), |ast, _| {
                features::prepare_rename(ast, params.position)
            })
            .await
            .flatten();
        match range {
            Some(range) => Ok(Some(PrepareRenameResponse::Range(range))),
            None => Err(no_rename_edits()),
        }
    }

    // ── Formatting ───────────────────────────────────────────────

    async fn formatting(&self, params: DocumentFormattingParams) -> Result<Option<Vec<TextEdit>>> {
        let fail = || Error {
            code: ErrorCode::InternalError,
            message: "no formatting response received".into(),
            data: None,
        };
        let Some(path) = uri_path(&params.text_document.uri) else {
            return Err(fail());
        };
        let Some(draft) = self.drafts.get_draft(&path) else {
            return Err(fail());
        };

        let command = self.config().formatting.command;
        let mut parts = command.split_whitespace().map(str::to_string);
        let Some(program) = parts.next() else {
            return Err(fail());
        };
        let args: Vec<String> = parts.collect();
        let contents = draft.contents.clone();

        let format = async move {
            let mut child = tokio::process::Command::new(&program)
                .args(&args)
                .stdin(std::process::Stdio::piped())
                .stdout(std::process::Stdio::piped())
                .stderr(std::process::Stdio::null())
                .spawn()
                .ok()?;
            let mut stdin = child.stdin.take()?;
            stdin.write_all(contents.as_bytes()).await.ok()?;
            drop(stdin);
            let output = child.wait_with_output().await.ok()?;
            if !output.status.success() {
                return None;
            }
            Some(String::from_utf8_lossy(&output.stdout).into_owned())
        };

        match tokio::time::timeout(FORMATTING_DEADLINE, format).await {
            Ok(Some(formatted)) => Ok(Some(vec![TextEdit {
                range: Range {
                    start: Position::new(0, 0),
                    end: Position::new(u32::MAX, u32::MAX),
                },
                new_text: formatted,
            }])),
            _ => Err(fail()),
        }
    }
}

// ── Diagnostics sink (DiagStatus) ────────────────────────────────

struct DiagStatus {
    workspace_version: u64,
    published: HashSet<Url>,
}

/// Consume worker events. Diagnostics are accepted only when their
/// workspace version is at least the last accepted one; files that
/// dropped out of the newer report are cleared.
async fn diagnostics_task(client: Client, mut events: mpsc::UnboundedReceiver<WorkerEvent>) {
    let mut status = DiagStatus {
        workspace_version: 0,
        published: HashSet::new(),
    };
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Diagnostics(report) => {
                if report.workspace_version < status.workspace_version {
                    tracing::debug!(
                        "dropping stale diagnostics for version {}",
                        report.workspace_version
                    );
                    continue;
                }
                status.workspace_version = report.workspace_version;

                let fresh: HashSet<Url> = report.params.iter().map(|p| p.uri.clone()).collect();
                for uri in status.published.difference(&fresh) {
                    client
                        .publish_diagnostics(uri.clone(), Vec::new(), None)
                        .await;
                }
                for p in report.params {
                    client
                        .publish_diagnostics(p.uri, p.diagnostics, p.version)
                        .await;
                }
                status.published = fresh;
            }
            WorkerEvent::Finished(version) => {
                tracing::debug!("worker for version {version} finished evaluation");
            }
        }
    }
}

// ── Entry point ──────────────────────────────────────────────────

/// Serve the controller on stdio. Returns the process exit code: 0
/// after a clean `shutdown`, non-zero when the transport ended without
/// one.
pub async fn run_server(config_file: Option<PathBuf>) -> i32 {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();

    let initial = config_file
        .as_deref()
        .and_then(config::load_file)
        .or_else(|| config::load_file(Path::new(".nixd.json")))
        .unwrap_or_default();

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (service, socket) =
        LspService::new(|client| Controller::new(client, initial.clone(), events_tx.clone()));

    let client = service.inner().client.clone();
    let shutdown_seen = service.inner().shutdown_seen.clone();
    tokio::spawn(diagnostics_task(client, events_rx));

    Server::new(stdin, stdout, socket).serve(service).await;

    if shutdown_seen.load(Ordering::Relaxed) {
        0
    } else {
        1
    }
}
