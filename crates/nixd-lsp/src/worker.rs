//! Worker supervision.
//!
//! Workers are respawned copies of this binary serving the IPC protocol
//! over piped stdio. Each new worker is seeded with the current
//! configuration and every open draft, so it reconstructs the state a
//! forked snapshot would have had at the workspace version it is tagged
//! with. Pools are oldest-evicted queues; an evicted worker is killed
//! and its reader task ends when the pipe closes.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tower_lsp::lsp_types::{
    DidChangeConfigurationParams, DidOpenTextDocumentParams, TextDocumentItem, Url,
};

use crate::config::Config;
use crate::draft::Draft;
use crate::ipc::{self, IpcMessage};

/// Messages surfaced by worker reader tasks to the controller.
#[derive(Debug)]
pub enum WorkerEvent {
    Diagnostics(ipc::DiagnosticsParams),
    Finished(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Eval,
    Option,
}

impl WorkerRole {
    fn flag(self) -> &'static str {
        match self {
            WorkerRole::Eval => "--eval-worker",
            WorkerRole::Option => "--option-worker",
        }
    }
}

type Pending = Arc<StdMutex<HashMap<u64, oneshot::Sender<serde_json::Value>>>>;

pub struct Worker {
    pub workspace_version: u64,
    child: StdMutex<Child>,
    stdin: Mutex<ChildStdin>,
    pending: Pending,
    reader: JoinHandle<()>,
    next_id: AtomicU64,
}

impl Worker {
    /// Spawn a worker process and seed it with the configuration and all
    /// open drafts.
    pub async fn spawn(
        role: WorkerRole,
        workspace_version: u64,
        config: &Config,
        drafts: &[(PathBuf, Draft)],
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> std::io::Result<Arc<Worker>> {
        let exe = std::env::current_exe()?;
        let mut child = Command::new(exe)
            .arg(role.flag())
            .arg("--workspace-version")
            .arg(workspace_version.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let missing =
            || std::io::Error::new(std::io::ErrorKind::BrokenPipe, "worker pipe not created");
        let mut stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;

        let pending: Pending = Arc::new(StdMutex::new(HashMap::new()));
        let reader = tokio::spawn(read_loop(BufReader::new(stdout), pending.clone(), events));

        // Configuration first, then the draft snapshot.
        let config_note = IpcMessage::notification(
            "workspace/didChangeConfiguration",
            serde_json::to_value(DidChangeConfigurationParams {
                settings: serde_json::json!({ "nixd": config }),
            })
            .unwrap_or_default(),
        );
        send(&mut stdin, &config_note).await?;

        for (path, draft) in drafts {
            let Ok(uri) = Url::from_file_path(path) else {
                continue;
            };
            let open = IpcMessage::notification(
                "textDocument/didOpen",
                serde_json::to_value(DidOpenTextDocumentParams {
                    text_document: TextDocumentItem {
                        uri,
                        language_id: "nix".to_string(),
                        version: draft.version as i32,
                        text: (*draft.contents).clone(),
                    },
                })
                .unwrap_or_default(),
            );
            send(&mut stdin, &open).await?;
        }

        tracing::debug!(
            "spawned {role:?} worker pid {:?} for workspace version {workspace_version}",
            child.id()
        );

        Ok(Arc::new(Worker {
            workspace_version,
            child: StdMutex::new(child),
            stdin: Mutex::new(stdin),
            pending,
            reader,
            next_id: AtomicU64::new(1),
        }))
    }

    /// Issue a request; the reply arrives through the returned receiver.
    /// `None` if the worker's pipe is gone.
    pub async fn request(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Option<oneshot::Receiver<serde_json::Value>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);

        let msg = IpcMessage::request(id, method, params);
        let mut stdin = self.stdin.lock().await;
        if send(&mut stdin, &msg).await.is_err() {
            self.pending.lock().unwrap().remove(&id);
            return None;
        }
        Some(rx)
    }

    pub fn shutdown(&self) {
        self.reader.abort();
        if let Ok(mut child) = self.child.lock() {
            let _ = child.start_kill();
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn send(stdin: &mut ChildStdin, msg: &IpcMessage) -> std::io::Result<()> {
    let body = serde_json::to_string(msg)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    ipc::write_message(stdin, &body).await
}

/// Consume the worker's stdout: route replies to their oneshots and IPC
/// notifications to the controller's event channel. Exits on pipe close.
async fn read_loop(
    mut reader: BufReader<ChildStdout>,
    pending: Pending,
    events: mpsc::UnboundedSender<WorkerEvent>,
) {
    loop {
        match ipc::read_message(&mut reader).await {
            Ok(Some(text)) => {
                let msg: IpcMessage = match serde_json::from_str(&text) {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::warn!("discarding malformed worker message: {err}");
                        continue;
                    }
                };
                if let (Some(id), Some(result)) = (msg.id, msg.result) {
                    if let Some(tx) = pending.lock().unwrap().remove(&id) {
                        let _ = tx.send(result);
                    }
                    continue;
                }
                match msg.method.as_deref() {
                    Some(ipc::DIAGNOSTIC) => {
                        if let Some(params) = msg.params {
                            match serde_json::from_value(params) {
                                Ok(diag) => {
                                    let _ = events.send(WorkerEvent::Diagnostics(diag));
                                }
                                Err(err) => {
                                    tracing::warn!("bad diagnostic payload: {err}")
                                }
                            }
                        }
                    }
                    Some(ipc::FINISHED) => {
                        let version = msg
                            .params
                            .and_then(|p| {
                                serde_json::from_value::<ipc::WorkerMessage>(p).ok()
                            })
                            .map(|m| m.workspace_version)
                            .unwrap_or(0);
                        let _ = events.send(WorkerEvent::Finished(version));
                    }
                    _ => {}
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

// ── Pools ────────────────────────────────────────────────────────

/// Push to the back; evict (and finalize) from the front past capacity.
fn push_evicting<T>(queue: &mut VecDeque<T>, item: T, capacity: usize, evict: impl Fn(&T)) {
    queue.push_back(item);
    while queue.len() > capacity.max(1) {
        if let Some(old) = queue.pop_front() {
            evict(&old);
        }
    }
}

#[derive(Default)]
pub struct WorkerPool {
    queue: Mutex<VecDeque<Arc<Worker>>>,
}

impl WorkerPool {
    /// Current workers, oldest first.
    pub async fn snapshot(&self) -> Vec<Arc<Worker>> {
        self.queue.lock().await.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

// ── Supervisor ───────────────────────────────────────────────────

pub struct Supervisor {
    pub eval_workers: WorkerPool,
    pub option_workers: WorkerPool,
    version: AtomicU64,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Supervisor {
    pub fn new(events: mpsc::UnboundedSender<WorkerEvent>) -> Self {
        Supervisor {
            eval_workers: WorkerPool::default(),
            option_workers: WorkerPool::default(),
            version: AtomicU64::new(0),
            events,
        }
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Advance the workspace version and respawn an evaluator worker for
    /// it. The bump happens under the eval pool lock so version order and
    /// queue order agree.
    pub async fn update_workspace_version(&self, config: &Config, drafts: &[(PathBuf, Draft)]) {
        let mut queue = self.eval_workers.queue.lock().await;
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        match Worker::spawn(
            WorkerRole::Eval,
            version,
            config,
            drafts,
            self.events.clone(),
        )
        .await
        {
            Ok(worker) => {
                push_evicting(&mut queue, worker, config.eval.workers, |old| {
                    old.shutdown()
                });
            }
            Err(err) => tracing::error!("cannot create evaluator worker: {err}"),
        }
    }

    /// (Re)spawn the option worker. A single option worker is kept.
    pub async fn fork_option_worker(&self, config: &Config, drafts: &[(PathBuf, Draft)]) {
        let mut queue = self.option_workers.queue.lock().await;
        let version = self.version.load(Ordering::SeqCst);
        match Worker::spawn(
            WorkerRole::Option,
            version,
            config,
            drafts,
            self.events.clone(),
        )
        .await
        {
            Ok(worker) => {
                push_evicting(&mut queue, worker, 1, |old| old.shutdown());
            }
            Err(err) => tracing::error!("cannot create option worker: {err}"),
        }
    }
}
