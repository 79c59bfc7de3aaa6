//! Controller ↔ worker protocol: LSP-style Content-Length framing over
//! the child's stdio, carrying JSON-RPC messages. Method names and
//! parameter shapes mirror the public LSP surface.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tower_lsp::lsp_types::PublishDiagnosticsParams;

// ── Methods ──────────────────────────────────────────────────────

pub const DIAGNOSTIC: &str = "nixd/ipc/diagnostic";
pub const FINISHED: &str = "nixd/ipc/finished";
pub const HOVER: &str = "nixd/ipc/textDocument/hover";
pub const DEFINITION: &str = "nixd/ipc/textDocument/definition";
pub const COMPLETION: &str = "nixd/ipc/textDocument/completion";
pub const OPTION_DECLARATION: &str = "nixd/ipc/option/textDocument/declaration";
pub const OPTION_COMPLETION: &str = "nixd/ipc/textDocument/completion/options";

// ── Message envelope ─────────────────────────────────────────────

#[derive(Debug, Serialize, Deserialize)]
pub struct IpcMessage {
    pub jsonrpc: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
}

impl IpcMessage {
    pub fn request(id: u64, method: &str, params: serde_json::Value) -> Self {
        IpcMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
        }
    }

    pub fn notification(method: &str, params: serde_json::Value) -> Self {
        IpcMessage {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: Some(method.to_string()),
            params: Some(params),
            result: None,
        }
    }

    pub fn response(id: u64, result: serde_json::Value) -> Self {
        IpcMessage {
            jsonrpc: "2.0".to_string(),
            id: Some(id),
            method: None,
            params: None,
            result: Some(result),
        }
    }
}

// ── Parameter types ──────────────────────────────────────────────

/// Dotted attribute path, e.g. `services.nginx.enable`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttrPathParams {
    #[serde(rename = "Path")]
    pub path: String,
}

/// Diagnostics reported by a worker, tagged with the workspace version
/// it was spawned for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsParams {
    #[serde(rename = "WorkspaceVersion")]
    pub workspace_version: u64,
    #[serde(rename = "Params")]
    pub params: Vec<PublishDiagnosticsParams>,
}

/// Payload of `nixd/ipc/finished`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(rename = "WorkspaceVersion")]
    pub workspace_version: u64,
}

// ── Framing ──────────────────────────────────────────────────────

/// Read one Content-Length framed message. `None` at end of stream.
pub async fn read_message(
    reader: &mut (impl AsyncBufRead + Unpin),
) -> std::io::Result<Option<String>> {
    let mut declared_len: Option<usize> = None;

    // Header block: `Name: value` lines up to the blank separator. Only
    // Content-Length is meaningful; anything else is passed over.
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let field = line.trim_end();
        if field.is_empty() {
            break;
        }
        if let Some((name, value)) = field.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                declared_len = value.trim().parse().ok();
            }
        }
    }

    let Some(n) = declared_len else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame header carries no Content-Length",
        ));
    };
    let mut payload = vec![0u8; n];
    reader.read_exact(&mut payload).await?;
    Ok(Some(String::from_utf8_lossy(&payload).into_owned()))
}

/// Write one Content-Length framed message.
pub async fn write_message(
    writer: &mut (impl AsyncWrite + Unpin),
    body: &str,
) -> std::io::Result<()> {
    let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
    writer.write_all(frame.as_bytes()).await?;
    writer.flush().await
}
