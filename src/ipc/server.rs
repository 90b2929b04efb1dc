//! Local IPC server for `channel-supervisor-ctl` commands.
//!
//! Listens on a named pipe (Windows) or Unix domain socket (Linux/macOS)
//! using the `interprocess` crate. Accepts line-delimited JSON commands
//! and routes them to the session supervisor.
//!
//! ## Protocol
//!
//! Request (one JSON object per line):
//! ```json
//! {"command": "activate", "id": "support-wa"}
//! {"command": "deactivate", "id": "support-wa"}
//! {"command": "reset", "id": "support-wa"}
//! ```
//!
//! Response (one JSON object per line):
//! ```json
//! {"ok": true, "data": { ... } }
//! {"ok": false, "error": "not found: session support-wa"}
//! ```

use std::sync::Arc;

use interprocess::local_socket::{tokio::prelude::*, GenericNamespaced, ListenerOptions};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, warn, Instrument};

use crate::models::session::Session;
use crate::orchestrator::supervisor::Supervisor;
use crate::{AppError, Result};

/// Inbound IPC request from `channel-supervisor-ctl`.
#[derive(Debug, Deserialize)]
pub struct IpcRequest {
    /// Command verb.
    pub command: String,
    /// Session identifier.
    pub id: Option<String>,
    /// Shared-secret authentication token.
    pub auth_token: Option<String>,
}

/// Outbound IPC response to `channel-supervisor-ctl`.
#[derive(Debug, Serialize, PartialEq)]
pub struct IpcResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Payload on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IpcResponse {
    fn success(data: serde_json::Value) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(message.into()),
        }
    }
}

/// Shared state of the IPC server.
pub struct IpcContext {
    /// Supervisor receiving administrative commands.
    pub supervisor: Arc<Supervisor>,
    /// Required shared secret, when configured.
    pub auth_token: Option<String>,
}

/// Spawn the IPC server task.
///
/// # Errors
///
/// Returns `AppError::Ipc` if the listener cannot be created.
pub fn spawn_ipc_server(
    name: &str,
    context: Arc<IpcContext>,
    ct: CancellationToken,
) -> Result<tokio::task::JoinHandle<()>> {
    let name = name.to_owned();

    let listener_name = name
        .clone()
        .to_ns_name::<GenericNamespaced>()
        .map_err(|err| AppError::Ipc(format!("invalid ipc socket name '{name}': {err}")))?;

    let listener = ListenerOptions::new()
        .name(listener_name)
        .create_tokio()
        .map_err(|err| AppError::Ipc(format!("failed to create ipc listener: {err}")))?;

    info!(ipc_name = %name, "IPC server listening");

    let handle = tokio::spawn(async move {
        let span = info_span!("ipc_server", name = %name);
        async move {
            loop {
                tokio::select! {
                    () = ct.cancelled() => {
                        info!("IPC server shutting down");
                        break;
                    }
                    accept_result = listener.accept() => {
                        match accept_result {
                            Ok(stream) => {
                                tokio::spawn(handle_connection(stream, Arc::clone(&context)));
                            }
                            Err(err) => {
                                warn!(%err, "IPC accept failed");
                            }
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await;
    });

    Ok(handle)
}

/// Handle a single IPC client connection.
async fn handle_connection(
    stream: interprocess::local_socket::tokio::Stream,
    context: Arc<IpcContext>,
) {
    let span = info_span!("ipc_conn");
    async move {
        let (reader, mut writer) = stream.split();
        let mut buf_reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match buf_reader.read_line(&mut line).await {
                Ok(0) => break, // EOF
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<IpcRequest>(trimmed) {
                        Ok(request) => dispatch_command(&request, &context).await,
                        Err(err) => IpcResponse::error(format!("invalid json: {err}")),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"ok":false,"error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "failed to write ipc response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "ipc read error");
                    break;
                }
            }
        }

        info!("IPC connection closed");
    }
    .instrument(span)
    .await;
}

/// Route an IPC command to the supervisor.
pub async fn dispatch_command(request: &IpcRequest, context: &IpcContext) -> IpcResponse {
    let span = info_span!("ipc_command", command = %request.command);
    async move {
        if let Some(ref expected) = context.auth_token {
            match request.auth_token {
                Some(ref provided) if provided == expected => {}
                _ => {
                    warn!(command = %request.command, "IPC request rejected: invalid auth token");
                    return IpcResponse::error("unauthorized");
                }
            }
        }

        let Some(ref id) = request.id else {
            return IpcResponse::error("missing required 'id' field");
        };
        let supervisor = &context.supervisor;

        let result = match request.command.as_str() {
            "activate" => supervisor.activate(id).await.map(|s| session_json(&s)),
            "deactivate" => supervisor
                .deactivate(id)
                .await
                .map(|()| serde_json::json!({ "session_id": id, "state": "closed" })),
            "reset" => supervisor.reset(id).await.map(|s| session_json(&s)),
            other => return IpcResponse::error(format!("unknown command: {other}")),
        };

        match result {
            Ok(data) => {
                info!(session_id = %id, "IPC command applied");
                IpcResponse::success(data)
            }
            Err(err) => IpcResponse::error(err.to_string()),
        }
    }
    .instrument(span)
    .await
}

fn session_json(session: &Session) -> serde_json::Value {
    serde_json::json!({
        "session_id": session.id,
        "state": session.state,
        "pid": session.pid(),
        "retry_count": session.retry_count,
        "last_heartbeat_at": session.last_heartbeat_at.map(|at| at.to_rfc3339()),
        "next_attempt_at": session.next_attempt_at.map(|at| at.to_rfc3339()),
        "last_error": session.last_error,
        "changed_at": session.changed_at.to_rfc3339(),
    })
}
