//! JSON-lines tool dispatcher.
//!
//! Each input line is `{"id": .., "tool": "..", "arguments": {..}}` and gets
//! exactly one response line `{"id": .., "result": ..}` or
//! `{"id": .., "error": {"code": .., "message": ..}}`. Service status changes
//! are pushed as `{"event": "service_status", ..}` lines.

pub mod handler;
pub mod schemas;
pub mod shell_tools;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::context::ShellContext;
use crate::error::AppError;
use crate::services::ServiceStatusChange;
use handler::ToolHandler;

#[derive(Debug, Deserialize)]
pub struct ToolRequest {
    #[serde(default)]
    pub id: Value,
    pub tool: String,
    #[serde(default)]
    pub arguments: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

impl From<&AppError> for ErrorBody {
    fn from(err: &AppError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ToolResponse {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl ToolResponse {
    fn from_result(id: Value, result: Result<Value, AppError>) -> Self {
        match result {
            Ok(value) => Self {
                id,
                result: Some(value),
                error: None,
            },
            Err(e) => Self {
                id,
                result: None,
                error: Some(ErrorBody::from(&e)),
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusEvent<'a> {
    event: &'static str,
    #[serde(flatten)]
    change: &'a ServiceStatusChange,
}

/// Serves requests from `reader` until it reaches EOF. Requests are handled
/// concurrently; responses may be written out of order and carry the
/// request id.
pub async fn serve<R, W>(ctx: Arc<ShellContext>, reader: R, mut writer: W) -> anyhow::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let handler = Arc::new(ToolHandler::new(ctx.clone()));
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer_task = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if let Err(e) = write_line(&mut writer, &line).await {
                error!(error = %e, "Failed to write response");
                break;
            }
        }
    });

    let mut status_rx = ctx.supervisor().subscribe_status_changes();
    let event_tx = out_tx.clone();
    let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();
    let event_task = tokio::spawn(async move {
        loop {
            // Pending events are forwarded before shutdown is honored.
            let received = tokio::select! {
                biased;
                received = status_rx.recv() => received,
                _ = &mut shutdown_rx => break,
            };
            match received {
                Ok(change) => {
                    let event = StatusEvent {
                        event: "service_status",
                        change: &change,
                    };
                    match serde_json::to_string(&event) {
                        Ok(line) => {
                            if event_tx.send(line).is_err() {
                                break;
                            }
                        }
                        Err(e) => error!(error = %e, "Failed to serialize status event"),
                    }
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "Dropped service status events"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let mut requests = Vec::new();
    let mut lines = reader.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let request: ToolRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Malformed request line");
                let response = ToolResponse::from_result(
                    Value::Null,
                    Err(AppError::InvalidInputArgument(format!("Malformed request: {}", e))),
                );
                out_tx.send(serde_json::to_string(&response)?)?;
                continue;
            }
        };

        debug!(tool = %request.tool, "Dispatching request");
        let handler = handler.clone();
        let out_tx = out_tx.clone();
        requests.push(tokio::spawn(async move {
            let result = handler.handle_tool_call(&request.tool, request.arguments).await;
            let response = ToolResponse::from_result(request.id, result);
            match serde_json::to_string(&response) {
                Ok(line) => {
                    let _ = out_tx.send(line);
                }
                Err(e) => error!(error = %e, "Failed to serialize response"),
            }
        }));
        requests.retain(|task| !task.is_finished());
    }

    info!("Input closed; waiting for in-flight requests");
    for task in requests {
        let _ = task.await;
    }
    let _ = shutdown_tx.send(());
    let _ = event_task.await;
    drop(out_tx);
    let _ = writer_task.await;
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
