//! Per-connection request handling.
//!
//! One connection carries exactly one exchange: decode the request, run the
//! named tool with its output captured in memory, send status and outputs back,
//! close. Failures stay inside the connection; [`serve_connection`] is the
//! boundary that logs them so the accept loop never sees them.
//!
//! A connection only counts as served once a request has been decoded from it.
//! Liveness checks that connect and hang up are neither counted nor logged as
//! failures.

use std::sync::Arc;
use std::time::Instant;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::error::{PortalError, TOOL_NOT_FOUND_STATUS};
use crate::protocol::{Request, Response};
use crate::tool::{capture, Tool, ToolRegistry};

/// Handle one connection and log whatever goes wrong.
pub async fn serve_connection<C>(
    conn: C,
    registry: Arc<ToolRegistry>,
    served: Arc<watch::Sender<u64>>,
    connection: u64,
) where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let start = Instant::now();
    match handle_connection(conn, &registry, &served).await {
        Ok(Some(status)) => tracing::debug!(
            connection,
            status,
            duration_ms = %start.elapsed().as_millis(),
            "request served"
        ),
        Ok(None) => tracing::debug!(connection, "connection closed without a request"),
        Err(e) => tracing::error!(connection, error = %e, "request failed"),
    }
}

/// Run one request/response exchange, returning the status sent to the client.
///
/// `served` is bumped as soon as a request is decoded. Returns `None` when the
/// peer hung up before sending anything. An unknown tool is answered with
/// [`TOOL_NOT_FOUND_STATUS`]; only transport, framing, and tool-crash failures
/// are returned as errors, and in those cases nothing is written back.
pub async fn handle_connection<C>(
    mut conn: C,
    registry: &ToolRegistry,
    served: &watch::Sender<u64>,
) -> crate::Result<Option<i32>>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    let Some(request) = Request::read_if_any(&mut conn).await? else {
        return Ok(None);
    };
    served.send_modify(|n| *n += 1);

    let response = match registry.find(&request.tool) {
        Some(tool) => invoke(tool, request).await?,
        None => {
            let err = PortalError::ToolNotFound(request.tool);
            tracing::warn!(error = %err, "rejecting request");
            Response::failure(TOOL_NOT_FOUND_STATUS, err)
        }
    };

    response.write_to(&mut conn).await?;
    conn.shutdown().await?;
    Ok(Some(response.status))
}

/// Run the tool on the blocking pool; tools are synchronous and may take a while.
async fn invoke(tool: Arc<dyn Tool>, request: Request) -> crate::Result<Response> {
    let Request { tool: name, args } = request;
    tracing::debug!(tool = %name, args = args.len(), "invoking tool");
    tokio::task::spawn_blocking(move || capture(tool.as_ref(), &args))
        .await
        .map_err(|e| PortalError::ToolFailed {
            tool: name,
            reason: e.to_string(),
        })
}
