//! Stdio router: newline-delimited JSON-RPC on stdin/stdout.

use std::sync::Arc;

use tokio::io::{stdin, stdout};
use tracing::info;

use tmg_wire::framing::{write_line, LineReader};
use tmg_wire::GatewayResult;

use crate::core::gateway::Gateway;
use crate::core::server::McpServer;

/// Serve until stdin EOF. Requests are handled in arrival order; the
/// engine parallelizes within workflows, so a single dispatch loop keeps
/// response framing trivially well-ordered.
pub async fn serve(gateway: Arc<Gateway>) -> GatewayResult<()> {
    let server = McpServer::new(gateway);
    let mut reader = LineReader::new(stdin());
    let mut out = stdout();
    info!("stdio router ready");

    while let Some(frame) = reader.next_frame().await? {
        if let Some(response) = server.handle_frame(&frame).await {
            write_line(&mut out, &response).await?;
        }
    }
    info!("stdin closed, shutting down");
    server.gateway().shutdown().await;
    Ok(())
}
