//! HTTP router: one JSON-RPC POST endpoint plus an SSE event stream.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use futures::stream::Stream;
use futures::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::info;

use tmg_wire::{GatewayError, GatewayResult};

use crate::core::gateway::Gateway;
use crate::core::server::McpServer;

pub fn router(gateway: Arc<Gateway>) -> Router {
    let server = Arc::new(McpServer::new(gateway));
    Router::new()
        .route("/mcp", post(handle_rpc))
        .route("/events", get(handle_events))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(server)
}

pub async fn serve(gateway: Arc<Gateway>, listen: &str) -> GatewayResult<()> {
    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| GatewayError::config(format!("bind {}: {}", listen, e)))?;
    info!(listen, "http router listening");
    axum::serve(listener, router(gateway))
        .await
        .map_err(|e| GatewayError::internal(format!("http server: {}", e)))
}

async fn handle_rpc(State(server): State<Arc<McpServer>>, body: String) -> impl IntoResponse {
    match server.handle_frame(&body).await {
        Some(response) => (
            StatusCode::OK,
            [("content-type", "application/json")],
            response,
        )
            .into_response(),
        // Notifications produce no body.
        None => StatusCode::ACCEPTED.into_response(),
    }
}

/// Streamed engine updates: one SSE event per engine event, `event:` set
/// to the variant tag and `data:` carrying the JSON payload.
async fn handle_events(
    State(server): State<Arc<McpServer>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = server.gateway().subscribe_events();
    let stream = BroadcastStream::new(events).filter_map(|item| async move {
        let event = item.ok()?;
        let payload = serde_json::to_value(&event).ok()?;
        let kind = payload
            .get("event")
            .and_then(serde_json::Value::as_str)
            .unwrap_or("event")
            .to_string();
        Some(Ok(Event::default().event(kind).data(payload.to_string())))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
