//! HTTP transport: `POST /mcp` carries one JSON-RPC message per request,
//! `GET /health` reports liveness.
//!
//! Each request is its own session, authenticated by the `X-API-Key`
//! header or an `Authorization: Bearer` token.

use esxi_mcp::protocol::{SERVER_NAME, SERVER_VERSION};
use esxi_mcp::McpServer;

use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::sync::Arc;

pub const API_KEY_HEADER: &str = "x-api-key";

pub fn create_router(server: Arc<McpServer>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/mcp", post(mcp_endpoint))
        .with_state(server)
}

pub async fn serve(
    server: Arc<McpServer>,
    addr: &str,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("MCP server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, create_router(server))
        .with_graceful_shutdown(shutdown)
        .await
}

/// Key presented by the client, if any.
pub fn presented_key(headers: &HeaderMap) -> Option<&str> {
    let header = |name| headers.get(name).and_then(|v| v.to_str().ok());
    header(API_KEY_HEADER).or_else(|| header(AUTHORIZATION.as_str()).and_then(|v| v.strip_prefix("Bearer ")))
}

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": SERVER_NAME,
        "version": SERVER_VERSION,
    }))
}

async fn mcp_endpoint(State(server): State<Arc<McpServer>>, headers: HeaderMap, body: String) -> Response {
    let session = server.gate().session_for(presented_key(&headers));
    match server.handle_message(&body, &session).await {
        Some(response) => Json(response).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use esxi_mcp::ApiKeyGate;
    use esxi_vsphere::testing::FakeHypervisor;
    use esxi_vsphere::types::CoordinationConfig;
    use esxi_vsphere::{InfraService, PlacementDefaults};
    use serde_json::{json, Value};

    async fn server(key: Option<&str>) -> Arc<McpServer> {
        let fake = Arc::new(FakeHypervisor::standalone_host());
        fake.add_vm("vm-1", "web01", "poweredOff");
        let service = InfraService::connect(fake, CoordinationConfig::default(), &PlacementDefaults::default())
            .await
            .unwrap();
        Arc::new(McpServer::new(Arc::new(service), ApiKeyGate::new(key.map(str::to_string))))
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn list_vms() -> String {
        json!({"jsonrpc": "2.0", "id": 1, "method": "tools/call", "params": {"name": "list_vms"}}).to_string()
    }

    #[test]
    fn key_from_either_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(presented_key(&headers), None);
        headers.insert(AUTHORIZATION, "Bearer abc".parse().unwrap());
        assert_eq!(presented_key(&headers), Some("abc"));
        headers.insert(API_KEY_HEADER, "xyz".parse().unwrap());
        assert_eq!(presented_key(&headers), Some("xyz"));
    }

    #[tokio::test]
    async fn notifications_are_accepted_without_body() {
        let server = server(None).await;
        let body = json!({"jsonrpc": "2.0", "method": "notifications/initialized"}).to_string();
        let response = mcp_endpoint(State(server), HeaderMap::new(), body).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
    }

    #[tokio::test]
    async fn header_key_authenticates_the_request() {
        let server = server(Some("s3cret")).await;

        let denied = body_json(mcp_endpoint(State(server.clone()), HeaderMap::new(), list_vms()).await).await;
        assert_eq!(denied["result"]["isError"], true);

        let mut headers = HeaderMap::new();
        headers.insert(API_KEY_HEADER, "s3cret".parse().unwrap());
        let allowed = body_json(mcp_endpoint(State(server), headers, list_vms()).await).await;
        assert_eq!(allowed["result"]["isError"], false);
    }

    #[tokio::test]
    async fn health_names_the_server() {
        let Json(v) = health_check().await;
        assert_eq!(v["service"], "VMware-MCP-Server");
    }
}
