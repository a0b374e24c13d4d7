//! MCP method dispatcher.
//!
//! Transport independent: stdio and HTTP both feed decoded requests into
//! [`McpServer::handle`] together with the caller's [`Session`].

use crate::auth::{ApiKeyGate, Session};
use crate::protocol::*;
use crate::tools::{tool_table, ToolCall};

use esxi_vsphere::{CancelFlag, InfraService, OperationResult, OutcomeKind};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

pub const VMSTATS_SCHEME: &str = "vmstats://";

pub struct McpServer {
    service: Arc<InfraService>,
    gate: ApiKeyGate,
    /// Cancel flags of in-flight `tools/call` requests. Request ids are only
    /// unique within a session, so the session id is part of the key.
    inflight: Mutex<HashMap<InflightKey, CancelFlag>>,
}

type InflightKey = (u64, String);

/// Removes the request's cancel flag when the call finishes or is dropped.
pub struct InflightGuard<'a> {
    server: &'a McpServer,
    key: InflightKey,
    flag: CancelFlag,
}

impl InflightGuard<'_> {
    pub fn flag(&self) -> &CancelFlag {
        &self.flag
    }
}

impl Drop for InflightGuard<'_> {
    /// Leaves the entry alone if a later request reusing the id replaced it.
    fn drop(&mut self) {
        self.server.with_inflight(|m| {
            if m.get(&self.key).is_some_and(|f| f.same_flag(&self.flag)) {
                m.remove(&self.key);
            }
        });
    }
}

impl McpServer {
    pub fn new(service: Arc<InfraService>, gate: ApiKeyGate) -> Self {
        Self { service, gate, inflight: Mutex::new(HashMap::new()) }
    }

    pub fn gate(&self) -> &ApiKeyGate {
        &self.gate
    }

    fn with_inflight<R>(&self, f: impl FnOnce(&mut HashMap<InflightKey, CancelFlag>) -> R) -> R {
        let mut guard = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
        f(&mut guard)
    }

    pub fn register(&self, session: &Session, id: &Value) -> InflightGuard<'_> {
        let key = (session.id(), id.to_string());
        let flag = CancelFlag::new();
        self.with_inflight(|m| m.insert(key.clone(), flag.clone()));
        InflightGuard { server: self, key, flag }
    }

    /// Signal the in-flight request `id` of `session`. Returns whether one
    /// was found.
    pub fn cancel(&self, session: &Session, id: &Value) -> bool {
        match self.with_inflight(|m| m.get(&(session.id(), id.to_string())).cloned()) {
            Some(flag) => {
                flag.cancel();
                true
            }
            None => false,
        }
    }

    /// Decode and handle one raw message. `None` for notifications.
    pub async fn handle_message(&self, raw: &str, session: &Session) -> Option<RpcResponse> {
        match parse_request(raw) {
            Ok(request) => self.handle(request, session).await,
            Err((id, err)) => {
                log::warn!("Rejected message: {err}");
                Some(RpcResponse::failure(id, err))
            }
        }
    }

    pub async fn handle(&self, request: RpcRequest, session: &Session) -> Option<RpcResponse> {
        let Some(id) = request.id.clone() else {
            self.notification(&request, session);
            return None;
        };
        let outcome = match request.method.as_str() {
            "initialize" => Ok(self.initialize()),
            "ping" => Ok(json!({})),
            "tools/list" => Ok(json!({ "tools": tool_table() })),
            "tools/call" => self.call_tool(&id, &request.params, session).await,
            "resources/list" => Ok(json!({ "resources": [vmstats_resource()] })),
            "resources/templates/list" => Ok(json!({ "resourceTemplates": [vmstats_template()] })),
            "resources/read" => self.read_resource(&request.params, session).await,
            other => {
                log::warn!("Unknown method: {other}");
                Err(McpError::method_not_found(other))
            }
        };
        Some(match outcome {
            Ok(result) => RpcResponse::success(id, result),
            Err(err) => RpcResponse::failure(id, err),
        })
    }

    fn notification(&self, request: &RpcRequest, session: &Session) {
        match request.method.as_str() {
            "notifications/initialized" => log::debug!("Client initialized"),
            "notifications/cancelled" => {
                let Some(target) = request.params.get("requestId") else {
                    log::warn!("Cancellation without requestId");
                    return;
                };
                if self.cancel(session, target) {
                    log::info!("Cancellation requested for request {target}");
                } else {
                    log::debug!("Cancellation for unknown or finished request {target}");
                }
            }
            other => log::debug!("Ignoring notification {other}"),
        }
    }

    fn initialize(&self) -> Value {
        json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {
                "tools": { "listChanged": false },
                "resources": { "subscribe": false, "listChanged": false },
            },
            "serverInfo": { "name": SERVER_NAME, "version": SERVER_VERSION },
        })
    }

    async fn call_tool(&self, id: &Value, params: &Value, session: &Session) -> Result<Value, McpError> {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_params("tools/call requires a tool name"))?;
        let empty = Map::new();
        let args = match params.get("arguments") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(m)) => m,
            Some(_) => return Err(McpError::invalid_params("arguments must be an object")),
        };

        let Some(call) = ToolCall::parse(name, args)? else {
            log::warn!("Unknown tool: {name}");
            return render(&OperationResult::not_found(format!("Unknown tool: {name}")));
        };

        let result = match call {
            ToolCall::Authenticate { key } => self.authenticate(&key, session),
            _ if !session.is_authenticated() => {
                log::warn!("Rejected unauthenticated call to {name}");
                OperationResult::precondition_failed("Unauthorized: API key required.")
            }
            call => {
                let inflight = self.register(session, id);
                log::debug!("Calling tool {name}");
                call.execute(&self.service, inflight.flag()).await
            }
        };
        if !result.is_ok() {
            log::warn!("Tool {name} failed ({:?}): {}", result.kind, result.message);
        }
        render(&result)
    }

    fn authenticate(&self, key: &str, session: &Session) -> OperationResult {
        if !self.gate.is_enabled() {
            return OperationResult::ok("No API key is configured; authentication is not required.");
        }
        if self.gate.verify(key) {
            session.mark_authenticated();
            log::info!("Session authenticated");
            OperationResult::ok("Authentication successful.")
        } else {
            log::warn!("Authentication failed");
            OperationResult::precondition_failed("Authentication failed: invalid API key.")
        }
    }

    async fn read_resource(&self, params: &Value, session: &Session) -> Result<Value, McpError> {
        let uri = params
            .get("uri")
            .and_then(Value::as_str)
            .ok_or_else(|| McpError::invalid_params("resources/read requires a uri"))?;
        let vm_name = uri
            .strip_prefix(VMSTATS_SCHEME)
            .filter(|n| !n.is_empty())
            .ok_or_else(|| McpError::invalid_params(format!("Unknown resource: {uri}")))?;
        if !session.is_authenticated() {
            return Err(McpError::invalid_request("Unauthorized: API key required."));
        }

        let result = self.service.get_vm_performance(vm_name).await;
        match (&result.kind, &result.payload) {
            (OutcomeKind::Ok, Some(payload)) => Ok(json!({
                "contents": [{
                    "uri": uri,
                    "mimeType": "application/json",
                    "text": pretty(payload)?,
                }],
            })),
            (OutcomeKind::NotFound, _) => Err(McpError::invalid_params(result.message.clone())),
            _ => Err(McpError::internal(result.message.clone()).with_data(json!(result))),
        }
    }
}

fn vmstats_resource() -> Value {
    json!({
        "name": "vmStats",
        "uri": "vmstats://{vm_name}",
        "description": "Get CPU, memory, storage, network usage of a VM",
        "mimeType": "application/json",
    })
}

fn vmstats_template() -> Value {
    json!({
        "name": "vmStats",
        "uriTemplate": "vmstats://{vm_name}",
        "description": "Get CPU, memory, storage, network usage of a VM",
        "mimeType": "application/json",
    })
}

fn pretty(v: &impl serde::Serialize) -> Result<String, McpError> {
    serde_json::to_string_pretty(v).map_err(|e| McpError::internal(format!("Failed to encode result: {e}")))
}

/// Every outcome is rendered as its JSON form; failures are flagged.
fn render(result: &OperationResult) -> Result<Value, McpError> {
    Ok(tool_result(pretty(result)?, !result.is_ok()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use esxi_vsphere::testing::FakeHypervisor;
    use esxi_vsphere::types::CoordinationConfig;
    use esxi_vsphere::PlacementDefaults;

    async fn server(api_key: Option<&str>) -> (McpServer, Arc<FakeHypervisor>) {
        let fake = Arc::new(FakeHypervisor::standalone_host());
        fake.add_vm("vm-1", "web01", "poweredOn");

        let service = InfraService::connect(fake.clone(), CoordinationConfig::default(), &PlacementDefaults::default())
            .await
            .unwrap();
        let server = McpServer::new(Arc::new(service), ApiKeyGate::new(api_key.map(str::to_string)));
        (server, fake)
    }

    fn call(id: i64, name: &str, arguments: Value) -> RpcRequest {
        RpcRequest {
            jsonrpc: "2.0".into(),
            method: "tools/call".into(),
            params: json!({ "name": name, "arguments": arguments }),
            id: Some(json!(id)),
        }
    }

    fn text(resp: &RpcResponse) -> Value {
        let result = resp.result.as_ref().unwrap();
        serde_json::from_str(result["content"][0]["text"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let (server, _) = server(None).await;
        let resp = server.handle_message(r#"{"jsonrpc":"2.0","id":1,"method":"bogus"}"#, &Session::new(true)).await;
        assert_eq!(resp.unwrap().error.unwrap().code, McpError::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (server, _) = server(None).await;
        let resp = server
            .handle_message(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#, &Session::new(true))
            .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn gate_blocks_until_authenticated() {
        let (server, fake) = server(Some("s3cret")).await;
        let session = server.gate().session();

        let resp = server.handle(call(1, "list_vms", json!({})), &session).await.unwrap();
        assert_eq!(resp.result.as_ref().unwrap()["isError"], true);
        assert_eq!(text(&resp)["message"], "Unauthorized: API key required.");
        assert!(fake.calls_matching("list_vms").is_empty());

        let resp = server.handle(call(2, "authenticate", json!({"key": "wrong"})), &session).await.unwrap();
        assert_eq!(text(&resp)["kind"], "precondition_failed");

        server.handle(call(3, "authenticate", json!({"key": "s3cret"})), &session).await.unwrap();
        let resp = server.handle(call(4, "list_vms", json!({})), &session).await.unwrap();
        assert_eq!(resp.result.as_ref().unwrap()["isError"], false);
        assert_eq!(text(&resp)["payload"], json!(["web01"]));
    }

    #[tokio::test]
    async fn unknown_tool_is_a_tool_error() {
        let (server, _) = server(None).await;
        let resp = server.handle(call(1, "deploy_ova", json!({})), &Session::new(true)).await.unwrap();
        assert!(resp.error.is_none());
        assert_eq!(text(&resp)["kind"], "not_found");
    }

    #[tokio::test]
    async fn bad_arguments_are_invalid_params() {
        let (server, _) = server(None).await;
        let resp = server.handle(call(1, "power_on_vm", json!({})), &Session::new(true)).await.unwrap();
        assert_eq!(resp.error.unwrap().code, McpError::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn cancellation_reaches_the_registered_flag() {
        let (server, _) = server(None).await;
        let session = Session::new(true);
        let guard = server.register(&session, &json!(42));
        let note = r#"{"jsonrpc":"2.0","method":"notifications/cancelled","params":{"requestId":42}}"#;

        assert!(server.handle_message(note, &Session::new(true)).await.is_none());
        assert!(!guard.flag().is_cancelled(), "another session must not cancel this request");

        assert!(server.handle_message(note, &session).await.is_none());
        assert!(guard.flag().is_cancelled());
        drop(guard);
        assert!(!server.cancel(&session, &json!(42)));
    }

    #[tokio::test]
    async fn reused_request_id_stays_cancellable() {
        let (server, _) = server(None).await;
        let session = Session::new(true);
        let first = server.register(&session, &json!(1));
        let second = server.register(&session, &json!(1));

        drop(first);
        assert!(server.cancel(&session, &json!(1)));
        assert!(second.flag().is_cancelled());
        drop(second);
        assert!(!server.cancel(&session, &json!(1)));
    }

    #[tokio::test]
    async fn same_request_id_in_two_sessions_is_independent() {
        let (server, _) = server(None).await;
        let (a, b) = (Session::new(true), Session::new(true));
        let call_a = server.register(&a, &json!(1));
        let call_b = server.register(&b, &json!(1));

        assert!(server.cancel(&b, &json!(1)));
        assert!(call_b.flag().is_cancelled());
        assert!(!call_a.flag().is_cancelled());

        drop(call_b);
        assert!(server.cancel(&a, &json!(1)));
        assert!(call_a.flag().is_cancelled());
    }

    #[tokio::test]
    async fn vmstats_resource_reads_performance() {
        let (server, _) = server(None).await;
        let req = RpcRequest {
            jsonrpc: "2.0".into(),
            method: "resources/read".into(),
            params: json!({ "uri": "vmstats://web01" }),
            id: Some(json!(9)),
        };
        let resp = server.handle(req, &Session::new(true)).await.unwrap();
        let contents = &resp.result.unwrap()["contents"][0];
        assert_eq!(contents["uri"], "vmstats://web01");
        assert_eq!(contents["mimeType"], "application/json");

        let missing = RpcRequest {
            jsonrpc: "2.0".into(),
            method: "resources/read".into(),
            params: json!({ "uri": "vmstats://ghost" }),
            id: Some(json!(10)),
        };
        let resp = server.handle(missing, &Session::new(true)).await.unwrap();
        assert_eq!(resp.error.unwrap().message, "VM 'ghost' not found");
    }
}
