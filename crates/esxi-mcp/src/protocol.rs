//! JSON-RPC 2.0 message types and MCP constants.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fmt;

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: &str = "2024-11-05";
pub const SERVER_NAME: &str = "VMware-MCP-Server";
pub const SERVER_VERSION: &str = "0.0.1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    #[serde(default)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    /// Absent for notifications.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
}

impl RpcRequest {
    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub jsonrpc: String,
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
}

impl RpcResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), id, result: Some(result), error: None }
    }

    pub fn failure(id: Value, error: McpError) -> Self {
        Self { jsonrpc: JSONRPC_VERSION.into(), id, result: None, error: Some(error) }
    }
}

/// Protocol-level error, carried in the `error` member of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl McpError {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(Self::PARSE_ERROR, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_REQUEST, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(Self::METHOD_NOT_FOUND, format!("Method not found: {method}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(Self::INVALID_PARAMS, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Self::INTERNAL_ERROR, message)
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for McpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl std::error::Error for McpError {}

/// Decode one incoming message. On failure the returned id, when one could
/// be read, is the id to answer with.
pub fn parse_request(raw: &str) -> Result<RpcRequest, (Value, McpError)> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| (Value::Null, McpError::parse_error(format!("Parse error: {e}"))))?;
    request_from_value(value)
}

pub fn request_from_value(value: Value) -> Result<RpcRequest, (Value, McpError)> {
    let id = value.get("id").cloned().unwrap_or(Value::Null);
    if !value.is_object() {
        return Err((id, McpError::invalid_request("Request must be a JSON object")));
    }
    let request: RpcRequest = serde_json::from_value(value)
        .map_err(|e| (id.clone(), McpError::invalid_request(format!("Invalid request: {e}"))))?;
    if request.jsonrpc != JSONRPC_VERSION {
        return Err((id, McpError::invalid_request("jsonrpc must be \"2.0\"")));
    }
    Ok(request)
}

/// `tools/call` result holding a single text block.
pub fn tool_result(text: String, is_error: bool) -> Value {
    json!({
        "content": [{ "type": "text", "text": text }],
        "isError": is_error,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_a_parse_error() {
        let (id, err) = parse_request("{not json").unwrap_err();
        assert_eq!(id, Value::Null);
        assert_eq!(err.code, McpError::PARSE_ERROR);
    }

    #[test]
    fn wrong_version_keeps_the_id() {
        let (id, err) = parse_request(r#"{"jsonrpc":"1.0","id":7,"method":"ping"}"#).unwrap_err();
        assert_eq!(id, json!(7));
        assert_eq!(err.code, McpError::INVALID_REQUEST);
    }

    #[test]
    fn missing_id_is_a_notification() {
        let req = parse_request(r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#).unwrap();
        assert!(req.is_notification());
        assert_eq!(req.params, Value::Null);
    }

    #[test]
    fn responses_omit_the_unused_member() {
        let ok = serde_json::to_value(RpcResponse::success(json!(1), json!({}))).unwrap();
        assert!(ok.get("error").is_none());
        let err = serde_json::to_value(RpcResponse::failure(json!(1), McpError::method_not_found("x"))).unwrap();
        assert!(err.get("result").is_none());
        assert_eq!(err["error"]["code"], -32601);
    }
}
