//! JSON-RPC Tool Router (§4.J): method discovery, parameter validation,
//! single & batch dispatch, and the two request shapes spec.md names.
//!
//! Grounded on the teacher's `McpMessage`/`McpRequest`/`McpResponse`
//! untagged-enum wire types (`integration/mcp/protocol.rs`) and its
//! `ToolRegistry` dispatch loop (`integration/mcp/tools.rs`), generalized
//! to accept both the strict JSON-RPC 2.0 envelope and the simplified
//! `{toolName, arguments}` shape spec.md §9 notes as an open product
//! question — both are implemented here, each producing the response
//! shape idiomatic to itself (a JSON-RPC response for the former, the
//! gateway's plain success/error envelope for the latter) rather than
//! forcing one through the other's wire format.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::error::GatewayError;
use crate::envelope::{ErrorEnvelope, SuccessEnvelope};
use crate::rpc::registry::ToolRegistry;
use crate::rpc::schema::validate_params;

pub const MCP_PROTOCOL_VERSION: &str = "2024-11-05";

#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default)]
    pub jsonrpc: Option<String>,
    #[serde(default)]
    pub id: Option<Value>,
    pub method: String,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimplifiedCall {
    #[serde(rename = "toolName")]
    pub tool_name: String,
    #[serde(default)]
    pub arguments: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum RpcRequestShape {
    JsonRpc(JsonRpcRequest),
    Simplified(SimplifiedCall),
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

fn jsonrpc_response(id: Option<Value>, result: Value) -> Value {
    json!({"jsonrpc": "2.0", "id": id, "result": result})
}

fn jsonrpc_error_response(id: Option<Value>, code: i64, message: impl Into<String>) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message.into()},
    })
}

/// Process one payload — a single JSON value, or an array (batch). Returns
/// `None` when nothing should be written to the wire at all (a bare
/// notification, or a batch whose every entry was a notification).
pub async fn handle_payload(registry: &ToolRegistry, payload: Value, request_id: &str) -> Option<Value> {
    match payload {
        Value::Array(items) => {
            let mut responses = Vec::new();
            for item in items {
                if let Some(response) = process_one(registry, item, request_id).await {
                    responses.push(response);
                }
            }
            if responses.is_empty() {
                None
            } else {
                Some(Value::Array(responses))
            }
        }
        single => process_one(registry, single, request_id).await,
    }
}

async fn process_one(registry: &ToolRegistry, item: Value, request_id: &str) -> Option<Value> {
    let shape: Result<RpcRequestShape, _> = serde_json::from_value(item);
    let shape = match shape {
        Ok(shape) => shape,
        Err(_) => return Some(jsonrpc_error_response(None, -32600, "Invalid request")),
    };

    match shape {
        RpcRequestShape::Simplified(call) => {
            Some(handle_simplified(registry, call, request_id).await)
        }
        RpcRequestShape::JsonRpc(request) => handle_jsonrpc(registry, request, request_id).await,
    }
}

async fn handle_simplified(registry: &ToolRegistry, call: SimplifiedCall, request_id: &str) -> Value {
    let arguments = call.arguments.unwrap_or(Value::Null);
    match invoke_tool(registry, &call.tool_name, arguments).await {
        Ok(result) => serde_json::to_value(SuccessEnvelope::new(request_id, result)).unwrap(),
        Err(error) => {
            let envelope = ErrorEnvelope::from_error_with_context(&error, request_id, Default::default());
            serde_json::to_value(envelope).unwrap()
        }
    }
}

async fn handle_jsonrpc(registry: &ToolRegistry, request: JsonRpcRequest, _request_id: &str) -> Option<Value> {
    let is_notification = request.id.is_none();
    if is_notification {
        if request.method.starts_with("notifications/") {
            return None;
        }
        return Some(jsonrpc_error_response(None, -32600, "Invalid request"));
    }

    let id = request.id.clone();
    let params = request.params.clone().unwrap_or(Value::Null);

    if registry.is_registered(&request.method).await {
        return Some(call_registered_tool(registry, &request.method, params, id).await);
    }

    match request.method.as_str() {
        "initialize" => Some(jsonrpc_response(id, initialize_result())),
        "tools/list" => {
            let tools = registry.list().await;
            Some(jsonrpc_response(id, json!({"tools": tools})))
        }
        "tools/call" => {
            let Some(name) = params.get("name").and_then(Value::as_str) else {
                return Some(jsonrpc_error_response(id, -32602, "Invalid params: Missing required parameters: name"));
            };
            let arguments = params.get("arguments").cloned().unwrap_or(Value::Null);
            Some(call_as_tools_call(registry, name, arguments, id).await)
        }
        other => Some(jsonrpc_error_response(id, -32601, format!("Method not found: {}", other))),
    }
}

async fn call_registered_tool(registry: &ToolRegistry, name: &str, params: Value, id: Option<Value>) -> Value {
    if let Some(schema) = registry.schema_for(name).await {
        if let Err(message) = validate_params(&schema, &params) {
            return jsonrpc_error_response(id, -32602, format!("Invalid params: {}", message));
        }
    }
    match registry.call(name, params).await {
        Ok(result) => jsonrpc_response(id, result),
        Err(error) => jsonrpc_error_response(id, error.rpc_code(), error.to_string()),
    }
}

/// `tools/call` wraps the result in MCP content format rather than
/// returning the raw tool result (§4.J).
async fn call_as_tools_call(registry: &ToolRegistry, name: &str, params: Value, id: Option<Value>) -> Value {
    if !registry.is_registered(name).await {
        return jsonrpc_error_response(id, -32601, format!("Method not found: {}", name));
    }
    if let Some(schema) = registry.schema_for(name).await {
        if let Err(message) = validate_params(&schema, &params) {
            return jsonrpc_error_response(id, -32602, format!("Invalid params: {}", message));
        }
    }
    match registry.call(name, params).await {
        Ok(result) => jsonrpc_response(
            id,
            json!({
                "content": [{"type": "text", "text": serde_json::to_string(&result).unwrap_or_default()}],
            }),
        ),
        Err(error) => jsonrpc_response(
            id,
            json!({
                "content": [{"type": "text", "text": error.to_string()}],
                "isError": true,
            }),
        ),
    }
}

async fn invoke_tool(registry: &ToolRegistry, name: &str, params: Value) -> Result<Value, GatewayError> {
    if !registry.is_registered(name).await {
        return Err(GatewayError::RpcMethodNotFound { method: name.to_string() });
    }
    if let Some(schema) = registry.schema_for(name).await {
        if let Err(message) = validate_params(&schema, &params) {
            return Err(GatewayError::RpcInvalidParams { message });
        }
    }
    registry.call(name, params).await
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": MCP_PROTOCOL_VERSION,
        "capabilities": {"tools": {}},
        "serverInfo": {"name": "gatekeeper-core", "version": env!("CARGO_PKG_VERSION")},
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::registry::ToolDefinition;
    use crate::rpc::schema::{InputSchema, ParamType, SchemaProperty};
    use std::sync::Arc;

    fn registry_with_echo() -> ToolRegistry {
        let registry = ToolRegistry::new();
        registry
    }

    async fn register_echo(registry: &ToolRegistry) {
        registry
            .register(ToolDefinition {
                name: "echo".to_string(),
                description: "echoes".to_string(),
                input_schema: InputSchema::new()
                    .property("message", SchemaProperty::new(ParamType::String))
                    .require(&["message"]),
                handler: Arc::new(|params| Box::pin(async move { Ok(params) })),
            })
            .await;
    }

    #[tokio::test]
    async fn unknown_method_is_method_not_found() {
        let registry = registry_with_echo();
        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "does.not.exist"});
        let response = handle_payload(&registry, payload, "r1").await.unwrap();
        assert_eq!(response["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn notification_produces_no_response() {
        let registry = registry_with_echo();
        let payload = json!({"jsonrpc": "2.0", "method": "notifications/ping"});
        assert!(handle_payload(&registry, payload, "r1").await.is_none());
    }

    #[tokio::test]
    async fn missing_id_non_notification_is_invalid_request() {
        let registry = registry_with_echo();
        let payload = json!({"jsonrpc": "2.0", "method": "tools/list"});
        let response = handle_payload(&registry, payload, "r1").await.unwrap();
        assert_eq!(response["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn batch_mixes_results_and_errors_and_drops_notifications() {
        let registry = registry_with_echo();
        let payload = json!([
            {"jsonrpc": "2.0", "id": 1, "method": "tools/list"},
            {"jsonrpc": "2.0", "method": "notifications/ping"},
            {"jsonrpc": "2.0", "id": 2, "method": "does.not.exist"},
        ]);
        let response = handle_payload(&registry, payload, "r1").await.unwrap();
        let array = response.as_array().unwrap();
        assert_eq!(array.len(), 2);
        assert_eq!(array[0]["id"], 1);
        assert_eq!(array[1]["id"], 2);
        assert_eq!(array[1]["error"]["code"], -32601);
    }

    #[tokio::test]
    async fn registered_tool_called_by_method_name_validates_params() {
        let registry = registry_with_echo();
        register_echo(&registry).await;
        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": {}});
        let response = handle_payload(&registry, payload, "r1").await.unwrap();
        assert_eq!(response["error"]["code"], -32602);
        assert!(response["error"]["message"].as_str().unwrap().contains("message"));
    }

    #[tokio::test]
    async fn tools_call_wraps_result_in_mcp_content() {
        let registry = registry_with_echo();
        register_echo(&registry).await;
        let payload = json!({
            "jsonrpc": "2.0", "id": 1, "method": "tools/call",
            "params": {"name": "echo", "arguments": {"message": "hi"}},
        });
        let response = handle_payload(&registry, payload, "r1").await.unwrap();
        assert_eq!(response["result"]["content"][0]["type"], "text");
    }

    #[tokio::test]
    async fn simplified_shape_returns_plain_envelope() {
        let registry = registry_with_echo();
        register_echo(&registry).await;
        let payload = json!({"toolName": "echo", "arguments": {"message": "hi"}});
        let response = handle_payload(&registry, payload, "r1").await.unwrap();
        assert_eq!(response["success"], true);
        assert_eq!(response["data"]["message"], "hi");
    }
}
