//! Tool registry, execution metrics, and the execution-history ring buffer
//! (§3 `ToolDefinition`/`ExecutionMetric`/`ExecutionHistoryEntry`, §4.J).
//!
//! Grounded on the teacher's `ToolRegistry` (`integration/mcp/tools.rs`):
//! a `HashMap<String, ToolDefinition>` of boxed async handlers, generalized
//! from the teacher's Hive-specific tool set to an empty registry the
//! gateway's outer process populates with narrow capability handlers at
//! startup (§9 Design Note on duck-typed collaborators becoming explicit
//! capability interfaces).

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::core::error::GatewayError;
use crate::rpc::schema::InputSchema;

pub type ToolFuture = Pin<Box<dyn Future<Output = Result<Value, GatewayError>> + Send>>;
pub type ToolHandler = Arc<dyn Fn(Value) -> ToolFuture + Send + Sync>;

pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: InputSchema,
    pub handler: ToolHandler,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// §3 `ExecutionMetric`, one per registered tool.
#[derive(Debug, Clone, Serialize, Default)]
pub struct ExecutionMetric {
    pub execution_count: u64,
    pub total_execution_time_ms: f64,
    pub average_execution_time_ms: f64,
    pub error_count: u64,
    pub success_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_execution_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error_message: Option<String>,
}

impl ExecutionMetric {
    fn record(&mut self, duration: Duration, success: bool, error_message: Option<&str>) {
        self.execution_count += 1;
        self.total_execution_time_ms += duration.as_secs_f64() * 1000.0;
        self.average_execution_time_ms = self.total_execution_time_ms / self.execution_count as f64;
        self.last_execution_time = Some(Utc::now());
        if success {
            self.success_count += 1;
        } else {
            self.error_count += 1;
            self.last_error_time = Some(Utc::now());
            self.last_error_message = error_message.map(|s| s.to_string());
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.execution_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.execution_count as f64
        }
    }
}

/// §3 `ExecutionHistoryEntry`, ring-buffered to 1000 entries.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionHistoryEntry {
    pub tool_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: f64,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

const HISTORY_CAPACITY: usize = 1000;

pub struct ToolRegistry {
    tools: RwLock<HashMap<String, ToolDefinition>>,
    metrics: RwLock<HashMap<String, ExecutionMetric>>,
    history: RwLock<VecDeque<ExecutionHistoryEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            metrics: RwLock::new(HashMap::new()),
            history: RwLock::new(VecDeque::with_capacity(HISTORY_CAPACITY)),
        }
    }

    pub async fn register(&self, definition: ToolDefinition) {
        self.metrics
            .write()
            .await
            .entry(definition.name.clone())
            .or_insert_with(ExecutionMetric::default);
        self.tools.write().await.insert(definition.name.clone(), definition);
    }

    pub async fn is_registered(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    pub async fn list(&self) -> Vec<ToolDescriptor> {
        self.tools
            .read()
            .await
            .values()
            .map(|t| ToolDescriptor {
                name: t.name.clone(),
                description: t.description.clone(),
                input_schema: t.input_schema.to_json_schema(),
            })
            .collect()
    }

    pub async fn schema_for(&self, name: &str) -> Option<InputSchema> {
        self.tools.read().await.get(name).map(|t| t.input_schema.clone())
    }

    /// Execute a registered tool, recording its metric and history entry
    /// regardless of success — the Design Note against silent-swallowing
    /// (§9) applies here: every call is accounted for.
    pub async fn call(&self, name: &str, params: Value) -> Result<Value, GatewayError> {
        let handler = {
            let tools = self.tools.read().await;
            tools
                .get(name)
                .ok_or_else(|| GatewayError::RpcMethodNotFound { method: name.to_string() })?
                .handler
                .clone()
        };

        let start = Instant::now();
        let start_time = Utc::now();
        let result = handler(params.clone()).await;
        let duration = start.elapsed();
        let end_time = Utc::now();

        let success = result.is_ok();
        let error_message = result.as_ref().err().map(|e| e.to_string());

        {
            let mut metrics = self.metrics.write().await;
            metrics
                .entry(name.to_string())
                .or_default()
                .record(duration, success, error_message.as_deref());
        }
        {
            let mut history = self.history.write().await;
            if history.len() >= HISTORY_CAPACITY {
                history.pop_front();
            }
            history.push_back(ExecutionHistoryEntry {
                tool_name: name.to_string(),
                start_time,
                end_time,
                duration_ms: duration.as_secs_f64() * 1000.0,
                success,
                error_message,
                params: Some(params),
            });
        }

        result
    }

    pub async fn metrics(&self) -> HashMap<String, ExecutionMetric> {
        self.metrics.read().await.clone()
    }

    pub async fn history(&self, limit: usize) -> Vec<ExecutionHistoryEntry> {
        let history = self.history.read().await;
        history.iter().rev().take(limit).cloned().collect()
    }

    pub async fn tool_names(&self) -> Vec<String> {
        self.tools.read().await.keys().cloned().collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::schema::{ParamType, SchemaProperty};
    use serde_json::json;

    fn echo_tool() -> ToolDefinition {
        ToolDefinition {
            name: "echo".to_string(),
            description: "echoes its input".to_string(),
            input_schema: InputSchema::new()
                .property("message", SchemaProperty::new(ParamType::String))
                .require(&["message"]),
            handler: Arc::new(|params: Value| Box::pin(async move { Ok(params) })),
        }
    }

    fn failing_tool() -> ToolDefinition {
        ToolDefinition {
            name: "boom".to_string(),
            description: "always fails".to_string(),
            input_schema: InputSchema::new(),
            handler: Arc::new(|_| {
                Box::pin(async move {
                    Err(GatewayError::internal("tool", "kaboom"))
                })
            }),
        }
    }

    #[tokio::test]
    async fn call_records_metric_and_history() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool()).await;

        let result = registry.call("echo", json!({"message": "hi"})).await.unwrap();
        assert_eq!(result, json!({"message": "hi"}));

        let metrics = registry.metrics().await;
        let metric = metrics.get("echo").unwrap();
        assert_eq!(metric.execution_count, 1);
        assert_eq!(metric.success_count, 1);
        assert_eq!(metric.error_count, 0);
        assert_eq!(metric.average_execution_time_ms, metric.total_execution_time_ms);

        let history = registry.history(10).await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tool_name, "echo");
        assert!(history[0].success);
    }

    #[tokio::test]
    async fn failing_tool_updates_error_metric() {
        let registry = ToolRegistry::new();
        registry.register(failing_tool()).await;

        let result = registry.call("boom", json!({})).await;
        assert!(result.is_err());

        let metrics = registry.metrics().await;
        let metric = metrics.get("boom").unwrap();
        assert_eq!(metric.error_count, 1);
        assert_eq!(metric.success_count, 0);
        assert!(metric.last_error_message.is_some());
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let registry = ToolRegistry::new();
        let err = registry.call("ghost", json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::RpcMethodNotFound { .. }));
    }

    #[tokio::test]
    async fn execution_count_equals_success_plus_error() {
        let registry = ToolRegistry::new();
        registry.register(echo_tool()).await;
        registry.register(failing_tool()).await;

        let _ = registry.call("echo", json!({"message": "a"})).await;
        let _ = registry.call("echo", json!({"message": "b"})).await;
        let _ = registry.call("boom", json!({})).await;

        let metrics = registry.metrics().await;
        for metric in metrics.values() {
            assert_eq!(metric.execution_count, metric.success_count + metric.error_count);
        }
    }
}
