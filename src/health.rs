//! Health & Metrics (§4.L): aggregate subsystem probes plus the
//! `/mcp/*` introspection surface over the tool registry and WebSocket hub.
//!
//! Grounded on the teacher's `PerformanceManager` health-status derivation
//! (`integration/mcp/performance.rs`), narrowed to the thresholds spec.md
//! names rather than that module's fuller scoring model.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::rpc::registry::ToolRegistry;
use crate::ws::hub::WsHub;

#[derive(Clone)]
pub struct HealthState {
    pub registry: Arc<ToolRegistry>,
    pub hub: Arc<WsHub>,
    pub started_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum McpStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl McpStatus {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

/// `/mcp/health` status derivation (§4.J): unhealthy if overall error rate
/// exceeds 50%; degraded if it exceeds 20%, or any tool with more than 5
/// calls has an error rate over 50% or an average execution time over 10s.
fn derive_status(registry_metrics: &std::collections::HashMap<String, crate::rpc::registry::ExecutionMetric>) -> McpStatus {
    let total_calls: u64 = registry_metrics.values().map(|m| m.execution_count).sum();
    let total_errors: u64 = registry_metrics.values().map(|m| m.error_count).sum();
    let overall_error_rate = if total_calls == 0 {
        0.0
    } else {
        total_errors as f64 / total_calls as f64
    };

    if overall_error_rate > 0.5 {
        return McpStatus::Unhealthy;
    }

    let any_tool_degraded = registry_metrics.values().any(|m| {
        m.execution_count > 5 && (m.error_rate() > 0.5 || m.average_execution_time_ms > 10_000.0)
    });

    if overall_error_rate > 0.2 || any_tool_degraded {
        McpStatus::Degraded
    } else {
        McpStatus::Healthy
    }
}

/// `GET /health` — `{status, services, uptime, mcp:{tools, validation}}`.
pub async fn health_handler(State(state): State<HealthState>) -> Json<Value> {
    let tool_names = state.registry.tool_names().await;
    let hub_stats = state.hub.stats().await;

    Json(json!({
        "status": "healthy",
        "services": {
            "tool_registry": "up",
            "websocket_hub": "up",
            "connections": hub_stats.connection_count,
        },
        "uptime": state.started_at.elapsed().as_secs(),
        "mcp": {
            "tools": tool_names,
            "validation": "enabled",
        },
    }))
}

/// `GET /mcp/health`.
pub async fn mcp_health_handler(State(state): State<HealthState>) -> Json<Value> {
    let metrics = state.registry.metrics().await;
    let status = derive_status(&metrics);

    Json(json!({
        "status": status.as_str(),
        "toolCount": metrics.len(),
        "totalExecutions": metrics.values().map(|m| m.execution_count).sum::<u64>(),
        "totalErrors": metrics.values().map(|m| m.error_count).sum::<u64>(),
    }))
}

/// `GET /mcp/metrics`.
pub async fn mcp_metrics_handler(State(state): State<HealthState>) -> Json<Value> {
    let metrics = state.registry.metrics().await;
    Json(json!({ "metrics": metrics }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

/// `GET /mcp/history?limit=`.
pub async fn mcp_history_handler(State(state): State<HealthState>, Query(query): Query<HistoryQuery>) -> Json<Value> {
    let limit = query.limit.unwrap_or(100);
    let history = state.registry.history(limit).await;
    Json(json!({ "history": history }))
}

/// `GET /mcp/performance` — per-tool durations and a short textual
/// recommendation, not a numeric score.
pub async fn mcp_performance_handler(State(state): State<HealthState>) -> Json<Value> {
    let metrics = state.registry.metrics().await;
    let recommendations: Vec<Value> = metrics
        .iter()
        .map(|(name, metric)| {
            json!({
                "tool": name,
                "averageExecutionTimeMs": metric.average_execution_time_ms,
                "errorRate": metric.error_rate(),
                "executionCount": metric.execution_count,
                "recommendation": recommendation_for(metric),
            })
        })
        .collect();

    Json(json!({ "recommendations": recommendations }))
}

fn recommendation_for(metric: &crate::rpc::registry::ExecutionMetric) -> &'static str {
    if metric.execution_count == 0 {
        "no executions recorded yet"
    } else if metric.error_rate() > 0.5 {
        "high error rate; investigate recent failures before relying on this tool"
    } else if metric.average_execution_time_ms > 10_000.0 {
        "average execution time exceeds 10s; consider caching or optimizing this tool"
    } else if metric.error_rate() > 0.2 {
        "elevated error rate; monitor closely"
    } else {
        "operating within expected bounds"
    }
}

/// `GET /mcp/stats` — a superset view combining tool and WebSocket hub
/// stats for operators.
pub async fn mcp_stats_handler(State(state): State<HealthState>) -> Json<Value> {
    let metrics = state.registry.metrics().await;
    let hub_stats = state.hub.stats().await;

    Json(json!({
        "tools": {
            "registered": metrics.len(),
            "totalExecutions": metrics.values().map(|m| m.execution_count).sum::<u64>(),
            "totalErrors": metrics.values().map(|m| m.error_count).sum::<u64>(),
        },
        "websocket": {
            "connections": hub_stats.connection_count,
            "subscriptions": hub_stats.subscription_count,
            "throttleEvents": hub_stats.total_throttle_events,
        },
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::rpc::registry::{ExecutionMetric, ToolDefinition};
    use crate::rpc::schema::InputSchema;
    use serde_json::json as jsonmacro;
    use std::collections::HashMap;
    use std::sync::Arc;

    fn state() -> HealthState {
        HealthState {
            registry: Arc::new(ToolRegistry::new()),
            hub: Arc::new(WsHub::new(Arc::new(EventBus::new()))),
            started_at: Instant::now(),
        }
    }

    #[test]
    fn healthy_with_no_metrics() {
        let metrics = HashMap::new();
        assert_eq!(derive_status(&metrics), McpStatus::Healthy);
    }

    #[test]
    fn unhealthy_over_50_percent_errors() {
        let mut metrics = HashMap::new();
        let mut metric = ExecutionMetric::default();
        metric.execution_count = 10;
        metric.error_count = 6;
        metric.success_count = 4;
        metrics.insert("t1".to_string(), metric);
        assert_eq!(derive_status(&metrics), McpStatus::Unhealthy);
    }

    #[test]
    fn degraded_when_single_tool_is_slow() {
        let mut metrics = HashMap::new();
        let mut metric = ExecutionMetric::default();
        metric.execution_count = 10;
        metric.success_count = 10;
        metric.average_execution_time_ms = 15_000.0;
        metrics.insert("slow".to_string(), metric);
        assert_eq!(derive_status(&metrics), McpStatus::Degraded);
    }

    #[tokio::test]
    async fn health_handler_reports_registered_tools() {
        let state = state();
        state
            .registry
            .register(ToolDefinition {
                name: "echo".to_string(),
                description: "echoes".to_string(),
                input_schema: InputSchema::new(),
                handler: Arc::new(|params| Box::pin(async move { Ok(params) })),
            })
            .await;

        let response = health_handler(State(state)).await;
        let body = response.0;
        assert_eq!(body["mcp"]["tools"], jsonmacro!(["echo"]));
    }
}
