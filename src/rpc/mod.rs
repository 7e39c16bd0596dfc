//! JSON-RPC Tool Router (§4.J): schema-validated tool registration,
//! execution metrics/history, and single/batch dispatch.

pub mod registry;
pub mod router;
pub mod schema;

pub use registry::{ExecutionHistoryEntry, ExecutionMetric, ToolDefinition, ToolDescriptor, ToolFuture, ToolHandler, ToolRegistry};
pub use router::{handle_payload, JsonRpcRequest, RpcRequestShape, SimplifiedCall};
pub use schema::{validate_params, InputSchema, ParamType, SchemaProperty};
