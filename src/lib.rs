//! Gatekeeper: the multiplexed REST/JSON-RPC/WebSocket API gateway core
//! for a knowledge-graph and code-intelligence platform.
//!
//! This crate owns authentication, authorization, rate limiting, the
//! uniform error envelope, the event bus, the WebSocket subscription hub,
//! and the JSON-RPC tool router. Domain handlers (graph queries, code
//! analysis, admin workflows) live outside this crate and are wired in
//! through the tool registry and the scope catalogue.

#![warn(clippy::all)]
#![recursion_limit = "1024"]

pub mod auth;
pub mod authz;
pub mod core;
pub mod dispatcher;
pub mod envelope;
pub mod events;
pub mod health;
pub mod ratelimit;
pub mod refresh;
pub mod rpc;
pub mod scope;
pub mod ws;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use core::{
    config::GatewayConfig,
    error::{GatewayError, Result},
    logging::initialize_default_logging,
};
pub use dispatcher::{build_router, AppState};
