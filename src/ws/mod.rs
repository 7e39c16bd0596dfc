//! WebSocket Hub (§4.I): upgrade handling, per-connection subscription
//! sets, filter-based event matching, and backpressure management.

pub mod connection;
pub mod filter;
pub mod hub;

pub use connection::{ConnectionHandle, Subscription};
pub use filter::{matches_event, normalize_filter, NormalizedFilter, RawFilter};
pub use hub::{require_websocket_upgrade, upgrade_handler, HubStats, WsHub, WsUpgradeState};
