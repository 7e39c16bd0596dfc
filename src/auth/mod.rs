//! Credential subsystem: API-key registry, refresh-session store, JWT
//! helpers, and the auth resolver that ties them together (§4.B, §4.C,
//! §4.E).

pub mod api_keys;
pub mod jwt;
pub mod resolver;
pub mod sessions;

pub use api_keys::{ApiKeyAuth, ApiKeyRecord, ApiKeyRegistry};
pub use resolver::{AuthContext, AuthResolver, Decision, TokenError, TokenType};
pub use sessions::{RefreshSessionStore, ValidationOutcome, ValidationResult};
