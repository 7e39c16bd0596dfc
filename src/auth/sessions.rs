//! Refresh-Session Store (§4.C): single process-wide instance tracking the
//! one active rotation-id per session, with replay detection.
//!
//! Grounded on the `SessionManager`'s `Arc<RwLock<HashMap<String, Session>>>`
//! plus `cleanup_expired_sessions` sweep in `security/auth.rs`, narrowed to
//! the rotation-id-only model spec.md describes (no password/MFA state).

use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct SessionState {
    active_rotation_id: Option<String>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    Ok,
    MissingSession,
    Seeded,
    TokenReplayed,
}

pub struct ValidationResult {
    pub outcome: ValidationOutcome,
    pub reason: Option<String>,
}

impl ValidationResult {
    pub fn is_ok(&self) -> bool {
        matches!(
            self.outcome,
            ValidationOutcome::Ok | ValidationOutcome::MissingSession | ValidationOutcome::Seeded
        )
    }
}

pub struct RefreshSessionStore {
    sessions: RwLock<HashMap<String, SessionState>>,
}

impl RefreshSessionStore {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn generate_rotation_id(&self) -> String {
        Uuid::new_v4().to_string()
    }

    /// Drop entries whose `expiresAt` has passed. Called before every
    /// validation so an expired session can't be replayed against forever.
    fn sweep(&self) {
        let now = Utc::now();
        self.sessions
            .write()
            .unwrap()
            .retain(|_, state| state.expires_at.map(|exp| exp > now).unwrap_or(true));
    }

    /// §4.C validation semantics: missing `sessionId` is accepted (legacy
    /// tokens); missing `rotationId` seeds the session on first sight;
    /// otherwise a mismatch is a replay.
    pub fn validate_presented_token(
        &self,
        session_id: Option<&str>,
        rotation_id: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> ValidationResult {
        self.sweep();

        let Some(session_id) = session_id else {
            return ValidationResult {
                outcome: ValidationOutcome::MissingSession,
                reason: Some("missing_session".to_string()),
            };
        };

        let mut sessions = self.sessions.write().unwrap();
        match sessions.get(session_id) {
            None => {
                sessions.insert(
                    session_id.to_string(),
                    SessionState {
                        active_rotation_id: rotation_id.map(str::to_string),
                        expires_at,
                    },
                );
                ValidationResult {
                    outcome: ValidationOutcome::Seeded,
                    reason: None,
                }
            }
            Some(state) if state.active_rotation_id.as_deref() == rotation_id => ValidationResult {
                outcome: ValidationOutcome::Ok,
                reason: None,
            },
            Some(_) => {
                // Replay: caller MUST reject and SHOULD invalidate the
                // session so a stolen old token can't be retried either.
                sessions.remove(session_id);
                ValidationResult {
                    outcome: ValidationOutcome::TokenReplayed,
                    reason: Some("token_replayed".to_string()),
                }
            }
        }
    }

    /// Rotate the session to a new (or caller-specified) rotation id,
    /// returning the id that is now active.
    pub fn rotate(
        &self,
        session_id: &str,
        expires_at: Option<DateTime<Utc>>,
        next_rotation_id: Option<String>,
    ) -> String {
        let next = next_rotation_id.unwrap_or_else(|| self.generate_rotation_id());
        self.sessions.write().unwrap().insert(
            session_id.to_string(),
            SessionState {
                active_rotation_id: Some(next.clone()),
                expires_at,
            },
        );
        next
    }
}

impl Default for RefreshSessionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn missing_session_id_is_accepted() {
        let store = RefreshSessionStore::new();
        let result = store.validate_presented_token(None, Some("r1"), None);
        assert!(result.is_ok());
        assert_eq!(result.reason.as_deref(), Some("missing_session"));
    }

    #[test]
    fn first_rotation_id_seeds_session() {
        let store = RefreshSessionStore::new();
        let result = store.validate_presented_token(Some("s1"), Some("r1"), None);
        assert_eq!(result.outcome, ValidationOutcome::Seeded);
    }

    #[test]
    fn missing_rotation_id_seeds_once_then_requires_match() {
        let store = RefreshSessionStore::new();
        let first = store.validate_presented_token(Some("s1"), None, None);
        assert_eq!(first.outcome, ValidationOutcome::Seeded);

        // Same session, rotation id still absent: matches the seeded state.
        let second = store.validate_presented_token(Some("s1"), None, None);
        assert_eq!(second.outcome, ValidationOutcome::Ok);

        // Now a real rotation id shows up for that session: differs from
        // the seeded "no rotation id" state, so it must be flagged a replay.
        let third = store.validate_presented_token(Some("s1"), Some("r1"), None);
        assert_eq!(third.outcome, ValidationOutcome::TokenReplayed);
    }

    #[test]
    fn matching_rotation_id_is_ok() {
        let store = RefreshSessionStore::new();
        store.validate_presented_token(Some("s1"), Some("r1"), None);
        let result = store.validate_presented_token(Some("s1"), Some("r1"), None);
        assert_eq!(result.outcome, ValidationOutcome::Ok);
    }

    #[test]
    fn mismatched_rotation_id_is_replay() {
        let store = RefreshSessionStore::new();
        store.validate_presented_token(Some("s1"), Some("r1"), None);
        let result = store.validate_presented_token(Some("s1"), Some("r2"), None);
        assert_eq!(result.outcome, ValidationOutcome::TokenReplayed);
        assert!(!result.is_ok());
    }

    #[test]
    fn rotate_is_single_use_like_refresh() {
        let store = RefreshSessionStore::new();
        let first = store.rotate("s1", None, None);
        // Using the token that was valid before rotation must now replay.
        let replay = store.validate_presented_token(Some("s1"), Some(&first), None);
        assert_eq!(replay.outcome, ValidationOutcome::Ok);

        let second = store.rotate("s1", None, None);
        assert_ne!(first, second);
        let stale = store.validate_presented_token(Some("s1"), Some(&first), None);
        assert_eq!(stale.outcome, ValidationOutcome::TokenReplayed);
    }

    #[test]
    fn expired_sessions_are_swept_before_validation() {
        let store = RefreshSessionStore::new();
        let past = Utc::now() - Duration::seconds(10);
        store.validate_presented_token(Some("s1"), Some("r1"), Some(past));
        // The sweep on the next call drops the expired entry, so a new
        // rotation id for the same session seeds fresh rather than replays.
        let result = store.validate_presented_token(Some("s1"), Some("r2"), None);
        assert_eq!(result.outcome, ValidationOutcome::Seeded);
    }
}
