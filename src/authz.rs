//! Authorization Gate (§4.F): combines an `AuthContext` with a resolved
//! scope requirement to produce grant/deny plus an audit record.

use tracing::info;

use crate::auth::resolver::{AuthContext, Decision, TokenError, TokenType};
use crate::core::error::GatewayError;
use crate::scope::{scopes_satisfy_requirement, ScopeRequirement};

pub struct AuthorizationOutcome {
    pub context: AuthContext,
    pub error: Option<GatewayError>,
}

/// Whether the gate is enforcing anything at all: with no JWT secret
/// configured (impossible in this crate — §4.D config load fails closed),
/// no admin token, and no configured API-key registry, the gate is a no-op
/// bypass. `jwt_secret_set` always true in this gateway, kept explicit so
/// the bypass path is exercised the way spec.md names it rather than
/// assumed unreachable.
pub struct EnforcementState {
    pub jwt_secret_set: bool,
    pub admin_token_set: bool,
    pub registry_configured: bool,
}

impl EnforcementState {
    pub fn is_enforced(&self) -> bool {
        self.jwt_secret_set || self.admin_token_set || self.registry_configured
    }
}

const REFRESH_PATH: &str = "/api/v1/auth/refresh";

/// Run the gate for one request. `path` is used only for the refresh-bypass
/// special case (§4.F step 3 / §9 open question: preserved only for the
/// refresh endpoint itself).
pub fn authorize(
    mut context: AuthContext,
    requirement: Option<ScopeRequirement>,
    enforcement: &EnforcementState,
    path: &str,
) -> AuthorizationOutcome {
    if !enforcement.is_enforced() {
        context.decision = Some(Decision::Granted);
        emit_audit(&context, "bypass_unenforced");
        return AuthorizationOutcome {
            context,
            error: None,
        };
    }

    if let Some(token_error) = &context.token_error {
        let error = match token_error {
            TokenError::MissingBearer => GatewayError::AuthMissing,
            TokenError::TokenExpired => GatewayError::AuthExpired,
            TokenError::InvalidToken => GatewayError::AuthInvalidToken {
                reason: context
                    .token_error_detail
                    .clone()
                    .unwrap_or_else(|| "invalid token".to_string()),
            },
            TokenError::InvalidApiKey => GatewayError::AuthUnknownApiKey,
            TokenError::ChecksumMismatch => GatewayError::AuthApiKeyChecksumMismatch,
        };
        context.decision = Some(Decision::Denied);
        emit_audit(&context, "token_error");
        return AuthorizationOutcome {
            context,
            error: Some(error),
        };
    }

    let Some(requirement) = requirement else {
        context.decision = Some(Decision::Granted);
        emit_audit(&context, "no_requirement");
        return AuthorizationOutcome {
            context,
            error: None,
        };
    };

    context.required_scopes = Some(requirement.scopes.clone());

    if context.token_type == TokenType::Anonymous && path != REFRESH_PATH {
        context.decision = Some(Decision::Denied);
        emit_audit(&context, "anonymous_denied");
        return AuthorizationOutcome {
            context,
            error: Some(GatewayError::AuthMissing),
        };
    }

    if context.token_type == TokenType::Anonymous && path == REFRESH_PATH {
        // Special-case bypass: let the refresh handler validate its own
        // body rather than gate on scopes it can't yet have (§9).
        context.decision = Some(Decision::Granted);
        emit_audit(&context, "refresh_bypass");
        return AuthorizationOutcome {
            context,
            error: None,
        };
    }

    if scopes_satisfy_requirement(&context.scopes, &requirement.scopes) {
        context.decision = Some(Decision::Granted);
        emit_audit(&context, "scope_satisfied");
        AuthorizationOutcome {
            context,
            error: None,
        }
    } else {
        context.decision = Some(Decision::Denied);
        emit_audit(&context, "scope_denied");
        let held = context.scopes.clone();
        let required = requirement.scopes.clone();
        AuthorizationOutcome {
            context,
            error: Some(GatewayError::ScopeDenied { required, held }),
        }
    }
}

fn emit_audit(context: &AuthContext, reason: &str) {
    info!(
        event = "auth.decision",
        decision = ?context.decision,
        token_type = ?context.token_type,
        user_id = ?context.user,
        scopes = ?context.scopes,
        required_scopes = ?context.required_scopes,
        token_error = ?context.token_error,
        reason = reason,
        request_id = %context.audit.request_id,
        ip = %context.audit.ip,
        "authorization decision"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::resolver::AuditInfo;
    use crate::scope::RequirementMode;

    fn context(token_type: TokenType, scopes: Vec<String>) -> AuthContext {
        AuthContext {
            token_type,
            user: None,
            scopes,
            required_scopes: None,
            api_key_id: None,
            issuer: None,
            audience: None,
            expires_at: None,
            session_id: None,
            token_error: None,
            token_error_detail: None,
            audit: AuditInfo {
                request_id: "r1".into(),
                ip: "127.0.0.1".into(),
                user_agent: "test".into(),
            },
            decision: None,
        }
    }

    fn enforced() -> EnforcementState {
        EnforcementState {
            jwt_secret_set: true,
            admin_token_set: false,
            registry_configured: false,
        }
    }

    #[test]
    fn bypass_when_not_enforced() {
        let unenforced = EnforcementState {
            jwt_secret_set: false,
            admin_token_set: false,
            registry_configured: false,
        };
        let outcome = authorize(
            context(TokenType::Anonymous, vec![]),
            Some(ScopeRequirement {
                scopes: vec!["admin".into()],
                mode: RequirementMode::All,
            }),
            &unenforced,
            "/api/v1/admin",
        );
        assert!(outcome.error.is_none());
    }

    #[test]
    fn anonymous_denied_without_requirement_bypass() {
        let outcome = authorize(
            context(TokenType::Anonymous, vec![]),
            Some(ScopeRequirement {
                scopes: vec!["graph:read".into()],
                mode: RequirementMode::All,
            }),
            &enforced(),
            "/api/v1/graph/entity/e1",
        );
        assert!(matches!(outcome.error, Some(GatewayError::AuthMissing)));
    }

    #[test]
    fn anonymous_refresh_path_bypasses_gate() {
        let outcome = authorize(
            context(TokenType::Anonymous, vec![]),
            Some(ScopeRequirement {
                scopes: vec!["session:refresh".into()],
                mode: RequirementMode::All,
            }),
            &enforced(),
            "/api/v1/auth/refresh",
        );
        assert!(outcome.error.is_none());
    }

    #[test]
    fn scope_deny_reports_required_scopes() {
        let outcome = authorize(
            context(TokenType::Jwt, vec!["graph:read".into()]),
            Some(ScopeRequirement {
                scopes: vec!["admin".into()],
                mode: RequirementMode::All,
            }),
            &enforced(),
            "/api/v1/admin/sync",
        );
        match outcome.error {
            Some(GatewayError::ScopeDenied { required, .. }) => {
                assert_eq!(required, vec!["admin".to_string()]);
            }
            _ => panic!("expected ScopeDenied"),
        }
    }

    #[test]
    fn admin_scope_satisfies_any_requirement() {
        let outcome = authorize(
            context(TokenType::Jwt, vec!["admin".into()]),
            Some(ScopeRequirement {
                scopes: vec!["graph:read".into()],
                mode: RequirementMode::All,
            }),
            &enforced(),
            "/api/v1/graph/x",
        );
        assert!(outcome.error.is_none());
    }
}
