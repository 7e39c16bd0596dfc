//! Minted and verified JWT claims shared by the resolver (§4.E) and the
//! refresh endpoint (§4.K). `jsonwebtoken` does the actual HMAC work; this
//! module only shapes the claims the gateway cares about.

use chrono::{DateTime, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub scopes: Option<Vec<String>>,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub aud: Option<String>,
    pub exp: i64,
    #[serde(rename = "sessionId", default)]
    pub session_id: Option<String>,
    #[serde(rename = "rotationId", default)]
    pub rotation_id: Option<String>,
    #[serde(rename = "type", default)]
    pub token_type: Option<String>,
}

pub fn verify(secret: &str, token: &str) -> jsonwebtoken::errors::Result<Claims> {
    let mut validation = Validation::new(jsonwebtoken::Algorithm::HS256);
    validation.validate_aud = false;
    decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation)
        .map(|data| data.claims)
}

pub fn mint(
    secret: &str,
    subject: &str,
    role: Option<String>,
    scopes: Vec<String>,
    session_id: Option<String>,
    rotation_id: Option<String>,
    token_type: &str,
    expires_at: DateTime<Utc>,
) -> jsonwebtoken::errors::Result<String> {
    let claims = Claims {
        sub: subject.to_string(),
        role,
        scopes: Some(scopes),
        iss: None,
        aud: None,
        exp: expires_at.timestamp(),
        session_id,
        rotation_id,
        token_type: Some(token_type.to_string()),
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn mint_then_verify_round_trips() {
        let exp = Utc::now() + Duration::hours(1);
        let token = mint(
            "secret",
            "user-1",
            Some("member".into()),
            vec!["graph:read".into()],
            Some("sess-1".into()),
            None,
            "access",
            exp,
        )
        .unwrap();

        let claims = verify("secret", &token).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.scopes, Some(vec!["graph:read".to_string()]));
        assert_eq!(claims.token_type.as_deref(), Some("access"));
    }

    #[test]
    fn expired_token_fails_verification() {
        let exp = Utc::now() - Duration::hours(1);
        let token = mint("secret", "user-1", None, vec![], None, None, "access", exp).unwrap();
        let err = verify("secret", &token).unwrap_err();
        assert_eq!(err.kind(), &jsonwebtoken::errors::ErrorKind::ExpiredSignature);
    }
}
