//! API-Key Registry (§4.B): opaque keys with registry-integrity checking.
//!
//! Grounded on the cache-with-invalidation shape of `ApiKeyManager` in
//! `security/auth.rs` (an `Arc<RwLock<HashMap<...>>>` behind a small set of
//! methods), generalized from that module's generated `hive_{hex}` keys to
//! the registry-of-external-records model spec.md describes, and on the
//! provider-format-validation style of `core/api_keys.rs` for the
//! decode/hash/compare pipeline.

use std::sync::RwLock;
use std::time::SystemTime;

use base64::Engine;
use serde::Deserialize;
use sha2::{Digest, Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::core::config::ApiKeyRegistrySource;
use crate::core::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Sha256,
    Sha512,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyRecord {
    pub id: String,
    pub secret_hash: String,
    pub algorithm: HashAlgorithm,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub last_rotated_at: Option<String>,
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RegistryDocument {
    Wrapped { keys: Vec<ApiKeyRecord> },
    Bare(Vec<ApiKeyRecord>),
}

/// Successful authentication result: the matched record plus its normalized
/// scope set (kept separate from `record.scopes` so future scope aliasing
/// can diverge from the stored value without mutating the registry).
pub struct ApiKeyAuth {
    pub record_id: String,
    pub scopes: Vec<String>,
}

type ProviderFn = Box<dyn Fn() -> String + Send + Sync>;

/// Cache signature: identity of the source plus a coarse freshness marker.
/// For a file source this is `(path, mtime, len)`; for inline/provider
/// sources it's the content itself, since there's no filesystem metadata to
/// key on — re-hashing a short env var on every signature check is cheap.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Signature {
    File {
        path: String,
        modified: Option<SystemTime>,
        len: u64,
    },
    Content(String),
    None,
}

struct Cache {
    signature: Signature,
    records: Vec<ApiKeyRecord>,
}

pub struct ApiKeyRegistry {
    source: ApiKeyRegistrySource,
    provider: RwLock<Option<ProviderFn>>,
    cache: RwLock<Option<Cache>>,
}

impl ApiKeyRegistry {
    pub fn new(source: ApiKeyRegistrySource) -> Self {
        Self {
            source,
            provider: RwLock::new(None),
            cache: RwLock::new(None),
        }
    }

    pub fn set_provider(&self, provider: Option<ProviderFn>) {
        *self.provider.write().unwrap() = provider;
        self.clear_cache();
    }

    pub fn clear_cache(&self) {
        *self.cache.write().unwrap() = None;
    }

    pub fn is_configured(&self) -> bool {
        self.provider.read().unwrap().is_some() || !matches!(self.source, ApiKeyRegistrySource::None)
    }

    fn current_signature(&self) -> Signature {
        if let Some(provider) = self.provider.read().unwrap().as_ref() {
            return Signature::Content(provider());
        }
        match &self.source {
            ApiKeyRegistrySource::Inline(raw) => Signature::Content(raw.clone()),
            ApiKeyRegistrySource::File(path) => {
                let metadata = std::fs::metadata(path).ok();
                Signature::File {
                    path: path.display().to_string(),
                    modified: metadata.as_ref().and_then(|m| m.modified().ok()),
                    len: metadata.map(|m| m.len()).unwrap_or(0),
                }
            }
            ApiKeyRegistrySource::None => Signature::None,
        }
    }

    fn load_raw(&self) -> Option<String> {
        if let Some(provider) = self.provider.read().unwrap().as_ref() {
            return Some(provider());
        }
        match &self.source {
            ApiKeyRegistrySource::Inline(raw) => Some(raw.clone()),
            ApiKeyRegistrySource::File(path) => std::fs::read_to_string(path).ok(),
            ApiKeyRegistrySource::None => None,
        }
    }

    fn refresh_if_stale(&self) {
        let signature = self.current_signature();
        {
            let cache = self.cache.read().unwrap();
            if let Some(cache) = cache.as_ref() {
                if cache.signature == signature {
                    return;
                }
            }
        }

        let records = self
            .load_raw()
            .and_then(|raw| serde_json::from_str::<RegistryDocument>(&raw).ok())
            .map(|doc| match doc {
                RegistryDocument::Wrapped { keys } => keys,
                RegistryDocument::Bare(keys) => keys,
            })
            .unwrap_or_default()
            .into_iter()
            .filter(|r| !r.id.is_empty() && !r.secret_hash.is_empty())
            .collect();

        *self.cache.write().unwrap() = Some(Cache { signature, records });
    }

    fn find(&self, id: &str) -> Option<ApiKeyRecord> {
        self.refresh_if_stale();
        self.cache
            .read()
            .unwrap()
            .as_ref()
            .and_then(|cache| cache.records.iter().find(|r| r.id == id).cloned())
    }

    /// Authenticate a presented `base64(id:secret)` header value per the
    /// five-step algorithm in §4.B.
    pub fn authenticate(&self, header_value: &str) -> Result<ApiKeyAuth, GatewayError> {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(header_value)
            .map_err(|_| GatewayError::AuthUnknownApiKey)?;
        let decoded = String::from_utf8(decoded).map_err(|_| GatewayError::AuthUnknownApiKey)?;
        let (id, secret) = decoded
            .split_once(':')
            .ok_or(GatewayError::AuthUnknownApiKey)?;

        let record = self.find(id).ok_or(GatewayError::AuthUnknownApiKey)?;

        if let Some(checksum) = &record.checksum {
            let expected = compute_checksum(&record.id, &record.secret_hash, record.algorithm);
            if !bool::from(checksum.as_bytes().ct_eq(expected.as_bytes())) {
                return Err(GatewayError::AuthApiKeyChecksumMismatch);
            }
        }

        let computed = hash_secret(secret, record.algorithm);
        if !bool::from(computed.as_bytes().ct_eq(record.secret_hash.as_bytes())) {
            return Err(GatewayError::AuthUnknownApiKey);
        }

        Ok(ApiKeyAuth {
            record_id: record.id.clone(),
            scopes: record.scopes.clone(),
        })
    }
}

fn hash_secret(secret: &str, algorithm: HashAlgorithm) -> String {
    match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(secret.as_bytes())),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(secret.as_bytes())),
    }
}

fn compute_checksum(id: &str, secret_hash: &str, algorithm: HashAlgorithm) -> String {
    let algo_name = match algorithm {
        HashAlgorithm::Sha256 => "sha256",
        HashAlgorithm::Sha512 => "sha512",
    };
    let payload = format!("{}:{}:{}", id, secret_hash, algo_name);
    hex::encode(Sha256::digest(payload.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_key(id: &str, secret: &str) -> String {
        base64::engine::general_purpose::STANDARD.encode(format!("{}:{}", id, secret))
    }

    #[test]
    fn authenticates_a_valid_key_without_checksum() {
        let secret_hash = hash_secret("s3cret", HashAlgorithm::Sha256);
        let registry = ApiKeyRegistry::new(ApiKeyRegistrySource::Inline(format!(
            r#"{{"keys":[{{"id":"k1","secretHash":"{}","algorithm":"sha256","scopes":["graph:read"]}}]}}"#,
            secret_hash
        )));

        let result = registry.authenticate(&encode_key("k1", "s3cret")).unwrap();
        assert_eq!(result.record_id, "k1");
        assert_eq!(result.scopes, vec!["graph:read".to_string()]);
    }

    #[test]
    fn checksum_mismatch_is_rejected() {
        let secret_hash = hash_secret("s3cret", HashAlgorithm::Sha256);
        let registry = ApiKeyRegistry::new(ApiKeyRegistrySource::Inline(format!(
            r#"{{"keys":[{{"id":"k1","secretHash":"{}","algorithm":"sha256","checksum":"wrong","scopes":[]}}]}}"#,
            secret_hash
        )));

        let err = registry.authenticate(&encode_key("k1", "s3cret")).unwrap_err();
        assert!(matches!(err, GatewayError::AuthApiKeyChecksumMismatch));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let secret_hash = hash_secret("s3cret", HashAlgorithm::Sha256);
        let registry = ApiKeyRegistry::new(ApiKeyRegistrySource::Inline(format!(
            r#"{{"keys":[{{"id":"k1","secretHash":"{}","algorithm":"sha256"}}]}}"#,
            secret_hash
        )));

        let err = registry
            .authenticate(&encode_key("k1", "wrong-secret"))
            .unwrap_err();
        assert!(matches!(err, GatewayError::AuthUnknownApiKey));
    }

    #[test]
    fn unknown_id_is_rejected() {
        let registry = ApiKeyRegistry::new(ApiKeyRegistrySource::Inline(
            r#"{"keys":[]}"#.to_string(),
        ));
        let err = registry.authenticate(&encode_key("ghost", "x")).unwrap_err();
        assert!(matches!(err, GatewayError::AuthUnknownApiKey));
    }

    #[test]
    fn bare_array_source_is_accepted() {
        let secret_hash = hash_secret("s3cret", HashAlgorithm::Sha256);
        let registry = ApiKeyRegistry::new(ApiKeyRegistrySource::Inline(format!(
            r#"[{{"id":"k1","secretHash":"{}","algorithm":"sha256"}}]"#,
            secret_hash
        )));
        assert!(registry.authenticate(&encode_key("k1", "s3cret")).is_ok());
    }
}
