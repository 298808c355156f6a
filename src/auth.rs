// SPDX-License-Identifier: Apache-2.0
use awc::Client;
use jsonwebtoken::{
    decode, decode_header, errors::ErrorKind, jwk::JwkSet, Algorithm, DecodingKey, Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::issuer::{IssuerClient, SessionStatus};

const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
// Minimum age of the cached key set before an unknown `kid` triggers a refetch
const JWKS_REFRESH_INTERVAL: Duration = Duration::from_secs(300);

/// Coarse role carried in platform tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    Admin,
    Technician,
    Billing,
    #[default]
    Client,
    #[serde(other)]
    Other,
}

/// Verified platform token payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub permission_level: PermissionLevel,
    pub exp: u64,
    pub iss: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token: {0}")]
    Invalid(String),
    #[error("signing keys unavailable: {0}")]
    KeysUnavailable(String),
}

/// How far a successful validation can be trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trust {
    /// Signature verified locally and the issuer confirmed the session.
    Confirmed,
    /// Signature verified locally; the issuer could not be reached.
    Degraded,
}

#[derive(Debug, Clone)]
pub struct ValidatedToken {
    pub claims: Claims,
    pub trust: Trust,
}

/// Process-wide cache of the issuer's published signing keys.
///
/// Concurrent first fetches may race; every writer stores the same published
/// set, so the last one wins harmlessly.
#[derive(Debug, Default)]
pub struct JwksCache {
    keys: RwLock<Option<(Arc<JwkSet>, Instant)>>,
}

impl JwksCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache pre-seeded with a known key set
    pub fn with_keys(keys: JwkSet) -> Self {
        Self {
            keys: RwLock::new(Some((Arc::new(keys), Instant::now()))),
        }
    }

    fn cached(&self) -> Option<(Arc<JwkSet>, Instant)> {
        self.keys.read().ok().and_then(|guard| guard.clone())
    }

    /// Return a key set that should contain `kid`, fetching at most when needed.
    pub async fn key_set(
        &self,
        client: &Client,
        url: &str,
        kid: &str,
    ) -> Result<Arc<JwkSet>, TokenError> {
        if let Some((keys, fetched_at)) = self.cached() {
            if keys.find(kid).is_some() || fetched_at.elapsed() < JWKS_REFRESH_INTERVAL {
                return Ok(keys);
            }
            debug!(kid = %kid, "Unknown key id, refreshing signing keys");
        }
        self.fetch(client, url).await
    }

    async fn fetch(&self, client: &Client, url: &str) -> Result<Arc<JwkSet>, TokenError> {
        let mut res = client
            .get(url)
            .timeout(JWKS_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| TokenError::KeysUnavailable(e.to_string()))?;

        if !res.status().is_success() {
            return Err(TokenError::KeysUnavailable(format!(
                "key set endpoint returned {}",
                res.status()
            )));
        }

        let keys: JwkSet = res
            .json()
            .await
            .map_err(|e| TokenError::KeysUnavailable(e.to_string()))?;
        let keys = Arc::new(keys);
        if let Ok(mut guard) = self.keys.write() {
            *guard = Some((Arc::clone(&keys), Instant::now()));
        }
        debug!(count = keys.keys.len(), "Fetched signing keys");
        Ok(keys)
    }
}

fn key_id(token: &str) -> Result<String, TokenError> {
    let header = decode_header(token).map_err(|e| TokenError::Invalid(e.to_string()))?;
    if header.alg != Algorithm::RS256 {
        return Err(TokenError::Invalid(format!("unsupported algorithm {:?}", header.alg)));
    }
    header
        .kid
        .ok_or_else(|| TokenError::Invalid("token header has no key id".into()))
}

/// Verify signature, issuer and expiry against a key set, without any network call.
pub fn verify_locally(token: &str, keys: &JwkSet, issuer: &str) -> Result<Claims, TokenError> {
    let kid = key_id(token)?;
    let jwk = keys
        .find(&kid)
        .ok_or_else(|| TokenError::Invalid(format!("no signing key with id {}", kid)))?;
    let key = DecodingKey::from_jwk(jwk).map_err(|e| TokenError::Invalid(e.to_string()))?;

    let mut validation = Validation::new(Algorithm::RS256);
    validation.set_issuer(&[issuer]);
    validation.set_required_spec_claims(&["exp", "iss", "sub"]);
    validation.validate_aud = false;
    validation.leeway = 0;

    match decode::<Claims>(token, &key, &validation) {
        Ok(data) => Ok(data.claims),
        Err(e) if matches!(e.kind(), ErrorKind::ExpiredSignature) => Err(TokenError::Expired),
        Err(e) => Err(TokenError::Invalid(e.to_string())),
    }
}

/// Verifies platform tokens locally and checks revocation with the issuer.
#[derive(Debug)]
pub struct TokenValidator {
    issuer: IssuerClient,
    expected_issuer: String,
    jwks: JwksCache,
    fail_open: bool,
}

impl TokenValidator {
    pub fn new(issuer: IssuerClient, expected_issuer: impl Into<String>, fail_open: bool) -> Self {
        Self {
            issuer,
            expected_issuer: expected_issuer.into(),
            jwks: JwksCache::new(),
            fail_open,
        }
    }

    pub fn with_jwks(mut self, jwks: JwksCache) -> Self {
        self.jwks = jwks;
        self
    }

    /// Validate a platform token. Never trusts a token without signature,
    /// issuer and expiry checks, even when the issuer is down.
    #[instrument(skip(self, client, token), fields(token_truncated = %format!("{}..", &token.chars().take(10).collect::<String>())))]
    pub async fn validate(&self, client: &Client, token: &str) -> Result<ValidatedToken, TokenError> {
        let kid = key_id(token)?;
        let keys = self
            .jwks
            .key_set(client, &self.issuer.jwks_url(), &kid)
            .await?;
        let claims = verify_locally(token, &keys, &self.expected_issuer)?;

        match self.issuer.validate_session(client, token).await {
            Ok(SessionStatus::Valid) => Ok(ValidatedToken {
                claims,
                trust: Trust::Confirmed,
            }),
            Ok(SessionStatus::Revoked) => Err(TokenError::Invalid("session revoked".into())),
            Err(e) if self.fail_open => {
                warn!(error = %e, "Could not reach issuer for validation, falling back to local validation");
                Ok(ValidatedToken {
                    claims,
                    trust: Trust::Degraded,
                })
            }
            Err(e) => {
                warn!(error = %e, "Could not reach issuer for validation, rejecting token");
                Err(TokenError::Invalid("issuer unreachable".into()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use std::time::{SystemTime, UNIX_EPOCH};

    const SIGNING_KEY: &str = include_str!("../tests/fixtures/signing_key.pem");
    const JWKS: &str = include_str!("../tests/fixtures/jwks.json");
    const ISSUER: &str = "hivematrix-core";

    fn now() -> u64 {
        SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
    }

    fn keys() -> JwkSet {
        serde_json::from_str(JWKS).unwrap()
    }

    fn mint(iss: &str, exp: u64, kid: Option<&str>) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        let claims = serde_json::json!({
            "sub": "user-1",
            "email": "alice@example.com",
            "permission_level": "admin",
            "exp": exp,
            "iss": iss,
        });
        encode(&header, &claims, &EncodingKey::from_rsa_pem(SIGNING_KEY.as_bytes()).unwrap()).unwrap()
    }

    #[test]
    fn accepts_valid_token() {
        let token = mint(ISSUER, now() + 600, Some("test-key"));
        let claims = verify_locally(&token, &keys(), ISSUER).unwrap();
        assert_eq!(claims.sub, "user-1");
        assert_eq!(claims.email.as_deref(), Some("alice@example.com"));
        assert_eq!(claims.permission_level, PermissionLevel::Admin);
    }

    #[test]
    fn flipped_signature_is_invalid() {
        let token = mint(ISSUER, now() + 600, Some("test-key"));
        let sig_start = token.rfind('.').unwrap() + 1;
        let mut bytes = token.into_bytes();
        let idx = sig_start + 10;
        bytes[idx] = if bytes[idx] == b'A' { b'B' } else { b'A' };
        let tampered = String::from_utf8(bytes).unwrap();

        assert!(matches!(
            verify_locally(&tampered, &keys(), ISSUER),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let token = mint(ISSUER, now() - 10, Some("test-key"));
        assert_eq!(verify_locally(&token, &keys(), ISSUER), Err(TokenError::Expired));
    }

    #[test]
    fn wrong_issuer_is_invalid() {
        let token = mint("someone-else", now() + 600, Some("test-key"));
        assert!(matches!(
            verify_locally(&token, &keys(), ISSUER),
            Err(TokenError::Invalid(_))
        ));
    }

    #[test]
    fn missing_or_unknown_kid_is_invalid() {
        let no_kid = mint(ISSUER, now() + 600, None);
        assert!(matches!(verify_locally(&no_kid, &keys(), ISSUER), Err(TokenError::Invalid(_))));

        let unknown = mint(ISSUER, now() + 600, Some("rotated-away"));
        assert!(matches!(verify_locally(&unknown, &keys(), ISSUER), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn unknown_permission_levels_parse() {
        let claims: Claims = serde_json::from_value(serde_json::json!({
            "sub": "x", "exp": 1, "iss": ISSUER, "permission_level": "superhero"
        }))
        .unwrap();
        assert_eq!(claims.permission_level, PermissionLevel::Other);

        let claims: Claims =
            serde_json::from_value(serde_json::json!({"sub": "x", "exp": 1, "iss": ISSUER})).unwrap();
        assert_eq!(claims.permission_level, PermissionLevel::Client);
    }

    #[actix_web::test]
    async fn degrades_to_local_trust_when_issuer_unreachable() {
        let client = Client::default();
        // Port 9 (discard) on loopback refuses connections
        let validator = TokenValidator::new(IssuerClient::new("http://127.0.0.1:9"), ISSUER, true)
            .with_jwks(JwksCache::with_keys(keys()));
        let token = mint(ISSUER, now() + 600, Some("test-key"));

        let validated = validator.validate(&client, &token).await.unwrap();
        assert_eq!(validated.trust, Trust::Degraded);
        assert_eq!(validated.claims.sub, "user-1");
    }

    #[actix_web::test]
    async fn fail_closed_policy_rejects_when_issuer_unreachable() {
        let client = Client::default();
        let validator = TokenValidator::new(IssuerClient::new("http://127.0.0.1:9"), ISSUER, false)
            .with_jwks(JwksCache::with_keys(keys()));
        let token = mint(ISSUER, now() + 600, Some("test-key"));

        assert!(validator.validate(&client, &token).await.is_err());
    }

    #[actix_web::test]
    async fn local_failures_never_reach_the_issuer() {
        let client = Client::default();
        let validator = TokenValidator::new(IssuerClient::new("http://127.0.0.1:9"), ISSUER, true)
            .with_jwks(JwksCache::with_keys(keys()));
        let expired = mint(ISSUER, now() - 5, Some("test-key"));

        assert_eq!(validator.validate(&client, &expired).await.unwrap_err(), TokenError::Expired);
    }
}
