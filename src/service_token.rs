// SPDX-License-Identifier: Apache-2.0
use actix_web::http::header;
use awc::Client;
use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, instrument};

use crate::error::GatewayError;
use crate::issuer::IssuerClient;
use crate::routes::RouteTable;

/// A cached token is refreshed once it is this close to expiry.
pub const REFRESH_MARGIN_SECS: u64 = 60;
/// Lifetime assumed for tokens whose expiry cannot be read.
pub const FALLBACK_LIFETIME_SECS: u64 = 300;

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ServiceTokenCacheEntry {
    pub target_service: String,
    pub token: String,
    pub expires_at: u64,
}

#[derive(Deserialize)]
struct ExpiryOnly {
    exp: Option<u64>,
}

/// Read `exp` from a token we minted through the issuer, without verifying it.
fn token_expiry(token: &str) -> Option<u64> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<ExpiryOnly>(token, &DecodingKey::from_secret(&[]), &validation)
        .ok()
        .and_then(|data| data.claims.exp)
}

/// Process-wide cache of gateway-to-service tokens, keyed by target service.
///
/// Concurrent misses may mint twice; each write replaces the whole entry, so
/// readers only ever see a coherent token/expiry pair.
#[derive(Debug, Default)]
pub struct ServiceTokenCache {
    entries: RwLock<HashMap<String, ServiceTokenCacheEntry>>,
}

impl ServiceTokenCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached token for `target`, unless it expires within the refresh margin.
    pub fn get(&self, target: &str, now: u64) -> Option<String> {
        let entries = self.entries.read().ok()?;
        entries
            .get(target)
            .filter(|e| e.expires_at.saturating_sub(now) >= REFRESH_MARGIN_SECS)
            .map(|e| e.token.clone())
    }

    pub fn insert(&self, target: &str, token: String, now: u64) -> ServiceTokenCacheEntry {
        let expires_at = token_expiry(&token).unwrap_or(now + FALLBACK_LIFETIME_SECS);
        let entry = ServiceTokenCacheEntry {
            target_service: target.to_string(),
            token,
            expires_at,
        };
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(target.to_string(), entry.clone());
        }
        entry
    }
}

/// Calls backend services on the gateway's own behalf.
#[derive(Debug)]
pub struct ServiceClient {
    calling_service: String,
    issuer: IssuerClient,
    cache: ServiceTokenCache,
}

impl ServiceClient {
    pub fn new(calling_service: impl Into<String>, issuer: IssuerClient) -> Self {
        Self {
            calling_service: calling_service.into(),
            issuer,
            cache: ServiceTokenCache::new(),
        }
    }

    /// Token for `target`, minted through the issuer on a cache miss.
    pub async fn token_for(&self, client: &Client, target: &str) -> Result<String, GatewayError> {
        if let Some(token) = self.cache.get(target, unix_now()) {
            return Ok(token);
        }
        debug!(target_service = %target, "Minting service token");
        let token = self
            .issuer
            .mint_service_token(client, &self.calling_service, target)
            .await?;
        Ok(self.cache.insert(target, token, unix_now()).token)
    }

    /// GET `path` on `target` with a service token and decode a JSON body.
    #[instrument(skip(self, client, routes, query))]
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        client: &Client,
        routes: &RouteTable,
        target: &str,
        path: &str,
        query: &[(&str, &str)],
        timeout: Duration,
    ) -> Result<T, GatewayError> {
        let route = routes
            .get(target)
            .ok_or_else(|| GatewayError::RouteNotFound(target.to_string()))?;
        let token = self.token_for(client, target).await?;

        let mut req = client
            .get(format!("{}{}", route.base_url, path))
            .timeout(timeout)
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", token)));
        if !query.is_empty() {
            req = req
                .query(&query)
                .map_err(|e| GatewayError::Internal(anyhow::anyhow!(e)))?;
        }

        let mut res = req.send().await.map_err(|e| GatewayError::upstream(target, e))?;
        if !res.status().is_success() {
            return Err(GatewayError::upstream(
                target,
                format!("returned status {}", res.status().as_u16()),
            ));
        }
        res.json::<T>()
            .await
            .map_err(|e| GatewayError::upstream(target, e))
    }
}
