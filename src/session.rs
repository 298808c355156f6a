// SPDX-License-Identifier: Apache-2.0
use actix_session::{Session, SessionExt};
use actix_web::{dev::Payload, FromRequest, HttpRequest};
use futures::future::{ready, Ready};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::auth::Claims;
use crate::error::GatewayError;
use crate::preferences::PreferenceCache;

const PLATFORM_TOKEN: &str = "platform_token";
const CLAIMS: &str = "claims";
const OAUTH_STATE: &str = "oauth_state";
const OAUTH_NONCE: &str = "oauth_nonce";
const NEXT_PATH: &str = "next_path";
const PREF_CACHE: &str = "pref_cache";

/// Every key the gateway ever writes into a session.
pub const SESSION_FIELDS: &[&str] = &[
    PLATFORM_TOKEN,
    CLAIMS,
    OAUTH_STATE,
    OAUTH_NONCE,
    NEXT_PATH,
    PREF_CACHE,
];

/// Typed view over the cookie-addressed session record.
#[derive(Clone)]
pub struct GatewaySession(Session);

impl GatewaySession {
    pub fn new(session: Session) -> Self {
        Self(session)
    }

    fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.0.get::<T>(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable session value");
                self.0.remove(key);
                None
            }
        }
    }

    fn set<T: Serialize>(&self, key: &str, value: T) -> Result<(), GatewayError> {
        self.0
            .insert(key, value)
            .map_err(|e| GatewayError::Internal(anyhow::anyhow!("failed to write session field {}: {}", key, e)))
    }

    pub fn platform_token(&self) -> Option<String> {
        self.get(PLATFORM_TOKEN)
    }

    pub fn claims(&self) -> Option<Claims> {
        self.get(CLAIMS)
    }

    pub fn oauth_state(&self) -> Option<String> {
        self.get(OAUTH_STATE)
    }

    pub fn oauth_nonce(&self) -> Option<String> {
        self.get(OAUTH_NONCE)
    }

    pub fn next_path(&self) -> Option<String> {
        self.get(NEXT_PATH)
    }

    pub fn pref_cache(&self) -> PreferenceCache {
        self.get(PREF_CACHE).unwrap_or_default()
    }

    pub fn set_claims(&self, claims: &Claims) -> Result<(), GatewayError> {
        self.set(CLAIMS, claims)
    }

    pub fn set_pref_cache(&self, cache: &PreferenceCache) -> Result<(), GatewayError> {
        self.set(PREF_CACHE, cache)
    }

    /// Record a pending login: fresh state, nonce and where to go afterwards.
    pub fn begin_login(&self, state: &str, nonce: &str, next_path: &str) -> Result<(), GatewayError> {
        self.set(OAUTH_STATE, state)?;
        self.set(OAUTH_NONCE, nonce)?;
        self.set(NEXT_PATH, next_path)
    }

    /// Store a validated login and drop the pending-login fields.
    /// Returns the path the user originally asked for.
    pub fn complete_login(&self, token: &str, claims: &Claims) -> Result<String, GatewayError> {
        let next = self.next_path().unwrap_or_else(|| "/".to_string());
        self.0.remove(OAUTH_STATE);
        self.0.remove(OAUTH_NONCE);
        self.0.remove(NEXT_PATH);
        // New identity, new session key
        self.0.renew();
        self.set(PLATFORM_TOKEN, token)?;
        self.set(CLAIMS, claims)?;
        Ok(next)
    }

    /// Remove every known field, then purge the record and its cookie.
    pub fn clear(&self) {
        for field in SESSION_FIELDS {
            self.0.remove(field);
        }
        self.0.purge();
    }
}

impl FromRequest for GatewaySession {
    type Error = actix_web::Error;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(Ok(GatewaySession(req.get_session())))
    }
}
