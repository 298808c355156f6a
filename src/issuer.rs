// SPDX-License-Identifier: Apache-2.0
use actix_web::http::{header, StatusCode};
use awc::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::error::GatewayError;

/// Timeout for the revocation check performed on every request
pub const SESSION_VALIDATE_TIMEOUT: Duration = Duration::from_secs(2);
const REVOKE_TIMEOUT: Duration = Duration::from_secs(5);
const MINT_TIMEOUT: Duration = Duration::from_secs(5);
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct TokenBody<'a> {
    token: &'a str,
}

#[derive(Serialize)]
struct ExchangeBody<'a> {
    access_token: &'a str,
}

#[derive(Serialize)]
struct MintBody<'a> {
    calling_service: &'a str,
    target_service: &'a str,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

/// Outcome of asking the issuer whether a session is still live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Valid,
    Revoked,
}

/// HTTP client for the central token issuer.
#[derive(Debug, Clone)]
pub struct IssuerClient {
    base_url: String,
}

impl IssuerClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn jwks_url(&self) -> String {
        format!("{}/.well-known/jwks.json", self.base_url)
    }

    /// Ask the issuer whether the session behind `token` is still valid.
    ///
    /// Transport failures are returned as `Err` so the caller can decide
    /// whether to degrade to local trust.
    pub async fn validate_session(
        &self,
        client: &Client,
        token: &str,
    ) -> Result<SessionStatus, awc::error::SendRequestError> {
        let res = client
            .post(format!("{}/api/token/validate", self.base_url))
            .timeout(SESSION_VALIDATE_TIMEOUT)
            .send_json(&TokenBody { token })
            .await?;

        if res.status() == StatusCode::OK {
            Ok(SessionStatus::Valid)
        } else {
            warn!(status = %res.status(), "Token validation failed at issuer");
            Ok(SessionStatus::Revoked)
        }
    }

    /// Revoke a platform token. Failures are logged and swallowed.
    #[instrument(skip_all)]
    pub async fn revoke(&self, client: &Client, token: &str) {
        let result = client
            .post(format!("{}/api/token/revoke", self.base_url))
            .timeout(REVOKE_TIMEOUT)
            .send_json(&TokenBody { token })
            .await;

        match result {
            Ok(res) if res.status() == StatusCode::OK => debug!("Platform token revoked"),
            Ok(res) => warn!(status = %res.status(), "Token revocation failed"),
            Err(e) => warn!(error = %e, "Error revoking token"),
        }
    }

    /// Trade an identity-provider access token for a platform token.
    #[instrument(skip_all)]
    pub async fn exchange_access_token(
        &self,
        client: &Client,
        access_token: &str,
    ) -> Result<String, GatewayError> {
        let mut res = client
            .post(format!("{}/api/token/exchange", self.base_url))
            .timeout(EXCHANGE_TIMEOUT)
            .insert_header((header::AUTHORIZATION, format!("Bearer {}", access_token)))
            .send_json(&ExchangeBody { access_token })
            .await
            .map_err(|e| GatewayError::upstream("issuer", e))?;

        if res.status() != StatusCode::OK {
            return Err(GatewayError::TokenExchange(format!(
                "Failed to get platform token from issuer: {}",
                res.status().as_u16()
            )));
        }

        let body: TokenResponse = res
            .json()
            .await
            .map_err(|e| GatewayError::TokenExchange(e.to_string()))?;
        body.token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| GatewayError::TokenExchange("issuer response carried no token".into()))
    }

    /// Mint a token that lets `calling_service` call `target_service`.
    #[instrument(skip(self, client))]
    pub async fn mint_service_token(
        &self,
        client: &Client,
        calling_service: &str,
        target_service: &str,
    ) -> Result<String, GatewayError> {
        let mut res = client
            .post(format!("{}/service-token", self.base_url))
            .timeout(MINT_TIMEOUT)
            .send_json(&MintBody {
                calling_service,
                target_service,
            })
            .await
            .map_err(|e| GatewayError::upstream("issuer", e))?;

        if res.status() != StatusCode::OK {
            return Err(GatewayError::ServiceUnavailable(format!(
                "Failed to get service token from issuer: {}",
                res.status().as_u16()
            )));
        }

        let body: TokenResponse = res
            .json()
            .await
            .map_err(|e| GatewayError::upstream("issuer", e))?;
        body.token.ok_or_else(|| {
            GatewayError::ServiceUnavailable("issuer response carried no service token".into())
        })
    }
}
