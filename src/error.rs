// SPDX-License-Identifier: Apache-2.0
use actix_web::{http::StatusCode, http::header, HttpResponse, ResponseError};
use serde::Serialize;

/// Errors surfaced by the gateway to clients.
///
/// Every variant renders as an RFC 7807 problem document. Authentication
/// failures on proxied paths never reach this type; the dispatcher turns
/// them into a redirect to `/login` instead.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid state parameter")]
    CsrfStateMismatch,

    #[error("Authentication error: {error} - {description}")]
    IdentityProvider { error: String, description: String },

    #[error("No authorization code received")]
    MissingAuthorizationCode,

    #[error("Service '{0}' not found")]
    RouteNotFound(String),

    #[error("Upstream '{target}' unreachable: {detail}")]
    UpstreamUnreachable { target: String, detail: String },

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("{0}")]
    ServiceUnavailable(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: u64 },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl GatewayError {
    pub fn upstream(target: impl Into<String>, detail: impl ToString) -> Self {
        GatewayError::UpstreamUnreachable {
            target: target.into(),
            detail: detail.to_string(),
        }
    }

    fn slug(&self) -> &'static str {
        match self {
            GatewayError::CsrfStateMismatch => "csrf-state-mismatch",
            GatewayError::IdentityProvider { .. } | GatewayError::MissingAuthorizationCode => {
                "unauthorized"
            }
            GatewayError::RouteNotFound(_) => "not-found",
            GatewayError::UpstreamUnreachable { .. } => "upstream-unreachable",
            GatewayError::TokenExchange(_) => "token-exchange-failed",
            GatewayError::ServiceUnavailable(_) => "service-unavailable",
            GatewayError::RateLimited { .. } => "rate-limit-exceeded",
            GatewayError::Internal(_) => "internal-server-error",
        }
    }

    fn detail(&self) -> String {
        match self {
            // Internal errors are logged, never shown
            GatewayError::Internal(_) => "An unexpected error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

/// RFC 7807 problem details body
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub problem_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl ResponseError for GatewayError {
    fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::CsrfStateMismatch
            | GatewayError::IdentityProvider { .. }
            | GatewayError::MissingAuthorizationCode => StatusCode::UNAUTHORIZED,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::UpstreamUnreachable { .. } | GatewayError::TokenExchange(_) => {
                StatusCode::BAD_GATEWAY
            }
            GatewayError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        if let GatewayError::Internal(e) = self {
            tracing::error!(error = %e, "Internal gateway error");
        }

        let retry_after = match self {
            GatewayError::RateLimited { retry_after } => Some(*retry_after),
            _ => None,
        };
        let problem = ProblemDetails {
            problem_type: format!("about:blank#{}", self.slug()),
            title: status.canonical_reason().unwrap_or("Error").to_string(),
            status: status.as_u16(),
            detail: Some(self.detail()),
            retry_after,
        };

        let mut builder = HttpResponse::build(status);
        builder.content_type("application/problem+json");
        if let Some(secs) = retry_after {
            builder.insert_header((header::RETRY_AFTER, secs.to_string()));
        }
        builder.json(problem)
    }
}
