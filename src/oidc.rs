// SPDX-License-Identifier: Apache-2.0
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use awc::Client;
use rand::{distr::Alphanumeric, Rng};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};
use url::Url;

use crate::config::IdpConfig;
use crate::error::GatewayError;
use crate::gateway::AppState;
use crate::session::GatewaySession;

pub const CALLBACK_PATH: &str = "/oidc/callback";
const CODE_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

const LOGOUT_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>Logged Out</title>
    <style>
        body { font-family: sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: #f0f0f0; }
        .message { text-align: center; padding: 2rem; background: white; border-radius: 8px; box-shadow: 0 2px 10px rgba(0,0,0,0.1); }
    </style>
</head>
<body>
    <div class="message">
        <h2>You have been logged out</h2>
        <p>Redirecting to login...</p>
    </div>
    <script>
        if (window.sessionStorage) { sessionStorage.clear(); }
        if (window.localStorage) { localStorage.clear(); }
        document.cookie.split(";").forEach(function (c) {
            document.cookie = c.replace(/^ +/, "").replace(/=.*/, "=;expires=" + new Date().toUTCString() + ";path=/");
        });
        setTimeout(function () { window.location.replace('/login'); }, 1000);
    </script>
</body>
</html>
"#;

/// 43 alphanumeric characters from the thread-local CSPRNG.
pub fn random_token() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(43)
        .map(char::from)
        .collect()
}

/// Only same-origin paths may be used as the post-login destination.
pub fn sanitize_next(next: Option<&str>) -> String {
    match next {
        Some(path) if is_local_path(path) => path.to_string(),
        _ => "/".to_string(),
    }
}

// Browsers drop tabs and newlines while parsing, so `/\t/host` becomes `//host`.
fn is_local_path(path: &str) -> bool {
    path.starts_with('/')
        && !path.starts_with("//")
        && !path.contains('\\')
        && !path.chars().any(|c| c.is_control() || c.is_whitespace())
}

/// Authorization endpoint URL, reached by the browser through the sub-path proxy.
pub fn authorization_url(
    public_origin: &str,
    idp: &IdpConfig,
    state: &str,
    nonce: &str,
) -> Result<Url, url::ParseError> {
    let endpoint = format!(
        "{}{}/realms/{}/protocol/openid-connect/auth",
        public_origin, idp.prefix, idp.realm
    );
    let redirect_uri = format!("{}{}", public_origin, CALLBACK_PATH);
    Url::parse_with_params(
        &endpoint,
        &[
            ("response_type", "code"),
            ("client_id", idp.client_id.as_str()),
            ("redirect_uri", redirect_uri.as_str()),
            ("scope", "openid email profile"),
            ("state", state),
            ("nonce", nonce),
        ],
    )
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Serialize)]
struct CodeExchangeForm<'a> {
    grant_type: &'a str,
    code: &'a str,
    redirect_uri: &'a str,
    client_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_secret: Option<&'a str>,
}

#[derive(Deserialize)]
struct CodeExchangeResponse {
    access_token: Option<String>,
}

/// `GET /login`: start the authorization-code flow.
#[instrument(skip_all)]
pub async fn login(
    req: HttpRequest,
    params: web::Query<LoginParams>,
    session: GatewaySession,
    state: web::Data<AppState>,
) -> Result<HttpResponse, GatewayError> {
    let next = sanitize_next(params.next.as_deref());
    let oauth_state = random_token();
    let nonce = random_token();
    session.begin_login(&oauth_state, &nonce, &next)?;

    let url = authorization_url(&state.public_origin(&req), &state.config.idp, &oauth_state, &nonce)
        .map_err(|e| GatewayError::Internal(anyhow::anyhow!("invalid authorization URL: {}", e)))?;
    info!(next = %next, "Redirecting to identity provider");
    Ok(HttpResponse::Found()
        .insert_header((header::LOCATION, url.as_str()))
        .finish())
}

/// `GET /oidc/callback`: finish the flow. Any failure wipes the session.
#[instrument(skip_all)]
pub async fn callback(
    req: HttpRequest,
    params: web::Query<CallbackParams>,
    session: GatewaySession,
    state: web::Data<AppState>,
    client: web::Data<Client>,
) -> Result<HttpResponse, GatewayError> {
    let result = complete_login(&req, &params, &session, &state, &client).await;
    if let Err(e) = &result {
        warn!(error = %e, "Login callback failed, clearing session");
        session.clear();
    }
    result
}

async fn complete_login(
    req: &HttpRequest,
    params: &CallbackParams,
    session: &GatewaySession,
    state: &AppState,
    client: &Client,
) -> Result<HttpResponse, GatewayError> {
    if let Some(error) = &params.error {
        return Err(GatewayError::IdentityProvider {
            error: error.clone(),
            description: params
                .error_description
                .clone()
                .unwrap_or_else(|| "Unknown error".to_string()),
        });
    }

    match (params.state.as_deref(), session.oauth_state()) {
        (Some(received), Some(expected)) if received == expected => {}
        _ => return Err(GatewayError::CsrfStateMismatch),
    }

    let code = params
        .code
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or(GatewayError::MissingAuthorizationCode)?;

    let redirect_uri = format!("{}{}", state.public_origin(req), CALLBACK_PATH);
    let access_token = exchange_code(client, &state.config.idp, code, &redirect_uri).await?;
    let platform_token = state.issuer.exchange_access_token(client, &access_token).await?;

    let validated = state
        .validator
        .validate(client, &platform_token)
        .await
        .map_err(|e| GatewayError::TokenExchange(format!("issued platform token rejected: {}", e)))?;

    let next = session.complete_login(&platform_token, &validated.claims)?;
    info!(sub = %validated.claims.sub, "User logged in");
    Ok(HttpResponse::Found()
        .insert_header((header::LOCATION, next))
        .finish())
}

/// Trade the authorization code for an access token, server to server.
async fn exchange_code(
    client: &Client,
    idp: &IdpConfig,
    code: &str,
    redirect_uri: &str,
) -> Result<String, GatewayError> {
    let token_url = format!(
        "{}/realms/{}/protocol/openid-connect/token",
        idp.backend_url, idp.realm
    );
    let mut res = client
        .post(token_url)
        .timeout(CODE_EXCHANGE_TIMEOUT)
        .send_form(&CodeExchangeForm {
            grant_type: "authorization_code",
            code,
            redirect_uri,
            client_id: &idp.client_id,
            client_secret: idp.client_secret.as_deref(),
        })
        .await
        .map_err(|e| GatewayError::upstream("identity-provider", e))?;

    if !res.status().is_success() {
        return Err(GatewayError::TokenExchange(format!(
            "Failed to exchange code for token: {}",
            res.status().as_u16()
        )));
    }
    let body: CodeExchangeResponse = res
        .json()
        .await
        .map_err(|e| GatewayError::TokenExchange(e.to_string()))?;
    body.access_token
        .ok_or_else(|| GatewayError::TokenExchange("no access token in provider response".into()))
}

/// `GET /logout`: revoke, forget, and have the browser purge its storage.
#[instrument(skip_all)]
pub async fn logout(
    session: GatewaySession,
    state: web::Data<AppState>,
    client: web::Data<Client>,
) -> HttpResponse {
    if let Some(token) = session.platform_token() {
        state.issuer.revoke(&client, &token).await;
    }
    session.clear();

    HttpResponse::Ok()
        .content_type("text/html; charset=utf-8")
        .insert_header(("Clear-Site-Data", "\"cache\", \"cookies\", \"storage\""))
        .insert_header((
            header::CACHE_CONTROL,
            "no-cache, no-store, must-revalidate, max-age=0, private",
        ))
        .insert_header((header::PRAGMA, "no-cache"))
        .insert_header((header::EXPIRES, "0"))
        .body(LOGOUT_PAGE)
}
