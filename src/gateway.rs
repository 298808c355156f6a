// SPDX-License-Identifier: Apache-2.0
use actix_files::Files;
use actix_session::config::PersistentSession;
use actix_session::SessionMiddleware;
use actix_web::cookie::{time, Key, SameSite};
use actix_web::{http::header, web, HttpRequest, HttpResponse};
use awc::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::auth::{Claims, TokenValidator};
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::issuer::IssuerClient;
use crate::memory_session_store::MemorySessionStore;
use crate::middleware::AuthContext;
use crate::preferences::{resolve_home_page, resolve_theme, HttpPreferenceSource, ThemePreference};
use crate::proxy::{self, Forward, Proxied, PROXY_TIMEOUT};
use crate::rate_limit::GatewayRateLimiter;
use crate::rewrite::HtmlRewrite;
use crate::routes::{split_service_path, RouteTable};
use crate::service_token::{unix_now, ServiceClient};
use crate::session::GatewaySession;
use crate::{idp_proxy, oidc};

pub const SESSION_COOKIE: &str = "meshgate_session";
pub const STATIC_DIR: &str = "static";

/// Shared, process-wide gateway state.
pub struct AppState {
    pub config: GatewayConfig,
    pub routes: RouteTable,
    pub issuer: IssuerClient,
    pub validator: TokenValidator,
    pub services: ServiceClient,
    pub limiter: GatewayRateLimiter,
}

impl AppState {
    pub fn new(config: GatewayConfig, routes: RouteTable) -> Self {
        let issuer = IssuerClient::new(config.core_url.as_str());
        let validator = TokenValidator::new(
            issuer.clone(),
            config.token_issuer.as_str(),
            config.revocation_fail_open,
        );
        let services = ServiceClient::new(config.service_name.as_str(), issuer.clone());
        let limiter = GatewayRateLimiter::new(&config.rate_limit);
        Self {
            config,
            routes,
            issuer,
            validator,
            services,
            limiter,
        }
    }

    /// Externally visible origin: configured, else taken from the request.
    pub fn public_origin(&self, req: &HttpRequest) -> String {
        match &self.config.public_url {
            Some(url) => url.clone(),
            None => {
                let conn = req.connection_info();
                format!("{}://{}", conn.scheme(), conn.host())
            }
        }
    }

    fn preference_source<'a>(&'a self, client: &'a Client) -> HttpPreferenceSource<'a> {
        HttpPreferenceSource {
            client,
            services: &self.services,
            routes: &self.routes,
            service: &self.config.preference_service,
        }
    }
}

/// Outbound client; one per worker. Redirects are relayed, never followed.
pub fn http_client() -> Client {
    let connector = awc::Connector::new()
        .timeout(Duration::from_secs(10))
        .conn_keep_alive(Duration::from_secs(15))
        .disconnect_timeout(Duration::from_secs(2));

    awc::ClientBuilder::new()
        .timeout(PROXY_TIMEOUT)
        .disable_redirects()
        .connector(connector)
        .finish()
}

pub fn session_middleware(
    config: &GatewayConfig,
    store: MemorySessionStore,
) -> SessionMiddleware<MemorySessionStore> {
    SessionMiddleware::builder(store, Key::from(config.session_key.as_slice()))
        .cookie_name(SESSION_COOKIE.to_string())
        .cookie_secure(config.cookie_secure)
        .cookie_http_only(true)
        .cookie_same_site(SameSite::Lax)
        .session_lifecycle(PersistentSession::default().session_ttl(time::Duration::hours(1)))
        .build()
}

/// Register every gateway route. Callers wrap the app in [`AuthMiddleware`]
/// and the session middleware.
///
/// [`AuthMiddleware`]: crate::middleware::AuthMiddleware
pub fn configure(cfg: &mut web::ServiceConfig, idp_prefix: &str) {
    cfg.service(web::resource("/health").route(web::get().to(health)))
        .service(web::resource("/login").route(web::get().to(oidc::login)))
        .service(web::resource(oidc::CALLBACK_PATH).route(web::get().to(oidc::callback)))
        .service(web::resource("/logout").route(web::get().to(oidc::logout)))
        .service(web::resource("/api/invalidate-cache").route(web::post().to(invalidate_cache)))
        .service(Files::new("/static", STATIC_DIR));
    idp_proxy::configure(cfg, idp_prefix);
    cfg.default_service(web::to(dispatch));
}

#[derive(Serialize)]
struct Health<'a> {
    status: &'a str,
    service: &'a str,
    version: &'a str,
}

pub async fn health(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(Health {
        status: "healthy",
        service: &state.config.service_name,
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Drop this session's cached preferences so the next page load refetches them.
pub async fn invalidate_cache(session: GatewaySession) -> Result<HttpResponse, GatewayError> {
    let mut cache = session.pref_cache();
    cache.invalidate();
    session.set_pref_cache(&cache)?;
    debug!("Preference cache invalidated");
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "success": true,
        "message": "Cache invalidated",
    })))
}

async fn theme_for(
    session: &GatewaySession,
    state: &AppState,
    client: &Client,
    claims: &Claims,
) -> ThemePreference {
    let before = session.pref_cache();
    let mut cache = before.clone();
    let theme = resolve_theme(
        &mut cache,
        &state.preference_source(client),
        claims.email.as_deref(),
        unix_now(),
    )
    .await;
    if cache != before {
        if let Err(e) = session.set_pref_cache(&cache) {
            warn!(error = %e, "Could not store preference cache");
        }
    }
    theme
}

/// `GET /`: the user's home page if reachable, else the first navigable service.
async fn landing(
    session: &GatewaySession,
    state: &AppState,
    client: &Client,
    claims: &Claims,
) -> HttpResponse {
    let before = session.pref_cache();
    let mut cache = before.clone();
    let preferred = resolve_home_page(
        &mut cache,
        &state.preference_source(client),
        claims.email.as_deref(),
        unix_now(),
    )
    .await;
    if cache != before {
        if let Err(e) = session.set_pref_cache(&cache) {
            warn!(error = %e, "Could not store preference cache");
        }
    }

    match state
        .routes
        .landing_route(preferred.as_deref(), claims.permission_level)
    {
        Some(route) => HttpResponse::Found()
            .insert_header((header::LOCATION, format!("/{}/", route.name)))
            .finish(),
        None => HttpResponse::Ok()
            .content_type("text/html; charset=utf-8")
            .body("<h1>Gateway</h1><p>No services available for your permission level.</p>"),
    }
}

/// Everything not claimed by a gateway route: aliases, `/`, then the proxy.
#[instrument(skip_all, fields(path = %req.path(), sub = %auth.claims.sub))]
pub async fn dispatch(
    req: HttpRequest,
    payload: web::Payload,
    auth: AuthContext,
    session: GatewaySession,
    state: web::Data<AppState>,
    client: web::Data<Client>,
) -> Result<HttpResponse, GatewayError> {
    let (service, rest) = split_service_path(req.path());
    if service.is_empty() {
        return Ok(landing(&session, &state, &client, &auth.claims).await);
    }

    if rest.is_empty() {
        if let Some(alias) = state.routes.alias(service) {
            return Ok(HttpResponse::Found()
                .insert_header((header::LOCATION, alias.target.as_str()))
                .finish());
        }
    }

    let route = state
        .routes
        .get(service)
        .ok_or_else(|| GatewayError::RouteNotFound(service.to_string()))?;
    let prefix = format!("/{}", route.name);
    let fwd = Forward {
        target: &route.name,
        base_url: &route.base_url,
        path: rest,
        prefix: &prefix,
        bearer: Some(&auth.token),
        forwarded_port: None,
    };

    match proxy::forward(&client, &req, payload, &fwd).await? {
        Proxied::Streaming(res) => Ok(res),
        Proxied::Buffered(mut res) if res.is_html() => {
            let theme = theme_for(&session, &state, &client, &auth.claims).await;
            let rewrite = HtmlRewrite::new(
                theme,
                &state.config.asset_version,
                &state.routes,
                auth.claims.permission_level,
                service,
                &state.config.preference_service,
            );
            res.body = rewrite.apply(res.body);
            Ok(res.into_response())
        }
        Proxied::Buffered(res) => Ok(res.into_response()),
    }
}
