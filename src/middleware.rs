// SPDX-License-Identifier: Apache-2.0
use actix_session::SessionExt;
use actix_web::body::EitherBody;
use actix_web::{
    dev::{Payload, Service, ServiceRequest, ServiceResponse, Transform},
    http::header,
    web, Error, FromRequest, HttpMessage, HttpRequest, HttpResponse, ResponseError,
};
use awc::Client;
use futures::future::{ok, ready, LocalBoxFuture, Ready};
use std::rc::Rc;
use std::task::{Context, Poll};
use tracing::{debug, info, instrument};
use url::form_urlencoded;

use crate::auth::Claims;
use crate::error::GatewayError;
use crate::gateway::AppState;
use crate::idp_proxy::is_passthrough_path;
use crate::rate_limit::rate_limit_key;
use crate::session::GatewaySession;

/// Identity of the caller, attached to every authenticated request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub token: String,
    pub claims: Claims,
}

impl FromRequest for AuthContext {
    type Error = GatewayError;
    type Future = Ready<Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        ready(req.extensions().get::<AuthContext>().cloned().ok_or_else(|| {
            GatewayError::Internal(anyhow::anyhow!("handler reached without authentication"))
        }))
    }
}

/// Paths served without a session.
pub fn is_public_path(path: &str, idp_prefix: &str) -> bool {
    matches!(path, "/health" | "/login" | "/logout" | crate::oidc::CALLBACK_PATH)
        || path.starts_with("/static/")
        || path == idp_prefix
        || path
            .strip_prefix(idp_prefix)
            .is_some_and(|rest| rest.starts_with('/'))
        || is_passthrough_path(path)
}

fn is_rate_limit_exempt(path: &str) -> bool {
    path == "/health" || path.starts_with("/static/")
}

/// `/login?next=...` preserving the original path and query.
pub fn login_redirect(req: &ServiceRequest) -> HttpResponse {
    let original = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let next: String = form_urlencoded::byte_serialize(original.as_bytes()).collect();
    HttpResponse::Found()
        .insert_header((header::LOCATION, format!("/login?next={}", next)))
        .finish()
}

pub struct AuthMiddleware;

impl AuthMiddleware {
    pub fn new() -> Self {
        AuthMiddleware
    }
}

impl Default for AuthMiddleware {
    fn default() -> Self {
        Self::new()
    }
}

impl<S, B> Transform<S, ServiceRequest> for AuthMiddleware
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Transform = AuthMiddlewareService<S>;
    type InitError = ();
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ok(AuthMiddlewareService {
            service: Rc::new(service),
        })
    }
}

pub struct AuthMiddlewareService<S> {
    service: Rc<S>,
}

fn reject<B>(req: ServiceRequest, response: HttpResponse) -> ServiceResponse<EitherBody<B>> {
    let (request, _) = req.into_parts();
    ServiceResponse::new(request, response).map_into_right_body()
}

impl<S, B> Service<ServiceRequest> for AuthMiddlewareService<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    #[instrument(name = "auth_middleware", skip(self, req), fields(path = %req.path(), method = %req.method()))]
    fn call(&self, req: ServiceRequest) -> Self::Future {
        let service = Rc::clone(&self.service);
        let (Some(state), Some(client)) = (
            req.app_data::<web::Data<AppState>>().cloned(),
            req.app_data::<web::Data<Client>>().cloned(),
        ) else {
            let err = GatewayError::Internal(anyhow::anyhow!("gateway state not registered"));
            return Box::pin(async move { Ok(reject(req, err.error_response())) });
        };

        let path = req.path().to_owned();
        let peer = req.peer_addr().map(|addr| addr.ip().to_string());

        if is_public_path(&path, &state.config.idp.prefix) {
            if !is_rate_limit_exempt(&path) {
                let key = rate_limit_key(None, peer.as_deref());
                if let Err(e) = state.limiter.check(&key) {
                    return Box::pin(async move { Ok(reject(req, e.error_response())) });
                }
            }
            debug!("Allowing access to public endpoint: {}", path);
            let fut = service.call(req);
            return Box::pin(async move { Ok(fut.await?.map_into_left_body()) });
        }

        let session = GatewaySession::new(req.get_session());
        let Some(token) = session.platform_token() else {
            info!("No session token, redirecting to login");
            let response = login_redirect(&req);
            return Box::pin(async move { Ok(reject(req, response)) });
        };

        Box::pin(async move {
            let validated = match state.validator.validate(&client, &token).await {
                Ok(validated) => validated,
                Err(e) => {
                    info!(error = %e, "Session token rejected, redirecting to login");
                    session.clear();
                    let response = login_redirect(&req);
                    return Ok(reject(req, response));
                }
            };

            let key = rate_limit_key(Some(&validated.claims), peer.as_deref());
            if let Err(e) = state.limiter.check(&key) {
                return Ok(reject(req, e.error_response()));
            }

            if let Err(e) = session.set_claims(&validated.claims) {
                return Ok(reject(req, e.error_response()));
            }
            req.extensions_mut().insert(AuthContext {
                token,
                claims: validated.claims,
            });

            Ok(service.call(req).await?.map_into_left_body())
        })
    }
}
