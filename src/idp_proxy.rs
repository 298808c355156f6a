// SPDX-License-Identifier: Apache-2.0
use actix_web::{
    http::{
        header::{self, HeaderValue},
        StatusCode,
    },
    web::{self, Bytes},
    HttpRequest, HttpResponse,
};
use awc::Client;
use tracing::{debug, instrument};

use crate::error::GatewayError;
use crate::gateway::AppState;
use crate::proxy::{self, BufferedResponse, Forward, Proxied};

/// Root path prefixes the identity provider's login pages request directly.
pub const PASSTHROUGH_PREFIXES: &[&str] = &["realms/", "resources/"];

// Identity provider sits behind TLS termination on the standard port
const FORWARDED_PORT: &str = "443";

/// Point a backend cookie at the external sub-path.
pub fn rewrite_set_cookie(value: &str, prefix: &str) -> String {
    let mut parts = value.split(';').map(str::trim);
    let mut out = parts.next().unwrap_or_default().to_string();
    let mut has_path = false;
    let mut has_same_site = false;

    for attr in parts.filter(|a| !a.is_empty()) {
        let name = attr.split('=').next().unwrap_or_default().trim();
        if name.eq_ignore_ascii_case("domain") {
            continue;
        }
        out.push_str("; ");
        if name.eq_ignore_ascii_case("path") {
            has_path = true;
            out.push_str("Path=");
            out.push_str(prefix);
        } else {
            has_same_site |= name.eq_ignore_ascii_case("samesite");
            out.push_str(attr);
        }
    }
    if !has_path {
        out.push_str("; Path=");
        out.push_str(prefix);
    }
    if !has_same_site {
        out.push_str("; SameSite=Lax");
    }
    out
}

/// Map a redirect target on the backend origin onto the external sub-path.
pub fn rewrite_location(location: &str, backend_origin: &str, external: &str) -> Option<String> {
    location
        .strip_prefix(backend_origin)
        .map(|rest| format!("{}{}", external, rest))
}

/// Replace backend-origin URLs and root-relative form actions in a text body.
pub fn rewrite_text(body: &str, backend_origin: &str, external: &str) -> String {
    body.replace(backend_origin, external)
        .replace("action=\"/", &format!("action=\"{}/", external))
}

fn is_rewritable(content_type: &str) -> bool {
    ["text/html", "application/javascript", "text/javascript", "text/css"]
        .iter()
        .any(|t| content_type.contains(t))
}

fn rewrite_response(mut res: BufferedResponse, backend_origin: &str, external: &str, prefix: &str) -> BufferedResponse {
    let redirect = matches!(
        res.status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    );

    for (name, value) in res.headers.iter_mut() {
        let Ok(current) = value.to_str() else { continue };
        let rewritten = if *name == header::SET_COOKIE {
            Some(rewrite_set_cookie(current, prefix))
        } else if redirect && *name == header::LOCATION {
            rewrite_location(current, backend_origin, external)
        } else {
            None
        };
        if let Some(new) = rewritten.and_then(|v| HeaderValue::from_str(&v).ok()) {
            *value = new;
        }
    }

    if is_rewritable(res.content_type()) {
        let rewritten = std::str::from_utf8(&res.body).map(|text| rewrite_text(text, backend_origin, external));
        match rewritten {
            Ok(text) => res.body = Bytes::from(text),
            Err(e) => debug!(error = %e, "Identity provider body is not UTF-8, passing through"),
        }
    }
    res
}

/// Generic sub-path mode: `{prefix}/...` with header and body rewriting.
#[instrument(skip_all, fields(path = %req.path()))]
pub async fn subpath(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
    client: web::Data<Client>,
) -> Result<HttpResponse, GatewayError> {
    let idp = &state.config.idp;
    let rest = req
        .path()
        .strip_prefix(idp.prefix.as_str())
        .unwrap_or_default()
        .trim_start_matches('/');
    let fwd = Forward {
        target: "identity-provider",
        base_url: &idp.backend_url,
        path: rest,
        prefix: &idp.prefix,
        bearer: None,
        forwarded_port: Some(FORWARDED_PORT),
    };

    match proxy::forward(&client, &req, payload, &fwd).await? {
        Proxied::Streaming(res) => Ok(res),
        Proxied::Buffered(res) => {
            let external = format!("{}{}", state.public_origin(&req), idp.prefix);
            Ok(rewrite_response(res, &idp.backend_url, &external, &idp.prefix).into_response())
        }
    }
}

/// Passthrough mode for `realms/...` and `resources/...` at the root.
#[instrument(skip_all, fields(path = %req.path()))]
pub async fn passthrough(
    req: HttpRequest,
    payload: web::Payload,
    state: web::Data<AppState>,
    client: web::Data<Client>,
) -> Result<HttpResponse, GatewayError> {
    let idp = &state.config.idp;
    let fwd = Forward {
        target: "identity-provider",
        base_url: &idp.backend_url,
        path: req.path().trim_start_matches('/'),
        prefix: &idp.prefix,
        bearer: None,
        forwarded_port: Some(FORWARDED_PORT),
    };
    Ok(proxy::forward(&client, &req, payload, &fwd).await?.into_response())
}

pub fn is_passthrough_path(path: &str) -> bool {
    let path = path.trim_start_matches('/');
    PASSTHROUGH_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Register both modes under their paths.
pub fn configure(cfg: &mut web::ServiceConfig, prefix: &str) {
    cfg.service(web::resource(prefix.to_string()).route(web::route().to(subpath)))
        .service(web::resource(format!("{}/{{tail:.*}}", prefix)).route(web::route().to(subpath)));
    for p in PASSTHROUGH_PREFIXES {
        cfg.service(web::resource(format!("/{}{{tail:.*}}", p)).route(web::route().to(passthrough)));
    }
}
