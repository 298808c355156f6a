// SPDX-License-Identifier: Apache-2.0
#![allow(dead_code)]
use actix_web::{http::header, web, App, HttpRequest, HttpResponse, HttpServer};
use futures::StreamExt;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use meshgate::config::GatewayConfig;
use meshgate::gateway::{self, AppState, SESSION_COOKIE};
use meshgate::memory_session_store::MemorySessionStore;
use meshgate::middleware::AuthMiddleware;
use meshgate::routes::RouteTable;

pub const SIGNING_KEY: &str = include_str!("../fixtures/signing_key.pem");
pub const JWKS: &str = include_str!("../fixtures/jwks.json");

/// RS256 token signed with the fixture key, as the issuer would mint it.
pub fn mint(sub: &str, email: &str, permission: &str) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("test-key".into());
    let claims = json!({
        "sub": sub,
        "email": email,
        "permission_level": permission,
        "iss": "hivematrix-core",
        "exp": now + 3600,
    });
    encode(
        &header,
        &claims,
        &EncodingKey::from_rsa_pem(SIGNING_KEY.as_bytes()).unwrap(),
    )
    .unwrap()
}

/// Call counts recorded by the mock issuer.
#[derive(Debug, Default)]
pub struct Platform {
    pub validations: AtomicUsize,
    pub revocations: AtomicUsize,
    pub mints: AtomicUsize,
    pub code_exchanges: AtomicUsize,
    pub revoked: AtomicBool,
}

impl Platform {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

/// Token issuer and identity provider on one ephemeral port.
pub fn spawn_platform(platform: Arc<Platform>) -> SocketAddr {
    let data = web::Data::from(platform);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(data.clone())
            .route(
                "/.well-known/jwks.json",
                web::get().to(|| async {
                    HttpResponse::Ok()
                        .content_type("application/json")
                        .body(JWKS)
                }),
            )
            .route(
                "/api/token/validate",
                web::post().to(|p: web::Data<Platform>| async move {
                    p.validations.fetch_add(1, Ordering::SeqCst);
                    if p.revoked.load(Ordering::SeqCst) {
                        HttpResponse::Unauthorized().json(json!({ "valid": false }))
                    } else {
                        HttpResponse::Ok().json(json!({ "valid": true }))
                    }
                }),
            )
            .route(
                "/api/token/revoke",
                web::post().to(|p: web::Data<Platform>| async move {
                    p.revocations.fetch_add(1, Ordering::SeqCst);
                    HttpResponse::Ok().json(json!({ "message": "revoked" }))
                }),
            )
            .route(
                "/api/token/exchange",
                web::post().to(|| async {
                    HttpResponse::Ok().json(json!({
                        "token": mint("user-1", "alice@example.com", "technician")
                    }))
                }),
            )
            .route(
                "/service-token",
                web::post().to(|p: web::Data<Platform>| async move {
                    p.mints.fetch_add(1, Ordering::SeqCst);
                    HttpResponse::Ok().json(json!({
                        "token": mint("service:meshgate", "", "admin")
                    }))
                }),
            )
            .route(
                "/realms/hivematrix/protocol/openid-connect/token",
                web::post().to(
                    |p: web::Data<Platform>, form: web::Form<HashMap<String, String>>| async move {
                        p.code_exchanges.fetch_add(1, Ordering::SeqCst);
                        if form.get("code").map(String::as_str) == Some("good-code") {
                            HttpResponse::Ok().json(json!({ "access_token": "idp-access-token" }))
                        } else {
                            HttpResponse::BadRequest().json(json!({ "error": "invalid_grant" }))
                        }
                    },
                ),
            )
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    addr
}

async fn echo(req: HttpRequest, body: web::Bytes) -> HttpResponse {
    let headers: serde_json::Map<String, serde_json::Value> = req
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                json!(value.to_str().unwrap_or_default()),
            )
        })
        .collect();
    HttpResponse::Ok()
        .insert_header(("x-backend", "echo"))
        .json(json!({
            "method": req.method().as_str(),
            "path": req.path(),
            "query": req.query_string(),
            "headers": headers,
            "body": String::from_utf8_lossy(&body),
        }))
}

async fn events() -> HttpResponse {
    let first = futures::stream::once(async {
        Ok::<_, actix_web::Error>(web::Bytes::from_static(b"data: first\n\n"))
    });
    let second = futures::stream::once(async {
        actix_web::rt::time::sleep(Duration::from_secs(30)).await;
        Ok::<_, actix_web::Error>(web::Bytes::from_static(b"data: second\n\n"))
    });
    HttpResponse::Ok()
        .content_type("text/event-stream")
        .streaming(first.chain(second))
}

const PAGE: &str = "<!DOCTYPE html><html><head><title>Svc</title></head><body><p>hello</p></body></html>";

/// A backend service that also answers preference lookups.
pub fn spawn_backend() -> SocketAddr {
    let server = HttpServer::new(|| {
        App::new()
            .route("/events", web::get().to(events))
            .route(
                "/page",
                web::get().to(|| async {
                    HttpResponse::Ok()
                        .content_type("text/html; charset=utf-8")
                        .body(PAGE)
                }),
            )
            .route(
                "/api/public/user/theme",
                web::get().to(|| async {
                    HttpResponse::Ok().json(json!({ "theme": "dark", "color_theme": "blue" }))
                }),
            )
            .route(
                "/api/public/user/home-page",
                web::get().to(|| async { HttpResponse::Ok().json(json!({ "home_page": "svc" })) }),
            )
            .default_service(web::to(echo))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());
    addr
}

pub fn route_table(backend: SocketAddr) -> RouteTable {
    let text = format!(
        r#"
        [[service]]
        name = "svc"
        url = "http://{backend}"

        [[service]]
        name = "codex"
        url = "http://{backend}"

        [[service]]
        name = "architect"
        url = "http://{backend}"
        admin_only = true

        [[service]]
        name = "dead"
        url = "http://127.0.0.1:1"

        [[alias]]
        path = "helpdesk"
        target = "/svc/helpdesk"
        "#
    );
    RouteTable::from_toml_str(&text, "/keycloak").unwrap()
}

pub struct TestGateway {
    pub url: String,
    pub platform: Arc<Platform>,
    pub http: reqwest::Client,
}

/// Gateway wired like `main`, in front of fresh mocks.
pub fn spawn_gateway(extra_env: &[(&str, &str)]) -> TestGateway {
    let platform = Arc::new(Platform::default());
    let platform_addr = spawn_platform(platform.clone());
    let backend = spawn_backend();

    let mut env: HashMap<String, String> = HashMap::from([
        ("MESHGATE_CORE_URL".to_string(), format!("http://{platform_addr}")),
        (
            "MESHGATE_IDP_BACKEND_URL".to_string(),
            format!("http://{platform_addr}"),
        ),
    ]);
    for (k, v) in extra_env {
        env.insert(k.to_string(), v.to_string());
    }
    let config = GatewayConfig::from_lookup(|name| env.get(name).cloned()).unwrap();

    let state = web::Data::new(AppState::new(config, route_table(backend)));
    let store = MemorySessionStore::new();
    let server = HttpServer::new(move || {
        let prefix = state.config.idp.prefix.clone();
        App::new()
            .app_data(state.clone())
            .app_data(web::Data::new(gateway::http_client()))
            .configure(|cfg| gateway::configure(cfg, &prefix))
            .wrap(AuthMiddleware::new())
            .wrap(gateway::session_middleware(&state.config, store.clone()))
    })
    .workers(1)
    .bind(("127.0.0.1", 0))
    .unwrap();
    let addr = server.addrs()[0];
    actix_web::rt::spawn(server.run());

    let http = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap();

    TestGateway {
        url: format!("http://{addr}"),
        platform,
        http,
    }
}

/// `name=value` of the session cookie set on `res`, if any.
pub fn session_cookie(res: &reqwest::Response) -> Option<String> {
    res.headers()
        .get_all(header::SET_COOKIE.as_str())
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find(|v| v.starts_with(&format!("{SESSION_COOKIE}=")))
        .and_then(|v| v.split(';').next())
        .map(str::to_string)
}

pub fn location(res: &reqwest::Response) -> String {
    res.headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

impl TestGateway {
    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http.get(format!("{}{}", self.url, path))
    }

    /// Start a login; returns the pre-login cookie and the `state` sent to the provider.
    pub async fn begin_login(&self, next: &str) -> (String, String) {
        let res = self
            .get(&format!("/login?next={}", urlencode(next)))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 302);
        let cookie = session_cookie(&res).expect("login sets a session cookie");
        let auth_url = url::Url::parse(&location(&res)).unwrap();
        let state = auth_url
            .query_pairs()
            .find(|(k, _)| k == "state")
            .map(|(_, v)| v.into_owned())
            .unwrap();
        (cookie, state)
    }

    /// Full authorization-code login; returns the authenticated session cookie.
    pub async fn login(&self) -> String {
        let (cookie, state) = self.begin_login("/").await;
        let res = self
            .get(&format!("/oidc/callback?code=good-code&state={state}"))
            .header("cookie", &cookie)
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), 302, "callback should redirect");
        session_cookie(&res).expect("callback renews the session cookie")
    }
}

pub fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
