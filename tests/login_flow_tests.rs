// SPDX-License-Identifier: Apache-2.0
mod common;

use common::{location, session_cookie, spawn_gateway, urlencode, Platform};
use std::sync::atomic::Ordering;

#[actix_web::test]
async fn unauthenticated_requests_redirect_to_login_with_next() {
    let gw = spawn_gateway(&[]);

    let res = gw.get("/svc/tickets?id=4").send().await.unwrap();
    assert_eq!(res.status(), 302);
    assert_eq!(location(&res), format!("/login?next={}", urlencode("/svc/tickets?id=4")));
}

#[actix_web::test]
async fn login_redirects_to_provider_through_sub_path() {
    let gw = spawn_gateway(&[("MESHGATE_PUBLIC_URL", "https://gw.example")]);

    let res = gw.get("/login?next=%2Fsvc%2F").send().await.unwrap();
    assert_eq!(res.status(), 302);
    let target = url::Url::parse(&location(&res)).unwrap();
    assert_eq!(target.host_str(), Some("gw.example"));
    assert_eq!(
        target.path(),
        "/keycloak/realms/hivematrix/protocol/openid-connect/auth"
    );
    let redirect_uri = target
        .query_pairs()
        .find(|(k, _)| k == "redirect_uri")
        .map(|(_, v)| v.into_owned());
    assert_eq!(redirect_uri.as_deref(), Some("https://gw.example/oidc/callback"));
}

#[actix_web::test]
async fn callback_returns_to_the_original_destination() {
    let gw = spawn_gateway(&[]);
    let (cookie, state) = gw.begin_login("/svc/tickets?id=4").await;

    let res = gw
        .get(&format!("/oidc/callback?code=good-code&state={state}"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 302);
    assert_eq!(location(&res), "/svc/tickets?id=4");

    let renewed = session_cookie(&res).unwrap();
    assert_ne!(renewed, cookie, "session identifier is rotated on login");
    assert_eq!(Platform::count(&gw.platform.code_exchanges), 1);

    let res = gw
        .get("/svc/tickets?id=4")
        .header("cookie", &renewed)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 200);
}

#[actix_web::test]
async fn state_mismatch_is_rejected_and_clears_pending_login() {
    let gw = spawn_gateway(&[]);
    let (cookie, state) = gw.begin_login("/").await;

    let res = gw
        .get("/oidc/callback?code=good-code&state=forged")
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    assert_eq!(res.headers()["content-type"], "application/problem+json");

    // the real state no longer works either
    let res = gw
        .get(&format!("/oidc/callback?code=good-code&state={state}"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);
    assert_eq!(Platform::count(&gw.platform.code_exchanges), 0);
}

#[actix_web::test]
async fn provider_errors_and_rejected_codes_fail_the_login() {
    let gw = spawn_gateway(&[]);

    let (cookie, state) = gw.begin_login("/").await;
    let res = gw
        .get(&format!(
            "/oidc/callback?error=access_denied&error_description=nope&state={state}"
        ))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 401);

    let (cookie, state) = gw.begin_login("/").await;
    let res = gw
        .get(&format!("/oidc/callback?code=bad-code&state={state}"))
        .header("cookie", &cookie)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), 502);
}

#[actix_web::test]
async fn revoked_sessions_are_sent_back_to_login() {
    let gw = spawn_gateway(&[]);
    let cookie = gw.login().await;

    let res = gw.get("/svc/x").header("cookie", &cookie).send().await.unwrap();
    assert_eq!(res.status(), 200);

    gw.platform.revoked.store(true, Ordering::SeqCst);
    let res = gw.get("/svc/x").header("cookie", &cookie).send().await.unwrap();
    assert_eq!(res.status(), 302);
    assert!(location(&res).starts_with("/login?next="));
}

#[actix_web::test]
async fn logout_revokes_and_clears_the_browser() {
    let gw = spawn_gateway(&[]);
    let cookie = gw.login().await;

    let res = gw.get("/logout").header("cookie", &cookie).send().await.unwrap();
    assert_eq!(res.status(), 200);
    assert_eq!(
        res.headers()["clear-site-data"],
        "\"cache\", \"cookies\", \"storage\""
    );
    assert!(res.headers()["cache-control"]
        .to_str()
        .unwrap()
        .contains("no-store"));
    assert!(res.text().await.unwrap().contains("You have been logged out"));
    assert_eq!(Platform::count(&gw.platform.revocations), 1);

    let res = gw.get("/svc/x").header("cookie", &cookie).send().await.unwrap();
    assert_eq!(res.status(), 302);
}

#[actix_web::test]
async fn health_is_public() {
    let gw = spawn_gateway(&[]);
    let res = gw.get("/health").send().await.unwrap();
    assert_eq!(res.status(), 200);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}
