// SPDX-License-Identifier: Apache-2.0
use actix_web::{
    error::PayloadError,
    http::{
        header::{self, HeaderName, HeaderValue},
        Method, StatusCode,
    },
    web::{self, Bytes},
    HttpRequest, HttpResponse,
};
use awc::{Client, ClientRequest};
use futures::{Stream, StreamExt};
use std::time::Duration;
use tracing::{debug, error, instrument, warn};

use crate::error::GatewayError;

/// Bound on connecting, sending and receiving a buffered response
pub const PROXY_TIMEOUT: Duration = Duration::from_secs(30);
/// Longest silence tolerated between two chunks of an event stream
pub const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(3600);
/// Largest upstream body that will be buffered
pub const MAX_BUFFERED_BODY: usize = 64 * 1024 * 1024;

// Far enough out that only the idle timeout ever ends a stream
const STREAM_BODY_DEADLINE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";
const X_FORWARDED_PORT: &str = "x-forwarded-port";

/// Framing headers that never cross the proxy in either direction.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    name == header::CONNECTION
        || name == header::CONTENT_LENGTH
        || name == header::TRANSFER_ENCODING
        || name == header::CONTENT_ENCODING
        || name.as_str() == "keep-alive"
}

/// Where and how one inbound request is forwarded.
#[derive(Debug, Clone)]
pub struct Forward<'a> {
    /// Name used in logs and error bodies
    pub target: &'a str,
    pub base_url: &'a str,
    /// Path below the mount point, without a leading slash
    pub path: &'a str,
    /// External mount point, sent as `X-Forwarded-Prefix`
    pub prefix: &'a str,
    pub bearer: Option<&'a str>,
    pub forwarded_port: Option<&'a str>,
}

impl Forward<'_> {
    pub fn upstream_url(&self, query: &str) -> String {
        let mut url = format!("{}/{}", self.base_url.trim_end_matches('/'), self.path);
        if !query.is_empty() {
            url.push('?');
            url.push_str(query);
        }
        url
    }
}

/// A buffered upstream response, ready to be rewritten or returned.
#[derive(Debug)]
pub struct BufferedResponse {
    pub status: StatusCode,
    pub headers: Vec<(HeaderName, HeaderValue)>,
    pub body: Bytes,
}

impl BufferedResponse {
    pub fn header(&self, name: &HeaderName) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .and_then(|(_, v)| v.to_str().ok())
    }

    pub fn content_type(&self) -> &str {
        self.header(&header::CONTENT_TYPE).unwrap_or("")
    }

    pub fn is_html(&self) -> bool {
        self.content_type().contains("text/html")
    }

    pub fn into_response(self) -> HttpResponse {
        let mut builder = HttpResponse::build(self.status);
        for (name, value) in self.headers {
            builder.append_header((name, value));
        }
        builder.body(self.body)
    }
}

pub enum Proxied {
    /// Event stream relayed chunk by chunk
    Streaming(HttpResponse),
    Buffered(BufferedResponse),
}

impl Proxied {
    pub fn into_response(self) -> HttpResponse {
        match self {
            Proxied::Streaming(res) => res,
            Proxied::Buffered(buffered) => buffered.into_response(),
        }
    }
}

/// Build the outbound request: inbound headers minus `Host`, framing and
/// credentials, plus the bearer token and `X-Forwarded-*` headers.
pub fn build_request(client: &Client, req: &HttpRequest, fwd: &Forward<'_>) -> ClientRequest {
    let mut out = client
        .request(req.method().clone(), fwd.upstream_url(req.query_string()))
        .timeout(PROXY_TIMEOUT);

    for (name, value) in req.headers().iter().filter(|(h, _)| {
        *h != header::HOST
            && !is_hop_by_hop(h)
            && (fwd.bearer.is_none() || *h != header::AUTHORIZATION)
            && !h.as_str().starts_with("x-forwarded-")
    }) {
        out = out.append_header((name.clone(), value.clone()));
    }

    let conn = req.connection_info();
    let peer = req
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    out = out
        .insert_header((X_FORWARDED_FOR, peer))
        .insert_header((X_FORWARDED_PROTO, conn.scheme().to_string()))
        .insert_header((X_FORWARDED_HOST, conn.host().to_string()))
        .insert_header((X_FORWARDED_PREFIX, fwd.prefix.to_string()));
    if let Some(port) = fwd.forwarded_port {
        out = out.insert_header((X_FORWARDED_PORT, port.to_string()));
    }
    if let Some(token) = fwd.bearer {
        out = out.insert_header((header::AUTHORIZATION, format!("Bearer {}", token)));
    }
    out
}

fn response_headers(headers: &header::HeaderMap) -> Vec<(HeaderName, HeaderValue)> {
    headers
        .iter()
        .filter(|(name, _)| !is_hop_by_hop(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

fn is_event_stream(headers: &header::HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("text/event-stream"))
}

/// Relay chunks as they arrive, ending the stream after a long silence.
fn idle_bounded<S>(upstream: S, target: String) -> impl Stream<Item = Result<Bytes, actix_web::Error>>
where
    S: Stream<Item = Result<Bytes, PayloadError>> + Unpin + 'static,
{
    futures::stream::unfold((upstream, target), |(mut upstream, target)| async move {
        match actix_web::rt::time::timeout(STREAM_IDLE_TIMEOUT, upstream.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), (upstream, target))),
            Ok(Some(Err(e))) => {
                error!(target_service = %target, error = %e, "Upstream stream error");
                Some((Err(actix_web::error::ErrorBadGateway(e)), (upstream, target)))
            }
            Ok(None) => None,
            Err(_) => {
                warn!(target_service = %target, "Event stream idle timeout, closing");
                None
            }
        }
    })
}

/// Forward `req` upstream and relay the answer.
///
/// Event streams come back as [`Proxied::Streaming`]; everything else is
/// buffered so the caller may rewrite it. Never retries.
#[instrument(skip_all, fields(target_service = %fwd.target, method = %req.method(), path = %fwd.path))]
pub async fn forward(
    client: &Client,
    req: &HttpRequest,
    payload: web::Payload,
    fwd: &Forward<'_>,
) -> Result<Proxied, GatewayError> {
    let outbound = build_request(client, req, fwd);
    let sent = match *req.method() {
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE => outbound.send_stream(payload),
        _ => outbound.send(),
    };
    let mut res = sent.await.map_err(|e| {
        error!(error = %e, "Forwarding error to target service");
        GatewayError::upstream(fwd.target, e)
    })?;
    debug!(status = %res.status(), "Received response from target service");

    let status = res.status();
    let headers = response_headers(res.headers());

    if is_event_stream(res.headers()) {
        let res = res.timeout(STREAM_BODY_DEADLINE);
        let mut builder = HttpResponse::build(status);
        for (name, value) in headers {
            builder.append_header((name, value));
        }
        builder.insert_header((header::CACHE_CONTROL, "no-cache"));
        return Ok(Proxied::Streaming(
            builder.streaming(idle_bounded(res, fwd.target.to_string())),
        ));
    }

    let body = res.body().limit(MAX_BUFFERED_BODY).await.map_err(|e| {
        error!(error = %e, "Failed to read response body from target service");
        GatewayError::upstream(fwd.target, e)
    })?;
    Ok(Proxied::Buffered(BufferedResponse {
        status,
        headers,
        body,
    }))
}
