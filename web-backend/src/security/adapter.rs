// Bridges axum requests and responses to the transport-neutral pipeline types.
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequest, Request},
    http::{request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bloodlink_core::{GuardedHandler, SecureRequest, SecureResponse};
use futures::future::{BoxFuture, FutureExt};
use serde_json::json;
use std::net::SocketAddr;
use tracing::debug;

use crate::state::{AppState, HttpSettings};

/// An inbound request converted for the security pipeline.
pub struct Secured(pub SecureRequest);

#[async_trait]
impl FromRequest<AppState> for Secured {
    type Rejection = Response;

    async fn from_request(req: Request, state: &AppState) -> Result<Self, Self::Rejection> {
        let (parts, body) = req.into_parts();
        let client_ip = client_ip(&parts, state.http.trust_proxy);

        let body = axum::body::to_bytes(body, state.http.max_body_bytes)
            .await
            .map_err(|err| {
                debug!(error = %err, "Request body rejected");
                (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    Json(json!({ "error": "Payload too large" })),
                )
                    .into_response()
            })?;

        let path = parts.uri.path().to_string();
        let mut request = SecureRequest::from_parts(parts.method, path, parts.headers, client_ip, body);
        if let Some(session) = request.cookie(&state.http.session_cookie).map(str::to_string) {
            request = request.with_session(session);
        }
        Ok(Secured(request))
    }
}

fn client_ip(parts: &Parts, trust_proxy: bool) -> Option<String> {
    if trust_proxy {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|ip| !ip.is_empty());
        if let Some(ip) = forwarded {
            return Some(ip.to_string());
        }
    }
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
}

pub fn render(response: SecureResponse) -> Response {
    let mut rendered = (response.status, Json(response.body)).into_response();
    rendered.headers_mut().extend(response.headers);
    rendered
}

/// Axum handler running `guarded` for every request on the route.
pub fn serve(
    guarded: GuardedHandler,
) -> impl Fn(Secured) -> BoxFuture<'static, Response> + Clone + Send + Sync + 'static {
    move |Secured(request)| {
        let guarded = guarded.clone();
        async move { render(guarded.handle(request).await) }.boxed()
    }
}

/// `Set-Cookie` value for a session or double-submit cookie.
pub fn cookie(http: &HttpSettings, name: &str, value: &str, http_only: bool, max_age_secs: i64) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; SameSite=Strict; Max-Age={}",
        name, value, max_age_secs
    );
    if http_only {
        cookie.push_str("; HttpOnly");
    }
    if http.secure_cookies {
        cookie.push_str("; Secure");
    }
    cookie
}
