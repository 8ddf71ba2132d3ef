use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

use super::identity::Identity;
use crate::events::EventOrigin;
use crate::rate_limit::RateLimitDecision;
use crate::sanitizer::ThreatKind;

/// Transport-neutral view of an inbound request. Every pipeline stage reads
/// from this struct instead of the raw transport object.
#[derive(Debug, Clone)]
pub struct SecureRequest {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    pub cookies: HashMap<String, String>,
    pub client_ip: Option<String>,
    pub session_key: Option<String>,
    pub body: Bytes,
}

impl SecureRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            cookies: HashMap::new(),
            client_ip: None,
            session_key: None,
            body: Bytes::new(),
        }
    }

    /// Build from transport parts; cookies are parsed from the `Cookie` header.
    pub fn from_parts(
        method: Method,
        path: impl Into<String>,
        headers: HeaderMap,
        client_ip: Option<String>,
        body: Bytes,
    ) -> Self {
        let cookies = headers
            .get_all(http::header::COOKIE)
            .iter()
            .filter_map(|value| value.to_str().ok())
            .flat_map(parse_cookie_header)
            .collect();

        Self {
            method,
            path: path.into(),
            headers,
            cookies,
            client_ip,
            session_key: None,
            body,
        }
    }

    pub fn with_session(mut self, session_key: impl Into<String>) -> Self {
        self.session_key = Some(session_key.into());
        self
    }

    /// Invalid header names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn with_cookie(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.cookies.insert(name.into(), value.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.client_ip = Some(ip.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_json(self, value: &Value) -> Self {
        self.with_header("content-type", "application/json")
            .with_body(value.to_string())
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|value| value.to_str().ok())
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name).map(String::as_str)
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.header("user-agent")
    }

    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|token| !token.is_empty())
    }

    /// Methods that carry a payload and change state.
    pub fn is_mutating(&self) -> bool {
        matches!(
            self.method,
            Method::POST | Method::PUT | Method::PATCH | Method::DELETE
        )
    }

    pub fn origin(&self) -> EventOrigin {
        EventOrigin {
            ip_address: self.client_ip.clone(),
            user_agent: self.user_agent().map(str::to_string),
            user_id: None,
        }
    }
}

fn parse_cookie_header(header: &str) -> Vec<(String, String)> {
    header
        .split(';')
        .filter_map(|pair| {
            let (name, value) = pair.split_once('=')?;
            let name = name.trim();
            if name.is_empty() {
                return None;
            }
            Some((name.to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

/// What a guarded handler receives once every stage has passed.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request: SecureRequest,
    pub identity: Option<Identity>,
    /// Parsed payload; sanitized when the route enables sanitization.
    pub payload: Option<Value>,
    pub original_payload: Option<Value>,
    /// Detected threats keyed by dotted field path.
    pub threats: BTreeMap<String, Vec<ThreatKind>>,
    pub rate_limit: Option<RateLimitDecision>,
}

impl RequestContext {
    pub fn new(request: SecureRequest) -> Self {
        Self {
            request,
            identity: None,
            payload: None,
            original_payload: None,
            threats: BTreeMap::new(),
            rate_limit: None,
        }
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|identity| identity.user_id.as_str())
    }

    pub fn origin(&self) -> EventOrigin {
        EventOrigin {
            user_id: self.user_id().map(str::to_string),
            ..self.request.origin()
        }
    }

    /// Deserialize the (sanitized) payload into a typed body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone().unwrap_or(Value::Null))
    }
}

/// Transport-neutral response rendered by the web layer.
#[derive(Debug, Clone)]
pub struct SecureResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Value,
}

impl SecureResponse {
    pub fn json(status: StatusCode, body: Value) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body,
        }
    }

    pub fn ok(body: Value) -> Self {
        Self::json(StatusCode::OK, body)
    }

    pub fn created(body: Value) -> Self {
        Self::json(StatusCode::CREATED, body)
    }

    pub fn with_header(mut self, name: HeaderName, value: &str) -> Self {
        if let Ok(value) = HeaderValue::from_str(value) {
            self.headers.insert(name, value);
        }
        self
    }

    pub fn set_rate_limit_headers(&mut self, limit: u32, remaining: u32, reset_at: DateTime<Utc>) {
        let values = [
            ("x-ratelimit-limit", limit.to_string()),
            ("x-ratelimit-remaining", remaining.to_string()),
            ("x-ratelimit-reset", reset_at.timestamp().to_string()),
        ];
        for (name, value) in values {
            if let Ok(value) = HeaderValue::from_str(&value) {
                self.headers.insert(HeaderName::from_static(name), value);
            }
        }
    }
}
