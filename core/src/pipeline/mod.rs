//! Ordered request guard composed around business handlers.
//!
//! Stages run in a fixed order and any of them may end the request:
//! rate limit (429), CSRF and origin (403), authentication (401), role (403),
//! second factor presence (403), payload validation and sanitization (400),
//! access logging, then the handler itself (500 on error or panic).

pub mod context;
pub mod identity;
pub mod route;

pub use context::{RequestContext, SecureRequest, SecureResponse};
pub use identity::{AnonymousProvider, Identity, IdentityProvider, Role};
pub use route::{field_errors, PayloadSchema, RouteConfig, ValidatedSchema};

use async_trait::async_trait;
use futures::FutureExt;
use http::StatusCode;
use serde_json::Value;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{debug, error};

use crate::clock::Clock;
use crate::config::{RateLimitSettings, SecuritySettings};
use crate::csrf::{CsrfGuard, CsrfProtection};
use crate::error::GuardError;
use crate::events::{EventDetail, EventOrigin, SecurityEvent, SecurityEventLogger, SecurityEventType};
use crate::kv::KvStore;
use crate::rate_limit::{client_fingerprint, user_identifier, RateLimitDecision, RateLimiter};
use crate::sanitizer::{InputSanitizer, ThreatKind};

/// Header carrying the second-factor token on 2FA-protected routes.
pub const TWO_FACTOR_HEADER: &str = "x-2fa-token";

/// Business logic behind the guard.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn call(&self, ctx: RequestContext) -> anyhow::Result<SecureResponse>;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<SecureResponse>> + Send + 'static,
{
    async fn call(&self, ctx: RequestContext) -> anyhow::Result<SecureResponse> {
        (self)(ctx).await
    }
}

pub struct SecurityPipeline {
    limiter: RateLimiter,
    rate_limits: RateLimitSettings,
    csrf: CsrfProtection,
    sanitizer: InputSanitizer,
    blocking_threats: Vec<ThreatKind>,
    identities: Arc<dyn IdentityProvider>,
    logger: Arc<SecurityEventLogger>,
    clock: Arc<dyn Clock>,
}

impl SecurityPipeline {
    pub fn new(
        settings: &SecuritySettings,
        kv: Arc<dyn KvStore>,
        identities: Arc<dyn IdentityProvider>,
        logger: Arc<SecurityEventLogger>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let guard = CsrfGuard::new(kv.clone(), clock.clone(), &settings.csrf);
        Self {
            limiter: RateLimiter::new(kv, clock.clone()),
            rate_limits: settings.rate_limits.clone(),
            csrf: CsrfProtection::new(guard, &settings.csrf),
            sanitizer: InputSanitizer::new(&settings.sanitizer),
            blocking_threats: settings.sanitizer.blocking_threats.clone(),
            identities,
            logger,
            clock,
        }
    }

    pub fn csrf(&self) -> &CsrfProtection {
        &self.csrf
    }

    pub fn logger(&self) -> &Arc<SecurityEventLogger> {
        &self.logger
    }

    pub fn identities(&self) -> &Arc<dyn IdentityProvider> {
        &self.identities
    }

    /// Wrap `handler` so every call passes through the configured stages.
    pub fn wrap<H: Handler>(self: &Arc<Self>, handler: H, config: RouteConfig) -> GuardedHandler {
        GuardedHandler {
            pipeline: Arc::clone(self),
            handler: Arc::new(handler),
            config: Arc::new(config),
        }
    }

    async fn check_rate_limit(
        &self,
        config: &RouteConfig,
        identifier: &str,
        origin: &EventOrigin,
    ) -> Result<RateLimitDecision, GuardError> {
        let class = config.rate_limit_class;
        let decision = self
            .limiter
            .check_class(class, identifier, self.rate_limits.rule(class))
            .await
            .map_err(|e| {
                error!(error = %e, "Rate limit store failed");
                GuardError::Internal(format!("rate limit store: {}", e))
            })?;

        if !decision.allowed {
            self.logger
                .log_rate_limit_exceeded(origin, class.as_str(), decision.limit, decision.reset_at)
                .await;
            return Err(decision.into_error(self.clock.now()));
        }
        Ok(decision)
    }

    async fn check_csrf(&self, request: &SecureRequest, origin: &EventOrigin) -> Result<(), GuardError> {
        if let Err(err) = self.csrf.check(request).await {
            self.logger.log_csrf_attempt(origin, &err.to_string()).await;
            return Err(err);
        }
        Ok(())
    }

    async fn authenticate(
        &self,
        config: &RouteConfig,
        request: &SecureRequest,
        origin: &EventOrigin,
    ) -> Result<Option<Identity>, GuardError> {
        let identity = self.identities.resolve(request).await;
        if !config.require_auth {
            return Ok(identity);
        }

        let Some(identity) = identity else {
            self.logger
                .log_unauthorized_access(
                    origin,
                    &format!("Missing or invalid credentials for {} {}", request.method, request.path),
                )
                .await;
            return Err(GuardError::AuthenticationRequired);
        };

        if !identity.can_act(self.clock.now()) {
            let origin = EventOrigin {
                user_id: Some(identity.user_id.clone()),
                ..origin.clone()
            };
            self.logger
                .log_unauthorized_access(&origin, "Request from inactive or locked account")
                .await;
            return Err(GuardError::AccountLocked {
                user_id: identity.user_id,
            });
        }
        Ok(Some(identity))
    }

    async fn authorize(
        &self,
        config: &RouteConfig,
        identity: &Identity,
        request: &SecureRequest,
        origin: &EventOrigin,
    ) -> Result<(), GuardError> {
        if config.required_roles.is_empty() || config.required_roles.contains(&identity.role) {
            return Ok(());
        }

        self.logger
            .log_event(
                SecurityEvent::new(
                    SecurityEventType::UnauthorizedAccess,
                    format!(
                        "Role {} not permitted for {} {}",
                        identity.role, request.method, request.path
                    ),
                )
                .with_origin(origin)
                .with_detail(EventDetail::Authorization {
                    required_roles: config
                        .required_roles
                        .iter()
                        .map(|role| role.to_string())
                        .collect(),
                    actual_role: Some(identity.role.to_string()),
                }),
            )
            .await;
        Err(GuardError::InsufficientPermissions {
            user_id: identity.user_id.clone(),
            role: identity.role.to_string(),
        })
    }

    /// Only presence is checked here; handlers verify the code itself.
    async fn check_second_factor(
        &self,
        identity: &Identity,
        request: &SecureRequest,
        origin: &EventOrigin,
    ) -> Result<(), GuardError> {
        if !identity.two_factor_enabled {
            return Ok(());
        }
        match request.header(TWO_FACTOR_HEADER) {
            Some(token) if !token.trim().is_empty() => Ok(()),
            _ => {
                self.logger
                    .log_unauthorized_access(origin, "Second factor token missing")
                    .await;
                Err(GuardError::TwoFactorRequired {
                    user_id: identity.user_id.clone(),
                })
            }
        }
    }

    async fn process_payload(
        &self,
        config: &RouteConfig,
        ctx: &mut RequestContext,
        origin: &EventOrigin,
    ) -> Result<(), GuardError> {
        let payload = if ctx.request.body.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            let parsed: Value = serde_json::from_slice(&ctx.request.body).map_err(|e| {
                debug!(error = %e, path = %ctx.request.path, "Malformed JSON payload");
                GuardError::ValidationFailed {
                    message: "Invalid JSON payload".to_string(),
                    details: None,
                }
            })?;
            Some(parsed)
        };

        if let Some(schema) = &config.validate_schema {
            let candidate = payload.clone().unwrap_or(Value::Null);
            schema
                .validate(&candidate)
                .map_err(|details| GuardError::ValidationFailed {
                    message: "Validation failed".to_string(),
                    details: Some(details),
                })?;
        }

        let Some(payload) = payload else {
            return Ok(());
        };

        if !config.sanitize_input {
            ctx.payload = Some(payload);
            return Ok(());
        }

        let result = self.sanitizer.sanitize_value(&payload, &config.sanitize_options);
        for (field, threats) in &result.threats {
            let raw = result
                .flagged_inputs
                .get(field)
                .map(String::as_str)
                .unwrap_or_default();
            self.logger.log_threats(origin, field, threats, raw).await;
        }

        let blocked = result.threats.iter().find(|(_, threats)| {
            threats.iter().any(|kind| self.blocking_threats.contains(kind))
        });
        if let Some((field, threats)) = blocked {
            return Err(GuardError::MaliciousInputDetected {
                field: field.clone(),
                threats: threats.clone(),
            });
        }

        ctx.threats = result.threats;
        ctx.payload = Some(result.sanitized);
        ctx.original_payload = Some(payload);
        Ok(())
    }

    /// Stages one to six. The rate decision is reported even when a later
    /// stage denies the request.
    async fn admit(
        &self,
        config: &RouteConfig,
        request: SecureRequest,
        decision: &mut Option<RateLimitDecision>,
    ) -> Result<RequestContext, GuardError> {
        let origin = request.origin();
        let client = client_fingerprint(
            request.client_ip.as_deref().unwrap_or("unknown"),
            request.user_agent(),
        );
        *decision = Some(self.check_rate_limit(config, &client, &origin).await?);

        if config.require_csrf {
            self.check_csrf(&request, &origin).await?;
        }

        let identity = self.authenticate(config, &request, &origin).await?;
        let mut ctx = RequestContext::new(request);
        ctx.identity = identity;
        ctx.rate_limit = *decision;
        let origin = ctx.origin();

        if let Some(identity) = &ctx.identity {
            if config.rate_limit_per_user {
                let per_user = self
                    .check_rate_limit(config, &user_identifier(&identity.user_id), &origin)
                    .await?;
                // Report whichever budget is closer to running out.
                if decision.map_or(true, |d| per_user.remaining < d.remaining) {
                    *decision = Some(per_user);
                    ctx.rate_limit = Some(per_user);
                }
            }
            if config.require_auth {
                self.authorize(config, identity, &ctx.request, &origin).await?;
            }
            if config.require_2fa {
                self.check_second_factor(identity, &ctx.request, &origin).await?;
            }
        }

        if ctx.request.is_mutating() {
            self.process_payload(config, &mut ctx, &origin).await?;
        }
        Ok(ctx)
    }

    async fn invoke(&self, config: &RouteConfig, handler: &dyn Handler, ctx: RequestContext) -> SecureResponse {
        let origin = ctx.origin();
        let method = ctx.request.method.to_string();
        let path = ctx.request.path.clone();

        if config.log_access {
            self.logger.log_access(&origin, &method, &path).await;
        }

        let failure = match AssertUnwindSafe(handler.call(ctx)).catch_unwind().await {
            Ok(Ok(response)) => return response,
            Ok(Err(err)) => format!("{:#}", err),
            Err(panic) => panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "handler panicked".to_string()),
        };

        error!(method = %method, path = %path, error = %failure, "Unhandled handler error");
        self.logger
            .log_event(
                SecurityEvent::new(
                    SecurityEventType::SuspiciousActivity,
                    format!("Unhandled error while serving {} {}", method, path),
                )
                .with_origin(&origin),
            )
            .await;
        GuardError::Internal(failure).to_response()
    }
}

/// A handler bound to its pipeline and route configuration.
#[derive(Clone)]
pub struct GuardedHandler {
    pipeline: Arc<SecurityPipeline>,
    handler: Arc<dyn Handler>,
    config: Arc<RouteConfig>,
}

impl GuardedHandler {
    pub fn config(&self) -> &RouteConfig {
        &self.config
    }

    pub async fn handle(&self, request: SecureRequest) -> SecureResponse {
        let mut decision = None;
        let mut response = match self.pipeline.admit(&self.config, request, &mut decision).await {
            Ok(ctx) => self.pipeline.invoke(&self.config, self.handler.as_ref(), ctx).await,
            Err(err) => {
                debug!(error = %err, status = %err.status(), "Request denied");
                err.to_response()
            }
        };

        if let Some(decision) = decision {
            if response.status != StatusCode::TOO_MANY_REQUESTS {
                response.set_rate_limit_headers(decision.limit, decision.remaining, decision.reset_at);
            }
        }
        response
    }
}
