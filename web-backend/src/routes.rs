use axum::{
    middleware,
    response::Response,
    routing::{get, post},
    Router,
};
use bloodlink_core::{RateLimitClass, RequestContext, Role, RouteConfig, SecureResponse};
use futures::future::BoxFuture;
use std::future::Future;
use tower::ServiceBuilder;
use tower_http::{
    limit::RequestBodyLimitLayer, map_response_body::MapResponseBodyLayer, trace::TraceLayer,
};

use crate::handlers::{self, *};
use crate::security::adapter::{serve, Secured};
use crate::security::headers::{cors_layer, security_headers_middleware};
use crate::state::AppState;

/// Bind `handler` to the shared state and put it behind the pipeline.
fn guarded<F, Fut>(
    state: &AppState,
    handler: F,
    config: RouteConfig,
) -> impl Fn(Secured) -> BoxFuture<'static, Response> + Clone + Send + Sync + 'static
where
    F: Fn(AppState, RequestContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<SecureResponse>> + Send + 'static,
{
    let bound = state.clone();
    let handler = move |ctx: RequestContext| handler(bound.clone(), ctx);
    serve(state.security.pipeline.wrap(handler, config))
}

pub fn router(state: AppState) -> Router {
    use RateLimitClass::*;
    let admin = [Role::Admin];
    let requesters = [Role::Recipient, Role::Hospital, Role::Admin];
    // Credentials are compared verbatim, so those routes skip sanitization.
    let api = Router::new()
        .route(
            "/health",
            get(guarded(&state, handlers::health, RouteConfig::public(Api).without_access_log())),
        )
        .route(
            "/api/csrf-token",
            get(guarded(&state, csrf_token, RouteConfig::public(Api))),
        )
        .route(
            "/api/auth/register",
            post(guarded(
                &state,
                register,
                RouteConfig::public(Auth)
                    .with_schema::<RegisterRequest>()
                    .without_sanitization(),
            )),
        )
        .route(
            "/api/auth/login",
            post(guarded(
                &state,
                login,
                RouteConfig::public(Auth)
                    .with_schema::<LoginRequest>()
                    .without_sanitization(),
            )),
        )
        .route(
            "/api/account/2fa/setup",
            post(guarded(&state, two_factor_setup, RouteConfig::authenticated(Sensitive))),
        )
        .route(
            "/api/account/2fa/enable",
            post(guarded(
                &state,
                two_factor_enable,
                RouteConfig::authenticated(Sensitive).with_schema::<CodeRequest>(),
            )),
        )
        .route(
            "/api/account/2fa/verify",
            post(guarded(
                &state,
                two_factor_verify,
                RouteConfig::authenticated(Auth).with_schema::<CodeRequest>(),
            )),
        )
        .route(
            "/api/account/2fa/disable",
            post(guarded(
                &state,
                two_factor_disable,
                RouteConfig::authenticated(Sensitive)
                    .with_schema::<PasswordConfirmation>()
                    .without_sanitization(),
            )),
        )
        .route(
            "/api/account/password",
            post(guarded(
                &state,
                change_password,
                RouteConfig::authenticated(PasswordReset)
                    .with_user_rate_limit()
                    .with_schema::<ChangePasswordRequest>()
                    .without_sanitization(),
            )),
        )
        .route(
            "/api/requests",
            get(guarded(&state, list_blood_requests, RouteConfig::authenticated(Api))).post(
                guarded(
                    &state,
                    create_blood_request,
                    RouteConfig::authenticated(FormSubmission)
                        .with_user_rate_limit()
                        .with_roles(&requesters)
                        .with_schema::<NewBloodRequest>(),
                ),
            ),
        )
        .route(
            "/api/uploads/validate",
            post(guarded(
                &state,
                validate_upload,
                RouteConfig::authenticated(Upload).with_schema::<UploadRequest>(),
            )),
        )
        .route(
            "/api/admin/alerts",
            get(guarded(&state, list_alerts, RouteConfig::authenticated(Api).with_roles(&admin))),
        )
        .route(
            "/api/admin/alerts/history",
            get(guarded(&state, list_alerts, RouteConfig::authenticated(Api).with_roles(&admin))),
        )
        .route(
            "/api/admin/alerts/:id/resolve",
            post(guarded(
                &state,
                resolve_alert,
                RouteConfig::authenticated(Sensitive).with_roles(&admin).with_2fa(),
            )),
        )
        .route(
            "/api/admin/security/summary",
            get(guarded(
                &state,
                security_summary,
                RouteConfig::authenticated(Api).with_roles(&admin),
            )),
        )
        .route(
            "/api/admin/users/:id/lock",
            get(guarded(&state, lock_status, RouteConfig::authenticated(Api).with_roles(&admin))),
        )
        .route(
            "/api/admin/users/:id/unlock",
            post(guarded(
                &state,
                unlock_account,
                RouteConfig::authenticated(Sensitive).with_roles(&admin).with_2fa(),
            )),
        )
        .route(
            "/api/admin/users/:id/erase",
            post(guarded(
                &state,
                erase_user,
                RouteConfig::authenticated(Sensitive)
                    .with_roles(&admin)
                    .with_2fa()
                    .with_schema::<ErasureRequest>(),
            )),
        );

    let csrf = &state.security.settings.csrf;
    let cors = cors_layer(&csrf.header_name, &csrf.allowed_origins);
    let body_limit = state.http.max_body_bytes;

    api.layer(
        ServiceBuilder::new()
            .layer(middleware::from_fn(security_headers_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            // Type adapter only: `Cors` needs a `Default` response body.
            .layer(MapResponseBodyLayer::new(axum::body::Body::new))
            .layer(RequestBodyLimitLayer::new(body_limit)),
    )
    .with_state(state)
}
