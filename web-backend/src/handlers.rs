use anyhow::Context;
use axum::http::{header, HeaderValue, StatusCode};
use bloodlink_core::error::{AlertError, PasswordError, TwoFactorError};
use bloodlink_core::pipeline::TWO_FACTOR_HEADER;
use bloodlink_core::sanitizer::UploadDescriptor;
use bloodlink_core::{Identity, LoginOutcome, RequestContext, Role, SecureResponse};
use chrono::Duration;
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use uuid::Uuid;
use validator::Validate;

use crate::security::adapter::cookie;
use crate::state::{AppState, BloodRequestRecord, Registration};

type HandlerResult = anyhow::Result<SecureResponse>;

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[validate(email(message = "A valid email address is required"))]
    pub email: String,
    #[validate(length(min = 2, max = 100, message = "Name must be 2 to 100 characters"))]
    pub name: String,
    #[validate(length(min = 7, max = 20, message = "Phone number is invalid"))]
    pub phone: Option<String>,
    pub role: Role,
    #[validate(length(min = 1, max = 256))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    #[validate(length(min = 3, max = 254))]
    pub email: String,
    #[validate(length(min = 1, max = 256))]
    pub password: String,
    #[validate(length(min = 6, max = 12))]
    pub two_factor_code: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct CodeRequest {
    #[validate(length(min = 6, max = 12, message = "Code must be 6 to 12 characters"))]
    pub code: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PasswordConfirmation {
    #[validate(length(min = 1, max = 256))]
    pub password: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordRequest {
    #[validate(length(min = 1, max = 256))]
    pub current_password: String,
    #[validate(length(min = 1, max = 256))]
    pub new_password: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BloodType {
    #[serde(rename = "A+")]
    APositive,
    #[serde(rename = "A-")]
    ANegative,
    #[serde(rename = "B+")]
    BPositive,
    #[serde(rename = "B-")]
    BNegative,
    #[serde(rename = "AB+")]
    AbPositive,
    #[serde(rename = "AB-")]
    AbNegative,
    #[serde(rename = "O+")]
    OPositive,
    #[serde(rename = "O-")]
    ONegative,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Routine,
    Urgent,
    Critical,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct NewBloodRequest {
    pub blood_type: BloodType,
    #[validate(range(min = 1, max = 10, message = "Between 1 and 10 units may be requested"))]
    pub units: u32,
    #[validate(length(min = 2, max = 120))]
    pub hospital: String,
    #[validate(length(min = 2, max = 80))]
    pub city: String,
    pub urgency: Urgency,
    #[validate(length(max = 1000))]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UploadRequest {
    #[validate(length(min = 1, max = 255))]
    pub filename: String,
    #[validate(length(min = 3, max = 100))]
    pub mime_type: String,
    pub size_bytes: u64,
}

#[derive(Debug, Deserialize, Validate)]
pub struct ErasureRequest {
    #[validate(length(min = 3, max = 500))]
    pub reason: String,
}

fn error(status: StatusCode, message: &str) -> SecureResponse {
    SecureResponse::json(status, json!({ "error": message }))
}

fn identity(ctx: &RequestContext) -> anyhow::Result<&Identity> {
    ctx.identity
        .as_ref()
        .context("authenticated route reached without an identity")
}

/// Segment following `anchor` in the request path (`/users/<id>/unlock`).
fn path_param<'a>(ctx: &'a RequestContext, anchor: &str) -> Option<&'a str> {
    let mut segments = ctx.request.path.split('/');
    segments.find(|segment| *segment == anchor)?;
    segments.next().filter(|segment| !segment.is_empty())
}

/// Step-up check for routes guarded with a second factor. The pipeline only
/// checks that the header is present; the code itself is verified here.
async fn second_factor_verified(state: &AppState, ctx: &RequestContext) -> anyhow::Result<bool> {
    let identity = identity(ctx)?;
    if !identity.two_factor_enabled {
        return Ok(true);
    }
    let code = ctx.request.header(TWO_FACTOR_HEADER).unwrap_or_default();
    Ok(state
        .security
        .two_factor
        .verify_login(&identity.user_id, code, &ctx.origin())
        .await?)
}

pub async fn health(_state: AppState, _ctx: RequestContext) -> HandlerResult {
    Ok(SecureResponse::ok(json!({
        "status": "healthy",
        "service": "bloodlink-web-backend",
        "version": env!("CARGO_PKG_VERSION"),
    })))
}

/// Issues a CSRF token bound to the session cookie, starting a session when
/// the caller has none.
pub async fn csrf_token(state: AppState, ctx: RequestContext) -> HandlerResult {
    let (session, fresh) = match &ctx.request.session_key {
        Some(session) => (session.clone(), false),
        None => (Uuid::new_v4().to_string(), true),
    };

    let csrf = state.security.pipeline.csrf().guard();
    let token = csrf.issue(&session).await?;
    let settings = &state.security.settings.csrf;
    let max_age = settings.token_ttl_secs as i64;

    let mut response = SecureResponse::ok(json!({
        "csrfToken": token.token,
        "expiresAt": token.expires_at,
    }));
    if fresh {
        let value = cookie(&state.http, &state.http.session_cookie, &session, true, max_age);
        response.headers.append(header::SET_COOKIE, HeaderValue::from_str(&value)?);
    }
    if settings.double_submit {
        let value = cookie(&state.http, &settings.cookie_name, &token.token, false, max_age);
        response.headers.append(header::SET_COOKIE, HeaderValue::from_str(&value)?);
    }
    Ok(response)
}

pub async fn register(state: AppState, ctx: RequestContext) -> HandlerResult {
    let body: RegisterRequest = ctx.json()?;
    if body.role == Role::Admin {
        return Ok(error(StatusCode::FORBIDDEN, "Forbidden"));
    }

    let outcome = state
        .register(&body.email, &body.name, body.phone, body.role, &body.password)
        .await?;
    Ok(match outcome {
        Ok(user) => SecureResponse::created(json!({
            "userId": user.user_id,
            "role": user.role,
        })),
        Err(Registration::EmailTaken) => error(StatusCode::CONFLICT, "Email is already registered"),
        Err(Registration::WeakPassword(errors)) => SecureResponse::json(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Password does not meet requirements", "details": errors }),
        ),
    })
}

pub async fn login(state: AppState, ctx: RequestContext) -> HandlerResult {
    let body: LoginRequest = ctx.json()?;
    let origin = ctx.origin();
    let accounts = &state.security.accounts;

    let user = match state.directory.find_by_email(&body.email).await {
        Some(user) if user.is_active => user,
        _ => {
            // Unknown emails still count toward failure alerts.
            let claimed = body.email.trim().to_ascii_lowercase();
            accounts.authenticate(&claimed, &body.password, &origin).await?;
            return Ok(error(StatusCode::UNAUTHORIZED, "Invalid email or password"));
        }
    };

    let password_expired = match accounts.authenticate(&user.user_id, &body.password, &origin).await? {
        LoginOutcome::Success { password_expired } => password_expired,
        LoginOutcome::InvalidCredentials => {
            return Ok(error(StatusCode::UNAUTHORIZED, "Invalid email or password"));
        }
        LoginOutcome::Locked { locked_until } => {
            return Ok(SecureResponse::json(
                StatusCode::LOCKED,
                json!({
                    "error": "Account temporarily locked",
                    "lockedUntil": locked_until,
                }),
            ));
        }
    };

    let two_factor = &state.security.two_factor;
    if two_factor.is_enabled(&user.user_id).await? {
        let Some(code) = body.two_factor_code.as_deref() else {
            return Ok(SecureResponse::json(
                StatusCode::UNAUTHORIZED,
                json!({ "error": "Two-factor code required", "twoFactorRequired": true }),
            ));
        };
        if !two_factor.verify_login(&user.user_id, code, &origin).await? {
            return Ok(error(StatusCode::UNAUTHORIZED, "Invalid two-factor code"));
        }
    }

    let issued = state.tokens.issue(&user)?;
    Ok(SecureResponse::ok(json!({
        "token": issued.token,
        "expiresAt": issued.expires_at,
        "passwordExpired": password_expired,
        "user": { "id": user.user_id, "role": user.role },
    })))
}

pub async fn two_factor_setup(state: AppState, ctx: RequestContext) -> HandlerResult {
    let identity = identity(&ctx)?;
    let user = state
        .directory
        .get(&identity.user_id)
        .await
        .context("identity missing from directory")?;

    match state.security.two_factor.setup(&user.user_id, &user.email).await {
        Ok(setup) => Ok(SecureResponse::ok(json!({
            "secret": setup.secret.expose_secret(),
            "qrCodeUrl": setup.qr_code_url,
            "backupCodes": setup.backup_codes,
        }))),
        Err(TwoFactorError::AlreadyEnabled) => Ok(error(
            StatusCode::CONFLICT,
            "Two-factor authentication is already enabled",
        )),
        Err(err) => Err(err.into()),
    }
}

pub async fn two_factor_enable(state: AppState, ctx: RequestContext) -> HandlerResult {
    let identity = identity(&ctx)?;
    let body: CodeRequest = ctx.json()?;

    match state
        .security
        .two_factor
        .verify_and_enable(&identity.user_id, &body.code)
        .await
    {
        Ok(true) => Ok(SecureResponse::ok(json!({ "enabled": true }))),
        Ok(false) => Ok(error(StatusCode::BAD_REQUEST, "Invalid verification code")),
        Err(TwoFactorError::AlreadyEnabled) => Ok(error(
            StatusCode::CONFLICT,
            "Two-factor authentication is already enabled",
        )),
        Err(TwoFactorError::NotSetUp) => Ok(error(
            StatusCode::CONFLICT,
            "Two-factor authentication has not been set up",
        )),
        Err(err) => Err(err.into()),
    }
}

pub async fn two_factor_verify(state: AppState, ctx: RequestContext) -> HandlerResult {
    let identity = identity(&ctx)?;
    let body: CodeRequest = ctx.json()?;

    match state
        .security
        .two_factor
        .verify_login(&identity.user_id, &body.code, &ctx.origin())
        .await
    {
        Ok(true) => Ok(SecureResponse::ok(json!({ "verified": true }))),
        Ok(false) => Ok(error(StatusCode::UNAUTHORIZED, "Invalid two-factor code")),
        Err(TwoFactorError::NotSetUp) => Ok(error(
            StatusCode::CONFLICT,
            "Two-factor authentication has not been set up",
        )),
        Err(err) => Err(err.into()),
    }
}

pub async fn two_factor_disable(state: AppState, ctx: RequestContext) -> HandlerResult {
    let identity = identity(&ctx)?;
    let body: PasswordConfirmation = ctx.json()?;

    if state
        .security
        .two_factor
        .disable(&identity.user_id, &body.password)
        .await?
    {
        Ok(SecureResponse::ok(json!({ "enabled": false })))
    } else {
        Ok(error(StatusCode::UNAUTHORIZED, "Password is incorrect"))
    }
}

pub async fn change_password(state: AppState, ctx: RequestContext) -> HandlerResult {
    let identity = identity(&ctx)?;
    let body: ChangePasswordRequest = ctx.json()?;
    let user_info = state
        .directory
        .get(&identity.user_id)
        .await
        .map(|user| user.user_info());

    let change = state
        .security
        .accounts
        .change_password(
            &identity.user_id,
            &body.current_password,
            &body.new_password,
            user_info.as_ref(),
        )
        .await?;

    if change.success {
        Ok(SecureResponse::ok(json!({ "success": true })))
    } else {
        Ok(SecureResponse::json(
            StatusCode::BAD_REQUEST,
            json!({ "error": "Password change rejected", "details": change.errors }),
        ))
    }
}

pub async fn create_blood_request(state: AppState, ctx: RequestContext) -> HandlerResult {
    let identity = identity(&ctx)?;
    let body: NewBloodRequest = ctx.json()?;

    let record = BloodRequestRecord {
        id: Uuid::new_v4(),
        requested_by: identity.user_id.clone(),
        request: ctx.payload.clone().unwrap_or_default(),
        created_at: state.security.clock.now(),
    };
    state.requests.write().await.push(record.clone());

    info!(
        request_id = %record.id,
        blood_type = ?body.blood_type,
        urgency = ?body.urgency,
        flagged = !ctx.threats.is_empty(),
        "Blood request created"
    );
    Ok(SecureResponse::created(json!({
        "request": record,
        "flaggedFields": ctx.threats.keys().collect::<Vec<_>>(),
    })))
}

pub async fn list_blood_requests(state: AppState, _ctx: RequestContext) -> HandlerResult {
    let requests = state.requests.read().await;
    Ok(SecureResponse::ok(json!({ "requests": &*requests })))
}

pub async fn validate_upload(state: AppState, ctx: RequestContext) -> HandlerResult {
    let body: UploadRequest = ctx.json()?;
    let validation = state.uploads.validate(&UploadDescriptor {
        filename: body.filename,
        mime_type: body.mime_type,
        size_bytes: body.size_bytes,
    });

    let status = if validation.valid {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    Ok(SecureResponse::json(status, serde_json::to_value(validation)?))
}

pub async fn list_alerts(state: AppState, ctx: RequestContext) -> HandlerResult {
    let include_resolved = ctx.request.path.ends_with("/history");
    let alerts = state
        .security
        .alerts
        .list(include_resolved)
        .await?;
    Ok(SecureResponse::ok(json!({ "alerts": alerts })))
}

pub async fn resolve_alert(state: AppState, ctx: RequestContext) -> HandlerResult {
    if !second_factor_verified(&state, &ctx).await? {
        return Ok(error(StatusCode::FORBIDDEN, "Forbidden"));
    }
    let admin = identity(&ctx)?;
    let Some(alert_id) = path_param(&ctx, "alerts").and_then(|id| Uuid::parse_str(id).ok()) else {
        return Ok(error(StatusCode::NOT_FOUND, "Alert not found"));
    };

    match state.security.alerts.resolve(alert_id, &admin.user_id).await {
        Ok(alert) => Ok(SecureResponse::ok(json!({ "alert": alert }))),
        Err(AlertError::NotFound(_)) => Ok(error(StatusCode::NOT_FOUND, "Alert not found")),
        Err(AlertError::AlreadyResolved(_)) => {
            Ok(error(StatusCode::CONFLICT, "Alert is already resolved"))
        }
        Err(err) => Err(err.into()),
    }
}

pub async fn security_summary(state: AppState, _ctx: RequestContext) -> HandlerResult {
    let since = state.security.clock.now() - Duration::hours(24);
    let logger = &state.security.logger;
    let summary = logger.summary(since).await?;
    let recent = logger.recent_events(since, 50).await?;
    Ok(SecureResponse::ok(json!({
        "summary": summary,
        "recentEvents": recent,
    })))
}

pub async fn lock_status(state: AppState, ctx: RequestContext) -> HandlerResult {
    let Some(user_id) = path_param(&ctx, "users") else {
        return Ok(error(StatusCode::NOT_FOUND, "User not found"));
    };
    match state.security.accounts.lock_status(user_id).await {
        Ok(status) => Ok(SecureResponse::ok(serde_json::to_value(status)?)),
        Err(PasswordError::UnknownUser(_)) => Ok(error(StatusCode::NOT_FOUND, "User not found")),
        Err(err) => Err(err.into()),
    }
}

pub async fn unlock_account(state: AppState, ctx: RequestContext) -> HandlerResult {
    if !second_factor_verified(&state, &ctx).await? {
        return Ok(error(StatusCode::FORBIDDEN, "Forbidden"));
    }
    let admin = identity(&ctx)?;
    let Some(user_id) = path_param(&ctx, "users") else {
        return Ok(error(StatusCode::NOT_FOUND, "User not found"));
    };

    match state.security.accounts.admin_unlock(user_id, &admin.user_id).await {
        Ok(()) => Ok(SecureResponse::ok(json!({ "unlocked": true }))),
        Err(PasswordError::UnknownUser(_)) => Ok(error(StatusCode::NOT_FOUND, "User not found")),
        Err(err) => Err(err.into()),
    }
}

/// Removes a user's account, credentials and requests, leaving an audit record.
pub async fn erase_user(state: AppState, ctx: RequestContext) -> HandlerResult {
    if !second_factor_verified(&state, &ctx).await? {
        return Ok(error(StatusCode::FORBIDDEN, "Forbidden"));
    }
    let admin = identity(&ctx)?;
    let body: ErasureRequest = ctx.json()?;
    let Some(user_id) = path_param(&ctx, "users") else {
        return Ok(error(StatusCode::NOT_FOUND, "User not found"));
    };
    if state.directory.remove(user_id).await.is_none() {
        return Ok(error(StatusCode::NOT_FOUND, "User not found"));
    }
    state.security.accounts.erase(user_id).await?;
    state
        .requests
        .write()
        .await
        .retain(|request| request.requested_by != user_id);

    let record = state
        .security
        .logger
        .record_data_deletion(
            user_id,
            &admin.user_id,
            &body.reason,
            vec![
                "user_account".to_string(),
                "security_profile".to_string(),
                "login_attempts".to_string(),
                "blood_requests".to_string(),
            ],
        )
        .await?;
    Ok(SecureResponse::ok(json!({ "deletionId": record.id })))
}
