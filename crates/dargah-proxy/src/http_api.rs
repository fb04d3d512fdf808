//! Admin HTTP surface: login, user management, audit browsing.
//!
//! Everything except `/users/login`, `/healthz` and `/metrics` requires a
//! bearer token; user mutations additionally require the admin role. The
//! proxy data path never depends on this module.

use crate::auth::{self, AuthenticatedUser};
use crate::metrics;
use crate::server::Proxy;
use axum::extract::{Json, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post, put};
use axum::Router;
use dargah_common::{DargahError, Role};
use dargah_store::users::UserStore;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

/// Token lifetime handed out by login.
const TOKEN_TTL_HOURS: i64 = 24;

#[derive(Clone)]
pub struct ApiState {
    pub proxy: Arc<Proxy>,
}

pub fn router(proxy: Arc<Proxy>) -> Router {
    let state = ApiState { proxy };
    Router::new()
        .route("/users/login", post(login))
        .route("/users/signup", post(signup))
        .route("/users", get(list_users))
        .route("/users/:id", put(update_user).delete(delete_user))
        .route("/requests", get(list_requests))
        .route("/requests/:id/sqls", get(list_request_sqls))
        .route("/sqls", get(list_sqls))
        .route("/health-checks", get(list_health_checks))
        .route("/logs", get(list_logs))
        .route("/healthz", get(healthz))
        .route("/metrics", get(prometheus_metrics))
        .with_state(state)
}

/// Serve the admin API on an already-bound listener.
pub async fn serve(proxy: Arc<Proxy>, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
    info!(addr = %listener.local_addr()?, "admin API listening");
    axum::serve(listener, router(proxy)).await?;
    Ok(())
}

// ── errors ──────────────────────────────────────────────────────────────

pub struct ApiError(DargahError);

impl From<DargahError> for ApiError {
    fn from(err: DargahError) -> Self {
        Self(err)
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        Self(DargahError::DatabaseError(err.to_string()))
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self.0 {
            DargahError::AuthenticationFailed(_)
            | DargahError::InvalidToken(_)
            | DargahError::TokenExpired => StatusCode::UNAUTHORIZED,
            DargahError::AuthorizationDenied(_) => StatusCode::FORBIDDEN,
            DargahError::NotFound(_) => StatusCode::NOT_FOUND,
            DargahError::AlreadyExists(_) => StatusCode::CONFLICT,
            DargahError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.0.to_string(),
            code: self.0.code(),
        };
        (status, Json(body)).into_response()
    }
}

// ── auth helpers ────────────────────────────────────────────────────────

async fn bearer_identity(
    state: &ApiState,
    headers: &HeaderMap,
) -> Result<AuthenticatedUser, ApiError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| DargahError::AuthenticationFailed("missing Authorization header".into()))?;
    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| DargahError::AuthenticationFailed("expected a bearer token".into()))?;

    auth::validate(
        token,
        &state.proxy.config().jwt_secret,
        &state.proxy.store().users(),
    )
    .await
    .map_err(|err| DargahError::AuthenticationFailed(err.to_string()).into())
}

fn require_admin(user: &AuthenticatedUser) -> Result<(), ApiError> {
    if user.role != Role::Admin {
        return Err(DargahError::AuthorizationDenied("admin role required".into()).into());
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct PageQuery {
    #[serde(default = "default_page")]
    page: i64,
    #[serde(default = "default_page_size")]
    page_size: i64,
}

fn default_page() -> i64 {
    1
}

fn default_page_size() -> i64 {
    50
}

// ── users ───────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

#[derive(Debug, Serialize)]
struct LoginResponse {
    token: String,
    role: String,
}

async fn login(
    State(state): State<ApiState>,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let users = state.proxy.store().users();
    let user = users
        .get_by_username(&request.username)
        .await?
        .filter(|user| UserStore::verify_password(user, &request.password))
        .ok_or_else(|| DargahError::AuthenticationFailed("invalid credentials".into()))?;

    let role = Role::from_str(&user.role)
        .map_err(|_| DargahError::Internal(format!("user {} has invalid role", user.username)))?;
    let token = auth::issue(
        &user.username,
        role,
        &state.proxy.config().jwt_secret,
        TOKEN_TTL_HOURS,
    )
    .map_err(|err| DargahError::Internal(err.to_string()))?;

    info!(username = %user.username, "login succeeded");

    Ok(Json(LoginResponse {
        token,
        role: user.role,
    }))
}

#[derive(Debug, Deserialize)]
struct SignupRequest {
    username: String,
    password: String,
    role: String,
}

async fn signup(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Json(request): Json<SignupRequest>,
) -> Result<(StatusCode, Json<dargah_store::User>), ApiError> {
    let caller = bearer_identity(&state, &headers).await?;
    require_admin(&caller)?;

    if request.username.is_empty() || request.password.is_empty() {
        return Err(DargahError::InvalidArgument("username and password are required".into()).into());
    }
    let role = Role::from_str(&request.role)
        .map_err(|_| DargahError::InvalidArgument(format!("unknown role: {}", request.role)))?;

    let users = state.proxy.store().users();
    if users.get_by_username(&request.username).await?.is_some() {
        return Err(DargahError::AlreadyExists(request.username).into());
    }

    let user = users
        .create(&request.username, &request.password, role)
        .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[derive(Debug, Deserialize)]
struct UpdateUserRequest {
    password: Option<String>,
    role: Option<String>,
}

async fn update_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(request): Json<UpdateUserRequest>,
) -> Result<StatusCode, ApiError> {
    let caller = bearer_identity(&state, &headers).await?;
    require_admin(&caller)?;

    if request.password.is_none() && request.role.is_none() {
        return Err(
            DargahError::InvalidArgument("one of password or role must be provided".into()).into(),
        );
    }
    let role = match &request.role {
        Some(role) => Some(
            Role::from_str(role)
                .map_err(|_| DargahError::InvalidArgument(format!("unknown role: {role}")))?,
        ),
        None => None,
    };

    let users = state.proxy.store().users();
    let changed = users.update(&id, request.password.as_deref(), role).await?;
    if !changed {
        return Err(DargahError::NotFound(format!("user {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn delete_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let caller = bearer_identity(&state, &headers).await?;
    require_admin(&caller)?;

    let users = state.proxy.store().users();
    if !users.delete(&id).await? {
        return Err(DargahError::NotFound(format!("user {id}")).into());
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn list_users(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let caller = bearer_identity(&state, &headers).await?;
    require_admin(&caller)?;

    let users = state.proxy.store().users();
    Ok(Json(users.list(page.page, page.page_size).await?))
}

// ── audit browsing ──────────────────────────────────────────────────────

async fn list_requests(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    bearer_identity(&state, &headers).await?;
    let requests = state.proxy.store().requests();
    Ok(Json(requests.list(page.page, page.page_size).await?))
}

async fn list_request_sqls(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    bearer_identity(&state, &headers).await?;
    let sqls = state.proxy.store().sqls();
    Ok(Json(sqls.list_by_request(&id).await?))
}

async fn list_sqls(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    bearer_identity(&state, &headers).await?;
    let sqls = state.proxy.store().sqls();
    Ok(Json(sqls.list(page.page, page.page_size).await?))
}

async fn list_health_checks(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    bearer_identity(&state, &headers).await?;
    let checks = state.proxy.store().health_checks();
    Ok(Json(checks.list(page.page, page.page_size).await?))
}

async fn list_logs(
    State(state): State<ApiState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Result<impl IntoResponse, ApiError> {
    bearer_identity(&state, &headers).await?;
    let logs = state.proxy.store().logs();
    Ok(Json(logs.list(page.page, page.page_size).await?))
}

// ── operational ─────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    healthy: Vec<crate::server::UpstreamStatus>,
    unhealthy: Vec<crate::server::UpstreamStatus>,
}

async fn healthz(State(state): State<ApiState>) -> Json<HealthzResponse> {
    let (healthy, unhealthy) = state.proxy.membership();
    let status = if healthy.is_empty() { "degraded" } else { "ok" };
    Json(HealthzResponse {
        status,
        healthy,
        unhealthy,
    })
}

async fn prometheus_metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        metrics::encode_metrics(),
    )
}
