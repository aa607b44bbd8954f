pub mod config;
pub mod db;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod utils;

use service_core::axum::{
    extract::{Request, State},
    http::{header, HeaderName, HeaderValue, Method},
    middleware::{from_fn, from_fn_with_state, Next},
    routing::{get, post},
    Json, Router,
};
use service_core::middleware::{
    rate_limit::{create_ip_rate_limiter, ip_rate_limit_middleware, IpRateLimiter},
    security_headers::security_headers_middleware,
    tracing::request_id_middleware,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use utoipa::{
    openapi::security::{ApiKey, ApiKeyValue, HttpAuthScheme, HttpBuilder, SecurityScheme},
    Modify, OpenApi,
};

use crate::config::PortalConfig;
use crate::middleware::{
    admin_auth_middleware, auth_middleware, metrics_middleware, require_permission,
    ADMIN_API_KEY_HEADER,
};
use crate::models::Permission;
use crate::services::{
    AccountService, ApprovalCoordinator, AuthorizationEngine, CredentialStore, EmailProvider,
    JwtService, PermissionMatrix, ReviewPolicy, ServiceError, SessionCache, SessionIssuer,
    VerificationCoordinator,
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health_check,
        handlers::metrics::metrics,
        handlers::auth::registration::register,
        handlers::auth::registration::verify_email,
        handlers::auth::registration::resend_verification,
        handlers::auth::session::login,
        handlers::auth::session::refresh,
        handlers::auth::session::logout,
        handlers::me::get_me,
        handlers::me::change_password,
        handlers::admin::reviews::approve_account,
        handlers::admin::reviews::reject_account,
        handlers::admin::reviews::revoke_approval,
        handlers::admin::reviews::pending_accounts,
        handlers::admin::reviews::decision_history,
        handlers::admin::access::revoke_sessions,
        handlers::admin::access::get_permission_overrides,
        handlers::admin::access::put_permission_overrides,
        handlers::admin::access::get_role_permissions,
        handlers::admin::access::set_role_permissions,
        handlers::admin::bootstrap::bootstrap_admin,
    ),
    components(
        schemas(
            dtos::ErrorResponse,
            dtos::FieldError,
            dtos::MessageResponse,
            dtos::auth::RegisterRequest,
            dtos::auth::RegisterResponse,
            dtos::auth::VerifyEmailResponse,
            dtos::auth::ResendVerificationRequest,
            dtos::auth::LoginRequest,
            dtos::auth::RefreshRequest,
            dtos::auth::LogoutRequest,
            dtos::auth::ChangePasswordRequest,
            dtos::auth::MeResponse,
            dtos::admin::DecisionRequest,
            dtos::admin::DecisionResponse,
            dtos::admin::PendingAccountsResponse,
            dtos::admin::DecisionHistoryResponse,
            dtos::admin::RevokeSessionsResponse,
            dtos::admin::PermissionOverridesRequest,
            dtos::admin::PermissionOverridesResponse,
            dtos::admin::RolePermissionsResponse,
            dtos::admin::SetRolePermissionsRequest,
            dtos::admin::BootstrapAdminRequest,
            dtos::admin::BootstrapAdminResponse,
            services::TokenResponse,
            models::Role,
            models::ApprovalState,
            models::SanitizedAccount,
            models::Decision,
            models::ApprovalDecision,
            models::OverrideEffect,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Registration", description = "Self-service registration and email verification"),
        (name = "Session", description = "Login, token refresh and logout"),
        (name = "Account", description = "The authenticated account"),
        (name = "Admin", description = "Account review, sessions and permissions"),
        (name = "Observability", description = "Service health and monitoring"),
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer_auth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
            components.add_security_scheme(
                "admin_api_key",
                SecurityScheme::ApiKey(ApiKey::Header(ApiKeyValue::new(ADMIN_API_KEY_HEADER))),
            );
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<PortalConfig>,
    pub store: Arc<dyn CredentialStore>,
    pub cache: Arc<dyn SessionCache>,
    pub accounts: Arc<AccountService>,
    pub verification: Arc<VerificationCoordinator>,
    pub approvals: Arc<ApprovalCoordinator>,
    pub authz: Arc<AuthorizationEngine>,
    pub sessions: Arc<SessionIssuer>,
    pub login_rate_limiter: IpRateLimiter,
    pub register_rate_limiter: IpRateLimiter,
    pub resend_rate_limiter: IpRateLimiter,
    pub ip_rate_limiter: IpRateLimiter,
}

impl AppState {
    /// Wires the provisioning core over the given infrastructure. Loads (or seeds) the
    /// permission matrix from the store.
    pub async fn new(
        config: PortalConfig,
        store: Arc<dyn CredentialStore>,
        cache: Arc<dyn SessionCache>,
        email: Arc<dyn EmailProvider>,
        jwt: JwtService,
    ) -> Result<Self, ServiceError> {
        let policy = Arc::new(ReviewPolicy::with_review_exempt(
            &config.provisioning.review_exempt_roles,
        ));
        let matrix = Arc::new(PermissionMatrix::load(store.clone()).await?);
        tracing::info!(
            review_exempt = ?policy.review_exempt_roles(),
            matrix_version = matrix.snapshot().version(),
            "Provisioning policy loaded"
        );
        let authz = Arc::new(AuthorizationEngine::new(matrix, store.clone()));
        let sessions = Arc::new(SessionIssuer::new(
            store.clone(),
            Arc::new(jwt),
            cache.clone(),
        ));
        let verification = Arc::new(VerificationCoordinator::new(
            store.clone(),
            email.clone(),
            policy.clone(),
            chrono::Duration::hours(config.provisioning.verification_token_ttl_hours),
            config.provisioning.public_base_url.clone(),
        ));
        let approvals = Arc::new(ApprovalCoordinator::new(store.clone(), email));
        let accounts = Arc::new(AccountService::new(
            store.clone(),
            policy,
            verification.clone(),
            sessions.clone(),
            cache.clone(),
            config.provisioning.resend_cooldown_seconds,
        ));

        let limits = &config.rate_limit;
        let login_rate_limiter =
            create_ip_rate_limiter(limits.login_attempts, limits.login_window_seconds);
        let register_rate_limiter =
            create_ip_rate_limiter(limits.register_attempts, limits.register_window_seconds);
        let resend_rate_limiter =
            create_ip_rate_limiter(limits.resend_attempts, limits.resend_window_seconds);
        let ip_rate_limiter =
            create_ip_rate_limiter(limits.global_ip_limit, limits.global_ip_window_seconds);

        Ok(Self {
            config: Arc::new(config),
            store,
            cache,
            accounts,
            verification,
            approvals,
            authz,
            sessions,
            login_rate_limiter,
            register_rate_limiter,
            resend_rate_limiter,
            ip_rate_limiter,
        })
    }
}

/// Routes guarded by `permission`. The caller is authenticated first.
fn guarded(state: &AppState, permission: Permission, routes: Router<AppState>) -> Router<AppState> {
    routes
        .route_layer(from_fn_with_state(
            state.clone(),
            move |s: State<AppState>, req: Request, next: Next| {
                require_permission(s, permission.clone(), req, next)
            },
        ))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware))
}

fn rate_limited(limiter: &IpRateLimiter, routes: Router<AppState>) -> Router<AppState> {
    routes.layer(from_fn_with_state(limiter.clone(), ip_rate_limit_middleware))
}

pub fn build_router(state: AppState) -> Router {
    let registration = Router::new()
        .merge(rate_limited(
            &state.register_rate_limiter,
            Router::new().route("/register", post(handlers::auth::register)),
        ))
        .merge(rate_limited(
            &state.resend_rate_limiter,
            Router::new().route(
                "/resend-verification",
                post(handlers::auth::resend_verification),
            ),
        ))
        .route("/verify-email", get(handlers::auth::verify_email));

    let session = Router::new()
        .merge(rate_limited(
            &state.login_rate_limiter,
            Router::new().route("/login", post(handlers::auth::login)),
        ))
        .route("/refresh", post(handlers::auth::refresh));

    let authenticated = Router::new()
        .route("/logout", post(handlers::auth::logout))
        .route("/me", get(handlers::me::get_me))
        .route("/me/password", post(handlers::me::change_password))
        .route_layer(from_fn_with_state(state.clone(), auth_middleware));

    let reviews = guarded(
        &state,
        Permission::APPROVE_ACCOUNTS,
        Router::new()
            .route("/admin/approve/:account_id", post(handlers::admin::approve_account))
            .route("/admin/reject/:account_id", post(handlers::admin::reject_account))
            .route(
                "/admin/revoke-approval/:account_id",
                post(handlers::admin::revoke_approval),
            )
            .route("/admin/accounts/pending", get(handlers::admin::pending_accounts))
            .route(
                "/admin/accounts/:account_id/decisions",
                get(handlers::admin::decision_history),
            ),
    );

    let session_admin = guarded(
        &state,
        Permission::REVOKE_SESSIONS,
        Router::new().route(
            "/admin/accounts/:account_id/revoke-sessions",
            post(handlers::admin::revoke_sessions),
        ),
    );

    let permission_admin = guarded(
        &state,
        Permission::MANAGE_PERMISSIONS,
        Router::new()
            .route(
                "/admin/accounts/:account_id/permission-overrides",
                get(handlers::admin::get_permission_overrides)
                    .put(handlers::admin::put_permission_overrides),
            )
            .route(
                "/admin/role-permissions",
                get(handlers::admin::get_role_permissions)
                    .post(handlers::admin::set_role_permissions),
            ),
    );

    let bootstrap = Router::new()
        .route("/admin/bootstrap", post(handlers::admin::bootstrap_admin))
        .route_layer(from_fn_with_state(state.clone(), admin_auth_middleware));

    let cors = CorsLayer::new()
        .allow_origin(
            state
                .config
                .security
                .allowed_origins
                .iter()
                .filter_map(|origin| match origin.parse::<HeaderValue>() {
                    Ok(value) => Some(value),
                    Err(e) => {
                        tracing::error!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                        None
                    }
                })
                .collect::<Vec<HeaderValue>>(),
        )
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static(ADMIN_API_KEY_HEADER),
        ]);

    let ip_limiter = state.ip_rate_limiter.clone();

    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(handlers::metrics::metrics))
        .route(
            "/.well-known/openapi.json",
            get(|| async { Json(ApiDoc::openapi()) }),
        )
        .merge(registration)
        .merge(session)
        .merge(authenticated)
        .merge(reviews)
        .merge(session_admin)
        .merge(permission_admin)
        .merge(bootstrap)
        .with_state(state)
        .layer(from_fn_with_state(ip_limiter, ip_rate_limit_middleware))
        .layer(from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            },
        ))
        .layer(from_fn(request_id_middleware))
        .layer(from_fn(security_headers_middleware))
        .layer(cors)
}

/// Liveness plus reachability of the credential store and session cache
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service is healthy"),
        (status = 503, description = "A dependency is unreachable", body = crate::dtos::ErrorResponse)
    ),
    tag = "Observability"
)]
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ServiceError> {
    state.store.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Credential store health check failed");
        ServiceError::Unavailable(anyhow::anyhow!("credential store unreachable"))
    })?;
    state.cache.health_check().await.map_err(|e| {
        tracing::error!(error = %e, "Session cache health check failed");
        ServiceError::Unavailable(anyhow::anyhow!("session cache unreachable"))
    })?;

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.config.service_name,
        "version": state.config.service_version,
        "matrix_version": state.authz.matrix().snapshot().version(),
    })))
}
