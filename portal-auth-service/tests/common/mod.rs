//! Shared setup for the HTTP-level tests: an in-memory store, mock cache and mailbox,
//! and the fixture RSA keys.

#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Method, Request, StatusCode},
    Router,
};
use portal_auth_service::{
    build_router,
    config::{
        DatabaseConfig, Environment, JwtConfig, PortalConfig, ProvisioningConfig,
        RateLimitConfig, SecurityConfig, StoreBackend, StoreRetryConfig,
    },
    models::Role,
    services::{InMemoryCredentialStore, JwtService, MockEmailService, MockSessionCache},
    AppState,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::util::ServiceExt;

const PRIVATE_KEY: &str = include_str!("../fixtures/jwt_private.pem");
const PUBLIC_KEY: &str = include_str!("../fixtures/jwt_public.pem");

pub const TEST_ADMIN_API_KEY: &str = "test-admin-key-0123456789abcdef";
pub const PASSWORD: &str = "CorrectHorse42!";
pub const ADMIN_LOGIN: &str = "root.admin";
pub const ADMIN_PASSWORD: &str = "RootAdminPassword1!";

pub fn test_config() -> PortalConfig {
    PortalConfig {
        common: service_core::config::Config::default(),
        environment: Environment::Dev,
        service_name: "portal-auth-service".to_string(),
        service_version: "test".to_string(),
        log_level: "error".to_string(),
        otlp_endpoint: None,
        store_backend: StoreBackend::Memory,
        database: DatabaseConfig {
            url: String::new(),
            max_connections: 1,
            min_connections: 1,
        },
        redis: None,
        jwt: JwtConfig {
            private_key_path: String::new(),
            public_key_path: String::new(),
            access_token_expiry_minutes: 15,
            refresh_token_expiry_days: 7,
        },
        gmail: None,
        security: SecurityConfig {
            allowed_origins: vec!["http://localhost:3000".to_string()],
            admin_api_key: TEST_ADMIN_API_KEY.to_string(),
        },
        provisioning: ProvisioningConfig {
            verification_token_ttl_hours: 24,
            resend_cooldown_seconds: 0,
            review_exempt_roles: vec![Role::Patient],
            public_base_url: "http://portal.test".to_string(),
            matrix_refresh_seconds: 0,
        },
        rate_limit: RateLimitConfig {
            login_attempts: 100,
            login_window_seconds: 60,
            register_attempts: 100,
            register_window_seconds: 60,
            resend_attempts: 100,
            resend_window_seconds: 60,
            global_ip_limit: 1000,
            global_ip_window_seconds: 60,
        },
        store_retry: StoreRetryConfig {
            max_retries: 0,
            initial_backoff_ms: 1,
        },
    }
}

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub store: Arc<InMemoryCredentialStore>,
    pub cache: Arc<MockSessionCache>,
    pub email: Arc<MockEmailService>,
}

pub struct TestResponse {
    pub status: StatusCode,
    pub body: Value,
}

impl TestResponse {
    pub fn code(&self) -> &str {
        self.body["code"].as_str().unwrap_or_default()
    }
}

impl TestApp {
    pub async fn spawn() -> Self {
        Self::spawn_with(test_config()).await
    }

    pub async fn spawn_with(config: PortalConfig) -> Self {
        let store = Arc::new(InMemoryCredentialStore::new());
        let cache = Arc::new(MockSessionCache::new());
        let email = Arc::new(MockEmailService::new());
        let jwt = JwtService::from_pem(
            PRIVATE_KEY,
            PUBLIC_KEY,
            config.jwt.access_token_expiry_minutes,
            config.jwt.refresh_token_expiry_days,
        )
        .expect("fixture keys load");

        let state = AppState::new(config, store.clone(), cache.clone(), email.clone(), jwt)
            .await
            .expect("state builds");

        Self {
            router: build_router(state.clone()),
            state,
            store,
            cache,
            email,
        }
    }

    pub async fn send(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
    ) -> TestResponse {
        self.send_with_headers(method, uri, body, bearer, &[]).await
    }

    pub async fn send_with_headers(
        &self,
        method: Method,
        uri: &str,
        body: Option<Value>,
        bearer: Option<&str>,
        headers: &[(&str, &str)],
    ) -> TestResponse {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = bearer {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string())),
            None => builder.body(Body::empty()),
        }
        .expect("request builds");

        let response = self
            .router
            .clone()
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body reads");
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        };
        TestResponse { status, body }
    }

    pub async fn register(&self, login: &str, role: Role) -> TestResponse {
        self.send(
            Method::POST,
            "/register",
            Some(json!({
                "login": login,
                "email": format!("{}@example.org", login),
                "password": PASSWORD,
                "role": role,
                "profile": profile_for(role),
            })),
            None,
        )
        .await
    }

    /// Consumes the latest link mailed to `login`'s address.
    pub async fn verify(&self, login: &str) -> TestResponse {
        let token = self
            .email
            .last_verification_token(&format!("{}@example.org", login))
            .expect("a verification email was sent");
        self.send(
            Method::GET,
            &format!("/verify-email?token={}", token),
            None,
            None,
        )
        .await
    }

    pub async fn login(&self, login: &str, password: &str) -> TestResponse {
        self.send(
            Method::POST,
            "/login",
            Some(json!({ "login": login, "password": password })),
            None,
        )
        .await
    }

    /// Bootstraps the administrator and returns an access token for it.
    pub async fn admin_token(&self) -> String {
        let res = self
            .send_with_headers(
                Method::POST,
                "/admin/bootstrap",
                Some(json!({
                    "login": ADMIN_LOGIN,
                    "email": "it-admin@example.org",
                    "password": ADMIN_PASSWORD,
                    "full_name": "Root Admin",
                })),
                None,
                &[("x-admin-api-key", TEST_ADMIN_API_KEY)],
            )
            .await;
        assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);

        let res = self.login(ADMIN_LOGIN, ADMIN_PASSWORD).await;
        assert_eq!(res.status, StatusCode::OK, "{}", res.body);
        access_token(&res)
    }

    /// Registers, verifies, and (for reviewed roles) approves an account, then logs in.
    pub async fn provisioned(&self, login: &str, role: Role, admin_token: &str) -> TestResponse {
        let res = self.register(login, role).await;
        assert_eq!(res.status, StatusCode::CREATED, "{}", res.body);
        let account_id = res.body["account_id"].as_str().unwrap_or_default().to_string();

        let res = self.verify(login).await;
        assert_eq!(res.status, StatusCode::OK, "{}", res.body);
        if res.body["approval_state"] == "pending_admin_approval" {
            let res = self
                .send(
                    Method::POST,
                    &format!("/admin/approve/{}", account_id),
                    None,
                    Some(admin_token),
                )
                .await;
            assert_eq!(res.status, StatusCode::OK, "{}", res.body);
        }

        let res = self.login(login, PASSWORD).await;
        assert_eq!(res.status, StatusCode::OK, "{}", res.body);
        res
    }
}

pub fn access_token(res: &TestResponse) -> String {
    res.body["access_token"]
        .as_str()
        .expect("access_token in body")
        .to_string()
}

pub fn refresh_token(res: &TestResponse) -> String {
    res.body["refresh_token"]
        .as_str()
        .expect("refresh_token in body")
        .to_string()
}

pub fn profile_for(role: Role) -> Value {
    match role {
        Role::Patient => json!({ "full_name": "Pat Ient", "date_of_birth": "1990-04-01" }),
        Role::Doctor => json!({
            "full_name": "Gregory House",
            "license_number": "MD-1234",
            "specialization": "diagnostics",
        }),
        Role::Nurse | Role::Pharmacist => {
            json!({ "full_name": "Carla Espinosa", "license_number": "RN-42" })
        }
        Role::LabTechnician => json!({ "full_name": "Lab Tech", "certification_number": "LT-7" }),
        Role::Staff => json!({ "full_name": "Front Desk", "department": "admissions" }),
        Role::ExternalRequester => json!({
            "organization_name": "Acme Insurance",
            "contact_name": "Claims Desk",
            "purpose": "claim review",
        }),
        Role::Admin => json!({ "full_name": "Not Allowed" }),
    }
}
