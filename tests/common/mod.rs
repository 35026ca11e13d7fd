#![allow(clippy::unwrap_used, clippy::expect_used)]
//! Common test utilities for integration tests.
//!
//! Drives the real router through `tower::ServiceExt::oneshot` with the
//! in-memory gateway behind it, so tests exercise actual endpoint
//! behavior without a database.

#![allow(dead_code)]

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, Response, header};
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use chrono::Utc;
use serde_json::Value;
use tower::ServiceExt;

use signet::crypto::{JwsAlgorithm, jwt};
use signet::models::{Account, OAuthClient};
use signet::storage::MemoryGateway;
use signet::{AppState, Config};

/// Issuer used across the test suite.
pub const ISSUER: &str = "http://localhost:3000";

/// Standard confidential test client.
pub const CLIENT_ID: &str = "client-123";
pub const CLIENT_SECRET: &str = "secret";
pub const REDIRECT_URI: &str = "https://example.com/callback";

/// Standard test user.
pub const USER_ID: &str = "user-456";
pub const USER_EMAIL: &str = "ada@example.com";
pub const USER_PASSWORD: &str = "password123";

/// Test application wrapper over the real routes and state.
pub struct TestApp {
    router: Router,
    pub state: AppState,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: Config) -> Self {
        let state = AppState::with_gateway(config, Arc::new(MemoryGateway::new()))
            .expect("state initialization failed");
        let router = signet::routes::app(state.clone());
        Self { router, state }
    }

    /// Send one request through the full middleware stack.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, path: &str) -> Response<Body> {
        self.request(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
    }

    pub async fn get_bearer(&self, path: &str, token: &str) -> Response<Body> {
        self.request(
            Request::builder()
                .uri(path)
                .header(header::AUTHORIZATION, format!("Bearer {token}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    /// POST a form body, optionally with HTTP Basic client credentials.
    pub async fn post_form(
        &self,
        path: &str,
        body: &str,
        basic: Option<(&str, &str)>,
    ) -> Response<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
        if let Some((id, secret)) = basic {
            let encoded = STANDARD.encode(format!("{id}:{secret}"));
            builder = builder.header(header::AUTHORIZATION, format!("Basic {encoded}"));
        }
        self.request(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    /// Seed the standard confidential client.
    pub async fn seed_client(&self) -> OAuthClient {
        let client = test_client(CLIENT_ID, "client_secret_basic", Some(CLIENT_SECRET));
        self.state.clients().put(&client).await.unwrap();
        client
    }

    /// Seed a public (PKCE-only) client.
    pub async fn seed_public_client(&self, id: &str) -> OAuthClient {
        let client = test_client(id, "none", None);
        self.state.clients().put(&client).await.unwrap();
        client
    }

    /// Seed the standard active user with email and phone contacts.
    pub async fn seed_user(&self) -> Account {
        let now = Utc::now();
        let account = Account {
            id: USER_ID.to_string(),
            password_hash: Some(hash(USER_PASSWORD)),
            is_active: true,
            name: Some("Ada Lovelace".to_string()),
            given_name: Some("Ada".to_string()),
            family_name: Some("Lovelace".to_string()),
            picture: Some("https://example.com/ada.png".to_string()),
            created_at: now,
            updated_at: now,
        };
        self.state.accounts().put(&account).await.unwrap();
        self.state
            .accounts()
            .add_contact(USER_ID, "email", USER_EMAIL, true, Some(now))
            .await
            .unwrap();
        self.state
            .accounts()
            .add_contact(USER_ID, "phone", "+15555550100", false, None)
            .await
            .unwrap();
        account
    }

    /// Mint an access token the way the token endpoint does.
    pub fn mint_access_token(&self, sub: &str, scope: &str) -> String {
        let handle = self
            .state
            .keys()
            .latest_active(JwsAlgorithm::RS256)
            .unwrap();
        let now = Utc::now().timestamp();
        let claims = serde_json::json!({
            "iss": ISSUER,
            "sub": sub,
            "aud": CLIENT_ID,
            "iat": now,
            "exp": now + 3600,
            "scope": scope,
            "client_id": CLIENT_ID,
            "jti": uuid::Uuid::new_v4().to_string(),
        });
        jwt::sign(
            &claims,
            handle.encoding_key(),
            JwsAlgorithm::RS256,
            Some(&handle.pair.kid),
        )
        .unwrap()
    }
}

pub fn test_config() -> Config {
    Config {
        port: 3000,
        issuer: ISSUER.to_string(),
        default_audience: None,
        database_url: "postgres://unused".to_string(),
        database_max_connections: 1,
        rate_limit_window_ms: 60_000,
        // High enough that suites never trip it by accident.
        rate_limit_max_requests: 100_000,
        cors_allowed_origins: vec!["*".to_string()],
        google: None,
        microsoft: None,
        facebook: None,
        x: None,
    }
}

fn test_client(id: &str, auth_method: &str, secret: Option<&str>) -> OAuthClient {
    let now = Utc::now();
    OAuthClient {
        id: id.to_string(),
        name: format!("Test client {id}"),
        redirect_uris: vec![REDIRECT_URI.to_string()],
        grant_types: vec![
            "authorization_code".to_string(),
            "refresh_token".to_string(),
        ],
        response_types: vec!["code".to_string()],
        scopes: vec![
            "openid".to_string(),
            "profile".to_string(),
            "email".to_string(),
            "offline_access".to_string(),
        ],
        token_endpoint_auth_method: auth_method.to_string(),
        secret_hash: secret.map(hash),
        is_active: true,
        created_at: now,
        updated_at: now,
    }
}

fn hash(secret: &str) -> String {
    use argon2::password_hash::SaltString;
    use argon2::password_hash::rand_core::OsRng;
    use argon2::{Argon2, PasswordHasher};
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(secret.as_bytes(), &salt)
        .unwrap()
        .to_string()
}

/// Read a response body as JSON.
pub async fn json_body(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Read a response body as text.
pub async fn text_body(response: Response<Body>) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// Decode a JWT payload without verifying (tests inspect claims of
/// tokens the suite itself minted).
pub fn decode_payload(token: &str) -> Value {
    let payload = token.split('.').nth(1).unwrap();
    let bytes = URL_SAFE_NO_PAD.decode(payload).unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// The `Location` header of a redirect.
pub fn location(response: &Response<Body>) -> String {
    response
        .headers()
        .get(header::LOCATION)
        .unwrap()
        .to_str()
        .unwrap()
        .to_string()
}
