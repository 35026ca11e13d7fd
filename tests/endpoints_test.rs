//! Endpoint behavior: the /authorize validation ladder, the sign-in
//! flow, bearer protection, discovery, and rate limiting.

mod common;

use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use common::{
    CLIENT_ID, CLIENT_SECRET, ISSUER, REDIRECT_URI, TestApp, USER_EMAIL, USER_ID, USER_PASSWORD,
    json_body, location, test_config, text_body,
};
use signet::crypto::{JwsAlgorithm, jwt};

fn authorize_path(extra: &str) -> String {
    format!(
        "/authorize?client_id={CLIENT_ID}&redirect_uri={}&response_type=code&scope=openid%20profile&state=xyz{extra}",
        urlencoding::encode(REDIRECT_URI)
    )
}

/// Sign in through POST /login and return the session cookie value.
async fn sign_in(app: &TestApp, return_to: &str) -> String {
    let body = format!(
        "email={}&password={}&return_to={}",
        urlencoding::encode(USER_EMAIL),
        urlencoding::encode(USER_PASSWORD),
        urlencoding::encode(return_to),
    );
    let response = app.post_form("/login", &body, None).await;
    assert_eq!(response.status(), StatusCode::FOUND);

    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .expect("login must set a session cookie")
        .to_str()
        .unwrap();
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Max-Age=900"));
    cookie.split(';').next().unwrap().to_string()
}

#[tokio::test]
async fn authorize_without_session_redirects_to_login() {
    let app = TestApp::new().await;
    app.seed_client().await;

    let response = app.get(&authorize_path("")).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = location(&response);
    assert!(location.starts_with(&format!("{ISSUER}/login?return_to=")));
    // The original request (with its query) survives the round trip.
    assert!(location.contains(urlencoding::encode("/authorize?client_id=").as_ref()));
}

#[tokio::test]
async fn full_login_authorize_exchange_flow() {
    let app = TestApp::new().await;
    app.seed_client().await;
    app.seed_user().await;

    let cookie = sign_in(&app, &format!("{ISSUER}/authorize")).await;

    let response = app
        .request(
            Request::builder()
                .uri(authorize_path(""))
                .header(header::COOKIE, &cookie)
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let location = location(&response);
    assert!(location.starts_with(&format!("{REDIRECT_URI}?code=")));
    assert!(location.ends_with("&state=xyz"));

    let code = location
        .split("code=")
        .nth(1)
        .unwrap()
        .split('&')
        .next()
        .unwrap()
        .to_string();

    let body = format!(
        "grant_type=authorization_code&code={code}&redirect_uri={}",
        urlencoding::encode(REDIRECT_URI)
    );
    let token_response = app
        .post_form("/token", &body, Some((CLIENT_ID, CLIENT_SECRET)))
        .await;
    assert_eq!(token_response.status(), StatusCode::OK);

    let token_body = json_body(token_response).await;
    assert_eq!(token_body["scope"], "openid profile");
    // auth_time comes from the session issued at login, so it is
    // recent.
    let claims = common::decode_payload(token_body["id_token"].as_str().unwrap());
    let auth_time = claims["auth_time"].as_i64().unwrap();
    assert!((chrono::Utc::now().timestamp() - auth_time).abs() < 60);
}

#[tokio::test]
async fn authorize_pre_redirect_errors_render_html() {
    let app = TestApp::new().await;
    app.seed_client().await;

    // Missing client_id.
    let response = app
        .get("/authorize?redirect_uri=https%3A%2F%2Fexample.com%2Fcallback")
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(text_body(response).await.contains("client_id"));

    // Relative redirect_uri.
    let response = app
        .get(&format!("/authorize?client_id={CLIENT_ID}&redirect_uri=%2Frelative"))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unknown client.
    let response = app
        .get(&format!(
            "/authorize?client_id=ghost&redirect_uri={}",
            urlencoding::encode(REDIRECT_URI)
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Unregistered redirect_uri never gets redirected to.
    let response = app
        .get(&format!(
            "/authorize?client_id={CLIENT_ID}&redirect_uri={}",
            urlencoding::encode("https://attacker.example/cb")
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    // Oversized state.
    let big_state = "s".repeat(513);
    let response = app
        .get(&format!(
            "/authorize?client_id={CLIENT_ID}&redirect_uri={}&state={big_state}",
            urlencoding::encode(REDIRECT_URI)
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn authorize_post_validation_errors_redirect() {
    let app = TestApp::new().await;
    app.seed_client().await;

    let base = format!(
        "/authorize?client_id={CLIENT_ID}&redirect_uri={}&state=xyz",
        urlencoding::encode(REDIRECT_URI)
    );

    // Wrong response_type.
    let response = app
        .get(&format!("{base}&response_type=token&scope=openid"))
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let loc = location(&response);
    assert!(loc.contains("error=unsupported_response_type"));
    assert!(loc.contains("state=xyz"));

    // Scope missing openid.
    let response = app
        .get(&format!("{base}&response_type=code&scope=profile"))
        .await;
    assert!(location(&response).contains("error=invalid_scope"));

    // Scope outside the client allowlist names the offender.
    let mut narrow = app.seed_client().await;
    narrow.scopes = vec!["openid".to_string()];
    app.state.clients().put(&narrow).await.unwrap();
    let response = app
        .get(&format!("{base}&response_type=code&scope=openid%20email"))
        .await;
    let loc = location(&response);
    assert!(loc.contains("error=invalid_scope"));
    assert!(loc.contains("email"));
    app.seed_client().await;

    // Bad code_challenge_method.
    let response = app
        .get(&format!(
            "{base}&response_type=code&scope=openid&code_challenge=abc&code_challenge_method=S512"
        ))
        .await;
    assert!(location(&response).contains("error=invalid_request"));

    // Method without challenge.
    let response = app
        .get(&format!(
            "{base}&response_type=code&scope=openid&code_challenge_method=S256"
        ))
        .await;
    assert!(location(&response).contains("error=invalid_request"));

    // Bad prompt.
    let response = app
        .get(&format!("{base}&response_type=code&scope=openid&prompt=signup"))
        .await;
    assert!(location(&response).contains("error=invalid_request"));

    // Negative max_age.
    let response = app
        .get(&format!("{base}&response_type=code&scope=openid&max_age=-5"))
        .await;
    assert!(location(&response).contains("error=invalid_request"));
}

#[tokio::test]
async fn authorize_requires_pkce_for_public_clients() {
    let app = TestApp::new().await;
    app.seed_public_client("public-123").await;

    let response = app
        .get(&format!(
            "/authorize?client_id=public-123&redirect_uri={}&response_type=code&scope=openid",
            urlencoding::encode(REDIRECT_URI)
        ))
        .await;
    assert_eq!(response.status(), StatusCode::FOUND);
    let loc = location(&response);
    assert!(loc.contains("error=invalid_request"));
    assert!(loc.contains(urlencoding::encode("PKCE is required").as_ref()));
}

#[tokio::test]
async fn login_rejects_bad_credentials() {
    let app = TestApp::new().await;
    app.seed_user().await;

    let body = format!(
        "email={}&password=wrong&return_to=%2F",
        urlencoding::encode(USER_EMAIL)
    );
    let response = app.post_form("/login", &body, None).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(text_body(response).await.contains("Invalid email or password"));
}

#[tokio::test]
async fn login_redirect_is_clamped_to_deployment() {
    let app = TestApp::new().await;
    app.seed_user().await;

    let body = format!(
        "email={}&password={}&return_to={}",
        urlencoding::encode(USER_EMAIL),
        urlencoding::encode(USER_PASSWORD),
        urlencoding::encode("https://evil.example/phish"),
    );
    let response = app.post_form("/login", &body, None).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), "/");
}

#[tokio::test]
async fn session_cookie_is_secure_behind_tls() {
    let app = TestApp::new().await;
    app.seed_user().await;

    let body = format!(
        "email={}&password={}&return_to=%2F",
        urlencoding::encode(USER_EMAIL),
        urlencoding::encode(USER_PASSWORD),
    );
    let response = app
        .request(
            Request::builder()
                .method("POST")
                .uri("/login")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .header("x-forwarded-proto", "https")
                .body(Body::from(body))
                .unwrap(),
        )
        .await;
    let cookie = response
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(cookie.contains("; Secure"));
}

#[tokio::test]
async fn userinfo_requires_bearer_token() {
    let app = TestApp::new().await;

    let response = app.get("/userinfo").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap(),
        "Bearer error=\"invalid_request\""
    );

    let response = app.get_bearer("/userinfo", "garbage.token.here").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap(),
        "Bearer error=\"invalid_token\""
    );
}

#[tokio::test]
async fn userinfo_rejects_foreign_issuer() {
    let app = TestApp::new().await;
    app.seed_user().await;

    let handle = app.state.keys().latest_active(JwsAlgorithm::RS256).unwrap();
    let now = chrono::Utc::now().timestamp();
    let token = jwt::sign(
        &serde_json::json!({
            "iss": "https://other-issuer.example",
            "sub": USER_ID,
            "exp": now + 3600,
            "scope": "openid",
        }),
        handle.encoding_key(),
        JwsAlgorithm::RS256,
        Some(&handle.pair.kid),
    )
    .unwrap();

    let response = app.get_bearer("/userinfo", &token).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn userinfo_requires_openid_scope() {
    let app = TestApp::new().await;
    app.seed_user().await;

    let token = app.mint_access_token(USER_ID, "profile email");
    let response = app.get_bearer("/userinfo", &token).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response
            .headers()
            .get(header::WWW_AUTHENTICATE)
            .unwrap()
            .to_str()
            .unwrap(),
        "Bearer error=\"insufficient_scope\""
    );
}

#[tokio::test]
async fn userinfo_maps_user_state_to_errors() {
    let app = TestApp::new().await;

    // Unknown subject.
    let token = app.mint_access_token("ghost-user", "openid");
    let response = app.get_bearer("/userinfo", &token).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(json_body(response).await["error"], "user_not_found");

    // Inactive subject.
    let mut account = app.seed_user().await;
    account.is_active = false;
    app.state.accounts().put(&account).await.unwrap();
    let token = app.mint_access_token(USER_ID, "openid");
    let response = app.get_bearer("/userinfo", &token).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "user_inactive");
}

#[tokio::test]
async fn discovery_document_is_projected_from_config() {
    let app = TestApp::new().await;

    let response = app.get("/.well-known/openid-configuration").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    assert_eq!(body["issuer"], ISSUER);
    assert_eq!(body["authorization_endpoint"], format!("{ISSUER}/authorize"));
    assert_eq!(body["token_endpoint"], format!("{ISSUER}/token"));
    assert_eq!(body["userinfo_endpoint"], format!("{ISSUER}/userinfo"));
    assert_eq!(body["jwks_uri"], format!("{ISSUER}/.well-known/jwks.json"));
    assert_eq!(body["revocation_endpoint"], format!("{ISSUER}/revoke"));
    assert_eq!(body["response_types_supported"], serde_json::json!(["code"]));
    assert_eq!(body["subject_types_supported"], serde_json::json!(["public"]));
    assert_eq!(
        body["id_token_signing_alg_values_supported"],
        serde_json::json!(["RS256", "ES256"])
    );
    assert_eq!(
        body["code_challenge_methods_supported"],
        serde_json::json!(["S256", "plain"])
    );
    assert_eq!(
        body["scopes_supported"],
        serde_json::json!(["openid", "profile", "email", "offline_access"])
    );
}

#[tokio::test]
async fn jwks_serves_public_keys_only() {
    let app = TestApp::new().await;

    let response = app.get("/.well-known/jwks.json").await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;

    let keys = body["keys"].as_array().unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(keys[0]["kty"], "RSA");
    assert_eq!(keys[0]["use"], "sig");
    assert_eq!(keys[0]["alg"], "RS256");
    assert!(keys[0]["n"].is_string());
    assert!(keys[0]["e"].is_string());
    for private_member in ["d", "p", "q", "dp", "dq", "qi"] {
        assert!(keys[0].get(private_member).is_none());
    }
}

#[tokio::test]
async fn revoke_rejects_unknown_hints() {
    let app = TestApp::new().await;
    app.seed_client().await;

    let response = app
        .post_form(
            "/revoke",
            "token=x&token_type_hint=saml_assertion",
            Some((CLIENT_ID, CLIENT_SECRET)),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(
        json_body(response).await["error"],
        "unsupported_token_type"
    );
}

#[tokio::test]
async fn public_clients_may_revoke_with_bare_client_id() {
    let app = TestApp::new().await;
    app.seed_public_client("public-123").await;

    let response = app
        .post_form("/revoke", "token=whatever&client_id=public-123", None)
        .await;
    assert_eq!(response.status(), StatusCode::OK);

    // An unknown bare client_id authenticates nothing.
    let response = app
        .post_form("/revoke", "token=whatever&client_id=ghost", None)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn rate_limit_answers_429_when_exhausted() {
    let mut config = test_config();
    config.rate_limit_max_requests = 3;
    let app = TestApp::with_config(config).await;

    for _ in 0..3 {
        let response = app.get("/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.get("/health").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(header::RETRY_AFTER).is_some());
    assert_eq!(json_body(response).await["error"], "rate_limit_exceeded");
}

#[tokio::test]
async fn health_reports_store_liveness() {
    let app = TestApp::new().await;
    let body = json_body(app.get("/health").await).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], true);
}
