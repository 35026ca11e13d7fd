//! HTTP endpoints.

pub mod authorize;
pub mod discovery;
pub mod federated;
pub mod health;
pub mod helpers;
pub mod introspect;
pub mod login;
pub mod revoke;
pub mod token;
pub mod userinfo;

use axum::Router;
use axum::middleware::from_fn_with_state;
use tower_http::trace::TraceLayer;

use crate::middleware::{authenticate_bearer, enforce_rate_limit, require_scope};
use crate::state::AppState;

/// Assemble the full application router.
pub fn app(state: AppState) -> Router {
    let bearer_protected = Router::new()
        .merge(userinfo::router())
        .route_layer(from_fn_with_state("openid", require_scope))
        .route_layer(from_fn_with_state(state.clone(), authenticate_bearer));

    Router::new()
        .merge(discovery::router())
        .merge(authorize::router())
        .merge(token::router())
        .merge(introspect::router())
        .merge(revoke::router())
        .merge(login::router())
        .merge(federated::router())
        .merge(health::router())
        .merge(bearer_protected)
        .layer(from_fn_with_state(state.clone(), enforce_rate_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
