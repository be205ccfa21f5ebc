//! The management listener: key CRUD, policy, monitor, and statistics.
//!
//! Everything except `/login` and `/health` sits behind the bearer-token
//! middleware in [`auth`].

pub mod auth;
pub mod handlers;

use crate::state::AppState;
use axum::{
    middleware,
    routing::{get, post},
    Router,
};

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/api-keys", get(handlers::list_keys).post(handlers::create_key))
        .route("/api-keys/count", get(handlers::key_counts))
        .route(
            "/api-keys/:id",
            get(handlers::get_key)
                .put(handlers::update_key)
                .delete(handlers::delete_key),
        )
        .route("/api-keys/:id/revoke", post(handlers::revoke_key))
        .route("/api-keys/:id/refresh", post(handlers::refresh_key))
        .route("/policy", get(handlers::get_policy).put(handlers::update_policy))
        .route("/monitor", get(handlers::monitor))
        .route("/stats/summary", get(handlers::stats_summary))
        .route("/stats/users", get(handlers::stats_users))
        .route("/stats/apis", get(handlers::stats_apis))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_admin));

    Router::new()
        .route("/login", post(handlers::login))
        .route("/health", get(handlers::admin_health))
        .merge(protected)
        .with_state(state)
}
