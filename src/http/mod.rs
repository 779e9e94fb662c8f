//! The RESTful HTTP surface: route wiring, auth, error mapping, and SSE.

mod auth;
mod error;
mod handlers;
mod sse;

use std::sync::Arc;

use axum::Router;
use axum::middleware;
use axum::routing::{delete, get, post};

use crate::app::registry::AgentRegistry;
use crate::app::run_manager::RunManager;
use crate::app::session_manager::SessionManager;
use crate::config::Config;
use crate::infra::db::SessionStore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<AgentRegistry>,
    pub sessions: Arc<SessionManager>,
    pub runs: Arc<RunManager>,
    pub store: SessionStore,
}

/// Builds the bridge's router: `/ping` is reachable with no token, every
/// other route sits behind [`auth::require_bearer_token`].
#[must_use]
pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/agents", get(handlers::list_agents))
        .route("/agents/{name}", get(handlers::get_agent))
        .route("/runs", post(handlers::create_run))
        .route("/runs/{id}/cancel", post(handlers::cancel_run))
        .route("/sessions", get(handlers::list_sessions))
        .route("/sessions/{id}", get(handlers::get_session))
        .route("/sessions/{id}", delete(handlers::delete_session))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::require_bearer_token));

    Router::new()
        .route("/ping", get(handlers::ping))
        .merge(protected)
        .with_state(state)
}
