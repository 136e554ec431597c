//! The HTTP surface (§6.1): thin handlers over `Scheduler`/`TaskStore`, with
//! two auth middleware classes layered via nested routers.

pub mod auth;
pub mod handlers;
pub mod state;

pub use state::AppState;

use axum::routing::post;
use axum::Router;
use tower_http::trace::TraceLayer;

/// Builds the full router: `loopback`-guarded routes (`/scheduler_tick`,
/// `/scheduler_metrics`) and `authenticated`-guarded routes (everything else
/// in §6.1), both logged via `tower_http::trace::TraceLayer`.
pub fn router(state: AppState) -> Router {
    let loopback_routes = Router::new()
        .route("/scheduler_tick", post(handlers::scheduler_tick))
        .route("/scheduler_metrics", post(handlers::scheduler_metrics))
        .route_layer(axum::middleware::from_fn(auth::require_loopback));

    let authenticated_routes = Router::new()
        .route("/scheduler_task_run", post(handlers::scheduler_task_run))
        .route("/scheduler_task_create", post(handlers::scheduler_task_create))
        .route("/scheduler_task_update", post(handlers::scheduler_task_update))
        .route("/scheduler_task_delete", post(handlers::scheduler_task_delete))
        .route("/scheduler_tasks_list", post(handlers::scheduler_tasks_list))
        .route("/scheduler_task_get", post(handlers::scheduler_task_get))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth::require_api_token));

    loopback_routes.merge(authenticated_routes).layer(TraceLayer::new_for_http()).with_state(state)
}
