//! The vantage node: local log, profile and metric stores, and the HTTP
//! surface answering local and cluster-wide queries over them.

pub mod args;
pub mod capture;
pub mod context;
pub mod error;
pub mod handlers;
pub mod log_store;
pub mod metrics;
pub mod profile_store;
pub mod state;

use axum::{middleware, routing::get, Router};
use vantage_common::auth::{auth_middleware, require_operator};

use crate::context::execution_context;
use crate::handlers::{
    healthz, logs_cluster, logs_local, metric_names_cluster, metric_names_local,
    metric_samples_cluster, metric_samples_local, profile_group_cluster, profile_group_local,
    profile_groups_cluster, profile_groups_local, profile_trace_cluster,
};
use crate::metrics::{metrics_handler, track_requests};
pub use crate::state::{AppState, AppStateBuilder, NodeSink};

/// All node routes. Everything but `/healthz` and `/metrics` runs inside an
/// execution context and requires the operator role.
pub fn router(st: AppState) -> Router {
    let authed_routes = Router::new()
        .route("/logs/local", get(logs_local))
        .route("/logs/local/:appender", get(logs_local))
        .route("/logs/cluster", get(logs_cluster))
        .route("/logs/cluster/:appender", get(logs_cluster))
        .route("/profiles/local/groups", get(profile_groups_local))
        .route("/profiles/cluster/groups", get(profile_groups_cluster))
        .route("/profiles/local/groups/:label", get(profile_group_local))
        .route("/profiles/cluster/groups/:label", get(profile_group_cluster))
        .route("/profiles/cluster/traces/:trace", get(profile_trace_cluster))
        .route("/metrics/local", get(metric_names_local))
        .route("/metrics/cluster", get(metric_names_cluster))
        .route("/metrics/local/:name", get(metric_samples_local))
        .route("/metrics/cluster/:name", get(metric_samples_cluster))
        .route_layer(middleware::from_fn_with_state(st.clone(), execution_context))
        .route_layer(middleware::from_fn(require_operator))
        .route_layer(middleware::from_fn_with_state(
            st.clone(),
            auth_middleware::<AppState>,
        ));

    // Routes that do NOT require auth (health/metrics)
    let public_routes = Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler));

    public_routes
        .merge(authed_routes)
        .layer(middleware::from_fn_with_state(st.clone(), track_requests))
        .with_state(st)
}
