//! Order stage of the pipeline.
//!
//! Accepts orders over HTTP, assigns their id and hands them to a
//! [`ReliablePublisher`] targeting `order.exchange`/`order.created.topic`.
//! Also serves health and Prometheus metrics endpoints.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use broker::{
    BrokerChannel, BrokerConfig, DrainReport, ExchangeSpec, ORDER_EXCHANGE, ReliablePublisher,
    Route, declare_topology,
};
use domain::Order;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use routes::orders::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app(state: Arc<AppState>, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/api/v1/order", post(routes::orders::create))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Declares the order exchange and spawns the order publisher on `channel`.
///
/// Returns the sender the HTTP handlers feed and the publisher task. The
/// task drains and finishes once every sender is dropped.
pub async fn start_order_publisher<C>(
    channel: C,
    config: &BrokerConfig,
) -> broker::Result<(mpsc::Sender<Order>, JoinHandle<broker::Result<DrainReport>>)>
where
    C: BrokerChannel + 'static,
{
    declare_topology(&channel, &[ExchangeSpec::durable(ORDER_EXCHANGE)]).await?;

    let publisher =
        ReliablePublisher::<C, Order>::new(channel, Route::order_created(), config.retry)?
            .with_drain_timeout(config.drain_timeout);
    let (tx, rx) = mpsc::channel(config.publish_buffer);
    let handle = tokio::spawn(publisher.publish_all(rx));
    Ok((tx, handle))
}
