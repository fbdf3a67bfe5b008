//! Order ingress endpoint.

use std::sync::Arc;

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use domain::{Order, OrderRequest};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState {
    orders: mpsc::Sender<Order>,
}

impl AppState {
    /// Creates state forwarding accepted orders to `orders`.
    pub fn new(orders: mpsc::Sender<Order>) -> Self {
        Self { orders }
    }

    /// Returns `false` once the publisher task stopped receiving orders.
    pub fn publisher_running(&self) -> bool {
        !self.orders.is_closed()
    }
}

#[derive(Serialize)]
pub struct OrderCreatedResponse {
    pub id: String,
}

/// POST /api/v1/order — accept an order and queue it for publishing.
///
/// Any malformed body is answered with 400, whatever its content type.
#[tracing::instrument(skip_all)]
pub async fn create(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<OrderCreatedResponse>), ApiError> {
    let request: OrderRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("Invalid order: {e}")))?;

    let order = Order::from_request(request);
    let id = order.id;
    tracing::info!(
        order_id = %id,
        user_id = %order.user_id,
        items = order.items.len(),
        total = order.total(),
        "order accepted"
    );

    state
        .orders
        .send(order)
        .await
        .map_err(|_| ApiError::Unavailable("order publisher is not running".to_string()))?;
    metrics::counter!("orders_accepted_total").increment(1);

    Ok((
        StatusCode::CREATED,
        Json(OrderCreatedResponse { id: id.to_string() }),
    ))
}
