//! Payment authorization trait and in-memory implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use domain::Order;

use crate::error::StageError;

/// Trait for payment authorization.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Authorizes the order total for the ordering user.
    async fn authorize(&self, order: &Order) -> Result<(), StageError>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    authorized: Vec<(String, f64)>,
    decline: bool,
}

/// In-memory payment service. Approves every payment unless configured
/// to decline.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to decline every payment.
    pub fn set_decline(&self, decline: bool) {
        self.state.write().unwrap_or_else(|e| e.into_inner()).decline = decline;
    }

    /// Returns the number of approved payments.
    pub fn authorized_count(&self) -> usize {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .authorized
            .len()
    }

    /// Returns the total amount approved for a user.
    pub fn authorized_total(&self, user_id: &str) -> f64 {
        self.state
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .authorized
            .iter()
            .filter(|(user, _)| user == user_id)
            .map(|(_, amount)| amount)
            .sum()
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn authorize(&self, order: &Order) -> Result<(), StageError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());

        if state.decline {
            return Err(StageError::PaymentDeclined {
                order_id: order.id,
                reason: "Payment declined".to_string(),
            });
        }

        state.authorized.push((order.user_id.clone(), order.total()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Item, OrderRequest};

    fn order(user_id: &str) -> Order {
        Order::from_request(OrderRequest {
            user_id: user_id.to_string(),
            items: vec![Item::new("SKU-001", 10.0, 2.0), Item::new("SKU-002", 5.0, 1.0)],
        })
    }

    #[tokio::test]
    async fn test_authorize_records_order_total() {
        let service = InMemoryPaymentService::new();
        service.authorize(&order("u1")).await.unwrap();
        service.authorize(&order("u1")).await.unwrap();
        service.authorize(&order("u2")).await.unwrap();

        assert_eq!(service.authorized_count(), 3);
        assert_eq!(service.authorized_total("u1"), 50.0);
    }

    #[tokio::test]
    async fn test_decline() {
        let service = InMemoryPaymentService::new();
        service.set_decline(true);

        let result = service.authorize(&order("u1")).await;
        assert!(matches!(result, Err(StageError::PaymentDeclined { .. })));
        assert_eq!(service.authorized_count(), 0);
    }
}
