//! Inventory availability trait and in-memory implementation.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use domain::Order;

use crate::error::StageError;

/// Trait for inventory availability checks.
#[async_trait]
pub trait InventoryService: Send + Sync {
    /// Succeeds when every line item of the order is available.
    async fn check_availability(&self, order: &Order) -> Result<(), StageError>;
}

#[derive(Debug, Default)]
struct InMemoryInventoryState {
    checked: usize,
    out_of_stock: bool,
}

/// In-memory inventory service. Everything is in stock unless configured
/// otherwise.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInventoryService {
    state: Arc<RwLock<InMemoryInventoryState>>,
}

impl InMemoryInventoryService {
    /// Creates a new in-memory inventory service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to report every order as out of stock.
    pub fn set_out_of_stock(&self, out_of_stock: bool) {
        self.state
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .out_of_stock = out_of_stock;
    }

    /// Returns the number of orders checked so far.
    pub fn checked_count(&self) -> usize {
        self.state.read().unwrap_or_else(|e| e.into_inner()).checked
    }
}

#[async_trait]
impl InventoryService for InMemoryInventoryService {
    async fn check_availability(&self, order: &Order) -> Result<(), StageError> {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        state.checked += 1;

        if state.out_of_stock {
            return Err(StageError::OutOfStock {
                order_id: order.id,
                reason: "Insufficient stock".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Item, OrderRequest};

    fn order() -> Order {
        Order::from_request(OrderRequest {
            user_id: "u1".to_string(),
            items: vec![Item::new("SKU-001", 10.0, 2.0)],
        })
    }

    #[tokio::test]
    async fn test_everything_in_stock_by_default() {
        let service = InMemoryInventoryService::new();
        service.check_availability(&order()).await.unwrap();
        assert_eq!(service.checked_count(), 1);
    }

    #[tokio::test]
    async fn test_out_of_stock() {
        let service = InMemoryInventoryService::new();
        service.set_out_of_stock(true);

        let result = service.check_availability(&order()).await;
        assert!(matches!(result, Err(StageError::OutOfStock { .. })));
        assert_eq!(service.checked_count(), 1);
    }
}
