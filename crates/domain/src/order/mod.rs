//! The order entity and its creation request.

mod item;

pub use item::{Item, ProductCode};

use broker::WirePayload;
use common::OrderId;
use serde::{Deserialize, Serialize};

/// Body of an order creation request, before an ID is assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    #[serde(rename = "userId")]
    pub user_id: String,
    pub items: Vec<Item>,
}

/// An order travelling through the pipeline.
///
/// The ID is assigned once by the order stage; later stages only ever
/// decode, inspect and re-encode the same order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    #[serde(rename = "userId")]
    pub user_id: String,
    pub items: Vec<Item>,
}

impl Order {
    /// Creates an order from a request, assigning a fresh ID.
    pub fn from_request(request: OrderRequest) -> Self {
        Self {
            id: OrderId::new(),
            user_id: request.user_id,
            items: request.items,
        }
    }

    /// Sum of all line totals.
    pub fn total(&self) -> f64 {
        self.items.iter().map(Item::line_total).sum()
    }
}

impl WirePayload for Order {
    fn to_wire(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    fn from_wire(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    fn describe(&self) -> String {
        format!("order {}", self.id)
    }
}
