//! Line items of an order.

use serde::{Deserialize, Serialize};

/// Product code (SKU) of a line item.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductCode(String);

impl std::fmt::Display for ProductCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProductCode {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A line item: value type embedded in an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Item {
    pub code: ProductCode,
    pub unit_price: f64,
    /// Any JSON number; fractional quantities are kept as sent.
    pub quantity: f64,
}

impl Item {
    pub fn new(code: impl Into<ProductCode>, unit_price: f64, quantity: f64) -> Self {
        Self {
            code: code.into(),
            unit_price,
            quantity,
        }
    }

    /// Unit price times quantity.
    pub fn line_total(&self) -> f64 {
        self.unit_price * self.quantity
    }
}
