//! Static broker topology: exchange names, routing keys and topic matching.

use crate::{BrokerChannel, Result};

/// Exchange receiving newly created orders.
pub const ORDER_EXCHANGE: &str = "order.exchange";
/// Exchange receiving orders that passed the availability check.
pub const INVENTORY_EXCHANGE: &str = "inventory.exchange";

/// Routing key of freshly created orders.
pub const ORDER_CREATED_TOPIC: &str = "order.created.topic";
/// Routing key of in-stock orders.
pub const INVENTORY_INSTOCK_TOPIC: &str = "inventory.instock.topic";

/// An exchange the pipeline depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: &'static str,
    pub durable: bool,
}

impl ExchangeSpec {
    /// A durable topic exchange.
    pub const fn durable(name: &'static str) -> Self {
        Self {
            name,
            durable: true,
        }
    }
}

/// Destination of a publish: an exchange plus a routing key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// `order.exchange` / `order.created.topic`.
    pub fn order_created() -> Self {
        Self::new(ORDER_EXCHANGE, ORDER_CREATED_TOPIC)
    }

    /// `inventory.exchange` / `inventory.instock.topic`.
    pub fn inventory_instock() -> Self {
        Self::new(INVENTORY_EXCHANGE, INVENTORY_INSTOCK_TOPIC)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.exchange, self.routing_key)
    }
}

/// Declares every exchange in `exchanges`, stopping at the first failure.
#[tracing::instrument(skip(channel, exchanges))]
pub async fn declare_topology<C: BrokerChannel + ?Sized>(
    channel: &C,
    exchanges: &[ExchangeSpec],
) -> Result<()> {
    for exchange in exchanges {
        channel
            .declare_exchange(exchange.name, exchange.durable)
            .await?;
        tracing::info!(
            exchange = exchange.name,
            durable = exchange.durable,
            "exchange declared"
        );
    }
    Ok(())
}

/// Matches a routing key against a topic binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word and `#`
/// matches zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &key)
}

fn match_words(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| match_words(rest, &key[skip..])),
        Some((&word, rest)) => match key.split_first() {
            Some((&k, key_rest)) if word == "*" || word == k => match_words(rest, key_rest),
            _ => false,
        },
    }
}
