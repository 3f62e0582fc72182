use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::market::{Side, Venue};

/// Lifecycle state of a venue-side order. `Resting`, `Canceled`, `Rejected`
/// and `Filled` are terminal classifications for the fill monitor;
/// `PartiallyFilled` hands off to the unwind planner.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Resting,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// Whether the venue will not change this order any further on its own.
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected)
    }
}

/// Whether the ticket opens a position or sells one back.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OrderAction {
    Buy,
    Sell,
}

/// Request to place one leg. `instrument` is the opaque routing identifier
/// (Kalshi ticker / Polymarket CLOB token); the adapter maps `side` and
/// `action` to the venue-native representation.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrderTicket {
    pub venue: Venue,
    pub instrument: String,
    pub side: Side,
    pub action: OrderAction,
    /// Limit price in [0, 1].
    pub price: f64,
    /// Size in contracts.
    pub size: f64,
    pub client_order_id: String,
}

impl OrderTicket {
    pub fn new(venue: Venue, instrument: &str, side: Side, price: f64, size: f64) -> Self {
        Self {
            venue,
            instrument: instrument.to_string(),
            side,
            action: OrderAction::Buy,
            price,
            size,
            client_order_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn sell(venue: Venue, instrument: &str, side: Side, price: f64, size: f64) -> Self {
        Self {
            action: OrderAction::Sell,
            ..Self::new(venue, instrument, side, price, size)
        }
    }
}

/// Venue-side view of an order after placement or poll.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VenueOrder {
    pub venue: Venue,
    pub order_id: String,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub avg_price: f64,
}

impl VenueOrder {
    /// Classify against the requested size: full fill, partial, or the raw
    /// venue status.
    pub fn classify(&self, requested: f64) -> OrderStatus {
        if self.filled_size >= requested - 1e-9 {
            OrderStatus::Filled
        } else if self.filled_size > 0.0 && self.status.is_terminal() {
            OrderStatus::PartiallyFilled
        } else {
            self.status
        }
    }
}

/// Final accounting for one executed leg.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LegFill {
    pub venue: Venue,
    pub instrument: String,
    pub side: Side,
    pub order_id: String,
    pub status: OrderStatus,
    pub filled: f64,
    pub avg_price: f64,
    pub fees: f64,
}

/// An executed opportunity: both legs filled at target size, with realized
/// costs and venue order ids. Immutable after write.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Trade {
    pub pair_key: String,
    pub strategy: String,
    pub size: f64,
    pub kalshi: LegFill,
    pub poly: LegFill,
    pub total_cost: f64,
    pub total_fees: f64,
    pub executed_at: chrono::DateTime<chrono::Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(status: OrderStatus, filled: f64) -> VenueOrder {
        VenueOrder {
            venue: Venue::Kalshi,
            order_id: "o1".to_string(),
            status,
            filled_size: filled,
            avg_price: 0.5,
        }
    }

    #[test]
    fn classify_full_partial_and_resting() {
        assert_eq!(order(OrderStatus::Resting, 10.0).classify(10.0), OrderStatus::Filled);
        assert_eq!(
            order(OrderStatus::Canceled, 5.0).classify(10.0),
            OrderStatus::PartiallyFilled
        );
        assert_eq!(order(OrderStatus::Resting, 0.0).classify(10.0), OrderStatus::Resting);
        assert_eq!(order(OrderStatus::Rejected, 0.0).classify(10.0), OrderStatus::Rejected);
    }

    #[test]
    fn terminal_states() {
        assert!(OrderStatus::Filled.is_terminal());
        assert!(OrderStatus::Canceled.is_terminal());
        assert!(OrderStatus::Rejected.is_terminal());
        assert!(!OrderStatus::Resting.is_terminal());
        assert!(!OrderStatus::PartiallyFilled.is_terminal());
    }
}
