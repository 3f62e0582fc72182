pub mod coordinator;
pub mod order;
pub mod unwind;

pub use coordinator::{AbortReason, CoordinatorConfig, ExecutionCoordinator, TradeOutcome};
pub use order::{LegFill, OrderAction, OrderStatus, OrderTicket, Trade, VenueOrder};
pub use unwind::{UnwindCandidate, UnwindReport, UnwindStep};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::info;
use uuid::Uuid;

use crate::client::{ClientError, ClientResult, KalshiClient, PolymarketClient};
use crate::market::{OrderbookSnapshot, Venue};

/// Live venue adapters behind the execution layer.
pub struct LiveVenues {
    pub kalshi: Arc<KalshiClient>,
    pub poly: Arc<PolymarketClient>,
}

/// Venue access for the execution path, either simulated or live. Paper and
/// live trading share the whole decision pipeline; only this seam differs.
pub enum ExecutionBackend {
    Paper(PaperBackend),
    Live(LiveVenues),
}

impl ExecutionBackend {
    pub fn is_paper(&self) -> bool {
        matches!(self, ExecutionBackend::Paper(_))
    }

    pub async fn place(&self, ticket: &OrderTicket) -> ClientResult<VenueOrder> {
        match self {
            ExecutionBackend::Paper(paper) => paper.place(ticket).await,
            ExecutionBackend::Live(live) => match ticket.venue {
                Venue::Kalshi => {
                    live.kalshi
                        .place_order(
                            &ticket.instrument,
                            ticket.side,
                            ticket.action,
                            ticket.price,
                            ticket.size,
                            &ticket.client_order_id,
                        )
                        .await
                }
                Venue::Polymarket => {
                    live.poly
                        .place_order(
                            &ticket.instrument,
                            ticket.action,
                            ticket.price,
                            ticket.size,
                            &ticket.client_order_id,
                        )
                        .await
                }
            },
        }
    }

    pub async fn order_status(&self, venue: Venue, order_id: &str) -> ClientResult<VenueOrder> {
        match self {
            ExecutionBackend::Paper(paper) => paper.order_status(order_id),
            ExecutionBackend::Live(live) => match venue {
                Venue::Kalshi => live.kalshi.get_order(order_id).await,
                Venue::Polymarket => live.poly.get_order(order_id).await,
            },
        }
    }

    pub async fn cancel(&self, venue: Venue, order_id: &str) -> ClientResult<VenueOrder> {
        match self {
            ExecutionBackend::Paper(paper) => paper.cancel(order_id),
            ExecutionBackend::Live(live) => {
                match venue {
                    Venue::Kalshi => live.kalshi.cancel_order(order_id).await?,
                    Venue::Polymarket => live.poly.cancel_order(order_id).await?,
                }
                // Re-read so a fill that raced the cancel is observed.
                self.order_status(venue, order_id).await
            }
        }
    }

    pub async fn fetch_book(&self, venue: Venue, book_id: &str) -> ClientResult<OrderbookSnapshot> {
        match self {
            ExecutionBackend::Paper(paper) => match paper.fetch_book(venue, book_id) {
                Ok(book) => Ok(book),
                Err(err) => match &paper.live_data {
                    Some(live) => match venue {
                        Venue::Kalshi => live.kalshi.get_orderbook(book_id).await,
                        Venue::Polymarket => live.poly.get_orderbook(book_id).await,
                    },
                    None => Err(err),
                },
            },
            ExecutionBackend::Live(live) => match venue {
                Venue::Kalshi => live.kalshi.get_orderbook(book_id).await,
                Venue::Polymarket => live.poly.get_orderbook(book_id).await,
            },
        }
    }

    /// Authoritative balance from the venue of record (Kalshi).
    pub async fn fetch_balance_of_record(&self) -> ClientResult<f64> {
        match self {
            ExecutionBackend::Paper(paper) => Ok(paper.balance()),
            ExecutionBackend::Live(live) => live.kalshi.get_balance().await,
        }
    }
}

/// How the paper backend treats orders for a given instrument.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum PaperPlan {
    /// Fill the whole order at the limit price (default).
    Fill,
    /// Fill a fraction and leave the rest unfilled in a terminal state.
    Partial(f64),
    /// Accept the order and let it rest unfilled.
    Rest,
    /// Reject outright.
    Reject,
}

/// Simulated venue for paper mode and tests: fills at the limit price after a
/// small latency, with per-instrument overrides to exercise partial-fill and
/// rejection paths.
pub struct PaperBackend {
    latency: Duration,
    balance: f64,
    plans: Mutex<HashMap<String, PaperPlan>>,
    orders: Mutex<HashMap<String, VenueOrder>>,
    books: Mutex<HashMap<(Venue, String), OrderbookSnapshot>>,
    /// Live adapters for market data, so paper mode trades against real
    /// books while orders stay simulated.
    live_data: Option<LiveVenues>,
}

impl PaperBackend {
    pub fn new(balance: f64) -> Self {
        Self {
            latency: Duration::from_millis(5),
            balance,
            plans: Mutex::new(HashMap::new()),
            orders: Mutex::new(HashMap::new()),
            books: Mutex::new(HashMap::new()),
            live_data: None,
        }
    }

    pub fn with_live_data(mut self, venues: LiveVenues) -> Self {
        self.live_data = Some(venues);
        self
    }

    pub fn balance(&self) -> f64 {
        self.balance
    }

    /// Override the next order on `instrument`; later orders fill normally.
    pub fn set_plan(&self, instrument: &str, plan: PaperPlan) {
        self.plans
            .lock()
            .expect("paper plans poisoned")
            .insert(instrument.to_string(), plan);
    }

    pub fn set_book(&self, book: OrderbookSnapshot) {
        self.books
            .lock()
            .expect("paper books poisoned")
            .insert((book.venue, book.book_id.clone()), book);
    }

    async fn place(&self, ticket: &OrderTicket) -> ClientResult<VenueOrder> {
        tokio::time::sleep(self.latency).await;

        let plan = self
            .plans
            .lock()
            .expect("paper plans poisoned")
            .remove(&ticket.instrument)
            .unwrap_or(PaperPlan::Fill);

        let order_id = Uuid::new_v4().to_string();
        let order = match plan {
            PaperPlan::Fill => VenueOrder {
                venue: ticket.venue,
                order_id: order_id.clone(),
                status: OrderStatus::Filled,
                filled_size: ticket.size,
                avg_price: ticket.price,
            },
            PaperPlan::Partial(fraction) => VenueOrder {
                venue: ticket.venue,
                order_id: order_id.clone(),
                status: OrderStatus::PartiallyFilled,
                filled_size: (ticket.size * fraction).floor(),
                avg_price: ticket.price,
            },
            PaperPlan::Rest => VenueOrder {
                venue: ticket.venue,
                order_id: order_id.clone(),
                status: OrderStatus::Resting,
                filled_size: 0.0,
                avg_price: 0.0,
            },
            PaperPlan::Reject => {
                return Err(ClientError::OrderRejected("paper reject".to_string()));
            }
        };

        info!(
            target: "execution",
            venue = %ticket.venue,
            instrument = %ticket.instrument,
            side = %ticket.side,
            price = ticket.price,
            size = ticket.size,
            status = ?order.status,
            "paper order"
        );

        self.orders
            .lock()
            .expect("paper orders poisoned")
            .insert(order_id, order.clone());
        Ok(order)
    }

    fn order_status(&self, order_id: &str) -> ClientResult<VenueOrder> {
        self.orders
            .lock()
            .expect("paper orders poisoned")
            .get(order_id)
            .cloned()
            .ok_or_else(|| ClientError::Config(format!("unknown paper order {order_id}")))
    }

    fn cancel(&self, order_id: &str) -> ClientResult<VenueOrder> {
        let mut orders = self.orders.lock().expect("paper orders poisoned");
        let order = orders
            .get_mut(order_id)
            .ok_or_else(|| ClientError::Config(format!("unknown paper order {order_id}")))?;
        if !order.status.is_terminal() {
            order.status = if order.filled_size > 0.0 {
                OrderStatus::PartiallyFilled
            } else {
                OrderStatus::Canceled
            };
        }
        Ok(order.clone())
    }

    fn fetch_book(&self, venue: Venue, book_id: &str) -> ClientResult<OrderbookSnapshot> {
        self.books
            .lock()
            .expect("paper books poisoned")
            .get(&(venue, book_id.to_string()))
            .cloned()
            .ok_or_else(|| ClientError::Deadline(format!("no paper book for {book_id}")))
    }
}
