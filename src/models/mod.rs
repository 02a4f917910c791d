use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One normalized quote update for the tracked instrument
///
/// Only `last_price` and `timestamp` drive the indicators; the rest is
/// carried along for display.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tick {
    pub symbol: String,
    pub last_price: f64,
    pub bid: Option<f64>,
    pub ask: Option<f64>,
    pub volume: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl Tick {
    /// Tick with only the fields the core needs
    pub fn new(symbol: impl Into<String>, last_price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.into(),
            last_price,
            bid: None,
            ask: None,
            volume: None,
            timestamp,
        }
    }
}

/// Direction emitted by the signal detector
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SignalKind {
    Buy,
    Sell,
    None,
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SignalKind::Buy => "BUY",
            SignalKind::Sell => "SELL",
            SignalKind::None => "NONE",
        };
        f.write_str(label)
    }
}

/// Trading signal produced once per evaluation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Signal {
    pub kind: SignalKind,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

impl Signal {
    pub fn new(kind: SignalKind, price: f64, timestamp: DateTime<Utc>) -> Self {
        Self {
            kind,
            price,
            timestamp,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.kind != SignalKind::None
    }
}

/// Broker-assigned order id
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OrderId(pub i64);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderKind {
    BuyWithTrailingStop,
    TrailingStopChild,
    MarketSell,
}

impl fmt::Display for OrderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderKind::BuyWithTrailingStop => "BUY_WITH_TRAILING_STOP",
            OrderKind::TrailingStopChild => "TRAILING_STOP_CHILD",
            OrderKind::MarketSell => "MARKET_SELL",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Active,
    Filled,
    Canceled,
    Rejected,
}

impl OrderStatus {
    /// FILLED, CANCELED and REJECTED never change again
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Canceled | OrderStatus::Rejected
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::Active => "ACTIVE",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Rejected => "REJECTED",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Instruction string used in broker order legs
    pub fn instruction(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }
}

/// Order record tracked by the registry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Order {
    pub id: OrderId,
    pub parent_id: Option<OrderId>,
    pub kind: OrderKind,
    pub ticker: String,
    pub quantity: u32,
    pub status: OrderStatus,
    pub price_at_creation: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// New order in PENDING status
    pub fn pending(
        id: OrderId,
        parent_id: Option<OrderId>,
        kind: OrderKind,
        ticker: impl Into<String>,
        quantity: u32,
        price_at_creation: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            parent_id,
            kind,
            ticker: ticker.into(),
            quantity,
            status: OrderStatus::Pending,
            price_at_creation,
            created_at: now,
            updated_at: now,
        }
    }
}
