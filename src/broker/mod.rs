// Broker gateway seam: trait, request/ack types, retry combinator, paper broker
pub mod paper;
pub mod retry;

use async_trait::async_trait;
use serde::Serialize;
use std::fmt;

use crate::config::{OrderConfig, StopLinkBasis, StopLinkType};
use crate::error::GatewayError;
use crate::models::{OrderId, OrderStatus, Side};

pub use paper::PaperBroker;
pub use retry::RetryPolicy;

/// Market buy with a linked trailing-stop sell, submitted in one call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BracketRequest {
    pub ticker: String,
    pub quantity: u32,
    pub stop_offset: f64,
    pub stop_link_type: StopLinkType,
    pub stop_link_basis: StopLinkBasis,
}

impl BracketRequest {
    pub fn from_config(ticker: &str, order: &OrderConfig) -> Self {
        Self {
            ticker: ticker.to_string(),
            quantity: order.quantity,
            stop_offset: order.stop_offset,
            stop_link_type: order.stop_link_type,
            stop_link_basis: order.stop_link_basis,
        }
    }
}

/// Ids returned for an accepted bracket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BracketAck {
    pub parent_id: OrderId,
    pub child_id: OrderId,
}

/// Order placement and tracking at the broker
///
/// Every call may fail with a transport, auth, rejection or malformed-response
/// error. Callers go through [`RetryPolicy`] rather than calling directly.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    async fn submit_bracket_order(
        &self,
        request: &BracketRequest,
    ) -> Result<BracketAck, GatewayError>;

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError>;

    async fn submit_market_order(
        &self,
        ticker: &str,
        quantity: u32,
        side: Side,
    ) -> Result<OrderId, GatewayError>;

    async fn get_order_status(&self, order_id: OrderId) -> Result<OrderStatus, GatewayError>;

    async fn reauthenticate(&self) -> Result<(), GatewayError>;
}

/// What a gateway call was trying to do; used in logs and failure notices
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAction {
    SubmitBracket,
    CancelTrailingStop,
    SubmitMarketSell,
    PollStatus,
    FetchQuote,
}

impl fmt::Display for GatewayAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            GatewayAction::SubmitBracket => "submit bracket buy",
            GatewayAction::CancelTrailingStop => "cancel trailing stop",
            GatewayAction::SubmitMarketSell => "submit market sell",
            GatewayAction::PollStatus => "poll order status",
            GatewayAction::FetchQuote => "fetch quote",
        };
        f.write_str(label)
    }
}
