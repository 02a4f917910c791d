use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;

use super::{BracketAck, BracketRequest, BrokerGateway};
use crate::config::StopLinkType;
use crate::error::GatewayError;
use crate::execution::TickBuffer;
use crate::models::{OrderId, OrderStatus, Side};

const FIRST_ORDER_ID: i64 = 1_000;
const TICK_SIZE: f64 = 0.01;

#[derive(Debug, Clone)]
enum PaperOrderKind {
    Market,
    BracketParent,
    TrailingStop {
        link_type: StopLinkType,
        offset: f64,
        high_water: f64,
    },
}

#[derive(Debug, Clone)]
struct PaperOrder {
    kind: PaperOrderKind,
    status: OrderStatus,
}

#[derive(Debug, Default)]
struct PaperBook {
    next_id: i64,
    orders: HashMap<OrderId, PaperOrder>,
}

impl PaperBook {
    fn allocate(&mut self, order: PaperOrder) -> OrderId {
        let id = OrderId(FIRST_ORDER_ID + self.next_id);
        self.next_id += 1;
        self.orders.insert(id, order);
        id
    }
}

/// In-memory broker for dry runs
///
/// Market orders and bracket parents fill at the latest buffered price.
/// Trailing stops track the highest price seen since entry and fill once the
/// latest price drops to the stop level, checked whenever their status is
/// queried.
pub struct PaperBroker {
    prices: TickBuffer,
    book: Mutex<PaperBook>,
}

impl PaperBroker {
    pub fn new(prices: TickBuffer) -> Self {
        Self {
            prices,
            book: Mutex::new(PaperBook::default()),
        }
    }

    fn last_price(&self) -> Result<f64, GatewayError> {
        self.prices
            .latest()
            .map_err(GatewayError::Transport)?
            .map(|t| t.last_price)
            .ok_or_else(|| GatewayError::Rejected {
                status: 400,
                message: "no market data yet".to_string(),
            })
    }

    fn book(&self) -> std::sync::MutexGuard<'_, PaperBook> {
        self.book.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Stop level for a trailing stop given its high-water mark
pub fn trailing_stop_level(link_type: StopLinkType, offset: f64, high_water: f64) -> f64 {
    match link_type {
        StopLinkType::Value => high_water - offset,
        StopLinkType::Percent => high_water * (1.0 - offset / 100.0),
        StopLinkType::Tick => high_water - offset * TICK_SIZE,
    }
}

#[async_trait]
impl BrokerGateway for PaperBroker {
    async fn submit_bracket_order(
        &self,
        request: &BracketRequest,
    ) -> Result<BracketAck, GatewayError> {
        let price = self.last_price()?;
        let mut book = self.book();

        let parent_id = book.allocate(PaperOrder {
            kind: PaperOrderKind::BracketParent,
            status: OrderStatus::Filled,
        });
        let child_id = book.allocate(PaperOrder {
            kind: PaperOrderKind::TrailingStop {
                link_type: request.stop_link_type,
                offset: request.stop_offset,
                high_water: price,
            },
            status: OrderStatus::Active,
        });

        tracing::info!(
            ticker = %request.ticker,
            quantity = request.quantity,
            %parent_id,
            %child_id,
            "[PAPER] Bought @ ${:.4} with trailing stop",
            price
        );

        Ok(BracketAck {
            parent_id,
            child_id,
        })
    }

    async fn cancel_order(&self, order_id: OrderId) -> Result<(), GatewayError> {
        let mut book = self.book();
        let order = book
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| GatewayError::Rejected {
                status: 404,
                message: format!("order {} not found", order_id),
            })?;

        if order.status.is_terminal() {
            return Err(GatewayError::Rejected {
                status: 400,
                message: format!("order {} is already {}", order_id, order.status),
            });
        }

        order.status = OrderStatus::Canceled;
        tracing::info!(%order_id, "[PAPER] Canceled order");
        Ok(())
    }

    async fn submit_market_order(
        &self,
        ticker: &str,
        quantity: u32,
        side: Side,
    ) -> Result<OrderId, GatewayError> {
        let price = self.last_price()?;
        let order_id = self.book().allocate(PaperOrder {
            kind: PaperOrderKind::Market,
            status: OrderStatus::Filled,
        });

        tracing::info!(
            %ticker,
            quantity,
            side = side.instruction(),
            %order_id,
            "[PAPER] Market order filled @ ${:.4}",
            price
        );
        Ok(order_id)
    }

    async fn get_order_status(&self, order_id: OrderId) -> Result<OrderStatus, GatewayError> {
        let latest = self.prices.latest().map_err(GatewayError::Transport)?;
        let mut book = self.book();
        let order = book
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| GatewayError::Rejected {
                status: 404,
                message: format!("order {} not found", order_id),
            })?;

        if let (
            PaperOrderKind::TrailingStop {
                link_type,
                offset,
                high_water,
            },
            OrderStatus::Active,
            Some(tick),
        ) = (&mut order.kind, order.status, latest)
        {
            *high_water = high_water.max(tick.last_price);
            let stop = trailing_stop_level(*link_type, *offset, *high_water);
            if tick.last_price <= stop {
                order.status = OrderStatus::Filled;
                tracing::info!(
                    %order_id,
                    "[PAPER] Trailing stop hit @ ${:.4} (stop ${:.4})",
                    tick.last_price,
                    stop
                );
            }
        }

        Ok(order.status)
    }

    async fn reauthenticate(&self) -> Result<(), GatewayError> {
        Ok(())
    }
}
