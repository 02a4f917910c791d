use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use super::OrderRegistry;
use crate::audit::{AuditEntry, AuditSink};
use crate::broker::{BracketRequest, BrokerGateway, GatewayAction, RetryPolicy};
use crate::config::OrderConfig;
use crate::error::{FailureKind, GatewayError, LifecycleError};
use crate::models::{Order, OrderId, OrderKind, OrderStatus, Side, Signal, SignalKind};

/// One buy -> protect -> flat traversal
#[derive(Debug, Clone, PartialEq)]
pub struct Cycle {
    pub id: Uuid,
    pub parent_id: OrderId,
    pub child_id: OrderId,
    pub entry_price: f64,
    pub opened_at: DateTime<Utc>,
}

impl Cycle {
    fn new(parent_id: OrderId, child_id: OrderId, entry_price: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            parent_id,
            child_id,
            entry_price,
            opened_at: Utc::now(),
        }
    }
}

/// Authoritative lifecycle state, carrying the ids it depends on
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleState {
    Idle,
    BuySubmitted,
    TrailingStopActive(Cycle),
    /// Trailing stop cancel requested; once confirmed, a market sell is owed
    CancelRequested(Cycle),
    SellSubmitted { cycle: Cycle, sell_id: OrderId },
}

impl LifecycleState {
    pub fn phase(&self) -> LifecyclePhase {
        match self {
            LifecycleState::Idle => LifecyclePhase::Idle,
            LifecycleState::BuySubmitted => LifecyclePhase::BuySubmitted,
            LifecycleState::TrailingStopActive(_) => LifecyclePhase::TrailingStopActive,
            LifecycleState::CancelRequested(_) => LifecyclePhase::CancelRequested,
            LifecycleState::SellSubmitted { .. } => LifecyclePhase::SellSubmitted,
        }
    }

    pub fn cycle(&self) -> Option<&Cycle> {
        match self {
            LifecycleState::Idle | LifecycleState::BuySubmitted => None,
            LifecycleState::TrailingStopActive(cycle)
            | LifecycleState::CancelRequested(cycle)
            | LifecycleState::SellSubmitted { cycle, .. } => Some(cycle),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Idle,
    BuySubmitted,
    TrailingStopActive,
    CancelRequested,
    SellSubmitted,
}

impl LifecyclePhase {
    pub fn can_transition_to(self, next: LifecyclePhase) -> bool {
        use LifecyclePhase::*;
        matches!(
            (self, next),
            (Idle, BuySubmitted)
                | (BuySubmitted, TrailingStopActive)
                | (BuySubmitted, Idle)
                | (TrailingStopActive, Idle)
                | (TrailingStopActive, CancelRequested)
                | (CancelRequested, SellSubmitted)
                | (CancelRequested, TrailingStopActive)
                | (SellSubmitted, Idle)
                | (SellSubmitted, CancelRequested)
        )
    }
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            LifecyclePhase::Idle => "IDLE",
            LifecyclePhase::BuySubmitted => "BUY_SUBMITTED",
            LifecyclePhase::TrailingStopActive => "TRAILING_STOP_ACTIVE",
            LifecyclePhase::CancelRequested => "CANCEL_REQUESTED",
            LifecyclePhase::SellSubmitted => "SELL_SUBMITTED",
        };
        f.write_str(label)
    }
}

/// Operator-facing record of a failed gateway attempt
#[derive(Debug, Clone, PartialEq)]
pub struct FailureNotice {
    pub ticker: String,
    pub action: GatewayAction,
    pub kind: FailureKind,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl fmt::Display for FailureNotice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} failed ({}): {}",
            self.ticker, self.action, self.kind, self.message
        )
    }
}

/// Read-only view published for presentation
#[derive(Debug, Clone, PartialEq)]
pub struct LifecycleView {
    pub phase: LifecyclePhase,
    pub cycle: Option<Cycle>,
    pub last_failure: Option<FailureNotice>,
}

/// Order lifecycle state machine for one ticker
///
/// Every transition goes through [`OrderLifecycleManager::transition`],
/// which rejects edges outside the lifecycle table. The manager is meant to
/// be owned by a single task; see `TradingEngine`.
pub struct OrderLifecycleManager {
    ticker: String,
    order: OrderConfig,
    gateway: Arc<dyn BrokerGateway>,
    registry: OrderRegistry,
    retry: RetryPolicy,
    audit: Arc<dyn AuditSink>,
    state: LifecycleState,
    last_price: f64,
    last_failure: Option<FailureNotice>,
    view: watch::Sender<LifecycleView>,
}

impl OrderLifecycleManager {
    pub fn new(
        ticker: impl Into<String>,
        order: OrderConfig,
        gateway: Arc<dyn BrokerGateway>,
        registry: OrderRegistry,
        retry: RetryPolicy,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let (view, _) = watch::channel(LifecycleView {
            phase: LifecyclePhase::Idle,
            cycle: None,
            last_failure: None,
        });

        Self {
            ticker: ticker.into(),
            order,
            gateway,
            registry,
            retry,
            audit,
            state: LifecycleState::Idle,
            last_price: 0.0,
            last_failure: None,
            view,
        }
    }

    pub fn ticker(&self) -> &str {
        &self.ticker
    }

    pub fn state(&self) -> &LifecycleState {
        &self.state
    }

    pub fn phase(&self) -> LifecyclePhase {
        self.state.phase()
    }

    pub fn last_failure(&self) -> Option<&FailureNotice> {
        self.last_failure.as_ref()
    }

    pub fn registry(&self) -> &OrderRegistry {
        &self.registry
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleView> {
        self.view.subscribe()
    }

    /// React to a detector signal
    ///
    /// BUY opens a cycle only from IDLE; SELL closes one only from
    /// TRAILING_STOP_ACTIVE. Anything else is ignored.
    pub async fn on_signal(&mut self, signal: &Signal) -> Result<(), LifecycleError> {
        self.last_price = signal.price;

        match (signal.kind, self.phase()) {
            (SignalKind::None, _) => Ok(()),
            (SignalKind::Buy, LifecyclePhase::Idle) => self.open_cycle(signal.price).await,
            (SignalKind::Sell, LifecyclePhase::TrailingStopActive) => {
                match self.state.cycle().cloned() {
                    Some(cycle) => self.close_cycle(cycle).await,
                    None => Ok(()),
                }
            }
            (kind, phase) => {
                tracing::debug!(
                    ticker = %self.ticker,
                    signal = %kind,
                    %phase,
                    "Ignoring signal in current phase"
                );
                Ok(())
            }
        }
    }

    /// Retry the market sell owed after a confirmed cancel, if any
    pub async fn resume_pending(&mut self, price: f64) -> Result<(), LifecycleError> {
        self.last_price = price;

        if let LifecycleState::CancelRequested(cycle) = &self.state {
            let cycle = cycle.clone();
            tracing::info!(
                ticker = %self.ticker,
                cycle = %cycle.id,
                "Retrying owed market sell"
            );
            self.submit_sell(cycle).await?;
        }
        Ok(())
    }

    /// Apply a remote status reported by the poller
    pub async fn on_order_update(
        &mut self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<(), LifecycleError> {
        let change = match self.registry.reconcile(order_id, status)? {
            Some(change) => change,
            None => return Ok(()),
        };

        tracing::info!(
            ticker = %self.ticker,
            %order_id,
            kind = %change.kind,
            "Order {} -> {}",
            change.previous,
            change.current
        );

        match &self.state {
            LifecycleState::TrailingStopActive(cycle) if order_id == cycle.child_id => {
                let cycle = cycle.clone();
                match status {
                    OrderStatus::Filled => {
                        tracing::info!(
                            ticker = %self.ticker,
                            cycle = %cycle.id,
                            "Trailing stop filled, cycle complete"
                        );
                        self.transition(LifecycleState::Idle)
                    }
                    OrderStatus::Canceled | OrderStatus::Rejected => {
                        tracing::warn!(
                            ticker = %self.ticker,
                            cycle = %cycle.id,
                            %order_id,
                            "Trailing stop {} by broker, position unprotected; selling",
                            status
                        );
                        self.transition(LifecycleState::CancelRequested(cycle.clone()))?;
                        self.submit_sell(cycle).await
                    }
                    _ => Ok(()),
                }
            }
            LifecycleState::TrailingStopActive(cycle)
                if order_id == cycle.parent_id
                    && matches!(status, OrderStatus::Canceled | OrderStatus::Rejected) =>
            {
                tracing::warn!(
                    ticker = %self.ticker,
                    cycle = %cycle.id,
                    %order_id,
                    "Bracket buy {}, no position opened",
                    status
                );
                self.transition(LifecycleState::Idle)
            }
            LifecycleState::SellSubmitted { cycle, sell_id } if order_id == *sell_id => {
                let cycle = cycle.clone();
                match status {
                    OrderStatus::Filled => {
                        tracing::info!(
                            ticker = %self.ticker,
                            cycle = %cycle.id,
                            "Market sell filled, cycle complete"
                        );
                        self.transition(LifecycleState::Idle)
                    }
                    OrderStatus::Canceled | OrderStatus::Rejected => {
                        tracing::warn!(
                            ticker = %self.ticker,
                            cycle = %cycle.id,
                            %order_id,
                            "Market sell {}, will retry",
                            status
                        );
                        self.transition(LifecycleState::CancelRequested(cycle))
                    }
                    _ => Ok(()),
                }
            }
            _ => Ok(()),
        }
    }

    async fn open_cycle(&mut self, price: f64) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::BuySubmitted)?;

        let request = BracketRequest::from_config(&self.ticker, &self.order);
        let result = {
            let gateway = self.gateway.as_ref();
            let request = &request;
            self.retry
                .run(gateway, GatewayAction::SubmitBracket, move || {
                    gateway.submit_bracket_order(request)
                })
                .await
        };
        let payload = serde_json::to_value(&request).unwrap_or_default();

        match result {
            Ok(ack) => {
                self.registry.register(Order::pending(
                    ack.parent_id,
                    None,
                    OrderKind::BuyWithTrailingStop,
                    &self.ticker,
                    self.order.quantity,
                    price,
                ))?;
                self.registry.register(Order::pending(
                    ack.child_id,
                    Some(ack.parent_id),
                    OrderKind::TrailingStopChild,
                    &self.ticker,
                    self.order.quantity,
                    price,
                ))?;
                self.record_audit(
                    "Buy",
                    payload,
                    Some(serde_json::to_value(ack).unwrap_or_default()),
                );

                let cycle = Cycle::new(ack.parent_id, ack.child_id, price);
                tracing::info!(
                    ticker = %self.ticker,
                    cycle = %cycle.id,
                    parent_id = %ack.parent_id,
                    child_id = %ack.child_id,
                    "📈 Bought {} @ ${:.4} with trailing stop",
                    self.order.quantity,
                    price
                );
                self.transition(LifecycleState::TrailingStopActive(cycle))
            }
            Err(err) => {
                if let Some(order_id) = err.accepted_order_id() {
                    self.registry.register(Order::pending(
                        order_id,
                        None,
                        OrderKind::BuyWithTrailingStop,
                        &self.ticker,
                        self.order.quantity,
                        price,
                    ))?;
                    tracing::warn!(
                        ticker = %self.ticker,
                        %order_id,
                        "Bracket outcome unknown, tracking accepted order"
                    );
                }
                self.fail(GatewayAction::SubmitBracket, &err, payload);
                self.transition(LifecycleState::Idle)
            }
        }
    }

    async fn close_cycle(&mut self, cycle: Cycle) -> Result<(), LifecycleError> {
        self.transition(LifecycleState::CancelRequested(cycle.clone()))?;

        let child_id = cycle.child_id;
        let result = {
            let gateway = self.gateway.as_ref();
            self.retry
                .run(gateway, GatewayAction::CancelTrailingStop, move || {
                    gateway.cancel_order(child_id)
                })
                .await
        };
        let payload = json!({ "order_id": child_id.0 });

        match result {
            Ok(()) => {
                self.record_audit("Cancel", payload, Some(json!({ "status": "canceled" })));
                tracing::info!(
                    ticker = %self.ticker,
                    cycle = %cycle.id,
                    %child_id,
                    "Trailing stop canceled"
                );
                self.submit_sell(cycle).await
            }
            Err(err) => {
                // The trailing stop may still be live, so keep it as protection
                self.fail(GatewayAction::CancelTrailingStop, &err, payload);
                self.transition(LifecycleState::TrailingStopActive(cycle))
            }
        }
    }

    /// Submit the market sell; requires CANCEL_REQUESTED
    async fn submit_sell(&mut self, cycle: Cycle) -> Result<(), LifecycleError> {
        let ticker = self.ticker.as_str();
        let quantity = self.order.quantity;
        let result = {
            let gateway = self.gateway.as_ref();
            self.retry
                .run(gateway, GatewayAction::SubmitMarketSell, move || {
                    gateway.submit_market_order(ticker, quantity, Side::Sell)
                })
                .await
        };
        let payload = json!({
            "ticker": self.ticker,
            "quantity": quantity,
            "side": Side::Sell.instruction(),
            "order_type": "MARKET",
        });

        let sell_id = match result {
            Ok(sell_id) => {
                self.record_audit("Sell", payload, Some(json!({ "order_id": sell_id.0 })));
                sell_id
            }
            Err(err) => {
                self.fail(GatewayAction::SubmitMarketSell, &err, payload);
                match err.accepted_order_id() {
                    // Accepted even though the response went bad; track it
                    // instead of selling a second time
                    Some(sell_id) => sell_id,
                    None => return Ok(()),
                }
            }
        };

        self.registry.register(Order::pending(
            sell_id,
            Some(cycle.parent_id),
            OrderKind::MarketSell,
            &self.ticker,
            quantity,
            self.last_price,
        ))?;
        tracing::info!(
            ticker = %self.ticker,
            cycle = %cycle.id,
            %sell_id,
            "📉 Market sell submitted for {} @ ~${:.4}",
            quantity,
            self.last_price
        );
        self.transition(LifecycleState::SellSubmitted { cycle, sell_id })
    }

    /// The only place `state` is assigned
    fn transition(&mut self, next: LifecycleState) -> Result<(), LifecycleError> {
        let from = self.state.phase();
        let to = next.phase();

        if !from.can_transition_to(to) {
            tracing::error!(ticker = %self.ticker, %from, %to, "Invalid lifecycle transition");
            return Err(LifecycleError::StateConflict {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        tracing::debug!(ticker = %self.ticker, %from, %to, "Lifecycle transition");
        self.state = next;
        self.publish();
        Ok(())
    }

    fn fail(&mut self, action: GatewayAction, err: &GatewayError, payload: Value) {
        let notice = FailureNotice {
            ticker: self.ticker.clone(),
            action,
            kind: err.kind(),
            message: err.to_string(),
            at: Utc::now(),
        };

        tracing::error!(
            ticker = %notice.ticker,
            %action,
            kind = %notice.kind,
            phase = %self.phase(),
            "❌ {}",
            notice
        );
        self.record_audit(
            &format!("Failed {}", action),
            payload,
            Some(json!({ "error": notice.message, "kind": notice.kind.to_string() })),
        );

        self.last_failure = Some(notice);
        self.publish();
    }

    fn record_audit(&self, action: &str, payload: Value, response: Option<Value>) {
        self.audit
            .record(AuditEntry::new(action, &self.ticker, payload, response));
    }

    fn publish(&self) {
        self.view.send_replace(LifecycleView {
            phase: self.state.phase(),
            cycle: self.state.cycle().cloned(),
            last_failure: self.last_failure.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::broker::PaperBroker;
    use crate::execution::TickBuffer;
    use crate::models::Tick;
    use std::time::Duration;

    fn manager_with_price(price: Option<f64>) -> (OrderLifecycleManager, Arc<MemoryAuditSink>) {
        let buffer = TickBuffer::new(10);
        if let Some(price) = price {
            buffer.append(Tick::new("SQQQ", price, Utc::now())).unwrap();
        }
        let audit = Arc::new(MemoryAuditSink::new());
        let manager = OrderLifecycleManager::new(
            "SQQQ",
            OrderConfig::default(),
            Arc::new(PaperBroker::new(buffer)),
            OrderRegistry::new(),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(1)),
            audit.clone(),
        );
        (manager, audit)
    }

    #[test]
    fn test_transition_table() {
        use LifecyclePhase::*;
        assert!(Idle.can_transition_to(BuySubmitted));
        assert!(CancelRequested.can_transition_to(TrailingStopActive));
        assert!(SellSubmitted.can_transition_to(CancelRequested));

        assert!(!Idle.can_transition_to(SellSubmitted));
        assert!(!Idle.can_transition_to(CancelRequested));
        assert!(!BuySubmitted.can_transition_to(CancelRequested));
        assert!(!TrailingStopActive.can_transition_to(SellSubmitted));
        assert!(!Idle.can_transition_to(Idle));
    }

    #[test]
    fn test_invalid_transition_is_state_conflict() {
        let (mut manager, _) = manager_with_price(None);
        let err = manager
            .transition(LifecycleState::CancelRequested(Cycle::new(
                OrderId(1),
                OrderId(2),
                10.0,
            )))
            .unwrap_err();

        assert_eq!(
            err,
            LifecycleError::StateConflict {
                from: "IDLE".into(),
                to: "CANCEL_REQUESTED".into()
            }
        );
        assert_eq!(manager.phase(), LifecyclePhase::Idle);
    }

    #[tokio::test]
    async fn test_buy_opens_cycle_and_publishes_view() {
        let (mut manager, audit) = manager_with_price(Some(10.0));
        let view = manager.subscribe();

        manager
            .on_signal(&Signal::new(SignalKind::Buy, 10.0, Utc::now()))
            .await
            .unwrap();

        assert_eq!(manager.phase(), LifecyclePhase::TrailingStopActive);
        let cycle = manager.state().cycle().unwrap().clone();
        assert_eq!(manager.registry().len(), 2);
        assert_eq!(
            manager.registry().get(cycle.child_id).unwrap().parent_id,
            Some(cycle.parent_id)
        );
        assert_eq!(view.borrow().phase, LifecyclePhase::TrailingStopActive);
        assert_eq!(audit.entries()[0].action, "Buy");
    }

    #[tokio::test]
    async fn test_rejected_buy_returns_to_idle_with_notice() {
        // No market data, so the paper broker rejects the bracket
        let (mut manager, audit) = manager_with_price(None);

        manager
            .on_signal(&Signal::new(SignalKind::Buy, 10.0, Utc::now()))
            .await
            .unwrap();

        assert_eq!(manager.phase(), LifecyclePhase::Idle);
        assert!(manager.registry().is_empty());
        let notice = manager.last_failure().unwrap();
        assert_eq!(notice.action, GatewayAction::SubmitBracket);
        assert_eq!(notice.kind, FailureKind::Rejected(400));
        assert_eq!(audit.entries()[0].action, "Failed submit bracket buy");
    }

    #[tokio::test]
    async fn test_sell_cancels_stop_and_sells() {
        let (mut manager, _) = manager_with_price(Some(10.0));
        let now = Utc::now();

        manager
            .on_signal(&Signal::new(SignalKind::Buy, 10.0, now))
            .await
            .unwrap();
        let child_id = manager.state().cycle().unwrap().child_id;

        manager
            .on_signal(&Signal::new(SignalKind::Sell, 10.5, now))
            .await
            .unwrap();

        let sell_id = match manager.state() {
            LifecycleState::SellSubmitted { sell_id, .. } => *sell_id,
            other => panic!("unexpected state {:?}", other),
        };
        assert_eq!(
            manager.registry().get(sell_id).unwrap().kind,
            OrderKind::MarketSell
        );

        // Poller reports our own cancel, then the sell fill
        manager
            .on_order_update(child_id, OrderStatus::Canceled)
            .await
            .unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::SellSubmitted);

        manager
            .on_order_update(sell_id, OrderStatus::Filled)
            .await
            .unwrap();
        assert_eq!(manager.phase(), LifecyclePhase::Idle);
    }
}
