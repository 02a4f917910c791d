use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;

use super::{EngineEvent, OrderRegistry};
use crate::broker::{BrokerGateway, GatewayAction, RetryPolicy};

/// Periodic status refresh for every in-flight order
///
/// Reads the registry, asks the broker, and forwards differing statuses to
/// the engine. It never writes the registry itself.
pub struct OrderPoller {
    registry: OrderRegistry,
    gateway: Arc<dyn BrokerGateway>,
    retry: RetryPolicy,
    events: mpsc::Sender<EngineEvent>,
    interval: Duration,
}

impl OrderPoller {
    pub fn new(
        registry: OrderRegistry,
        gateway: Arc<dyn BrokerGateway>,
        retry: RetryPolicy,
        events: mpsc::Sender<EngineEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            gateway,
            retry,
            events,
            interval,
        }
    }

    /// Poll each in-flight order once; returns how many updates were sent
    pub async fn poll_once(&self) -> Result<usize, SendError<EngineEvent>> {
        let mut sent = 0;

        for order_id in self.registry.in_flight() {
            let local = self.registry.status(order_id);
            let gateway = self.gateway.as_ref();
            let remote = self
                .retry
                .run(gateway, GatewayAction::PollStatus, move || {
                    gateway.get_order_status(order_id)
                })
                .await;

            match remote {
                Ok(status) if Some(status) != local => {
                    self.events
                        .send(EngineEvent::OrderStatus { order_id, status })
                        .await?;
                    sent += 1;
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(
                        %order_id,
                        action = %GatewayAction::PollStatus,
                        kind = %err.kind(),
                        error = %err,
                        "Status poll failed"
                    );
                }
            }
        }

        Ok(sent)
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if self.poll_once().await.is_err() {
                tracing::info!("Engine stopped, order poller exiting");
                break;
            }
        }
    }
}
