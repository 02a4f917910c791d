use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{LifecyclePhase, OrderLifecycleManager, TickBuffer};
use crate::error::LifecycleError;
use crate::indicators::{BandIndicator, IndicatorSnapshot};
use crate::models::{OrderId, OrderStatus};
use crate::strategy::SignalDetector;

/// Input to the engine actor
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Latest price plus the indicator computed from the same window snapshot
    Evaluation {
        price: f64,
        timestamp: DateTime<Utc>,
        indicators: Option<IndicatorSnapshot>,
    },
    /// A remote status that differs from the registry's
    OrderStatus {
        order_id: OrderId,
        status: OrderStatus,
    },
}

/// Single owner of the detector and the lifecycle
///
/// Signals and status updates arrive on one channel and are handled one at a
/// time, so no two transitions ever interleave.
pub struct TradingEngine {
    detector: SignalDetector,
    manager: OrderLifecycleManager,
}

impl TradingEngine {
    pub fn new(detector: SignalDetector, manager: OrderLifecycleManager) -> Self {
        Self { detector, manager }
    }

    pub fn detector(&self) -> &SignalDetector {
        &self.detector
    }

    pub fn manager(&self) -> &OrderLifecycleManager {
        &self.manager
    }

    pub async fn handle(&mut self, event: EngineEvent) -> Result<(), LifecycleError> {
        let before = self.manager.phase();

        match event {
            EngineEvent::Evaluation {
                price,
                timestamp,
                indicators,
            } => {
                self.manager.resume_pending(price).await?;

                let signal = self.detector.evaluate(price, timestamp, indicators.as_ref());
                if signal.is_actionable() {
                    tracing::info!(
                        ticker = %self.manager.ticker(),
                        signal = %signal.kind,
                        phase = %self.manager.phase(),
                        "🎯 {} signal @ ${:.4}",
                        signal.kind,
                        price
                    );
                }
                self.manager.on_signal(&signal).await?;
            }
            EngineEvent::OrderStatus { order_id, status } => {
                self.manager.on_order_update(order_id, status).await?;
            }
        }

        // A finished cycle starts the detector over; a failed buy does not
        let after = self.manager.phase();
        if before != LifecyclePhase::Idle && after == LifecyclePhase::Idle {
            self.detector.rearm();
            tracing::info!(
                ticker = %self.manager.ticker(),
                "Cycle closed, detector re-armed"
            );
        }
        Ok(())
    }

    /// Process events until the channel closes or a transition is invalid
    pub async fn run(mut self, mut events: mpsc::Receiver<EngineEvent>) -> Result<(), LifecycleError> {
        while let Some(event) = events.recv().await {
            if let Err(err) = self.handle(event).await {
                tracing::error!(
                    ticker = %self.manager.ticker(),
                    error = %err,
                    "Lifecycle invariant violated, stopping engine"
                );
                return Err(err);
            }
        }

        tracing::info!("Event channel closed, engine stopping");
        Ok(())
    }
}

/// Snapshot the buffer and build one evaluation event
///
/// Returns `None` while the buffer is empty or unreadable.
pub fn evaluation_event(buffer: &TickBuffer, indicator: &BandIndicator) -> Option<EngineEvent> {
    let ticks = match buffer.snapshot() {
        Ok(ticks) => ticks,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to snapshot tick buffer");
            return None;
        }
    };
    let latest = ticks.last()?;

    Some(EngineEvent::Evaluation {
        price: latest.last_price,
        timestamp: latest.timestamp,
        indicators: indicator.compute(&ticks),
    })
}

/// Fixed-interval evaluation: buffer -> indicator -> engine
pub async fn run_evaluation_loop(
    buffer: TickBuffer,
    indicator: BandIndicator,
    events: mpsc::Sender<EngineEvent>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(event) = evaluation_event(&buffer, &indicator) else {
            tracing::debug!("No ticks yet, skipping evaluation");
            continue;
        };
        if events.send(event).await.is_err() {
            tracing::info!("Engine stopped, evaluation loop exiting");
            break;
        }
    }
}
