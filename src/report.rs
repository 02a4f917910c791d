// Periodic read-only status summary
use std::fmt;
use std::time::Duration;
use tokio::sync::watch;

use crate::execution::{LifecycleView, OrderRegistry, TickBuffer};
use crate::indicators::{BandIndicator, IndicatorSnapshot};
use crate::models::{Order, Tick};

/// How far the last price has travelled from the EMA toward a band
///
/// Deep means more than 75% of the way, or on/past the band. Medium is
/// over 50% and light over 25%; anything closer is neutral.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandProximity {
    AtEma,
    DeepAbove,
    MediumAbove,
    LightAbove,
    Neutral,
    LightBelow,
    MediumBelow,
    DeepBelow,
}

impl BandProximity {
    /// Grade `price` against a snapshot; `None` until bands exist
    pub fn classify(price: f64, snapshot: &IndicatorSnapshot) -> Option<Self> {
        let bands = snapshot.bands?;
        let ema = snapshot.ema;

        if price == ema {
            return Some(BandProximity::AtEma);
        }
        if price >= bands.upper {
            return Some(BandProximity::DeepAbove);
        }
        if price <= bands.lower {
            return Some(BandProximity::DeepBelow);
        }

        // Strictly inside the bands, so neither denominator is zero
        let proximity = if price > ema {
            (price - ema) / (bands.upper - ema)
        } else {
            (ema - price) / (ema - bands.lower)
        };
        let above = price > ema;

        let grade = if proximity > 0.75 {
            if above {
                BandProximity::DeepAbove
            } else {
                BandProximity::DeepBelow
            }
        } else if proximity > 0.5 {
            if above {
                BandProximity::MediumAbove
            } else {
                BandProximity::MediumBelow
            }
        } else if proximity > 0.25 {
            if above {
                BandProximity::LightAbove
            } else {
                BandProximity::LightBelow
            }
        } else {
            BandProximity::Neutral
        };
        Some(grade)
    }
}

impl fmt::Display for BandProximity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            BandProximity::AtEma => "⚫ at EMA",
            BandProximity::DeepAbove => "🔴 deep above",
            BandProximity::MediumAbove => "🟠 medium above",
            BandProximity::LightAbove => "🟡 light above",
            BandProximity::Neutral => "⚪ neutral",
            BandProximity::LightBelow => "🟢 light below",
            BandProximity::MediumBelow => "🟢 medium below",
            BandProximity::DeepBelow => "💚 deep below",
        };
        f.write_str(label)
    }
}

/// Everything one report shows, gathered without touching core state
#[derive(Debug, Clone)]
pub struct StatusSnapshot {
    pub latest: Option<Tick>,
    pub indicators: Option<IndicatorSnapshot>,
    pub proximity: Option<BandProximity>,
    pub lifecycle: LifecycleView,
    pub in_flight: Vec<Order>,
}

pub struct StatusReporter {
    ticker: String,
    buffer: TickBuffer,
    indicator: BandIndicator,
    registry: OrderRegistry,
    lifecycle: watch::Receiver<LifecycleView>,
}

impl StatusReporter {
    pub fn new(
        ticker: impl Into<String>,
        buffer: TickBuffer,
        indicator: BandIndicator,
        registry: OrderRegistry,
        lifecycle: watch::Receiver<LifecycleView>,
    ) -> Self {
        Self {
            ticker: ticker.into(),
            buffer,
            indicator,
            registry,
            lifecycle,
        }
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let ticks = self.buffer.snapshot().unwrap_or_default();
        let in_flight = self
            .registry
            .in_flight()
            .into_iter()
            .filter_map(|id| self.registry.get(id))
            .collect();

        let latest = ticks.last().cloned();
        let indicators = self.indicator.compute(&ticks);
        let proximity = match (&latest, &indicators) {
            (Some(tick), Some(snapshot)) => BandProximity::classify(tick.last_price, snapshot),
            _ => None,
        };

        StatusSnapshot {
            latest,
            indicators,
            proximity,
            lifecycle: self.lifecycle.borrow().clone(),
            in_flight,
        }
    }

    pub fn report(&self) {
        let status = self.snapshot();

        match &status.latest {
            Some(tick) => tracing::info!(
                ticker = %self.ticker,
                phase = %status.lifecycle.phase,
                "📊 {} @ ${:.4} ({})",
                tick.symbol,
                tick.last_price,
                tick.timestamp.format("%H:%M:%S")
            ),
            None => tracing::info!(
                ticker = %self.ticker,
                phase = %status.lifecycle.phase,
                "📊 Waiting for first tick"
            ),
        }

        if let Some(snapshot) = &status.indicators {
            match snapshot.bands {
                Some(bands) => tracing::info!(
                    "  EMA ${:.4} | bands ${:.4} / ${:.4} (k={}) | n={}",
                    snapshot.ema,
                    bands.lower,
                    bands.upper,
                    self.indicator.multiplier(),
                    snapshot.sample_count
                ),
                None => tracing::info!(
                    "  EMA ${:.4} | bands pending | n={}",
                    snapshot.ema,
                    snapshot.sample_count
                ),
            }
        }

        if let Some(proximity) = status.proximity {
            tracing::info!("  Last price {}", proximity);
        }

        if let Some(cycle) = &status.lifecycle.cycle {
            tracing::info!(
                "  Cycle {} entered @ ${:.4} (parent {}, stop {})",
                cycle.id,
                cycle.entry_price,
                cycle.parent_id,
                cycle.child_id
            );
        }

        for order in &status.in_flight {
            tracing::info!("  ⏳ {} {} {}", order.id, order.kind, order.status);
        }

        if let Some(failure) = &status.lifecycle.last_failure {
            tracing::warn!(
                "  Last failure at {}: {}",
                failure.at.format("%H:%M:%S"),
                failure
            );
        }
    }

    pub async fn run(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            self.report();
        }
    }
}
