use chrono::{DateTime, Utc};
use serde::Serialize;

use super::moving_average::{calculate_std_dev, calculate_weighted_ema};
use crate::models::Tick;

/// Volatility bands around the average
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Bands {
    pub upper: f64,
    pub lower: f64,
    pub std_dev: f64,
}

/// Indicator values derived from one window snapshot
///
/// `bands` is `None` until the window holds at least two ticks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndicatorSnapshot {
    pub ema: f64,
    pub bands: Option<Bands>,
    pub sample_count: usize,
    pub computed_at: DateTime<Utc>,
}

/// EMA with `ema ± k·σ` bands, recomputed from the whole window each call
#[derive(Debug, Clone, Copy)]
pub struct BandIndicator {
    multiplier: f64,
}

impl BandIndicator {
    pub fn new(multiplier: f64) -> Self {
        Self { multiplier }
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    /// Compute a fresh snapshot; `None` for an empty window
    pub fn compute(&self, window: &[Tick]) -> Option<IndicatorSnapshot> {
        let prices: Vec<f64> = window.iter().map(|t| t.last_price).collect();
        self.compute_prices(&prices)
    }

    pub fn compute_prices(&self, prices: &[f64]) -> Option<IndicatorSnapshot> {
        let ema = calculate_weighted_ema(prices)?;
        let bands = calculate_std_dev(prices).map(|std_dev| Bands {
            upper: ema + self.multiplier * std_dev,
            lower: ema - self.multiplier * std_dev,
            std_dev,
        });

        Some(IndicatorSnapshot {
            ema,
            bands,
            sample_count: prices.len(),
            computed_at: Utc::now(),
        })
    }
}
