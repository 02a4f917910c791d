use chrono::{DateTime, Utc};

use crate::indicators::IndicatorSnapshot;
use crate::models::{Signal, SignalKind};

/// Band breakout detector with strict BUY/SELL alternation
///
/// - Until the first BUY fires (`armed == false`) only a close below the
///   lower band can produce a signal.
/// - Afterwards a SELL needs a close above the upper band and a BUY a close
///   below the lower band, and neither may repeat the previous signal.
/// - A price exactly on a band is not a crossing.
#[derive(Debug, Clone)]
pub struct SignalDetector {
    last_signal: SignalKind,
    armed: bool,
}

impl Default for SignalDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl SignalDetector {
    pub fn new() -> Self {
        Self {
            last_signal: SignalKind::None,
            armed: false,
        }
    }

    pub fn last_signal(&self) -> SignalKind {
        self.last_signal
    }

    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Evaluate the latest price against a snapshot
    pub fn evaluate(
        &mut self,
        price: f64,
        timestamp: DateTime<Utc>,
        snapshot: Option<&IndicatorSnapshot>,
    ) -> Signal {
        let kind = self.decide(price, snapshot);

        if kind != SignalKind::None {
            self.last_signal = kind;
            self.armed = true;
            tracing::debug!(signal = %kind, price, "Band crossing detected");
        }

        Signal::new(kind, price, timestamp)
    }

    fn decide(&self, price: f64, snapshot: Option<&IndicatorSnapshot>) -> SignalKind {
        let Some(bands) = snapshot.and_then(|s| s.bands) else {
            return SignalKind::None;
        };

        let below_lower = price < bands.lower;
        let above_upper = price > bands.upper;

        if !self.armed {
            return if below_lower {
                SignalKind::Buy
            } else {
                SignalKind::None
            };
        }

        if above_upper && self.last_signal != SignalKind::Sell {
            SignalKind::Sell
        } else if below_lower && self.last_signal != SignalKind::Buy {
            SignalKind::Buy
        } else {
            SignalKind::None
        }
    }

    /// Back to the initial state: the next signal must be a BUY
    pub fn rearm(&mut self) {
        self.last_signal = SignalKind::None;
        self.armed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indicators::{BandIndicator, Bands};

    fn snapshot_with(lower: f64, upper: f64) -> IndicatorSnapshot {
        IndicatorSnapshot {
            ema: (lower + upper) / 2.0,
            bands: Some(Bands {
                upper,
                lower,
                std_dev: (upper - lower) / 2.0,
            }),
            sample_count: 10,
            computed_at: Utc::now(),
        }
    }

    fn feed(detector: &mut SignalDetector, price: f64, snapshot: &IndicatorSnapshot) -> SignalKind {
        detector.evaluate(price, Utc::now(), Some(snapshot)).kind
    }

    #[test]
    fn test_undefined_snapshot_emits_none() {
        let mut detector = SignalDetector::new();
        assert_eq!(
            detector.evaluate(1.0, Utc::now(), None).kind,
            SignalKind::None
        );
    }

    #[test]
    fn test_snapshot_without_bands_emits_none() {
        let mut detector = SignalDetector::new();
        let snapshot = BandIndicator::new(1.7).compute_prices(&[10.0]).unwrap();
        assert_eq!(
            detector.evaluate(1.0, Utc::now(), Some(&snapshot)).kind,
            SignalKind::None
        );
    }

    #[test]
    fn test_no_sell_before_first_buy() {
        let mut detector = SignalDetector::new();
        let snapshot = snapshot_with(95.0, 105.0);

        for price in [106.0, 110.0, 200.0, 100.0, 120.0] {
            assert_eq!(feed(&mut detector, price, &snapshot), SignalKind::None);
        }
        assert!(!detector.is_armed());

        assert_eq!(feed(&mut detector, 94.0, &snapshot), SignalKind::Buy);
        assert!(detector.is_armed());
    }

    #[test]
    fn test_strict_alternation() {
        let mut detector = SignalDetector::new();
        let snapshot = snapshot_with(95.0, 105.0);

        assert_eq!(feed(&mut detector, 94.0, &snapshot), SignalKind::Buy);
        // Staying below the band does not re-fire
        assert_eq!(feed(&mut detector, 93.0, &snapshot), SignalKind::None);
        assert_eq!(feed(&mut detector, 90.0, &snapshot), SignalKind::None);

        assert_eq!(feed(&mut detector, 106.0, &snapshot), SignalKind::Sell);
        assert_eq!(feed(&mut detector, 107.0, &snapshot), SignalKind::None);

        assert_eq!(feed(&mut detector, 94.5, &snapshot), SignalKind::Buy);
    }

    #[test]
    fn test_band_touch_is_not_a_crossing() {
        let mut detector = SignalDetector::new();
        let snapshot = snapshot_with(95.0, 105.0);

        assert_eq!(feed(&mut detector, 95.0, &snapshot), SignalKind::None);
        assert_eq!(feed(&mut detector, 94.99, &snapshot), SignalKind::Buy);
        assert_eq!(feed(&mut detector, 105.0, &snapshot), SignalKind::None);
        assert_eq!(feed(&mut detector, 105.01, &snapshot), SignalKind::Sell);
    }

    #[test]
    fn test_alternation_over_random_walk() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut rng = StdRng::seed_from_u64(7);
        let indicator = BandIndicator::new(1.0);
        let mut detector = SignalDetector::new();
        let mut prices: Vec<f64> = Vec::new();
        let mut price = 100.0;
        let mut emitted = Vec::new();

        for _ in 0..5_000 {
            price += rng.gen_range(-1.0..1.0);
            prices.push(price);
            if prices.len() > 60 {
                prices.remove(0);
            }
            let snapshot = indicator.compute_prices(&prices);
            let signal = detector.evaluate(price, Utc::now(), snapshot.as_ref());
            if signal.is_actionable() {
                emitted.push(signal.kind);
            }
        }

        assert!(!emitted.is_empty());
        assert_eq!(emitted[0], SignalKind::Buy);
        for pair in emitted.windows(2) {
            assert_ne!(pair[0], pair[1], "consecutive {:?} signals", pair[0]);
        }
    }

    #[test]
    fn test_single_buy_on_breakdown_scenario() {
        let indicator = BandIndicator::new(1.2);
        let mut detector = SignalDetector::new();
        let mut window = Vec::new();
        let mut signals = Vec::new();

        for price in [100.0, 99.0, 98.0, 97.0, 94.0] {
            window.push(price);
            let snapshot = indicator.compute_prices(&window);
            signals.push(detector.evaluate(price, Utc::now(), snapshot.as_ref()).kind);
        }

        assert_eq!(
            signals,
            vec![
                SignalKind::None,
                SignalKind::None,
                SignalKind::None,
                SignalKind::None,
                SignalKind::Buy
            ]
        );
    }

    #[test]
    fn test_rearm_requires_buy_again() {
        let mut detector = SignalDetector::new();
        let snapshot = snapshot_with(95.0, 105.0);

        assert_eq!(feed(&mut detector, 94.0, &snapshot), SignalKind::Buy);
        detector.rearm();

        assert_eq!(feed(&mut detector, 110.0, &snapshot), SignalKind::None);
        assert_eq!(feed(&mut detector, 94.0, &snapshot), SignalKind::Buy);
    }
}
