use async_trait::async_trait;
use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::TickBuffer;
use crate::api::SchwabClient;
use crate::broker::{GatewayAction, RetryPolicy};
use crate::models::Tick;
use crate::Result;

/// Where ticks come from
#[async_trait]
pub trait QuoteSource: Send {
    async fn next_tick(&mut self) -> Result<Tick>;
}

/// Live quotes from the Schwab market data endpoint
pub struct SchwabQuoteSource {
    client: Arc<SchwabClient>,
    ticker: String,
    retry: RetryPolicy,
}

impl SchwabQuoteSource {
    pub fn new(client: Arc<SchwabClient>, ticker: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            client,
            ticker: ticker.into(),
            retry,
        }
    }
}

#[async_trait]
impl QuoteSource for SchwabQuoteSource {
    async fn next_tick(&mut self) -> Result<Tick> {
        let client = self.client.as_ref();
        let ticker = self.ticker.as_str();
        let tick = self
            .retry
            .run(client, GatewayAction::FetchQuote, move || {
                client.fetch_quote(ticker)
            })
            .await?;
        Ok(tick)
    }
}

/// Seeded random walk for paper trading and tests
pub struct SyntheticQuoteSource {
    ticker: String,
    price: f64,
    step: f64,
    rng: StdRng,
}

impl SyntheticQuoteSource {
    /// `step` is the largest relative move per tick (0.002 = 0.2%)
    pub fn new(ticker: impl Into<String>, start_price: f64, step: f64, seed: u64) -> Self {
        Self {
            ticker: ticker.into(),
            price: start_price,
            step: step.abs(),
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

#[async_trait]
impl QuoteSource for SyntheticQuoteSource {
    async fn next_tick(&mut self) -> Result<Tick> {
        if self.step > 0.0 {
            let change = self.rng.gen_range(-self.step..=self.step);
            self.price = (self.price * (1.0 + change)).max(0.01);
        }

        let mut tick = Tick::new(&self.ticker, self.price, Utc::now());
        tick.bid = Some(self.price - 0.01);
        tick.ask = Some(self.price + 0.01);
        Ok(tick)
    }
}

/// Pull ticks from `source` every `every` and push them into the channel
///
/// Feed errors are logged and the source is asked again on the next tick.
/// Returns when the receiving side is gone.
pub async fn run_ingestion(
    mut source: Box<dyn QuoteSource>,
    ticks: mpsc::Sender<Tick>,
    every: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match source.next_tick().await {
            Ok(tick) => {
                tracing::debug!(symbol = %tick.symbol, price = tick.last_price, "Received tick");
                if ticks.send(tick).await.is_err() {
                    tracing::info!("Tick writer stopped, ingestion exiting");
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Quote feed error");
            }
        }
    }
}

/// The tick buffer's only writer
pub async fn run_tick_writer(mut ticks: mpsc::Receiver<Tick>, buffer: TickBuffer) {
    while let Some(tick) = ticks.recv().await {
        if let Err(e) = buffer.append(tick) {
            tracing::error!(error = %e, "Failed to append tick");
        }
    }
    tracing::info!("Tick channel closed, writer exiting");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_synthetic_source_is_deterministic() {
        let mut a = SyntheticQuoteSource::new("SQQQ", 10.0, 0.01, 7);
        let mut b = SyntheticQuoteSource::new("SQQQ", 10.0, 0.01, 7);

        for _ in 0..20 {
            let ta = a.next_tick().await.unwrap();
            let tb = b.next_tick().await.unwrap();
            assert_eq!(ta.last_price, tb.last_price);
            assert!(ta.last_price > 0.0);
        }
    }

    #[tokio::test]
    async fn test_synthetic_source_moves_within_step() {
        let mut source = SyntheticQuoteSource::new("SQQQ", 100.0, 0.01, 42);
        let mut previous = 100.0;

        for _ in 0..50 {
            let tick = source.next_tick().await.unwrap();
            assert!((tick.last_price / previous - 1.0).abs() <= 0.01 + 1e-12);
            previous = tick.last_price;
        }
    }

    #[tokio::test]
    async fn test_ingestion_feeds_the_buffer() {
        let buffer = TickBuffer::new(5);
        let (tx, rx) = mpsc::channel(16);

        let writer = tokio::spawn(run_tick_writer(rx, buffer.clone()));
        let source = Box::new(SyntheticQuoteSource::new("SQQQ", 10.0, 0.0, 1));
        let ingestion = tokio::spawn(run_ingestion(source, tx, Duration::from_millis(1)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        ingestion.abort();
        let _ = ingestion.await;
        // Sender dropped with the aborted task, so the writer finishes
        writer.await.unwrap();

        assert_eq!(buffer.len().unwrap(), 5);
        assert_eq!(buffer.latest().unwrap().unwrap().last_price, 10.0);
    }
}
