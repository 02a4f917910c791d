use rand::Rng;
use std::future::Future;
use std::time::Duration;

use super::{BrokerGateway, GatewayAction};
use crate::config::RetryConfig;
use crate::error::GatewayError;

/// Bounded retry with exponential backoff and one re-authentication
///
/// - Transport errors are retried until `max_attempts` calls have been made,
///   sleeping `min(max_delay, base_delay * 2^n)` (± jitter) in between.
/// - The first auth error triggers one `reauthenticate()` and an immediate
///   retry that does not count against the budget; a second auth error is
///   final.
/// - Rejections and malformed responses are returned at once.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            jitter_factor: 0.0,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
        .with_jitter(0.1)
    }

    /// Jitter as a fraction of the delay; negative values are clamped to 0
    pub fn with_jitter(mut self, jitter_factor: f64) -> Self {
        self.jitter_factor = jitter_factor.clamp(0.0, 1.0);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp_delay = self.base_delay.saturating_mul(2u32.saturating_pow(retry));
        let capped = exp_delay.min(self.max_delay);

        let jitter_range = capped.as_secs_f64() * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_secs_f64((capped.as_secs_f64() + jitter).max(0.0))
    }

    /// Run `call` under this policy
    pub async fn run<T, F, Fut>(
        &self,
        gateway: &dyn BrokerGateway,
        action: GatewayAction,
        mut call: F,
    ) -> Result<T, GatewayError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, GatewayError>>,
    {
        let mut attempt = 1;
        let mut reauthenticated = false;

        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(GatewayError::Auth(message)) if !reauthenticated => {
                    tracing::warn!(%action, %message, "Credentials rejected, re-authenticating");
                    reauthenticated = true;
                    if let Err(err) = gateway.reauthenticate().await {
                        tracing::error!(%action, error = %err, "Re-authentication failed");
                        return Err(err);
                    }
                }
                Err(err @ GatewayError::Transport(_)) if attempt < self.max_attempts => {
                    let delay = self.delay_for(attempt - 1);
                    tracing::warn!(
                        %action,
                        error = %err,
                        "Gateway call failed, retrying in {:?} (attempt {}/{})",
                        delay,
                        attempt,
                        self.max_attempts
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => {
                    if err.is_retryable() {
                        tracing::error!(
                            %action,
                            error = %err,
                            "Gateway call failed after {} attempts",
                            attempt
                        );
                    }
                    return Err(err);
                }
            }
        }
    }
}
