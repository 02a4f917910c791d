use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/bandtrader.toml";
const ENV_PREFIX: &str = "BANDTRADER";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub instrument: InstrumentConfig,
    pub order: OrderConfig,
    pub indicator: IndicatorConfig,
    pub loops: LoopConfig,
    pub retry: RetryConfig,
    pub broker: BrokerConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstrumentConfig {
    pub ticker: String,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            ticker: "SQQQ".to_string(),
        }
    }
}

/// How the trailing stop offset is interpreted by the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopLinkType {
    Value,
    Percent,
    Tick,
}

/// Which market price the trailing stop follows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StopLinkBasis {
    Last,
    Bid,
    Ask,
    Mark,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrderConfig {
    pub quantity: u32,
    pub stop_offset: f64,
    pub stop_link_type: StopLinkType,
    pub stop_link_basis: StopLinkBasis,
}

impl Default for OrderConfig {
    fn default() -> Self {
        Self {
            quantity: 1,
            stop_offset: 0.10,
            stop_link_type: StopLinkType::Value,
            stop_link_basis: StopLinkBasis::Last,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IndicatorConfig {
    /// Window length; one tick per second is assumed
    pub window_seconds: usize,
    pub band_multiplier: f64,
}

impl Default for IndicatorConfig {
    fn default() -> Self {
        Self {
            window_seconds: 8 * 60,
            band_multiplier: 1.7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoopConfig {
    pub evaluation_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub feed_interval_ms: u64,
    pub report_interval_secs: u64,
    pub channel_capacity: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_ms: 1_000,
            poll_interval_ms: 2_000,
            feed_interval_ms: 1_000,
            report_interval_secs: 30,
            channel_capacity: 1_024,
        }
    }
}

impl LoopConfig {
    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_millis(self.evaluation_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn feed_interval(&self) -> Duration {
        Duration::from_millis(self.feed_interval_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_secs(self.report_interval_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total attempts per gateway call, including the first
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 250,
            max_delay_ms: 2_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerMode {
    Paper,
    Schwab,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub mode: BrokerMode,
    pub base_url: String,
    pub requests_per_minute: u32,
    pub request_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            mode: BrokerMode::Paper,
            base_url: "https://api.schwabapi.com".to_string(),
            requests_per_minute: 120,
            request_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    pub enabled: bool,
    pub directory: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: "Logs/OrderPayloads".to_string(),
        }
    }
}

impl Settings {
    /// Load defaults, then the TOML file, then `BANDTRADER_*` env vars
    ///
    /// An explicit `path` must exist; the default path is optional.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(path) => (path, true),
            None => (Path::new(DEFAULT_CONFIG_PATH), false),
        };
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from(path).required(required))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| format!("failed to read settings from {}", path.display()))?
            .try_deserialize()
            .context("failed to parse settings")?;

        settings.validate()?;
        Ok(settings)
    }

    /// Parse settings from a TOML string (no env layer)
    pub fn from_toml(toml: &str) -> Result<Self> {
        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()
            .context("failed to read settings")?
            .try_deserialize()
            .context("failed to parse settings")?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        if self.instrument.ticker.trim().is_empty() {
            bail!("instrument.ticker must not be empty");
        }
        if self.order.quantity == 0 {
            bail!("order.quantity must be > 0");
        }
        if self.order.stop_offset <= 0.0 || !self.order.stop_offset.is_finite() {
            bail!("order.stop_offset must be a positive number");
        }
        if self.indicator.window_seconds < 2 {
            bail!("indicator.window_seconds must be at least 2");
        }
        if self.indicator.band_multiplier <= 0.0 || !self.indicator.band_multiplier.is_finite() {
            bail!("indicator.band_multiplier must be a positive number");
        }
        if self.loops.evaluation_interval_ms == 0
            || self.loops.poll_interval_ms == 0
            || self.loops.feed_interval_ms == 0
            || self.loops.report_interval_secs == 0
        {
            bail!("loop intervals must be > 0");
        }
        if self.loops.channel_capacity == 0 {
            bail!("loops.channel_capacity must be > 0");
        }
        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be > 0");
        }
        if self.broker.requests_per_minute == 0 {
            bail!("broker.requests_per_minute must be > 0");
        }
        Ok(())
    }
}
