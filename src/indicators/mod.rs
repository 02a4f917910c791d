// Technical indicators module
// Window-spanning EMA and volatility bands for the breakout signal

pub mod bands;
pub mod moving_average;

pub use bands::{BandIndicator, Bands, IndicatorSnapshot};
pub use moving_average::{calculate_std_dev, calculate_weighted_ema};
