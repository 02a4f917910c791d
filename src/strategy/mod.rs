// Trading signal module
pub mod band_breakout;

pub use band_breakout::SignalDetector;
