// Live broker and market data clients
pub mod schwab;

pub use schwab::{SchwabClient, SchwabCredentials};
