// Core modules
pub mod api;
pub mod audit;
pub mod broker;
pub mod config;
pub mod error;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod report;
pub mod strategy;

// Re-export commonly used types
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
