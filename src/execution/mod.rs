// Order execution and data collection module
pub mod engine;
pub mod lifecycle;
pub mod order_registry;
pub mod poller;
pub mod price_feed;
pub mod tick_buffer;

pub use engine::{evaluation_event, run_evaluation_loop, EngineEvent, TradingEngine};
pub use lifecycle::{
    Cycle, FailureNotice, LifecyclePhase, LifecycleState, LifecycleView, OrderLifecycleManager,
};
pub use order_registry::{OrderRegistry, StatusChange};
pub use poller::OrderPoller;
pub use price_feed::{
    run_ingestion, run_tick_writer, QuoteSource, SchwabQuoteSource, SyntheticQuoteSource,
};
pub use tick_buffer::TickBuffer;
