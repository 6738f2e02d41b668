//! Token polling orchestration.
//!
//! Two groups are polled on independent intervals. Within an execution the
//! fetches fan out with bounded concurrency while repository updates are
//! applied one at a time. Intervals and batch sizes follow the current load
//! level.

mod fetcher;
mod repository;
mod runner;
mod service;

pub use fetcher::{HttpPriceFetcher, MarketPair, PriceFetcher, parse_pairs};
pub use repository::{
    InMemoryTokenRepository, TokenGroup, TokenRecord, TokenRepository, best_price,
};
pub use runner::{GroupConfig, GroupReport, GroupRunner, PRICE_API, SchedulerContext, select_batch};
pub use service::{SchedulerConfig, SchedulerService};
