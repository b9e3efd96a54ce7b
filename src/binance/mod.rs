pub mod client;
pub mod rate_limit;

pub use client::{ExchangeInfo, FuturesClient};
pub use rate_limit::RateLimiter;
