//! TTL Tables - in-process cache tables with idle expiry
//!
//! Named tables of key/value items. Each item may carry a life span: once it
//! goes that long without being accessed it is removed by the table's expiry
//! task, which sleeps until the nearest deadline instead of polling.

pub mod cache;
pub mod config;
pub mod error;
pub mod registry;
pub mod tasks;

pub use cache::{CacheItem, CacheStats, CacheTable};
pub use config::Config;
pub use error::{CacheError, Result};
pub use registry::Registry;
