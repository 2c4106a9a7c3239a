//! Cache Module
//!
//! Provides cache tables whose entries expire after a period without access.

mod callbacks;
mod entry;
mod stats;
mod table;


// Re-export public types
pub use callbacks::{CallbackChain, ExpireCallback, ItemCallback};
pub use entry::CacheItem;
pub use stats::CacheStats;
pub use table::{CacheTable, DataLoader};
