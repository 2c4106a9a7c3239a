//! Background Tasks Module
//!
//! Contains the background task that expires idle cache entries.
//!
//! # Tasks
//! - Expiry: one self-rearming timer task per table

mod expiry;

pub use expiry::{ExpiryScheduler, Sweep};
