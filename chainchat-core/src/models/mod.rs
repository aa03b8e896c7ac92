//! Data models for the chainchat core
//!
//! These types are shared by the durable queue, the sync engine and the read model.

mod types;

pub use types::*;
