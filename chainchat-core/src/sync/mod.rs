//! Offline queue synchronization
//!
//! - **backoff**: retry delay computation
//! - **events**: `SyncEvent` notifications
//! - **engine**: `SyncEngine`, the sync pass
//! - **scheduler**: background loop driven by connectivity

pub mod backoff;
pub mod engine;
pub mod events;
pub mod scheduler;

pub use engine::SyncEngine;
pub use events::SyncEvent;
pub use scheduler::{Connectivity, SyncHandle};
