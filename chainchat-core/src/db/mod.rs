//! Local persistence
//!
//! - **pool**: connection setup, migrations, settings rows
//! - **queue**: durable outbound queue
//! - **history**: confirmed-message cache and conversation cursors

pub mod history;
pub mod pool;
pub mod queue;

pub use history::{ConfirmedRecord, HistoryStore};
pub use pool::{open, open_in_memory};
pub use queue::QueueStore;
