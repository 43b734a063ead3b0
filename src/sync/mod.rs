//! Mailbox synchronization: lease lock, pull engine, and scheduler.
//!
//! Core components:
//! - `lock` — per-account cross-process lease over the store
//! - `engine` — folder discovery + incremental message pull with cursor
//!   persistence and the failure-streak state machine
//! - `scheduler` — timer loop over ACTIVE accounts

pub mod engine;
pub mod lock;
pub mod scheduler;

pub use engine::{ClientFactory, EngineTrigger, ResyncTrigger, SyncEngine, SyncOutcome};
pub use lock::SyncLock;
pub use scheduler::spawn_sync_scheduler;
