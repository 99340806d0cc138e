//! Event bus for live execution progress.
//!
//! Provides an `EventBus` that distributes persisted `ExecutionEvent` records
//! to all subscribers via a `tokio::sync::broadcast` channel.

pub mod bus;

pub use bus::EventBus;
