//! Logging and trace export setup shared by SWDL binaries.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, otel_requested, shutdown_tracing};
