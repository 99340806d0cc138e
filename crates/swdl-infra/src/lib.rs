//! Infrastructure layer for SWDL.
//!
//! Implements the repository port defined in `swdl-core` on SQLite and loads
//! the global configuration file.

pub mod config;
pub mod sqlite;
