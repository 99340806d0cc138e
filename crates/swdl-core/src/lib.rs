//! Workflow engine core for SWDL.
//!
//! Defines the repository port that `swdl-infra` implements and everything
//! that runs on top of it. Depends on `swdl-types` and never on
//! `swdl-infra` or any database crate.

pub mod event;
pub mod repository;
pub mod service;
pub mod workflow;
