//! Workflow engine: definitions, expressions, planning and execution.
//!
//! - `definition` parses and structurally validates YAML/JSON definitions
//! - `defaults` fills cross-field defaults
//! - `expression` implements the `${{ }}` language
//! - `dag` and `validator` analyse a definition statically
//! - `planner` turns a definition into an execution plan
//! - `executor` runs executions batch by batch through a `StageDispatcher`

pub mod context;
pub mod dag;
pub mod defaults;
pub mod definition;
pub mod dispatch;
pub mod duration;
pub mod executor;
pub mod expression;
pub mod planner;
pub mod retry;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;
