//! Shared domain types for Stepwise.
//!
//! Workflow documents, step kinds, checkpoint records, engine events and the
//! error taxonomy used in run reports. Zero infrastructure dependencies --
//! only serde, uuid and chrono.

pub mod checkpoint;
pub mod config;
pub mod delegation;
pub mod error;
pub mod event;
pub mod workflow;
