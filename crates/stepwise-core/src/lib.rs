//! Workflow engine for Stepwise.
//!
//! This crate holds the engine itself and the "ports" (collaborator traits)
//! that the infrastructure layer implements. It depends only on
//! `stepwise-types` -- never on `stepwise-infra` or any process/file adapter.

pub mod event;
pub mod workflow;
