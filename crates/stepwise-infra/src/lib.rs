//! Infrastructure layer for Stepwise.
//!
//! Contains implementations of the collaborator traits defined in
//! `stepwise-core`: the atomic file checkpoint store, the `stepwise.toml`
//! loader, the filesystem subworkflow source, and subprocess adapters for the
//! agent executor and validation stages.

pub mod checkpoint;
pub mod config;
pub mod workflow;
