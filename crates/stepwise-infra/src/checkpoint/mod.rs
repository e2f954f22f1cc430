//! Durable checkpoint storage.
//!
//! - `file_store` -- one JSON file per workflow, replaced atomically on
//!   every append

pub mod file_store;

pub use file_store::{FileCheckpointStore, checkpoint_path_for};
