//! Event distribution for workflow runs.

pub mod bus;

pub use bus::{EventBus, EventSubscription};
