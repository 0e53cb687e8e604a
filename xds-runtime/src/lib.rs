//! Node lifecycle, event fan-out and background task plumbing.

pub mod events;
pub mod lifetime;
pub mod tasks;

pub use events::EventBus;
pub use lifetime::NodeLifetime;
pub use tasks::TaskSet;

/// A task observed the shutdown trigger and should unwind quietly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("node lifetime was cancelled")]
pub struct Cancelled;
