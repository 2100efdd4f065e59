pub mod inflight;
pub mod scheduler;
pub mod wiring;

pub use scheduler::{DigestScheduler, TriggerOutcome};
