pub mod differ;
pub mod processor;
pub mod store;

pub use differ::{ChangeDetector, ChangeSummary};
pub use processor::{CycleOutcome, DigestProcessor, build_digest};
pub use store::{DigestStore, PgStore};
