pub mod error;
pub mod mailerlite;
pub mod merge;
pub mod orchestrator;
pub mod rate_limiter;
pub mod record_sync;
pub mod repository;
pub mod settings;
pub mod status;
pub mod types;

pub use record_sync::{RecordSynchronizer, SyncOptions};
