pub mod use_cases;

pub use use_cases::orchestrator::Orchestrator;
pub use use_cases::schema_sync::{SchemaSync, SyncReport};
