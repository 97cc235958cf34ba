pub mod error;
pub mod processing_log;
pub mod progress_store;
