// Library interface for newsgate modules
// This allows tests and the binary to import modules

pub mod cancel;
pub mod continuity;
pub mod dedup;
pub mod duplicate_guard;
pub mod engine;
pub mod error;
pub mod ingestion;
pub mod llm;
pub mod model;
pub mod publication;
pub mod retry;
pub mod scoring;
pub mod storage;
