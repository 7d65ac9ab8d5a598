//! File-backed persistence adapters for the llm-flow engine.
//!
//! Each store keeps one JSON document per key beneath its own directory:
//!
//! ```text
//! <root>/instances/<instance-id>.json
//! <root>/async_state/<message-id>.json
//! <root>/suspensions/<instance-id>.json
//! ```
//!
//! Writes go through a temp file and an atomic rename, so a crash never
//! leaves a half-written record behind. Suitable for development and
//! single-node deployments; document databases plug in through the same
//! contracts in `llm_flow_core::store`.

mod file;

pub use file::{FileAsyncStateStore, FileInstanceStore, FileStores, FileSuspensionStore};
