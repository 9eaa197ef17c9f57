//! Metadata log wiring.
//!
//! `types` defines the guard/batch commit protocol and the trait contracts
//! (log, command applier); `local` holds the in-process log used when the
//! node runs without a replicated consensus engine.

mod local;
mod types;

pub use local::LocalLog;
pub use types::{Batch, CommandApplier, Epoch, Guard, LogError, MetadataLog, NodeId};
