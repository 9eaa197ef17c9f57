//! Cluster metadata for the keel database node.
//!
//! Schema changes commit as guarded batches through the metadata log
//! (see `keel_consensus`), land in the persisted system tables, and are
//! then published to every shard's live schema by the schema applier.
//! Background coordinators keep derived state in step: the view building
//! coordinator schedules build work for new materialized views, and the
//! voter registry keeps the consensus voter set bounded.

pub mod database;
pub mod events;
pub mod mutation;
pub mod node;
pub mod schema;
pub mod schema_applier;
pub mod system_tables;
pub mod topology;
pub mod types;
pub mod view_building_coordinator;
pub mod voters;

pub use node::{Node, NodeConfig};
