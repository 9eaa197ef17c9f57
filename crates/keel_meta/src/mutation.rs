//! Metadata mutations committed through the shared log.
//!
//! A batch carries zero or more of these, encoded as opaque bytes for the
//! log and decoded again by the applying state machine.

use serde::{Deserialize, Serialize};

use keel_consensus::log::NodeId;

use crate::schema::{AggregateDef, FunctionDef, KeyspaceDef, TableDef, UserTypeDef, ViewDef};
use crate::types::{QualifiedName, ShardId, TokenRange};

/// One mutation of the persisted system metadata.
///
/// Puts are upserts and drops of absent objects are no-ops, so replaying a
/// committed batch converges instead of erroring.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum MetaMutation {
    PutKeyspace { def: KeyspaceDef },
    DropKeyspace { name: String },
    PutTable { def: TableDef },
    DropTable { name: QualifiedName },
    PutView { def: ViewDef },
    DropView { name: QualifiedName },
    PutType { def: UserTypeDef },
    DropType { name: QualifiedName },
    PutFunction { def: FunctionDef },
    DropFunction { name: QualifiedName },
    PutAggregate { def: AggregateDef },
    DropAggregate { name: QualifiedName },
    PutViewBuildTask {
        view: QualifiedName,
        host: NodeId,
        shard: ShardId,
        range: TokenRange,
    },
    DeleteViewBuildTasks { view: QualifiedName },
    MarkViewBuilt { view: QualifiedName },
}

impl MetaMutation {
    /// Whether this mutation changes schema definitions (as opposed to the
    /// coordination work queues, which bypass the schema applier).
    pub fn is_schema_change(&self) -> bool {
        !matches!(
            self,
            MetaMutation::PutViewBuildTask { .. }
                | MetaMutation::DeleteViewBuildTasks { .. }
                | MetaMutation::MarkViewBuilt { .. }
        )
    }

    /// The keyspace this mutation touches.
    pub fn keyspace(&self) -> &str {
        match self {
            MetaMutation::PutKeyspace { def } => &def.name,
            MetaMutation::DropKeyspace { name } => name,
            MetaMutation::PutTable { def } => &def.name.keyspace,
            MetaMutation::PutView { def } => &def.name.keyspace,
            MetaMutation::PutType { def } => &def.name.keyspace,
            MetaMutation::PutFunction { def } => &def.name.keyspace,
            MetaMutation::PutAggregate { def } => &def.name.keyspace,
            MetaMutation::DropTable { name }
            | MetaMutation::DropView { name }
            | MetaMutation::DropType { name }
            | MetaMutation::DropFunction { name }
            | MetaMutation::DropAggregate { name } => &name.keyspace,
            MetaMutation::PutViewBuildTask { view, .. }
            | MetaMutation::DeleteViewBuildTasks { view }
            | MetaMutation::MarkViewBuilt { view } => &view.keyspace,
        }
    }
}

pub fn encode_mutation(mutation: &MetaMutation) -> anyhow::Result<Vec<u8>> {
    Ok(serde_json::to_vec(mutation)?)
}

pub fn decode_mutation(data: &[u8]) -> anyhow::Result<MetaMutation> {
    Ok(serde_json::from_slice(data)?)
}

pub fn decode_mutations(data: &[Vec<u8>]) -> anyhow::Result<Vec<MetaMutation>> {
    data.iter().map(|raw| decode_mutation(raw)).collect()
}
