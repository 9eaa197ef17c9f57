//! Node lifecycle: wires the metadata log, the sharded database, and the
//! background coordinators together.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use keel_consensus::log::{Batch, CommandApplier, LocalLog, MetadataLog, NodeId};

use crate::database::Database;
use crate::events::SchemaEventBus;
use crate::mutation::{decode_mutations, encode_mutation, MetaMutation};
use crate::schema_applier::apply_schema_batch;
use crate::system_tables::SystemTablesStore;
use crate::topology::{MemberDesc, MemberState, Topology, TopologyHandle};
use crate::view_building_coordinator::{
    spawn_view_building_coordinator, ViewBuildingCoordinatorConfig,
};
use crate::voters::{InMemoryVoterClient, VoterRegistry};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub data_dir: PathBuf,
    pub shard_count: u32,
    pub max_voters: usize,
    /// Upper bound on a metadata batch commit. `None` waits indefinitely.
    pub commit_timeout: Option<Duration>,
}

impl NodeConfig {
    pub fn new(node_id: NodeId, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node_id,
            data_dir: data_dir.into(),
            shard_count: 2,
            max_voters: 3,
            commit_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Applies committed batches from the metadata log: decodes them and runs
/// them through the schema applier pipeline.
pub struct MetaStateMachine {
    db: Arc<Database>,
}

impl MetaStateMachine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CommandApplier for MetaStateMachine {
    async fn apply(&self, mutations: &[Vec<u8>], write_timestamp: i64) -> anyhow::Result<()> {
        let decoded = decode_mutations(mutations)?;
        apply_schema_batch(&self.db, &decoded, write_timestamp).await
    }
}

/// One running metadata node.
pub struct Node {
    node_id: NodeId,
    db: Arc<Database>,
    log: Arc<LocalLog>,
    topology: TopologyHandle,
    voters: VoterRegistry,
    commit_timeout: Option<Duration>,
    abort: CancellationToken,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Node {
    /// Open (or create) the node's state under `config.data_dir` and
    /// bring the live schema up on every shard.
    pub fn open(config: NodeConfig) -> anyhow::Result<Arc<Self>> {
        let store = SystemTablesStore::load_or_init(config.data_dir.join("system_tables.json"))?;
        let db = Arc::new(Database::new(
            store,
            config.shard_count,
            SchemaEventBus::default(),
        )?);
        let log = Arc::new(LocalLog::new(Arc::new(MetaStateMachine::new(db.clone()))));

        let topology = TopologyHandle::new(Topology::default());
        topology.set_member(MemberDesc {
            node_id: config.node_id,
            state: MemberState::Active,
            shard_count: config.shard_count,
        });

        let voters = VoterRegistry::new(
            Arc::new(InMemoryVoterClient::default()),
            config.max_voters,
        );

        tracing::info!(
            node_id = config.node_id,
            shards = config.shard_count,
            data_dir = %config.data_dir.display(),
            "metadata node opened"
        );
        Ok(Arc::new(Self {
            node_id: config.node_id,
            db,
            log,
            topology,
            voters,
            commit_timeout: config.commit_timeout,
            abort: CancellationToken::new(),
            coordinator: Mutex::new(None),
        }))
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn metadata_log(&self) -> Arc<dyn MetadataLog> {
        self.log.clone()
    }

    pub fn topology(&self) -> &TopologyHandle {
        &self.topology
    }

    pub fn voters(&self) -> &VoterRegistry {
        &self.voters
    }

    /// Commit a batch of metadata mutations through the log. Fails with a
    /// conflict if another batch commits between the guard and this one.
    pub async fn propose(&self, mutations: Vec<MetaMutation>) -> anyhow::Result<()> {
        let guard = self.log.start_operation(&self.abort).await?;
        let mut batch = Batch::new(guard);
        for mutation in &mutations {
            batch.add_mutation(encode_mutation(mutation)?);
        }
        batch
            .commit(self.log.as_ref(), &self.abort, self.commit_timeout)
            .await?;
        Ok(())
    }

    /// Start the view building coordinator. Idempotent; the coordinator
    /// stops with [`shutdown`](Self::shutdown).
    pub fn start_view_building_coordinator(&self) {
        let mut slot = self.coordinator.lock().unwrap();
        if slot.is_some() {
            return;
        }
        *slot = Some(spawn_view_building_coordinator(
            self.db.clone(),
            self.log.clone(),
            self.topology.clone(),
            self.abort.child_token(),
            ViewBuildingCoordinatorConfig {
                commit_timeout: self.commit_timeout,
            },
        ));
    }

    /// Stop background work and wait for it to wind down.
    pub async fn shutdown(&self) {
        self.abort.cancel();
        let handle = self.coordinator.lock().unwrap().take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                tracing::warn!(error = ?err, "view building coordinator task failed to join");
            }
        }
        tracing::info!(node_id = self.node_id, "metadata node stopped");
    }

    /// Current consensus voters; convenience passthrough for callers that
    /// hold a node rather than the registry.
    pub async fn current_voters(&self) -> anyhow::Result<BTreeSet<NodeId>> {
        self.voters.voters().await
    }
}
