//! Background coordinator that keeps the view-build work queue in step
//! with the schema.
//!
//! The coordinator owns a working copy of the task map. Each iteration it
//! takes a guard on the metadata log, plans the difference between the
//! schema and the tasks it tracks, and commits the whole plan as one
//! batch. The working copy is only replaced once the commit sticks, so a
//! lost commit changes nothing and the next iteration just replans.
//! Between iterations it sleeps on schema events; anything that queued up
//! while an iteration ran is drained so one wakeup covers many events.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use keel_consensus::log::{Batch, LogError, MetadataLog};

use crate::database::Database;
use crate::events::SchemaEvent;
use crate::mutation::{encode_mutation, MetaMutation};
use crate::system_tables::{SystemTables, ViewBuildTaskMap};
use crate::topology::{Topology, TopologyHandle};
use crate::types::{BuildTaskKey, QualifiedName, TokenRange};

#[derive(Debug, Clone)]
pub struct ViewBuildingCoordinatorConfig {
    /// Upper bound on a single batch commit. `None` waits as long as the
    /// log does.
    pub commit_timeout: Option<Duration>,
}

impl Default for ViewBuildingCoordinatorConfig {
    fn default() -> Self {
        Self {
            commit_timeout: Some(Duration::from_secs(10)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorState {
    Initializing,
    Running,
    Stopped,
}

/// What one iteration wants to change: tasks to schedule per new view,
/// and views whose tasks should be deleted.
#[derive(Debug, Default)]
struct Plan {
    add: BTreeMap<QualifiedName, BTreeMap<BuildTaskKey, TokenRange>>,
    remove: Vec<QualifiedName>,
}

impl Plan {
    fn is_empty(&self) -> bool {
        self.add.is_empty() && self.remove.is_empty()
    }
}

/// Decide what the task map should look like given the current schema
/// and membership. Pure; all the I/O stays in the coordinator.
fn plan(snapshot: &SystemTables, topology: &Topology, tracked: &ViewBuildTaskMap) -> Plan {
    let mut plan = Plan::default();

    for (view_name, view) in &snapshot.schema.views {
        if tracked.contains_key(view_name) || snapshot.built_views.contains(view_name) {
            continue;
        }
        let Some(keyspace) = snapshot.schema.keyspaces.get(&view.name.keyspace) else {
            continue;
        };
        if !keyspace.uses_tablets() {
            continue;
        }
        let mut tasks = BTreeMap::new();
        for member in topology.active_members() {
            for shard in 0..member.shard_count {
                // TODO: assign only the token ranges each replica shard
                // actually owns instead of the whole ring.
                tasks.insert(
                    BuildTaskKey {
                        host: member.node_id,
                        shard,
                    },
                    TokenRange::full(),
                );
            }
        }
        if !tasks.is_empty() {
            plan.add.insert(view_name.clone(), tasks);
        }
    }

    for view_name in tracked.keys() {
        if !snapshot.schema.views.contains_key(view_name) {
            plan.remove.push(view_name.clone());
        }
    }

    plan
}

/// The control loop. One per node; see
/// [`spawn_view_building_coordinator`].
pub struct ViewBuildingCoordinator {
    db: Arc<Database>,
    log: Arc<dyn MetadataLog>,
    topology: TopologyHandle,
    abort: CancellationToken,
    config: ViewBuildingCoordinatorConfig,
    state: CoordinatorState,
    events: Option<broadcast::Receiver<SchemaEvent>>,
    /// Working copy of the persisted task map. Only replaced after a
    /// batch commits.
    tasks: ViewBuildTaskMap,
}

impl ViewBuildingCoordinator {
    pub fn new(
        db: Arc<Database>,
        log: Arc<dyn MetadataLog>,
        topology: TopologyHandle,
        abort: CancellationToken,
        config: ViewBuildingCoordinatorConfig,
    ) -> Self {
        Self {
            db,
            log,
            topology,
            abort,
            config,
            state: CoordinatorState::Initializing,
            events: None,
            tasks: ViewBuildTaskMap::new(),
        }
    }

    pub async fn run(&mut self) -> anyhow::Result<()> {
        loop {
            match self.state {
                CoordinatorState::Initializing => {
                    self.events = Some(self.db.events().subscribe());
                    self.tasks = self.db.store().snapshot().view_build_tasks;
                    tracing::info!(
                        tracked_views = self.tasks.len(),
                        "view building coordinator started"
                    );
                    self.state = CoordinatorState::Running;
                }
                CoordinatorState::Running => {
                    if self.abort.is_cancelled() {
                        self.state = CoordinatorState::Stopped;
                        continue;
                    }
                    match self.update_state().await {
                        Ok(()) => self.await_event().await,
                        Err(err) if is_aborted(&err) => self.state = CoordinatorState::Stopped,
                        Err(err) => {
                            tracing::warn!(
                                error = ?err,
                                "view building coordinator iteration failed; retrying"
                            );
                            tokio::task::yield_now().await;
                        }
                    }
                }
                CoordinatorState::Stopped => {
                    self.events = None;
                    tracing::info!("view building coordinator stopped");
                    return Ok(());
                }
            }
        }
    }

    /// One reconciliation pass: plan against fresh snapshots and commit
    /// the whole plan as a single guarded batch.
    async fn update_state(&mut self) -> anyhow::Result<()> {
        let guard = self.log.start_operation(&self.abort).await?;
        let snapshot = self.db.store().snapshot();
        let topology = self.topology.snapshot();

        let plan = plan(&snapshot, &topology, &self.tasks);
        if plan.is_empty() {
            return Ok(());
        }

        let mut batch = Batch::new(guard);
        for (view, tasks) in &plan.add {
            for (key, range) in tasks {
                batch.add_mutation(encode_mutation(&MetaMutation::PutViewBuildTask {
                    view: view.clone(),
                    host: key.host,
                    shard: key.shard,
                    range: range.clone(),
                })?);
            }
            tracing::info!(view = %view, tasks = tasks.len(), "scheduling view build");
        }
        for view in &plan.remove {
            batch.add_mutation(encode_mutation(&MetaMutation::DeleteViewBuildTasks {
                view: view.clone(),
            })?);
            tracing::info!(view = %view, "clearing build tasks for dropped view");
        }

        batch
            .commit(self.log.as_ref(), &self.abort, self.config.commit_timeout)
            .await?;

        let mut working = self.tasks.clone();
        for (view, tasks) in plan.add {
            working.insert(view, tasks);
        }
        for view in plan.remove {
            working.remove(&view);
        }
        self.tasks = working;
        Ok(())
    }

    /// Park until a view comes or goes. Other schema events are ignored,
    /// and everything already queued is drained before returning so a
    /// burst of changes costs one iteration.
    async fn await_event(&mut self) {
        let Some(events) = self.events.as_mut() else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.abort.cancelled() => return,
                event = events.recv() => match event {
                    Ok(SchemaEvent::ViewCreated { .. }) | Ok(SchemaEvent::ViewDropped { .. }) => break,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "schema event stream lagged, replanning");
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        self.abort.cancelled().await;
                        return;
                    }
                },
            }
        }
        loop {
            match events.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => break,
            }
        }
    }
}

fn is_aborted(err: &anyhow::Error) -> bool {
    err.downcast_ref::<LogError>()
        .map(LogError::is_aborted)
        .unwrap_or(false)
}

/// Run the coordinator on its own task until `abort` fires. An error
/// escaping the loop is a bug; it kills the coordinator, not the node.
pub fn spawn_view_building_coordinator(
    db: Arc<Database>,
    log: Arc<dyn MetadataLog>,
    topology: TopologyHandle,
    abort: CancellationToken,
    config: ViewBuildingCoordinatorConfig,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut coordinator = ViewBuildingCoordinator::new(db, log, topology, abort, config);
        if let Err(err) = coordinator.run().await {
            tracing::error!(error = ?err, "view building coordinator exited with internal error");
        }
    })
}
