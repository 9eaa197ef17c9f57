//! Four-phase application of committed schema batches.
//!
//! A batch flows through prepare -> update -> commit -> notify. Prepare
//! snapshots the affected slice of the persisted schema before the batch
//! lands in the system tables. Update computes the resulting diff, takes
//! the table locks the batch touches, and stages one ready-to-publish
//! diff per shard from a frozen copy. Commit swaps every shard's schema
//! pointer and drops the locks. Notify emits change events; listeners are
//! best effort and a missed event never blocks the pipeline.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;

use crate::database::{Database, Shard, ShardSchema, TableSchema, ViewSchema};
use crate::events::SchemaEvent;
use crate::mutation::MetaMutation;
use crate::schema::{AggregateDef, FunctionDef, KeyspaceDef, TableDef, UserTypeDef, ViewDef};
use crate::system_tables::{apply_schema_mutation, SchemaState};
use crate::types::QualifiedName;

/// Where a [`SchemaApplier`] is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyPhase {
    Idle,
    Prepared,
    Updated,
    Committed,
    Notified,
}

/// Raised when the applier's phases are driven out of order.
#[derive(Debug, Clone, Error)]
#[error("schema applier is {actual:?}, expected {expected:?}")]
pub struct PhaseError {
    pub expected: ApplyPhase,
    pub actual: ApplyPhase,
}

/// Created, altered, and dropped definitions of one schema object kind.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchemaDiff<T> {
    pub created: Vec<T>,
    pub altered: Vec<Altered<T>>,
    pub dropped: Vec<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Altered<T> {
    pub old: T,
    pub new: T,
}

impl<T> Default for SchemaDiff<T> {
    fn default() -> Self {
        Self {
            created: Vec::new(),
            altered: Vec::new(),
            dropped: Vec::new(),
        }
    }
}

impl<T> SchemaDiff<T> {
    fn is_empty(&self) -> bool {
        self.created.is_empty() && self.altered.is_empty() && self.dropped.is_empty()
    }
}

/// The full difference one batch makes to the schema.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FullSchemaDiff {
    pub keyspaces: SchemaDiff<KeyspaceDef>,
    pub tables: SchemaDiff<TableDef>,
    pub views: SchemaDiff<ViewDef>,
    pub types: SchemaDiff<UserTypeDef>,
    pub functions: SchemaDiff<FunctionDef>,
    pub aggregates: SchemaDiff<AggregateDef>,
}

impl FullSchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.keyspaces.is_empty()
            && self.tables.is_empty()
            && self.views.is_empty()
            && self.types.is_empty()
            && self.functions.is_empty()
            && self.aggregates.is_empty()
    }
}

/// A schema diff serialized into an owning, shard-neutral form. Every
/// shard thaws its own copy, so no definition object is ever shared
/// across shard snapshots.
pub struct FrozenSchemaDiff {
    bytes: Vec<u8>,
}

impl FrozenSchemaDiff {
    pub fn freeze(diff: &FullSchemaDiff) -> anyhow::Result<Self> {
        Ok(Self {
            bytes: serde_json::to_vec(diff)?,
        })
    }

    pub fn thaw(&self) -> anyhow::Result<FullSchemaDiff> {
        Ok(serde_json::from_slice(&self.bytes)?)
    }
}

#[derive(Debug)]
struct DiffOps<K, V> {
    upserts: Vec<(K, V)>,
    removes: Vec<K>,
}

impl<K, V> Default for DiffOps<K, V> {
    fn default() -> Self {
        Self {
            upserts: Vec::new(),
            removes: Vec::new(),
        }
    }
}

impl<K: Ord + Clone, V: Clone> DiffOps<K, V> {
    fn apply_to(&self, map: &mut BTreeMap<K, V>) {
        for key in &self.removes {
            map.remove(key);
        }
        for (key, value) in &self.upserts {
            map.insert(key.clone(), value.clone());
        }
    }

    fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.removes.is_empty()
    }
}

/// One shard's staged publication: resolved definitions ready to merge
/// into that shard's current snapshot at commit.
#[derive(Debug, Default)]
struct ShardDiff {
    keyspaces: DiffOps<String, Arc<KeyspaceDef>>,
    tables: DiffOps<QualifiedName, Arc<TableSchema>>,
    views: DiffOps<QualifiedName, Arc<ViewSchema>>,
    types: DiffOps<QualifiedName, Arc<UserTypeDef>>,
    functions: DiffOps<QualifiedName, Arc<FunctionDef>>,
    aggregates: DiffOps<QualifiedName, Arc<AggregateDef>>,
}

impl ShardDiff {
    fn apply_to(&self, current: &ShardSchema) -> ShardSchema {
        let mut next = current.clone();
        self.keyspaces.apply_to(&mut next.keyspaces);
        self.types.apply_to(&mut next.types);
        self.tables.apply_to(&mut next.tables);
        self.views.apply_to(&mut next.views);
        self.functions.apply_to(&mut next.functions);
        self.aggregates.apply_to(&mut next.aggregates);
        next
    }

    fn is_empty(&self) -> bool {
        self.keyspaces.is_empty()
            && self.tables.is_empty()
            && self.views.is_empty()
            && self.types.is_empty()
            && self.functions.is_empty()
            && self.aggregates.is_empty()
    }
}

/// Drives one committed batch through the four phases.
pub struct SchemaApplier {
    db: Arc<Database>,
    mutations: Vec<MetaMutation>,
    phase: ApplyPhase,
    affected_keyspaces: BTreeSet<String>,
    before: SchemaState,
    diff: FullSchemaDiff,
    per_shard: Vec<ShardDiff>,
    lock_guards: Vec<OwnedMutexGuard<()>>,
}

impl SchemaApplier {
    pub fn new(db: Arc<Database>, mutations: Vec<MetaMutation>) -> Self {
        Self {
            db,
            mutations,
            phase: ApplyPhase::Idle,
            affected_keyspaces: BTreeSet::new(),
            before: SchemaState::default(),
            diff: FullSchemaDiff::default(),
            per_shard: Vec::new(),
            lock_guards: Vec::new(),
        }
    }

    pub fn phase(&self) -> ApplyPhase {
        self.phase
    }

    fn ensure_phase(&self, expected: ApplyPhase) -> Result<(), PhaseError> {
        if self.phase != expected {
            return Err(PhaseError {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    /// Snapshot the affected keyspaces' definitions as they are before
    /// the batch. Must run before the batch lands in the system tables.
    pub fn prepare(&mut self) -> anyhow::Result<()> {
        self.ensure_phase(ApplyPhase::Idle)?;
        self.affected_keyspaces = self
            .mutations
            .iter()
            .filter(|m| m.is_schema_change())
            .map(|m| m.keyspace().to_string())
            .collect();
        self.before = restrict(
            &self.db.store().snapshot().schema,
            &self.affected_keyspaces,
        );
        self.phase = ApplyPhase::Prepared;
        Ok(())
    }

    /// Compute the diff the batch makes, take the table locks it touches,
    /// and stage a resolved copy of the diff for every shard. The locks
    /// stay held until [`commit`](Self::commit).
    pub async fn update(&mut self) -> anyhow::Result<()> {
        self.ensure_phase(ApplyPhase::Prepared)?;

        let mut after = self.before.clone();
        for mutation in self.mutations.iter().filter(|m| m.is_schema_change()) {
            apply_schema_mutation(&mut after, mutation)?;
        }

        self.diff = FullSchemaDiff {
            keyspaces: diff_maps(&self.before.keyspaces, &after.keyspaces),
            tables: diff_maps(&self.before.tables, &after.tables),
            views: diff_maps(&self.before.views, &after.views),
            types: diff_maps(&self.before.types, &after.types),
            functions: diff_maps(&self.before.functions, &after.functions),
            aggregates: diff_maps(&self.before.aggregates, &after.aggregates),
        };

        self.lock_guards = self
            .db
            .table_locks()
            .acquire(&self.locked_tables())
            .await;

        let frozen = FrozenSchemaDiff::freeze(&self.diff)?;
        self.per_shard = self
            .db
            .shards()
            .iter()
            .map(|shard| stage_shard_diff(shard, &frozen))
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.phase = ApplyPhase::Updated;
        Ok(())
    }

    /// Names to lock: every table and view the diff touches, plus the
    /// base table of every touched view.
    fn locked_tables(&self) -> BTreeSet<QualifiedName> {
        let mut names = BTreeSet::new();
        for def in changed(&self.diff.tables) {
            names.insert(def.name.clone());
        }
        for def in changed(&self.diff.views) {
            names.insert(def.name.clone());
            names.insert(def.base_table.clone());
        }
        names
    }

    /// Publish the staged diff on every shard, then drop the table locks.
    pub async fn commit(&mut self) -> anyhow::Result<()> {
        self.ensure_phase(ApplyPhase::Updated)?;

        let staged = mem::take(&mut self.per_shard);
        futures_util::future::join_all(staged.into_iter().zip(self.db.shards()).map(
            |(diff, shard)| async move {
                if !diff.is_empty() {
                    shard.update_schema(|current| diff.apply_to(current));
                }
            },
        ))
        .await;

        self.db
            .table_locks()
            .release(mem::take(&mut self.lock_guards));

        if !self.diff.is_empty() {
            tracing::info!(
                keyspaces = ?self.affected_keyspaces,
                tables = self.diff.tables.created.len() + self.diff.tables.altered.len() + self.diff.tables.dropped.len(),
                views = self.diff.views.created.len() + self.diff.views.altered.len() + self.diff.views.dropped.len(),
                "published schema batch to all shards"
            );
        }
        self.phase = ApplyPhase::Committed;
        Ok(())
    }

    /// Emit one event per changed definition. Best effort: events go to a
    /// broadcast bus and nobody waits for listeners.
    pub fn notify(&mut self) -> anyhow::Result<()> {
        self.ensure_phase(ApplyPhase::Committed)?;
        let events = self.db.events();

        for def in &self.diff.keyspaces.created {
            events.emit(SchemaEvent::KeyspaceCreated {
                name: def.name.clone(),
            });
        }
        for alt in &self.diff.keyspaces.altered {
            events.emit(SchemaEvent::KeyspaceAltered {
                name: alt.new.name.clone(),
            });
        }
        for def in &self.diff.keyspaces.dropped {
            events.emit(SchemaEvent::KeyspaceDropped {
                name: def.name.clone(),
            });
        }

        for def in &self.diff.types.created {
            events.emit(SchemaEvent::TypeCreated {
                name: def.name.clone(),
            });
        }
        for alt in &self.diff.types.altered {
            events.emit(SchemaEvent::TypeAltered {
                name: alt.new.name.clone(),
            });
        }
        for def in &self.diff.types.dropped {
            events.emit(SchemaEvent::TypeDropped {
                name: def.name.clone(),
            });
        }

        for def in &self.diff.tables.created {
            events.emit(SchemaEvent::TableCreated {
                name: def.name.clone(),
            });
        }
        for alt in &self.diff.tables.altered {
            events.emit(SchemaEvent::TableAltered {
                name: alt.new.name.clone(),
            });
        }
        for def in &self.diff.tables.dropped {
            events.emit(SchemaEvent::TableDropped {
                name: def.name.clone(),
            });
        }

        for def in &self.diff.views.created {
            events.emit(SchemaEvent::ViewCreated {
                name: def.name.clone(),
            });
        }
        for alt in &self.diff.views.altered {
            events.emit(SchemaEvent::ViewAltered {
                name: alt.new.name.clone(),
            });
        }
        for def in &self.diff.views.dropped {
            events.emit(SchemaEvent::ViewDropped {
                name: def.name.clone(),
            });
        }

        for def in &self.diff.functions.created {
            events.emit(SchemaEvent::FunctionCreated {
                name: def.name.clone(),
            });
        }
        for alt in &self.diff.functions.altered {
            events.emit(SchemaEvent::FunctionAltered {
                name: alt.new.name.clone(),
            });
        }
        for def in &self.diff.functions.dropped {
            events.emit(SchemaEvent::FunctionDropped {
                name: def.name.clone(),
            });
        }

        for def in &self.diff.aggregates.created {
            events.emit(SchemaEvent::AggregateCreated {
                name: def.name.clone(),
            });
        }
        for alt in &self.diff.aggregates.altered {
            events.emit(SchemaEvent::AggregateAltered {
                name: alt.new.name.clone(),
            });
        }
        for def in &self.diff.aggregates.dropped {
            events.emit(SchemaEvent::AggregateDropped {
                name: def.name.clone(),
            });
        }

        self.phase = ApplyPhase::Notified;
        Ok(())
    }
}

/// Apply one committed batch end to end: persist it to the system tables
/// and push the resulting schema out to every shard.
///
/// Batches that only touch the view-build work queue skip the applier
/// pipeline; nothing about the live schema changes for them. Replayed
/// batches are detected by the system tables and skipped entirely.
pub async fn apply_schema_batch(
    db: &Arc<Database>,
    mutations: &[MetaMutation],
    write_timestamp: i64,
) -> anyhow::Result<()> {
    if mutations.iter().all(|m| !m.is_schema_change()) {
        db.store().apply_batch(mutations, write_timestamp)?;
        return Ok(());
    }

    let mut applier = SchemaApplier::new(db.clone(), mutations.to_vec());
    applier.prepare()?;
    if !db.store().apply_batch(mutations, write_timestamp)? {
        return Ok(());
    }
    applier.update().await?;
    applier.commit().await?;
    applier.notify()?;
    Ok(())
}

fn restrict(schema: &SchemaState, keyspaces: &BTreeSet<String>) -> SchemaState {
    SchemaState {
        keyspaces: schema
            .keyspaces
            .iter()
            .filter(|(name, _)| keyspaces.contains(*name))
            .map(|(name, def)| (name.clone(), def.clone()))
            .collect(),
        tables: restrict_map(&schema.tables, keyspaces),
        views: restrict_map(&schema.views, keyspaces),
        types: restrict_map(&schema.types, keyspaces),
        functions: restrict_map(&schema.functions, keyspaces),
        aggregates: restrict_map(&schema.aggregates, keyspaces),
    }
}

fn restrict_map<V: Clone>(
    map: &BTreeMap<QualifiedName, V>,
    keyspaces: &BTreeSet<String>,
) -> BTreeMap<QualifiedName, V> {
    map.iter()
        .filter(|(name, _)| keyspaces.contains(&name.keyspace))
        .map(|(name, def)| (name.clone(), def.clone()))
        .collect()
}

fn diff_maps<K: Ord, V: Clone + PartialEq>(
    before: &BTreeMap<K, V>,
    after: &BTreeMap<K, V>,
) -> SchemaDiff<V> {
    let mut diff = SchemaDiff::default();
    for (key, new) in after {
        match before.get(key) {
            None => diff.created.push(new.clone()),
            Some(old) if old != new => diff.altered.push(Altered {
                old: old.clone(),
                new: new.clone(),
            }),
            Some(_) => {}
        }
    }
    for (key, old) in before {
        if !after.contains_key(key) {
            diff.dropped.push(old.clone());
        }
    }
    diff
}

/// Every definition a diff touches, in created, altered, dropped order.
fn changed<T>(diff: &SchemaDiff<T>) -> impl Iterator<Item = &T> {
    diff.created
        .iter()
        .chain(diff.altered.iter().map(|a| &a.new))
        .chain(diff.dropped.iter())
}

/// Thaw the frozen diff into shard-local definitions. User types are
/// resolved against the shard's current types overlaid with the types the
/// batch itself creates, so a table and the type it uses can land in one
/// batch.
fn stage_shard_diff(shard: &Shard, frozen: &FrozenSchemaDiff) -> anyhow::Result<ShardDiff> {
    let diff = frozen.thaw()?;
    let current = shard.schema();

    let mut types = current.types.clone();
    for def in diff
        .types
        .created
        .iter()
        .chain(diff.types.altered.iter().map(|a| &a.new))
    {
        types.insert(def.name.clone(), Arc::new(def.clone()));
    }
    for def in &diff.types.dropped {
        types.remove(&def.name);
    }
    let lookup = |name: &QualifiedName| types.get(name).cloned();

    let mut staged = ShardDiff::default();

    for def in diff
        .keyspaces
        .created
        .iter()
        .chain(diff.keyspaces.altered.iter().map(|a| &a.new))
    {
        staged
            .keyspaces
            .upserts
            .push((def.name.clone(), Arc::new(def.clone())));
    }
    for def in &diff.keyspaces.dropped {
        staged.keyspaces.removes.push(def.name.clone());
    }

    for def in diff
        .types
        .created
        .iter()
        .chain(diff.types.altered.iter().map(|a| &a.new))
    {
        staged
            .types
            .upserts
            .push((def.name.clone(), Arc::new(def.clone())));
    }
    for def in &diff.types.dropped {
        staged.types.removes.push(def.name.clone());
    }

    for def in diff
        .tables
        .created
        .iter()
        .chain(diff.tables.altered.iter().map(|a| &a.new))
    {
        let table = TableSchema::build(def, &lookup)?;
        staged
            .tables
            .upserts
            .push((def.name.clone(), Arc::new(table)));
    }
    for def in &diff.tables.dropped {
        staged.tables.removes.push(def.name.clone());
    }

    for def in diff
        .views
        .created
        .iter()
        .chain(diff.views.altered.iter().map(|a| &a.new))
    {
        let view = ViewSchema::build(def, &lookup)?;
        staged
            .views
            .upserts
            .push((def.name.clone(), Arc::new(view)));
    }
    for def in &diff.views.dropped {
        staged.views.removes.push(def.name.clone());
    }

    for def in diff
        .functions
        .created
        .iter()
        .chain(diff.functions.altered.iter().map(|a| &a.new))
    {
        staged
            .functions
            .upserts
            .push((def.name.clone(), Arc::new(def.clone())));
    }
    for def in &diff.functions.dropped {
        staged.functions.removes.push(def.name.clone());
    }

    for def in diff
        .aggregates
        .created
        .iter()
        .chain(diff.aggregates.altered.iter().map(|a| &a.new))
    {
        staged
            .aggregates
            .upserts
            .push((def.name.clone(), Arc::new(def.clone())));
    }
    for def in &diff.aggregates.dropped {
        staged.aggregates.removes.push(def.name.clone());
    }

    Ok(staged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::SchemaEventBus;
    use crate::schema::{ColumnDef, ColumnType, ReplicationStrategy};
    use crate::system_tables::SystemTablesStore;
    use crate::types::TokenRange;

    fn keyspace(name: &str) -> MetaMutation {
        MetaMutation::PutKeyspace {
            def: KeyspaceDef {
                name: name.into(),
                replication: ReplicationStrategy::Tablets {
                    replication_factor: 3,
                    initial_tablets: 8,
                },
                durable_writes: true,
            },
        }
    }

    fn table_with(keyspace: &str, name: &str, extra_columns: &[&str]) -> MetaMutation {
        let mut columns = vec![ColumnDef {
            name: "pk".into(),
            kind: ColumnType::Bigint,
        }];
        for extra in extra_columns {
            columns.push(ColumnDef {
                name: (*extra).into(),
                kind: ColumnType::Text,
            });
        }
        MetaMutation::PutTable {
            def: TableDef {
                name: QualifiedName::new(keyspace, name),
                partition_key: vec!["pk".into()],
                clustering_key: vec![],
                columns,
            },
        }
    }

    fn table(keyspace: &str, name: &str) -> MetaMutation {
        table_with(keyspace, name, &[])
    }

    fn view(keyspace: &str, name: &str, base: &str) -> MetaMutation {
        MetaMutation::PutView {
            def: ViewDef {
                name: QualifiedName::new(keyspace, name),
                base_table: QualifiedName::new(keyspace, base),
                partition_key: vec!["pk".into()],
                clustering_key: vec![],
                columns: vec![ColumnDef {
                    name: "pk".into(),
                    kind: ColumnType::Bigint,
                }],
                where_clause: "pk IS NOT NULL".into(),
            },
        }
    }

    fn test_db() -> (Arc<Database>, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store =
            SystemTablesStore::load_or_init(dir.path().join("system_tables.json")).expect("store");
        let db = Database::new(store, 2, SchemaEventBus::default()).expect("db");
        (Arc::new(db), dir)
    }

    #[tokio::test]
    async fn ddl_batch_publishes_to_every_shard() {
        let (db, _dir) = test_db();
        let mut events = db.events().subscribe();

        apply_schema_batch(&db, &[keyspace("ks"), table("ks", "t")], 100)
            .await
            .expect("apply");

        for shard in db.shards() {
            let schema = shard.schema();
            assert!(schema.keyspaces.contains_key("ks"));
            assert!(schema.tables.contains_key(&QualifiedName::new("ks", "t")));
        }
        assert_eq!(
            events.try_recv().expect("keyspace event"),
            SchemaEvent::KeyspaceCreated { name: "ks".into() }
        );
        assert_eq!(
            events.try_recv().expect("table event"),
            SchemaEvent::TableCreated {
                name: QualifiedName::new("ks", "t")
            }
        );
    }

    #[tokio::test]
    async fn phases_must_run_in_order() {
        let (db, _dir) = test_db();
        let mut applier = SchemaApplier::new(db.clone(), vec![keyspace("ks")]);

        let err = applier.update().await.expect_err("update before prepare");
        let phase = err.downcast::<PhaseError>().expect("phase error");
        assert_eq!(phase.expected, ApplyPhase::Prepared);
        assert_eq!(phase.actual, ApplyPhase::Idle);

        applier.prepare().expect("prepare");
        let err = applier.prepare().expect_err("prepare twice");
        assert!(err.downcast_ref::<PhaseError>().is_some());
    }

    #[tokio::test]
    async fn replayed_batch_skips_shard_publication() {
        let (db, _dir) = test_db();
        let batch = vec![keyspace("ks"), table("ks", "t")];
        apply_schema_batch(&db, &batch, 100).await.expect("apply");

        // Diverge one shard by hand; a replay must leave it alone.
        db.shard(0).expect("shard").update_schema(|current| {
            let mut next = current.clone();
            next.tables.clear();
            next
        });

        apply_schema_batch(&db, &batch, 100).await.expect("replay");
        assert!(db.shard(0).expect("shard").schema().tables.is_empty());
    }

    #[tokio::test]
    async fn create_and_drop_in_one_batch_nets_out() {
        let (db, _dir) = test_db();
        apply_schema_batch(&db, &[keyspace("ks")], 100)
            .await
            .expect("seed");
        let mut events = db.events().subscribe();

        let temp = QualifiedName::new("ks", "temp");
        apply_schema_batch(
            &db,
            &[
                table("ks", "temp"),
                MetaMutation::DropTable { name: temp.clone() },
            ],
            200,
        )
        .await
        .expect("apply");

        assert!(!db.store().snapshot().schema.tables.contains_key(&temp));
        for shard in db.shards() {
            assert!(shard.schema().tables.is_empty());
        }
        assert!(events.try_recv().is_err(), "a no-op diff emits no events");
    }

    #[tokio::test]
    async fn table_and_its_type_can_land_in_one_batch() {
        let (db, _dir) = test_db();
        let put_type = MetaMutation::PutType {
            def: UserTypeDef {
                name: QualifiedName::new("ks", "address"),
                fields: vec![("street".into(), ColumnType::Text)],
            },
        };
        let put_table = MetaMutation::PutTable {
            def: TableDef {
                name: QualifiedName::new("ks", "users"),
                partition_key: vec!["id".into()],
                clustering_key: vec![],
                columns: vec![
                    ColumnDef {
                        name: "id".into(),
                        kind: ColumnType::Bigint,
                    },
                    ColumnDef {
                        name: "home".into(),
                        kind: ColumnType::UserDefined(QualifiedName::new("ks", "address")),
                    },
                ],
            },
        };

        apply_schema_batch(&db, &[keyspace("ks"), put_type, put_table], 100)
            .await
            .expect("apply");

        let schema = db.shard(1).expect("shard").schema();
        let users = schema
            .tables
            .get(&QualifiedName::new("ks", "users"))
            .expect("table");
        let home = users
            .columns
            .iter()
            .find(|c| c.name == "home")
            .expect("column");
        assert!(home.user_type.is_some());
    }

    #[tokio::test]
    async fn altered_table_reaches_shards_and_listeners() {
        let (db, _dir) = test_db();
        apply_schema_batch(&db, &[keyspace("ks"), table("ks", "t")], 100)
            .await
            .expect("seed");
        let mut events = db.events().subscribe();

        apply_schema_batch(&db, &[table_with("ks", "t", &["note"])], 200)
            .await
            .expect("alter");

        let schema = db.shard(0).expect("shard").schema();
        let t = schema
            .tables
            .get(&QualifiedName::new("ks", "t"))
            .expect("table");
        assert_eq!(t.columns.len(), 2);
        assert_eq!(
            events.try_recv().expect("event"),
            SchemaEvent::TableAltered {
                name: QualifiedName::new("ks", "t")
            }
        );
    }

    #[tokio::test]
    async fn overlapping_ddl_serializes_on_table_locks() {
        let (db, _dir) = test_db();
        apply_schema_batch(&db, &[keyspace("ks"), table("ks", "t")], 100)
            .await
            .expect("seed");

        let alter = table_with("ks", "t", &["first"]);
        let mut held = SchemaApplier::new(db.clone(), vec![alter.clone()]);
        held.prepare().expect("prepare");
        assert!(db.store().apply_batch(&[alter], 200).expect("persist"));
        held.update().await.expect("update");

        let contender = {
            let db = db.clone();
            tokio::spawn(async move {
                apply_schema_batch(&db, &[table_with("ks", "t", &["second"])], 300).await
            })
        };
        tokio::task::yield_now().await;
        assert!(!contender.is_finished(), "locks must hold until commit");

        held.commit().await.expect("commit");
        held.notify().expect("notify");
        contender.await.expect("join").expect("second alter");

        let schema = db.shard(0).expect("shard").schema();
        let t = schema
            .tables
            .get(&QualifiedName::new("ks", "t"))
            .expect("table");
        assert!(t.columns.iter().any(|c| c.name == "second"));
    }

    #[tokio::test]
    async fn work_queue_batches_bypass_the_applier() {
        let (db, _dir) = test_db();
        apply_schema_batch(&db, &[keyspace("ks"), table("ks", "t"), view("ks", "v", "t")], 100)
            .await
            .expect("seed");
        let mut events = db.events().subscribe();

        let view_name = QualifiedName::new("ks", "v");
        apply_schema_batch(
            &db,
            &[MetaMutation::PutViewBuildTask {
                view: view_name.clone(),
                host: 1,
                shard: 0,
                range: TokenRange::full(),
            }],
            200,
        )
        .await
        .expect("apply");

        assert!(db
            .store()
            .snapshot()
            .view_build_tasks
            .contains_key(&view_name));
        assert!(events.try_recv().is_err(), "work queue changes are silent");
    }
}
