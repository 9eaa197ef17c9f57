//! Live, per-shard view of the schema.
//!
//! Each shard owns an immutable [`ShardSchema`] snapshot behind an atomic
//! pointer. Readers grab the current `Arc` and keep using it for as long
//! as they like; the schema applier publishes a new snapshot per shard by
//! swapping the pointer. Nothing in a published snapshot is ever mutated.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex, RwLock};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::events::SchemaEventBus;
use crate::schema::{
    AggregateDef, ColumnDef, FunctionDef, KeyspaceDef, TableDef, UserTypeDef, ViewDef,
};
use crate::system_tables::{SchemaState, SystemTablesStore};
use crate::types::{QualifiedName, ShardId};

/// A column with its user-defined type resolved, when it has one.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    pub name: String,
    pub kind: crate::schema::ColumnType,
    pub user_type: Option<Arc<UserTypeDef>>,
}

impl ColumnSchema {
    fn build(
        column: &ColumnDef,
        owner: &QualifiedName,
        lookup: &impl Fn(&QualifiedName) -> Option<Arc<UserTypeDef>>,
    ) -> anyhow::Result<Self> {
        let user_type = match column.kind.referenced_user_type() {
            Some(name) => Some(lookup(name).ok_or_else(|| {
                anyhow::anyhow!("unknown user type {name} for column {} of {owner}", column.name)
            })?),
            None => None,
        };
        Ok(Self {
            name: column.name.clone(),
            kind: column.kind.clone(),
            user_type,
        })
    }
}

/// A table definition with every column's type fully resolved.
#[derive(Debug, Clone)]
pub struct TableSchema {
    pub def: TableDef,
    pub columns: Vec<ColumnSchema>,
}

impl TableSchema {
    pub fn build(
        def: &TableDef,
        lookup: &impl Fn(&QualifiedName) -> Option<Arc<UserTypeDef>>,
    ) -> anyhow::Result<Self> {
        let columns = def
            .columns
            .iter()
            .map(|c| ColumnSchema::build(c, &def.name, lookup))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            def: def.clone(),
            columns,
        })
    }
}

/// A materialized view definition with resolved column types.
#[derive(Debug, Clone)]
pub struct ViewSchema {
    pub def: ViewDef,
    pub columns: Vec<ColumnSchema>,
}

impl ViewSchema {
    pub fn build(
        def: &ViewDef,
        lookup: &impl Fn(&QualifiedName) -> Option<Arc<UserTypeDef>>,
    ) -> anyhow::Result<Self> {
        let columns = def
            .columns
            .iter()
            .map(|c| ColumnSchema::build(c, &def.name, lookup))
            .collect::<anyhow::Result<Vec<_>>>()?;
        Ok(Self {
            def: def.clone(),
            columns,
        })
    }
}

/// One shard's immutable schema snapshot.
#[derive(Debug, Clone, Default)]
pub struct ShardSchema {
    pub keyspaces: BTreeMap<String, Arc<KeyspaceDef>>,
    pub tables: BTreeMap<QualifiedName, Arc<TableSchema>>,
    pub views: BTreeMap<QualifiedName, Arc<ViewSchema>>,
    pub types: BTreeMap<QualifiedName, Arc<UserTypeDef>>,
    pub functions: BTreeMap<QualifiedName, Arc<FunctionDef>>,
    pub aggregates: BTreeMap<QualifiedName, Arc<AggregateDef>>,
}

impl ShardSchema {
    /// Build a snapshot from persisted definitions, resolving user types.
    pub(crate) fn from_state(state: &SchemaState) -> anyhow::Result<Self> {
        let types: BTreeMap<QualifiedName, Arc<UserTypeDef>> = state
            .types
            .iter()
            .map(|(name, def)| (name.clone(), Arc::new(def.clone())))
            .collect();
        let lookup = |name: &QualifiedName| types.get(name).cloned();

        let mut tables = BTreeMap::new();
        for (name, def) in &state.tables {
            tables.insert(name.clone(), Arc::new(TableSchema::build(def, &lookup)?));
        }
        let mut views = BTreeMap::new();
        for (name, def) in &state.views {
            views.insert(name.clone(), Arc::new(ViewSchema::build(def, &lookup)?));
        }

        Ok(Self {
            keyspaces: state
                .keyspaces
                .iter()
                .map(|(name, def)| (name.clone(), Arc::new(def.clone())))
                .collect(),
            tables,
            views,
            types,
            functions: state
                .functions
                .iter()
                .map(|(name, def)| (name.clone(), Arc::new(def.clone())))
                .collect(),
            aggregates: state
                .aggregates
                .iter()
                .map(|(name, def)| (name.clone(), Arc::new(def.clone())))
                .collect(),
        })
    }
}

/// One shard: an id and the pointer to its current schema snapshot.
pub struct Shard {
    id: ShardId,
    schema: RwLock<Arc<ShardSchema>>,
}

impl Shard {
    fn new(id: ShardId, schema: ShardSchema) -> Self {
        Self {
            id,
            schema: RwLock::new(Arc::new(schema)),
        }
    }

    pub fn id(&self) -> ShardId {
        self.id
    }

    /// Current schema snapshot. The returned `Arc` stays valid across
    /// later swaps.
    pub fn schema(&self) -> Arc<ShardSchema> {
        self.schema.read().unwrap().clone()
    }

    /// Publish a new snapshot derived from the current one. The closure
    /// runs under the shard's write lock so concurrent publishers cannot
    /// lose each other's changes.
    pub(crate) fn update_schema(&self, f: impl FnOnce(&ShardSchema) -> ShardSchema) {
        let mut slot = self.schema.write().unwrap();
        let next = f(&slot);
        *slot = Arc::new(next);
    }
}

/// Async mutexes keyed by table name. The schema applier holds the locks
/// of every table a batch touches from the update phase until commit, so
/// overlapping DDL on the same tables serializes.
#[derive(Default)]
pub struct TableLockRegistry {
    locks: StdMutex<HashMap<QualifiedName, Arc<AsyncMutex<()>>>>,
}

impl TableLockRegistry {
    /// Lock every name in the set. `BTreeSet` iteration is ordered, so
    /// all callers acquire in the same order and cannot deadlock.
    pub async fn acquire(&self, names: &BTreeSet<QualifiedName>) -> Vec<OwnedMutexGuard<()>> {
        let handles: Vec<Arc<AsyncMutex<()>>> = {
            let mut locks = self.locks.lock().unwrap();
            names
                .iter()
                .map(|name| locks.entry(name.clone()).or_default().clone())
                .collect()
        };
        let mut guards = Vec::with_capacity(handles.len());
        for handle in handles {
            guards.push(handle.lock_owned().await);
        }
        guards
    }

    pub fn release(&self, guards: Vec<OwnedMutexGuard<()>>) {
        drop(guards);
        let mut locks = self.locks.lock().unwrap();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}

/// The node-local database: persisted system tables plus one live schema
/// snapshot per shard.
pub struct Database {
    shards: Vec<Shard>,
    table_locks: TableLockRegistry,
    store: SystemTablesStore,
    events: SchemaEventBus,
}

impl Database {
    /// Open the database, bootstrapping every shard's live schema from
    /// the persisted system tables.
    pub fn new(
        store: SystemTablesStore,
        shard_count: u32,
        events: SchemaEventBus,
    ) -> anyhow::Result<Self> {
        if shard_count == 0 {
            anyhow::bail!("database needs at least one shard");
        }
        let initial = ShardSchema::from_state(&store.snapshot().schema)?;
        let shards = (0..shard_count)
            .map(|id| Shard::new(id, initial.clone()))
            .collect();
        Ok(Self {
            shards,
            table_locks: TableLockRegistry::default(),
            store,
            events,
        })
    }

    pub fn shards(&self) -> &[Shard] {
        &self.shards
    }

    pub fn shard(&self, id: ShardId) -> Option<&Shard> {
        self.shards.get(id as usize)
    }

    pub fn shard_count(&self) -> u32 {
        self.shards.len() as u32
    }

    pub fn store(&self) -> &SystemTablesStore {
        &self.store
    }

    pub fn events(&self) -> &SchemaEventBus {
        &self.events
    }

    pub(crate) fn table_locks(&self) -> &TableLockRegistry {
        &self.table_locks
    }
}
