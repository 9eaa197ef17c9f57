//! Persisted system metadata: schema definitions and coordination state.
//!
//! One JSON document on disk holds everything the metadata layer owns:
//! schema definitions, the view-build work queue, and the set of built
//! views. Mutations arrive in committed batches; a batch is validated
//! against a scratch copy first, so a rejected batch leaves no trace.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::mutation::MetaMutation;
use crate::schema::{AggregateDef, FunctionDef, KeyspaceDef, TableDef, UserTypeDef, ViewDef};
use crate::types::{BuildTaskKey, QualifiedName, TokenRange};

/// Work queue of view build tasks: per view, per (host, shard), the token
/// range that placement still has to build.
pub type ViewBuildTaskMap = BTreeMap<QualifiedName, BTreeMap<BuildTaskKey, TokenRange>>;

/// Persisted schema definitions, the part of the system tables the schema
/// applier reads and diffs.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchemaState {
    pub keyspaces: BTreeMap<String, KeyspaceDef>,
    pub tables: BTreeMap<QualifiedName, TableDef>,
    pub views: BTreeMap<QualifiedName, ViewDef>,
    pub types: BTreeMap<QualifiedName, UserTypeDef>,
    pub functions: BTreeMap<QualifiedName, FunctionDef>,
    pub aggregates: BTreeMap<QualifiedName, AggregateDef>,
}

/// Everything this node persists about cluster metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemTables {
    pub epoch: u64,
    /// Write timestamp of the last applied batch; replays are detected by
    /// comparing against it.
    pub last_applied_at: i64,
    pub schema: SchemaState,
    #[serde(default)]
    pub view_build_tasks: ViewBuildTaskMap,
    #[serde(default)]
    pub built_views: BTreeSet<QualifiedName>,
}

impl SystemTables {
    pub fn new() -> Self {
        Self {
            epoch: 1,
            last_applied_at: 0,
            schema: SchemaState::default(),
            view_build_tasks: BTreeMap::new(),
            built_views: BTreeSet::new(),
        }
    }
}

impl Default for SystemTables {
    fn default() -> Self {
        Self::new()
    }
}

/// On-disk store for the system tables.
pub struct SystemTablesStore {
    state: Arc<RwLock<SystemTables>>,
    path: PathBuf,
}

impl SystemTablesStore {
    pub fn load_or_init(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Ok(data) = fs::read(&path) {
            let state: SystemTables =
                serde_json::from_slice(&data).context("parse system tables")?;
            return Ok(Self {
                state: Arc::new(RwLock::new(state)),
                path,
            });
        }

        let store = Self {
            state: Arc::new(RwLock::new(SystemTables::new())),
            path,
        };
        store.persist()?;
        Ok(store)
    }

    pub fn snapshot(&self) -> SystemTables {
        self.state.read().unwrap().clone()
    }

    pub fn epoch(&self) -> u64 {
        self.state.read().unwrap().epoch
    }

    /// Apply one committed batch.
    ///
    /// Returns `Ok(false)` when the batch's write timestamp is not newer
    /// than the last applied one, i.e. the batch is a replay and was
    /// skipped. Validation failures reject the whole batch and leave the
    /// state untouched.
    pub fn apply_batch(
        &self,
        mutations: &[MetaMutation],
        write_timestamp: i64,
    ) -> anyhow::Result<bool> {
        let mut state = self.state.write().unwrap();
        if write_timestamp <= state.last_applied_at {
            tracing::debug!(
                write_timestamp,
                last_applied_at = state.last_applied_at,
                "skipping replayed metadata batch"
            );
            return Ok(false);
        }

        let mut next = state.clone();
        for mutation in mutations {
            apply_mutation(&mut next, mutation)?;
        }
        next.epoch = next.epoch.saturating_add(1);
        next.last_applied_at = write_timestamp;
        *state = next;
        drop(state);
        self.persist()?;
        Ok(true)
    }

    fn persist(&self) -> anyhow::Result<()> {
        let state = self.state.read().unwrap();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).context("create system tables dir")?;
        }
        let data = serde_json::to_vec_pretty(&*state).context("serialize system tables")?;
        fs::write(&self.path, data).context("write system tables")?;
        Ok(())
    }
}

fn apply_mutation(state: &mut SystemTables, mutation: &MetaMutation) -> anyhow::Result<()> {
    match mutation {
        MetaMutation::PutViewBuildTask {
            view,
            host,
            shard,
            range,
        } => {
            if !state.schema.views.contains_key(view) {
                anyhow::bail!("cannot schedule build task for unknown view {view}");
            }
            state
                .view_build_tasks
                .entry(view.clone())
                .or_default()
                .insert(
                    BuildTaskKey {
                        host: *host,
                        shard: *shard,
                    },
                    range.clone(),
                );
            Ok(())
        }
        MetaMutation::DeleteViewBuildTasks { view } => {
            state.view_build_tasks.remove(view);
            Ok(())
        }
        MetaMutation::MarkViewBuilt { view } => {
            if !state.schema.views.contains_key(view) {
                anyhow::bail!("cannot mark unknown view {view} as built");
            }
            state.built_views.insert(view.clone());
            Ok(())
        }
        MetaMutation::DropView { name } => {
            // Build tasks for the dropped view stay behind on purpose; the
            // view building coordinator clears them in its own batch.
            state.built_views.remove(name);
            apply_schema_mutation(&mut state.schema, mutation)
        }
        other => apply_schema_mutation(&mut state.schema, other),
    }
}

/// Apply one schema-definition mutation, validating it against the current
/// state. Shared by the store and by the schema applier's pure `update`
/// computation so both sides agree on semantics.
pub fn apply_schema_mutation(
    schema: &mut SchemaState,
    mutation: &MetaMutation,
) -> anyhow::Result<()> {
    match mutation {
        MetaMutation::PutKeyspace { def } => {
            if def.name.is_empty() {
                anyhow::bail!("keyspace name cannot be empty");
            }
            let rf = match def.replication {
                crate::schema::ReplicationStrategy::Vnodes { replication_factor } => {
                    replication_factor
                }
                crate::schema::ReplicationStrategy::Tablets {
                    replication_factor, ..
                } => replication_factor,
            };
            if rf == 0 {
                anyhow::bail!("keyspace {} must have replication factor >= 1", def.name);
            }
            schema.keyspaces.insert(def.name.clone(), def.clone());
        }
        MetaMutation::DropKeyspace { name } => {
            if keyspace_has_objects(schema, name) {
                anyhow::bail!("keyspace {name} is not empty");
            }
            schema.keyspaces.remove(name);
        }
        MetaMutation::PutTable { def } => {
            validate_name(&def.name)?;
            require_keyspace(schema, &def.name.keyspace)?;
            if def.partition_key.is_empty() {
                anyhow::bail!("table {} must define a partition key", def.name);
            }
            validate_key_columns(&def.name, &def.partition_key, &def.clustering_key, &def.columns)?;
            for column in &def.columns {
                validate_type_reference(schema, &def.name, &column.name, &column.kind)?;
            }
            schema.tables.insert(def.name.clone(), def.clone());
        }
        MetaMutation::DropTable { name } => {
            let dependents: Vec<&QualifiedName> = schema
                .views
                .iter()
                .filter(|(_, v)| v.base_table == *name)
                .map(|(view_name, _)| view_name)
                .collect();
            if !dependents.is_empty() {
                anyhow::bail!("table {name} has dependent views: {dependents:?}");
            }
            schema.tables.remove(name);
        }
        MetaMutation::PutView { def } => {
            validate_name(&def.name)?;
            require_keyspace(schema, &def.name.keyspace)?;
            if def.base_table.keyspace != def.name.keyspace {
                anyhow::bail!(
                    "view {} cannot select from a different keyspace ({})",
                    def.name,
                    def.base_table
                );
            }
            if !schema.tables.contains_key(&def.base_table) {
                anyhow::bail!("view {} selects from unknown table {}", def.name, def.base_table);
            }
            if def.partition_key.is_empty() {
                anyhow::bail!("view {} must define a partition key", def.name);
            }
            validate_key_columns(&def.name, &def.partition_key, &def.clustering_key, &def.columns)?;
            for column in &def.columns {
                validate_type_reference(schema, &def.name, &column.name, &column.kind)?;
            }
            schema.views.insert(def.name.clone(), def.clone());
        }
        MetaMutation::DropView { name } => {
            schema.views.remove(name);
        }
        MetaMutation::PutType { def } => {
            validate_name(&def.name)?;
            require_keyspace(schema, &def.name.keyspace)?;
            if def.fields.is_empty() {
                anyhow::bail!("user type {} must have at least one field", def.name);
            }
            for (field, kind) in &def.fields {
                validate_type_reference(schema, &def.name, field, kind)?;
            }
            schema.types.insert(def.name.clone(), def.clone());
        }
        MetaMutation::DropType { name } => {
            if let Some(user) = type_user(schema, name) {
                anyhow::bail!("user type {name} is still used by {user}");
            }
            schema.types.remove(name);
        }
        MetaMutation::PutFunction { def } => {
            validate_name(&def.name)?;
            require_keyspace(schema, &def.name.keyspace)?;
            if def.language.is_empty() || def.body.is_empty() {
                anyhow::bail!("function {} must have a language and a body", def.name);
            }
            schema.functions.insert(def.name.clone(), def.clone());
        }
        MetaMutation::DropFunction { name } => {
            let dependent = schema.aggregates.values().find(|agg| {
                agg.name.keyspace == name.keyspace
                    && (agg.state_func == name.name
                        || agg.final_func.as_deref() == Some(name.name.as_str()))
            });
            if let Some(agg) = dependent {
                anyhow::bail!("function {name} is still used by aggregate {}", agg.name);
            }
            schema.functions.remove(name);
        }
        MetaMutation::PutAggregate { def } => {
            validate_name(&def.name)?;
            require_keyspace(schema, &def.name.keyspace)?;
            let state_func = QualifiedName::new(def.name.keyspace.clone(), def.state_func.clone());
            if !schema.functions.contains_key(&state_func) {
                anyhow::bail!("aggregate {} uses unknown state function {state_func}", def.name);
            }
            if let Some(final_func) = &def.final_func {
                let final_func = QualifiedName::new(def.name.keyspace.clone(), final_func.clone());
                if !schema.functions.contains_key(&final_func) {
                    anyhow::bail!(
                        "aggregate {} uses unknown final function {final_func}",
                        def.name
                    );
                }
            }
            schema.aggregates.insert(def.name.clone(), def.clone());
        }
        MetaMutation::DropAggregate { name } => {
            schema.aggregates.remove(name);
        }
        MetaMutation::PutViewBuildTask { .. }
        | MetaMutation::DeleteViewBuildTasks { .. }
        | MetaMutation::MarkViewBuilt { .. } => {
            anyhow::bail!("work queue mutation reached the schema state");
        }
    }
    Ok(())
}

fn validate_name(name: &QualifiedName) -> anyhow::Result<()> {
    if name.keyspace.is_empty() || name.name.is_empty() {
        anyhow::bail!("object name cannot be empty: {name:?}");
    }
    Ok(())
}

fn require_keyspace(schema: &SchemaState, keyspace: &str) -> anyhow::Result<()> {
    if !schema.keyspaces.contains_key(keyspace) {
        anyhow::bail!("keyspace {keyspace} does not exist");
    }
    Ok(())
}

fn validate_key_columns(
    owner: &QualifiedName,
    partition_key: &[String],
    clustering_key: &[String],
    columns: &[crate::schema::ColumnDef],
) -> anyhow::Result<()> {
    for key in partition_key.iter().chain(clustering_key) {
        if !columns.iter().any(|c| c.name == *key) {
            anyhow::bail!("key column {key} of {owner} is not defined");
        }
    }
    Ok(())
}

fn validate_type_reference(
    schema: &SchemaState,
    owner: &QualifiedName,
    column: &str,
    kind: &crate::schema::ColumnType,
) -> anyhow::Result<()> {
    let Some(referenced) = kind.referenced_user_type() else {
        return Ok(());
    };
    if referenced.keyspace != owner.keyspace {
        anyhow::bail!(
            "column {column} of {owner} references user type {referenced} outside its keyspace"
        );
    }
    if !schema.types.contains_key(referenced) {
        anyhow::bail!("column {column} of {owner} references unknown user type {referenced}");
    }
    Ok(())
}

fn keyspace_has_objects(schema: &SchemaState, keyspace: &str) -> bool {
    schema.tables.keys().any(|n| n.keyspace == keyspace)
        || schema.views.keys().any(|n| n.keyspace == keyspace)
        || schema.types.keys().any(|n| n.keyspace == keyspace)
        || schema.functions.keys().any(|n| n.keyspace == keyspace)
        || schema.aggregates.keys().any(|n| n.keyspace == keyspace)
}

/// Find something that still references the given user type.
fn type_user(schema: &SchemaState, name: &QualifiedName) -> Option<QualifiedName> {
    for (table_name, table) in &schema.tables {
        if table
            .columns
            .iter()
            .any(|c| c.kind.referenced_user_type() == Some(name))
        {
            return Some(table_name.clone());
        }
    }
    for (view_name, view) in &schema.views {
        if view
            .columns
            .iter()
            .any(|c| c.kind.referenced_user_type() == Some(name))
        {
            return Some(view_name.clone());
        }
    }
    for (type_name, def) in &schema.types {
        if type_name != name
            && def
                .fields
                .iter()
                .any(|(_, kind)| kind.referenced_user_type() == Some(name))
        {
            return Some(type_name.clone());
        }
    }
    for (func_name, def) in &schema.functions {
        let in_args = def
            .arg_types
            .iter()
            .any(|kind| kind.referenced_user_type() == Some(name));
        if in_args || def.return_type.referenced_user_type() == Some(name) {
            return Some(func_name.clone());
        }
    }
    for (agg_name, def) in &schema.aggregates {
        let in_args = def
            .arg_types
            .iter()
            .any(|kind| kind.referenced_user_type() == Some(name));
        if in_args || def.state_type.referenced_user_type() == Some(name) {
            return Some(agg_name.clone());
        }
    }
    None
}
