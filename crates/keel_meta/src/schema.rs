//! Schema definition records persisted in the system tables.
//!
//! These are the wire/disk representations. Live, per-shard schema objects
//! built from them (with user types resolved) live in `database`.

use serde::{Deserialize, Serialize};

use crate::types::QualifiedName;

/// How a keyspace places replicas.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ReplicationStrategy {
    /// Classic token-range ownership per node.
    Vnodes { replication_factor: usize },
    /// Tablet-based replication; views in such keyspaces are built through
    /// the view building coordinator's task queue.
    Tablets {
        replication_factor: usize,
        initial_tablets: usize,
    },
}

/// Keyspace definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KeyspaceDef {
    pub name: String,
    pub replication: ReplicationStrategy,
    pub durable_writes: bool,
}

impl KeyspaceDef {
    pub fn uses_tablets(&self) -> bool {
        matches!(self.replication, ReplicationStrategy::Tablets { .. })
    }
}

/// Column type, possibly referencing a user-defined type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Bigint,
    Text,
    Blob,
    Boolean,
    Double,
    Timestamp,
    List(Box<ColumnType>),
    Set(Box<ColumnType>),
    Map(Box<ColumnType>, Box<ColumnType>),
    UserDefined(QualifiedName),
}

impl ColumnType {
    /// The user-defined type this column type references, if any, however
    /// deeply nested in collections.
    pub fn referenced_user_type(&self) -> Option<&QualifiedName> {
        match self {
            ColumnType::UserDefined(name) => Some(name),
            ColumnType::List(inner) | ColumnType::Set(inner) => inner.referenced_user_type(),
            ColumnType::Map(key, value) => key
                .referenced_user_type()
                .or_else(|| value.referenced_user_type()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ColumnDef {
    pub name: String,
    pub kind: ColumnType,
}

/// Table definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TableDef {
    pub name: QualifiedName,
    pub partition_key: Vec<String>,
    pub clustering_key: Vec<String>,
    pub columns: Vec<ColumnDef>,
}

/// Materialized view definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ViewDef {
    pub name: QualifiedName,
    pub base_table: QualifiedName,
    pub partition_key: Vec<String>,
    pub clustering_key: Vec<String>,
    pub columns: Vec<ColumnDef>,
    pub where_clause: String,
}

/// User-defined type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UserTypeDef {
    pub name: QualifiedName,
    pub fields: Vec<(String, ColumnType)>,
}

/// User-defined function.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FunctionDef {
    pub name: QualifiedName,
    pub arg_types: Vec<ColumnType>,
    pub return_type: ColumnType,
    pub language: String,
    pub body: String,
}

/// User-defined aggregate built from functions in the same keyspace.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AggregateDef {
    pub name: QualifiedName,
    pub arg_types: Vec<ColumnType>,
    pub state_func: String,
    pub final_func: Option<String>,
    pub state_type: ColumnType,
}
