//! Shared helpers for integration tests.

use std::time::{Duration, Instant};

use keel_meta::mutation::MetaMutation;
use keel_meta::schema::{
    ColumnDef, ColumnType, KeyspaceDef, ReplicationStrategy, TableDef, ViewDef,
};
use keel_meta::types::QualifiedName;

/// Upper bound on waiting for background work to settle.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(5);

pub fn keyspace(name: &str) -> MetaMutation {
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

pub fn vnodes_keyspace(name: &str) -> MetaMutation {
    MetaMutation::PutKeyspace {
        def: KeyspaceDef {
            name: name.into(),
            replication: ReplicationStrategy::Vnodes {
                replication_factor: 3,
            },
            durable_writes: true,
        },
    }
}

pub fn table(keyspace: &str, name: &str) -> MetaMutation {
    MetaMutation::PutTable {
        def: TableDef {
            name: QualifiedName::new(keyspace, name),
            partition_key: vec!["pk".into()],
            clustering_key: vec![],
            columns: vec![ColumnDef {
                name: "pk".into(),
                kind: ColumnType::Bigint,
            }],
        },
    }
}

pub fn view(keyspace: &str, name: &str, base: &str) -> MetaMutation {
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

/// Poll `check` until it holds or [`POLL_TIMEOUT`] expires.
pub async fn wait_for(what: &str, check: impl Fn() -> bool) {
    let deadline = Instant::now() + POLL_TIMEOUT;
    while Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
