//! Identity and token types shared across the metadata layer.

use std::fmt;
use std::str::FromStr;

use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use keel_consensus::log::NodeId;

/// Index of a shard within one node.
pub type ShardId = u32;

/// Keyspace-qualified object name, the identity of tables, views, types,
/// functions, and aggregates.
///
/// Serialized as `"keyspace.name"` so it can key JSON maps directly.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedName {
    pub keyspace: String,
    pub name: String,
}

impl QualifiedName {
    pub fn new(keyspace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            keyspace: keyspace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for QualifiedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.keyspace, self.name)
    }
}

impl FromStr for QualifiedName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((keyspace, name)) if !keyspace.is_empty() && !name.is_empty() => {
                Ok(Self::new(keyspace, name))
            }
            _ => anyhow::bail!("malformed qualified name {s:?}, expected keyspace.name"),
        }
    }
}

impl Serialize for QualifiedName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for QualifiedName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// Position on the token ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Token(pub i64);

impl Token {
    pub const MIN: Token = Token(i64::MIN);
    pub const MAX: Token = Token(i64::MAX);
}

/// Closed token interval `[start, end]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRange {
    pub start: Token,
    pub end: Token,
}

impl TokenRange {
    /// The whole ring.
    pub fn full() -> Self {
        Self {
            start: Token::MIN,
            end: Token::MAX,
        }
    }
}

/// Placement of one view build task: a shard on a host.
///
/// Serialized as `"host:shard"` so it can key JSON maps directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BuildTaskKey {
    pub host: NodeId,
    pub shard: ShardId,
}

impl fmt::Display for BuildTaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.shard)
    }
}

impl FromStr for BuildTaskKey {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parsed = s.split_once(':').and_then(|(host, shard)| {
            Some(BuildTaskKey {
                host: host.parse().ok()?,
                shard: shard.parse().ok()?,
            })
        });
        match parsed {
            Some(key) => Ok(key),
            None => anyhow::bail!("malformed build task key {s:?}, expected host:shard"),
        }
    }
}

impl Serialize for BuildTaskKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BuildTaskKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}
