//! Shared types for the guarded metadata commit protocol.
//!
//! These types are kept in a small, dependency-light module because they are
//! used by both log implementations and every layer that commits metadata.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Logical node identifier within the cluster.
pub type NodeId = u64;
/// State generation of the metadata log; advances by one per committed batch.
pub type Epoch = u64;

/// Proof of a consistent read point on the metadata log.
///
/// A guard pins the epoch the holder read state at. It is consumed by the
/// batch built against that state; if any other batch commits in between,
/// the commit fails with [`LogError::Conflict`] instead of clobbering the
/// newer state. Guards are single-use and cannot be cloned.
#[derive(Debug)]
#[must_use = "a guard pins a read point and must be used to build a batch"]
pub struct Guard {
    epoch: Epoch,
    write_timestamp: i64,
}

impl Guard {
    /// Construct a guard for the given read point.
    ///
    /// Only log implementations should create guards; everyone else obtains
    /// them through [`MetadataLog::start_operation`].
    pub fn new(epoch: Epoch, write_timestamp: i64) -> Self {
        Self {
            epoch,
            write_timestamp,
        }
    }

    /// The log epoch observed when this guard was taken.
    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    /// Timestamp (microseconds) for mutations written under this guard.
    ///
    /// Strictly monotonic across guards handed out by one log: a later guard
    /// always carries a larger timestamp.
    pub fn write_timestamp(&self) -> i64 {
        self.write_timestamp
    }
}

/// A guarded batch of encoded metadata mutations.
///
/// The batch owns its guard; committing consumes the batch, so a batch can
/// never be submitted twice. Committing an empty batch is a no-op that does
/// not touch the log.
#[derive(Debug)]
pub struct Batch {
    guard: Guard,
    mutations: Vec<Vec<u8>>,
}

impl Batch {
    pub fn new(guard: Guard) -> Self {
        Self {
            guard,
            mutations: Vec::new(),
        }
    }

    pub fn add_mutation(&mut self, mutation: Vec<u8>) {
        self.mutations.push(mutation);
    }

    pub fn add_mutations(&mut self, mutations: impl IntoIterator<Item = Vec<u8>>) {
        self.mutations.extend(mutations);
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    /// Timestamp mutations in this batch should be written with.
    pub fn write_timestamp(&self) -> i64 {
        self.guard.write_timestamp()
    }

    /// Submit the batch through the log, consuming it.
    ///
    /// `abort` interrupts waiting (the batch then fails with
    /// [`LogError::Aborted`]); once the log has accepted the batch for apply,
    /// cancellation no longer rolls it back. `timeout` bounds the wait for
    /// the commit to be accepted.
    pub async fn commit(
        self,
        log: &dyn MetadataLog,
        abort: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<(), LogError> {
        if self.mutations.is_empty() {
            return Ok(());
        }
        log.commit(self.mutations, self.guard, abort, timeout).await
    }
}

/// Errors surfaced by guard acquisition and batch commit.
#[derive(Debug, Error)]
pub enum LogError {
    /// Another batch committed after the guard was taken. Retryable: take a
    /// fresh guard, rebuild the batch against current state, commit again.
    #[error("commit conflict: guard observed epoch {observed}, log is at epoch {current}")]
    Conflict { observed: Epoch, current: Epoch },

    /// The commit deadline elapsed before the log accepted the batch; the
    /// outcome is unknown to the caller.
    #[error("commit timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    /// Shutdown was requested while waiting. Control loops exit quietly on
    /// this; one-shot callers treat it as terminal.
    #[error("operation aborted by shutdown")]
    Aborted,

    /// The state machine failed to apply a batch the log had already
    /// accepted. The batch is consumed either way.
    #[error("state machine failed to apply committed batch: {0}")]
    Apply(String),
}

impl LogError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, LogError::Conflict { .. })
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, LogError::Aborted)
    }
}

/// Linearizable metadata log consumed by the coordination layer.
///
/// The log is engine-agnostic; concrete implementations can be backed by a
/// replicated consensus group or by the in-process [`crate::log::LocalLog`].
/// Commands are opaque bytes to the log; the embedder's [`CommandApplier`]
/// gives them meaning.
#[async_trait]
pub trait MetadataLog: Send + Sync + 'static {
    /// Wait for a stable read point and return a guard pinning it.
    ///
    /// Fails with [`LogError::Aborted`] if `abort` is already cancelled or
    /// fires while waiting.
    async fn start_operation(&self, abort: &CancellationToken) -> Result<Guard, LogError>;

    /// Linearized submit of a guarded batch.
    ///
    /// Fails with [`LogError::Conflict`] iff another batch committed since
    /// `guard` was taken. Implementations must apply accepted batches
    /// exactly once, in commit order.
    async fn commit(
        &self,
        mutations: Vec<Vec<u8>>,
        guard: Guard,
        abort: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<(), LogError>;
}

/// Downstream state machine invoked for every committed batch.
#[async_trait]
pub trait CommandApplier: Send + Sync + 'static {
    /// Apply one committed batch. Called exactly once per batch, in commit
    /// order, with the batch's write timestamp.
    async fn apply(&self, mutations: &[Vec<u8>], write_timestamp: i64) -> anyhow::Result<()>;
}
