//! In-process metadata log.
//!
//! `LocalLog` provides the full guard/commit contract for a single node:
//! one mutex serializes commits, the epoch is compared and advanced under
//! that mutex, and the command applier runs in commit order. It backs
//! embedded deployments and tests; replicated deployments supply their own
//! [`MetadataLog`] over a consensus group.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::types::{CommandApplier, Epoch, Guard, LogError, MetadataLog};

struct LogInner {
    epoch: Epoch,
    last_write_timestamp: i64,
}

/// Single-node, in-memory metadata log.
pub struct LocalLog {
    applier: Arc<dyn CommandApplier>,
    inner: Mutex<LogInner>,
}

impl LocalLog {
    pub fn new(applier: Arc<dyn CommandApplier>) -> Self {
        Self {
            applier,
            inner: Mutex::new(LogInner {
                epoch: 0,
                last_write_timestamp: 0,
            }),
        }
    }

    /// Current log epoch. Mainly useful for tests and stats.
    pub async fn epoch(&self) -> Epoch {
        self.inner.lock().await.epoch
    }
}

#[async_trait]
impl MetadataLog for LocalLog {
    async fn start_operation(&self, abort: &CancellationToken) -> Result<Guard, LogError> {
        if abort.is_cancelled() {
            return Err(LogError::Aborted);
        }
        // Waiting for the mutex is the wait for a stable read point: any
        // in-flight commit finishes before the guard observes the epoch.
        let mut inner = tokio::select! {
            () = abort.cancelled() => return Err(LogError::Aborted),
            inner = self.inner.lock() => inner,
        };
        let reserved = unix_time_us().max(inner.last_write_timestamp.saturating_add(1));
        inner.last_write_timestamp = reserved;
        Ok(Guard::new(inner.epoch, reserved))
    }

    async fn commit(
        &self,
        mutations: Vec<Vec<u8>>,
        guard: Guard,
        abort: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<(), LogError> {
        if mutations.is_empty() {
            return Ok(());
        }
        if abort.is_cancelled() {
            return Err(LogError::Aborted);
        }
        let started = Instant::now();
        let mut inner = match timeout {
            Some(limit) => tokio::select! {
                () = abort.cancelled() => return Err(LogError::Aborted),
                locked = tokio::time::timeout(limit, self.inner.lock()) => match locked {
                    Ok(inner) => inner,
                    Err(_) => {
                        return Err(LogError::Timeout {
                            elapsed: started.elapsed(),
                        })
                    }
                },
            },
            None => tokio::select! {
                () = abort.cancelled() => return Err(LogError::Aborted),
                inner = self.inner.lock() => inner,
            },
        };

        if guard.epoch() != inner.epoch {
            return Err(LogError::Conflict {
                observed: guard.epoch(),
                current: inner.epoch,
            });
        }

        // The batch is accepted from here on: the epoch advances and the
        // abort token is no longer consulted. An apply failure consumes the
        // batch all the same, so a stale retry conflicts instead of
        // double-applying.
        inner.epoch = inner.epoch.saturating_add(1);
        if inner.last_write_timestamp < guard.write_timestamp() {
            inner.last_write_timestamp = guard.write_timestamp();
        }
        match self
            .applier
            .apply(&mutations, guard.write_timestamp())
            .await
        {
            Ok(()) => {
                tracing::debug!(
                    epoch = inner.epoch,
                    mutations = mutations.len(),
                    "committed metadata batch"
                );
                Ok(())
            }
            Err(err) => {
                tracing::error!(
                    error = ?err,
                    epoch = inner.epoch,
                    "state machine failed to apply committed batch"
                );
                Err(LogError::Apply(format!("{err:#}")))
            }
        }
    }
}

fn unix_time_us() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros().min(i64::MAX as u128) as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::Batch;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct RecordingApplier {
        batches: StdMutex<Vec<(Vec<Vec<u8>>, i64)>>,
    }

    #[async_trait]
    impl CommandApplier for RecordingApplier {
        async fn apply(&self, mutations: &[Vec<u8>], write_timestamp: i64) -> anyhow::Result<()> {
            self.batches
                .lock()
                .unwrap()
                .push((mutations.to_vec(), write_timestamp));
            Ok(())
        }
    }

    struct FailingApplier;

    #[async_trait]
    impl CommandApplier for FailingApplier {
        async fn apply(&self, _mutations: &[Vec<u8>], _write_timestamp: i64) -> anyhow::Result<()> {
            anyhow::bail!("apply exploded")
        }
    }

    fn log_with_recorder() -> (Arc<LocalLog>, Arc<RecordingApplier>) {
        let applier = Arc::new(RecordingApplier::default());
        let log = Arc::new(LocalLog::new(applier.clone()));
        (log, applier)
    }

    #[tokio::test]
    async fn committed_batch_reaches_applier_with_guard_timestamp() {
        let (log, applier) = log_with_recorder();
        let abort = CancellationToken::new();

        let guard = log.start_operation(&abort).await.expect("guard");
        let ts = guard.write_timestamp();
        let mut batch = Batch::new(guard);
        batch.add_mutation(b"one".to_vec());
        batch.add_mutation(b"two".to_vec());
        batch
            .commit(log.as_ref(), &abort, None)
            .await
            .expect("commit");

        let batches = applier.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, vec![b"one".to_vec(), b"two".to_vec()]);
        assert_eq!(batches[0].1, ts);
        drop(batches);
        assert_eq!(log.epoch().await, 1);
    }

    #[tokio::test]
    async fn stale_guard_conflicts_and_leaves_log_untouched() {
        let (log, applier) = log_with_recorder();
        let abort = CancellationToken::new();

        let first = log.start_operation(&abort).await.expect("first guard");
        let second = log.start_operation(&abort).await.expect("second guard");

        let mut winner = Batch::new(first);
        winner.add_mutation(b"win".to_vec());
        winner
            .commit(log.as_ref(), &abort, None)
            .await
            .expect("first commit");

        let mut loser = Batch::new(second);
        loser.add_mutation(b"lose".to_vec());
        match loser.commit(log.as_ref(), &abort, None).await {
            Err(LogError::Conflict { observed, current }) => {
                assert_eq!(observed, 0);
                assert_eq!(current, 1);
            }
            other => panic!("expected conflict, got {other:?}"),
        }

        assert_eq!(applier.batches.lock().unwrap().len(), 1);
        assert_eq!(log.epoch().await, 1);
    }

    #[tokio::test]
    async fn empty_batch_commit_is_a_noop() {
        let (log, applier) = log_with_recorder();
        let abort = CancellationToken::new();

        let guard = log.start_operation(&abort).await.expect("guard");
        Batch::new(guard)
            .commit(log.as_ref(), &abort, None)
            .await
            .expect("empty commit");

        assert!(applier.batches.lock().unwrap().is_empty());
        assert_eq!(log.epoch().await, 0);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_guard_and_commit() {
        let (log, applier) = log_with_recorder();
        let abort = CancellationToken::new();

        let guard = log.start_operation(&abort).await.expect("guard");
        abort.cancel();

        assert!(matches!(
            log.start_operation(&abort).await,
            Err(LogError::Aborted)
        ));

        let mut batch = Batch::new(guard);
        batch.add_mutation(b"late".to_vec());
        assert!(matches!(
            batch.commit(log.as_ref(), &abort, None).await,
            Err(LogError::Aborted)
        ));
        assert!(applier.batches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_timestamps_strictly_increase_across_guards() {
        let (log, _applier) = log_with_recorder();
        let abort = CancellationToken::new();

        let mut last = 0;
        for _ in 0..5 {
            let guard = log.start_operation(&abort).await.expect("guard");
            assert!(guard.write_timestamp() > last);
            last = guard.write_timestamp();
            let mut batch = Batch::new(guard);
            batch.add_mutation(b"m".to_vec());
            batch
                .commit(log.as_ref(), &abort, None)
                .await
                .expect("commit");
        }
    }

    #[tokio::test]
    async fn apply_failure_still_consumes_the_batch() {
        let log = Arc::new(LocalLog::new(Arc::new(FailingApplier)));
        let abort = CancellationToken::new();

        let guard = log.start_operation(&abort).await.expect("guard");
        let mut batch = Batch::new(guard);
        batch.add_mutation(b"boom".to_vec());
        match batch.commit(log.as_ref(), &abort, None).await {
            Err(LogError::Apply(message)) => assert!(message.contains("apply exploded")),
            other => panic!("expected apply error, got {other:?}"),
        }

        // The epoch advanced, so retrying with a pre-failure guard conflicts.
        assert_eq!(log.epoch().await, 1);
    }
}
