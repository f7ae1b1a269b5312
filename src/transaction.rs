//! Transactional batching shared by the send and receive paths.

use crate::error::{HarnessError, ResultExt};
use crate::transport::Session;

/// Commits a session every `batch_size` units of work.
///
/// A batcher for a non-transacted run never commits. Each phase uses a fresh
/// batcher so that `finish` only ever covers that phase's remainder, giving
/// `ceil(M / B)` commits for `M` messages in batches of `B`.
#[derive(Debug, Clone)]
pub struct TransactionBatcher {
    batch_size: Option<u64>,
    pending: u64,
    commits: u64,
}

impl TransactionBatcher {
    pub fn new(transacted: bool, batch_size: u64) -> Self {
        Self {
            batch_size: (transacted && batch_size > 0).then_some(batch_size),
            pending: 0,
            commits: 0,
        }
    }

    /// Account for one unit of work and commit if a batch just filled up.
    /// Returns whether a commit happened.
    pub async fn record(&mut self, session: &dyn Session) -> Result<bool, HarnessError> {
        let Some(batch_size) = self.batch_size else {
            return Ok(false);
        };
        self.pending += 1;
        if self.pending < batch_size {
            return Ok(false);
        }
        self.commit(session).await?;
        Ok(true)
    }

    /// Commit whatever the last partial batch left uncommitted
    pub async fn finish(&mut self, session: &dyn Session) -> Result<bool, HarnessError> {
        if self.batch_size.is_none() || self.pending == 0 {
            return Ok(false);
        }
        self.commit(session).await?;
        Ok(true)
    }

    pub fn commits(&self) -> u64 {
        self.commits
    }

    pub fn pending(&self) -> u64 {
        self.pending
    }

    async fn commit(&mut self, session: &dyn Session) -> Result<(), HarnessError> {
        session
            .commit()
            .await
            .transport(format!("committing a batch of {}", self.pending))?;
        self.pending = 0;
        self.commits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{
        AcknowledgeMode, ConnectionFactory, MemoryBroker, MemoryConnectionFactory,
    };
    use std::sync::Arc;

    async fn session(broker: &MemoryBroker, mode: AcknowledgeMode) -> Arc<dyn Session> {
        let connection = MemoryConnectionFactory::new(broker.clone())
            .create_connection()
            .await
            .unwrap();
        connection.create_session(mode).await.unwrap()
    }

    async fn run_phase(batcher: &mut TransactionBatcher, session: &dyn Session, messages: u64) {
        for _ in 0..messages {
            batcher.record(session).await.unwrap();
        }
        batcher.finish(session).await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_count_is_ceiling_of_batches() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Transacted).await;

        let cases = [(25, 10, 3), (30, 10, 3), (1, 10, 1), (0, 10, 0), (7, 1, 7)];
        for (messages, batch_size, expected) in cases {
            let mut batcher = TransactionBatcher::new(true, batch_size);
            run_phase(&mut batcher, session.as_ref(), messages).await;
            assert_eq!(
                batcher.commits(),
                expected,
                "{} messages / batch {}",
                messages,
                batch_size
            );
            assert_eq!(batcher.pending(), 0);
        }
        assert_eq!(broker.stats().commits, 3 + 3 + 1 + 7);
    }

    #[tokio::test]
    async fn test_record_reports_batch_boundaries() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let mut batcher = TransactionBatcher::new(true, 2);

        assert!(!batcher.record(session.as_ref()).await.unwrap());
        assert!(batcher.record(session.as_ref()).await.unwrap());
        assert!(!batcher.finish(session.as_ref()).await.unwrap());
    }

    #[tokio::test]
    async fn test_non_transacted_never_commits() {
        let broker = MemoryBroker::new();
        let session = session(&broker, AcknowledgeMode::Auto).await;
        let mut batcher = TransactionBatcher::new(false, 10);
        run_phase(&mut batcher, session.as_ref(), 35).await;
        assert_eq!(batcher.commits(), 0);
        assert_eq!(broker.stats().commits, 0);
    }

    #[tokio::test]
    async fn test_commit_failure_keeps_pending_work() {
        let broker = MemoryBroker::new();
        broker.fail_commits_after(0);
        let session = session(&broker, AcknowledgeMode::Transacted).await;
        let mut batcher = TransactionBatcher::new(true, 1);

        let err = batcher.record(session.as_ref()).await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(batcher.pending(), 1);
        assert_eq!(batcher.commits(), 0);
    }
}
