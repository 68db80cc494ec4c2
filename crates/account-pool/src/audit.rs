//! Durable audit of circuit transitions
//!
//! Drains the breaker's broadcast feed into the append-only transition log.
//! The task runs independently of the request path: an audit write failure is
//! logged and the feed keeps draining.

use std::sync::Arc;

use account_store::{TransitionLog, TransitionRecord};
use tokio::sync::broadcast;
use tracing::warn;

use crate::breaker::CircuitTransition;

/// Spawn a background task that persists circuit transitions to the audit log.
///
/// Exits when the breaker (the feed's sender) is dropped. If the task falls
/// behind the feed, skipped transitions are counted in a warning — the live
/// state in the fast store is unaffected.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_audit_task(
    mut events: broadcast::Receiver<CircuitTransition>,
    log: Arc<TransitionLog>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(transition) => {
                    let record = TransitionRecord::now(
                        transition.account_id,
                        transition.from.as_str().to_string(),
                        transition.to.as_str().to_string(),
                        transition.reason,
                    );
                    if let Err(e) = log.append(&record).await {
                        warn!(error = %e, "failed to persist circuit transition audit record");
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "audit task lagged behind the transition feed");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{BreakerConfig, CircuitBreaker, MemoryCircuitStore};
    use std::time::Duration;

    #[tokio::test]
    async fn transitions_reach_the_audit_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = Arc::new(
            TransitionLog::open(dir.path().join("transitions.jsonl"))
                .await
                .unwrap(),
        );
        let breaker = CircuitBreaker::new(
            Arc::new(MemoryCircuitStore::new()),
            BreakerConfig::default(),
        );
        let handle = spawn_audit_task(breaker.subscribe(), log.clone());

        for _ in 0..5 {
            breaker.record_failure("a", "upstream 500").await.unwrap();
        }

        // The audit write is asynchronous; poll briefly for it to land
        let mut records = vec![];
        for _ in 0..50 {
            records = log.replay().await.unwrap();
            if !records.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(records.len(), 1);
        assert_eq!(records[0].account_id, "a");
        assert_eq!(records[0].from, "closed");
        assert_eq!(records[0].to, "open");
        assert_eq!(records[0].reason.as_deref(), Some("upstream 500"));

        // Dropping the breaker closes the feed and ends the task
        drop(breaker);
        handle.await.unwrap();
    }
}
