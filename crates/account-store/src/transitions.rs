//! Circuit transition audit log
//!
//! Append-only JSONL file recording every circuit breaker transition. The log
//! serves two purposes: long-term audit history for diagnostics/alerting, and
//! the durable fallback for live circuit state — if the fast store is flushed,
//! replaying the log yields the last known state per account.
//!
//! Appends are serialized by a tokio Mutex. Corrupt lines (torn writes from a
//! crash) are skipped with a warning during replay rather than failing the
//! whole load.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// One circuit transition as persisted.
///
/// States are stored as labels (`closed` / `open` / `half_open`) so the log
/// format is independent of in-memory types.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub account_id: String,
    pub from: String,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Unix timestamp in milliseconds
    pub at_ms: u64,
}

impl TransitionRecord {
    /// Build a record stamped with the current wall-clock time.
    pub fn now(account_id: String, from: String, to: String, reason: Option<String>) -> Self {
        let at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        Self {
            account_id,
            from,
            to,
            reason,
            at_ms,
        }
    }
}

/// Append-only transition log.
pub struct TransitionLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl TransitionLog {
    /// Open (or create) the log at the given path.
    pub async fn open(path: PathBuf) -> Result<Self> {
        if !path.exists() {
            tokio::fs::File::create(&path)
                .await
                .map_err(|e| Error::Io(format!("creating transition log: {e}")))?;
            info!(path = %path.display(), "created transition log");
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    /// Append one transition record.
    pub async fn append(&self, record: &TransitionRecord) -> Result<()> {
        let line = serde_json::to_string(record)
            .map_err(|e| Error::Parse(format!("serializing transition: {e}")))?;

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| Error::Io(format!("opening transition log: {e}")))?;
        file.write_all(format!("{line}\n").as_bytes())
            .await
            .map_err(|e| Error::Io(format!("appending transition: {e}")))?;
        file.flush()
            .await
            .map_err(|e| Error::Io(format!("flushing transition log: {e}")))?;

        debug!(
            account_id = record.account_id,
            from = record.from,
            to = record.to,
            "audited circuit transition"
        );
        Ok(())
    }

    /// Read the full transition history.
    ///
    /// Corrupt lines are skipped with a warning so a torn final write cannot
    /// prevent startup.
    pub async fn replay(&self) -> Result<Vec<TransitionRecord>> {
        let contents = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| Error::Io(format!("reading transition log: {e}")))?;

        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TransitionRecord>(line) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(line = lineno + 1, error = %e, "skipping corrupt transition log line");
                }
            }
        }
        Ok(records)
    }

    /// Last recorded state label per account, for seeding the fast store.
    pub async fn last_states(&self) -> Result<HashMap<String, String>> {
        let mut states = HashMap::new();
        for record in self.replay().await? {
            states.insert(record.account_id, record.to);
        }
        Ok(states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(account: &str, from: &str, to: &str) -> TransitionRecord {
        TransitionRecord::now(account.into(), from.into(), to.into(), None)
    }

    #[tokio::test]
    async fn append_and_replay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransitionLog::open(dir.path().join("transitions.jsonl"))
            .await
            .unwrap();

        log.append(&TransitionRecord::now(
            "a1".into(),
            "closed".into(),
            "open".into(),
            Some("upstream 500".into()),
        ))
        .await
        .unwrap();
        log.append(&record("a1", "open", "half_open")).await.unwrap();

        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].to, "open");
        assert_eq!(records[0].reason.as_deref(), Some("upstream 500"));
        assert_eq!(records[1].to, "half_open");
    }

    #[tokio::test]
    async fn open_creates_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transitions.jsonl");
        assert!(!path.exists());

        let log = TransitionLog::open(path.clone()).await.unwrap();
        assert!(path.exists());
        assert!(log.replay().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn last_states_takes_latest_per_account() {
        let dir = tempfile::tempdir().unwrap();
        let log = TransitionLog::open(dir.path().join("transitions.jsonl"))
            .await
            .unwrap();

        log.append(&record("a1", "closed", "open")).await.unwrap();
        log.append(&record("a2", "closed", "open")).await.unwrap();
        log.append(&record("a1", "open", "half_open")).await.unwrap();
        log.append(&record("a1", "half_open", "closed")).await.unwrap();

        let states = log.last_states().await.unwrap();
        assert_eq!(states.get("a1").map(String::as_str), Some("closed"));
        assert_eq!(states.get("a2").map(String::as_str), Some("open"));
    }

    #[tokio::test]
    async fn replay_skips_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("transitions.jsonl");
        let log = TransitionLog::open(path.clone()).await.unwrap();

        log.append(&record("a1", "closed", "open")).await.unwrap();
        // Simulate a torn write
        let mut contents = tokio::fs::read_to_string(&path).await.unwrap();
        contents.push_str("{\"account_id\":\"a2\",\"from\":\"clo");
        tokio::fs::write(&path, contents).await.unwrap();

        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].account_id, "a1");
    }

    #[tokio::test]
    async fn concurrent_appends_produce_valid_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = std::sync::Arc::new(
            TransitionLog::open(dir.path().join("transitions.jsonl"))
                .await
                .unwrap(),
        );

        let mut handles = vec![];
        for i in 0..10 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.append(&record(&format!("a{i}"), "closed", "open"))
                    .await
                    .unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let records = log.replay().await.unwrap();
        assert_eq!(records.len(), 10);
    }
}
