//! Durable ring buffer
//!
//! FIFO staging queue between ingress and the publisher processes. Every
//! accepted record is written to the sled store before it is offered
//! downstream, and removed only after the publisher reports completion, so
//! a crash between dispatch and completion replays the record on the next
//! boot (at-least-once delivery).

use std::path::Path;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Result, StewardError};
use crate::message::SubjectAndMessage;

const MESSAGES_TREE: &str = "messages";
const META_TREE: &str = "meta";
const METRICS_TREE: &str = "metrics";

const LAST_ID_KEY: &[u8] = b"last_id";

/// A staged record: a sam plus its buffer-assigned ID.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SamDbValue {
    pub id: u64,
    pub sam: SubjectAndMessage,
}

/// Durable FIFO staging queue backed by sled.
pub struct RingBuffer {
    db: sled::Db,
    messages: sled::Tree,
    meta: sled::Tree,
    metrics: sled::Tree,
    /// ID allocation is the serialization point: the lock is held across
    /// persist and emit so downstream sees ascending IDs.
    last_id: Mutex<u64>,
    out_tx: mpsc::Sender<SamDbValue>,
}

impl RingBuffer {
    /// Open the store and create the staging channel.
    ///
    /// Returns the buffer handle and the output the router drains.
    pub fn open(path: &Path, capacity: usize) -> Result<(Self, mpsc::Receiver<SamDbValue>)> {
        let db = sled::Config::new()
            .path(path)
            .mode(sled::Mode::HighThroughput)
            .open()?;

        let messages = db.open_tree(MESSAGES_TREE)?;
        let meta = db.open_tree(META_TREE)?;
        let metrics = db.open_tree(METRICS_TREE)?;

        let last_id = match meta.get(LAST_ID_KEY)? {
            Some(v) => decode_u64(&v)?,
            None => 0,
        };

        let (out_tx, out_rx) = mpsc::channel(capacity);

        info!(path = %path.display(), last_id, pending = messages.len(), "ring buffer opened");

        let buffer = Self {
            db,
            messages,
            meta,
            metrics,
            last_id: Mutex::new(last_id),
            out_tx,
        };

        Ok((buffer, out_rx))
    }

    /// Accept a batch of sams: assign IDs, persist, then offer downstream.
    ///
    /// Blocks when the staging channel is full. A persistence failure fails
    /// the whole call before the failing record is offered, so the sender
    /// never sees a silently dropped message.
    pub async fn push(&self, sams: Vec<SubjectAndMessage>) -> Result<()> {
        for mut sam in sams {
            let mut last_id = self.last_id.lock().await;

            let id = *last_id + 1;
            sam.message.id = id;
            let record = SamDbValue { id, sam };

            let encoded = rmp_serde::to_vec(&record)?;
            // Counter first: a crash between the two writes then only
            // skips an id, it never hands out an id that a replayed
            // record still holds.
            self.meta.insert(LAST_ID_KEY, id.to_be_bytes().to_vec())?;
            self.messages.insert(id.to_be_bytes(), encoded)?;
            *last_id = id;

            self.bump_counter(b"staged_total");

            debug!(id, subject = %record.sam.subject, "message staged");

            self.out_tx
                .send(record)
                .await
                .map_err(|_| StewardError::Internal("ring buffer output closed".into()))?;
        }

        Ok(())
    }

    /// Remove a completed record. Idempotent: completing an already-removed
    /// ID after a crash replay is a no-op.
    pub fn mark_done(&self, id: u64) -> Result<()> {
        if self.messages.remove(id.to_be_bytes())?.is_some() {
            self.bump_counter(b"completed_total");
            debug!(id, "message completed, record removed");
        }
        Ok(())
    }

    /// Re-emit every persisted record in ascending ID order.
    ///
    /// Must run before any ingress source is started so replayed records
    /// keep their position ahead of new traffic.
    pub async fn replay(&self) -> Result<usize> {
        let mut replayed = 0;

        for entry in self.messages.iter() {
            let (_, value) = entry?;
            let record: SamDbValue = match rmp_serde::from_slice(&value) {
                Ok(r) => r,
                Err(e) => {
                    warn!(error = %e, "skipping undecodable record in store");
                    continue;
                }
            };

            debug!(id = record.id, subject = %record.sam.subject, "replaying persisted message");
            self.out_tx
                .send(record)
                .await
                .map_err(|_| StewardError::Internal("ring buffer output closed".into()))?;
            replayed += 1;
        }

        if replayed > 0 {
            info!(count = replayed, "replayed persisted messages");
        }

        Ok(replayed)
    }

    /// Number of records currently persisted and not yet completed.
    pub fn pending(&self) -> usize {
        self.messages.len()
    }

    /// Flush the store to disk, used at shutdown.
    pub async fn flush(&self) -> Result<()> {
        self.db.flush_async().await?;
        Ok(())
    }

    fn bump_counter(&self, key: &[u8]) {
        let _ = self.metrics.update_and_fetch(key, |old| {
            let n = old
                .and_then(|b| b.try_into().ok().map(u64::from_be_bytes))
                .unwrap_or(0);
            Some((n + 1).to_be_bytes().to_vec())
        });
    }
}

fn decode_u64(b: &[u8]) -> Result<u64> {
    b.try_into()
        .map(u64::from_be_bytes)
        .map_err(|_| StewardError::Persistence("corrupt counter value".into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{Message, Method};
    use tempfile::TempDir;

    fn sam(to: &str) -> SubjectAndMessage {
        SubjectAndMessage::new(Message {
            to_node: to.to_string(),
            from_node: "central".to_string(),
            method: Method::Ping,
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_push_assigns_monotonic_ids() {
        let dir = TempDir::new().unwrap();
        let (buf, mut rx) = RingBuffer::open(&dir.path().join("store"), 16).unwrap();

        buf.push(vec![sam("a"), sam("b"), sam("c")]).await.unwrap();

        let ids: Vec<u64> = [rx.recv().await, rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(buf.pending(), 3);
    }

    #[tokio::test]
    async fn test_record_persists_until_done() {
        let dir = TempDir::new().unwrap();
        let (buf, mut rx) = RingBuffer::open(&dir.path().join("store"), 16).unwrap();

        buf.push(vec![sam("a")]).await.unwrap();
        let record = rx.recv().await.unwrap();
        assert_eq!(buf.pending(), 1);

        buf.mark_done(record.id).unwrap();
        assert_eq!(buf.pending(), 0);

        // Duplicate completion is a no-op.
        buf.mark_done(record.id).unwrap();
    }

    #[tokio::test]
    async fn test_replay_after_restart_in_id_order() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store");

        {
            let (buf, mut rx) = RingBuffer::open(&path, 16).unwrap();
            buf.push(vec![sam("a"), sam("b"), sam("c")]).await.unwrap();
            // Drain the channel but complete only the first record.
            let first = rx.recv().await.unwrap();
            rx.recv().await.unwrap();
            rx.recv().await.unwrap();
            buf.mark_done(first.id).unwrap();
            buf.flush().await.unwrap();
        }

        let (buf, mut rx) = RingBuffer::open(&path, 16).unwrap();
        let replayed = buf.replay().await.unwrap();
        assert_eq!(replayed, 2);

        let ids: Vec<u64> = [rx.recv().await, rx.recv().await]
            .into_iter()
            .map(|r| r.unwrap().id)
            .collect();
        assert_eq!(ids, vec![2, 3]);

        // New IDs continue past the persisted counter.
        buf.push(vec![sam("d")]).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().id, 4);
    }
}
