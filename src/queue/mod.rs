//! Per-session FIFO of messages that arrived while the session was locked.
//!
//! Anyone may enqueue. Only the lock holder drains, and a drain empties the
//! list and clears the pending marker in one store operation. A message pushed
//! concurrently with a drain is returned by exactly one drain, possibly the
//! next one. Pushes raise the marker in the same store operation, so a
//! non-empty list always has its marker until the marker's own TTL runs out.

use std::sync::Arc;
use std::time::Duration;

use crate::context::{QueuedMessage, SessionKey};
use crate::kv::{Flag, KvStore, StoreError, StoreResult};

pub struct MessageQueue {
    kv: Arc<dyn KvStore>,
    list_ttl: Duration,
    marker_ttl: Duration,
}

impl MessageQueue {
    pub fn new(kv: Arc<dyn KvStore>, list_ttl: Duration, marker_ttl: Duration) -> Self {
        Self {
            kv,
            list_ttl,
            marker_ttl,
        }
    }

    /// Append a message and raise the pending marker. Returns the queue length.
    pub async fn enqueue(&self, key: &SessionKey, message: &QueuedMessage) -> StoreResult<usize> {
        let bytes = Self::encode(key, message)?;
        let marker = key.marker_key();
        let len = self
            .kv
            .push_back(&key.queue_key(), &bytes, self.list_ttl, Some(self.marker(&marker)))
            .await?;
        tracing::debug!(session = %key, message_id = %message.message_id, len, "message queued");
        Ok(len)
    }

    /// Put messages a failed holder had taken back at the head, in their
    /// original order, ahead of anything that arrived since.
    pub async fn requeue(&self, key: &SessionKey, messages: &[QueuedMessage]) -> StoreResult<()> {
        if messages.is_empty() {
            return Ok(());
        }
        let encoded = messages
            .iter()
            .map(|m| Self::encode(key, m))
            .collect::<StoreResult<Vec<_>>>()?;
        let marker = key.marker_key();
        let len = self
            .kv
            .push_front(&key.queue_key(), &encoded, self.list_ttl, Some(self.marker(&marker)))
            .await?;
        tracing::debug!(session = %key, requeued = messages.len(), len, "messages requeued at head");
        Ok(())
    }

    fn marker<'a>(&self, marker_key: &'a str) -> Flag<'a> {
        Flag {
            key: marker_key,
            value: b"1",
            ttl: self.marker_ttl,
        }
    }

    fn encode(key: &SessionKey, message: &QueuedMessage) -> StoreResult<Vec<u8>> {
        serde_json::to_vec(message).map_err(|e| StoreError::Corrupt {
            key: key.queue_key(),
            reason: e.to_string(),
        })
    }

    /// Take everything queued so far, clearing the marker in the same step.
    pub async fn drain_pending(&self, key: &SessionKey) -> StoreResult<Vec<QueuedMessage>> {
        let raw = self
            .kv
            .drain_list(&key.queue_key(), &[key.marker_key().as_str()])
            .await?;
        let mut messages = Vec::with_capacity(raw.len());
        for bytes in raw {
            match serde_json::from_slice::<QueuedMessage>(&bytes) {
                Ok(message) => messages.push(message),
                Err(e) => tracing::warn!(session = %key, "dropping undecodable queued message: {e}"),
            }
        }
        if !messages.is_empty() {
            tracing::debug!(session = %key, count = messages.len(), "drained queued messages");
        }
        Ok(messages)
    }

    pub async fn has_pending(&self, key: &SessionKey) -> StoreResult<bool> {
        Ok(self.kv.get(&key.marker_key()).await?.is_some())
    }

    /// Number of queued messages, independent of the marker.
    pub async fn len(&self, key: &SessionKey) -> StoreResult<usize> {
        self.kv.list_len(&key.queue_key()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKvStore;

    fn queue() -> (MessageQueue, Arc<dyn KvStore>) {
        let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
        let q = MessageQueue::new(
            Arc::clone(&kv),
            Duration::from_secs(3600),
            Duration::from_secs(300),
        );
        (q, kv)
    }

    #[tokio::test]
    async fn two_messages_drain_in_order_and_clear_marker() {
        let (q, kv) = queue();
        let key = SessionKey::new("74274", "12345");
        q.enqueue(&key, &QueuedMessage::new("m1", "What are your hours?"))
            .await
            .unwrap();
        q.enqueue(&key, &QueuedMessage::new("m2", "Do you have space in Sept?"))
            .await
            .unwrap();
        assert!(q.has_pending(&key).await.unwrap());
        assert_eq!(q.len(&key).await.unwrap(), 2);

        let drained = q.drain_pending(&key).await.unwrap();
        let contents: Vec<&str> = drained.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, ["What are your hours?", "Do you have space in Sept?"]);

        assert!(!q.has_pending(&key).await.unwrap());
        assert!(kv.get("74274_12345:new_messages").await.unwrap().is_none());
        assert!(q.drain_pending(&key).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn requeue_goes_ahead_of_later_arrivals() {
        let (q, _) = queue();
        let key = SessionKey::new("74274", "12345");
        q.enqueue(&key, &QueuedMessage::new("m3", "later")).await.unwrap();
        q.requeue(
            &key,
            &[
                QueuedMessage::new("m1", "first"),
                QueuedMessage::new("m2", "second"),
            ],
        )
        .await
        .unwrap();
        assert!(q.has_pending(&key).await.unwrap());

        let drained = q.drain_pending(&key).await.unwrap();
        let ids: Vec<&str> = drained.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
    }

    #[tokio::test]
    async fn requeue_of_nothing_leaves_no_marker() {
        let (q, _) = queue();
        let key = SessionKey::new("74274", "12345");
        q.requeue(&key, &[]).await.unwrap();
        assert!(!q.has_pending(&key).await.unwrap());
    }

    #[tokio::test]
    async fn sessions_do_not_share_queues() {
        let (q, _) = queue();
        let a = SessionKey::new("t", "a");
        let b = SessionKey::new("t", "b");
        q.enqueue(&a, &QueuedMessage::new("1", "for a")).await.unwrap();
        assert!(q.drain_pending(&b).await.unwrap().is_empty());
        assert_eq!(q.drain_pending(&a).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn undecodable_entries_are_skipped() {
        let (q, kv) = queue();
        let key = SessionKey::new("t", "c");
        kv.push_back(&key.queue_key(), b"garbage", Duration::from_secs(60), None)
            .await
            .unwrap();
        q.enqueue(&key, &QueuedMessage::new("ok", "hello")).await.unwrap();
        let drained = q.drain_pending(&key).await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message_id, "ok");
    }

    #[tokio::test]
    async fn concurrent_enqueues_are_all_drained_once() {
        let (q, _) = queue();
        let q = Arc::new(q);
        let key = SessionKey::new("t", "c");
        let mut handles = Vec::new();
        for i in 0..20 {
            let q = Arc::clone(&q);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                q.enqueue(&key, &QueuedMessage::new(format!("m{i}"), "x"))
                    .await
                    .unwrap();
            }));
        }
        let mut seen = Vec::new();
        for handle in handles {
            handle.await.unwrap();
            seen.extend(q.drain_pending(&key).await.unwrap());
        }
        seen.extend(q.drain_pending(&key).await.unwrap());
        assert_eq!(seen.len(), 20);
        let mut ids: Vec<String> = seen.into_iter().map(|m| m.message_id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 20);
    }
}
