use std::{collections::VecDeque, sync::Arc};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    store::{self, keys, KeyValueStore},
    types::{now_millis, OutgoingMessage},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingRecord {
    pub message: OutgoingMessage,
    pub timestamp: i64,
}

pub struct Outbox {
    queue: VecDeque<PendingRecord>,
    capacity: usize,
    store: Arc<dyn KeyValueStore>,
}

impl Outbox {
    pub async fn restore(store: Arc<dyn KeyValueStore>, capacity: usize) -> Self {
        let mut queue: VecDeque<PendingRecord> =
            match store::load_json::<Vec<PendingRecord>>(store.as_ref(), keys::PENDING_MESSAGES)
                .await
            {
                Ok(Some(records)) => records.into(),
                Ok(None) => VecDeque::new(),
                Err(e) => {
                    warn!(error = %e, "discarding unreadable pending messages");
                    VecDeque::new()
                }
            };
        while queue.len() > capacity {
            queue.pop_front();
        }
        if !queue.is_empty() {
            debug!(count = queue.len(), "restored pending messages");
        }
        Self {
            queue,
            capacity,
            store,
        }
    }

    pub async fn push(&mut self, message: OutgoingMessage) {
        self.queue.push_back(PendingRecord {
            message,
            timestamp: now_millis(),
        });
        while self.queue.len() > self.capacity {
            if let Some(evicted) = self.queue.pop_front() {
                debug!(kind = %evicted.message.kind, "outbox full, evicted oldest");
            }
        }
        self.persist().await;
    }

    pub fn front(&self) -> Option<&OutgoingMessage> {
        self.queue.front().map(|r| &r.message)
    }

    pub async fn confirm_front(&mut self) {
        if self.queue.pop_front().is_some() {
            self.persist().await;
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &OutgoingMessage> {
        self.queue.iter().map(|r| &r.message)
    }

    async fn persist(&self) {
        let records: Vec<&PendingRecord> = self.queue.iter().collect();
        if let Err(e) = store::save_json(self.store.as_ref(), keys::PENDING_MESSAGES, &records).await
        {
            warn!(error = %e, "failed to persist pending messages");
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    fn msg(n: usize) -> OutgoingMessage {
        OutgoingMessage::new("traffic_report", json!({ "n": n }))
    }

    async fn durable(store: &MemoryStore) -> Vec<PendingRecord> {
        store::load_json(store, keys::PENDING_MESSAGES)
            .await
            .unwrap()
            .unwrap_or_default()
    }

    #[tokio::test]
    async fn push_mirrors_in_call_order() {
        let store = MemoryStore::new();
        let mut outbox = Outbox::restore(Arc::new(store.clone()), 100).await;
        for n in 0..3 {
            outbox.push(msg(n)).await;
        }

        let stored: Vec<_> = durable(&store).await.into_iter().map(|r| r.message).collect();
        let queued: Vec<_> = outbox.messages().cloned().collect();
        assert_eq!(stored, queued);
        assert_eq!(
            stored.iter().map(|m| m.payload["n"].clone()).collect::<Vec<_>>(),
            vec![json!(0), json!(1), json!(2)]
        );
    }

    #[tokio::test]
    async fn bounded_to_capacity_evicting_oldest() {
        let store = MemoryStore::new();
        let mut outbox = Outbox::restore(Arc::new(store.clone()), 100).await;
        for n in 0..101 {
            outbox.push(msg(n)).await;
        }

        let stored = durable(&store).await;
        assert_eq!(stored.len(), 100);
        assert_eq!(outbox.len(), 100);
        assert_eq!(stored[0].message.payload["n"], 1);
        assert_eq!(outbox.front().unwrap().payload["n"], 1);
    }

    #[tokio::test]
    async fn confirm_front_removes_from_both() {
        let store = MemoryStore::new();
        let mut outbox = Outbox::restore(Arc::new(store.clone()), 100).await;
        outbox.push(msg(0)).await;
        outbox.push(msg(1)).await;

        outbox.confirm_front().await;

        let stored = durable(&store).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].message.payload["n"], 1);
        assert_eq!(outbox.front().unwrap().payload["n"], 1);
    }

    #[tokio::test]
    async fn restore_reloads_previous_session() {
        let store = MemoryStore::new();
        {
            let mut outbox = Outbox::restore(Arc::new(store.clone()), 100).await;
            outbox.push(msg(7)).await;
        }
        let outbox = Outbox::restore(Arc::new(store), 100).await;
        assert_eq!(outbox.len(), 1);
        assert_eq!(outbox.front().unwrap().payload["n"], 7);
    }
}
