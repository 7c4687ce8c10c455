use std::{
    collections::HashMap,
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
};

use serde_json::Value;
use tracing::{debug, error};
use uuid::Uuid;

use crate::types::Topic;

pub type SubscriberId = Uuid;

pub type Callback = Arc<dyn Fn(&Value) + Send + Sync>;

pub fn callback<F>(f: F) -> Callback
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Default)]
pub struct TopicSubscriptions {
    topics: HashMap<Topic, Vec<(SubscriberId, Callback)>>,
}

impl TopicSubscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, topic: &str, callback: Callback) -> SubscriberId {
        let subscribers = self.topics.entry(topic.to_string()).or_default();
        if let Some((id, _)) = subscribers
            .iter()
            .find(|(_, existing)| Arc::ptr_eq(existing, &callback))
        {
            return *id;
        }

        let id = Uuid::new_v4();
        subscribers.push((id, callback));
        debug!(%topic, subscriber = %id, "subscribed");
        id
    }

    pub fn unsubscribe(&mut self, topic: &str, id: &SubscriberId) -> bool {
        let Some(subscribers) = self.topics.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| existing != id);
        let removed = subscribers.len() != before;

        if subscribers.is_empty() {
            self.topics.remove(topic);
            debug!(%topic, "last subscriber gone");
            return removed;
        }
        false
    }

    pub fn dispatch(&self, topic: &str, payload: &Value) -> usize {
        let Some(subscribers) = self.topics.get(topic) else {
            return 0;
        };

        let mut failures = 0;
        for (id, callback) in subscribers {
            if catch_unwind(AssertUnwindSafe(|| callback(payload))).is_err() {
                error!(%topic, subscriber = %id, "subscription callback panicked");
                failures += 1;
            }
        }
        failures
    }

    pub fn topics(&self) -> Vec<Topic> {
        self.topics.keys().cloned().collect()
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.topics.contains_key(topic)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[test]
    fn unsubscribe_last_callback_removes_topic() {
        let mut subs = TopicSubscriptions::new();
        let id = subs.subscribe("traffic", callback(|_| {}));

        assert!(subs.unsubscribe("traffic", &id));
        assert!(!subs.contains("traffic"));
        assert!(subs.topics().is_empty());
    }

    #[test]
    fn same_callback_is_deduplicated() {
        let mut subs = TopicSubscriptions::new();
        let cb = callback(|_| {});

        let first = subs.subscribe("traffic", cb.clone());
        let second = subs.subscribe("traffic", cb);

        assert_eq!(first, second);
        assert_eq!(subs.subscriber_count("traffic"), 1);
    }

    #[test]
    fn topic_kept_while_other_callbacks_remain() {
        let mut subs = TopicSubscriptions::new();
        let a = subs.subscribe("rides", callback(|_| {}));
        let _b = subs.subscribe("rides", callback(|_| {}));

        assert!(!subs.unsubscribe("rides", &a));
        assert_eq!(subs.subscriber_count("rides"), 1);
    }

    #[test]
    fn panicking_callback_is_isolated() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut subs = TopicSubscriptions::new();
        subs.subscribe("alerts", callback(|_| panic!("boom")));
        let sink = seen.clone();
        subs.subscribe(
            "alerts",
            callback(move |payload| sink.lock().unwrap().push(payload.clone())),
        );

        let failures = subs.dispatch("alerts", &json!({"id": 1}));

        assert_eq!(failures, 1);
        assert_eq!(*seen.lock().unwrap(), vec![json!({"id": 1})]);
    }
}
