use std::collections::{HashMap, VecDeque};

use bevy::prelude::*;

use crate::entity::EntityKey;
use crate::scripting::ScriptValue;

const MAX_PENDING: usize = 500;

/// Message resolved to one subscriber at publish time.
#[derive(Clone, Debug, PartialEq)]
pub struct Delivery {
    pub topic: String,
    pub target: EntityKey,
    pub method: String,
    pub value: ScriptValue,
}

/// Narrow publish/subscribe interface the world talks to. Entities release
/// every record through `unsubscribe` before they are freed.
pub trait PubSub {
    /// Returns false when the exact record already exists.
    fn subscribe(&mut self, topic: &str, target: EntityKey, method: &str) -> bool;
    fn unsubscribe(&mut self, topic: &str, target: EntityKey, method: &str) -> bool;
    fn publish(&mut self, topic: &str, value: ScriptValue);
    fn drain(&mut self) -> Vec<Delivery>;
    fn subscriber_count(&self, topic: &str) -> usize;
}

#[derive(Default)]
pub struct MessageBus {
    topics: HashMap<String, Vec<(EntityKey, String)>>,
    pending: VecDeque<Delivery>,
    pub published: u64,
    pub dropped_messages: u64,
    last_overflow_log: u64,
}

impl PubSub for MessageBus {
    fn subscribe(&mut self, topic: &str, target: EntityKey, method: &str) -> bool {
        let records = self.topics.entry(topic.to_string()).or_default();
        if records.iter().any(|(t, m)| *t == target && m == method) {
            return false;
        }
        records.push((target, method.to_string()));
        true
    }

    fn unsubscribe(&mut self, topic: &str, target: EntityKey, method: &str) -> bool {
        let Some(records) = self.topics.get_mut(topic) else {
            return false;
        };
        let Some(i) = records.iter().position(|(t, m)| *t == target && m == method) else {
            return false;
        };
        records.remove(i);
        if records.is_empty() {
            self.topics.remove(topic);
        }
        true
    }

    fn publish(&mut self, topic: &str, value: ScriptValue) {
        self.published = self.published.saturating_add(1);
        let Some(records) = self.topics.get(topic) else {
            return;
        };
        debug!(
            "[Pixie bus] '{topic}' -> {} subscribers: {}",
            records.len(),
            value.to_json()
        );
        for (target, method) in records {
            self.pending.push_back(Delivery {
                topic: topic.to_string(),
                target: *target,
                method: method.clone(),
                value: value.clone(),
            });
        }
        if self.pending.len() > MAX_PENDING {
            let excess = self.pending.len() - MAX_PENDING;
            for _ in 0..excess {
                self.pending.pop_front();
            }
            self.dropped_messages = self.dropped_messages.saturating_add(excess as u64);
            if self.published.saturating_sub(self.last_overflow_log) >= 60 {
                self.last_overflow_log = self.published;
                warn!(
                    "[Pixie bus] Dropped {} pending deliveries (total dropped: {})",
                    excess, self.dropped_messages
                );
            }
        }
    }

    fn drain(&mut self) -> Vec<Delivery> {
        self.pending.drain(..).collect()
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics.get(topic).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::Arena;
    use crate::entity::Entity;

    fn keys(n: usize) -> Vec<EntityKey> {
        let mut arena = Arena::default();
        (0..n).map(|_| arena.insert(Entity::new())).collect()
    }

    #[test]
    fn publish_fans_out_to_each_subscriber() {
        let k = keys(2);
        let mut bus = MessageBus::default();
        assert!(bus.subscribe("hit", k[0], "on_hit"));
        assert!(!bus.subscribe("hit", k[0], "on_hit"));
        assert!(bus.subscribe("hit", k[1], "on_hit"));
        bus.publish("hit", ScriptValue::Number(3.0));
        bus.publish("nobody", ScriptValue::Nil);
        let out = bus.drain();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].target, k[0]);
        assert_eq!(out[1].value, ScriptValue::Number(3.0));
        assert!(bus.drain().is_empty());
    }

    #[test]
    fn unsubscribe_removes_only_the_matching_record() {
        let k = keys(1);
        let mut bus = MessageBus::default();
        bus.subscribe("tick", k[0], "a");
        bus.subscribe("tick", k[0], "b");
        assert!(bus.unsubscribe("tick", k[0], "a"));
        assert!(!bus.unsubscribe("tick", k[0], "a"));
        assert_eq!(bus.subscriber_count("tick"), 1);
        assert!(bus.unsubscribe("tick", k[0], "b"));
        assert_eq!(bus.subscriber_count("tick"), 0);
    }

    #[test]
    fn bus_tracks_dropped_deliveries() {
        let k = keys(1);
        let mut bus = MessageBus::default();
        bus.subscribe("spam", k[0], "on_spam");
        for i in 0..(MAX_PENDING + 25) {
            bus.publish("spam", ScriptValue::from_json(&serde_json::json!({ "i": i })));
        }
        assert_eq!(bus.drain().len(), MAX_PENDING);
        assert!(bus.dropped_messages >= 25);
    }
}
