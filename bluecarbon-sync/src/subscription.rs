//! Subscription registry.
//!
//! Callers subscribe to topics independently; overlapping subscriptions to
//! the same topic share one wire-level subscription. Only the first
//! subscribe and the last unsubscribe of a topic return a [`WireChange`].

use bluecarbon_types::Topic;
use std::collections::HashMap;

/// Returned by [`SubscriptionRegistry::subscribe`]; pass it back to
/// unsubscribe.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// A change that must be reflected on the active connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireChange {
    Subscribe(Topic),
    Unsubscribe(Topic),
}

#[derive(Debug)]
struct Entry {
    topic: Topic,
    refcount: usize,
}

/// Refcounted topic registry that remembers registration order.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    /// Topics with a nonzero refcount, in registration order.
    entries: Vec<Entry>,
    live: HashMap<u64, Topic>,
    next_id: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers interest in `topic`.
    pub fn subscribe(&mut self, topic: Topic) -> (SubscriptionHandle, Option<WireChange>) {
        self.next_id += 1;
        let id = self.next_id;
        self.live.insert(id, topic.clone());

        let change = match self.entries.iter_mut().find(|e| e.topic == topic) {
            Some(entry) => {
                entry.refcount += 1;
                None
            }
            None => {
                self.entries.push(Entry {
                    topic: topic.clone(),
                    refcount: 1,
                });
                Some(WireChange::Subscribe(topic.clone()))
            }
        };
        (SubscriptionHandle { id, topic }, change)
    }

    /// Drops one subscription. Unknown or already released handles are
    /// ignored.
    pub fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Option<WireChange> {
        let topic = self.live.remove(&handle.id)?;
        let pos = self.entries.iter().position(|e| e.topic == topic)?;
        self.entries[pos].refcount -= 1;
        if self.entries[pos].refcount == 0 {
            self.entries.remove(pos);
            Some(WireChange::Unsubscribe(topic))
        } else {
            None
        }
    }

    /// Topics to replay on a new connection, in registration order.
    pub fn topics(&self) -> Vec<Topic> {
        self.entries.iter().map(|e| e.topic.clone()).collect()
    }

    pub fn refcount(&self, topic: &str) -> usize {
        self.entries
            .iter()
            .find(|e| e.topic.as_str() == topic)
            .map_or(0, |e| e.refcount)
    }

    pub fn contains(&self, topic: &str) -> bool {
        self.refcount(topic) > 0
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
