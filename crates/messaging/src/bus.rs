//! Partitioned publish/subscribe.
//!
//! [`EventBus`] is the seam to the broker. Messages with the same key land on
//! the same partition and are delivered to a consumer group in append order.
//! Offsets are committed explicitly after a message was handled, so a
//! consumer that stops before committing sees the message again
//! (at-least-once).
//!
//! [`InMemoryEventBus`] implements the contract inside one process.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::BusError;

/// A message as delivered to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// A message to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub topic: String,
    /// Partition key. All messages with the same key keep their relative order.
    pub key: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

/// Ordered stream over one partition of one topic for one consumer group.
#[async_trait]
pub trait PartitionStream: Send {
    fn topic(&self) -> &str;

    fn partition(&self) -> u32;

    /// Waits for the next message. Returns None once the bus is closed.
    async fn next(&mut self) -> Option<BrokerMessage>;

    /// Records that every message up to and including `offset` was handled.
    async fn commit(&mut self, offset: u64) -> Result<(), BusError>;
}

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publishes a message, returning once the broker acknowledged it.
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BusError>;

    /// Opens one stream per partition of `topic` for consumer `group`,
    /// starting after the group's last committed offset.
    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Vec<Box<dyn PartitionStream>>, BusError>;
}

#[derive(Default)]
struct PartitionLog {
    messages: RwLock<Vec<BrokerMessage>>,
    appended: Notify,
}

impl PartitionLog {
    fn get(&self, offset: u64) -> Option<BrokerMessage> {
        let messages = self.messages.read().unwrap_or_else(|e| e.into_inner());
        messages.get(offset as usize).cloned()
    }
}

struct TopicLog {
    partitions: Vec<Arc<PartitionLog>>,
}

struct BusState {
    partitions_per_topic: u32,
    topics: RwLock<HashMap<String, Arc<TopicLog>>>,
    committed: Mutex<HashMap<(String, String, u32), u64>>,
    available: AtomicBool,
    closed: AtomicBool,
}

/// In-process broker with per-key partitioning and consumer-group offsets.
#[derive(Clone)]
pub struct InMemoryEventBus {
    state: Arc<BusState>,
}

impl Default for InMemoryEventBus {
    fn default() -> Self {
        Self::new(4)
    }
}

impl InMemoryEventBus {
    /// Creates a bus where every topic has `partitions` partitions.
    pub fn new(partitions: u32) -> Self {
        Self {
            state: Arc::new(BusState {
                partitions_per_topic: partitions.max(1),
                topics: RwLock::new(HashMap::new()),
                committed: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Simulates a broker outage: while unavailable every publish fails.
    pub fn set_available(&self, available: bool) {
        self.state.available.store(available, Ordering::SeqCst);
    }

    /// Stops all streams; pending `next()` calls return None.
    pub fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        let topics = self.state.topics.read().unwrap_or_else(|e| e.into_inner());
        for topic in topics.values() {
            for partition in &topic.partitions {
                partition.appended.notify_waiters();
            }
        }
    }

    /// Partition a key maps to. Stable for the lifetime of the bus.
    pub fn partition_for(&self, key: &str) -> u32 {
        // FNV-1a
        let mut hash: u32 = 0x811c_9dc5;
        for byte in key.as_bytes() {
            hash ^= u32::from(*byte);
            hash = hash.wrapping_mul(0x0100_0193);
        }
        hash % self.state.partitions_per_topic
    }

    /// Every message published to `topic`, partition by partition.
    pub fn messages(&self, topic: &str) -> Vec<BrokerMessage> {
        let topic = self.topic(topic);
        topic
            .partitions
            .iter()
            .flat_map(|p| {
                p.messages
                    .read()
                    .unwrap_or_else(|e| e.into_inner())
                    .clone()
            })
            .collect()
    }

    fn topic(&self, name: &str) -> Arc<TopicLog> {
        if let Some(topic) = self
            .state
            .topics
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return topic.clone();
        }

        let mut topics = self.state.topics.write().unwrap_or_else(|e| e.into_inner());
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(TopicLog {
                    partitions: (0..self.state.partitions_per_topic)
                        .map(|_| Arc::new(PartitionLog::default()))
                        .collect(),
                })
            })
            .clone()
    }
}

#[async_trait]
impl EventBus for InMemoryEventBus {
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BusError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        if !self.state.available.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable("broker is not accepting writes".into()));
        }

        let partition = self.partition_for(&message.key);
        let log = self.topic(&message.topic).partitions[partition as usize].clone();
        {
            let mut messages = log.messages.write().unwrap_or_else(|e| e.into_inner());
            let offset = messages.len() as u64;
            messages.push(BrokerMessage {
                topic: message.topic,
                partition,
                offset,
                key: message.key,
                payload: message.payload,
                headers: message.headers,
            });
        }
        log.appended.notify_waiters();
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
    ) -> Result<Vec<Box<dyn PartitionStream>>, BusError> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }

        let log = self.topic(topic);
        let committed = self
            .state
            .committed
            .lock()
            .unwrap_or_else(|e| e.into_inner());

        Ok(log
            .partitions
            .iter()
            .enumerate()
            .map(|(index, partition)| {
                let partition_id = index as u32;
                let position = committed
                    .get(&(group.to_string(), topic.to_string(), partition_id))
                    .copied()
                    .unwrap_or(0);
                Box::new(InMemoryPartitionStream {
                    bus: self.state.clone(),
                    log: partition.clone(),
                    topic: topic.to_string(),
                    group: group.to_string(),
                    partition: partition_id,
                    position,
                }) as Box<dyn PartitionStream>
            })
            .collect())
    }
}

struct InMemoryPartitionStream {
    bus: Arc<BusState>,
    log: Arc<PartitionLog>,
    topic: String,
    group: String,
    partition: u32,
    position: u64,
}

#[async_trait]
impl PartitionStream for InMemoryPartitionStream {
    fn topic(&self) -> &str {
        &self.topic
    }

    fn partition(&self) -> u32 {
        self.partition
    }

    async fn next(&mut self) -> Option<BrokerMessage> {
        loop {
            // Registered before the checks so an append in between is not missed.
            let appended = self.log.appended.notified();
            if self.bus.closed.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(message) = self.log.get(self.position) {
                self.position += 1;
                return Some(message);
            }
            appended.await;
        }
    }

    async fn commit(&mut self, offset: u64) -> Result<(), BusError> {
        let mut committed = self.bus.committed.lock().unwrap_or_else(|e| e.into_inner());
        let entry = committed
            .entry((self.group.clone(), self.topic.clone(), self.partition))
            .or_insert(0);
        *entry = (*entry).max(offset + 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn message(topic: &str, key: &str, body: &str) -> OutgoingMessage {
        OutgoingMessage {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: body.as_bytes().to_vec(),
            headers: HashMap::new(),
        }
    }

    async fn stream_for_key(
        bus: &InMemoryEventBus,
        topic: &str,
        group: &str,
        key: &str,
    ) -> Box<dyn PartitionStream> {
        let partition = bus.partition_for(key) as usize;
        bus.subscribe(topic, group)
            .await
            .unwrap()
            .into_iter()
            .nth(partition)
            .unwrap()
    }

    #[tokio::test]
    async fn same_key_keeps_publish_order() {
        let bus = InMemoryEventBus::new(4);
        for i in 0..5 {
            bus.publish(message("t", "order-1", &format!("m{i}")))
                .await
                .unwrap();
        }

        let mut stream = stream_for_key(&bus, "t", "g", "order-1").await;
        for i in 0..5 {
            let received = stream.next().await.unwrap();
            assert_eq!(received.payload, format!("m{i}").into_bytes());
            assert_eq!(received.offset, i);
        }
    }

    #[tokio::test]
    async fn uncommitted_messages_are_redelivered_to_the_group() {
        let bus = InMemoryEventBus::new(1);
        bus.publish(message("t", "k", "first")).await.unwrap();
        bus.publish(message("t", "k", "second")).await.unwrap();

        let mut stream = stream_for_key(&bus, "t", "g", "k").await;
        let first = stream.next().await.unwrap();
        stream.commit(first.offset).await.unwrap();
        let _second = stream.next().await.unwrap();
        drop(stream);

        let mut again = stream_for_key(&bus, "t", "g", "k").await;
        assert_eq!(again.next().await.unwrap().payload, b"second".to_vec());
    }

    #[tokio::test]
    async fn groups_have_independent_offsets() {
        let bus = InMemoryEventBus::new(1);
        bus.publish(message("t", "k", "only")).await.unwrap();

        let mut a = stream_for_key(&bus, "t", "a", "k").await;
        let received = a.next().await.unwrap();
        a.commit(received.offset).await.unwrap();

        let mut b = stream_for_key(&bus, "t", "b", "k").await;
        assert_eq!(b.next().await.unwrap().payload, b"only".to_vec());
    }

    #[tokio::test]
    async fn next_wakes_up_on_publish() {
        let bus = InMemoryEventBus::new(1);
        let mut stream = stream_for_key(&bus, "t", "g", "k").await;

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            publisher.publish(message("t", "k", "late")).await.unwrap();
        });

        let received = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("message should arrive")
            .unwrap();
        assert_eq!(received.payload, b"late".to_vec());
    }

    #[tokio::test]
    async fn unavailable_broker_rejects_publish() {
        let bus = InMemoryEventBus::new(1);
        bus.set_available(false);
        assert!(matches!(
            bus.publish(message("t", "k", "x")).await,
            Err(BusError::Unavailable(_))
        ));

        bus.set_available(true);
        assert!(bus.publish(message("t", "k", "x")).await.is_ok());
        assert_eq!(bus.messages("t").len(), 1);
    }

    #[tokio::test]
    async fn close_ends_waiting_streams() {
        let bus = InMemoryEventBus::new(1);
        let mut stream = stream_for_key(&bus, "t", "g", "k").await;

        let closer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });

        let result = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("close should wake the stream");
        assert!(result.is_none());
    }
}
