use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use common::OrderId;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};

/// Default per-subscriber buffer.
pub const DEFAULT_BUFFER: usize = 16;

/// Status update pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    #[serde(rename = "orderId")]
    pub order_id: OrderId,
    pub status: String,
}

/// Identifies one registered subscriber of one order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

#[derive(Debug)]
struct CachedStatus {
    status: String,
    updated_at: Instant,
}

#[derive(Debug, Default)]
struct OrderChannel {
    subscribers: HashMap<SubscriberId, mpsc::Sender<StatusMessage>>,
    last: Option<CachedStatus>,
}

#[derive(Debug, Default)]
struct HubState {
    orders: Mutex<HashMap<OrderId, OrderChannel>>,
    next_id: AtomicU64,
}

/// Fans status changes out to live subscribers, per order.
///
/// The last broadcast status of an order is cached so that a subscriber
/// registering after the fact still learns it first. Sends never wait: every
/// subscriber owns a bounded buffer and an update that does not fit is
/// dropped for that subscriber only.
#[derive(Debug, Clone)]
pub struct StatusBroadcastHub {
    state: Arc<HubState>,
    buffer: usize,
}

impl Default for StatusBroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}

impl StatusBroadcastHub {
    /// `buffer` is the capacity of the channel created by [`subscribe`](Self::subscribe).
    pub fn new(buffer: usize) -> Self {
        Self {
            state: Arc::new(HubState::default()),
            buffer: buffer.max(1),
        }
    }

    fn orders(&self) -> MutexGuard<'_, HashMap<OrderId, OrderChannel>> {
        self.state.orders.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds `sender` to the live set of `order_id`. If a status is cached it is
    /// sent before this call returns, so it precedes any later broadcast.
    pub fn register(&self, order_id: &OrderId, sender: mpsc::Sender<StatusMessage>) -> SubscriberId {
        let id = SubscriberId(self.state.next_id.fetch_add(1, Ordering::Relaxed));
        let mut orders = self.orders();
        let channel = orders.entry(order_id.clone()).or_default();

        if let Some(cached) = &channel.last {
            let message = StatusMessage {
                order_id: order_id.clone(),
                status: cached.status.clone(),
            };
            if let Err(e) = sender.try_send(message) {
                tracing::warn!(%order_id, error = %e, "could not deliver cached status to new subscriber");
            }
        }

        channel.subscribers.insert(id, sender);
        tracing::debug!(%order_id, subscribers = channel.subscribers.len(), "subscriber registered");
        id
    }

    /// Creates a buffered channel, registers it and returns the receiving end.
    /// Dropping the subscription unregisters it.
    pub fn subscribe(&self, order_id: &OrderId) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = self.register(order_id, tx);
        Subscription {
            hub: self.clone(),
            order_id: order_id.clone(),
            id,
            receiver: rx,
        }
    }

    /// Removes a subscriber. The cached status outlives the last subscriber.
    pub fn unregister(&self, order_id: &OrderId, id: SubscriberId) {
        let mut orders = self.orders();
        let Some(channel) = orders.get_mut(order_id) else {
            return;
        };
        channel.subscribers.remove(&id);
        if channel.subscribers.is_empty() && channel.last.is_none() {
            orders.remove(order_id);
        }
    }

    /// Caches `status` for the order and delivers it to every live subscriber.
    ///
    /// Returns the number of subscribers the message was handed to.
    pub fn broadcast(&self, order_id: &OrderId, status: impl Into<String>) -> usize {
        self.broadcast_if(order_id, status, |_| true).unwrap_or(0)
    }

    /// Like [`broadcast`](Self::broadcast), but only when `accept` approves the
    /// currently cached status. The check and the send happen under one lock,
    /// so concurrent writers cannot slip a status in between.
    ///
    /// Returns None when the update was rejected.
    pub fn broadcast_if(
        &self,
        order_id: &OrderId,
        status: impl Into<String>,
        accept: impl FnOnce(Option<&str>) -> bool,
    ) -> Option<usize> {
        let status = status.into();
        let mut orders = self.orders();
        let cached = orders
            .get(order_id)
            .and_then(|c| c.last.as_ref())
            .map(|c| c.status.as_str());
        if !accept(cached) {
            tracing::debug!(%order_id, %status, ?cached, "status update rejected");
            return None;
        }
        let channel = orders.entry(order_id.clone()).or_default();
        channel.last = Some(CachedStatus {
            status: status.clone(),
            updated_at: Instant::now(),
        });

        let message = StatusMessage {
            order_id: order_id.clone(),
            status,
        };
        let mut delivered = 0;
        channel.subscribers.retain(|_, sender| match sender.try_send(message.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(TrySendError::Full(_)) => {
                metrics::counter!("status_hub_dropped_total").increment(1);
                tracing::warn!(%order_id, status = %message.status, "subscriber buffer full, dropping update");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        });

        tracing::debug!(%order_id, status = %message.status, delivered, "status broadcast");
        Some(delivered)
    }

    /// Last status broadcast for the order, if still cached.
    pub fn last_status(&self, order_id: &OrderId) -> Option<String> {
        self.orders()
            .get(order_id)
            .and_then(|c| c.last.as_ref())
            .map(|c| c.status.clone())
    }

    pub fn subscriber_count(&self, order_id: &OrderId) -> usize {
        self.orders()
            .get(order_id)
            .map_or(0, |c| c.subscribers.len())
    }

    /// Drops cached statuses older than `max_age` for orders nobody listens to.
    /// Returns how many orders were evicted.
    pub fn evict_idle(&self, max_age: Duration) -> usize {
        let mut orders = self.orders();
        let before = orders.len();
        orders.retain(|_, channel| {
            channel.subscribers.retain(|_, sender| !sender.is_closed());
            if !channel.subscribers.is_empty() {
                return true;
            }
            channel
                .last
                .as_ref()
                .is_some_and(|c| c.updated_at.elapsed() < max_age)
        });
        let evicted = before - orders.len();
        if evicted > 0 {
            tracing::debug!(evicted, "evicted idle order statuses");
        }
        evicted
    }
}

/// Receiving end of a hub registration.
#[derive(Debug)]
pub struct Subscription {
    hub: StatusBroadcastHub,
    order_id: OrderId,
    id: SubscriberId,
    receiver: mpsc::Receiver<StatusMessage>,
}

impl Subscription {
    pub fn order_id(&self) -> &OrderId {
        &self.order_id
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Waits for the next status message. None once the hub dropped this subscriber.
    pub async fn recv(&mut self) -> Option<StatusMessage> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<StatusMessage> {
        self.receiver.try_recv().ok()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unregister(&self.order_id, self.id);
    }
}
