//! One-shot rendezvous between a blocked request and an asynchronous outcome.
//!
//! A waiter [`push`](CorrelationRegistry::push)es a key and gets a [`Pending`]
//! handle. Whoever observes the outcome calls
//! [`resolve`](CorrelationRegistry::resolve) with the same key. Each entry is
//! resolved at most once; late or unknown results are dropped.

use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CorrelationError {
    /// A live entry already exists for the key.
    #[error("A waiter is already registered for '{0}'")]
    DuplicateKey(String),

    /// Nothing was resolved before the deadline.
    #[error("Timed out after {waited:?} waiting for '{key}'")]
    Timeout { key: String, waited: Duration },

    /// The entry was removed (swept or cancelled) without a result.
    #[error("Waiter for '{0}' was abandoned")]
    Abandoned(String),
}

struct Slot<V> {
    ticket: u64,
    sender: oneshot::Sender<V>,
    registered_at: Instant,
}

struct Inner<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    next_ticket: AtomicU64,
}

/// Key-addressed registry of single-use result slots.
pub struct CorrelationRegistry<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for CorrelationRegistry<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, V> Default for CorrelationRegistry<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> CorrelationRegistry<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                slots: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a slot for `key`.
    ///
    /// Fails with [`CorrelationError::DuplicateKey`] while another waiter for
    /// the same key is live.
    pub fn push(&self, key: K) -> Result<Pending<K, V>, CorrelationError> {
        let mut slots = self.slots();
        if slots.contains_key(&key) {
            return Err(CorrelationError::DuplicateKey(key.to_string()));
        }

        let (sender, receiver) = oneshot::channel();
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        slots.insert(
            key.clone(),
            Slot {
                ticket,
                sender,
                registered_at: Instant::now(),
            },
        );

        Ok(Pending {
            registry: self.clone(),
            key,
            ticket,
            receiver,
        })
    }

    /// Delivers `value` to the waiter registered for `key` and removes the
    /// entry. Returns false, without blocking, when nobody is waiting.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        let slot = self.slots().remove(key);
        match slot {
            Some(slot) => {
                if slot.sender.send(value).is_err() {
                    tracing::debug!(%key, "waiter went away before the result arrived");
                    return false;
                }
                true
            }
            None => {
                tracing::info!(%key, "no waiter registered, dropping result");
                false
            }
        }
    }

    /// Unregisters `key`. Safe to call whether or not a result was delivered.
    pub fn remove(&self, key: &K) -> bool {
        self.slots().remove(key).is_some()
    }

    fn remove_ticket(&self, key: &K, ticket: u64) {
        let mut slots = self.slots();
        if slots.get(key).is_some_and(|slot| slot.ticket == ticket) {
            slots.remove(key);
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.slots().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    /// Drops entries registered longer than `ttl` ago. Their waiters see
    /// [`CorrelationError::Abandoned`]. Returns how many were dropped.
    pub fn sweep_expired(&self, ttl: Duration) -> usize {
        let mut slots = self.slots();
        let before = slots.len();
        slots.retain(|key, slot| {
            let keep = slot.registered_at.elapsed() < ttl;
            if !keep {
                tracing::warn!(%key, "sweeping expired correlation entry");
            }
            keep
        });
        before - slots.len()
    }
}

/// The waiting side of one registry entry.
///
/// Dropping it, including when the waiting future is cancelled, removes the
/// entry unless a newer entry replaced it.
pub struct Pending<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    registry: CorrelationRegistry<K, V>,
    key: K,
    ticket: u64,
    receiver: oneshot::Receiver<V>,
}

impl<K, V> Pending<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Waits up to `timeout` for the result.
    pub async fn wait(mut self, timeout: Duration) -> Result<V, CorrelationError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(CorrelationError::Abandoned(self.key.to_string())),
            Err(_) => Err(CorrelationError::Timeout {
                key: self.key.to_string(),
                waited: timeout,
            }),
        }
    }
}

impl<K, V> Drop for Pending<K, V>
where
    K: Eq + Hash + Clone + Display,
{
    fn drop(&mut self) {
        self.registry.remove_ticket(&self.key, self.ticket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type Registry = CorrelationRegistry<String, u32>;

    #[tokio::test]
    async fn resolve_wakes_the_waiter_once() {
        let registry = Registry::new();
        let pending = registry.push("o-1".into()).unwrap();

        assert!(registry.resolve(&"o-1".to_string(), 7));
        assert!(!registry.resolve(&"o-1".to_string(), 8));

        assert_eq!(pending.wait(Duration::from_secs(1)).await, Ok(7));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn result_can_arrive_before_the_wait_starts() {
        let registry = Registry::new();
        let pending = registry.push("o-1".into()).unwrap();
        registry.resolve(&"o-1".to_string(), 1);

        tokio::task::yield_now().await;
        assert_eq!(pending.wait(Duration::from_millis(10)).await, Ok(1));
    }

    #[tokio::test]
    async fn duplicate_push_is_rejected() {
        let registry = Registry::new();
        let _first = registry.push("o-1".into()).unwrap();

        assert!(matches!(
            registry.push("o-1".into()),
            Err(CorrelationError::DuplicateKey(key)) if key == "o-1"
        ));
    }

    #[tokio::test]
    async fn timeout_removes_the_entry() {
        let registry = Registry::new();
        let pending = registry.push("o-1".into()).unwrap();

        let result = pending.wait(Duration::from_millis(10)).await;

        assert!(matches!(result, Err(CorrelationError::Timeout { .. })));
        assert!(!registry.contains(&"o-1".to_string()));
        assert!(!registry.resolve(&"o-1".to_string(), 1));
    }

    #[tokio::test]
    async fn cancelled_wait_removes_the_entry() {
        let registry = Registry::new();
        let pending = registry.push("o-1".into()).unwrap();

        let waiter = tokio::spawn(pending.wait(Duration::from_secs(60)));
        tokio::task::yield_now().await;
        waiter.abort();
        let _ = waiter.await;

        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn stale_handle_does_not_remove_a_newer_entry() {
        let registry = Registry::new();
        let old = registry.push("o-1".into()).unwrap();
        registry.remove(&"o-1".to_string());
        let fresh = registry.push("o-1".into()).unwrap();

        drop(old);

        assert!(registry.contains(&"o-1".to_string()));
        registry.resolve(&"o-1".to_string(), 3);
        assert_eq!(fresh.wait(Duration::from_secs(1)).await, Ok(3));
    }

    #[tokio::test]
    async fn resolve_unknown_key_is_a_noop() {
        let registry = Registry::new();
        assert!(!registry.resolve(&"nobody".to_string(), 1));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn remove_is_safe_after_resolution() {
        let registry = Registry::new();
        let _pending = registry.push("o-1".into()).unwrap();
        registry.resolve(&"o-1".to_string(), 1);

        assert!(!registry.remove(&"o-1".to_string()));
    }

    #[tokio::test]
    async fn sweep_abandons_old_waiters() {
        let registry = Registry::new();
        let pending = registry.push("o-1".into()).unwrap();

        assert_eq!(registry.sweep_expired(Duration::from_secs(60)), 0);
        assert_eq!(registry.sweep_expired(Duration::ZERO), 1);

        assert!(matches!(
            pending.wait(Duration::from_secs(1)).await,
            Err(CorrelationError::Abandoned(_))
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_resolve_and_timeout_never_deadlock() {
        let registry = Registry::new();
        let mut tasks = Vec::new();

        for i in 0..200u32 {
            let key = format!("o-{i}");
            let pending = registry.push(key.clone()).unwrap();
            let resolver = registry.clone();
            tasks.push(tokio::spawn(async move {
                let waiter = tokio::spawn(pending.wait(Duration::from_millis((i % 3) as u64)));
                resolver.resolve(&key, i);
                waiter.await.unwrap()
            }));
        }

        for task in tasks {
            match task.await.unwrap() {
                Ok(_) | Err(CorrelationError::Timeout { .. }) => {}
                Err(other) => panic!("unexpected: {other}"),
            }
        }
        assert!(registry.is_empty());
    }
}
