//! Periodic sweep over orders the saga left hanging.
//!
//! Orders stuck in `Pending` (no reservation outcome observed) or
//! `AwaitingPayment` (no payment outcome) past a threshold are handed to a
//! [`StaleOrderPolicy`]. The default policy only reports them. The same pass
//! drops expired registry waiters and idle cached statuses from the hub.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use status_hub::StatusBroadcastHub;
use tokio::sync::watch;

use crate::Result;
use crate::coordinator::ReservationRegistry;
use crate::order::Order;
use crate::status::OrderStatus;
use crate::store::OrderStore;

/// Decides what happens to an order that has not moved for too long.
#[async_trait]
pub trait StaleOrderPolicy: Send + Sync {
    async fn on_stale(&self, order: &Order, idle_for: chrono::Duration);
}

/// Logs stale orders and leaves them untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReportOnly;

#[async_trait]
impl StaleOrderPolicy for ReportOnly {
    async fn on_stale(&self, order: &Order, idle_for: chrono::Duration) {
        tracing::warn!(
            order_id = %order.id,
            status = %order.status,
            idle_secs = idle_for.num_seconds(),
            "order needs reconciliation"
        );
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// How long an order may sit in a non-terminal status.
    pub stale_after: Duration,
    /// Registry entries older than this are dropped.
    pub correlation_ttl: Duration,
    /// Cached statuses nobody listens to are dropped after this long.
    pub status_cache_ttl: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stale_after: Duration::from_secs(60),
            correlation_ttl: Duration::from_secs(60),
            status_cache_ttl: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub stale_orders: usize,
    pub swept_waiters: usize,
    pub evicted_statuses: usize,
}

pub struct Reconciler {
    store: Arc<dyn OrderStore>,
    registry: ReservationRegistry,
    hub: StatusBroadcastHub,
    policy: Arc<dyn StaleOrderPolicy>,
    config: ReconcileConfig,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn OrderStore>,
        registry: ReservationRegistry,
        hub: StatusBroadcastHub,
        policy: Arc<dyn StaleOrderPolicy>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            registry,
            hub,
            policy,
            config,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn run_once(&self) -> Result<ReconcileReport> {
        let swept_waiters = self.registry.sweep_expired(self.config.correlation_ttl);
        let evicted_statuses = self.hub.evict_idle(self.config.status_cache_ttl);

        let now = Utc::now();
        let stale_after = chrono::Duration::from_std(self.config.stale_after)
            .unwrap_or(chrono::Duration::MAX);
        let before = now.checked_sub_signed(stale_after).unwrap_or(now);
        let stale = self
            .store
            .stale(&[OrderStatus::Pending, OrderStatus::AwaitingPayment], before)
            .await?;

        metrics::gauge!("reconciliation_stale_orders").set(stale.len() as f64);
        for order in &stale {
            self.policy.on_stale(order, now - order.updated_at).await;
        }

        let report = ReconcileReport {
            stale_orders: stale.len(),
            swept_waiters,
            evicted_statuses,
        };
        if report != ReconcileReport::default() {
            tracing::info!(?report, "reconciliation pass finished");
        }
        Ok(report)
    }

    /// Runs a pass every `interval` until `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }
            if let Err(e) = self.run_once().await {
                tracing::warn!(error = %e, "reconciliation pass failed");
            }
        }
        tracing::info!("reconciler stopped");
    }
}
