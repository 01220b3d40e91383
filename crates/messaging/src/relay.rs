//! Outbox relay: moves staged rows onto the bus.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::bus::{EventBus, OutgoingMessage};
use crate::outbox::{OutboxMessage, OutboxStore};
use crate::retry::RetryPolicy;
use crate::{BusError, Result};

/// Tuning knobs for a relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub retry: RetryPolicy,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(100),
            batch_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

/// Outcome of one relay pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayReport {
    /// Rows published and marked.
    pub published: usize,
    /// Rows whose publish exhausted the retry budget.
    pub failed: usize,
    /// Rows skipped because an earlier row of the same aggregate failed.
    pub deferred: usize,
}

/// Publishes unpublished outbox rows in creation order.
///
/// The aggregate id is the partition key, so the per-aggregate order of the
/// outbox is the per-partition order on the broker. When a row cannot be
/// published the rest of that aggregate's rows wait for the next pass.
#[derive(Clone)]
pub struct OutboxRelay {
    name: &'static str,
    store: Arc<dyn OutboxStore>,
    bus: Arc<dyn EventBus>,
    config: RelayConfig,
}

impl OutboxRelay {
    pub fn new(
        name: &'static str,
        store: Arc<dyn OutboxStore>,
        bus: Arc<dyn EventBus>,
        config: RelayConfig,
    ) -> Self {
        Self {
            name,
            store,
            bus,
            config,
        }
    }

    /// Runs one pass over the unpublished rows.
    #[tracing::instrument(skip(self), fields(relay = self.name))]
    pub async fn publish_pending(&self) -> Result<RelayReport> {
        let pending = self.store.fetch_unpublished(self.config.batch_size).await?;
        let mut report = RelayReport::default();
        let mut blocked: HashSet<String> = HashSet::new();

        for message in pending {
            if blocked.contains(&message.aggregate_id) {
                report.deferred += 1;
                continue;
            }

            match self.publish_with_retry(&message).await {
                Ok(()) => {
                    self.store.mark_published(message.id, Utc::now()).await?;
                    metrics::counter!("outbox_published_total", "relay" => self.name)
                        .increment(1);
                    report.published += 1;
                }
                Err(e) => {
                    metrics::counter!("outbox_publish_failures_total", "relay" => self.name)
                        .increment(1);
                    tracing::error!(
                        message_id = %message.id,
                        aggregate_id = %message.aggregate_id,
                        event_type = %message.event_type,
                        error = %e,
                        "publish retry budget exhausted, holding aggregate until next pass"
                    );
                    blocked.insert(message.aggregate_id.clone());
                    report.failed += 1;
                }
            }
        }

        if report.published > 0 || report.failed > 0 {
            tracing::debug!(?report, "relay pass finished");
        }
        Ok(report)
    }

    /// Polls until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(relay = self.name, "outbox relay started");
        loop {
            if let Err(e) = self.publish_pending().await {
                tracing::warn!(relay = self.name, error = %e, "relay pass failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(relay = self.name, "outbox relay stopped");
    }

    async fn publish_with_retry(&self, message: &OutboxMessage) -> Result<()> {
        let outgoing = OutgoingMessage {
            topic: message.topic()?.to_string(),
            key: message.aggregate_id.clone(),
            payload: message.payload.clone(),
            headers: message.headers.clone(),
        };
        self.config
            .retry
            .run(
                "outbox_publish",
                |e: &BusError| !matches!(e, BusError::Closed),
                || {
                    let bus = self.bus.clone();
                    let outgoing = outgoing.clone();
                    async move { bus.publish(outgoing).await }
                },
            )
            .await?;
        Ok(())
    }
}
