//! Background relay draining pending outbox entries to the transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::future::join_all;
use resilience::{Failure, PolicyExecutor};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::{AggregateId, OutboxEntry, OutboxStore, Result, Transport, TransportError};

/// How the entries of one aggregate in a batch are handed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// One publish per entry; a failure stops the aggregate's remaining entries.
    #[default]
    Immediate,
    /// One `publish_batch` per aggregate; all entries are marked sent or none.
    Transactional,
}

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Identifies this relay's leases. Must be unique among running relays.
    pub owner: String,
    pub batch_size: usize,
    pub poll_interval: Duration,
    pub lease: Duration,
    pub delivery: DeliveryMode,
    /// Sent entries older than this are purged. `None` keeps them forever.
    pub retention: Option<Duration>,
    pub cleanup_interval: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            owner: format!("relay-{}", uuid::Uuid::new_v4()),
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            lease: Duration::from_secs(30),
            delivery: DeliveryMode::Immediate,
            retention: Some(Duration::from_secs(86_400)),
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl RelayConfig {
    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    pub fn with_delivery(mut self, delivery: DeliveryMode) -> Self {
        self.delivery = delivery;
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }
}

/// What one relay pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayReport {
    pub claimed: usize,
    pub sent: usize,
    pub failed: usize,
    /// Entries left unpublished because an earlier entry of the same
    /// aggregate failed in this pass or its lease was lost.
    pub skipped: usize,
}

impl RelayReport {
    fn absorb(&mut self, other: RelayReport) {
        self.sent += other.sent;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

/// Publishes pending outbox entries through a resilience policy.
pub struct OutboxRelay<S, T> {
    store: S,
    transport: T,
    executor: PolicyExecutor,
    config: RelayConfig,
}

impl<S, T> OutboxRelay<S, T>
where
    S: OutboxStore + 'static,
    T: Transport + 'static,
{
    pub fn new(store: S, transport: T, executor: PolicyExecutor, config: RelayConfig) -> Self {
        Self {
            store,
            transport,
            executor,
            config,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Runs one claim → publish → mark pass.
    ///
    /// Aggregates are published concurrently; entries within an aggregate
    /// strictly in order.
    #[tracing::instrument(skip(self), fields(owner = %self.config.owner))]
    pub async fn run_once(&self) -> Result<RelayReport> {
        let started = Instant::now();
        let claimed = self
            .store
            .claim_pending(&self.config.owner, self.config.batch_size, self.config.lease)
            .await?;

        let mut report = RelayReport {
            claimed: claimed.len(),
            ..RelayReport::default()
        };
        if claimed.is_empty() {
            metrics::histogram!("outbox_relay_cycle_seconds")
                .record(started.elapsed().as_secs_f64());
            return Ok(report);
        }

        let groups = group_by_aggregate(claimed);
        let outcomes = join_all(groups.into_iter().map(|(aggregate_id, entries)| async move {
            match self.config.delivery {
                DeliveryMode::Immediate => self.deliver_in_order(aggregate_id, entries).await,
                DeliveryMode::Transactional => self.deliver_as_batch(aggregate_id, entries).await,
            }
        }))
        .await;

        for outcome in outcomes {
            report.absorb(outcome?);
        }

        metrics::histogram!("outbox_relay_cycle_seconds").record(started.elapsed().as_secs_f64());
        tracing::debug!(
            claimed = report.claimed,
            sent = report.sent,
            failed = report.failed,
            skipped = report.skipped,
            "relay pass finished"
        );
        Ok(report)
    }

    async fn deliver_in_order(
        &self,
        aggregate_id: AggregateId,
        entries: Vec<OutboxEntry>,
    ) -> Result<RelayReport> {
        let owner = self.config.owner.as_str();
        let mut report = RelayReport::default();
        let mut remaining = entries.into_iter();

        while let Some(entry) = remaining.next() {
            let message = entry.to_message();
            let transport = &self.transport;
            let result = self
                .executor
                .execute(|| transport.publish(&message))
                .await;

            match result {
                Ok(()) => {
                    if self.store.mark_sent(owner, &[entry.id]).await? == 0 {
                        // Another relay re-claimed the aggregate after our lease
                        // expired; publishing further would reorder it.
                        let skipped = remaining.count();
                        tracing::warn!(
                            %aggregate_id,
                            entry_id = %entry.id,
                            skipped,
                            "lease lost mid-partition, abandoning aggregate"
                        );
                        metrics::counter!("outbox_leases_lost_total").increment(1);
                        report.skipped += skipped;
                        break;
                    }
                    metrics::counter!("outbox_entries_sent_total").increment(1);
                    report.sent += 1;
                }
                Err(failure) => {
                    self.fail(&entry, &failure).await?;
                    report.failed += 1;

                    let skipped: Vec<_> = remaining.map(|e| e.id).collect();
                    if !skipped.is_empty() {
                        tracing::debug!(
                            %aggregate_id,
                            skipped = skipped.len(),
                            "holding back later entries of aggregate"
                        );
                        self.store.release(owner, &skipped).await?;
                    }
                    report.skipped += skipped.len();
                    break;
                }
            }
        }

        Ok(report)
    }

    async fn deliver_as_batch(
        &self,
        aggregate_id: AggregateId,
        entries: Vec<OutboxEntry>,
    ) -> Result<RelayReport> {
        let owner = self.config.owner.as_str();
        let messages: Vec<_> = entries.iter().map(OutboxEntry::to_message).collect();
        let transport = &self.transport;
        let result = self
            .executor
            .execute(|| transport.publish_batch(&messages))
            .await;

        let mut report = RelayReport::default();
        match result {
            Ok(()) => {
                let ids: Vec<_> = entries.iter().map(|e| e.id).collect();
                let marked = self.store.mark_sent(owner, &ids).await?;
                if marked < ids.len() as u64 {
                    tracing::warn!(
                        %aggregate_id,
                        expected = ids.len(),
                        marked,
                        "lease lost before batch was marked sent"
                    );
                    metrics::counter!("outbox_leases_lost_total").increment(1);
                }
                metrics::counter!("outbox_entries_sent_total").increment(marked);
                report.sent = marked as usize;
                report.skipped = ids.len() - marked as usize;
            }
            Err(failure) => {
                tracing::debug!(%aggregate_id, entries = entries.len(), "batch publish failed");
                for entry in &entries {
                    self.fail(entry, &failure).await?;
                }
                report.failed = entries.len();
            }
        }
        Ok(report)
    }

    async fn fail(&self, entry: &OutboxEntry, failure: &Failure<TransportError>) -> Result<()> {
        metrics::counter!("outbox_publish_failures_total", "kind" => failure.kind().as_str())
            .increment(1);
        tracing::warn!(
            entry_id = %entry.id,
            aggregate_id = %entry.aggregate_id,
            event_type = %entry.event_type,
            attempts = entry.attempts + 1,
            error = %failure,
            "publish failed, entry stays pending"
        );
        self.store
            .record_failure(&self.config.owner, entry.id, &failure.to_string())
            .await
    }

    /// Deletes sent entries past the retention window, if one is configured.
    pub async fn cleanup(&self) -> Result<u64> {
        let Some(retention) = self.config.retention else {
            return Ok(0);
        };
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::days(3650));
        let purged = self.store.purge_sent(cutoff).await?;
        if purged > 0 {
            tracing::info!(purged, "purged sent outbox entries");
        }
        Ok(purged)
    }

    /// Runs the relay loop on its own task until the handle is shut down.
    pub fn spawn(self) -> RelayHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let relay = Arc::new(self);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(relay.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let mut last_cleanup = tokio::time::Instant::now();
            tracing::info!(owner = %relay.config.owner, "outbox relay started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = relay.run_once().await {
                            tracing::error!(error = %e, "relay pass failed");
                        }
                        if last_cleanup.elapsed() >= relay.config.cleanup_interval {
                            last_cleanup = tokio::time::Instant::now();
                            if let Err(e) = relay.cleanup().await {
                                tracing::error!(error = %e, "outbox cleanup failed");
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }

            tracing::info!(owner = %relay.config.owner, "outbox relay stopped");
        });

        RelayHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Handle to a spawned relay.
pub struct RelayHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Signals the relay to stop after its current pass and waits for it.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "relay task ended abnormally");
        }
    }
}

/// Groups claimed entries by aggregate, keeping delivery order within each
/// group and the order in which aggregates first appear.
fn group_by_aggregate(entries: Vec<OutboxEntry>) -> Vec<(AggregateId, Vec<OutboxEntry>)> {
    let mut groups: Vec<(AggregateId, Vec<OutboxEntry>)> = Vec::new();
    let mut index: HashMap<AggregateId, usize> = HashMap::new();
    for entry in entries {
        match index.get(&entry.aggregate_id) {
            Some(&i) => groups[i].1.push(entry),
            None => {
                index.insert(entry.aggregate_id, groups.len());
                groups.push((entry.aggregate_id, vec![entry]));
            }
        }
    }
    groups
}
