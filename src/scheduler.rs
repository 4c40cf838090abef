//! Independent retry sweep.
//!
//! The scheduler polls the Delivery Record Store for pending records whose
//! `next_retry_at` has passed (or that were never attempted and are older
//! than the orphan grace period) and runs one attempt for each. It is the
//! only thing that drives retries, so it keeps running regardless of which
//! request triggered the original event.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Notify;
use tokio::task::{Id, JoinError, JoinSet};
use tokio::time::MissedTickBehavior;

use crate::record::to_chrono;
use crate::storage::DeliveryStore;
use crate::telemetry::{metric_inc, TARGET};
use crate::types::DeliveryId;
use crate::worker::{AttemptReport, DeliveryWorker};

/// Attempt tasks currently running, keyed by task id.
type InFlight = HashMap<Id, DeliveryId>;

#[derive(Debug, Clone, Copy)]
pub(crate) struct SweepSettings {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub orphan_grace: Duration,
}

/// Main scheduler loop; returns once `is_running` is cleared and in-flight
/// attempts have finished.
pub(crate) async fn scheduler_loop(
    worker: Arc<DeliveryWorker>,
    deliveries: Arc<dyn DeliveryStore>,
    settings: SweepSettings,
    is_running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut ticker = tokio::time::interval(settings.poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut tasks: JoinSet<AttemptReport> = JoinSet::new();
    let mut in_flight = InFlight::new();

    tracing::info!(
        target: TARGET,
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        "Retry scheduler started"
    );

    while is_running.load(Ordering::SeqCst) {
        tokio::select! {
            _ = ticker.tick() => {
                sweep(&worker, deliveries.as_ref(), settings, &mut tasks, &mut in_flight).await;
            }
            Some(joined) = tasks.join_next_with_id(), if !tasks.is_empty() => {
                reap(joined, &mut in_flight);
            }
            _ = shutdown.notified() => {}
        }
    }

    while let Some(joined) = tasks.join_next_with_id().await {
        reap(joined, &mut in_flight);
    }

    tracing::info!(target: TARGET, "Retry scheduler stopped");
}

async fn sweep(
    worker: &Arc<DeliveryWorker>,
    deliveries: &dyn DeliveryStore,
    settings: SweepSettings,
    tasks: &mut JoinSet<AttemptReport>,
    in_flight: &mut InFlight,
) {
    let now = Utc::now();
    let orphaned_before = now - to_chrono(settings.orphan_grace);

    let due = match deliveries
        .list_due(now, orphaned_before, settings.batch_size)
        .await
    {
        Ok(due) => due,
        Err(e) => {
            metric_inc("webhook.store.error");
            tracing::error!(target: TARGET, error = %e, "Failed to load due deliveries");
            return;
        }
    };

    for record in due {
        if in_flight.values().any(|id| *id == record.id) {
            continue;
        }
        tracing::debug!(
            target: TARGET,
            delivery_id = %record.id,
            subscription_id = %record.subscription_id,
            attempts = record.attempts,
            "Retrying due delivery"
        );
        let worker = worker.clone();
        let delivery_id = record.id;
        let handle = tasks.spawn(async move { worker.attempt(record).await });
        in_flight.insert(handle.id(), delivery_id);
    }
}

fn reap(joined: Result<(Id, AttemptReport), JoinError>, in_flight: &mut InFlight) {
    match joined {
        Ok((task_id, _)) => {
            in_flight.remove(&task_id);
        }
        Err(e) => {
            let delivery_id = in_flight.remove(&e.id());
            // The record stays claimed until its lease expires.
            tracing::error!(
                target: TARGET,
                delivery_id = ?delivery_id,
                error = %e,
                "Retry task panicked"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::backoff::BackoffPolicy;
    use crate::sender::{DeliveryRequest, SendOutcome, Sender};
    use crate::signing::HeaderNames;
    use crate::storage::{InMemoryDeliveryStore, InMemorySubscriptionStore};
    use crate::types::{DeliveryRecord, DeliveryStatus, EventType, Subscription};

    struct CountingSender(AtomicUsize);

    #[async_trait]
    impl Sender for CountingSender {
        async fn send(&self, request: DeliveryRequest) -> SendOutcome {
            if request.url.host_str() == Some("boom.example.com") {
                panic!("receiver blew up");
            }
            self.0.fetch_add(1, Ordering::SeqCst);
            SendOutcome::Success { response_code: 200 }
        }
    }

    #[tokio::test]
    async fn sweeps_due_and_orphaned_records() {
        let sub = Subscription::new("sub_1", "biz_1", "https://example.com/hook", "abc123")
            .with_event("booking.cancelled");
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        subscriptions.upsert(sub.clone()).await;
        let deliveries = Arc::new(InMemoryDeliveryStore::new());
        let sender = Arc::new(CountingSender(AtomicUsize::new(0)));

        let mut due = DeliveryRecord::new(
            &sub,
            EventType::from("booking.cancelled"),
            json!({"n": 1}),
            5,
            Utc::now(),
        );
        due.attempts = 1;
        due.next_retry_at = Some(Utc::now() - chrono::Duration::milliseconds(10));
        let orphan = DeliveryRecord::new(
            &sub,
            EventType::from("booking.cancelled"),
            json!({"n": 2}),
            5,
            Utc::now() - chrono::Duration::minutes(5),
        );
        let mut not_yet = due.clone();
        not_yet.id = DeliveryId::new();
        not_yet.next_retry_at = Some(Utc::now() + chrono::Duration::minutes(5));
        for r in [&due, &orphan, &not_yet] {
            deliveries.insert(r).await.unwrap();
        }

        let worker = Arc::new(DeliveryWorker {
            subscriptions,
            deliveries: deliveries.clone(),
            sender: sender.clone(),
            backoff: BackoffPolicy::default(),
            headers: HeaderNames::default(),
            send_timeout: Duration::from_secs(1),
            claim_lease: Duration::from_secs(5),
            in_flight: Arc::new(tokio::sync::Semaphore::new(4)),
        });
        let is_running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(scheduler_loop(
            worker,
            deliveries.clone(),
            SweepSettings {
                poll_interval: Duration::from_millis(20),
                batch_size: 10,
                orphan_grace: Duration::from_secs(30),
            },
            is_running.clone(),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        is_running.store(false, Ordering::SeqCst);
        shutdown.notify_one();
        handle.await.unwrap();

        assert_eq!(sender.0.load(Ordering::SeqCst), 2);
        let status = |id: DeliveryId| {
            let deliveries = deliveries.clone();
            async move { deliveries.get(&id).await.unwrap().unwrap().status }
        };
        assert_eq!(status(due.id).await, DeliveryStatus::Success);
        assert_eq!(status(orphan.id).await, DeliveryStatus::Success);
        assert_eq!(status(not_yet.id).await, DeliveryStatus::Pending);
    }

    #[tokio::test]
    async fn panicking_attempt_does_not_stop_the_sweep() {
        let ok = Subscription::new("sub_ok", "biz_1", "https://ok.example.com/hook", "abc123")
            .with_event("booking.cancelled");
        let boom = Subscription::new("sub_boom", "biz_1", "https://boom.example.com/hook", "abc123")
            .with_event("booking.cancelled");
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        subscriptions.upsert(ok.clone()).await;
        subscriptions.upsert(boom.clone()).await;
        let deliveries = Arc::new(InMemoryDeliveryStore::new());
        let sender = Arc::new(CountingSender(AtomicUsize::new(0)));

        let created = Utc::now() - chrono::Duration::minutes(5);
        let exploding = DeliveryRecord::new(&boom, EventType::from("booking.cancelled"), json!({}), 5, created);
        let healthy = DeliveryRecord::new(&ok, EventType::from("booking.cancelled"), json!({}), 5, created);
        deliveries.insert(&exploding).await.unwrap();
        deliveries.insert(&healthy).await.unwrap();

        let worker = Arc::new(DeliveryWorker {
            subscriptions,
            deliveries: deliveries.clone(),
            sender: sender.clone(),
            backoff: BackoffPolicy::default(),
            headers: HeaderNames::default(),
            send_timeout: Duration::from_secs(1),
            claim_lease: Duration::from_secs(5),
            in_flight: Arc::new(tokio::sync::Semaphore::new(4)),
        });
        let is_running = Arc::new(AtomicBool::new(true));
        let shutdown = Arc::new(Notify::new());
        let handle = tokio::spawn(scheduler_loop(
            worker,
            deliveries.clone(),
            SweepSettings {
                poll_interval: Duration::from_millis(20),
                batch_size: 10,
                orphan_grace: Duration::from_secs(30),
            },
            is_running.clone(),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(200)).await;
        is_running.store(false, Ordering::SeqCst);
        shutdown.notify_one();
        // The loop itself survives the panic and shuts down cleanly
        handle.await.unwrap();

        assert_eq!(sender.0.load(Ordering::SeqCst), 1);
        let healthy = deliveries.get(&healthy.id).await.unwrap().unwrap();
        assert_eq!(healthy.status, DeliveryStatus::Success);

        // Claimed before the panic; left pending under its lease
        let exploding = deliveries.get(&exploding.id).await.unwrap().unwrap();
        assert_eq!(exploding.status, DeliveryStatus::Pending);
        assert_eq!(exploding.attempts, 1);
        assert!(exploding.next_retry_at.unwrap() > Utc::now());
    }
}
