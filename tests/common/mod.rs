#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use webhook_delivery::{
    BusinessId, DeliveryId, DeliveryRecord, DeliveryRequest, DeliveryStatus, DeliveryStore,
    EventType, InMemoryDeliveryStore, InMemorySubscriptionStore, SendOutcome, Sender, StoreError,
    Subscription, SubscriptionId, SubscriptionStore,
};

pub fn http(code: u16) -> SendOutcome {
    if (200..300).contains(&code) {
        SendOutcome::Success { response_code: code }
    } else {
        SendOutcome::Failure {
            response_code: Some(code),
            error: format!("HTTP {code}"),
        }
    }
}

/// Fake sender: scripted status codes per URL host, 200 once a script runs out.
///
/// Hosts marked with [`hold`](Self::hold) block until [`release`](Self::release).
#[derive(Default)]
pub struct FakeSender {
    scripts: Mutex<HashMap<String, VecDeque<u16>>>,
    requests: Mutex<Vec<DeliveryRequest>>,
    held: Mutex<HashMap<String, Arc<tokio::sync::Semaphore>>>,
}

impl FakeSender {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn script(&self, host: &str, codes: &[u16]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(host.to_string(), codes.iter().copied().collect());
    }

    pub fn hold(&self, host: &str) {
        self.held
            .lock()
            .unwrap()
            .insert(host.to_string(), Arc::new(tokio::sync::Semaphore::new(0)));
    }

    pub fn release(&self, host: &str) {
        if let Some(gate) = self.held.lock().unwrap().get(host) {
            gate.add_permits(tokio::sync::Semaphore::MAX_PERMITS / 2);
        }
    }

    pub fn requests(&self) -> Vec<DeliveryRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_to(&self, host: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.url.host_str() == Some(host))
            .count()
    }
}

#[async_trait]
impl Sender for FakeSender {
    async fn send(&self, request: DeliveryRequest) -> SendOutcome {
        let host = request.url.host_str().unwrap_or_default().to_string();
        self.requests.lock().unwrap().push(request);

        let gate = self.held.lock().unwrap().get(&host).cloned();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await.unwrap();
        }

        let code = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&host)
            .and_then(VecDeque::pop_front)
            .unwrap_or(200);
        http(code)
    }
}

/// Subscription store whose lookups wait until released.
pub struct GatedSubscriptionStore {
    pub inner: InMemorySubscriptionStore,
    gate: tokio::sync::Semaphore,
}

impl GatedSubscriptionStore {
    pub fn new(inner: InMemorySubscriptionStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            gate: tokio::sync::Semaphore::new(0),
        })
    }

    pub fn release(&self) {
        self.gate.add_permits(tokio::sync::Semaphore::MAX_PERMITS / 2);
    }
}

#[async_trait]
impl SubscriptionStore for GatedSubscriptionStore {
    async fn find_active_for_event(
        &self,
        business_id: &BusinessId,
        event_type: &EventType,
    ) -> Result<Vec<Subscription>, StoreError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        self.inner.find_active_for_event(business_id, event_type).await
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        self.inner.get(id).await
    }

    async fn flag_misconfigured(&self, id: &SubscriptionId, reason: &str) -> Result<(), StoreError> {
        self.inner.flag_misconfigured(id, reason).await
    }
}

/// Delivery store that refuses to insert records for the given subscriptions.
pub struct RejectingDeliveryStore {
    pub inner: InMemoryDeliveryStore,
    rejected: Vec<SubscriptionId>,
}

impl RejectingDeliveryStore {
    pub fn new(rejected: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryDeliveryStore::new(),
            rejected: rejected.iter().map(|id| SubscriptionId(id.to_string())).collect(),
        })
    }
}

#[async_trait]
impl DeliveryStore for RejectingDeliveryStore {
    async fn insert(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        if self.rejected.contains(&record.subscription_id) {
            return Err(StoreError::Unavailable("disk full".into()));
        }
        self.inner.insert(record).await
    }

    async fn get(&self, id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError> {
        self.inner.get(id).await
    }

    async fn compare_and_update(
        &self,
        expected_attempts: u32,
        next: &DeliveryRecord,
    ) -> Result<bool, StoreError> {
        self.inner.compare_and_update(expected_attempts, next).await
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        orphaned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        self.inner.list_due(now, orphaned_before, limit).await
    }

    async fn list_for_business(
        &self,
        business_id: &BusinessId,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        self.inner.list_for_business(business_id, status).await
    }
}

pub fn subscription(id: &str, host: &str) -> Subscription {
    Subscription::new(id, "biz_1", format!("https://{host}/hook"), "abc123")
        .with_event("booking.cancelled")
}

/// Poll the store until `pred` holds for some snapshot, or panic after `timeout`.
pub async fn wait_for<F>(
    store: &InMemoryDeliveryStore,
    timeout: Duration,
    pred: F,
) -> Vec<DeliveryRecord>
where
    F: Fn(&[DeliveryRecord]) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let records = store.snapshot().await;
        if pred(&records) {
            return records;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {timeout:?}; records: {records:#?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn record_for<'a>(records: &'a [DeliveryRecord], subscription_id: &str) -> &'a DeliveryRecord {
    records
        .iter()
        .find(|r| r.subscription_id.0 == subscription_id)
        .unwrap()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
