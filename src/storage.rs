use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::error::StoreError;
use crate::types::{
    BusinessId, DeliveryId, DeliveryRecord, DeliveryStatus, EventType, Subscription,
    SubscriptionId,
};

/// Read access to webhook registrations.
#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Active subscriptions of `business_id` that include `event_type`.
    async fn find_active_for_event(
        &self,
        business_id: &BusinessId,
        event_type: &EventType,
    ) -> Result<Vec<Subscription>, StoreError>;

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError>;

    /// Surface a configuration problem to the owning business.
    async fn flag_misconfigured(&self, id: &SubscriptionId, reason: &str) -> Result<(), StoreError>;
}

/// Durable delivery records.
///
/// Every mutation after insert goes through [`compare_and_update`](Self::compare_and_update)
/// so two processors can never both advance the same record.
#[async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn insert(&self, record: &DeliveryRecord) -> Result<(), StoreError>;

    async fn get(&self, id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError>;

    /// Replace the stored record with `next` only if it is still `pending`
    /// with exactly `expected_attempts` attempts. Returns whether it was written.
    async fn compare_and_update(
        &self,
        expected_attempts: u32,
        next: &DeliveryRecord,
    ) -> Result<bool, StoreError>;

    /// Pending records ready for an attempt: `next_retry_at <= now`, or never
    /// attempted and created at or before `orphaned_before`. Oldest first.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        orphaned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, StoreError>;

    async fn list_for_business(
        &self,
        business_id: &BusinessId,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<DeliveryRecord>, StoreError>;
}

/// In-memory subscriptions for tests and embedded use.
#[derive(Default)]
pub struct InMemorySubscriptionStore {
    subscriptions: RwLock<HashMap<SubscriptionId, Subscription>>,
    flagged: Mutex<HashMap<SubscriptionId, String>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, subscription: Subscription) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.id.clone(), subscription);
    }

    pub async fn remove(&self, id: &SubscriptionId) -> Option<Subscription> {
        self.subscriptions.write().await.remove(id)
    }

    /// Subscriptions flagged as misconfigured, with the reason.
    pub async fn flagged(&self) -> HashMap<SubscriptionId, String> {
        self.flagged.lock().await.clone()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn find_active_for_event(
        &self,
        business_id: &BusinessId,
        event_type: &EventType,
    ) -> Result<Vec<Subscription>, StoreError> {
        let guard = self.subscriptions.read().await;
        let mut matching: Vec<Subscription> = guard
            .values()
            .filter(|s| &s.business_id == business_id && s.accepts(event_type))
            .cloned()
            .collect();
        matching.sort_by(|a, b| a.id.0.cmp(&b.id.0));
        Ok(matching)
    }

    async fn get(&self, id: &SubscriptionId) -> Result<Option<Subscription>, StoreError> {
        Ok(self.subscriptions.read().await.get(id).cloned())
    }

    async fn flag_misconfigured(&self, id: &SubscriptionId, reason: &str) -> Result<(), StoreError> {
        self.flagged
            .lock()
            .await
            .insert(id.clone(), reason.to_string());
        Ok(())
    }
}

/// In-memory delivery records. State is lost on restart.
#[derive(Default)]
pub struct InMemoryDeliveryStore {
    records: Mutex<HashMap<DeliveryId, DeliveryRecord>>,
}

impl InMemoryDeliveryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> Vec<DeliveryRecord> {
        let mut records: Vec<DeliveryRecord> =
            self.records.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

#[async_trait]
impl DeliveryStore for InMemoryDeliveryStore {
    async fn insert(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        let mut guard = self.records.lock().await;
        if guard.contains_key(&record.id) {
            return Err(StoreError::Corrupt(format!("duplicate delivery id {}", record.id)));
        }
        guard.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError> {
        Ok(self.records.lock().await.get(id).cloned())
    }

    async fn compare_and_update(
        &self,
        expected_attempts: u32,
        next: &DeliveryRecord,
    ) -> Result<bool, StoreError> {
        let mut guard = self.records.lock().await;
        let Some(current) = guard.get_mut(&next.id) else {
            return Ok(false);
        };

        if current.status != DeliveryStatus::Pending || current.attempts != expected_attempts {
            return Ok(false);
        }

        *current = next.clone();
        Ok(true)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        orphaned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let guard = self.records.lock().await;
        let mut due: Vec<DeliveryRecord> = guard
            .values()
            .filter(|r| r.status == DeliveryStatus::Pending)
            .filter(|r| match r.next_retry_at {
                Some(at) => at <= now,
                None => r.created_at <= orphaned_before,
            })
            .cloned()
            .collect();
        due.sort_by_key(|r| r.next_retry_at.unwrap_or(r.created_at));
        due.truncate(limit);
        Ok(due)
    }

    async fn list_for_business(
        &self,
        business_id: &BusinessId,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let guard = self.records.lock().await;
        let mut records: Vec<DeliveryRecord> = guard
            .values()
            .filter(|r| &r.business_id == business_id)
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }
}
