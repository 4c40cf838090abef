use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, Row};

use crate::error::StoreError;
use crate::storage::DeliveryStore;
use crate::types::{
    BusinessId, DeliveryId, DeliveryRecord, DeliveryStatus, EventType, SubscriptionId,
};

const COLUMNS: &str = "id, subscription_id, business_id, event_type, payload, status, attempts, \
     max_attempts, next_retry_at, last_error, response_code, created_at, delivered_at";

/// Delivery records in a `webhook_deliveries` table.
pub struct PostgresDeliveryStore {
    client: Client,
}

impl PostgresDeliveryStore {
    /// Wraps `client`, creating the table and due-record index if missing.
    pub async fn new(client: Client) -> Result<Self, StoreError> {
        client
            .batch_execute(
                "CREATE TABLE IF NOT EXISTS webhook_deliveries (
                    id UUID PRIMARY KEY,
                    subscription_id TEXT NOT NULL,
                    business_id TEXT NOT NULL,
                    event_type TEXT NOT NULL,
                    payload JSONB NOT NULL,
                    status TEXT NOT NULL,
                    attempts INTEGER NOT NULL,
                    max_attempts INTEGER NOT NULL,
                    next_retry_at TIMESTAMPTZ,
                    last_error TEXT,
                    response_code INTEGER,
                    created_at TIMESTAMPTZ NOT NULL,
                    delivered_at TIMESTAMPTZ
                );
                CREATE INDEX IF NOT EXISTS webhook_deliveries_pending_idx
                    ON webhook_deliveries (next_retry_at, created_at)
                    WHERE status = 'pending';
                CREATE INDEX IF NOT EXISTS webhook_deliveries_business_idx
                    ON webhook_deliveries (business_id, created_at);",
            )
            .await?;

        Ok(Self { client })
    }
}

fn to_i32(value: u32, column: &str) -> Result<i32, StoreError> {
    i32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn to_u32(value: i32, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

fn from_row(row: &Row) -> Result<DeliveryRecord, StoreError> {
    let status: String = row.try_get("status")?;
    let response_code: Option<i32> = row.try_get("response_code")?;
    let response_code = response_code
        .map(|code| {
            u16::try_from(code)
                .map_err(|_| StoreError::Corrupt(format!("response_code out of range: {code}")))
        })
        .transpose()?;

    Ok(DeliveryRecord {
        id: DeliveryId(row.try_get("id")?),
        subscription_id: SubscriptionId(row.try_get("subscription_id")?),
        business_id: BusinessId(row.try_get("business_id")?),
        event_type: EventType(row.try_get("event_type")?),
        payload: row.try_get("payload")?,
        status: status.parse()?,
        attempts: to_u32(row.try_get("attempts")?, "attempts")?,
        max_attempts: to_u32(row.try_get("max_attempts")?, "max_attempts")?,
        next_retry_at: row.try_get("next_retry_at")?,
        last_error: row.try_get("last_error")?,
        response_code,
        created_at: row.try_get("created_at")?,
        delivered_at: row.try_get("delivered_at")?,
    })
}

#[async_trait]
impl DeliveryStore for PostgresDeliveryStore {
    async fn insert(&self, record: &DeliveryRecord) -> Result<(), StoreError> {
        let response_code = record.response_code.map(i32::from);
        self.client
            .execute(
                &format!(
                    "INSERT INTO webhook_deliveries ({COLUMNS})
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)"
                ),
                &[
                    &record.id.0,
                    &record.subscription_id.0,
                    &record.business_id.0,
                    &record.event_type.0,
                    &record.payload,
                    &record.status.as_str(),
                    &to_i32(record.attempts, "attempts")?,
                    &to_i32(record.max_attempts, "max_attempts")?,
                    &record.next_retry_at,
                    &record.last_error,
                    &response_code,
                    &record.created_at,
                    &record.delivered_at,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get(&self, id: &DeliveryId) -> Result<Option<DeliveryRecord>, StoreError> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT {COLUMNS} FROM webhook_deliveries WHERE id = $1"),
                &[&id.0],
            )
            .await?;
        row.as_ref().map(from_row).transpose()
    }

    async fn compare_and_update(
        &self,
        expected_attempts: u32,
        next: &DeliveryRecord,
    ) -> Result<bool, StoreError> {
        let response_code = next.response_code.map(i32::from);
        let updated = self
            .client
            .execute(
                "UPDATE webhook_deliveries
                 SET status = $3, attempts = $4, next_retry_at = $5, last_error = $6,
                     response_code = $7, delivered_at = $8
                 WHERE id = $1 AND status = 'pending' AND attempts = $2",
                &[
                    &next.id.0,
                    &to_i32(expected_attempts, "attempts")?,
                    &next.status.as_str(),
                    &to_i32(next.attempts, "attempts")?,
                    &next.next_retry_at,
                    &next.last_error,
                    &response_code,
                    &next.delivered_at,
                ],
            )
            .await?;
        Ok(updated == 1)
    }

    async fn list_due(
        &self,
        now: DateTime<Utc>,
        orphaned_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {COLUMNS} FROM webhook_deliveries
                     WHERE status = 'pending'
                       AND ((next_retry_at IS NOT NULL AND next_retry_at <= $1)
                         OR (next_retry_at IS NULL AND created_at <= $2))
                     ORDER BY COALESCE(next_retry_at, created_at)
                     LIMIT $3"
                ),
                &[&now, &orphaned_before, &limit],
            )
            .await?;
        rows.iter().map(from_row).collect()
    }

    async fn list_for_business(
        &self,
        business_id: &BusinessId,
        status: Option<DeliveryStatus>,
    ) -> Result<Vec<DeliveryRecord>, StoreError> {
        let rows = match status {
            Some(status) => {
                self.client
                    .query(
                        &format!(
                            "SELECT {COLUMNS} FROM webhook_deliveries
                             WHERE business_id = $1 AND status = $2
                             ORDER BY created_at"
                        ),
                        &[&business_id.0, &status.as_str()],
                    )
                    .await?
            }
            None => {
                self.client
                    .query(
                        &format!(
                            "SELECT {COLUMNS} FROM webhook_deliveries
                             WHERE business_id = $1
                             ORDER BY created_at"
                        ),
                        &[&business_id.0],
                    )
                    .await?
            }
        };
        rows.iter().map(from_row).collect()
    }
}
