use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{StoreError, SubscriptionError};

/// Identifier of a webhook subscription.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscription IDs with other string identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub String);

/// Identifier of the business owning subscriptions and deliveries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BusinessId(pub String);

/// Domain event name, e.g. `booking.cancelled`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventType(pub String);

/// Identifier of a delivery record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryId(pub Uuid);

impl DeliveryId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DeliveryId {
    fn default() -> Self {
        Self::new()
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        })*
    };
}

display_inner!(SubscriptionId, BusinessId, EventType, DeliveryId);

impl From<&str> for EventType {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A business's registration of a URL for a set of event types.
///
/// Owned by the Subscription Store; read-only to the delivery engine.
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub business_id: BusinessId,

    /// Absolute HTTP(S) endpoint.
    pub url: String,

    /// Opaque signing key. Never logged or sent.
    pub secret: Vec<u8>,

    pub subscribed_events: HashSet<EventType>,
    pub active: bool,
}

impl Subscription {
    /// Create an active subscription with no event types.
    pub fn new(
        id: impl Into<String>,
        business_id: impl Into<String>,
        url: impl Into<String>,
        secret: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            id: SubscriptionId(id.into()),
            business_id: BusinessId(business_id.into()),
            url: url.into(),
            secret: secret.into(),
            subscribed_events: HashSet::new(),
            active: true,
        }
    }

    /// Subscribe to an additional event type.
    pub fn with_event(mut self, event_type: impl Into<String>) -> Self {
        self.subscribed_events.insert(EventType(event_type.into()));
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    /// Whether this subscription should receive `event_type`.
    pub fn accepts(&self, event_type: &EventType) -> bool {
        self.active && self.subscribed_events.contains(event_type)
    }

    /// Check that the subscription is usable and return its parsed URL.
    pub fn validate(&self) -> Result<Url, SubscriptionError> {
        if self.secret.is_empty() {
            return Err(SubscriptionError::EmptySecret);
        }

        let url = Url::parse(&self.url)
            .map_err(|e| SubscriptionError::InvalidUrl(e.to_string()))?;

        match url.scheme() {
            "http" | "https" => {}
            other => return Err(SubscriptionError::UnsupportedScheme(other.to_string())),
        }

        if url.host_str().map_or(true, str::is_empty) {
            return Err(SubscriptionError::MissingHost);
        }

        Ok(url)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("business_id", &self.business_id)
            .field("url", &self.url)
            .field("secret", &"<redacted>")
            .field("subscribed_events", &self.subscribed_events)
            .field("active", &self.active)
            .finish()
    }
}

/// Delivery lifecycle status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Success,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Success => "success",
            DeliveryStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending)
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeliveryStatus::Pending),
            "success" => Ok(DeliveryStatus::Success),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(StoreError::Corrupt(format!("unknown delivery status {other:?}"))),
        }
    }
}

/// Durable state of one (event occurrence, subscription) delivery.
///
/// Transitions live in [`crate::record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeliveryRecord {
    pub id: DeliveryId,
    pub subscription_id: SubscriptionId,
    pub business_id: BusinessId,
    pub event_type: EventType,

    /// Event payload; never changes after creation.
    pub payload: serde_json::Value,

    pub status: DeliveryStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub response_code: Option<u16>,
    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
}
