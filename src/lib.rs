//! Outbound webhook delivery.
//!
//! When a business event occurs, [`Dispatcher::trigger`] queues it and
//! returns immediately. In the background every active subscription of the
//! business that listens for the event gets a signed HTTP POST, with failed
//! attempts retried on an exponential backoff schedule up to a fixed cap.
//!
//! ## Guarantees
//! - At-least-once delivery per subscription, up to `max_attempts` attempts
//! - Every attempt's outcome is persisted as a Delivery Record
//! - Deliveries to different subscriptions never block each other
//! - Retries are driven by a scheduler polling the Delivery Record Store,
//!   not by the task that triggered the event
//!
//! ## Non-Guarantees
//! - Exactly-once delivery; receivers should dedupe on the delivery id header
//! - Ordering between events
//! - Reporting delivery results back to the event producer

mod backoff;
mod dispatcher;
mod error;
mod record;
mod scheduler;
mod sender;
mod signing;
mod storage;
mod telemetry;
mod types;
mod worker;

#[cfg(feature = "postgres")]
mod storage_postgres;

pub use backoff::BackoffPolicy;
pub use dispatcher::{Dispatcher, DispatcherConfig};
pub use error::{
    ConfigError,
    DispatchError,
    Error,
    SigningError,
    StoreError,
    SubscriptionError,
    TransitionError,
};
pub use record::{Transition, LEASE_EXPIRED};
pub use sender::{DeliveryRequest, HttpSender, SendOutcome, Sender, MAX_RESPONSE_BODY};
pub use signing::{
    build_delivery_headers,
    format_timestamp,
    is_timestamp_fresh,
    parse_signature_headers,
    sign,
    verify_signature,
    verify_webhook_request,
    HeaderNames,
    ParsedSignature,
    VerificationError,
};
pub use storage::{DeliveryStore, InMemoryDeliveryStore, InMemorySubscriptionStore, SubscriptionStore};
pub use types::{
    BusinessId,
    DeliveryId,
    DeliveryRecord,
    DeliveryStatus,
    EventType,
    Subscription,
    SubscriptionId,
};
pub use worker::AttemptReport;

#[cfg(feature = "postgres")]
pub use storage_postgres::PostgresDeliveryStore;
