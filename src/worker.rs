use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use url::Url;

use crate::backoff::BackoffPolicy;
use crate::error::{StoreError, SubscriptionError};
use crate::record::Transition;
use crate::sender::{DeliveryRequest, SendOutcome, Sender};
use crate::signing::{build_delivery_headers, sign, HeaderNames};
use crate::storage::{DeliveryStore, SubscriptionStore};
use crate::telemetry::{metric_inc, TARGET};
use crate::types::{DeliveryRecord, Subscription};

/// What happened to a record handed to [`DeliveryWorker::attempt`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptReport {
    /// An attempt ran and its result was persisted.
    Completed(Transition),
    /// The final attempt's lease ran out; the record was marked failed.
    Expired,
    /// Another processor owns the record, or it is no longer pending.
    Skipped,
    /// The store rejected a read or write; the record is left for the scheduler.
    StoreFailed,
}

/// Shared, read-only context for running attempts.
///
/// Both the eager first attempt and scheduler retries go through
/// [`attempt`](Self::attempt); the compare-and-update claim keeps them from
/// processing the same record twice.
pub struct DeliveryWorker {
    pub(crate) subscriptions: Arc<dyn SubscriptionStore>,
    pub(crate) deliveries: Arc<dyn DeliveryStore>,
    pub(crate) sender: Arc<dyn Sender>,
    pub(crate) backoff: BackoffPolicy,
    pub(crate) headers: HeaderNames,
    pub(crate) send_timeout: Duration,
    pub(crate) claim_lease: Duration,

    /// Global limit on simultaneous outbound requests.
    pub(crate) in_flight: Arc<Semaphore>,
}

impl DeliveryWorker {
    /// Run one attempt for `record` as last read from the store.
    pub async fn attempt(&self, record: DeliveryRecord) -> AttemptReport {
        if record.attempts >= record.max_attempts {
            return self.expire(record).await;
        }

        // Wait for capacity before claiming so queueing never eats the lease.
        let Ok(_permit) = self.in_flight.acquire().await else {
            return AttemptReport::Skipped;
        };

        let claimed = match record.begin_attempt(Utc::now(), self.claim_lease) {
            Ok(claimed) => claimed,
            Err(_) => return AttemptReport::Skipped,
        };

        match self
            .deliveries
            .compare_and_update(record.attempts, &claimed)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                metric_inc("webhook.delivery.claim_lost");
                tracing::debug!(
                    target: TARGET,
                    delivery_id = %record.id,
                    subscription_id = %record.subscription_id,
                    "Delivery already claimed elsewhere"
                );
                return AttemptReport::Skipped;
            }
            Err(e) => {
                self.log_store_error(&record, "claim", &e);
                return AttemptReport::StoreFailed;
            }
        }

        let outcome = match self.resolve_subscription(&claimed).await {
            Ok((subscription, url)) => self.send(&claimed, &subscription, url).await,
            Err(outcome) => outcome,
        };

        self.finish(claimed, outcome).await
    }

    /// Load the subscription fresh; anything unusable consumes this attempt
    /// without a network call.
    async fn resolve_subscription(
        &self,
        record: &DeliveryRecord,
    ) -> Result<(Subscription, Url), SendOutcome> {
        let subscription = match self.subscriptions.get(&record.subscription_id).await {
            Ok(Some(sub)) => sub,
            Ok(None) => return Err(local_failure("subscription not found")),
            Err(e) => {
                self.log_store_error(record, "load subscription", &e);
                return Err(local_failure(format!("subscription store error: {e}")));
            }
        };

        if !subscription.active {
            return Err(local_failure("subscription is inactive"));
        }

        match subscription.validate() {
            Ok(url) => Ok((subscription, url)),
            Err(e) => {
                flag_misconfigured(self.subscriptions.as_ref(), &subscription, &e).await;
                Err(local_failure(format!("subscription misconfigured: {e}")))
            }
        }
    }

    async fn send(
        &self,
        record: &DeliveryRecord,
        subscription: &Subscription,
        url: Url,
    ) -> SendOutcome {
        // Serialize once; these exact bytes are signed and sent.
        let body = match serde_json::to_vec(&record.payload) {
            Ok(body) => body,
            Err(e) => return local_failure(format!("failed to serialize payload: {e}")),
        };

        let signature = match sign(&subscription.secret, &body) {
            Ok(sig) => sig,
            Err(e) => return local_failure(format!("subscription misconfigured: {e}")),
        };

        let headers = build_delivery_headers(
            &self.headers,
            &record.event_type,
            &record.id,
            &signature,
            Utc::now(),
        );

        self.sender
            .send(DeliveryRequest {
                url,
                headers,
                body,
                timeout: self.send_timeout,
            })
            .await
    }

    /// Apply the outcome and persist it against the claim.
    async fn finish(&self, claimed: DeliveryRecord, outcome: SendOutcome) -> AttemptReport {
        let mut next = claimed.clone();
        let transition = next.record_outcome(&outcome, Utc::now(), &self.backoff);

        match self
            .deliveries
            .compare_and_update(claimed.attempts, &next)
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                metric_inc("webhook.delivery.claim_lost");
                tracing::warn!(
                    target: TARGET,
                    delivery_id = %next.id,
                    subscription_id = %next.subscription_id,
                    attempt = next.attempts,
                    "Attempt result discarded; claim was taken over after lease expiry"
                );
                return AttemptReport::Skipped;
            }
            Err(e) => {
                self.log_store_error(&next, "record outcome", &e);
                return AttemptReport::StoreFailed;
            }
        }

        log_transition(&next, &transition);
        AttemptReport::Completed(transition)
    }

    async fn expire(&self, record: DeliveryRecord) -> AttemptReport {
        let expected = record.attempts;
        let mut expired = record;
        if !expired.expire() {
            return AttemptReport::Skipped;
        }

        match self.deliveries.compare_and_update(expected, &expired).await {
            Ok(true) => {
                metric_inc("webhook.delivery.failed");
                tracing::error!(
                    target: TARGET,
                    delivery_id = %expired.id,
                    subscription_id = %expired.subscription_id,
                    business_id = %expired.business_id,
                    event_type = %expired.event_type,
                    attempts = expired.attempts,
                    "Final delivery attempt never reported back; marking failed"
                );
                AttemptReport::Expired
            }
            Ok(false) => AttemptReport::Skipped,
            Err(e) => {
                self.log_store_error(&expired, "expire", &e);
                AttemptReport::StoreFailed
            }
        }
    }

    fn log_store_error(&self, record: &DeliveryRecord, operation: &'static str, error: &StoreError) {
        metric_inc("webhook.store.error");
        tracing::error!(
            target: TARGET,
            delivery_id = %record.id,
            subscription_id = %record.subscription_id,
            business_id = %record.business_id,
            event_type = %record.event_type,
            attempt = record.attempts,
            operation,
            error = %error,
            "Delivery record store error"
        );
    }
}

/// Record a subscription's configuration error with its owner.
pub(crate) async fn flag_misconfigured(
    subscriptions: &dyn SubscriptionStore,
    subscription: &Subscription,
    error: &SubscriptionError,
) {
    metric_inc("webhook.subscription.misconfigured");
    tracing::warn!(
        target: TARGET,
        subscription_id = %subscription.id,
        business_id = %subscription.business_id,
        error = %error,
        "Subscription misconfigured; skipping delivery"
    );

    if let Err(e) = subscriptions
        .flag_misconfigured(&subscription.id, &error.to_string())
        .await
    {
        tracing::error!(
            target: TARGET,
            subscription_id = %subscription.id,
            error = %e,
            "Failed to flag misconfigured subscription"
        );
    }
}

fn local_failure(error: impl Into<String>) -> SendOutcome {
    SendOutcome::Failure {
        response_code: None,
        error: error.into(),
    }
}

fn log_transition(record: &DeliveryRecord, transition: &Transition) {
    match transition {
        Transition::Delivered => {
            metric_inc("webhook.delivery.success");
            tracing::info!(
                target: TARGET,
                delivery_id = %record.id,
                subscription_id = %record.subscription_id,
                business_id = %record.business_id,
                event_type = %record.event_type,
                attempt = record.attempts,
                response_code = record.response_code,
                "Webhook delivered"
            );
        }
        Transition::RetryScheduled { next_retry_at } => {
            metric_inc("webhook.delivery.retry_scheduled");
            tracing::warn!(
                target: TARGET,
                delivery_id = %record.id,
                subscription_id = %record.subscription_id,
                business_id = %record.business_id,
                event_type = %record.event_type,
                attempt = record.attempts,
                max_attempts = record.max_attempts,
                response_code = record.response_code,
                error = record.last_error.as_deref().unwrap_or_default(),
                next_retry_at = %next_retry_at,
                "Webhook delivery failed; retry scheduled"
            );
        }
        Transition::Exhausted => {
            metric_inc("webhook.delivery.failed");
            tracing::error!(
                target: TARGET,
                delivery_id = %record.id,
                subscription_id = %record.subscription_id,
                business_id = %record.business_id,
                event_type = %record.event_type,
                attempts = record.attempts,
                response_code = record.response_code,
                error = record.last_error.as_deref().unwrap_or_default(),
                "Webhook delivery failed permanently"
            );
        }
        Transition::Ignored => {}
    }
}
