//! Delivery record state machine.
//!
//! ```text
//! pending --claim--> pending (attempts+1, leased)
//! pending --success--> success
//! pending --failure, attempts < max--> pending (next_retry_at = now + backoff)
//! pending --failure, attempts = max--> failed
//! ```
//!
//! `success` and `failed` are terminal: every method here leaves a
//! terminal record untouched.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::backoff::BackoffPolicy;
use crate::error::TransitionError;
use crate::sender::SendOutcome;
use crate::types::{DeliveryId, DeliveryRecord, DeliveryStatus, EventType, Subscription};

/// `last_error` written when a claim expires after the final attempt.
pub const LEASE_EXPIRED: &str = "attempt lease expired";

/// Result of applying an attempt outcome to a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Delivered,
    RetryScheduled { next_retry_at: DateTime<Utc> },
    Exhausted,
    /// The record was already terminal.
    Ignored,
}

impl DeliveryRecord {
    /// New `pending` record that has never been attempted.
    pub fn new(
        subscription: &Subscription,
        event_type: EventType,
        payload: serde_json::Value,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            subscription_id: subscription.id.clone(),
            business_id: subscription.business_id.clone(),
            event_type,
            payload,
            status: DeliveryStatus::Pending,
            attempts: 0,
            max_attempts: max_attempts.max(1),
            next_retry_at: None,
            last_error: None,
            response_code: None,
            created_at: now,
            delivered_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether the scheduler should pick this record up at `now`.
    ///
    /// Never-attempted records have no `next_retry_at`; they become due once
    /// they are older than `orphan_grace`, which covers an eager attempt that
    /// never ran.
    pub fn is_due(&self, now: DateTime<Utc>, orphan_grace: Duration) -> bool {
        if self.status != DeliveryStatus::Pending {
            return false;
        }
        match self.next_retry_at {
            Some(at) => at <= now,
            None => self.created_at + to_chrono(orphan_grace) <= now,
        }
    }

    /// The claimed copy of this record: one more attempt, leased until
    /// `now + lease` so a concurrent sweep does not see it as due.
    ///
    /// Persist it with a compare-and-update against `self.attempts`.
    pub fn begin_attempt(
        &self,
        now: DateTime<Utc>,
        lease: Duration,
    ) -> Result<DeliveryRecord, TransitionError> {
        if self.is_terminal() {
            return Err(TransitionError::Terminal(self.status));
        }
        if self.attempts >= self.max_attempts {
            return Err(TransitionError::AttemptsExhausted {
                attempts: self.attempts,
                max: self.max_attempts,
            });
        }

        let mut claimed = self.clone();
        claimed.attempts += 1;
        claimed.next_retry_at = Some(now + to_chrono(lease));
        Ok(claimed)
    }

    /// Apply the outcome of the attempt counted in `self.attempts`.
    pub fn record_outcome(
        &mut self,
        outcome: &SendOutcome,
        now: DateTime<Utc>,
        backoff: &BackoffPolicy,
    ) -> Transition {
        if self.is_terminal() {
            return Transition::Ignored;
        }

        match outcome {
            SendOutcome::Success { response_code } => {
                self.status = DeliveryStatus::Success;
                self.response_code = Some(*response_code);
                self.delivered_at = Some(now);
                self.next_retry_at = None;
                Transition::Delivered
            }
            SendOutcome::Failure { response_code, error } => {
                self.response_code = *response_code;
                self.last_error = Some(error.clone());

                if self.attempts >= self.max_attempts {
                    self.status = DeliveryStatus::Failed;
                    self.attempts = self.max_attempts;
                    self.next_retry_at = None;
                    Transition::Exhausted
                } else {
                    let next_retry_at = now + to_chrono(backoff.delay_with_jitter(self.attempts));
                    self.next_retry_at = Some(next_retry_at);
                    Transition::RetryScheduled { next_retry_at }
                }
            }
        }
    }

    /// Finalize a record whose last permitted attempt never reported back.
    ///
    /// Returns `false` (and changes nothing) unless the record is pending
    /// with every attempt used.
    pub fn expire(&mut self) -> bool {
        if self.is_terminal() || self.attempts < self.max_attempts {
            return false;
        }
        self.status = DeliveryStatus::Failed;
        self.attempts = self.max_attempts;
        self.next_retry_at = None;
        self.last_error = Some(LEASE_EXPIRED.to_string());
        true
    }
}

pub(crate) fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365))
}
