use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::{JoinHandle, JoinSet};

use crate::backoff::BackoffPolicy;
use crate::error::{ConfigError, DispatchError, Error};
use crate::scheduler::{scheduler_loop, SweepSettings};
use crate::sender::{HttpSender, Sender};
use crate::signing::HeaderNames;
use crate::storage::{DeliveryStore, SubscriptionStore};
use crate::telemetry::{metric_inc, TARGET};
use crate::types::{BusinessId, DeliveryRecord, EventType};
use crate::worker::{flag_misconfigured, AttemptReport, DeliveryWorker};

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Triggers buffered before `trigger` reports backpressure.
    pub queue_capacity: usize,
    /// Simultaneous outbound requests across all subscriptions.
    pub max_in_flight: usize,
    pub max_attempts: u32,
    pub send_timeout: Duration,
    /// How long a claimed attempt is hidden from the scheduler.
    pub claim_lease: Duration,
    pub poll_interval: Duration,
    pub sweep_batch_size: usize,
    /// Age after which a never-attempted record is picked up by the scheduler.
    pub orphan_grace: Duration,
    pub backoff: BackoffPolicy,
    /// `<Product>` in the `X-<Product>-*` headers.
    pub product_name: String,
    pub user_agent: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1_024,
            max_in_flight: 64,
            max_attempts: 5,
            send_timeout: Duration::from_secs(10),
            claim_lease: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            sweep_batch_size: 100,
            orphan_grace: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            product_name: "Webhook".to_string(),
            user_agent: concat!("webhook-delivery/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DispatcherConfig {
    /// Defaults overridden by `WEBHOOK_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, "WEBHOOK_QUEUE_CAPACITY")? {
            config.queue_capacity = v;
        }
        if let Some(v) = parse(&lookup, "WEBHOOK_MAX_IN_FLIGHT")? {
            config.max_in_flight = v;
        }
        if let Some(v) = parse(&lookup, "WEBHOOK_MAX_ATTEMPTS")? {
            config.max_attempts = v;
        }
        if let Some(v) = parse_millis(&lookup, "WEBHOOK_SEND_TIMEOUT_MS")? {
            config.send_timeout = v;
        }
        if let Some(v) = parse_millis(&lookup, "WEBHOOK_CLAIM_LEASE_MS")? {
            config.claim_lease = v;
        }
        if let Some(v) = parse_millis(&lookup, "WEBHOOK_POLL_INTERVAL_MS")? {
            config.poll_interval = v;
        }
        if let Some(v) = parse(&lookup, "WEBHOOK_SWEEP_BATCH_SIZE")? {
            config.sweep_batch_size = v;
        }
        if let Some(v) = parse_millis(&lookup, "WEBHOOK_ORPHAN_GRACE_MS")? {
            config.orphan_grace = v;
        }
        if let Some(v) = parse_millis(&lookup, "WEBHOOK_BACKOFF_INITIAL_MS")? {
            config.backoff.initial_delay = v;
        }
        if let Some(v) = parse_millis(&lookup, "WEBHOOK_BACKOFF_MAX_MS")? {
            config.backoff.max_delay = v;
        }
        if let Some(v) = parse_millis(&lookup, "WEBHOOK_BACKOFF_JITTER_MS")? {
            config.backoff.jitter = v;
        }
        if let Some(v) = lookup("WEBHOOK_PRODUCT_NAME") {
            config.product_name = v;
        }
        if let Some(v) = lookup("WEBHOOK_USER_AGENT") {
            config.user_agent = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be at least 1".into()));
        }
        if self.queue_capacity == 0 || self.max_in_flight == 0 || self.sweep_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "queue_capacity, max_in_flight and sweep_batch_size must be non-zero".into(),
            ));
        }
        if self.send_timeout.is_zero() {
            return Err(ConfigError::Invalid("send_timeout must be non-zero".into()));
        }
        if self.claim_lease <= self.send_timeout {
            return Err(ConfigError::Invalid(
                "claim_lease must be longer than send_timeout".into(),
            ));
        }
        if self.poll_interval.is_zero() || self.poll_interval > Duration::from_secs(1) {
            return Err(ConfigError::Invalid(
                "poll_interval must be between 1ms and 1s".into(),
            ));
        }
        if self.backoff.initial_delay > self.backoff.max_delay {
            return Err(ConfigError::Invalid(
                "backoff initial delay exceeds max delay".into(),
            ));
        }
        let valid_product = !self.product_name.is_empty()
            && self
                .product_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid_product {
            return Err(ConfigError::InvalidValue {
                key: "product_name",
                value: self.product_name.clone(),
            });
        }
        Ok(())
    }
}

fn parse<F, T>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value }),
    }
}

fn parse_millis<F>(lookup: &F, key: &'static str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<F, u64>(lookup, key)?.map(Duration::from_millis))
}

/// One event occurrence waiting for fan-out.
#[derive(Debug)]
struct Trigger {
    business_id: BusinessId,
    event_type: EventType,
    payload: serde_json::Value,
}

/// Outbound webhook dispatcher.
///
/// `trigger` only enqueues. A background intake task fans each event out to
/// matching subscriptions and runs the first attempt for each concurrently;
/// a separate scheduler task drives every retry from the Delivery Record
/// Store. Must be created inside a Tokio runtime.
pub struct Dispatcher {
    trigger_tx: Option<mpsc::Sender<Trigger>>,
    is_running: Arc<AtomicBool>,
    intake_handle: Option<JoinHandle<()>>,
    scheduler_handle: Option<JoinHandle<()>>,
    scheduler_notify: Arc<Notify>,
}

impl Dispatcher {
    pub fn new(
        config: DispatcherConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
        sender: Arc<dyn Sender>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let worker = Arc::new(DeliveryWorker {
            subscriptions: subscriptions.clone(),
            deliveries: deliveries.clone(),
            sender,
            backoff: config.backoff,
            headers: HeaderNames::for_product(&config.product_name),
            send_timeout: config.send_timeout,
            claim_lease: config.claim_lease,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight)),
        });

        let is_running = Arc::new(AtomicBool::new(true));
        let scheduler_notify = Arc::new(Notify::new());

        let (trigger_tx, trigger_rx) = mpsc::channel(config.queue_capacity);
        let intake_handle = tokio::spawn(intake_loop(
            trigger_rx,
            IntakeContext {
                worker: worker.clone(),
                subscriptions,
                deliveries: deliveries.clone(),
                max_attempts: config.max_attempts,
            },
        ));

        let scheduler_handle = tokio::spawn(scheduler_loop(
            worker,
            deliveries,
            SweepSettings {
                poll_interval: config.poll_interval,
                batch_size: config.sweep_batch_size,
                orphan_grace: config.orphan_grace,
            },
            is_running.clone(),
            scheduler_notify.clone(),
        ));

        Ok(Self {
            trigger_tx: Some(trigger_tx),
            is_running,
            intake_handle: Some(intake_handle),
            scheduler_handle: Some(scheduler_handle),
            scheduler_notify,
        })
    }

    /// Dispatcher that delivers over HTTP with [`HttpSender`].
    pub fn with_http(
        config: DispatcherConfig,
        subscriptions: Arc<dyn SubscriptionStore>,
        deliveries: Arc<dyn DeliveryStore>,
    ) -> Result<Self, Error> {
        let sender = Arc::new(HttpSender::new(&config.user_agent)?);
        Ok(Self::new(config, subscriptions, deliveries, sender)?)
    }

    /// Queue `event_type` for every active subscription of `business_id`.
    ///
    /// Returns as soon as the event is queued. Delivery results are only
    /// visible through the Delivery Record Store.
    pub fn trigger(
        &self,
        business_id: impl Into<String>,
        event_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Result<(), DispatchError> {
        if !self.is_running() {
            return Err(DispatchError::Shutdown);
        }
        let Some(tx) = self.trigger_tx.as_ref() else {
            return Err(DispatchError::Shutdown);
        };

        let trigger = Trigger {
            business_id: BusinessId(business_id.into()),
            event_type: EventType(event_type.into()),
            payload,
        };

        match tx.try_send(trigger) {
            Ok(()) => {
                metric_inc("webhook.trigger.enqueued");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(trigger)) => {
                metric_inc("webhook.trigger.backpressure");
                tracing::warn!(
                    target: TARGET,
                    business_id = %trigger.business_id,
                    event_type = %trigger.event_type,
                    "Trigger queue full"
                );
                Err(DispatchError::Backpressure)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(DispatchError::Shutdown),
        }
    }

    /// Stop accepting triggers, finish queued fan-outs and in-flight attempts,
    /// then stop the scheduler. Pending retries stay in the store.
    pub async fn shutdown(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.trigger_tx.take();

        if let Some(handle) = self.intake_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(target: TARGET, error = %e, "Intake task failed");
            }
        }

        self.scheduler_notify.notify_one();
        if let Some(handle) = self.scheduler_handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(target: TARGET, error = %e, "Scheduler task failed");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        self.scheduler_notify.notify_one();
    }
}

struct IntakeContext {
    worker: Arc<DeliveryWorker>,
    subscriptions: Arc<dyn SubscriptionStore>,
    deliveries: Arc<dyn DeliveryStore>,
    max_attempts: u32,
}

/// Consume triggers until the queue closes, then wait for eager attempts.
async fn intake_loop(mut rx: mpsc::Receiver<Trigger>, ctx: IntakeContext) {
    let mut attempts: JoinSet<AttemptReport> = JoinSet::new();

    loop {
        tokio::select! {
            trigger = rx.recv() => {
                let Some(trigger) = trigger else { break };
                fan_out(trigger, &ctx, &mut attempts).await;
            }
            Some(joined) = attempts.join_next(), if !attempts.is_empty() => {
                log_join(joined);
            }
        }
    }

    while let Some(joined) = attempts.join_next().await {
        log_join(joined);
    }
}

/// Create a record per matching subscription and start its first attempt.
async fn fan_out(trigger: Trigger, ctx: &IntakeContext, attempts: &mut JoinSet<AttemptReport>) {
    let subscriptions = match ctx
        .subscriptions
        .find_active_for_event(&trigger.business_id, &trigger.event_type)
        .await
    {
        Ok(subs) => subs,
        Err(e) => {
            metric_inc("webhook.store.error");
            tracing::error!(
                target: TARGET,
                business_id = %trigger.business_id,
                event_type = %trigger.event_type,
                error = %e,
                "Failed to load subscriptions for event"
            );
            return;
        }
    };

    if subscriptions.is_empty() {
        tracing::debug!(
            target: TARGET,
            business_id = %trigger.business_id,
            event_type = %trigger.event_type,
            "No active subscriptions for event"
        );
        return;
    }

    tracing::info!(
        target: TARGET,
        business_id = %trigger.business_id,
        event_type = %trigger.event_type,
        subscription_count = subscriptions.len(),
        "Dispatching event"
    );

    for subscription in subscriptions {
        if let Err(e) = subscription.validate() {
            flag_misconfigured(ctx.subscriptions.as_ref(), &subscription, &e).await;
            continue;
        }

        let record = DeliveryRecord::new(
            &subscription,
            trigger.event_type.clone(),
            trigger.payload.clone(),
            ctx.max_attempts,
            Utc::now(),
        );

        if let Err(e) = ctx.deliveries.insert(&record).await {
            metric_inc("webhook.store.error");
            tracing::error!(
                target: TARGET,
                business_id = %trigger.business_id,
                subscription_id = %subscription.id,
                event_type = %trigger.event_type,
                payload = %trigger.payload,
                error = %e,
                "Failed to persist delivery record; event not delivered to this subscription"
            );
            continue;
        }

        let worker = ctx.worker.clone();
        attempts.spawn(async move { worker.attempt(record).await });
    }
}

fn log_join(joined: Result<AttemptReport, tokio::task::JoinError>) {
    if let Err(e) = joined {
        tracing::error!(target: TARGET, error = %e, "Delivery attempt task panicked");
    }
}
