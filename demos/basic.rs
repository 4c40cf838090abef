use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing_subscriber::EnvFilter;
use webhook_delivery::{
    BusinessId, DeliveryStore, Dispatcher, DispatcherConfig, InMemoryDeliveryStore,
    InMemorySubscriptionStore, Subscription,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("webhook_delivery=debug")),
        )
        .init();

    let subscriptions = Arc::new(InMemorySubscriptionStore::new());
    subscriptions
        .upsert(
            Subscription::new("sub_orders", "biz_1", "https://example.com/webhook", "supersecret")
                .with_event("booking.cancelled"),
        )
        .await;
    let deliveries = Arc::new(InMemoryDeliveryStore::new());

    let config = DispatcherConfig::from_env()?;
    let mut dispatcher = Dispatcher::with_http(config, subscriptions, deliveries.clone())?;

    dispatcher.trigger(
        "biz_1",
        "booking.cancelled",
        json!({"bookingId": "b_123", "reason": "customer request"}),
    )?;

    tokio::time::sleep(Duration::from_secs(3)).await;
    dispatcher.shutdown().await;

    for record in deliveries
        .list_for_business(&BusinessId("biz_1".into()), None)
        .await?
    {
        println!(
            "{} {} status={} attempts={} code={:?} error={:?}",
            record.id,
            record.subscription_id,
            record.status,
            record.attempts,
            record.response_code,
            record.last_error
        );
    }

    Ok(())
}
