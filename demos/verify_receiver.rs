use chrono::Utc;
use webhook_delivery::{
    format_timestamp, is_timestamp_fresh, sign, verify_webhook_request, HeaderNames,
};

fn main() {
    let names = HeaderNames::default();
    let secret = b"supersecret";
    let body = br#"{"bookingId":"b_123"}"#;

    // What a receiver sees on the wire
    let signature = sign(secret, body).unwrap_or_default();
    let timestamp = format_timestamp(Utc::now());
    let headers = vec![
        ("x-webhook-event", "booking.cancelled"),
        ("x-webhook-signature", signature.as_str()),
        ("x-webhook-delivery-timestamp", timestamp.as_str()),
        ("x-webhook-delivery-id", "0b8e6f2c-5d43-4a52-9a37-5c1f0c2e7a10"),
    ];

    match verify_webhook_request(headers.iter().copied(), body, secret, &names) {
        Ok(parsed) => {
            let fresh = parsed
                .timestamp
                .as_deref()
                .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                .map(|ts| is_timestamp_fresh(ts.with_timezone(&Utc), Utc::now(), chrono::Duration::minutes(5)))
                .unwrap_or(false);
            println!(
                "verified event={:?} delivery_id={:?} fresh={fresh}",
                parsed.event, parsed.delivery_id
            );
        }
        Err(e) => println!("rejected: {e:?}"),
    }
}
