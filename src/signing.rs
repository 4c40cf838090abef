use chrono::{DateTime, SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::SigningError;
use crate::types::{DeliveryId, EventType};

type HmacSha256 = Hmac<Sha256>;

/// Names of the headers attached to every delivery.
///
/// All four are derived from a product name: `X-<Product>-Event`,
/// `X-<Product>-Signature`, `X-<Product>-Delivery-Timestamp` and
/// `X-<Product>-Delivery-Id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderNames {
    pub event: String,
    pub signature: String,
    pub timestamp: String,
    pub delivery_id: String,
}

impl HeaderNames {
    pub fn for_product(product: &str) -> Self {
        Self {
            event: format!("X-{product}-Event"),
            signature: format!("X-{product}-Signature"),
            timestamp: format!("X-{product}-Delivery-Timestamp"),
            delivery_id: format!("X-{product}-Delivery-Id"),
        }
    }
}

impl Default for HeaderNames {
    fn default() -> Self {
        Self::for_product("Webhook")
    }
}

/// Hex-encoded HMAC-SHA256 of `payload` under `secret`.
///
/// `payload` must be the exact bytes sent as the request body.
pub fn sign(secret: &[u8], payload: &[u8]) -> Result<String, SigningError> {
    if secret.is_empty() {
        return Err(SigningError::EmptySecret);
    }

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SigningError::EmptySecret)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a received hex signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    if secret.is_empty() {
        return false;
    }

    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);

    mac.verify_slice(&signature).is_ok()
}

/// Headers for one delivery attempt, in send order.
pub fn build_delivery_headers(
    names: &HeaderNames,
    event_type: &EventType,
    delivery_id: &DeliveryId,
    signature: &str,
    timestamp: DateTime<Utc>,
) -> Vec<(String, String)> {
    vec![
        ("Content-Type".to_string(), "application/json".to_string()),
        (names.event.clone(), event_type.0.clone()),
        (names.signature.clone(), signature.to_string()),
        (names.timestamp.clone(), format_timestamp(timestamp)),
        (names.delivery_id.clone(), delivery_id.to_string()),
    ]
}

/// RFC 3339 UTC with a `Z` suffix, e.g. `2024-03-01T12:00:00Z`.
pub fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Receiver-side check that a delivery timestamp is recent.
///
/// The timestamp header is not covered by the signature; treat this as a
/// sanity check, not replay protection.
pub fn is_timestamp_fresh(timestamp: DateTime<Utc>, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
    timestamp <= now && now - timestamp <= max_age
}

#[derive(Debug, Clone, Default)]
pub struct ParsedSignature {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
    pub event: Option<String>,
    pub delivery_id: Option<String>,
}

/// Pick the delivery headers out of a header list, case-insensitively.
pub fn parse_signature_headers<'a, I>(headers: I, names: &HeaderNames) -> ParsedSignature
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut parsed = ParsedSignature::default();

    for (name, value) in headers {
        let slot = if name.eq_ignore_ascii_case(&names.signature) {
            &mut parsed.signature
        } else if name.eq_ignore_ascii_case(&names.timestamp) {
            &mut parsed.timestamp
        } else if name.eq_ignore_ascii_case(&names.event) {
            &mut parsed.event
        } else if name.eq_ignore_ascii_case(&names.delivery_id) {
            &mut parsed.delivery_id
        } else {
            continue;
        };
        *slot = Some(value.to_string());
    }

    parsed
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationError {
    MissingSignature,
    InvalidSignature,
}

/// Verify an incoming webhook request against the raw body in one call.
pub fn verify_webhook_request<'a, I>(
    headers: I,
    body: &[u8],
    secret: &[u8],
    names: &HeaderNames,
) -> Result<ParsedSignature, VerificationError>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let parsed = parse_signature_headers(headers, names);
    let signature = parsed
        .signature
        .as_deref()
        .ok_or(VerificationError::MissingSignature)?;

    if verify_signature(secret, body, signature) {
        Ok(parsed)
    } else {
        Err(VerificationError::InvalidSignature)
    }
}
