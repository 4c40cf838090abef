use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::Error;

/// Maximum bytes of a failed response body kept in `last_error`.
pub const MAX_RESPONSE_BODY: usize = 2048;

/// One fully prepared POST.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: Url,
    pub headers: Vec<(String, String)>,

    /// Exactly the bytes that were signed.
    pub body: Vec<u8>,

    pub timeout: Duration,
}

/// Classified result of a single attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// 2xx response.
    Success { response_code: u16 },

    /// Non-2xx response (`response_code` set) or transport failure (`None`).
    Failure {
        response_code: Option<u16>,
        error: String,
    },
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success { .. })
    }
}

/// Performs exactly one outbound call per invocation.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, request: DeliveryRequest) -> SendOutcome;
}

/// reqwest-backed sender.
#[derive(Debug, Clone)]
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    /// Build a sender with redirects disabled.
    ///
    /// The per-request timeout comes from [`DeliveryRequest::timeout`].
    pub fn new(user_agent: &str) -> Result<Self, Error> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// Use a caller-built client, e.g. one with a proxy or extra root
    /// certificates. Redirect and user-agent settings are the caller's.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Sender for HttpSender {
    async fn send(&self, request: DeliveryRequest) -> SendOutcome {
        let timeout = request.timeout;
        let mut builder = self
            .client
            .post(request.url)
            .timeout(timeout)
            .body(request.body);

        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let mut response = match builder.send().await {
            Ok(resp) => resp,
            Err(err) => {
                return SendOutcome::Failure {
                    response_code: None,
                    error: describe_transport_error(&err, timeout),
                }
            }
        };

        let status = response.status();
        if status.is_success() {
            return SendOutcome::Success {
                response_code: status.as_u16(),
            };
        }

        let body = read_bounded(&mut response, MAX_RESPONSE_BODY).await;
        let error = if body.is_empty() {
            format!("HTTP {}", status.as_u16())
        } else {
            format!("HTTP {}: {}", status.as_u16(), body)
        };

        SendOutcome::Failure {
            response_code: Some(status.as_u16()),
            error,
        }
    }
}

fn describe_transport_error(err: &reqwest::Error, timeout: Duration) -> String {
    if err.is_timeout() {
        format!("request timed out after {}ms", timeout.as_millis())
    } else if err.is_connect() {
        format!("connection failed: {err}")
    } else {
        format!("request error: {err}")
    }
}

/// Read at most `limit` bytes of the body; a broken stream keeps what arrived.
async fn read_bounded(response: &mut reqwest::Response, limit: usize) -> String {
    let mut buf = Vec::new();
    while buf.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - buf.len());
                buf.extend_from_slice(&chunk[..take]);
            }
            Ok(None) | Err(_) => break,
        }
    }
    truncate_utf8(&buf, limit)
}

/// Lossy UTF-8 of at most `limit` bytes, never splitting a character.
pub(crate) fn truncate_utf8(bytes: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(&bytes[..bytes.len().min(limit)]);
    let mut end = text.len().min(limit);
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
