use thiserror::Error;

use crate::types::DeliveryStatus;

/// Errors returned by [`Dispatcher::trigger`](crate::Dispatcher::trigger).
///
/// These describe the intake queue only. Delivery outcomes are never
/// reported back to the event producer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    /// Intake queue is full.
    /// Caller must retry or apply backoff.
    #[error("dispatcher at capacity")]
    Backpressure,

    /// Dispatcher has been shut down.
    #[error("dispatcher is shut down")]
    Shutdown,
}

/// A subscription that cannot be delivered to until its owner fixes it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("signing secret is empty")]
    EmptySecret,

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("unsupported url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("url has no host")]
    MissingHost,
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SigningError {
    #[error("cannot sign with an empty secret")]
    EmptySecret,
}

/// Failures of the Subscription Store or Delivery Record Store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[cfg(feature = "postgres")]
    #[error("postgres error: {0}")]
    Postgres(#[from] tokio_postgres::Error),
}

/// Rejected state machine transitions.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("delivery is already {0}")]
    Terminal(DeliveryStatus),

    #[error("all {max} attempts used ({attempts} made)")]
    AttemptsExhausted { attempts: u32, max: u32 },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Errors raised while constructing a dispatcher.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to build http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
