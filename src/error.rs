use crate::models::OrderState;
use thiserror::Error;

/// Errors surfaced by adapters, the risk layer and the order engine.
///
/// Adapters normalize every exchange failure into either `Transient` or
/// `Permanent`. Everything above the adapter boundary only ever matches on
/// these kinds, never on exchange-specific codes.
#[derive(Debug, Error)]
pub enum Error {
    /// Network timeout, rate limit, 5xx. Retry with backoff.
    #[error("transient exchange error: {0}")]
    Transient(String),

    /// Invalid symbol, insufficient funds, auth failure. Never retried.
    #[error("permanent exchange error: {0}")]
    Permanent(String),

    /// Trade intent rejected by the risk layer. Routine, not exceptional.
    #[error("risk violation: {0}")]
    RiskViolation(String),

    /// Exchange reported a fill for an order we had already closed locally.
    #[error(
        "reconciliation conflict on order {order_id}: recorded {recorded}, exchange reports {reported}"
    )]
    ReconciliationConflict {
        order_id: String,
        recorded: OrderState,
        reported: OrderState,
    },

    #[error("invalid order transition for {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: String,
        from: OrderState,
        to: OrderState,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("backtest error: {0}")]
    Backtest(String),
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Error::Permanent(_))
    }

    /// Collapse a retryable failure into a terminal one once retries run out.
    pub fn escalate(self, attempts: u32) -> Self {
        match self {
            Error::Transient(msg) => {
                Error::Permanent(format!("gave up after {} attempts: {}", attempts, msg))
            }
            other => other,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() || e.is_request() {
            return Error::Transient(e.to_string());
        }
        match e.status() {
            Some(status) if status.as_u16() == 429 || status.is_server_error() => {
                Error::Transient(e.to_string())
            }
            _ => Error::Permanent(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Permanent(format!("malformed payload: {}", e))
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::Config(e.to_string())
    }
}
