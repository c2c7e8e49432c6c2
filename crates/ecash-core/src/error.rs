//! Error types shared by every wallet crate.
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },
    #[error("invalid amount string: {0}")]
    InvalidFormat(String),
    #[error("amount value exceeds maximum")]
    ValueTooLarge,
    #[error("division by zero")]
    DivisionByZero,
}

/// Failure reported by an [`ExchangeClient`](crate::exchange::ExchangeClient).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
    #[error("exchange returned status {status}: {message}")]
    UnexpectedStatus { status: u16, message: String },
    #[error("exchange does not know the coin (404)")]
    CoinNotFound,
    #[error("malformed exchange response: {0}")]
    Malformed(String),
}

impl ExchangeError {
    /// Whether resending the same request may succeed. Any unexpected HTTP
    /// status counts, since the exchange state behind it can change.
    pub fn is_transient(&self) -> bool {
        match self {
            ExchangeError::Timeout | ExchangeError::Network(_) | ExchangeError::UnexpectedStatus { .. } => true,
            ExchangeError::CoinNotFound | ExchangeError::Malformed(_) => false,
        }
    }
}

/// Stable identifier for a persisted error.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, bincode::Encode, bincode::Decode)]
pub enum ErrorCode {
    NetworkTimeout,
    NetworkError,
    UnexpectedStatus,
    ExchangeProtocolViolation,
    SignatureInvalid,
    WithdrawalGroupIncomplete,
    CoinNotFoundAtExchange,
    CryptoFailure,
    StoreFailure,
    Unknown,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorCode::NetworkTimeout => "network-timeout",
            ErrorCode::NetworkError => "network-error",
            ErrorCode::UnexpectedStatus => "unexpected-status",
            ErrorCode::ExchangeProtocolViolation => "exchange-protocol-violation",
            ErrorCode::SignatureInvalid => "signature-invalid",
            ErrorCode::WithdrawalGroupIncomplete => "withdrawal-group-incomplete",
            ErrorCode::CoinNotFoundAtExchange => "coin-not-found-at-exchange",
            ErrorCode::CryptoFailure => "crypto-failure",
            ErrorCode::StoreFailure => "store-failure",
            ErrorCode::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// Structured error value stored in a task's `last_error`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub message: String,
    pub details: BTreeMap<String, String>,
}

impl ErrorDetails {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: BTreeMap::new(),
        }
    }

    /// Attach one key/value detail.
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }
}

impl fmt::Display for ErrorDetails {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl From<&ExchangeError> for ErrorDetails {
    fn from(err: &ExchangeError) -> Self {
        let code = match err {
            ExchangeError::Timeout => ErrorCode::NetworkTimeout,
            ExchangeError::Network(_) => ErrorCode::NetworkError,
            ExchangeError::UnexpectedStatus { .. } => ErrorCode::UnexpectedStatus,
            ExchangeError::CoinNotFound => ErrorCode::CoinNotFoundAtExchange,
            ExchangeError::Malformed(_) => ErrorCode::ExchangeProtocolViolation,
        };
        let details = ErrorDetails::new(code, err.to_string());
        match err {
            ExchangeError::UnexpectedStatus { status, .. } => {
                details.with_detail("http_status", status.to_string())
            }
            _ => details,
        }
    }
}
