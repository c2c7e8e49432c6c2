//! Wallet error type and its retry classification.

use ecash_core::{AmountError, ErrorCode, ErrorDetails, ExchangeError};
use ecash_crypto::CryptoError;
use ecash_store::StoreError;
use thiserror::Error;

/// How the retry coordinator treats a failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Record, back off, retry later.
    Transient,
    /// Record and freeze the task until forced.
    Protocol,
    /// A defect in local state. Never recorded, always propagated.
    Logic,
}

/// Errors that can occur in wallet operations.
///
/// `Clone` so that a single in-flight result can be handed to every caller
/// that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WalletError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Amount(#[from] AmountError),

    /// Failure talking to an exchange.
    #[error("exchange request failed: {0}")]
    Exchange(#[from] ExchangeError),

    /// The exchange answered with something that can never become valid.
    #[error("protocol violation: {0}")]
    Protocol(ErrorDetails),

    /// A step did not complete but may on a later attempt.
    #[error("incomplete: {0}")]
    Transient(ErrorDetails),

    /// Local state is inconsistent.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// Coin selection found no covering set.
    #[error("insufficient funds")]
    InsufficientFunds,

    /// Caller input the wallet cannot act on.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl WalletError {
    pub fn class(&self) -> ErrorClass {
        match self {
            WalletError::Exchange(e) if e.is_transient() => ErrorClass::Transient,
            WalletError::Exchange(_) | WalletError::Protocol(_) => ErrorClass::Protocol,
            WalletError::Transient(_) => ErrorClass::Transient,
            WalletError::Crypto(
                CryptoError::WorkerFault(_)
                | CryptoError::WorkerStart(_)
                | CryptoError::Terminated
                | CryptoError::PoolStopped,
            ) => ErrorClass::Transient,
            WalletError::Crypto(_)
            | WalletError::Store(_)
            | WalletError::Amount(_)
            | WalletError::Invariant(_)
            | WalletError::InsufficientFunds
            | WalletError::InvalidRequest(_) => ErrorClass::Logic,
        }
    }

    /// Structured form stored in a task's `last_error`.
    pub fn to_details(&self) -> ErrorDetails {
        match self {
            WalletError::Exchange(e) => ErrorDetails::from(e),
            WalletError::Protocol(d) | WalletError::Transient(d) => d.clone(),
            WalletError::Crypto(e) => ErrorDetails::new(ErrorCode::CryptoFailure, e.to_string()),
            WalletError::Store(e) => ErrorDetails::new(ErrorCode::StoreFailure, e.to_string()),
            other => ErrorDetails::new(ErrorCode::Unknown, other.to_string()),
        }
    }

    pub(crate) fn invariant(message: impl Into<String>) -> Self {
        WalletError::Invariant(message.into())
    }

    pub(crate) fn signature_invalid(message: impl Into<String>) -> Self {
        WalletError::Protocol(ErrorDetails::new(ErrorCode::SignatureInvalid, message))
    }

    pub(crate) fn protocol_violation(message: impl Into<String>) -> Self {
        WalletError::Protocol(ErrorDetails::new(ErrorCode::ExchangeProtocolViolation, message))
    }
}
