//! Crypto pool error type.
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// The pool was stopped while the request was queued or running.
    #[error("crypto worker pool terminated")]
    Terminated,
    /// Submitted after [`stop`](crate::CryptoWorkerPool::stop).
    #[error("crypto worker pool is stopped")]
    PoolStopped,
    /// The worker holding the request crashed.
    #[error("crypto worker fault: {0}")]
    WorkerFault(String),
    #[error("could not start crypto worker: {0}")]
    WorkerStart(String),
    #[error("{operation} failed: {message}")]
    OperationFailed { operation: &'static str, message: String },
    #[error("unexpected response variant {0}")]
    UnexpectedResponse(&'static str),
    #[error("invalid key material")]
    InvalidKey,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display() {
        let e = CryptoError::OperationFailed { operation: "rsa_unblind", message: "bad key".into() };
        assert_eq!(e.to_string(), "rsa_unblind failed: bad key");
        assert_eq!(CryptoError::Terminated.to_string(), "crypto worker pool terminated");
    }
}
