//! # ecash-core
//!
//! Shared vocabulary of the e-cash wallet: amounts, identifiers, persisted
//! records, retry schedule, error details and the exchange interface.
//!
//! # Modules
//!
//! - [`amount`]: Saturating fixed-point currency arithmetic.
//! - [`constants`]: Protocol and runtime constants.
//! - [`error`]: Amount and exchange errors, persisted error details.
//! - [`exchange`]: The `ExchangeClient` trait and its message types.
//! - [`records`]: Database records for coins, denominations and tasks.
//! - [`retry`]: Exponential backoff with jitter and cap.
//! - [`types`]: Keys, hashes, task identifiers and timestamps.

pub mod amount;
pub mod constants;
pub mod error;
pub mod exchange;
pub mod records;
pub mod retry;
pub mod types;

pub use amount::{Amount, AmountOp};
pub use error::{AmountError, ErrorCode, ErrorDetails, ExchangeError};
pub use exchange::ExchangeClient;
pub use retry::{RetryInfo, RetryPolicy};
pub use types::{
    DenominationPubKey, DepositGroupId, EddsaKeyPair, EddsaPrivateKey, EddsaPublicKey, Hash256,
    RecoupGroupId, RefreshGroupId, Timestamp, WithdrawalGroupId,
};
