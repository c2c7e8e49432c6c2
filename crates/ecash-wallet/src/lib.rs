//! # ecash-wallet
//!
//! Coin lifecycle engine: choosing coins, driving withdraw, refresh, recoup
//! and deposit to completion across crashes and network failures, and
//! reporting balances and pending work.
//!
//! Every lifecycle operation follows the same pattern: a record created in
//! one read-write transaction together with the coin changes it implies,
//! then a `process_*` step that is safe to repeat. [`Wallet::run_pending_once`]
//! drives all due steps.
//!
//! # Modules
//!
//! - [`balance`]: Available and incoming value per currency.
//! - [`coin_selection`]: Fee-aware payment coin selection.
//! - [`config`]: `WalletConfig`.
//! - [`denom_selection`]: Greedy denomination choice for new coins.
//! - [`deposit`]: Deposit groups.
//! - [`error`]: `WalletError` and its retry classification.
//! - [`locks`]: Named resource locks.
//! - [`notifications`]: Broadcast events.
//! - [`pending`]: Pending-task view.
//! - [`recoup`]: Recoup groups and denomination revocation.
//! - [`refresh`]: Refresh groups and refresh cost estimation.
//! - [`reserve`]: Reserve status queries.
//! - [`scheduler`]: Task dispatch and scheduler passes.
//! - [`single_flight`]: Joining concurrent calls for one key.
//! - [`spend`]: Debiting a coin selection.
//! - [`task`]: Task ids, outcomes and the retry coordinator.
//! - [`wallet`]: The `Wallet` handle.
//! - [`withdraw`]: Withdrawal groups.

pub mod balance;
pub mod coin_selection;
pub mod config;
pub mod denom_selection;
pub mod deposit;
pub mod error;
pub mod locks;
pub mod notifications;
pub mod pending;
pub mod recoup;
pub mod refresh;
pub mod reserve;
pub mod scheduler;
pub mod single_flight;
pub mod spend;
pub mod task;
pub mod wallet;
pub mod withdraw;

pub use balance::CurrencyBalance;
pub use coin_selection::{
    AvailableCoinInfo, CandidateCoins, PayCoinSelectionRequest, PreviousCoin, get_candidate_pay_coins,
    select_pay_coins,
};
pub use config::WalletConfig;
pub use denom_selection::select_withdrawal_denominations;
pub use deposit::CreateDepositGroupRequest;
pub use error::{ErrorClass, WalletError};
pub use locks::{EXCHANGE_COINS_LOCK, EXCHANGE_RESERVES_LOCK, ResourceLocks};
pub use notifications::{Notifier, WalletNotification};
pub use pending::{PendingOperationsResponse, PendingTaskInfo};
pub use recoup::create_recoup_group;
pub use refresh::{create_refresh_group, get_total_refresh_cost};
pub use scheduler::{PassSummary, TaskRun};
pub use single_flight::SingleFlight;
pub use spend::apply_coin_spend;
pub use task::{LifecycleTask, TaskId, TaskOutcome};
pub use wallet::Wallet;
