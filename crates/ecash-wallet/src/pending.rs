//! Read-only view of every task that still has work to do.

use ecash_core::records::{
    DepositGroupRecord, RecoupGroupRecord, RefreshGroupRecord, ReserveRecord, WithdrawalGroupRecord,
};
use ecash_core::{ErrorDetails, RetryInfo, Timestamp};
use ecash_store::{ReadOnly, StoreName, Tx};
use serde::Serialize;

use crate::balance::{CurrencyBalance, balances_in};
use crate::error::WalletError;
use crate::task::{LifecycleTask, TaskId};
use crate::wallet::Wallet;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingTaskInfo {
    pub task: TaskId,
    /// When the task should run next. `None` for frozen tasks.
    pub timestamp_due: Option<Timestamp>,
    pub retry_info: Option<RetryInfo>,
    pub last_error: Option<ErrorDetails>,
    pub frozen: bool,
    /// Whether the task still makes progress on its own while the wallet
    /// runs. False for frozen tasks, which wait for the user.
    pub gives_liveness: bool,
}

impl PendingTaskInfo {
    /// Due at `now` and eligible for automatic processing.
    pub fn is_due(&self, now: Timestamp) -> bool {
        self.timestamp_due.is_some_and(|due| due <= now)
    }
}

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
pub struct PendingOperationsResponse {
    pub pending_operations: Vec<PendingTaskInfo>,
    pub wallet_balance: Vec<CurrencyBalance>,
}

fn collect<R: LifecycleTask>(
    tx: &Tx<'_, ReadOnly>,
    now: Timestamp,
    out: &mut Vec<PendingTaskInfo>,
) -> Result<(), WalletError> {
    for record in tx.iter::<R>()? {
        let record = record?;
        let frozen = record.frozen();
        if record.is_terminal() && !frozen {
            continue;
        }
        let timestamp_due = if frozen {
            None
        } else {
            Some(record.retry_info().map_or(now, |r| r.next_retry))
        };
        out.push(PendingTaskInfo {
            task: record.task_id(),
            timestamp_due,
            retry_info: record.retry_info().cloned(),
            last_error: record.last_error().cloned(),
            frozen,
            gives_liveness: !frozen,
        });
    }
    Ok(())
}

impl Wallet {
    /// Every non-terminal or frozen task and the current balance, read from
    /// one consistent snapshot.
    pub fn get_pending_operations(&self, now: Timestamp) -> Result<PendingOperationsResponse, WalletError> {
        let scope = [
            StoreName::Reserves,
            StoreName::WithdrawalGroups,
            StoreName::RefreshGroups,
            StoreName::RecoupGroups,
            StoreName::DepositGroups,
            StoreName::Coins,
        ];
        self.db.run_read_only(&scope, |tx| {
            let mut pending_operations = Vec::new();
            collect::<ReserveRecord>(tx, now, &mut pending_operations)?;
            collect::<WithdrawalGroupRecord>(tx, now, &mut pending_operations)?;
            collect::<RefreshGroupRecord>(tx, now, &mut pending_operations)?;
            collect::<RecoupGroupRecord>(tx, now, &mut pending_operations)?;
            collect::<DepositGroupRecord>(tx, now, &mut pending_operations)?;
            let wallet_balance = balances_in(tx)?;
            Ok(PendingOperationsResponse { pending_operations, wallet_balance })
        })
    }
}
