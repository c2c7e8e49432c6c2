//! Retry coordination shared by every lifecycle operation.
//!
//! A lifecycle record carries its own retry state. [`Wallet::run_task`]
//! wraps one processing step: it joins concurrent calls for the same task,
//! skips terminal and frozen tasks, and turns step failures into retry
//! bookkeeping according to their [`ErrorClass`].

use std::fmt;
use std::future::Future;

use ecash_core::records::{
    DepositGroupRecord, RecoupGroupRecord, RefreshCoinStatus, RefreshGroupRecord, ReserveRecord, ReserveStatus,
    WithdrawalGroupRecord,
};
use ecash_core::{
    DepositGroupId, EddsaPublicKey, ErrorDetails, RecoupGroupId, RefreshGroupId, RetryInfo, Timestamp,
    WithdrawalGroupId,
};
use ecash_store::StoreRecord;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorClass, WalletError};
use crate::notifications::WalletNotification;
use crate::wallet::Wallet;

/// Identifies one retryable task.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(tag = "type", content = "id", rename_all = "kebab-case")]
pub enum TaskId {
    Reserve(EddsaPublicKey),
    Withdraw(WithdrawalGroupId),
    Refresh(RefreshGroupId),
    Recoup(RecoupGroupId),
    Deposit(DepositGroupId),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Reserve(id) => write!(f, "reserve:{id}"),
            TaskId::Withdraw(id) => write!(f, "withdraw:{id}"),
            TaskId::Refresh(id) => write!(f, "refresh:{id}"),
            TaskId::Recoup(id) => write!(f, "recoup:{id}"),
            TaskId::Deposit(id) => write!(f, "deposit:{id}"),
        }
    }
}

/// Result of one processing attempt.
#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum TaskOutcome {
    /// The task is terminal.
    Finished,
    /// Not done yet. Due again at `next_retry`.
    Retrying { next_retry: Timestamp },
    /// Will not be retried until forced.
    Frozen,
    /// No record with this id.
    Missing,
}

/// Retry bookkeeping every lifecycle record exposes.
pub trait LifecycleTask: StoreRecord {
    fn task_id(&self) -> TaskId;
    fn retry_info(&self) -> Option<&RetryInfo>;
    fn retry_info_mut(&mut self) -> &mut Option<RetryInfo>;
    fn last_error(&self) -> Option<&ErrorDetails>;
    fn last_error_mut(&mut self) -> &mut Option<ErrorDetails>;
    fn frozen(&self) -> bool;
    fn set_frozen(&mut self, frozen: bool);
    fn is_terminal(&self) -> bool;

    /// Clear the freeze so the task runs again. Records that freeze parts of
    /// themselves reopen those parts as well.
    fn thaw(&mut self);
}

macro_rules! lifecycle_task {
    ($record:ty, $variant:ident, $id:ident, |$r:ident| $terminal:expr) => {
        lifecycle_task!($record, $variant, $id, |$r| $terminal, thaw |_unused| {});
    };
    ($record:ty, $variant:ident, $id:ident, |$r:ident| $terminal:expr, thaw |$t:ident| $thaw:block) => {
        impl LifecycleTask for $record {
            fn task_id(&self) -> TaskId {
                TaskId::$variant(self.$id)
            }
            fn retry_info(&self) -> Option<&RetryInfo> {
                self.retry_info.as_ref()
            }
            fn retry_info_mut(&mut self) -> &mut Option<RetryInfo> {
                &mut self.retry_info
            }
            fn last_error(&self) -> Option<&ErrorDetails> {
                self.last_error.as_ref()
            }
            fn last_error_mut(&mut self) -> &mut Option<ErrorDetails> {
                &mut self.last_error
            }
            fn frozen(&self) -> bool {
                self.frozen
            }
            fn set_frozen(&mut self, frozen: bool) {
                self.frozen = frozen;
            }
            fn is_terminal(&self) -> bool {
                let $r = self;
                $terminal
            }
            fn thaw(&mut self) {
                self.frozen = false;
                let $t = self;
                $thaw
            }
        }
    };
}

lifecycle_task!(ReserveRecord, Reserve, reserve_pub, |r| r.status == ReserveStatus::Dormant);
lifecycle_task!(WithdrawalGroupRecord, Withdraw, withdrawal_group_id, |r| r.timestamp_finish.is_some());
lifecycle_task!(RefreshGroupRecord, Refresh, refresh_group_id, |r| r.timestamp_finished.is_some(), thaw |r| {
    // Coins the exchange refused get another melt.
    for status in r.status_per_coin.iter_mut().filter(|s| **s == RefreshCoinStatus::Frozen) {
        *status = RefreshCoinStatus::Pending;
    }
    if r.status_per_coin.contains(&RefreshCoinStatus::Pending) {
        r.timestamp_finished = None;
    }
});
lifecycle_task!(RecoupGroupRecord, Recoup, recoup_group_id, |r| r.timestamp_finished.is_some());
lifecycle_task!(DepositGroupRecord, Deposit, deposit_group_id, |r| r.timestamp_finished.is_some());

/// Mark `record` terminal-clean: no retry state, no error.
pub(crate) fn clear_retry<R: LifecycleTask>(record: &mut R) {
    *record.retry_info_mut() = None;
    *record.last_error_mut() = None;
}

impl Wallet {
    /// Drive one step of the task stored under `key`.
    ///
    /// `force_now` resets the retry counter and unfreezes the task first,
    /// even when the call then joins a step already in flight.
    /// Transient failures schedule a retry, protocol failures freeze the
    /// task; both are recorded in `last_error` and reported as
    /// notifications. Logic failures are returned to the caller.
    pub(crate) async fn run_task<R, F, Fut>(
        &self,
        key: R::Key,
        task: TaskId,
        force_now: bool,
        step: F,
    ) -> Result<TaskOutcome, WalletError>
    where
        R: LifecycleTask,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<TaskOutcome, WalletError>>,
    {
        if force_now {
            debug!(%task, "retry forced");
            self.reset_retry::<R>(&key)?;
        }
        self.inflight
            .run(task, || async move {
                let record = self.db.run_read_only(&[R::STORE], |tx| tx.get::<R>(&key))?;
                let Some(record) = record else {
                    warn!(%task, "task record not found");
                    return Ok(TaskOutcome::Missing);
                };
                if record.is_terminal() {
                    return Ok(if record.frozen() { TaskOutcome::Frozen } else { TaskOutcome::Finished });
                }
                if record.frozen() {
                    debug!(%task, "task is frozen, not processing");
                    return Ok(TaskOutcome::Frozen);
                }

                match step().await {
                    Ok(outcome) => {
                        debug!(%task, ?outcome, "task step completed");
                        Ok(outcome)
                    }
                    Err(err) => self.handle_step_error::<R>(&key, task, err),
                }
            })
            .await
    }

    fn handle_step_error<R: LifecycleTask>(
        &self,
        key: &R::Key,
        task: TaskId,
        err: WalletError,
    ) -> Result<TaskOutcome, WalletError> {
        let class = err.class();
        if class == ErrorClass::Logic {
            error!(%task, error = %err, "task failed on a local invariant");
            return Err(err);
        }
        let details = err.to_details();
        let freeze = class == ErrorClass::Protocol;
        let next = self.bump_retry::<R>(key, Some(details.clone()), freeze)?;
        self.notifier.notify(WalletNotification::TaskError { task, error: details, frozen: freeze });
        if freeze {
            warn!(%task, error = %err, "task frozen after protocol failure");
            return Ok(TaskOutcome::Frozen);
        }
        match next {
            Some(next_retry) => {
                info!(%task, error = %err, %next_retry, "task failed, will retry");
                Ok(TaskOutcome::Retrying { next_retry })
            }
            None => Ok(TaskOutcome::Missing),
        }
    }

    /// Count one more attempt on `key` and schedule the next one.
    ///
    /// Returns the new due time, or `None` if the record vanished or became
    /// terminal in the meantime.
    pub(crate) fn bump_retry<R: LifecycleTask>(
        &self,
        key: &R::Key,
        error: Option<ErrorDetails>,
        freeze: bool,
    ) -> Result<Option<Timestamp>, WalletError> {
        let now = Timestamp::now();
        let policy = &self.config.retry;
        self.db.run_read_write(&[R::STORE], |tx| {
            let Some(mut record) = tx.get::<R>(key)? else {
                return Ok(None);
            };
            if record.is_terminal() {
                return Ok(None);
            }
            let info = record.retry_info_mut().get_or_insert_with(|| RetryInfo::initial(now));
            info.increment(policy, now);
            let next = info.next_retry;
            *record.last_error_mut() = error;
            if freeze {
                record.set_frozen(true);
            }
            tx.put(&record)?;
            Ok(Some(next))
        })
    }

    fn reset_retry<R: LifecycleTask>(&self, key: &R::Key) -> Result<(), WalletError> {
        let now = Timestamp::now();
        self.db.run_read_write(&[R::STORE], |tx| {
            if let Some(mut record) = tx.get::<R>(key)? {
                if record.frozen() || !record.is_terminal() {
                    record.thaw();
                    if !record.is_terminal() {
                        *record.retry_info_mut() = Some(RetryInfo::initial(now));
                    }
                    tx.put(&record)?;
                }
            }
            Ok(())
        })
    }
}

/// Most severe error of a batch of per-unit results: logic before protocol
/// before transient.
pub(crate) fn first_error<I>(results: I) -> Option<WalletError>
where
    I: IntoIterator<Item = Result<(), WalletError>>,
{
    let rank = |e: &WalletError| match e.class() {
        ErrorClass::Logic => 0,
        ErrorClass::Protocol => 1,
        ErrorClass::Transient => 2,
    };
    results.into_iter().filter_map(Result::err).min_by_key(rank)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecash_core::{ErrorCode, ExchangeError};

    #[test]
    fn task_id_display() {
        let id = TaskId::Deposit(DepositGroupId([0xab; 32]));
        assert!(id.to_string().starts_with("deposit:abab"));
    }

    #[test]
    fn first_error_prefers_severity() {
        let transient = WalletError::Exchange(ExchangeError::Timeout);
        let protocol = WalletError::Protocol(ErrorDetails::new(ErrorCode::SignatureInvalid, "bad"));
        let results = vec![Ok(()), Err(transient.clone()), Err(protocol.clone())];
        assert_eq!(first_error(results), Some(protocol));
        assert_eq!(first_error(vec![Err(transient.clone())]), Some(transient));
        assert_eq!(first_error(vec![Ok(())]), None);
    }

    #[test]
    fn terminal_predicates() {
        use ecash_core::records::RecoupGroupRecord;
        let mut r = RecoupGroupRecord {
            recoup_group_id: RecoupGroupId([1; 32]),
            coin_pubs: vec![],
            recoup_finished_per_coin: vec![],
            old_amount_per_coin: vec![],
            schedule_refresh_coins: vec![],
            timestamp_started: Timestamp(1),
            timestamp_finished: None,
            retry_info: Some(RetryInfo::initial(Timestamp(1))),
            last_error: None,
            frozen: false,
        };
        assert!(!r.is_terminal());
        r.timestamp_finished = Some(Timestamp(2));
        clear_retry(&mut r);
        assert!(r.is_terminal());
        assert!(r.retry_info().is_none());
        assert_eq!(r.task_id(), TaskId::Recoup(RecoupGroupId([1; 32])));
    }

    #[test]
    fn thawing_refresh_group_reopens_frozen_coins() {
        use ecash_core::records::RefreshReason;
        let amount: ecash_core::Amount = "EUR:1".parse().unwrap();
        let mut g = RefreshGroupRecord {
            refresh_group_id: RefreshGroupId([2; 32]),
            reason: RefreshReason::Manual,
            old_coin_pubs: vec![EddsaPublicKey([3; 32]), EddsaPublicKey([4; 32])],
            input_per_coin: vec![amount.clone(), amount.clone()],
            estimated_output_per_coin: vec![amount.clone(), amount],
            status_per_coin: vec![RefreshCoinStatus::Finished, RefreshCoinStatus::Frozen],
            refresh_sessions: vec![None, None],
            last_error_per_coin: vec![None, None],
            timestamp_created: Timestamp(1),
            timestamp_finished: Some(Timestamp(2)),
            retry_info: None,
            last_error: None,
            frozen: true,
        };
        assert!(g.is_terminal());

        g.thaw();
        assert!(!g.frozen());
        assert!(!g.is_terminal());
        assert_eq!(g.status_per_coin, vec![RefreshCoinStatus::Finished, RefreshCoinStatus::Pending]);
    }
}
