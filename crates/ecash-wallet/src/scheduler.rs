//! Dispatching tasks by id, and a single pass over everything that is due.

use ecash_core::Timestamp;
use futures::future::join_all;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::WalletError;
use crate::task::{TaskId, TaskOutcome};
use crate::wallet::Wallet;

/// Outcome of one task processed by [`Wallet::run_pending_once`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaskRun {
    pub task: TaskId,
    pub outcome: Result<TaskOutcome, WalletError>,
}

/// Summary counts of a scheduler pass.
#[derive(Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub finished: usize,
    pub retrying: usize,
    pub frozen: usize,
    pub failed: usize,
}

impl PassSummary {
    pub fn of(runs: &[TaskRun]) -> Self {
        let mut s = Self::default();
        for run in runs {
            match run.outcome {
                Ok(TaskOutcome::Finished) => s.finished += 1,
                Ok(TaskOutcome::Retrying { .. }) => s.retrying += 1,
                Ok(TaskOutcome::Frozen) => s.frozen += 1,
                Ok(TaskOutcome::Missing) => {}
                Err(_) => s.failed += 1,
            }
        }
        s
    }
}

impl Wallet {
    /// Run one step of `task`.
    pub async fn process_task(&self, task: TaskId, force_now: bool) -> Result<TaskOutcome, WalletError> {
        match task {
            TaskId::Reserve(id) => self.process_reserve(id, force_now).await,
            TaskId::Withdraw(id) => self.process_withdrawal_group(id, force_now).await,
            TaskId::Refresh(id) => self.process_refresh_group(id, force_now).await,
            TaskId::Recoup(id) => self.process_recoup_group(id, force_now).await,
            TaskId::Deposit(id) => self.process_deposit_group(id, force_now).await,
        }
    }

    /// Process every task due at `now` once, concurrently. Frozen tasks are
    /// skipped.
    pub async fn run_pending_once(&self, now: Timestamp) -> Result<Vec<TaskRun>, WalletError> {
        let pending = self.get_pending_operations(now)?;
        let due: Vec<TaskId> = pending
            .pending_operations
            .iter()
            .filter(|p| p.is_due(now))
            .map(|p| p.task)
            .collect();
        debug!(due = due.len(), total = pending.pending_operations.len(), "scheduler pass");

        let runs = join_all(due.into_iter().map(|task| async move {
            let outcome = self.process_task(task, false).await;
            if let Err(e) = &outcome {
                warn!(%task, error = %e, "task step failed");
            }
            TaskRun { task, outcome }
        }))
        .await;
        Ok(runs)
    }
}
