//! Events emitted by lifecycle operations.

use ecash_core::{
    DepositGroupId, EddsaPublicKey, ErrorDetails, RecoupGroupId, RefreshGroupId, WithdrawalGroupId,
};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::task::TaskId;

#[derive(Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum WalletNotification {
    /// A step failed. `frozen` tells whether it will be retried automatically.
    TaskError { task: TaskId, error: ErrorDetails, frozen: bool },
    ReserveUpdated { reserve_pub: EddsaPublicKey },
    CoinWithdrawn { withdrawal_group_id: WithdrawalGroupId, coin_pub: EddsaPublicKey },
    WithdrawGroupFinished { withdrawal_group_id: WithdrawalGroupId },
    RefreshMelted { refresh_group_id: RefreshGroupId, coin_index: usize },
    RefreshRevealed { refresh_group_id: RefreshGroupId, coin_index: usize },
    RefreshUnwarranted { refresh_group_id: RefreshGroupId, coin_index: usize },
    RefreshGroupFinished { refresh_group_id: RefreshGroupId },
    RecoupStarted { recoup_group_id: RecoupGroupId },
    RecoupFinished { recoup_group_id: RecoupGroupId },
    DepositFinished { deposit_group_id: DepositGroupId },
}

/// Broadcast side of the notification channel. Sending never blocks; slow
/// subscribers lose the oldest events.
#[derive(Clone)]
pub struct Notifier {
    tx: broadcast::Sender<WalletNotification>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WalletNotification> {
        self.tx.subscribe()
    }

    pub fn notify(&self, notification: WalletNotification) {
        trace!(?notification, "wallet notification");
        // No subscribers is fine.
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let n = Notifier::new(4);
        let mut rx = n.subscribe();
        let id = RecoupGroupId([3; 32]);
        n.notify(WalletNotification::RecoupStarted { recoup_group_id: id });
        assert_eq!(rx.recv().await.unwrap(), WalletNotification::RecoupStarted { recoup_group_id: id });
    }

    #[test]
    fn notify_without_subscribers() {
        Notifier::new(1).notify(WalletNotification::ReserveUpdated { reserve_pub: EddsaPublicKey([0; 32]) });
    }

    #[test]
    fn serializes_with_type_tag() {
        let v = serde_json::to_value(WalletNotification::RefreshMelted {
            refresh_group_id: RefreshGroupId([0; 32]),
            coin_index: 2,
        })
        .unwrap();
        assert_eq!(v["type"], "refresh-melted");
        assert_eq!(v["coin_index"], 2);
    }
}
