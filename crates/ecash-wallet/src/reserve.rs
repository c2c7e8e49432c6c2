//! Reserves: funds waiting at an exchange to be withdrawn.

use ecash_core::records::{ExchangeRecord, ReserveRecord, ReserveStatus, WithdrawalGroupRecord};
use ecash_core::{EddsaPublicKey, RetryInfo, Timestamp, WithdrawalGroupId};
use ecash_store::{IndexName, StoreName};
use tracing::{debug, info};

use crate::error::WalletError;
use crate::locks::EXCHANGE_RESERVES_LOCK;
use crate::notifications::WalletNotification;
use crate::task::{TaskId, TaskOutcome, clear_retry};
use crate::wallet::Wallet;
use crate::withdraw::insert_withdrawal_group;

impl Wallet {
    /// Create a reserve at a known exchange and schedule its first status
    /// query. The caller wires funds to the returned public key.
    pub async fn create_reserve(&self, exchange_base_url: &str) -> Result<EddsaPublicKey, WalletError> {
        let exchange = self.db.run_read_only(&[StoreName::Exchanges], |tx| {
            tx.get::<ExchangeRecord>(&exchange_base_url.to_string())
        })?;
        let Some(exchange) = exchange else {
            return Err(WalletError::invariant(format!("unknown exchange {exchange_base_url}")));
        };

        let keys = self.crypto.create_eddsa_keypair().await?;
        let now = Timestamp::now();
        let reserve = ReserveRecord {
            reserve_pub: keys.pub_key,
            reserve_priv: keys.priv_key.clone(),
            exchange_base_url: exchange.base_url,
            currency: exchange.currency,
            status: ReserveStatus::QueryingStatus,
            timestamp_created: now,
            last_balance: None,
            initial_withdrawal_group_id: None,
            retry_info: Some(RetryInfo::initial(now)),
            last_error: None,
            frozen: false,
        };
        self.db.run_read_write(&[StoreName::Reserves], |tx| tx.add(&reserve))?;
        info!(reserve = %reserve.reserve_pub, exchange = %reserve.exchange_base_url, "created reserve");
        self.notifier.notify(WalletNotification::ReserveUpdated { reserve_pub: reserve.reserve_pub });
        Ok(reserve.reserve_pub)
    }

    pub async fn process_reserve(
        &self,
        reserve_pub: EddsaPublicKey,
        force_now: bool,
    ) -> Result<TaskOutcome, WalletError> {
        self.run_task::<ReserveRecord, _, _>(reserve_pub, TaskId::Reserve(reserve_pub), force_now, || {
            self.reserve_step(reserve_pub)
        })
        .await
    }

    async fn reserve_step(&self, reserve_pub: EddsaPublicKey) -> Result<TaskOutcome, WalletError> {
        self.locks
            .run_sequentialized(&[EXCHANGE_RESERVES_LOCK], self.query_reserve(reserve_pub))
            .await
    }

    async fn query_reserve(&self, reserve_pub: EddsaPublicKey) -> Result<TaskOutcome, WalletError> {
        let reserve = self
            .db
            .run_read_only(&[StoreName::Reserves], |tx| tx.get::<ReserveRecord>(&reserve_pub))?
            .ok_or_else(|| WalletError::invariant(format!("reserve {reserve_pub} not found")))?;

        let status = self
            .exchange_call(self.exchange.reserve_status(&reserve.exchange_base_url, &reserve_pub))
            .await?;
        let balance = status.balance;
        if balance.currency != reserve.currency {
            return Err(WalletError::protocol_violation(format!(
                "reserve balance in {}, expected {}",
                balance.currency, reserve.currency
            )));
        }

        if balance.is_zero() {
            debug!(reserve = %reserve_pub, "reserve not funded yet");
            self.db.run_read_write(&[StoreName::Reserves], |tx| {
                if let Some(mut r) = tx.get::<ReserveRecord>(&reserve_pub)? {
                    r.last_balance = Some(balance.clone());
                    tx.put(&r)?;
                }
                Ok::<_, WalletError>(())
            })?;
            let next = self.bump_retry::<ReserveRecord>(&reserve_pub, None, false)?;
            return Ok(match next {
                Some(next_retry) => TaskOutcome::Retrying { next_retry },
                None => TaskOutcome::Finished,
            });
        }

        let now = Timestamp::now();
        let scope = [StoreName::Reserves, StoreName::Denominations, StoreName::WithdrawalGroups];
        let created: Option<WithdrawalGroupId> = self.db.run_read_write(&scope, |tx| {
            let Some(mut r) = tx.get::<ReserveRecord>(&reserve_pub)? else {
                return Err(WalletError::invariant(format!("reserve {reserve_pub} vanished")));
            };
            if r.status == ReserveStatus::Dormant {
                return Ok(None);
            }
            r.last_balance = Some(balance.clone());
            let busy = !tx
                .index::<WithdrawalGroupRecord>(IndexName::WithdrawalGroupsByReservePub, reserve_pub.as_ref())?
                .filter_records(|g| g.timestamp_finish.is_none())?
                .is_empty();
            let created = if busy { None } else { insert_withdrawal_group(tx, &r, &balance, now)? };
            if r.initial_withdrawal_group_id.is_none() {
                r.initial_withdrawal_group_id = created;
            }
            r.status = ReserveStatus::Dormant;
            clear_retry(&mut r);
            tx.put(&r)?;
            Ok(created)
        })?;

        info!(reserve = %reserve_pub, %balance, withdrawal_group = ?created, "reserve balance updated");
        self.notifier.notify(WalletNotification::ReserveUpdated { reserve_pub });
        Ok(TaskOutcome::Finished)
    }
}
