//! Recoup: recovering the value of coins whose denomination was revoked.
//!
//! A withdrawn coin is paid back into its reserve, which is then queried
//! again. A refreshed coin is paid back to the coin it was melted from;
//! those old coins are refreshed once the whole group is done.

use ecash_core::records::{CoinRecord, CoinSource, CoinStatus, DenominationRecord, RecoupGroupRecord, RefreshReason, ReserveRecord, ReserveStatus};
use ecash_core::{Amount, EddsaPublicKey, ErrorCode, ErrorDetails, Hash256, RecoupGroupId, RefreshGroupId, RetryInfo, Timestamp};
use ecash_crypto::ops::CreateRecoupRequest;
use ecash_store::{IndexName, ReadWrite, StoreName, Tx};
use futures::future::join_all;
use tracing::{debug, info};

use crate::error::WalletError;
use crate::notifications::WalletNotification;
use crate::refresh::create_refresh_group;
use crate::task::{TaskId, TaskOutcome, clear_retry, first_error};
use crate::wallet::Wallet;

/// Start recouping `coin_pubs`. Each coin's value is saved in the group
/// and the coin itself is zeroed. Needs `coins` and `recoup_groups` in
/// scope.
pub fn create_recoup_group(
    tx: &mut Tx<'_, ReadWrite>,
    coin_pubs: &[EddsaPublicKey],
    now: Timestamp,
) -> Result<RecoupGroupId, WalletError> {
    let mut finished = Vec::with_capacity(coin_pubs.len());
    let mut old_amounts = Vec::with_capacity(coin_pubs.len());
    for pub_key in coin_pubs {
        match tx.get::<CoinRecord>(pub_key)? {
            Some(mut coin) if !coin.current_amount.is_zero() => {
                old_amounts.push(Some(coin.current_amount.clone()));
                finished.push(false);
                coin.current_amount = Amount::zero(coin.current_amount.currency.clone());
                coin.status = CoinStatus::Dormant;
                tx.put(&coin)?;
            }
            Some(coin) => {
                old_amounts.push(Some(coin.current_amount));
                finished.push(true);
            }
            None => {
                old_amounts.push(None);
                finished.push(true);
            }
        }
    }

    let done = finished.iter().all(|f| *f);
    let group = RecoupGroupRecord {
        recoup_group_id: RecoupGroupId::random(),
        coin_pubs: coin_pubs.to_vec(),
        recoup_finished_per_coin: finished,
        old_amount_per_coin: old_amounts,
        schedule_refresh_coins: Vec::new(),
        timestamp_started: now,
        timestamp_finished: done.then_some(now),
        retry_info: (!done).then(|| RetryInfo::initial(now)),
        last_error: None,
        frozen: false,
    };
    tx.add(&group)?;
    debug!(group = %group.recoup_group_id, coins = coin_pubs.len(), "created recoup group");
    Ok(group.recoup_group_id)
}

impl Wallet {
    /// Mark a denomination revoked and recoup every coin of it that still
    /// has value. Returns `None` if there was nothing to recoup.
    pub fn revoke_denomination(
        &self,
        exchange_base_url: &str,
        denom_pub_hash: Hash256,
    ) -> Result<Option<RecoupGroupId>, WalletError> {
        let now = Timestamp::now();
        let scope = [StoreName::Denominations, StoreName::Coins, StoreName::RecoupGroups];
        let created = self.db.run_read_write(&scope, |tx| {
            let key = (exchange_base_url.to_string(), denom_pub_hash);
            let Some(mut denom) = tx.get::<DenominationRecord>(&key)? else {
                return Err(WalletError::invariant(format!("denomination {denom_pub_hash} not found")));
            };
            denom.is_revoked = true;
            tx.put(&denom)?;

            let affected = tx
                .index::<CoinRecord>(IndexName::CoinsByDenomPubHash, denom_pub_hash.as_ref())?
                .filter_records(|c| c.exchange_base_url == exchange_base_url && !c.current_amount.is_zero())?;
            if affected.is_empty() {
                return Ok(None);
            }
            let pubs: Vec<EddsaPublicKey> = affected.iter().map(|c| c.coin_pub).collect();
            create_recoup_group(tx, &pubs, now).map(Some)
        })?;

        info!(denom = %denom_pub_hash, recoup_group = ?created, "denomination revoked");
        if let Some(recoup_group_id) = created {
            self.notifier.notify(WalletNotification::RecoupStarted { recoup_group_id });
        }
        Ok(created)
    }

    pub async fn process_recoup_group(&self, id: RecoupGroupId, force_now: bool) -> Result<TaskOutcome, WalletError> {
        self.run_task::<RecoupGroupRecord, _, _>(id, TaskId::Recoup(id), force_now, || self.recoup_step(id)).await
    }

    async fn recoup_step(&self, id: RecoupGroupId) -> Result<TaskOutcome, WalletError> {
        let group = self
            .db
            .run_read_only(&[StoreName::RecoupGroups], |tx| tx.get::<RecoupGroupRecord>(&id))?
            .ok_or_else(|| WalletError::invariant(format!("recoup group {id} not found")))?;
        let open: Vec<(usize, EddsaPublicKey)> = group
            .coin_pubs
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, _)| !group.recoup_finished_per_coin[*i])
            .collect();
        debug!(group = %id, open = open.len(), "recouping coins");
        let results = join_all(open.into_iter().map(|(i, coin_pub)| self.recoup_coin(id, i, coin_pub))).await;
        self.finish_recoup(id, results)
    }

    async fn recoup_coin(&self, id: RecoupGroupId, coin_index: usize, coin_pub: EddsaPublicKey) -> Result<(), WalletError> {
        let coin = self
            .db
            .run_read_only(&[StoreName::Coins], |tx| tx.get::<CoinRecord>(&coin_pub))?
            .ok_or_else(|| WalletError::invariant(format!("coin {coin_pub} not found")))?;
        let req = self
            .crypto
            .create_recoup_request(CreateRecoupRequest {
                coin_priv: coin.coin_priv.clone(),
                coin_pub,
                denom_pub_hash: coin.denom_pub_hash,
                denom_sig: coin.denom_sig.clone(),
                blinding_key: coin.blinding_key,
                refreshed: matches!(coin.coin_source, CoinSource::Refresh { .. }),
            })
            .await?;
        let resp = self.exchange_call(self.exchange.recoup(&coin.exchange_base_url, &req)).await?;
        let now = Timestamp::now();

        match coin.coin_source {
            CoinSource::Withdraw { reserve_pub, .. } => {
                if resp.reserve_pub != Some(reserve_pub) {
                    return Err(WalletError::protocol_violation(format!(
                        "recoup of coin {coin_pub} credited an unexpected reserve"
                    )));
                }
                self.db.run_read_write(&[StoreName::RecoupGroups, StoreName::Reserves], |tx| {
                    let Some(mut g) = tx.get::<RecoupGroupRecord>(&id)? else {
                        return Err(WalletError::invariant(format!("recoup group {id} vanished")));
                    };
                    if g.recoup_finished_per_coin[coin_index] {
                        return Ok(());
                    }
                    g.recoup_finished_per_coin[coin_index] = true;
                    tx.put(&g)?;
                    if let Some(mut reserve) = tx.get::<ReserveRecord>(&reserve_pub)? {
                        reserve.status = ReserveStatus::QueryingStatus;
                        reserve.retry_info = Some(RetryInfo::initial(now));
                        reserve.last_error = None;
                        reserve.frozen = false;
                        tx.put(&reserve)?;
                    }
                    Ok(())
                })?;
                debug!(group = %id, coin = %coin_pub, reserve = %reserve_pub, "coin recouped to reserve");
            }
            CoinSource::Refresh { old_coin_pub } => {
                if resp.old_coin_pub != Some(old_coin_pub) {
                    return Err(WalletError::protocol_violation(format!(
                        "recoup of coin {coin_pub} credited an unexpected coin"
                    )));
                }
                self.db.run_read_write(&[StoreName::RecoupGroups, StoreName::Coins], |tx| {
                    let Some(mut g) = tx.get::<RecoupGroupRecord>(&id)? else {
                        return Err(WalletError::invariant(format!("recoup group {id} vanished")));
                    };
                    if g.recoup_finished_per_coin[coin_index] {
                        return Ok(());
                    }
                    let Some(mut old_coin) = tx.get::<CoinRecord>(&old_coin_pub)? else {
                        return Err(WalletError::invariant(format!("old coin {old_coin_pub} not found")));
                    };
                    if let Some(amount) = &g.old_amount_per_coin[coin_index] {
                        old_coin.current_amount = old_coin.current_amount.saturating_add(amount)?;
                    }
                    tx.put(&old_coin)?;
                    g.recoup_finished_per_coin[coin_index] = true;
                    if !g.schedule_refresh_coins.contains(&old_coin_pub) {
                        g.schedule_refresh_coins.push(old_coin_pub);
                    }
                    tx.put(&g)?;
                    Ok(())
                })?;
                debug!(group = %id, coin = %coin_pub, old_coin = %old_coin_pub, "coin recouped to old coin");
            }
        }
        Ok(())
    }

    fn finish_recoup(&self, id: RecoupGroupId, results: Vec<Result<(), WalletError>>) -> Result<TaskOutcome, WalletError> {
        let now = Timestamp::now();
        let scope = [StoreName::RecoupGroups, StoreName::Coins, StoreName::Denominations, StoreName::RefreshGroups];
        let finished: Option<Option<RefreshGroupId>> = self.db.run_read_write(&scope, |tx| {
            let Some(mut g) = tx.get::<RecoupGroupRecord>(&id)? else {
                return Err(WalletError::invariant(format!("recoup group {id} vanished")));
            };
            if g.timestamp_finished.is_some() {
                return Ok(Some(None));
            }
            if !g.recoup_finished_per_coin.iter().all(|f| *f) {
                return Ok(None);
            }
            g.timestamp_finished = Some(now);
            clear_retry(&mut g);
            let refresh = if g.schedule_refresh_coins.is_empty() {
                None
            } else {
                Some(create_refresh_group(tx, &g.schedule_refresh_coins, RefreshReason::Recoup, now)?)
            };
            tx.put(&g)?;
            Ok(Some(refresh))
        })?;

        match finished {
            Some(refresh_group) => {
                info!(group = %id, refresh_group = ?refresh_group, "recoup group finished");
                self.notifier.notify(WalletNotification::RecoupFinished { recoup_group_id: id });
                Ok(TaskOutcome::Finished)
            }
            None => Err(first_error(results).unwrap_or_else(|| {
                WalletError::Transient(ErrorDetails::new(ErrorCode::Unknown, "recoup group has unfinished coins"))
            })),
        }
    }
}
